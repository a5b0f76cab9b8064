//! Audio device enumeration.

use serde::{Deserialize, Serialize};

/// Metadata about an audio input device, addressable by `index` per the
/// capture contract (`list_devices`, `record_until_silence(device_index, ...)`).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AudioDevice {
    /// Stable position within the list returned by `list_devices()`. This is
    /// the value callers pass back as `device_index`.
    pub index: usize,
    /// Human-readable device name reported by the OS.
    pub name: String,
    /// Channel count reported by the device's default input config.
    pub channels: u16,
    /// Sample rate reported by the device's default input config (Hz).
    pub sample_rate: u32,
    /// Whether this is the system default input device.
    pub is_default: bool,
    /// Heuristic flag for devices that likely capture system/output audio.
    pub is_loopback_like: bool,
    /// Heuristic recommendation for best speech microphone input.
    pub is_recommended: bool,
}

const LOOPBACK_KEYWORDS: &[&str] = &[
    "stereo mix",
    "wave out",
    "what u hear",
    "what you hear",
    "loopback",
    "virtual output",
    "monitor of",
    "mixage stereo",
    "mezcla estereo",
    "mix stereo",
    "speakers (",
    "headphones (",
];

const MIC_POSITIVE_KEYWORDS: &[&str] = &[
    "microphone",
    "mic",
    "array",
    "headset",
    "headphone mic",
    "input",
    "line in",
    "usb",
    "webcam",
    "yeti",
    "podcast",
];

/// Best-effort heuristic for Windows-style loopback/system-output capture devices.
pub fn is_loopback_like_name(name: &str) -> bool {
    let lowered = name.trim().to_ascii_lowercase();
    LOOPBACK_KEYWORDS.iter().any(|k| lowered.contains(k))
}

/// Score a device name for likely speech microphone quality/intent.
///
/// Higher is better. Non-loopback devices should be preferred.
pub fn mic_preference_score(name: &str) -> i32 {
    let lowered = name.trim().to_ascii_lowercase();
    let mut score = 0;
    if !is_loopback_like_name(&lowered) {
        score += 8;
    } else {
        score -= 16;
    }
    if MIC_POSITIVE_KEYWORDS.iter().any(|k| lowered.contains(k)) {
        score += 6;
    }
    if lowered.contains("default") {
        score += 1;
    }
    score
}

/// List all available audio input devices on the system, with stable indices.
///
/// Returns an empty `Vec` if cpal is not available or no devices exist.
/// `index` reflects position in this (sorted) list — `open_by_index` in
/// `audio::mod` re-derives the same order to resolve an index back to a
/// concrete `cpal::Device`.
#[cfg(feature = "audio-cpal")]
pub fn list_input_devices() -> Vec<AudioDevice> {
    use cpal::traits::{DeviceTrait, HostTrait};

    let host = cpal::default_host();
    let default_name = host.default_input_device().and_then(|d| d.name().ok());

    let mut list = match host.input_devices() {
        Ok(devices) => devices
            .enumerate()
            .map(|(idx, device)| {
                let name = device
                    .name()
                    .unwrap_or_else(|_| format!("Input Device {}", idx + 1));
                let is_default = default_name.as_deref() == Some(name.as_str());
                let is_loopback_like = is_loopback_like_name(&name);
                let (channels, sample_rate) = device
                    .default_input_config()
                    .map(|cfg| (cfg.channels(), cfg.sample_rate().0))
                    .unwrap_or((1, 16000));
                AudioDevice {
                    index: 0, // assigned after sort below
                    name,
                    channels,
                    sample_rate,
                    is_default,
                    is_loopback_like,
                    is_recommended: false,
                }
            })
            .collect::<Vec<_>>(),
        Err(e) => {
            tracing::warn!("failed to enumerate input devices: {e}");
            Vec::new()
        }
    };

    if list.is_empty() {
        if let Some(default) = host.default_input_device() {
            let name = default
                .name()
                .unwrap_or_else(|_| "Default Input Device".to_string());
            let is_loopback_like = is_loopback_like_name(&name);
            let (channels, sample_rate) = default
                .default_input_config()
                .map(|cfg| (cfg.channels(), cfg.sample_rate().0))
                .unwrap_or((1, 16000));
            list.push(AudioDevice {
                index: 0,
                name,
                channels,
                sample_rate,
                is_default: true,
                is_loopback_like,
                is_recommended: !is_loopback_like,
            });
        }
        return list;
    }

    if let Some((idx, _)) = list
        .iter()
        .enumerate()
        .max_by_key(|(_, d)| mic_preference_score(&d.name) + if d.is_default { 2 } else { 0 })
    {
        if let Some(best) = list.get_mut(idx) {
            best.is_recommended = true;
        }
    }

    list.sort_by_key(|d| {
        (
            !d.is_recommended,
            d.is_loopback_like,
            !d.is_default,
            d.name.to_ascii_lowercase(),
        )
    });
    for (idx, device) in list.iter_mut().enumerate() {
        device.index = idx;
    }
    list
}

#[cfg(not(feature = "audio-cpal"))]
pub fn list_input_devices() -> Vec<AudioDevice> {
    vec![]
}

/// The system default input device, if any.
pub fn default_device() -> Option<AudioDevice> {
    list_input_devices().into_iter().find(|d| d.is_default)
}

#[cfg(test)]
mod tests {
    use super::{is_loopback_like_name, mic_preference_score};

    #[test]
    fn detects_common_loopback_names() {
        assert!(is_loopback_like_name("Stereo Mix (Realtek Audio)"));
        assert!(is_loopback_like_name("What U Hear (Sound Blaster)"));
        assert!(is_loopback_like_name("Speakers (High Definition Audio Device)"));
    }

    #[test]
    fn scores_mic_higher_than_loopback() {
        let mic = mic_preference_score("Microphone Array (USB PnP Audio Device)");
        let loopback = mic_preference_score("Stereo Mix (Realtek Audio)");
        assert!(mic > loopback);
    }
}
