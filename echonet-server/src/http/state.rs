//! Shared `axum` state — `Arc`-wrapped handles to the core's Store,
//! Registry, State Manager, and Router, injected into every handler.

use std::sync::Arc;

use echonet_core::{Registry, Router, StateManager, Store, TranscriberHandle};

use crate::config::Config;

#[derive(Clone)]
pub struct AppState {
    pub store: Arc<Store>,
    pub registry: Arc<Registry>,
    pub state_manager: Arc<StateManager>,
    pub router: Arc<Router>,
    pub transcriber: TranscriberHandle,
    pub config: Arc<Config>,
}
