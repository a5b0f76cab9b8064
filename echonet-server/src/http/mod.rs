//! HTTP surface assembly: one `axum::Router` per route group, merged and
//! wrapped with the auth/cors/trace middleware stack applied once at the
//! top rather than per-route.

pub mod auth;
pub mod handlers;
pub mod state;

use axum::middleware;
use axum::routing::{get, post, put};
use axum::Router;
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;

use self::state::AppState;

/// Routes that any holder of a valid API key may call.
fn reader_routes() -> Router<AppState> {
    Router::new()
        .route("/targets", get(handlers::list_targets))
        .route("/state", get(handlers::get_state))
        .route("/state/history", get(handlers::get_state_history))
        .route("/text", post(handlers::post_text))
        .route("/audio/devices", get(handlers::list_audio_devices))
        .route("/config", get(handlers::get_config))
        .route("/test/transcribe", post(handlers::test_transcribe))
}

/// Mutating routes that additionally require the admin key.
fn admin_routes(state: AppState) -> Router<AppState> {
    Router::new()
        .route("/register", post(handlers::register_target))
        .route("/targets/:name", axum::routing::delete(handlers::delete_target))
        .route("/state", put(handlers::put_state))
        .route("/audio/device", put(handlers::put_audio_device))
        .route("/config/:key", put(handlers::put_config_key))
        .layer(middleware::from_fn_with_state(state, auth::require_admin_key))
}

pub fn build_router(state: AppState) -> Router {
    // /healthz stays outside the API-key layer: an orchestrator probing
    // liveness shouldn't need a credential to find out the process is up.
    let health = Router::new().route("/healthz", get(handlers::healthz));

    let protected = reader_routes()
        .merge(admin_routes(state.clone()))
        .layer(middleware::from_fn_with_state(state.clone(), auth::require_api_key));

    health
        .merge(protected)
        .layer(CorsLayer::permissive())
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use axum::body::Body;
    use axum::http::{Request, StatusCode};
    use echonet_core::inference::stub::StubTranscriber;
    use echonet_core::{Registry, Router, StateManager, Store, TranscriberHandle};
    use tower::ServiceExt;

    use super::*;
    use crate::config::Config;

    fn test_state(api_key: Option<&str>, admin_key: Option<&str>) -> AppState {
        let dir = tempfile::tempdir().unwrap();
        let store = Arc::new(Store::open(&dir.path().join("echonet.db")).unwrap());
        let registry = Arc::new(Registry::new(Arc::clone(&store)).unwrap());
        let state_manager = Arc::new(StateManager::new(Arc::clone(&store)));
        state_manager.ensure_initialized(echonet_core::ListenMode::Trigger).unwrap();
        let router = Arc::new(Router::new(Arc::clone(&registry), vec![], 25));
        let transcriber = TranscriberHandle::new(StubTranscriber::new());

        let mut config = Config::from_env();
        config.api_key = api_key.map(str::to_string);
        config.admin_key = admin_key.map(str::to_string);

        // Leak the tempdir's guard onto the state so the DB file outlives the
        // request — fine for a short-lived test process, not a pattern to
        // carry into production code.
        std::mem::forget(dir);

        AppState {
            store,
            registry,
            state_manager,
            router,
            transcriber,
            config: Arc::new(config),
        }
    }

    #[tokio::test]
    async fn healthz_is_reachable_without_any_key() {
        let app = build_router(test_state(Some("secret"), Some("admin-secret")));
        let response = app
            .oneshot(Request::builder().uri("/healthz").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
    }

    #[tokio::test]
    async fn reader_route_without_api_key_is_rejected() {
        let app = build_router(test_state(Some("secret"), None));
        let response = app
            .oneshot(Request::builder().uri("/targets").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
    }

    #[tokio::test]
    async fn reader_route_with_correct_api_key_succeeds() {
        let app = build_router(test_state(Some("secret"), None));
        let response = app
            .oneshot(
                Request::builder()
                    .uri("/targets")
                    .header("x-echonet-api-key", "secret")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
    }

    #[tokio::test]
    async fn admin_route_with_api_key_but_no_admin_key_is_forbidden() {
        let app = build_router(test_state(Some("secret"), Some("admin-secret")));
        let response = app
            .oneshot(
                Request::builder()
                    .method("POST")
                    .uri("/register")
                    .header("x-echonet-api-key", "secret")
                    .header("content-type", "application/json")
                    .body(Body::from(r#"{"name":"t","base_url":"http://x","phrases":["hi"]}"#))
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::FORBIDDEN);
    }

    #[tokio::test]
    async fn no_configured_keys_means_auth_is_a_no_op() {
        let app = build_router(test_state(None, None));
        let response = app
            .oneshot(Request::builder().uri("/targets").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
    }
}
