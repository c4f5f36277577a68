use axum::{
    routing::{get, post, put},
    Router,
};
use tower_http::trace::TraceLayer;

use crate::shutdown::Shutdown;

use super::handlers::{self, AppState};

pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/api/status", get(handlers::status))
        .route("/api/observations", post(handlers::insert_observation))
        .route("/api/credential", put(handlers::set_credential))
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

/// Serves the host-facing API until `shutdown` fires.
pub async fn run_server(
    bind_addr: &str,
    state: AppState,
    mut shutdown: Shutdown,
) -> std::io::Result<()> {
    let app = router(state);

    log::info!("Starting server on {}", bind_addr);

    let listener = tokio::net::TcpListener::bind(bind_addr).await?;
    axum::serve(listener, app)
        .with_graceful_shutdown(async move { shutdown.triggered().await })
        .await
}
