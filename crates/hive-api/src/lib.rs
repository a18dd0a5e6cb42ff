pub mod handlers;

use axum::routing::{get, post};
use axum::Router;
use tokio::net::TcpListener;
use tokio::sync::broadcast;
use tower_http::cors::{Any, CorsLayer};

pub use handlers::ApiState;

pub fn router(state: ApiState) -> Router {
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);

    let api_routes = Router::new()
        .route("/submit_task", post(handlers::handle_submit_task))
        .route("/status", get(handlers::handle_status))
        .route("/health", get(handlers::handle_health))
        .route("/nodes", get(handlers::handle_nodes))
        .route("/tasks", get(handlers::handle_tasks))
        .route("/task/{task_id}", get(handlers::handle_task))
        .with_state(state);

    Router::new().nest("/api", api_routes).layer(cors)
}

/// Serve the control API on an already-bound listener until shutdown.
pub async fn serve(
    state: ApiState,
    listener: TcpListener,
    mut shutdown: broadcast::Receiver<()>,
) -> anyhow::Result<()> {
    let addr = listener.local_addr()?;
    tracing::info!(%addr, "control API listening");
    axum::serve(listener, router(state))
        .with_graceful_shutdown(async move {
            let _ = shutdown.recv().await;
        })
        .await?;
    Ok(())
}
