use axum::{Router, http::StatusCode, response::IntoResponse, routing::get};
use tracing::info;

async fn readiness_probe() -> impl IntoResponse {
    StatusCode::NO_CONTENT
}

async fn liveness_probe() -> impl IntoResponse {
    StatusCode::NO_CONTENT
}

pub fn create_app() -> Router {
    Router::new()
        .route("/health/live", get(liveness_probe))
        .route("/health/ready", get(readiness_probe))
}

pub async fn serve(port: u16) -> anyhow::Result<()> {
    let addr = std::net::SocketAddr::from(([0, 0, 0, 0], port));
    info!("Starting webserver on {}", addr);
    let listener = tokio::net::TcpListener::bind(addr).await?;
    axum::serve(listener, create_app()).await?;
    Ok(())
}
