pub mod handlers;

use std::future::Future;
use std::net::SocketAddr;

use axum::routing::get;
use axum::Router;
use tokio::net::TcpListener;
use tower_http::trace::TraceLayer;

pub use handlers::ApiState;

pub fn router(state: ApiState) -> Router {
    Router::new()
        .route("/nix-cache-info", get(handlers::handle_cache_info))
        .route("/{file}", get(handlers::handle_remote_narinfo))
        .route("/local/{file}", get(handlers::handle_local_narinfo))
        .route("/local/nar/{file}", get(handlers::handle_local_nar))
        .route("/v2/remote/{*path}", get(handlers::handle_remote_nar))
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

/// Serve the binary cache on `listener` until `shutdown` resolves.
pub async fn serve(
    state: ApiState,
    listener: TcpListener,
    shutdown: impl Future<Output = ()> + Send + 'static,
) -> anyhow::Result<()> {
    let addr = listener.local_addr()?;
    tracing::info!(%addr, "binary cache listening");
    axum::serve(
        listener,
        router(state).into_make_service_with_connect_info::<SocketAddr>(),
    )
    .with_graceful_shutdown(shutdown)
    .await?;
    Ok(())
}
