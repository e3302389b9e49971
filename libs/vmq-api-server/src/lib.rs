mod codec;
mod http;
mod ws;

use std::sync::Arc;

use axum::Router;
use axum::routing::get;
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;

use vmq_api::SessionCodec;
use vmq_engine::Broker;

pub use codec::JsonCodec;

#[derive(Clone)]
struct AppState {
    broker: Arc<Broker>,
    codec: Arc<dyn SessionCodec>,
    shutdown: CancellationToken,
}

/// WebSocket sessions on `/ws` plus read-only REST inspection.
pub fn router(broker: Arc<Broker>, shutdown: CancellationToken) -> Router {
    let state = AppState {
        broker,
        codec: Arc::new(JsonCodec),
        shutdown,
    };

    Router::new()
        .route("/api/topics", get(http::handle_list_topics))
        .route("/api/groups", get(http::handle_list_groups))
        .route("/api/groups/{name}", get(http::handle_describe_group))
        .route("/ws", get(ws::handle_ws))
        .with_state(state)
}

/// Bind `listen` and serve until `shutdown` is cancelled.
pub async fn run(listen: &str, broker: Arc<Broker>, shutdown: CancellationToken) -> Result<(), String> {
    let listener = TcpListener::bind(listen)
        .await
        .map_err(|e| format!("bind api {listen}: {e}"))?;
    serve(listener, broker, shutdown).await
}

/// Serve on an already bound listener.
pub async fn serve(listener: TcpListener, broker: Arc<Broker>, shutdown: CancellationToken) -> Result<(), String> {
    if let Ok(addr) = listener.local_addr() {
        tracing::info!(%addr, "api listening");
    }
    let app = router(broker, shutdown.clone());
    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown.cancelled_owned())
        .await
        .map_err(|e| format!("axum serve: {e}"))?;
    Ok(())
}
