//! Minimal HTTP surface: liveness and metrics. The beacon REST API proper
//! is a separate concern and not part of this service.

use std::net::SocketAddr;
use std::sync::Arc;
use std::thread;

use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::get,
    Router,
};
use prometheus::{Encoder, Registry, TextEncoder};
use tracing::info;

pub struct ServerContext {
    pub registry: Registry,
}

pub fn launch(context: Arc<ServerContext>, addr: SocketAddr) -> thread::JoinHandle<()> {
    thread::Builder::new()
        .name("http-server".into())
        .spawn(move || {
            let rt = tokio::runtime::Runtime::new().expect("http runtime");
            rt.block_on(run_server(context, addr));
        })
        .expect("spawn http server thread")
}

async fn run_server(context: Arc<ServerContext>, addr: SocketAddr) {
    let app = Router::new()
        .route("/health", get(health))
        .route("/metrics", get(metrics_handler))
        .with_state(context);

    let listener = tokio::net::TcpListener::bind(addr)
        .await
        .expect("bind http listener");
    info!("http server listening on {addr}");
    axum::serve(listener, app).await.expect("http server");
}

async fn health() -> &'static str {
    "ok"
}

async fn metrics_handler(
    state: axum::extract::State<Arc<ServerContext>>,
) -> impl IntoResponse {
    let encoder = TextEncoder::new();
    let mut buffer = Vec::new();
    match encoder.encode(&state.registry.gather(), &mut buffer) {
        Ok(()) => Response::builder()
            .header("Content-Type", encoder.format_type())
            .body(buffer.into())
            .map(|response| (StatusCode::OK, response))
            .unwrap_or_else(|_| {
                (
                    StatusCode::INTERNAL_SERVER_ERROR,
                    "failed to build metrics response".into_response(),
                )
            }),
        Err(_) => (
            StatusCode::INTERNAL_SERVER_ERROR,
            "failed to collect metrics".into_response(),
        ),
    }
}
