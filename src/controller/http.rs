//! HTTP/WebSocket front end of the controller.
//!
//! One axum router: `/ws` upgrades browser clients into hub sessions, every
//! other GET serves static UI assets from the configured doc root. Session
//! writes go through a per-connection mpsc channel so the hub can publish
//! from any task.

use std::path::Path;
use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Context;
use anyhow::Result;
use axum::Router;
use axum::extract::State;
use axum::extract::WebSocketUpgrade;
use axum::extract::ws::Message;
use axum::extract::ws::WebSocket;
use axum::http::StatusCode;
use axum::http::Uri;
use axum::http::header;
use axum::response::IntoResponse;
use axum::response::Response;
use axum::routing::get;
use futures_util::SinkExt;
use futures_util::StreamExt;
use tracing::debug;
use tracing::info;
use tracing::warn;

use super::ControllerHub;

/// Serve the controller's HTTP surface until cancellation.
pub async fn serve(hub: Arc<ControllerHub>, host: &str, port: u16) -> Result<()> {
    let app = Router::new()
        .route("/ws", get(ws_handler))
        .fallback(get(static_handler))
        .with_state(hub.clone());

    let listener = tokio::net::TcpListener::bind((host, port))
        .await
        .with_context(|| format!("binding http server to {host}:{port}"))?;
    info!(host, port, "http server listening");

    let cancel = hub.cancel_token().clone();
    axum::serve(listener, app)
        .with_graceful_shutdown(async move { cancel.cancelled().await })
        .await
        .context("http server")
}

async fn ws_handler(ws: WebSocketUpgrade, State(hub): State<Arc<ControllerHub>>) -> impl IntoResponse {
    ws.on_upgrade(move |socket| handle_socket(hub, socket))
}

async fn handle_socket(hub: Arc<ControllerHub>, socket: WebSocket) {
    let (mut sink, mut stream) = socket.split();
    let (conn_id, mut outbound) = hub.sessions().register();
    info!(conn_id, "websocket client connected");

    let writer = tokio::spawn(async move {
        while let Some(message) = outbound.recv().await {
            if sink.send(Message::Text(message.into())).await.is_err() {
                break;
            }
        }
    });

    while let Some(result) = stream.next().await {
        match result {
            Ok(Message::Text(text)) => hub.process_client_message(conn_id, text.as_str()).await,
            Ok(Message::Close(_)) => break,
            Ok(_) => {}
            Err(e) => {
                warn!(conn_id, error = %e, "websocket read failed");
                break;
            }
        }
    }

    hub.sessions().unregister(conn_id);
    writer.abort();
    info!(conn_id, "websocket client disconnected");
}

async fn static_handler(State(hub): State<Arc<ControllerHub>>, uri: Uri) -> Response {
    let doc_root = hub.doc_root();
    match resolve_asset(doc_root, uri.path()) {
        Some(path) => match tokio::fs::read(&path).await {
            Ok(body) => {
                debug!(path = %path.display(), "asset served");
                ([(header::CONTENT_TYPE, content_type(&path))], body).into_response()
            }
            Err(_) => StatusCode::NOT_FOUND.into_response(),
        },
        None => StatusCode::NOT_FOUND.into_response(),
    }
}

/// Map a request path into the doc root, refusing traversal.
fn resolve_asset(doc_root: &Path, request_path: &str) -> Option<PathBuf> {
    let trimmed = request_path.trim_start_matches('/');
    let relative = if trimmed.is_empty() { "index.html" } else { trimmed };
    if relative.split('/').any(|part| part == ".." || part.is_empty()) {
        return None;
    }
    Some(doc_root.join(relative))
}

fn content_type(path: &Path) -> &'static str {
    match path.extension().and_then(|e| e.to_str()) {
        Some("html") => "text/html; charset=utf-8",
        Some("js") => "text/javascript",
        Some("css") => "text/css",
        Some("json") => "application/json",
        Some("png") => "image/png",
        Some("svg") => "image/svg+xml",
        Some("ico") => "image/x-icon",
        _ => "application/octet-stream",
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn asset_resolution() {
        let root = Path::new("/srv/webctl");
        assert_eq!(resolve_asset(root, "/"), Some(root.join("index.html")));
        assert_eq!(resolve_asset(root, "/app.js"), Some(root.join("app.js")));
        assert_eq!(resolve_asset(root, "/css/site.css"), Some(root.join("css/site.css")));
        assert_eq!(resolve_asset(root, "/../etc/passwd"), None);
        assert_eq!(resolve_asset(root, "/a//b"), None);
    }

    #[test]
    fn content_types() {
        assert_eq!(content_type(Path::new("index.html")), "text/html; charset=utf-8");
        assert_eq!(content_type(Path::new("app.js")), "text/javascript");
        assert_eq!(content_type(Path::new("data.bin")), "application/octet-stream");
    }
}
