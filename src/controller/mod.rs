//! The controller hub.
//!
//! A single process-wide object wires the aggregation loop, the expiry
//! listener, the client command table and the WebSocket session map
//! together. Handlers address sessions by connection id only; the HTTP layer
//! owns the sockets.

pub mod aggregator;
pub mod command;
pub mod expiry;
pub mod http;
pub mod hub;

use std::path::Path;
use std::sync::Arc;

use anyhow::Context;
use anyhow::Result;
use tokio_util::sync::CancellationToken;
use tracing::warn;

pub use aggregator::Aggregator;
pub use aggregator::SummaryTable;
pub use aggregator::collect_summary;
pub use command::ClientRequest;
pub use command::CommandHandler;
pub use command::RunHooks;
pub use expiry::ExpiryListener;
pub use expiry::handle_expired_key;
pub use hub::BROADCAST_CONN_ID;
pub use hub::SessionHub;

use crate::config::ControllerConfig;
use crate::config::parse_http_uri;
use crate::registry::Registry;

/// Process-wide controller state.
pub struct ControllerHub {
    config: ControllerConfig,
    registry: Arc<dyn Registry>,
    sessions: Arc<SessionHub>,
    commands: CommandHandler,
    cancel: CancellationToken,
}

impl ControllerHub {
    /// Build the hub and ask the registry for expiry notifications.
    pub async fn new(config: ControllerConfig, registry: Arc<dyn Registry>) -> Result<Arc<Self>> {
        if let Err(e) = registry.enable_expiry_events().await {
            warn!(error = %e, "could not enable keyspace expiry events");
        }
        let sessions = Arc::new(SessionHub::new());
        let cancel = CancellationToken::new();
        let commands = CommandHandler::new(
            registry.clone(),
            config.separator.clone(),
            sessions.clone(),
            RunHooks {
                pre_run: config.pre_run.clone(),
                post_run: config.post_run.clone(),
                pre_stop: config.pre_stop.clone(),
                post_stop: config.post_stop.clone(),
            },
            cancel.clone(),
        );
        Ok(Arc::new(Self {
            config,
            registry,
            sessions,
            commands,
            cancel,
        }))
    }

    pub fn sessions(&self) -> &Arc<SessionHub> {
        &self.sessions
    }

    pub fn doc_root(&self) -> &Path {
        &self.config.doc_root
    }

    pub fn cancel_token(&self) -> &CancellationToken {
        &self.cancel
    }

    /// Stop every hub task (aggregator, listener, HTTP server).
    pub fn shutdown(&self) {
        self.cancel.cancel();
    }

    /// Spawn the state-poll loop and the expiry listener.
    pub fn start_background_tasks(self: &Arc<Self>) {
        let aggregator = Aggregator::new(
            self.registry.clone(),
            self.config.separator.clone(),
            self.config.poll_interval,
            self.sessions.clone(),
            self.cancel.clone(),
        );
        tokio::spawn(aggregator.run());

        let listener = ExpiryListener::new(
            self.registry.clone(),
            self.config.separator.clone(),
            self.cancel.clone(),
        );
        tokio::spawn(listener.run());
    }

    /// Entry point for messages arriving on a WebSocket session.
    pub async fn process_client_message(&self, conn_id: u64, raw: &str) {
        self.commands.process(conn_id, raw).await;
    }

    /// Serve HTTP/WebSocket until shutdown.
    pub async fn serve_http(self: &Arc<Self>) -> Result<()> {
        let (host, port) =
            parse_http_uri(&self.config.http_uri).with_context(|| format!("bad http uri: {}", self.config.http_uri))?;
        http::serve(self.clone(), &host, port).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::registry::MemoryRegistry;

    #[tokio::test]
    async fn hub_processes_client_messages_end_to_end() {
        let registry: Arc<dyn Registry> = MemoryRegistry::new();
        registry.set("run_info:run_number", "7").await.unwrap();
        let hub = ControllerHub::new(ControllerConfig::default(), registry).await.unwrap();
        let (conn, mut rx) = hub.sessions().register();
        hub.process_client_message(conn, r#"{"command":"redis-get","value":"run_number"}"#)
            .await;
        let reply: serde_json::Value = serde_json::from_str(&rx.recv().await.unwrap()).unwrap();
        assert_eq!(reply["type"], "set run_number");
        assert_eq!(reply["value"], "7");
        hub.shutdown();
    }
}
