//! Reaction to presence-key expirations.
//!
//! The hub subscribes to the registry's keyspace expiry channel; whenever an
//! instance's presence key expires, its slot in the service-instance-index
//! hash is deleted so a new worker can claim the index immediately. Each
//! expiry spawns a short-lived handler task so a slow handler cannot stall
//! the subscriber. The handler is idempotent: deleting an absent field is a
//! no-op.

use std::sync::Arc;

use tokio_util::sync::CancellationToken;
use tracing::debug;
use tracing::error;
use tracing::info;
use tracing::warn;

use crate::constants::PRESENCE_PREFIX;
use crate::constants::SERVICE_INSTANCE_INDEX_PREFIX;
use crate::constants::STATE_CHANNEL;
use crate::constants::TOP_PREFIX;
use crate::keyspace::InstanceKey;
use crate::keyspace::join;
use crate::registry::Consumed;
use crate::registry::Registry;

/// Release the index slot named by an expired presence key.
///
/// Keys that do not end in the presence suffix are ignored.
pub async fn handle_expired_key(registry: &Arc<dyn Registry>, separator: &str, key: &str) {
    let suffix = format!("{separator}{PRESENCE_PREFIX}");
    if !key.ends_with(&suffix) {
        return;
    }
    let Some(parts) = InstanceKey::parse(key, separator) else {
        warn!(key, "unparsable presence key");
        return;
    };
    let index = parts.instance_index().to_string();
    let index_key = join(&[TOP_PREFIX, SERVICE_INSTANCE_INDEX_PREFIX, &parts.service], separator);
    match registry.hdel(&index_key, &[index.clone()]).await {
        Ok(_) => warn!(key = %index_key, field = %index, "released expired instance index"),
        Err(e) => error!(key = %index_key, field = %index, error = %e, "index release failed"),
    }
}

/// The hub's pub/sub listener: expiry events plus the optional device state
/// channel.
pub struct ExpiryListener {
    registry: Arc<dyn Registry>,
    separator: String,
    cancel: CancellationToken,
}

impl ExpiryListener {
    pub fn new(registry: Arc<dyn Registry>, separator: impl Into<String>, cancel: CancellationToken) -> Self {
        Self {
            registry,
            separator: separator.into(),
            cancel,
        }
    }

    pub async fn run(self) {
        let expired_channel = self.registry.expired_event_channel();
        let channels = vec![expired_channel.clone(), STATE_CHANNEL.to_string()];
        let mut subscription = match self.registry.subscribe(&channels).await {
            Ok(s) => s,
            Err(e) => {
                error!(error = %e, "expiry subscription failed");
                return;
            }
        };
        info!(channel = %expired_channel, "subscribed to key expirations");

        while !self.cancel.is_cancelled() {
            match subscription.consume().await {
                Ok(Consumed::Timeout) => continue,
                Ok(Consumed::Message { channel, payload }) => {
                    if channel == expired_channel {
                        debug!(key = %payload, "key expired");
                        let registry = self.registry.clone();
                        let separator = self.separator.clone();
                        tokio::spawn(async move {
                            handle_expired_key(&registry, &separator, &payload).await;
                        });
                    } else if channel == STATE_CHANNEL {
                        // optional device state broadcasts; validate and drop
                        match serde_json::from_str::<serde_json::Value>(&payload) {
                            Ok(v) if v.get("value").is_some() => {}
                            _ => error!(payload = %payload, "state message missing a value"),
                        }
                    }
                }
                Err(e) => {
                    error!(error = %e, "expiry consume failed");
                    break;
                }
            }
        }
        debug!("expiry listener stopped");
    }
}
