//! The shared registry abstraction.
//!
//! Every coordination primitive in this crate talks to one logical registry:
//! a key/value store with string, hash and list values, per-key TTL with
//! expiry notifications, atomic increment, glob scans and pub/sub channels.
//! The [`Registry`] trait captures exactly the operations the coordination
//! layer consumes; backends live in [`memory`] (deterministic, in-process)
//! and [`resp`] (TCP wire protocol).
//!
//! Consume loops are modelled explicitly: [`Subscription::consume`] returns
//! a message, a timeout (retry) or an error (fatal to the owning loop).

pub mod memory;
pub mod resp;

use std::collections::HashMap;
use std::time::Duration;

use async_trait::async_trait;
use snafu::Snafu;

pub use memory::MemoryRegistry;
pub use resp::RespRegistry;

/// Errors surfaced by registry backends.
#[derive(Debug, Snafu)]
#[snafu(visibility(pub(crate)))]
pub enum RegistryError {
    /// The backend could not be reached or the connection dropped.
    #[snafu(display("registry i/o error on {op}: {source}"))]
    Io {
        op: &'static str,
        source: std::io::Error,
    },

    /// The request timed out; callers retry on the next iteration.
    #[snafu(display("registry timeout on {op}"))]
    Timeout { op: &'static str },

    /// The backend replied with something the client cannot interpret.
    #[snafu(display("registry protocol error on {op}: {detail}"))]
    Protocol { op: &'static str, detail: String },

    /// A value had the wrong type for the requested operation.
    #[snafu(display("wrong value type at {key}: expected {expected}"))]
    WrongType { key: String, expected: &'static str },

    /// A stored value could not be parsed as the expected scalar.
    #[snafu(display("unparsable value at {key}: {detail}"))]
    BadValue { key: String, detail: String },
}

impl RegistryError {
    /// Whether the owning periodic loop should retry on its next tick
    /// instead of shutting down.
    pub fn is_transient(&self) -> bool {
        matches!(self, Self::Timeout { .. } | Self::Io { .. })
    }
}

pub type Result<T, E = RegistryError> = std::result::Result<T, E>;

/// A command inside an atomic pipeline.
///
/// Pipelines group the liveness-refresh writes so fellow participants see
/// either the whole refresh or none of it.
#[derive(Debug, Clone)]
pub enum PipelineCommand {
    SetEx {
        key: String,
        value: String,
        ttl: Duration,
    },
    HSet {
        key: String,
        fields: Vec<(String, String)>,
    },
    Expire {
        key: String,
        ttl: Duration,
    },
    RPush {
        key: String,
        values: Vec<String>,
    },
    Del {
        keys: Vec<String>,
    },
    HDel {
        key: String,
        fields: Vec<String>,
    },
}

/// One step of a pub/sub consume loop.
#[derive(Debug)]
pub enum Consumed {
    /// A message arrived on a subscribed channel.
    Message { channel: String, payload: String },
    /// Nothing arrived within the backend's read timeout; loop again.
    Timeout,
}

/// A live pub/sub subscription.
#[async_trait]
pub trait Subscription: Send {
    async fn consume(&mut self) -> Result<Consumed>;
}

/// The registry operations consumed by the coordination layer.
#[async_trait]
pub trait Registry: Send + Sync {
    async fn get(&self, key: &str) -> Result<Option<String>>;

    async fn set(&self, key: &str, value: &str) -> Result<()>;

    /// SET with TTL.
    async fn set_ex(&self, key: &str, value: &str, ttl: Duration) -> Result<()>;

    /// SET if absent, with TTL. Returns whether the key was set. This is the
    /// lock-acquisition primitive.
    async fn set_nx_ex(&self, key: &str, value: &str, ttl: Duration) -> Result<bool>;

    /// Delete keys; returns how many existed.
    async fn del(&self, keys: &[String]) -> Result<u64>;

    /// Delete `key` only if its current value equals `expected`. Returns
    /// whether a deletion happened. This is the owner-checked lock release.
    async fn del_eq(&self, key: &str, expected: &str) -> Result<bool>;

    /// Refresh a key's TTL; returns false when the key does not exist.
    async fn expire(&self, key: &str, ttl: Duration) -> Result<bool>;

    /// Atomic increment of an integer value (missing key counts as 0).
    async fn incr(&self, key: &str) -> Result<i64>;

    async fn mget(&self, keys: &[String]) -> Result<Vec<Option<String>>>;

    /// All live keys matching a glob pattern, sorted.
    async fn scan(&self, pattern: &str) -> Result<Vec<String>>;

    async fn hset(&self, key: &str, fields: &[(String, String)]) -> Result<()>;

    async fn hget(&self, key: &str, field: &str) -> Result<Option<String>>;

    async fn hgetall(&self, key: &str) -> Result<HashMap<String, String>>;

    /// Set a hash field only if absent. Returns whether the field was set.
    async fn hsetnx(&self, key: &str, field: &str, value: &str) -> Result<bool>;

    async fn hdel(&self, key: &str, fields: &[String]) -> Result<u64>;

    async fn rpush(&self, key: &str, values: &[String]) -> Result<u64>;

    /// Full contents of a list (LRANGE 0 -1).
    async fn lrange(&self, key: &str) -> Result<Vec<String>>;

    /// Publish a payload; returns the number of receivers.
    async fn publish(&self, channel: &str, payload: &str) -> Result<u64>;

    async fn subscribe(&self, channels: &[String]) -> Result<Box<dyn Subscription>>;

    /// Apply a batch of commands atomically with respect to other clients.
    async fn pipeline(&self, commands: Vec<PipelineCommand>) -> Result<()>;

    /// Ask the backend to emit key-expiry notifications.
    async fn enable_expiry_events(&self) -> Result<()>;

    /// The pub/sub channel carrying expired-key notifications.
    fn expired_event_channel(&self) -> String;
}

/// Connect to the registry named by a URI.
///
/// `mem://` yields a fresh in-memory backend (single-process setups and
/// tests); everything else is treated as a RESP server address.
pub async fn connect(uri: &str) -> Result<std::sync::Arc<dyn Registry>> {
    if uri.starts_with("mem://") {
        return Ok(MemoryRegistry::new());
    }
    Ok(std::sync::Arc::new(RespRegistry::connect(uri).await?))
}

/// Extract the database number from a registry URI of the form
/// `scheme://host:port/db?` (missing or empty db means 0).
pub fn db_from_uri(uri: &str) -> u32 {
    let Some(rest) = uri.splitn(2, "://").nth(1) else {
        return 0;
    };
    match rest.split('/').nth(1) {
        Some(db) if !db.is_empty() => db.parse().unwrap_or(0),
        _ => 0,
    }
}

/// Format the keyspace expiry-event channel for a database number.
pub fn expired_channel_for_db(db: u32) -> String {
    format!("__keyevent@{db}__:expired")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn db_number_extraction() {
        assert_eq!(db_from_uri("tcp://127.0.0.1:6379/0"), 0);
        assert_eq!(db_from_uri("tcp://127.0.0.1:6379/3"), 3);
        assert_eq!(db_from_uri("tcp://127.0.0.1:6379"), 0);
        assert_eq!(db_from_uri("tcp://127.0.0.1:6379/"), 0);
        assert_eq!(db_from_uri("garbage"), 0);
    }

    #[test]
    fn expiry_channel_format() {
        assert_eq!(expired_channel_for_db(0), "__keyevent@0__:expired");
        assert_eq!(expired_channel_for_db(5), "__keyevent@5__:expired");
    }

    #[test]
    fn transient_classification() {
        assert!(RegistryError::Timeout { op: "get" }.is_transient());
        assert!(!RegistryError::Protocol {
            op: "get",
            detail: "bad reply".into()
        }
        .is_transient());
    }
}
