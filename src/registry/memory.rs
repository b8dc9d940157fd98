//! Deterministic in-memory registry backend.
//!
//! Mirrors the wire backend's observable behavior without network I/O: TTL
//! deadlines, expiry notifications on the keyspace event channel, glob scans
//! and pub/sub fan-out. Used by every test and by `mem://` URIs when the
//! whole deployment runs inside one process.
//!
//! Expired entries are treated as absent by all reads; a sweeper task
//! physically removes them and publishes each removed key on
//! `__keyevent@0__:expired`, so expiry-driven garbage collection behaves the
//! same as against a real server.

use std::collections::HashMap;
use std::sync::Arc;
use std::sync::Weak;
use std::time::Duration;
use std::time::Instant;

use async_trait::async_trait;
use parking_lot::Mutex;
use tokio::sync::broadcast;

use super::Consumed;
use super::PipelineCommand;
use super::Registry;
use super::RegistryError;
use super::Result;
use super::Subscription;
use super::expired_channel_for_db;
use crate::keyspace::glob_match;

/// Sweep cadence for expired entries.
const SWEEP_INTERVAL: Duration = Duration::from_millis(25);
/// Read timeout surfaced as `Consumed::Timeout` so consume loops can check
/// their cancellation flags.
const CONSUME_TIMEOUT: Duration = Duration::from_millis(100);
/// Pub/sub fan-out buffer per backend.
const PUBSUB_CAPACITY: usize = 1024;

#[derive(Debug, Clone)]
enum Value {
    Str(String),
    Hash(HashMap<String, String>),
    List(Vec<String>),
}

#[derive(Debug, Clone)]
struct Entry {
    value: Value,
    deadline: Option<Instant>,
}

impl Entry {
    fn live(&self, now: Instant) -> bool {
        self.deadline.is_none_or(|d| d > now)
    }
}

/// In-memory implementation of [`Registry`].
pub struct MemoryRegistry {
    entries: Mutex<HashMap<String, Entry>>,
    pubsub: broadcast::Sender<(String, String)>,
}

impl MemoryRegistry {
    /// Create a backend and start its expiry sweeper.
    ///
    /// Must be called from within a tokio runtime.
    pub fn new() -> Arc<Self> {
        let (pubsub, _) = broadcast::channel(PUBSUB_CAPACITY);
        let registry = Arc::new(Self {
            entries: Mutex::new(HashMap::new()),
            pubsub,
        });
        let weak: Weak<Self> = Arc::downgrade(&registry);
        tokio::spawn(async move {
            let mut tick = tokio::time::interval(SWEEP_INTERVAL);
            loop {
                tick.tick().await;
                let Some(registry) = weak.upgrade() else {
                    break;
                };
                registry.sweep();
            }
        });
        registry
    }

    fn sweep(&self) {
        let now = Instant::now();
        let expired: Vec<String> = {
            let mut entries = self.entries.lock();
            let keys: Vec<String> = entries
                .iter()
                .filter(|(_, e)| !e.live(now))
                .map(|(k, _)| k.clone())
                .collect();
            for k in &keys {
                entries.remove(k);
            }
            keys
        };
        let channel = self.expired_event_channel();
        for key in expired {
            let _ = self.pubsub.send((channel.clone(), key));
        }
    }

    /// Run a closure over the live entry for `key`, treating expired entries
    /// as absent.
    fn with_live<T>(&self, key: &str, f: impl FnOnce(Option<&Entry>) -> T) -> T {
        let entries = self.entries.lock();
        let now = Instant::now();
        f(entries.get(key).filter(|e| e.live(now)))
    }

    fn apply(entries: &mut HashMap<String, Entry>, command: PipelineCommand) {
        let now = Instant::now();
        match command {
            PipelineCommand::SetEx { key, value, ttl } => {
                entries.insert(
                    key,
                    Entry {
                        value: Value::Str(value),
                        deadline: Some(now + ttl),
                    },
                );
            }
            PipelineCommand::HSet { key, fields } => {
                let entry = entries.entry(key).or_insert_with(|| Entry {
                    value: Value::Hash(HashMap::new()),
                    deadline: None,
                });
                if !entry.live(now) {
                    entry.value = Value::Hash(HashMap::new());
                    entry.deadline = None;
                }
                if let Value::Hash(h) = &mut entry.value {
                    h.extend(fields);
                }
            }
            PipelineCommand::Expire { key, ttl } => {
                if let Some(entry) = entries.get_mut(&key) {
                    if entry.live(now) {
                        entry.deadline = Some(now + ttl);
                    }
                }
            }
            PipelineCommand::RPush { key, values } => {
                let entry = entries.entry(key).or_insert_with(|| Entry {
                    value: Value::List(Vec::new()),
                    deadline: None,
                });
                if !entry.live(now) {
                    entry.value = Value::List(Vec::new());
                    entry.deadline = None;
                }
                if let Value::List(l) = &mut entry.value {
                    l.extend(values);
                }
            }
            PipelineCommand::Del { keys } => {
                for k in keys {
                    entries.remove(&k);
                }
            }
            PipelineCommand::HDel { key, fields } => {
                let mut emptied = false;
                if let Some(Entry {
                    value: Value::Hash(h),
                    ..
                }) = entries.get_mut(&key)
                {
                    for f in &fields {
                        h.remove(f);
                    }
                    emptied = h.is_empty();
                }
                if emptied {
                    entries.remove(&key);
                }
            }
        }
    }
}

#[async_trait]
impl Registry for MemoryRegistry {
    async fn get(&self, key: &str) -> Result<Option<String>> {
        self.with_live(key, |e| match e {
            Some(Entry {
                value: Value::Str(s),
                ..
            }) => Ok(Some(s.clone())),
            Some(_) => Err(RegistryError::WrongType {
                key: key.to_string(),
                expected: "string",
            }),
            None => Ok(None),
        })
    }

    async fn set(&self, key: &str, value: &str) -> Result<()> {
        self.entries.lock().insert(
            key.to_string(),
            Entry {
                value: Value::Str(value.to_string()),
                deadline: None,
            },
        );
        Ok(())
    }

    async fn set_ex(&self, key: &str, value: &str, ttl: Duration) -> Result<()> {
        self.entries.lock().insert(
            key.to_string(),
            Entry {
                value: Value::Str(value.to_string()),
                deadline: Some(Instant::now() + ttl),
            },
        );
        Ok(())
    }

    async fn set_nx_ex(&self, key: &str, value: &str, ttl: Duration) -> Result<bool> {
        let mut entries = self.entries.lock();
        let now = Instant::now();
        if entries.get(key).is_some_and(|e| e.live(now)) {
            return Ok(false);
        }
        entries.insert(
            key.to_string(),
            Entry {
                value: Value::Str(value.to_string()),
                deadline: Some(now + ttl),
            },
        );
        Ok(true)
    }

    async fn del(&self, keys: &[String]) -> Result<u64> {
        let mut entries = self.entries.lock();
        let mut n = 0;
        for k in keys {
            if entries.remove(k).is_some() {
                n += 1;
            }
        }
        Ok(n)
    }

    async fn del_eq(&self, key: &str, expected: &str) -> Result<bool> {
        let mut entries = self.entries.lock();
        let now = Instant::now();
        let matches = matches!(
            entries.get(key),
            Some(e) if e.live(now) && matches!(&e.value, Value::Str(s) if s == expected)
        );
        if matches {
            entries.remove(key);
        }
        Ok(matches)
    }

    async fn expire(&self, key: &str, ttl: Duration) -> Result<bool> {
        let mut entries = self.entries.lock();
        let now = Instant::now();
        match entries.get_mut(key) {
            Some(e) if e.live(now) => {
                e.deadline = Some(now + ttl);
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    async fn incr(&self, key: &str) -> Result<i64> {
        let mut entries = self.entries.lock();
        let now = Instant::now();
        let (current, deadline) = match entries.get(key).filter(|e| e.live(now)) {
            Some(Entry {
                value: Value::Str(s),
                deadline,
            }) => {
                let n = s.parse::<i64>().map_err(|e| RegistryError::BadValue {
                    key: key.to_string(),
                    detail: e.to_string(),
                })?;
                (n, *deadline)
            }
            Some(_) => {
                return Err(RegistryError::WrongType {
                    key: key.to_string(),
                    expected: "string",
                });
            }
            None => (0, None),
        };
        let next = current + 1;
        entries.insert(
            key.to_string(),
            Entry {
                value: Value::Str(next.to_string()),
                deadline,
            },
        );
        Ok(next)
    }

    async fn mget(&self, keys: &[String]) -> Result<Vec<Option<String>>> {
        let entries = self.entries.lock();
        let now = Instant::now();
        Ok(keys
            .iter()
            .map(|k| match entries.get(k).filter(|e| e.live(now)) {
                Some(Entry {
                    value: Value::Str(s),
                    ..
                }) => Some(s.clone()),
                _ => None,
            })
            .collect())
    }

    async fn scan(&self, pattern: &str) -> Result<Vec<String>> {
        let entries = self.entries.lock();
        let now = Instant::now();
        let mut keys: Vec<String> = entries
            .iter()
            .filter(|(k, e)| e.live(now) && glob_match(pattern, k))
            .map(|(k, _)| k.clone())
            .collect();
        keys.sort();
        Ok(keys)
    }

    async fn hset(&self, key: &str, fields: &[(String, String)]) -> Result<()> {
        let mut entries = self.entries.lock();
        Self::apply(
            &mut entries,
            PipelineCommand::HSet {
                key: key.to_string(),
                fields: fields.to_vec(),
            },
        );
        Ok(())
    }

    async fn hget(&self, key: &str, field: &str) -> Result<Option<String>> {
        self.with_live(key, |e| match e {
            Some(Entry {
                value: Value::Hash(h),
                ..
            }) => Ok(h.get(field).cloned()),
            Some(_) => Err(RegistryError::WrongType {
                key: key.to_string(),
                expected: "hash",
            }),
            None => Ok(None),
        })
    }

    async fn hgetall(&self, key: &str) -> Result<HashMap<String, String>> {
        self.with_live(key, |e| match e {
            Some(Entry {
                value: Value::Hash(h),
                ..
            }) => Ok(h.clone()),
            Some(_) => Err(RegistryError::WrongType {
                key: key.to_string(),
                expected: "hash",
            }),
            None => Ok(HashMap::new()),
        })
    }

    async fn hsetnx(&self, key: &str, field: &str, value: &str) -> Result<bool> {
        let mut entries = self.entries.lock();
        let now = Instant::now();
        let entry = entries.entry(key.to_string()).or_insert_with(|| Entry {
            value: Value::Hash(HashMap::new()),
            deadline: None,
        });
        if !entry.live(now) {
            entry.value = Value::Hash(HashMap::new());
            entry.deadline = None;
        }
        match &mut entry.value {
            Value::Hash(h) => {
                if h.contains_key(field) {
                    Ok(false)
                } else {
                    h.insert(field.to_string(), value.to_string());
                    Ok(true)
                }
            }
            _ => Err(RegistryError::WrongType {
                key: key.to_string(),
                expected: "hash",
            }),
        }
    }

    async fn hdel(&self, key: &str, fields: &[String]) -> Result<u64> {
        let mut entries = self.entries.lock();
        let now = Instant::now();
        let mut removed = 0;
        let mut emptied = false;
        if let Some(entry) = entries.get_mut(key).filter(|e| e.live(now)) {
            if let Value::Hash(h) = &mut entry.value {
                for f in fields {
                    if h.remove(f).is_some() {
                        removed += 1;
                    }
                }
                emptied = h.is_empty();
            }
        }
        if emptied {
            entries.remove(key);
        }
        Ok(removed)
    }

    async fn rpush(&self, key: &str, values: &[String]) -> Result<u64> {
        let mut entries = self.entries.lock();
        let now = Instant::now();
        let entry = entries.entry(key.to_string()).or_insert_with(|| Entry {
            value: Value::List(Vec::new()),
            deadline: None,
        });
        if !entry.live(now) {
            entry.value = Value::List(Vec::new());
            entry.deadline = None;
        }
        match &mut entry.value {
            Value::List(l) => {
                l.extend(values.iter().cloned());
                Ok(l.len() as u64)
            }
            _ => Err(RegistryError::WrongType {
                key: key.to_string(),
                expected: "list",
            }),
        }
    }

    async fn lrange(&self, key: &str) -> Result<Vec<String>> {
        self.with_live(key, |e| match e {
            Some(Entry {
                value: Value::List(l),
                ..
            }) => Ok(l.clone()),
            Some(_) => Err(RegistryError::WrongType {
                key: key.to_string(),
                expected: "list",
            }),
            None => Ok(Vec::new()),
        })
    }

    async fn publish(&self, channel: &str, payload: &str) -> Result<u64> {
        match self.pubsub.send((channel.to_string(), payload.to_string())) {
            Ok(n) => Ok(n as u64),
            Err(_) => Ok(0), // no subscribers
        }
    }

    async fn subscribe(&self, channels: &[String]) -> Result<Box<dyn Subscription>> {
        Ok(Box::new(MemorySubscription {
            channels: channels.to_vec(),
            rx: self.pubsub.subscribe(),
        }))
    }

    async fn pipeline(&self, commands: Vec<PipelineCommand>) -> Result<()> {
        let mut entries = self.entries.lock();
        for command in commands {
            Self::apply(&mut entries, command);
        }
        Ok(())
    }

    async fn enable_expiry_events(&self) -> Result<()> {
        Ok(()) // always on
    }

    fn expired_event_channel(&self) -> String {
        expired_channel_for_db(0)
    }
}

struct MemorySubscription {
    channels: Vec<String>,
    rx: broadcast::Receiver<(String, String)>,
}

#[async_trait]
impl Subscription for MemorySubscription {
    async fn consume(&mut self) -> Result<Consumed> {
        loop {
            match tokio::time::timeout(CONSUME_TIMEOUT, self.rx.recv()).await {
                Ok(Ok((channel, payload))) => {
                    if self.channels.iter().any(|c| c == &channel) {
                        return Ok(Consumed::Message { channel, payload });
                    }
                    // not ours; keep draining within this consume call
                }
                Ok(Err(broadcast::error::RecvError::Lagged(_))) => continue,
                Ok(Err(broadcast::error::RecvError::Closed)) => {
                    return Err(RegistryError::Protocol {
                        op: "subscribe",
                        detail: "pub/sub channel closed".into(),
                    });
                }
                Err(_) => return Ok(Consumed::Timeout),
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn string_roundtrip_and_ttl() {
        let r = MemoryRegistry::new();
        r.set("plain", "v").await.unwrap();
        assert_eq!(r.get("plain").await.unwrap().as_deref(), Some("v"));

        r.set_ex("short", "v", Duration::from_millis(30)).await.unwrap();
        assert_eq!(r.get("short").await.unwrap().as_deref(), Some("v"));
        tokio::time::sleep(Duration::from_millis(60)).await;
        assert_eq!(r.get("short").await.unwrap(), None);
    }

    #[tokio::test]
    async fn set_nx_respects_live_holder() {
        let r = MemoryRegistry::new();
        assert!(r.set_nx_ex("lock", "a", Duration::from_millis(40)).await.unwrap());
        assert!(!r.set_nx_ex("lock", "b", Duration::from_millis(40)).await.unwrap());
        tokio::time::sleep(Duration::from_millis(80)).await;
        assert!(r.set_nx_ex("lock", "b", Duration::from_millis(40)).await.unwrap());
    }

    #[tokio::test]
    async fn del_eq_checks_owner() {
        let r = MemoryRegistry::new();
        r.set("lock", "me").await.unwrap();
        assert!(!r.del_eq("lock", "you").await.unwrap());
        assert!(r.del_eq("lock", "me").await.unwrap());
        assert!(!r.del_eq("lock", "me").await.unwrap());
    }

    #[tokio::test]
    async fn incr_starts_from_zero() {
        let r = MemoryRegistry::new();
        assert_eq!(r.incr("n").await.unwrap(), 1);
        assert_eq!(r.incr("n").await.unwrap(), 2);
        assert_eq!(r.get("n").await.unwrap().as_deref(), Some("2"));
    }

    #[tokio::test]
    async fn hash_operations() {
        let r = MemoryRegistry::new();
        assert!(r.hsetnx("h", "0", "uuid-a").await.unwrap());
        assert!(!r.hsetnx("h", "0", "uuid-b").await.unwrap());
        r.hset("h", &[("1".into(), "uuid-c".into())]).await.unwrap();
        let all = r.hgetall("h").await.unwrap();
        assert_eq!(all.len(), 2);
        assert_eq!(all["0"], "uuid-a");
        assert_eq!(r.hdel("h", &["0".into()]).await.unwrap(), 1);
        assert_eq!(r.hdel("h", &["0".into()]).await.unwrap(), 0);
    }

    #[tokio::test]
    async fn scan_is_sorted_and_filtered() {
        let r = MemoryRegistry::new();
        r.set("daq_service:B:B-0:presence", "u1").await.unwrap();
        r.set("daq_service:A:A-0:presence", "u2").await.unwrap();
        r.set("daq_service:A:A-0:health", "x").await.unwrap();
        let keys = r.scan("daq_service:*:*:presence").await.unwrap();
        assert_eq!(
            keys,
            vec!["daq_service:A:A-0:presence".to_string(), "daq_service:B:B-0:presence".to_string()]
        );
    }

    #[tokio::test]
    async fn pubsub_delivers_to_subscribed_channel_only() {
        let r = MemoryRegistry::new();
        let mut sub = r.subscribe(&["daqctl".into()]).await.unwrap();
        r.publish("other", "nope").await.unwrap();
        r.publish("daqctl", "yes").await.unwrap();
        loop {
            match sub.consume().await.unwrap() {
                Consumed::Message { channel, payload } => {
                    assert_eq!(channel, "daqctl");
                    assert_eq!(payload, "yes");
                    break;
                }
                Consumed::Timeout => continue,
            }
        }
    }

    #[tokio::test]
    async fn expiry_event_published_on_sweep() {
        let r = MemoryRegistry::new();
        let mut sub = r.subscribe(&[r.expired_event_channel()]).await.unwrap();
        r.set_ex("daq_service:Foo:Foo-0:presence", "u", Duration::from_millis(30))
            .await
            .unwrap();
        let deadline = Instant::now() + Duration::from_secs(2);
        loop {
            assert!(Instant::now() < deadline, "no expiry event arrived");
            match sub.consume().await.unwrap() {
                Consumed::Message { payload, .. } => {
                    assert_eq!(payload, "daq_service:Foo:Foo-0:presence");
                    break;
                }
                Consumed::Timeout => continue,
            }
        }
    }

    #[tokio::test]
    async fn pipeline_is_atomic_batch() {
        let r = MemoryRegistry::new();
        r.pipeline(vec![
            PipelineCommand::SetEx {
                key: "k1".into(),
                value: "v1".into(),
                ttl: Duration::from_secs(5),
            },
            PipelineCommand::HSet {
                key: "h".into(),
                fields: vec![("f".into(), "v".into())],
            },
            PipelineCommand::RPush {
                key: "l".into(),
                values: vec!["a".into(), "b".into()],
            },
        ])
        .await
        .unwrap();
        assert_eq!(r.get("k1").await.unwrap().as_deref(), Some("v1"));
        assert_eq!(r.hget("h", "f").await.unwrap().as_deref(), Some("v"));
        assert_eq!(r.lrange("l").await.unwrap(), vec!["a".to_string(), "b".to_string()]);
    }
}
