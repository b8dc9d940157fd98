//! Instance-index acquisition under the shared `resource` lock.
//!
//! The index hash `TP S service-instance-index S <service>` maps indices to
//! uuids. Under the lock we garbage-collect slots whose presence key is gone,
//! reuse our own slot if the uuid matches (restart), and otherwise claim the
//! first free index with HSETNX. The presence key is written inside the lock
//! so a fellow racer cannot observe the slot without its liveness key.

use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use anyhow::Result;
use anyhow::bail;
use tracing::debug;
use tracing::warn;
use uuid::Uuid;

use crate::constants::PRESENCE_PREFIX;
use crate::constants::RESOURCE_LOCK_KEY;
use crate::constants::SERVICE_INSTANCE_INDEX_PREFIX;
use crate::constants::TOP_PREFIX;
use crate::coordination::DistributedLock;
use crate::coordination::LockConfig;
use crate::keyspace::join;
use crate::registry::Registry;

/// Hard cap on index probing; hit only when the hash is pathological.
const MAX_INDEX_PROBES: usize = 10_000;
/// Lock-acquisition rounds before giving up for good.
const MAX_LOCK_ROUNDS: u32 = 30;

/// The outcome of index acquisition.
#[derive(Debug, Clone)]
pub struct AcquiredIdentity {
    pub index: usize,
    pub instance_id: String,
    pub presence_key: String,
    /// Hash key and field to HDEL on unregister.
    pub index_hash_slot: (String, String),
}

/// Acquire a unique `(service, index)` slot for `uuid`.
pub async fn acquire_index(
    registry: &Arc<dyn Registry>,
    service: &str,
    uuid: Uuid,
    separator: &str,
    max_ttl: Duration,
) -> Result<AcquiredIdentity> {
    let lock = DistributedLock::new(
        registry.clone(),
        RESOURCE_LOCK_KEY,
        uuid.to_string(),
        LockConfig::default(),
    );

    let mut rounds = 0;
    let guard = loop {
        match lock.acquire().await {
            Ok(guard) => break guard,
            Err(e) if e.is_transient() => {
                rounds += 1;
                if rounds >= MAX_LOCK_ROUNDS {
                    bail!("could not acquire the registration lock after {rounds} rounds: {e}");
                }
                warn!(service, error = %e, "registration lock busy, retrying");
            }
            Err(e) => return Err(e).context("registration lock"),
        }
    };
    debug!(service, %uuid, "registration lock held");

    let result = assign_slot(registry, service, uuid, separator, max_ttl).await;
    if let Err(e) = guard.release().await {
        warn!(service, error = %e, "registration lock release failed (will expire)");
    }
    result
}

async fn assign_slot(
    registry: &Arc<dyn Registry>,
    service: &str,
    uuid: Uuid,
    separator: &str,
    max_ttl: Duration,
) -> Result<AcquiredIdentity> {
    // uuids backed by a live presence key
    let presence_pattern = join(&[TOP_PREFIX, service, "*", PRESENCE_PREFIX], separator);
    let presence_keys = registry.scan(&presence_pattern).await?;
    let live: HashSet<String> = registry
        .mget(&presence_keys)
        .await?
        .into_iter()
        .flatten()
        .collect();

    let index_key = join(&[TOP_PREFIX, SERVICE_INSTANCE_INDEX_PREFIX, service], separator);
    let slots = registry.hgetall(&index_key).await?;

    let my_uuid = uuid.to_string();
    let mut expired = Vec::new();
    let mut my_index = None;
    for (index, slot_uuid) in &slots {
        if !live.contains(slot_uuid) {
            warn!(service, index = %index, uuid = %slot_uuid, "reclaiming expired instance index");
            expired.push(index.clone());
        } else if slot_uuid == &my_uuid {
            // restart with the same uuid keeps its slot
            my_index = Some(index.clone());
        }
    }
    if !expired.is_empty() {
        registry.hdel(&index_key, &expired).await?;
    }

    let index_str = match my_index {
        Some(index) => {
            debug!(service, index = %index, "reusing instance index");
            index
        }
        None => {
            let mut claimed = None;
            for index in 0..MAX_INDEX_PROBES {
                let candidate = index.to_string();
                if registry.hsetnx(&index_key, &candidate, &my_uuid).await? {
                    claimed = Some(candidate);
                    break;
                }
            }
            claimed.with_context(|| format!("no free instance index for service {service}"))?
        }
    };

    let index: usize = index_str
        .parse()
        .with_context(|| format!("non-numeric instance index {index_str:?}"))?;
    let instance_id = format!("{service}-{index_str}");
    let presence_key = join(&[TOP_PREFIX, service, &instance_id, PRESENCE_PREFIX], separator);
    registry.set_ex(&presence_key, &my_uuid, max_ttl).await?;
    debug!(service, index, %uuid, "instance index acquired");

    Ok(AcquiredIdentity {
        index,
        instance_id,
        presence_key,
        index_hash_slot: (index_key, index_str),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::registry::MemoryRegistry;

    fn registry() -> Arc<dyn Registry> {
        MemoryRegistry::new()
    }

    #[tokio::test]
    async fn first_instance_gets_index_zero() {
        let r = registry();
        let id = acquire_index(&r, "Foo", Uuid::new_v4(), ":", Duration::from_secs(5))
            .await
            .unwrap();
        assert_eq!(id.index, 0);
        assert_eq!(id.instance_id, "Foo-0");
        assert_eq!(id.presence_key, "daq_service:Foo:Foo-0:presence");
        assert!(r.get(&id.presence_key).await.unwrap().is_some());
    }

    #[tokio::test]
    async fn second_instance_gets_next_index() {
        let r = registry();
        acquire_index(&r, "Foo", Uuid::new_v4(), ":", Duration::from_secs(5)).await.unwrap();
        let second = acquire_index(&r, "Foo", Uuid::new_v4(), ":", Duration::from_secs(5))
            .await
            .unwrap();
        assert_eq!(second.index, 1);
        let slots = r.hgetall("daq_service:service-instance-index:Foo").await.unwrap();
        assert_eq!(slots.len(), 2);
    }

    #[tokio::test]
    async fn same_uuid_reuses_slot() {
        let r = registry();
        let uuid = Uuid::new_v4();
        let first = acquire_index(&r, "Foo", uuid, ":", Duration::from_secs(5)).await.unwrap();
        let again = acquire_index(&r, "Foo", uuid, ":", Duration::from_secs(5)).await.unwrap();
        assert_eq!(first.index, again.index);
        let slots = r.hgetall("daq_service:service-instance-index:Foo").await.unwrap();
        assert_eq!(slots.len(), 1);
    }

    #[tokio::test]
    async fn stale_slot_is_garbage_collected() {
        let r = registry();
        // a slot without a live presence key
        r.hsetnx("daq_service:service-instance-index:Foo", "0", "dead-uuid")
            .await
            .unwrap();
        let id = acquire_index(&r, "Foo", Uuid::new_v4(), ":", Duration::from_secs(5))
            .await
            .unwrap();
        assert_eq!(id.index, 0);
        let slots = r.hgetall("daq_service:service-instance-index:Foo").await.unwrap();
        assert_eq!(slots.len(), 1);
        assert_ne!(slots["0"], "dead-uuid");
    }
}
