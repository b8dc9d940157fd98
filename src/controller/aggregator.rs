//! The controller's periodic state aggregation.
//!
//! Every poll interval the aggregator scans all per-instance state and
//! update-time keys, reconstructs a per-service summary with state
//! histograms, diffs it against the previous snapshot and broadcasts a
//! `state-summary-table` message to every WebSocket client. The snapshot is
//! a scan, not a consistent cut; clients converge eventually.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use serde_json::json;
use tokio_util::sync::CancellationToken;
use tracing::debug;
use tracing::warn;

use super::hub::BROADCAST_CONN_ID;
use super::hub::SessionHub;
use crate::constants::FAIRMQ_STATE_PREFIX;
use crate::constants::TOP_PREFIX;
use crate::constants::UPDATE_TIME_PREFIX;
use crate::fsm::ALL_STATES;
use crate::fsm::DeviceState;
use crate::fsm::NSTATES;
use crate::keyspace::InstanceKey;
use crate::keyspace::join;
use crate::registry::Registry;
use crate::registry::Result;

/// One instance's latest observed state.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct InstanceSummary {
    pub state: String,
    pub date: String,
}

/// Aggregated view of one service.
#[derive(Debug, Clone, Default)]
pub struct ServiceSummary {
    pub date: String,
    pub instances: BTreeMap<String, InstanceSummary>,
    pub counts: Vec<u32>,
}

/// The whole fleet, keyed by service name.
pub type SummaryTable = BTreeMap<String, ServiceSummary>;

/// Scan the registry and reconstruct the summary table.
pub async fn collect_summary(registry: &Arc<dyn Registry>, separator: &str) -> Result<SummaryTable> {
    let mut table = SummaryTable::new();

    let state_pattern = join(&[TOP_PREFIX, "*", "*", FAIRMQ_STATE_PREFIX], separator);
    let state_keys = registry.scan(&state_pattern).await?;
    if state_keys.is_empty() {
        return Ok(table);
    }
    let state_values = registry.mget(&state_keys).await?;
    for (key, value) in state_keys.iter().zip(state_values) {
        let Some(parts) = InstanceKey::parse(key, separator) else {
            continue;
        };
        let entry = table
            .entry(parts.service)
            .or_default()
            .instances
            .entry(parts.instance_id)
            .or_default();
        entry.state = value.unwrap_or_else(|| DeviceState::Undefined.name().to_string());
    }

    let date_pattern = join(&[TOP_PREFIX, "*", "*", UPDATE_TIME_PREFIX], separator);
    let date_keys = registry.scan(&date_pattern).await?;
    if !date_keys.is_empty() {
        let date_values = registry.mget(&date_keys).await?;
        for (key, value) in date_keys.iter().zip(date_values) {
            let Some(parts) = InstanceKey::parse(key, separator) else {
                continue;
            };
            let Some(service) = table.get_mut(&parts.service) else {
                continue;
            };
            let Some(instance) = service.instances.get_mut(&parts.instance_id) else {
                continue;
            };
            if let Some(date) = value {
                instance.date = date;
            }
        }
    }

    for (service, summary) in table.iter_mut() {
        summary.counts = vec![0; NSTATES];
        for (instance_id, instance) in &summary.instances {
            if !instance.state.is_empty() {
                match DeviceState::parse(&instance.state) {
                    Some(state) => summary.counts[state.state_id()] += 1,
                    None => {
                        warn!(service = %service, instance = %instance_id, state = %instance.state, "unknown state name");
                    }
                }
            }
            if !instance.date.is_empty() && (summary.date.is_empty() || summary.date < instance.date) {
                summary.date = instance.date.clone();
            }
        }
    }

    Ok(table)
}

/// Whether the sets of services / instances changed between snapshots.
pub fn diff_tables(previous: &SummaryTable, current: &SummaryTable) -> (bool, bool) {
    let mut service_list_changed = previous.len() != current.len();
    if !service_list_changed {
        service_list_changed = current.keys().any(|k| !previous.contains_key(k));
    }
    if service_list_changed {
        return (true, true);
    }
    for (service, summary) in current {
        let prev = &previous[service];
        if prev.instances.len() != summary.instances.len()
            || summary.instances.keys().any(|k| !prev.instances.contains_key(k))
        {
            return (false, true);
        }
    }
    (false, false)
}

/// Render the broadcast `state-summary-table` message.
pub fn summary_message(table: &SummaryTable, service_list_changed: bool, instance_list_changed: bool) -> String {
    let services: Vec<_> = table
        .iter()
        .map(|(service, summary)| {
            let counts: Vec<_> = ALL_STATES
                .iter()
                .map(|state| {
                    json!({
                        "state-id": state.state_id(),
                        "name": state.name(),
                        "value": summary.counts.get(state.state_id()).copied().unwrap_or(0),
                    })
                })
                .collect();
            let instances: Vec<_> = summary
                .instances
                .iter()
                .map(|(instance_id, instance)| {
                    json!({
                        "service": service,
                        "instance": instance_id,
                        "state": instance.state,
                        "date": instance.date,
                    })
                })
                .collect();
            json!({
                "service": service,
                "date": summary.date,
                "n_instances": summary.instances.len(),
                "counts": counts,
                "instances": instances,
            })
        })
        .collect();
    json!({
        "type": "state-summary-table",
        "service_list_changed": service_list_changed,
        "instance_list_changed": instance_list_changed,
        "services": services,
    })
    .to_string()
}

/// The state-poll task: scan, diff, broadcast, sleep.
pub struct Aggregator {
    registry: Arc<dyn Registry>,
    separator: String,
    poll_interval: Duration,
    sessions: Arc<SessionHub>,
    cancel: CancellationToken,
}

impl Aggregator {
    pub fn new(
        registry: Arc<dyn Registry>,
        separator: impl Into<String>,
        poll_interval: Duration,
        sessions: Arc<SessionHub>,
        cancel: CancellationToken,
    ) -> Self {
        Self {
            registry,
            separator: separator.into(),
            poll_interval,
            sessions,
            cancel,
        }
    }

    pub async fn run(self) {
        let mut previous = SummaryTable::new();
        let mut tick = tokio::time::interval(self.poll_interval);
        tick.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        loop {
            tokio::select! {
                _ = self.cancel.cancelled() => break,
                _ = tick.tick() => {}
            }
            let table = match collect_summary(&self.registry, &self.separator).await {
                Ok(table) => table,
                Err(e) if e.is_transient() => {
                    warn!(error = %e, "state poll failed");
                    continue;
                }
                Err(e) => {
                    warn!(error = %e, "state poll hit protocol error, stopping");
                    break;
                }
            };
            let (service_list_changed, instance_list_changed) = diff_tables(&previous, &table);
            let message = summary_message(&table, service_list_changed, instance_list_changed);
            self.sessions.send(BROADCAST_CONN_ID, &message).await;
            previous = table;
        }
        debug!("state poll stopped");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::registry::MemoryRegistry;

    async fn seed_instance(r: &Arc<dyn Registry>, service: &str, instance: &str, state: &str, date: &str) {
        r.set(&format!("daq_service:{service}:{instance}:fair:mq:state"), state)
            .await
            .unwrap();
        r.set(&format!("daq_service:{service}:{instance}:update-time"), date)
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn summary_groups_by_service() {
        let r: Arc<dyn Registry> = MemoryRegistry::new();
        seed_instance(&r, "Sampler", "Sampler-0", "Running", "2026-08-02T10:00:00.000Z").await;
        seed_instance(&r, "Sampler", "Sampler-1", "Ready", "2026-08-02T10:00:01.000Z").await;
        seed_instance(&r, "Sink", "Sink-0", "Running", "2026-08-02T09:59:59.000Z").await;

        let table = collect_summary(&r, ":").await.unwrap();
        assert_eq!(table.len(), 2);
        let sampler = &table["Sampler"];
        assert_eq!(sampler.instances.len(), 2);
        assert_eq!(sampler.counts[DeviceState::Running.state_id()], 1);
        assert_eq!(sampler.counts[DeviceState::Ready.state_id()], 1);
        // the service date is the newest instance date
        assert_eq!(sampler.date, "2026-08-02T10:00:01.000Z");
    }

    #[tokio::test]
    async fn missing_state_value_counts_as_undefined() {
        let r: Arc<dyn Registry> = MemoryRegistry::new();
        seed_instance(&r, "Sampler", "Sampler-0", "Idle", "d").await;
        let table = collect_summary(&r, ":").await.unwrap();
        assert_eq!(table["Sampler"].instances["Sampler-0"].state, "Idle");
        // no keys at all: empty table
        let empty: Arc<dyn Registry> = MemoryRegistry::new();
        assert!(collect_summary(&empty, ":").await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn delta_flags() {
        let r: Arc<dyn Registry> = MemoryRegistry::new();
        seed_instance(&r, "Sampler", "Sampler-0", "Idle", "d").await;
        let first = collect_summary(&r, ":").await.unwrap();
        assert_eq!(diff_tables(&SummaryTable::new(), &first), (true, true));
        assert_eq!(diff_tables(&first, &first.clone()), (false, false));

        seed_instance(&r, "Sampler", "Sampler-1", "Idle", "d").await;
        let second = collect_summary(&r, ":").await.unwrap();
        assert_eq!(diff_tables(&first, &second), (false, true));

        seed_instance(&r, "Sink", "Sink-0", "Idle", "d").await;
        let third = collect_summary(&r, ":").await.unwrap();
        assert_eq!(diff_tables(&second, &third), (true, true));
    }

    #[tokio::test]
    async fn message_shape() {
        let r: Arc<dyn Registry> = MemoryRegistry::new();
        seed_instance(&r, "Sampler", "Sampler-0", "Running", "d").await;
        let table = collect_summary(&r, ":").await.unwrap();
        let message = summary_message(&table, true, true);
        let parsed: serde_json::Value = serde_json::from_str(&message).unwrap();
        assert_eq!(parsed["type"], "state-summary-table");
        assert_eq!(parsed["service_list_changed"], true);
        let services = parsed["services"].as_array().unwrap();
        assert_eq!(services.len(), 1);
        assert_eq!(services[0]["service"], "Sampler");
        assert_eq!(services[0]["n_instances"], 1);
        assert_eq!(services[0]["counts"].as_array().unwrap().len(), NSTATES);
        assert_eq!(services[0]["instances"][0]["state"], "Running");
    }
}
