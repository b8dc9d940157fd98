//! Helpers for the controller-owned `run_info` namespace.

use std::sync::Arc;

use crate::constants::run_info;
use crate::registry::Registry;
use crate::registry::Result;

/// Builder for `run_info` keys with the configured separator.
#[derive(Debug, Clone)]
pub struct RunInfoKeys {
    separator: String,
}

impl RunInfoKeys {
    pub fn new(separator: impl Into<String>) -> Self {
        Self {
            separator: separator.into(),
        }
    }

    pub fn key(&self, name: &str) -> String {
        format!("{}{}{}", run_info::PREFIX, self.separator, name)
    }

    pub fn run_number(&self) -> String {
        self.key(run_info::RUN_NUMBER)
    }

    pub fn latest_run_number(&self) -> String {
        self.key(run_info::LATEST_RUN_NUMBER)
    }

    /// Read a barrier flag; missing keys and anything but `1`/`true` count
    /// as unset.
    pub async fn wait_flag(&self, registry: &Arc<dyn Registry>, name: &str) -> Result<bool> {
        let value = registry.get(&self.key(name)).await?;
        Ok(value.is_some_and(|v| {
            let v = v.to_ascii_lowercase();
            v == "1" || v == "true"
        }))
    }
}

/// Names accepted by the client's `redis-set` command.
pub const SETTABLE_RUN_INFO: &[&str] = &[
    run_info::RUN_NUMBER,
    run_info::WAIT_DEVICE_READY,
    run_info::WAIT_READY,
];
