//! Runtime configuration, loaded from a YAML file.

use std::path::Path;
use std::time::Duration;
use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};

/// Polling intervals and storage times, all in seconds.
///
/// Storage time is how long a scope's merged state is kept in the store
/// after the last subscriber stopped polling it.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct Config {
    pub deployments_polling_interval: u64,
    pub instance_polling_interval: u64,
    pub active_user_tasks_polling_interval: u64,
    pub deployment_storage_time: u64,
    pub instance_storage_time: u64,
    pub active_user_task_storage_time: u64,
}

impl Default for Config {
    fn default() -> Self {
        Config {
            deployments_polling_interval: 10,
            instance_polling_interval: 5,
            active_user_tasks_polling_interval: 5,
            deployment_storage_time: 600,
            instance_storage_time: 600,
            active_user_task_storage_time: 600,
        }
    }
}

impl Config {
    pub fn load(path: &Path) -> Result<Self> {
        let raw = std::fs::read_to_string(path)
            .with_context(|| format!("reading config from {}", path.display()))?;
        serde_yaml::from_str(&raw).context("parsing config")
    }

    pub fn deployments_interval(&self) -> Duration {
        Duration::from_secs(self.deployments_polling_interval)
    }

    pub fn instance_interval(&self) -> Duration {
        Duration::from_secs(self.instance_polling_interval)
    }

    pub fn user_tasks_interval(&self) -> Duration {
        Duration::from_secs(self.active_user_tasks_polling_interval)
    }

    pub fn deployment_storage(&self) -> Duration {
        Duration::from_secs(self.deployment_storage_time)
    }

    pub fn instance_storage(&self) -> Duration {
        Duration::from_secs(self.instance_storage_time)
    }

    pub fn user_task_storage(&self) -> Duration {
        Duration::from_secs(self.active_user_task_storage_time)
    }
}
