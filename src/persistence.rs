//! JSON snapshot of the project-owned deployment state.
//!
//! Only deployments that belong to a local project are persisted; everything
//! else is rebuilt from the fleet on the next polling cycle anyway. Machine
//! membership is runtime knowledge and is emptied before writing so a stale
//! machine list can never survive a restart.

use std::collections::HashMap;
use std::fs;
use std::path::Path;
use anyhow::{Context, Result};
use tracing::debug;

use crate::catalog::ProcessCatalog;
use crate::model::Deployment;
use crate::store::ReconciliationStore;

fn storable(mut deployment: Deployment) -> Deployment {
    deployment.machines.clear();
    deployment.running_instances.clear();
    for summary in deployment.instances.values_mut() {
        summary.machines.clear();
    }
    for version in &mut deployment.versions {
        version.machines.clear();
    }
    deployment
}

/// Writes the project deployments to `path` as one JSON document.
pub fn save_snapshot(
    path: &Path,
    store: &ReconciliationStore,
    catalog: &ProcessCatalog,
) -> Result<()> {
    let snapshot: HashMap<String, Deployment> = store
        .deployments()
        .into_iter()
        .filter(|(definition_id, _)| catalog.is_project(definition_id))
        .map(|(definition_id, deployment)| (definition_id, storable(deployment)))
        .collect();

    let json = serde_json::to_string_pretty(&snapshot)
        .context("serializing deployment snapshot")?;
    fs::write(path, json)
        .with_context(|| format!("writing deployment snapshot to {}", path.display()))?;
    debug!(path = %path.display(), deployments = snapshot.len(), "deployment snapshot written");
    Ok(())
}

/// Seeds the store from a previously written snapshot. A missing file is not
/// an error, it simply means a fresh start.
pub fn load_snapshot(path: &Path, store: &ReconciliationStore) -> Result<()> {
    if !path.exists() {
        return Ok(());
    }

    let json = fs::read_to_string(path)
        .with_context(|| format!("reading deployment snapshot from {}", path.display()))?;
    let snapshot: HashMap<String, Deployment> =
        serde_json::from_str(&json).context("parsing deployment snapshot")?;

    debug!(path = %path.display(), deployments = snapshot.len(), "deployment snapshot loaded");
    for (_, deployment) in snapshot {
        store.seed_deployment(deployment);
    }
    Ok(())
}
