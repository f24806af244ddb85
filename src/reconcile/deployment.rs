//! Deployment reconciliation: one consolidated deployment map from the
//! deployment lists independently reported by every connected machine.

use std::collections::HashMap;
use std::sync::Arc;
use tracing::info;

use crate::client::EngineApi;
use crate::machines::{Machine, MachineRegistry};
use crate::model::{has_running_marker, DeployedProcess, Deployment, InstanceSummary, Version, VersionMachine};

/// Entries requested from the engines; instance detail beyond the summary is
/// polled separately per instance.
pub const DEPLOYMENT_ENTRIES: &str =
    "definitionId,versions,instances(processInstanceId,processVersion,instanceState,globalStartTime)";

/// One machine's successfully polled deployment list.
///
/// Only machines whose poll succeeded produce a report. That distinction
/// drives the removal logic: a report that lacks a deployment means the
/// deployment was removed from that machine, while an absent report means
/// the machine was unreachable and its prior contributions must be kept.
#[derive(Clone, Debug)]
pub struct MachineDeployments {
    pub machine: Machine,
    pub deployments: HashMap<String, DeployedProcess>,
}

/// Result of one deployment merge pass.
#[derive(Clone, Debug, Default)]
pub struct DeploymentMergeOutcome {
    pub deployments: HashMap<String, Deployment>,
    /// Definition ids that no machine reports anymore.
    pub removed: Vec<String>,
}

/// Requests the deployment list from every connected machine. Requests are
/// issued concurrently and joined in registry order so the merge stays
/// deterministic; machines that fail contribute nothing this cycle.
pub async fn fetch_deployments(
    registry: &MachineRegistry,
    api: Arc<dyn EngineApi>,
) -> Vec<MachineDeployments> {
    let mut handles = Vec::new();
    for machine in registry.connected_machines() {
        let api = Arc::clone(&api);
        handles.push(tokio::spawn(async move {
            match api
                .get_deployed_processes(&machine, Some(DEPLOYMENT_ENTRIES))
                .await
            {
                Ok(processes) => {
                    let deployments = processes
                        .into_iter()
                        .map(|process| (process.definition_id.clone(), process))
                        .collect();
                    Some(MachineDeployments {
                        machine,
                        deployments,
                    })
                }
                Err(err) => {
                    info!(
                        machine = %machine.display_name(),
                        error = %err,
                        "could not request deployment information"
                    );
                    None
                }
            }
        }));
    }

    let mut reports = Vec::new();
    for handle in handles {
        if let Ok(Some(report)) = handle.await {
            reports.push(report);
        }
    }
    reports
}

/// Merges the reported deployment lists into a deep copy of the stored
/// deployment map and computes which deployments disappeared entirely.
///
/// `known_machine_ids` is the registry's current membership: contributions
/// of machines that were removed from the registry are dropped even though
/// no report can testify to their removal.
pub fn merge_deployments(
    stored: &HashMap<String, Deployment>,
    reports: &[MachineDeployments],
    known_machine_ids: &[String],
) -> DeploymentMergeOutcome {
    let mut deployments = stored.clone();

    for report in reports {
        for machine_deployment in report.deployments.values() {
            let deployment = deployments
                .entry(machine_deployment.definition_id.clone())
                .or_insert_with(|| Deployment::new(&machine_deployment.definition_id));

            if !deployment
                .machines
                .iter()
                .any(|known| known.id == report.machine.id)
            {
                deployment.machines.push(report.machine.clone());
            }

            for reported in &machine_deployment.versions {
                if let Some(known) = deployment
                    .versions
                    .iter_mut()
                    .find(|version| version.version == reported.version)
                {
                    if !known
                        .machines
                        .iter()
                        .any(|entry| entry.machine_id == report.machine.id)
                    {
                        known.machines.push(VersionMachine {
                            machine_id: report.machine.id.clone(),
                            deployment_date: reported.deployment_date,
                            needs: reported.needs.clone(),
                        });
                    }
                } else {
                    // First sighting of this version: bpmn and naming are
                    // stored once globally, deployment date and needs are
                    // machine specific.
                    deployment.versions.push(Version {
                        version: reported.version,
                        version_name: reported.version_name.clone(),
                        version_description: reported.version_description.clone(),
                        bpmn: reported.bpmn.clone(),
                        machines: vec![VersionMachine {
                            machine_id: report.machine.id.clone(),
                            deployment_date: reported.deployment_date,
                            needs: reported.needs.clone(),
                        }],
                    });
                }
            }

            for reported in &machine_deployment.instances {
                let summary = deployment
                    .instances
                    .entry(reported.process_instance_id.clone())
                    .or_insert_with(|| InstanceSummary {
                        process_instance_id: reported.process_instance_id.clone(),
                        process_version: reported.process_version,
                        global_start_time: reported.global_start_time,
                        machines: Vec::new(),
                    });

                if !summary.machines.contains(&report.machine.id) {
                    summary.machines.push(report.machine.id.clone());
                }
                // every machine is expected to run the same version, keep it fresh
                summary.process_version = reported.process_version;

                if has_running_marker(&reported.instance_state) {
                    let running = deployment
                        .running_instances
                        .entry(reported.process_instance_id.clone())
                        .or_default();
                    if !running.contains(&report.machine.id) {
                        running.push(report.machine.id.clone());
                    }
                } else if let Some(running) = deployment
                    .running_instances
                    .get_mut(&reported.process_instance_id)
                {
                    running.retain(|machine_id| machine_id != &report.machine.id);
                    if running.is_empty() {
                        deployment
                            .running_instances
                            .remove(&reported.process_instance_id);
                    }
                }
            }
        }
    }

    // Cleanup pass: drop machine contributions that are provably gone and
    // remove deployments that no machine hosts anymore.
    let mut removed = Vec::new();
    deployments.retain(|definition_id, deployment| {
        deployment.machines.retain(|machine| {
            if !known_machine_ids.contains(&machine.id) {
                return false;
            }
            match reports.iter().find(|r| r.machine.id == machine.id) {
                // the machine answered; absence of the deployment means removal
                Some(report) => report.deployments.contains_key(definition_id),
                // unreachable machines keep their prior contributions
                None => true,
            }
        });

        let surviving: Vec<String> = deployment
            .machines
            .iter()
            .map(|machine| machine.id.clone())
            .collect();

        deployment.versions.retain_mut(|version| {
            version
                .machines
                .retain(|entry| surviving.contains(&entry.machine_id));
            !version.machines.is_empty()
        });

        deployment.instances.retain(|_, summary| {
            summary
                .machines
                .retain(|machine_id| surviving.contains(machine_id));
            !summary.machines.is_empty()
        });

        deployment.running_instances.retain(|_, machine_ids| {
            machine_ids.retain(|machine_id| surviving.contains(machine_id));
            !machine_ids.is_empty()
        });

        if deployment.machines.is_empty() {
            removed.push(definition_id.clone());
            false
        } else {
            true
        }
    });

    DeploymentMergeOutcome {
        deployments,
        removed,
    }
}
