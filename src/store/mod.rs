//! In-memory store for the consolidated state.
//!
//! The pollers write merged results in here; consumers read snapshots or
//! subscribe to change events. Everything is keyed so that concurrent pollers
//! for different scopes never contend on the same entry.

use std::collections::HashMap;
use std::sync::Mutex;
use dashmap::DashMap;
use tokio::sync::broadcast;
use tracing::debug;

use crate::model::{ActiveUserTask, Deployment, Instance};
use crate::reconcile::deployment::DeploymentMergeOutcome;

/// Change notification carrying the affected id and the payload, so
/// subscribers never have to re-read the store to learn what changed.
/// Removals carry the entry as it was last stored.
#[derive(Clone, Debug)]
pub enum StoreEvent {
    DeploymentUpdated {
        definition_id: String,
        deployment: Deployment,
    },
    DeploymentRemoved {
        definition_id: String,
        deployment: Deployment,
    },
    InstanceUpdated {
        definition_id: String,
        instance_id: String,
        instance: Instance,
    },
    InstanceRemoved {
        instance_id: String,
        instance: Instance,
    },
    UserTasksUpdated {
        tasks: Vec<ActiveUserTask>,
    },
}

/// Holds the merged fleet state.
pub struct ReconciliationStore {
    deployments: DashMap<String, Deployment>,
    instances: DashMap<String, Instance>,
    user_tasks: Mutex<Vec<ActiveUserTask>>,
    events: broadcast::Sender<StoreEvent>,
}

impl ReconciliationStore {
    pub fn new() -> Self {
        let (events, _) = broadcast::channel(256);
        ReconciliationStore {
            deployments: DashMap::new(),
            instances: DashMap::new(),
            user_tasks: Mutex::new(Vec::new()),
            events,
        }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<StoreEvent> {
        self.events.subscribe()
    }

    pub fn deployments(&self) -> HashMap<String, Deployment> {
        self.deployments
            .iter()
            .map(|entry| (entry.key().clone(), entry.value().clone()))
            .collect()
    }

    pub fn deployment(&self, definition_id: &str) -> Option<Deployment> {
        self.deployments
            .get(definition_id)
            .map(|entry| entry.value().clone())
    }

    /// Seeds a deployment without emitting events, used when loading
    /// persisted state on startup.
    pub fn seed_deployment(&self, deployment: Deployment) {
        self.deployments
            .insert(deployment.definition_id.clone(), deployment);
    }

    /// Applies the outcome of one deployment merge cycle. Deployments that
    /// disappeared take their instance detail with them.
    pub fn apply_deployment_outcome(&self, outcome: DeploymentMergeOutcome) {
        for definition_id in &outcome.removed {
            self.remove_deployment(definition_id);
        }

        for (definition_id, deployment) in outcome.deployments {
            let changed = self
                .deployments
                .get(&definition_id)
                .map(|stored| *stored.value() != deployment)
                .unwrap_or(true);
            if changed {
                self.deployments
                    .insert(definition_id.clone(), deployment.clone());
                let _ = self.events.send(StoreEvent::DeploymentUpdated {
                    definition_id,
                    deployment,
                });
            }
        }
    }

    /// Removes a deployment and the instance detail that belonged to it.
    pub fn remove_deployment(&self, definition_id: &str) {
        if let Some((_, deployment)) = self.deployments.remove(definition_id) {
            debug!(definition_id, "removing deployment from store");
            let _ = self.events.send(StoreEvent::DeploymentRemoved {
                definition_id: definition_id.to_string(),
                deployment,
            });
        }
        let orphaned: Vec<String> = self
            .instances
            .iter()
            .filter(|entry| entry.value().definition_id == definition_id)
            .map(|entry| entry.key().clone())
            .collect();
        for instance_id in orphaned {
            self.remove_instance(&instance_id);
        }
    }

    pub fn instance(&self, instance_id: &str) -> Option<Instance> {
        self.instances
            .get(instance_id)
            .map(|entry| entry.value().clone())
    }

    pub fn update_instance(&self, instance: Instance) {
        let changed = self
            .instances
            .get(&instance.process_instance_id)
            .map(|stored| *stored.value() != instance)
            .unwrap_or(true);
        if changed {
            self.instances
                .insert(instance.process_instance_id.clone(), instance.clone());
            let _ = self.events.send(StoreEvent::InstanceUpdated {
                definition_id: instance.definition_id.clone(),
                instance_id: instance.process_instance_id.clone(),
                instance,
            });
        }
    }

    pub fn remove_instance(&self, instance_id: &str) {
        if let Some((_, instance)) = self.instances.remove(instance_id) {
            let _ = self.events.send(StoreEvent::InstanceRemoved {
                instance_id: instance_id.to_string(),
                instance,
            });
        }
    }

    pub fn active_user_tasks(&self) -> Vec<ActiveUserTask> {
        self.user_tasks
            .lock()
            .expect("user task list poisoned")
            .clone()
    }

    pub fn set_active_user_tasks(&self, tasks: Vec<ActiveUserTask>) {
        let mut stored = self.user_tasks.lock().expect("user task list poisoned");
        if *stored != tasks {
            *stored = tasks.clone();
            let _ = self.events.send(StoreEvent::UserTasksUpdated { tasks });
        }
    }
}

impl Default for ReconciliationStore {
    fn default() -> Self {
        Self::new()
    }
}
