//! Subscription lifecycle around the pollers.
//!
//! Consumers ask for a scope to be polled (the fleet-wide deployment list,
//! the fleet-wide user task list, or one instance); the manager keeps one
//! handler per scope, makes repeated starts idempotent, and arms a cleanup
//! timer when the last consumer leaves so stale state eventually disappears
//! from the store. Scopes owned by a local project are exempt from cleanup.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use tokio::task::JoinHandle;
use tracing::debug;

use crate::catalog::ProcessCatalog;
use crate::client::EngineApi;
use crate::config::Config;
use crate::machines::{Machine, MachineRegistry};
use crate::model::Instance;
use crate::polling::PollingHandler;
use crate::reconcile::deployment::{fetch_deployments, merge_deployments, DeploymentMergeOutcome};
use crate::reconcile::instance::{fetch_instance_information, merge_instance_information};
use crate::reconcile::user_tasks::{fetch_active_user_tasks, merge_active_user_tasks};
use crate::store::ReconciliationStore;

struct InstanceScope {
    definition_id: String,
    handler: Arc<PollingHandler>,
}

pub struct PollingManager {
    registry: Arc<MachineRegistry>,
    api: Arc<dyn EngineApi>,
    store: Arc<ReconciliationStore>,
    catalog: Arc<ProcessCatalog>,
    config: Mutex<Config>,

    deployment_handler: Mutex<Option<Arc<PollingHandler>>>,
    deployment_cleanup: Mutex<Option<JoinHandle<()>>>,
    user_task_handler: Mutex<Option<Arc<PollingHandler>>>,
    user_task_cleanup: Mutex<Option<JoinHandle<()>>>,
    instance_scopes: Mutex<HashMap<String, InstanceScope>>,
    instance_cleanups: Mutex<HashMap<String, JoinHandle<()>>>,
}

impl PollingManager {
    pub fn new(
        registry: Arc<MachineRegistry>,
        api: Arc<dyn EngineApi>,
        store: Arc<ReconciliationStore>,
        catalog: Arc<ProcessCatalog>,
        config: Config,
    ) -> Self {
        PollingManager {
            registry,
            api,
            store,
            catalog,
            config: Mutex::new(config),
            deployment_handler: Mutex::new(None),
            deployment_cleanup: Mutex::new(None),
            user_task_handler: Mutex::new(None),
            user_task_cleanup: Mutex::new(None),
            instance_scopes: Mutex::new(HashMap::new()),
            instance_cleanups: Mutex::new(HashMap::new()),
        }
    }

    fn config(&self) -> Config {
        self.config.lock().expect("config poisoned").clone()
    }

    /// Pushes new intervals into every live handler; storage times take
    /// effect the next time a cleanup timer is armed.
    pub fn apply_config(&self, config: &Config) {
        *self.config.lock().expect("config poisoned") = config.clone();

        if let Some(handler) = &*self.deployment_handler.lock().expect("handler slot poisoned") {
            handler.change_polling_interval(config.deployments_interval());
        }
        if let Some(handler) = &*self.user_task_handler.lock().expect("handler slot poisoned") {
            handler.change_polling_interval(config.user_tasks_interval());
        }
        for scope in self
            .instance_scopes
            .lock()
            .expect("instance scopes poisoned")
            .values()
        {
            scope.handler.change_polling_interval(config.instance_interval());
        }
    }

    // --- deployment scope ---

    pub fn poll_deployment_info(&self) {
        if let Some(pending) = self
            .deployment_cleanup
            .lock()
            .expect("cleanup slot poisoned")
            .take()
        {
            pending.abort();
        }

        let mut slot = self.deployment_handler.lock().expect("handler slot poisoned");
        if slot.is_some() {
            return;
        }

        let registry = Arc::clone(&self.registry);
        let api = Arc::clone(&self.api);
        let store = Arc::clone(&self.store);
        let producer = move || {
            let registry = Arc::clone(&registry);
            let api = Arc::clone(&api);
            let store = Arc::clone(&store);
            async move { Ok(deployment_cycle(&registry, api, &store).await) }
        };

        let store = Arc::clone(&self.store);
        let catalog = Arc::clone(&self.catalog);
        let consumer = move |outcome: DeploymentMergeOutcome| {
            for definition_id in &outcome.removed {
                catalog.remove_instance_adaptations(definition_id);
            }
            store.apply_deployment_outcome(outcome);
        };

        *slot = Some(Arc::new(PollingHandler::new(
            producer,
            self.config().deployments_interval(),
            consumer,
        )));
    }

    pub fn stop_polling_deployment_info(&self) {
        let handler = self
            .deployment_handler
            .lock()
            .expect("handler slot poisoned")
            .take();
        let Some(handler) = handler else {
            return;
        };
        handler.stop_polling();

        let store = Arc::clone(&self.store);
        let catalog = Arc::clone(&self.catalog);
        let storage_time = self.config().deployment_storage();
        let cleanup = tokio::spawn(async move {
            tokio::time::sleep(storage_time).await;
            for definition_id in store.deployments().into_keys() {
                if !catalog.is_project(&definition_id) {
                    debug!(definition_id, "deployment storage time expired");
                    store.remove_deployment(&definition_id);
                }
            }
        });

        if let Some(previous) = self
            .deployment_cleanup
            .lock()
            .expect("cleanup slot poisoned")
            .replace(cleanup)
        {
            previous.abort();
        }
    }

    /// Resolves once a fresh deployment cycle landed in the store. Uses the
    /// running handler if there is one, otherwise runs a single cycle.
    pub async fn immediate_deployment_info_request(&self) {
        let handler = self
            .deployment_handler
            .lock()
            .expect("handler slot poisoned")
            .clone();
        match handler {
            Some(handler) => handler.skip_waiting().await,
            None => {
                let outcome =
                    deployment_cycle(&self.registry, Arc::clone(&self.api), &self.store).await;
                for definition_id in &outcome.removed {
                    self.catalog.remove_instance_adaptations(definition_id);
                }
                self.store.apply_deployment_outcome(outcome);
            }
        }
    }

    // --- user task scope ---

    pub fn poll_active_user_tasks(&self) {
        if let Some(pending) = self
            .user_task_cleanup
            .lock()
            .expect("cleanup slot poisoned")
            .take()
        {
            pending.abort();
        }

        let mut slot = self.user_task_handler.lock().expect("handler slot poisoned");
        if slot.is_some() {
            return;
        }

        let registry = Arc::clone(&self.registry);
        let api = Arc::clone(&self.api);
        let store = Arc::clone(&self.store);
        let producer = move || {
            let registry = Arc::clone(&registry);
            let api = Arc::clone(&api);
            let store = Arc::clone(&store);
            async move {
                let reports = fetch_active_user_tasks(&registry, api).await;
                Ok(merge_active_user_tasks(&store.active_user_tasks(), &reports))
            }
        };

        let store = Arc::clone(&self.store);
        let consumer = move |tasks| store.set_active_user_tasks(tasks);

        *slot = Some(Arc::new(PollingHandler::new(
            producer,
            self.config().user_tasks_interval(),
            consumer,
        )));
    }

    pub fn stop_polling_active_user_tasks(&self) {
        let handler = self
            .user_task_handler
            .lock()
            .expect("handler slot poisoned")
            .take();
        let Some(handler) = handler else {
            return;
        };
        handler.stop_polling();

        let store = Arc::clone(&self.store);
        let storage_time = self.config().user_task_storage();
        let cleanup = tokio::spawn(async move {
            tokio::time::sleep(storage_time).await;
            debug!("user task storage time expired");
            store.set_active_user_tasks(Vec::new());
        });

        if let Some(previous) = self
            .user_task_cleanup
            .lock()
            .expect("cleanup slot poisoned")
            .replace(cleanup)
        {
            previous.abort();
        }
    }

    // --- instance scopes ---

    pub fn poll_instance_info(&self, definition_id: &str, instance_id: &str) {
        if let Some(pending) = self
            .instance_cleanups
            .lock()
            .expect("cleanup map poisoned")
            .remove(instance_id)
        {
            pending.abort();
        }

        let mut scopes = self.instance_scopes.lock().expect("instance scopes poisoned");
        if scopes.contains_key(instance_id) {
            return;
        }

        let api = Arc::clone(&self.api);
        let store = Arc::clone(&self.store);
        let producer_definition_id = definition_id.to_string();
        let producer_instance_id = instance_id.to_string();
        let producer = move || {
            let api = Arc::clone(&api);
            let store = Arc::clone(&store);
            let definition_id = producer_definition_id.clone();
            let instance_id = producer_instance_id.clone();
            async move {
                instance_cycle(api, &store, &definition_id, &instance_id)
                    .await
                    .map_err(anyhow::Error::from)
            }
        };

        let store = Arc::clone(&self.store);
        let consumer = move |merged: Option<Instance>| {
            if let Some(instance) = merged {
                store.update_instance(instance);
            }
        };

        scopes.insert(
            instance_id.to_string(),
            InstanceScope {
                definition_id: definition_id.to_string(),
                handler: Arc::new(PollingHandler::new(
                    producer,
                    self.config().instance_interval(),
                    consumer,
                )),
            },
        );
    }

    pub fn stop_polling_instance_info(&self, instance_id: &str) {
        let scope = self
            .instance_scopes
            .lock()
            .expect("instance scopes poisoned")
            .remove(instance_id);
        let Some(scope) = scope else {
            return;
        };
        scope.handler.stop_polling();

        let store = Arc::clone(&self.store);
        let catalog = Arc::clone(&self.catalog);
        let storage_time = self.config().instance_storage();
        let definition_id = scope.definition_id;
        let cleanup_instance_id = instance_id.to_string();
        let cleanup = tokio::spawn(async move {
            tokio::time::sleep(storage_time).await;
            if !catalog.is_project(&definition_id) {
                debug!(instance_id = %cleanup_instance_id, "instance storage time expired");
                store.remove_instance(&cleanup_instance_id);
            }
        });

        if let Some(previous) = self
            .instance_cleanups
            .lock()
            .expect("cleanup map poisoned")
            .insert(instance_id.to_string(), cleanup)
        {
            previous.abort();
        }
    }

    /// Resolves once a fresh cycle for the instance landed in the store.
    /// Without an active subscription the instance's deployment must already
    /// be known so the hosting machines can be determined.
    pub async fn immediate_instance_info_request(&self, instance_id: &str) {
        let scope = self
            .instance_scopes
            .lock()
            .expect("instance scopes poisoned")
            .get(instance_id)
            .map(|scope| (scope.definition_id.clone(), Arc::clone(&scope.handler)));

        match scope {
            Some((_, handler)) => handler.skip_waiting().await,
            None => {
                let Some(definition_id) = self.find_definition_id(instance_id) else {
                    debug!(instance_id, "no known deployment hosts this instance");
                    return;
                };
                match instance_cycle(
                    Arc::clone(&self.api),
                    &self.store,
                    &definition_id,
                    instance_id,
                )
                .await
                {
                    Ok(Some(instance)) => self.store.update_instance(instance),
                    Ok(None) => {}
                    Err(err) => debug!(instance_id, error = %err, "instance request failed"),
                }
            }
        }
    }

    fn find_definition_id(&self, instance_id: &str) -> Option<String> {
        if let Some(instance) = self.store.instance(instance_id) {
            return Some(instance.definition_id);
        }
        self.store
            .deployments()
            .into_iter()
            .find(|(_, deployment)| deployment.instances.contains_key(instance_id))
            .map(|(definition_id, _)| definition_id)
    }
}

impl Drop for PollingManager {
    fn drop(&mut self) {
        for cleanup in self
            .instance_cleanups
            .lock()
            .expect("cleanup map poisoned")
            .drain()
        {
            cleanup.1.abort();
        }
        if let Some(cleanup) = self.deployment_cleanup.lock().expect("cleanup slot poisoned").take() {
            cleanup.abort();
        }
        if let Some(cleanup) = self.user_task_cleanup.lock().expect("cleanup slot poisoned").take() {
            cleanup.abort();
        }
    }
}

async fn deployment_cycle(
    registry: &MachineRegistry,
    api: Arc<dyn EngineApi>,
    store: &ReconciliationStore,
) -> DeploymentMergeOutcome {
    let reports = fetch_deployments(registry, api).await;
    merge_deployments(&store.deployments(), &reports, &registry.known_ids())
}

async fn instance_cycle(
    api: Arc<dyn EngineApi>,
    store: &ReconciliationStore,
    definition_id: &str,
    instance_id: &str,
) -> Result<Option<Instance>, crate::error::MergeError> {
    let machines = hosting_machines(store, definition_id, instance_id);
    let snapshots = fetch_instance_information(machines, api, definition_id, instance_id).await;
    merge_instance_information(store.instance(instance_id), snapshots, definition_id)
}

/// The machines the instance is currently known to run on, per the latest
/// merged deployment information.
fn hosting_machines(
    store: &ReconciliationStore,
    definition_id: &str,
    instance_id: &str,
) -> Vec<Machine> {
    let Some(deployment) = store.deployment(definition_id) else {
        return Vec::new();
    };
    let Some(summary) = deployment.instances.get(instance_id) else {
        return Vec::new();
    };
    deployment
        .machines
        .iter()
        .filter(|machine| summary.machines.contains(&machine.id))
        .cloned()
        .collect()
}
