use async_trait::async_trait;
use overseer::catalog::{ProcessCatalog, ProcessKind};
use overseer::client::EngineApi;
use overseer::config::Config;
use overseer::error::ClientError;
use overseer::machines::{Machine, MachinePatch, MachineRegistry};
use overseer::manager::PollingManager;
use overseer::model::{
    DeployedProcess, ExecutionState, InstanceSnapshot, Needs, ReportedInstance, ReportedUserTask,
    ReportedVersion, Token, TokenId,
};
use overseer::store::ReconciliationStore;
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

/// Scripted engine: every machine id maps to fixed responses.
#[derive(Default)]
struct ScriptedEngine {
    deployments: Mutex<HashMap<String, Vec<DeployedProcess>>>,
    instances: Mutex<HashMap<String, InstanceSnapshot>>,
    user_tasks: Mutex<HashMap<String, Vec<ReportedUserTask>>>,
    response_delay: Option<Duration>,
}

impl ScriptedEngine {
    fn set_deployments(&self, machine_id: &str, deployments: Vec<DeployedProcess>) {
        self.deployments
            .lock()
            .unwrap()
            .insert(machine_id.to_string(), deployments);
    }

    fn set_instance(&self, machine_id: &str, snapshot: InstanceSnapshot) {
        self.instances
            .lock()
            .unwrap()
            .insert(machine_id.to_string(), snapshot);
    }

    fn set_user_tasks(&self, machine_id: &str, tasks: Vec<ReportedUserTask>) {
        self.user_tasks
            .lock()
            .unwrap()
            .insert(machine_id.to_string(), tasks);
    }

    async fn delay(&self) {
        if let Some(delay) = self.response_delay {
            tokio::time::sleep(delay).await;
        }
    }
}

#[async_trait]
impl EngineApi for ScriptedEngine {
    async fn get_status(&self, _machine: &Machine) -> Result<bool, ClientError> {
        Ok(true)
    }

    async fn get_deployed_processes(
        &self,
        machine: &Machine,
        _entries: Option<&str>,
    ) -> Result<Vec<DeployedProcess>, ClientError> {
        self.delay().await;
        self.deployments
            .lock()
            .unwrap()
            .get(&machine.id)
            .cloned()
            .ok_or_else(|| ClientError::Unreachable {
                machine: machine.id.clone(),
            })
    }

    async fn get_instance_information(
        &self,
        machine: &Machine,
        _definition_id: &str,
        _instance_id: &str,
    ) -> Result<InstanceSnapshot, ClientError> {
        self.delay().await;
        self.instances
            .lock()
            .unwrap()
            .get(&machine.id)
            .cloned()
            .ok_or_else(|| ClientError::Unreachable {
                machine: machine.id.clone(),
            })
    }

    async fn get_active_user_tasks(
        &self,
        machine: &Machine,
    ) -> Result<Vec<ReportedUserTask>, ClientError> {
        self.delay().await;
        self.user_tasks
            .lock()
            .unwrap()
            .get(&machine.id)
            .cloned()
            .ok_or_else(|| ClientError::Unreachable {
                machine: machine.id.clone(),
            })
    }

    async fn get_active_user_task_html(
        &self,
        _machine: &Machine,
        instance_id: &str,
        task_id: &str,
        _start_time: u64,
    ) -> Result<String, ClientError> {
        Ok(format!("<form id=\"{task_id}\" data-instance=\"{instance_id}\"/>"))
    }
}

fn discovered(id: &str, last_octet: u8) -> Machine {
    Machine::new(id, format!("192.168.1.{last_octet}"), 33029)
}

fn deployed(definition_id: &str, instances: Vec<ReportedInstance>) -> DeployedProcess {
    DeployedProcess {
        definition_id: definition_id.to_string(),
        versions: vec![ReportedVersion {
            version: 1,
            version_name: "initial".to_string(),
            version_description: String::new(),
            deployment_date: 1000,
            bpmn: "<definitions/>".to_string(),
            needs: Needs::default(),
        }],
        instances,
    }
}

fn running_instance(id: &str) -> ReportedInstance {
    ReportedInstance {
        process_instance_id: id.to_string(),
        process_version: 1,
        global_start_time: 5000,
        instance_state: vec![ExecutionState::Running],
    }
}

fn snapshot(instance_id: &str, token_id: &str, hops: u32) -> InstanceSnapshot {
    InstanceSnapshot {
        process_instance_id: instance_id.to_string(),
        process_version: 1,
        instance_state: vec![ExecutionState::Running],
        tokens: vec![Token {
            token_id: TokenId::from(token_id),
            state: ExecutionState::Running,
            machine_id: String::new(),
            machine_hops: hops,
        }],
        log: Vec::new(),
        adaptation_log: Vec::new(),
        variables: HashMap::new(),
    }
}

struct Fixture {
    registry: Arc<MachineRegistry>,
    engine: Arc<ScriptedEngine>,
    store: Arc<ReconciliationStore>,
    catalog: Arc<ProcessCatalog>,
    manager: PollingManager,
}

fn fixture_with(engine: ScriptedEngine, config: Config) -> Fixture {
    let registry = Arc::new(MachineRegistry::new());
    let engine = Arc::new(engine);
    let store = Arc::new(ReconciliationStore::new());
    let catalog = Arc::new(ProcessCatalog::new());
    let manager = PollingManager::new(
        Arc::clone(&registry),
        Arc::clone(&engine) as Arc<dyn EngineApi>,
        Arc::clone(&store),
        Arc::clone(&catalog),
        config,
    );
    Fixture {
        registry,
        engine,
        store,
        catalog,
        manager,
    }
}

fn fixture() -> Fixture {
    fixture_with(ScriptedEngine::default(), Config::default())
}

#[tokio::test]
async fn test_immediate_request_merges_the_fleet_state() {
    let f = fixture();
    f.registry.add_machine(discovered("m1", 10), true);
    f.registry.add_machine(discovered("m2", 11), true);
    f.engine
        .set_deployments("m1", vec![deployed("d1", vec![running_instance("i1")])]);
    f.engine
        .set_deployments("m2", vec![deployed("d1", vec![running_instance("i1")])]);

    f.manager.immediate_deployment_info_request().await;

    let deployment = f.store.deployment("d1").expect("deployment missing");
    assert_eq!(deployment.machines.len(), 2);
    assert_eq!(
        deployment.running_instances["i1"],
        vec!["m1".to_string(), "m2".to_string()]
    );
}

#[tokio::test]
async fn test_stopping_discards_the_in_flight_cycle() {
    let f = fixture_with(
        ScriptedEngine {
            response_delay: Some(Duration::from_millis(100)),
            ..Default::default()
        },
        Config::default(),
    );
    f.registry.add_machine(discovered("m1", 10), true);
    f.engine
        .set_deployments("m1", vec![deployed("d1", vec![])]);

    f.manager.poll_deployment_info();
    // the first cycle is still waiting on the engine when we stop
    tokio::time::sleep(Duration::from_millis(20)).await;
    f.manager.stop_polling_deployment_info();

    tokio::time::sleep(Duration::from_millis(300)).await;
    assert!(f.store.deployments().is_empty());
}

#[tokio::test]
async fn test_registry_removal_propagates_to_the_store() {
    let f = fixture();
    f.registry.add_machine(discovered("m1", 10), true);
    f.registry.add_machine(discovered("m2", 11), true);
    f.engine
        .set_deployments("m1", vec![deployed("d1", vec![])]);
    f.engine
        .set_deployments("m2", vec![deployed("d1", vec![])]);

    f.manager.immediate_deployment_info_request().await;
    assert_eq!(f.store.deployment("d1").unwrap().machines.len(), 2);

    // m2 leaves the registry entirely
    f.registry.update_machine(
        "m2",
        MachinePatch {
            saved: Some(false),
            discovered: Some(false),
            ..Default::default()
        },
    );
    f.engine.set_deployments("m1", vec![deployed("d1", vec![])]);

    f.manager.immediate_deployment_info_request().await;

    let deployment = f.store.deployment("d1").expect("deployment missing");
    assert_eq!(deployment.machines.len(), 1);
    assert_eq!(deployment.machines[0].id, "m1");
}

#[tokio::test]
async fn test_cleanup_spares_project_owned_deployments() {
    let config = Config {
        deployment_storage_time: 0,
        ..Config::default()
    };
    let f = fixture_with(ScriptedEngine::default(), config);
    f.registry.add_machine(discovered("m1", 10), true);
    f.engine.set_deployments(
        "m1",
        vec![deployed("d1", vec![]), deployed("proj1", vec![])],
    );
    f.catalog.register("proj1", ProcessKind::Project);

    f.manager.poll_deployment_info();
    f.manager.immediate_deployment_info_request().await;
    assert_eq!(f.store.deployments().len(), 2);

    f.manager.stop_polling_deployment_info();
    tokio::time::sleep(Duration::from_millis(100)).await;

    assert!(f.store.deployment("d1").is_none());
    assert!(f.store.deployment("proj1").is_some());
}

#[tokio::test]
async fn test_restarting_polling_cancels_the_pending_cleanup() {
    let config = Config {
        deployment_storage_time: 1,
        ..Config::default()
    };
    let f = fixture_with(ScriptedEngine::default(), config);
    f.registry.add_machine(discovered("m1", 10), true);
    f.engine.set_deployments("m1", vec![deployed("d1", vec![])]);

    f.manager.poll_deployment_info();
    f.manager.immediate_deployment_info_request().await;
    f.manager.stop_polling_deployment_info();

    // resubscribing before the storage time expires keeps the state
    f.manager.poll_deployment_info();
    tokio::time::sleep(Duration::from_millis(1200)).await;

    assert!(f.store.deployment("d1").is_some());
    f.manager.stop_polling_deployment_info();
}

#[tokio::test]
async fn test_instance_detail_is_merged_across_machines() {
    let f = fixture();
    f.registry.add_machine(discovered("m1", 10), true);
    f.registry.add_machine(discovered("m2", 11), true);
    f.engine
        .set_deployments("m1", vec![deployed("d1", vec![running_instance("i1")])]);
    f.engine
        .set_deployments("m2", vec![deployed("d1", vec![running_instance("i1")])]);
    f.engine.set_instance("m1", snapshot("i1", "a", 0));
    f.engine.set_instance("m2", snapshot("i1", "b", 0));

    f.manager.immediate_deployment_info_request().await;
    f.manager.immediate_instance_info_request("i1").await;

    let instance = f.store.instance("i1").expect("instance missing");
    assert_eq!(instance.definition_id, "d1");
    assert_eq!(instance.tokens.len(), 2);
    // tokens carry the id of the machine that reported them
    let mut owners: Vec<&str> = instance.tokens.iter().map(|t| t.machine_id.as_str()).collect();
    owners.sort();
    assert_eq!(owners, vec!["m1", "m2"]);
}

#[tokio::test]
async fn test_instance_polling_delivers_updates() {
    let f = fixture();
    f.registry.add_machine(discovered("m1", 10), true);
    f.engine
        .set_deployments("m1", vec![deployed("d1", vec![running_instance("i1")])]);
    f.engine.set_instance("m1", snapshot("i1", "a", 0));

    f.manager.immediate_deployment_info_request().await;
    f.manager.poll_instance_info("d1", "i1");
    f.manager.immediate_instance_info_request("i1").await;
    assert!(f.store.instance("i1").is_some());

    // the token moves on, the poller picks it up
    f.engine.set_instance("m1", snapshot("i1", "a|1", 0));
    f.manager.immediate_instance_info_request("i1").await;

    let instance = f.store.instance("i1").expect("instance missing");
    assert_eq!(instance.tokens.len(), 1);
    assert_eq!(instance.tokens[0].token_id.as_str(), "a|1");

    f.manager.stop_polling_instance_info("i1");
}

#[tokio::test]
async fn test_user_tasks_are_polled_with_their_forms() {
    let f = fixture();
    f.registry.add_machine(discovered("m1", 10), true);
    f.engine.set_user_tasks(
        "m1",
        vec![ReportedUserTask {
            id: "t1".to_string(),
            instance_id: "i1".to_string(),
            start_time: 1000,
            state: Some("READY".to_string()),
        }],
    );

    f.manager.poll_active_user_tasks();
    tokio::time::timeout(Duration::from_secs(5), async {
        while f.store.active_user_tasks().is_empty() {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    })
    .await
    .expect("user tasks never appeared");

    let tasks = f.store.active_user_tasks();
    assert_eq!(tasks.len(), 1);
    assert_eq!(tasks[0].machine_id, "m1");
    assert!(tasks[0].html.contains("t1"));

    f.manager.stop_polling_active_user_tasks();
}
