use overseer::catalog::{ProcessCatalog, ProcessKind};
use overseer::config::Config;
use overseer::machines::Machine;
use overseer::model::{Deployment, InstanceSummary, Needs, Version, VersionMachine};
use overseer::persistence::{load_snapshot, save_snapshot};
use overseer::store::ReconciliationStore;
use std::fs;
use std::time::Duration;
use tempfile::tempdir;

#[test]
fn test_config_loads_from_yaml() {
    let dir = tempdir().expect("tempdir failed");
    let path = dir.path().join("config.yaml");
    fs::write(
        &path,
        "deploymentsPollingInterval: 30\ninstanceStorageTime: 120\n",
    )
    .expect("writing config failed");

    let config = Config::load(&path).expect("loading config failed");

    assert_eq!(config.deployments_interval(), Duration::from_secs(30));
    assert_eq!(config.instance_storage(), Duration::from_secs(120));
    // unspecified values fall back to the defaults
    assert_eq!(
        config.instance_polling_interval,
        Config::default().instance_polling_interval
    );
}

#[test]
fn test_config_rejects_malformed_yaml() {
    let dir = tempdir().expect("tempdir failed");
    let path = dir.path().join("config.yaml");
    fs::write(&path, "deploymentsPollingInterval: [oops\n").expect("writing config failed");

    assert!(Config::load(&path).is_err());
}

fn project_deployment(definition_id: &str) -> Deployment {
    let mut deployment = Deployment::new(definition_id);
    deployment.machines.push(Machine::new("m1", "192.168.1.10", 33029));
    deployment.versions.push(Version {
        version: 1,
        version_name: "initial".to_string(),
        version_description: String::new(),
        bpmn: "<definitions/>".to_string(),
        machines: vec![VersionMachine {
            machine_id: "m1".to_string(),
            deployment_date: 1000,
            needs: Needs::default(),
        }],
    });
    deployment.instances.insert(
        "i1".to_string(),
        InstanceSummary {
            process_instance_id: "i1".to_string(),
            process_version: 1,
            global_start_time: 5000,
            machines: vec!["m1".to_string()],
        },
    );
    deployment
        .running_instances
        .insert("i1".to_string(), vec!["m1".to_string()]);
    deployment
}

#[test]
fn test_snapshot_round_trip_keeps_projects_only() {
    let dir = tempdir().expect("tempdir failed");
    let path = dir.path().join("deployments.json");

    let store = ReconciliationStore::new();
    store.seed_deployment(project_deployment("proj1"));
    store.seed_deployment(project_deployment("d1"));

    let catalog = ProcessCatalog::new();
    catalog.register("proj1", ProcessKind::Project);
    catalog.register("d1", ProcessKind::Process);

    save_snapshot(&path, &store, &catalog).expect("saving snapshot failed");

    let restored = ReconciliationStore::new();
    load_snapshot(&path, &restored).expect("loading snapshot failed");

    let deployments = restored.deployments();
    assert_eq!(deployments.len(), 1);
    let deployment = &deployments["proj1"];

    // machine membership is runtime knowledge and must not be restored
    assert!(deployment.machines.is_empty());
    assert!(deployment.running_instances.is_empty());
    assert!(deployment.instances["i1"].machines.is_empty());
    assert!(deployment.versions[0].machines.is_empty());

    // the definition data itself survives
    assert_eq!(deployment.versions[0].bpmn, "<definitions/>");
    assert_eq!(deployment.instances["i1"].global_start_time, 5000);
}

#[test]
fn test_loading_a_missing_snapshot_is_a_fresh_start() {
    let dir = tempdir().expect("tempdir failed");
    let store = ReconciliationStore::new();

    load_snapshot(&dir.path().join("missing.json"), &store).expect("missing file should be fine");

    assert!(store.deployments().is_empty());
}

#[test]
fn test_catalog_instance_adaptations_are_removed_with_prefix() {
    let catalog = ProcessCatalog::new();
    catalog.register("d1", ProcessKind::Process);
    catalog.register("d1-instance-i1", ProcessKind::Process);
    catalog.register("d1-instance-i2", ProcessKind::Process);
    catalog.register("d2-instance-i1", ProcessKind::Process);

    let mut removed = catalog.remove_instance_adaptations("d1");
    removed.sort();

    assert_eq!(
        removed,
        vec!["d1-instance-i1".to_string(), "d1-instance-i2".to_string()]
    );
    assert!(catalog.kind("d1").is_some());
    assert!(catalog.kind("d2-instance-i1").is_some());
    assert!(catalog.kind("d1-instance-i1").is_none());
}
