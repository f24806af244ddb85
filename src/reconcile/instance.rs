//! Instance reconciliation: consolidated execution detail for one instance
//! from the snapshots of every machine it runs on.

use std::sync::Arc;
use tracing::info;

use crate::client::EngineApi;
use crate::error::MergeError;
use crate::machines::Machine;
use crate::model::{
    AdaptationKind, ExecutionState, Instance, InstanceSnapshot, Token,
};
use super::merge_unique_by;

/// Requests the instance detail from every machine the instance is known to
/// run on. Tokens in the returned snapshots are tagged with the reporting
/// machine's id; unreachable machines are logged and skipped.
pub async fn fetch_instance_information(
    machines: Vec<Machine>,
    api: Arc<dyn EngineApi>,
    definition_id: &str,
    instance_id: &str,
) -> Vec<InstanceSnapshot> {
    let mut handles = Vec::new();
    for machine in machines {
        let api = Arc::clone(&api);
        let definition_id = definition_id.to_string();
        let instance_id = instance_id.to_string();
        handles.push(tokio::spawn(async move {
            match api
                .get_instance_information(&machine, &definition_id, &instance_id)
                .await
            {
                Ok(mut snapshot) => {
                    for token in &mut snapshot.tokens {
                        token.machine_id = machine.id.clone();
                    }
                    Some(snapshot)
                }
                Err(err) => {
                    info!(
                        machine = %machine.display_name(),
                        instance_id,
                        error = %err,
                        "could not request instance information"
                    );
                    None
                }
            }
        }));
    }

    let mut snapshots = Vec::new();
    for handle in handles {
        if let Ok(Some(snapshot)) = handle.await {
            snapshots.push(snapshot);
        }
    }
    snapshots
}

/// Merges the machine snapshots of one instance into the stored consolidated
/// instance.
///
/// With no snapshots at all (every machine unreachable) the stored instance
/// is returned untouched. The instance state is overridden when any machine
/// reports a stop or pause, otherwise it is the deduplicated union of the
/// merged token states.
pub fn merge_instance_information(
    stored: Option<Instance>,
    snapshots: Vec<InstanceSnapshot>,
    definition_id: &str,
) -> Result<Option<Instance>, MergeError> {
    if snapshots.is_empty() {
        return Ok(stored);
    }

    let has_stopped = reports_state(&snapshots, ExecutionState::Stopped);
    let has_pausing = reports_state(&snapshots, ExecutionState::Pausing);
    let has_paused = reports_state(&snapshots, ExecutionState::Paused);

    let mut merged: Option<Instance> = stored;
    for snapshot in snapshots {
        match merged.as_mut() {
            None => merged = Some(Instance::from_snapshot(definition_id, snapshot)),
            Some(instance) => merge_snapshot(instance, snapshot)?,
        }
    }

    let mut instance = merged.ok_or_else(|| {
        MergeError::Invariant("non-empty snapshot list produced no instance".to_string())
    })?;

    prune_removed_tokens(&mut instance);

    instance.log.sort_by_key(|entry| entry.end_time);
    instance.adaptation_log.sort_by_key(|entry| entry.time);
    for variable in instance.variables.values_mut() {
        variable.log.sort_by_key(|change| change.changed_time);
    }

    instance.instance_state = if has_stopped {
        vec![ExecutionState::Stopped]
    } else if has_pausing {
        vec![ExecutionState::Pausing]
    } else if has_paused {
        vec![ExecutionState::Paused]
    } else {
        let mut states: Vec<ExecutionState> = Vec::new();
        for token in &instance.tokens {
            if !states.contains(&token.state) {
                states.push(token.state);
            }
        }
        states.sort();
        states
    };

    Ok(Some(instance))
}

fn reports_state(snapshots: &[InstanceSnapshot], state: ExecutionState) -> bool {
    snapshots
        .iter()
        .any(|snapshot| snapshot.instance_state.contains(&state))
}

fn merge_snapshot(instance: &mut Instance, snapshot: InstanceSnapshot) -> Result<(), MergeError> {
    instance.process_version = snapshot.process_version;

    merge_unique_by(&mut instance.log, snapshot.log, |entry| {
        (entry.token_id.clone(), entry.end_time)
    });

    merge_unique_by(&mut instance.adaptation_log, snapshot.adaptation_log, |entry| {
        (entry.token_id.clone(), entry.time)
    });

    for (name, incoming) in snapshot.variables {
        match instance.variables.get_mut(&name) {
            None => {
                instance.variables.insert(name, incoming);
            }
            Some(stored) => {
                let stored_latest = latest_change(&stored.log, &name)?;
                let incoming_latest = latest_change(&incoming.log, &name)?;
                // on a tie the stored value stays
                if incoming_latest > stored_latest {
                    stored.value = incoming.value;
                }
                merge_unique_by(&mut stored.log, incoming.log, |change| {
                    (change.changed_by.clone(), change.changed_time)
                });
            }
        }
    }

    for incoming in snapshot.tokens {
        merge_token(&mut instance.tokens, incoming);
    }

    Ok(())
}

fn latest_change(
    log: &[crate::model::VariableChange],
    variable: &str,
) -> Result<u64, MergeError> {
    log.iter()
        .map(|change| change.changed_time)
        .max()
        .ok_or_else(|| {
            MergeError::Invariant(format!("variable {variable} has an empty change log"))
        })
}

/// Folds one reported token into the stored token list.
///
/// A stored token related by lineage is replaced when the incoming token has
/// seen at least as many machine hops; with fewer hops the incoming token is
/// the stale one and is dropped. Unrelated tokens coexist.
fn merge_token(tokens: &mut Vec<Token>, incoming: Token) {
    let mut any_related = false;
    let mut any_replaced = false;

    tokens.retain(|stored| {
        if incoming.token_id.shares_lineage_with(&stored.token_id) {
            any_related = true;
            if stored.machine_hops <= incoming.machine_hops {
                any_replaced = true;
                return false;
            }
        }
        true
    });

    if !any_related || any_replaced {
        tokens.push(incoming);
    }
}

/// Tokens that a TOKEN-REMOVE adaptation names must not survive the merge;
/// the machine that executed the removal no longer reports them, but a
/// machine that only holds a forwarded copy still might.
fn prune_removed_tokens(instance: &mut Instance) {
    let removed: Vec<_> = instance
        .adaptation_log
        .iter()
        .filter(|entry| entry.kind == AdaptationKind::TokenRemove)
        .filter_map(|entry| entry.token_id.clone())
        .collect();

    instance
        .tokens
        .retain(|token| !removed.contains(&token.token_id));
}
