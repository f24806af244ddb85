//! User task reconciliation: the combined list of user tasks that are
//! currently awaiting human input somewhere in the fleet.

use std::sync::Arc;
use tracing::info;

use crate::client::EngineApi;
use crate::machines::MachineRegistry;
use crate::model::ActiveUserTask;

/// One machine's successfully polled task list, forms included.
///
/// A machine only produces a report if the task list and every form request
/// succeeded; a partial task list would misreport which tasks are still
/// awaiting input.
#[derive(Clone, Debug)]
pub struct MachineUserTasks {
    pub machine_id: String,
    pub tasks: Vec<ActiveUserTask>,
}

/// Requests the active user tasks of every connected machine, including the
/// rendered form html per task.
pub async fn fetch_active_user_tasks(
    registry: &MachineRegistry,
    api: Arc<dyn EngineApi>,
) -> Vec<MachineUserTasks> {
    let mut handles = Vec::new();
    for machine in registry.connected_machines() {
        let api = Arc::clone(&api);
        handles.push(tokio::spawn(async move {
            let reported = match api.get_active_user_tasks(&machine).await {
                Ok(tasks) => tasks,
                Err(err) => {
                    info!(
                        machine = %machine.display_name(),
                        error = %err,
                        "could not request user task list"
                    );
                    return None;
                }
            };

            let mut tasks = Vec::with_capacity(reported.len());
            for task in reported {
                match api
                    .get_active_user_task_html(&machine, &task.instance_id, &task.id, task.start_time)
                    .await
                {
                    Ok(html) => tasks.push(ActiveUserTask {
                        id: task.id,
                        instance_id: task.instance_id,
                        machine_id: machine.id.clone(),
                        start_time: task.start_time,
                        state: task.state,
                        html,
                    }),
                    Err(err) => {
                        info!(
                            machine = %machine.display_name(),
                            task_id = %task.id,
                            error = %err,
                            "could not request user task form"
                        );
                        return None;
                    }
                }
            }

            Some(MachineUserTasks {
                machine_id: machine.id,
                tasks,
            })
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

/// Merges the reported task lists into the stored list.
///
/// Tasks are identified by instance id plus task id. A reported task
/// replaces its stored counterpart wholesale so form updates and state
/// changes come through. Afterwards only tasks present in the latest
/// combined poll result survive: a task no machine reports anymore is
/// gone, there is no staleness tolerance at this layer.
pub fn merge_active_user_tasks(
    stored: &[ActiveUserTask],
    reports: &[MachineUserTasks],
) -> Vec<ActiveUserTask> {
    let mut merged: Vec<ActiveUserTask> = stored.to_vec();

    for report in reports {
        for task in &report.tasks {
            if let Some(existing) = merged
                .iter_mut()
                .find(|t| t.instance_id == task.instance_id && t.id == task.id)
            {
                *existing = task.clone();
            } else {
                merged.push(task.clone());
            }
        }
    }

    merged.retain(|task| {
        reports.iter().any(|report| {
            report
                .tasks
                .iter()
                .any(|t| t.instance_id == task.instance_id && t.id == task.id)
        })
    });

    merged
}
