//! Registry of known machines.
//!
//! Machines enter the registry either because a user added them or because
//! broadcast discovery announced them. Both sources can describe the same
//! physical machine, so additions are matched and merged instead of blindly
//! inserted. A machine that is neither saved nor discovered anymore is
//! removed.

use std::collections::HashMap;
use std::sync::Mutex;
use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;
use tracing::{debug, info};

use crate::client::EngineApi;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING-KEBAB-CASE")]
pub enum MachineStatus {
    Connected,
    Disconnected,
}

/// A remote host running a process-execution engine.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Machine {
    pub id: String,
    #[serde(default)]
    pub ip: Option<String>,
    #[serde(default)]
    pub hostname: Option<String>,
    pub port: u16,
    #[serde(default)]
    pub optional_name: Option<String>,
    pub status: MachineStatus,
    /// The machine was added by a user and is kept in the backend store.
    #[serde(default)]
    pub saved: bool,
    /// The machine was found via broadcast discovery.
    #[serde(default)]
    pub discovered: bool,
}

impl Machine {
    pub fn new(id: impl Into<String>, ip: impl Into<String>, port: u16) -> Self {
        Machine {
            id: id.into(),
            ip: Some(ip.into()),
            hostname: None,
            port,
            optional_name: None,
            status: MachineStatus::Disconnected,
            saved: false,
            discovered: false,
        }
    }

    /// Hostname, ip or id; whatever identifies the machine best in a log line.
    pub fn display_name(&self) -> &str {
        self.optional_name
            .as_deref()
            .or(self.hostname.as_deref())
            .or(self.ip.as_deref())
            .unwrap_or(&self.id)
    }
}

/// Partial update for a known machine. `None` fields are left untouched.
#[derive(Clone, Debug, Default)]
pub struct MachinePatch {
    pub id: Option<String>,
    pub ip: Option<Option<String>>,
    pub hostname: Option<Option<String>>,
    pub port: Option<u16>,
    pub optional_name: Option<Option<String>>,
    pub status: Option<MachineStatus>,
    pub saved: Option<bool>,
    pub discovered: Option<bool>,
}

impl MachinePatch {
    pub fn status(status: MachineStatus) -> Self {
        MachinePatch {
            status: Some(status),
            ..Default::default()
        }
    }

    fn apply(&self, machine: &mut Machine) {
        if let Some(id) = &self.id {
            machine.id = id.clone();
        }
        if let Some(ip) = &self.ip {
            machine.ip = ip.clone();
        }
        if let Some(hostname) = &self.hostname {
            machine.hostname = hostname.clone();
        }
        if let Some(port) = self.port {
            machine.port = port;
        }
        if let Some(name) = &self.optional_name {
            machine.optional_name = name.clone();
        }
        if let Some(status) = self.status {
            machine.status = status;
        }
        if let Some(saved) = self.saved {
            machine.saved = saved;
        }
        if let Some(discovered) = self.discovered {
            machine.discovered = discovered;
        }
    }
}

#[derive(Clone, Debug)]
pub enum MachineEvent {
    Added(Machine),
    Updated(Machine),
    Removed { machine_id: String },
}

/// Tracks all known machines, merged between user-added and discovered ones.
pub struct MachineRegistry {
    known: Mutex<HashMap<String, Machine>>,
    events: broadcast::Sender<MachineEvent>,
}

impl MachineRegistry {
    pub fn new() -> Self {
        let (events, _) = broadcast::channel(64);
        MachineRegistry {
            known: Mutex::new(HashMap::new()),
            events,
        }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<MachineEvent> {
        self.events.subscribe()
    }

    /// Finds a known machine that matches the given one in some way:
    /// same id, same network address while one side lacks a hostname, same
    /// hostname while one side lacks an ip, or identical identifying
    /// information under a different id.
    fn find_matching_id(known: &HashMap<String, Machine>, machine: &Machine) -> Option<String> {
        known.values().find_map(|candidate| {
            let id_match = candidate.id == machine.id;

            let network_match = candidate.ip == machine.ip
                && candidate.port == machine.port
                && (candidate.hostname.is_none() || machine.hostname.is_none());

            let hostname_match = candidate.hostname == machine.hostname
                && (candidate.ip.is_none() || machine.ip.is_none());

            let same_info_diff_id = candidate.hostname == machine.hostname
                && candidate.ip == machine.ip
                && candidate.port == machine.port;

            if id_match || network_match || hostname_match || same_info_diff_id {
                Some(candidate.id.clone())
            } else {
                None
            }
        })
    }

    /// Registers a machine coming from a user or from discovery.
    ///
    /// Discovered machines are expected to carry correct information, so
    /// their data overrides what is already known. User-submitted data does
    /// not override known data apart from the optional display name.
    pub fn add_machine(&self, mut added: Machine, from_discovery: bool) {
        if from_discovery {
            added.discovered = true;
            added.status = MachineStatus::Connected;
        } else {
            added.saved = true;
            added.status = MachineStatus::Disconnected;
        }

        let mut known = self.known.lock().expect("machine registry poisoned");

        if let Some(matching_id) = Self::find_matching_id(&known, &added) {
            let existing = known
                .get(&matching_id)
                .cloned()
                .expect("matching id points at a known machine");

            let merged = if from_discovery {
                let mut merged = added;
                merged.saved = existing.saved || merged.saved;
                if merged.optional_name.is_none() {
                    merged.optional_name = existing.optional_name;
                }
                merged
            } else {
                let mut merged = existing;
                merged.optional_name = added.optional_name;
                merged.saved = true;
                merged
            };

            let new_id = merged.id.clone();
            if new_id != matching_id {
                known.remove(&matching_id);
                let _ = self.events.send(MachineEvent::Removed {
                    machine_id: matching_id,
                });
            }
            known.insert(new_id, merged.clone());
            let _ = self.events.send(MachineEvent::Updated(merged));
        } else {
            info!(machine = %added.display_name(), "adding machine to registry");
            known.insert(added.id.clone(), added.clone());
            let _ = self.events.send(MachineEvent::Added(added));
        }
    }

    /// Applies a partial update to a known machine.
    ///
    /// The identity of a connected machine (ip, hostname, port, id) cannot be
    /// changed. A machine that ends up neither saved nor discovered is
    /// removed from the registry.
    pub fn update_machine(&self, machine_id: &str, mut patch: MachinePatch) {
        let mut known = self.known.lock().expect("machine registry poisoned");

        let Some(current) = known.get(machine_id).cloned() else {
            return;
        };

        if current.status == MachineStatus::Connected {
            patch.id = None;
            patch.ip = None;
            patch.hostname = None;
            patch.port = None;
        }

        let mut merged = current.clone();
        patch.apply(&mut merged);

        if merged == current {
            return;
        }

        if !merged.saved && !merged.discovered {
            known.remove(machine_id);
            debug!(machine_id, "machine neither saved nor discovered, removing");
            let _ = self.events.send(MachineEvent::Removed {
                machine_id: machine_id.to_string(),
            });
            return;
        }

        if merged.id != machine_id {
            known.remove(machine_id);
            // The new id may already be known, e.g. when discovery added the
            // machine under its real id while the user added it under a
            // provisional one. Collapse both into one entry.
            if known.contains_key(&merged.id) {
                let _ = self.events.send(MachineEvent::Removed {
                    machine_id: machine_id.to_string(),
                });
            }
        }
        known.insert(merged.id.clone(), merged.clone());
        let _ = self.events.send(MachineEvent::Updated(merged));
    }

    /// User-side removal: drops the saved flag; the machine disappears
    /// entirely unless discovery still sees it.
    pub fn remove_machine(&self, machine_id: &str) {
        self.update_machine(
            machine_id,
            MachinePatch {
                saved: Some(false),
                ..Default::default()
            },
        );
    }

    pub fn machines(&self) -> Vec<Machine> {
        self.known
            .lock()
            .expect("machine registry poisoned")
            .values()
            .cloned()
            .collect()
    }

    pub fn connected_machines(&self) -> Vec<Machine> {
        let mut machines: Vec<_> = self
            .machines()
            .into_iter()
            .filter(|m| m.status == MachineStatus::Connected)
            .collect();
        machines.sort_by(|a, b| a.id.cmp(&b.id));
        machines
    }

    pub fn known_ids(&self) -> Vec<String> {
        self.known
            .lock()
            .expect("machine registry poisoned")
            .keys()
            .cloned()
            .collect()
    }

    /// Probes every known machine and flips its connectivity status.
    pub async fn refresh_statuses(&self, api: &dyn EngineApi) {
        for machine in self.machines() {
            let status = match api.get_status(&machine).await {
                Ok(true) => MachineStatus::Connected,
                Ok(false) => MachineStatus::Disconnected,
                Err(err) => {
                    debug!(machine = %machine.display_name(), %err, "machine unreachable");
                    MachineStatus::Disconnected
                }
            };
            if status != machine.status {
                self.update_machine(&machine.id, MachinePatch::status(status));
            }
        }
    }
}

impl Default for MachineRegistry {
    fn default() -> Self {
        Self::new()
    }
}
