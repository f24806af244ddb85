//! Catalog of locally known process definitions.
//!
//! The catalog answers one question for the polling lifecycle: is this
//! definition owned by a project here? Project-owned scopes survive the
//! cleanup timers and get persisted. It also tracks the per-instance
//! adaptation definitions that instance adaptations register under
//! `{definitionId}-instance-{instanceId}` ids.

use dashmap::DashMap;
use serde::{Deserialize, Serialize};

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum ProcessKind {
    Process,
    Project,
}

pub struct ProcessCatalog {
    entries: DashMap<String, ProcessKind>,
}

impl ProcessCatalog {
    pub fn new() -> Self {
        ProcessCatalog {
            entries: DashMap::new(),
        }
    }

    pub fn register(&self, definition_id: impl Into<String>, kind: ProcessKind) {
        self.entries.insert(definition_id.into(), kind);
    }

    pub fn remove(&self, definition_id: &str) {
        self.entries.remove(definition_id);
    }

    pub fn kind(&self, definition_id: &str) -> Option<ProcessKind> {
        self.entries.get(definition_id).map(|entry| *entry.value())
    }

    pub fn is_project(&self, definition_id: &str) -> bool {
        self.kind(definition_id) == Some(ProcessKind::Project)
    }

    /// Drops the adaptation definitions that instances of the given
    /// deployment registered. Called when the deployment disappears from the
    /// whole fleet; the adapted definitions are meaningless without it.
    pub fn remove_instance_adaptations(&self, definition_id: &str) -> Vec<String> {
        let prefix = format!("{definition_id}-instance-");
        let adapted: Vec<String> = self
            .entries
            .iter()
            .filter(|entry| entry.key().starts_with(&prefix))
            .map(|entry| entry.key().clone())
            .collect();
        for id in &adapted {
            self.entries.remove(id);
        }
        adapted
    }
}

impl Default for ProcessCatalog {
    fn default() -> Self {
        Self::new()
    }
}
