//! Shared data model for the reconciliation core.
//!
//! The wire structs in here mirror what the engines report (camelCase JSON),
//! the consolidated structs are what the store holds after merging the
//! per-machine partial views.

use std::collections::HashMap;
use std::fmt;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::machines::Machine;

/// Execution state of a token or instance.
///
/// The variant order is the display precedence: sorting a merged state list
/// with the derived `Ord` puts the most relevant state first.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING-KEBAB-CASE")]
pub enum ExecutionState {
    Stopped,
    Pausing,
    Paused,
    Running,
    Ready,
    Forwarded,
    DeploymentWaiting,
    Aborted,
    Failed,
    Terminated,
    ErrorSemantic,
    ErrorTechnical,
    ErrorConstraintUnfulfilled,
    Ended,
}

impl ExecutionState {
    /// States that indicate the instance is still being executed on a machine.
    pub fn is_running_marker(&self) -> bool {
        matches!(
            self,
            ExecutionState::Running
                | ExecutionState::Ready
                | ExecutionState::DeploymentWaiting
                | ExecutionState::Pausing
                | ExecutionState::Paused
        )
    }
}

/// Returns true if any of the given states marks the instance as still executing.
pub fn has_running_marker(states: &[ExecutionState]) -> bool {
    states.iter().any(ExecutionState::is_running_marker)
}

/// Identifier of a token inside an instance.
///
/// Engines encode token lineage into the id string: a token split at a
/// gateway gets ids of the form `parent|suffix`, tokens merged at a parallel
/// gateway get an id joining the merged ids with `_`, and tokens inside a
/// subprocess use `parent#suffix` (which does NOT relate them for merging).
/// The relation checks below keep those exact semantics.
#[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct TokenId(String);

impl TokenId {
    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// True if `self` was split off from `parent` at a gateway.
    pub fn is_gateway_child_of(&self, parent: &TokenId) -> bool {
        self.0.starts_with(&format!("{}|", parent.0))
    }

    /// True if `self` is the result of merging `other` with unrelated tokens
    /// at a parallel gateway.
    ///
    /// This is the substring check the engines rely on; it can in principle
    /// hit a false positive when one token id happens to be a substring of a
    /// `_`-joined id without actual merge lineage.
    pub fn is_merged_from(&self, other: &TokenId) -> bool {
        self.0.contains('_') && self.0.contains(other.as_str())
    }

    /// True if an incoming token with this id represents the same logical
    /// flow position as a stored token with id `stored`.
    ///
    /// Note the asymmetry: the merge check only looks at `self` (the
    /// incoming id), matching how hand-offs are reported.
    pub fn shares_lineage_with(&self, stored: &TokenId) -> bool {
        self == stored
            || self.is_gateway_child_of(stored)
            || stored.is_gateway_child_of(self)
            || self.is_merged_from(stored)
    }
}

impl From<&str> for TokenId {
    fn from(s: &str) -> Self {
        TokenId(s.to_string())
    }
}

impl From<String> for TokenId {
    fn from(s: String) -> Self {
        TokenId(s)
    }
}

impl fmt::Display for TokenId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

/// A unit of execution position inside an instance, as reported by one machine.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Token {
    pub token_id: TokenId,
    pub state: ExecutionState,
    /// Id of the machine the token currently lives on. Engines do not report
    /// this themselves; the instance reconciler tags it after fetching.
    #[serde(default)]
    pub machine_id: String,
    /// Number of times the token was forwarded between machines. Used as the
    /// recency tiebreaker when merging relocated tokens.
    #[serde(default)]
    pub machine_hops: u32,
}

/// One completed step in the execution history of an instance.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LogEntry {
    pub token_id: TokenId,
    pub start_time: u64,
    pub end_time: u64,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING-KEBAB-CASE")]
pub enum AdaptationKind {
    TokenMove,
    TokenAdd,
    TokenRemove,
    Migration,
}

/// A manual intervention into a running instance.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AdaptationLogEntry {
    #[serde(rename = "type")]
    pub kind: AdaptationKind,
    #[serde(default)]
    pub time: u64,
    #[serde(default)]
    pub token_id: Option<TokenId>,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct VariableChange {
    pub changed_by: String,
    pub changed_time: u64,
}

/// A process variable with its change history.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Variable {
    pub value: Value,
    pub log: Vec<VariableChange>,
}

/// Full instance detail as reported by a single machine.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct InstanceSnapshot {
    pub process_instance_id: String,
    pub process_version: u32,
    pub instance_state: Vec<ExecutionState>,
    pub tokens: Vec<Token>,
    pub log: Vec<LogEntry>,
    pub adaptation_log: Vec<AdaptationLogEntry>,
    pub variables: HashMap<String, Variable>,
}

/// Consolidated instance detail merged from all involved machines.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Instance {
    pub process_instance_id: String,
    /// Definition the instance belongs to; set from the polling scope, not
    /// reported by the engines.
    #[serde(default)]
    pub definition_id: String,
    pub process_version: u32,
    pub instance_state: Vec<ExecutionState>,
    pub tokens: Vec<Token>,
    pub log: Vec<LogEntry>,
    pub adaptation_log: Vec<AdaptationLogEntry>,
    pub variables: HashMap<String, Variable>,
}

impl Instance {
    pub fn from_snapshot(definition_id: &str, snapshot: InstanceSnapshot) -> Self {
        Instance {
            process_instance_id: snapshot.process_instance_id,
            definition_id: definition_id.to_string(),
            process_version: snapshot.process_version,
            instance_state: snapshot.instance_state,
            tokens: snapshot.tokens,
            log: snapshot.log,
            adaptation_log: snapshot.adaptation_log,
            variables: snapshot.variables,
        }
    }
}

/// Artifacts a deployed version needs on a machine.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct Needs {
    #[serde(default)]
    pub html: Vec<String>,
    #[serde(default)]
    pub imports: Vec<String>,
}

/// Version entry as reported by one machine.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ReportedVersion {
    pub version: u32,
    pub version_name: String,
    pub version_description: String,
    pub deployment_date: u64,
    pub bpmn: String,
    #[serde(default)]
    pub needs: Needs,
}

/// Instance summary as reported inside a machine's deployment list.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ReportedInstance {
    pub process_instance_id: String,
    pub process_version: u32,
    pub global_start_time: u64,
    pub instance_state: Vec<ExecutionState>,
}

/// A machine's view of one of its deployments.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DeployedProcess {
    pub definition_id: String,
    #[serde(default)]
    pub versions: Vec<ReportedVersion>,
    #[serde(default)]
    pub instances: Vec<ReportedInstance>,
}

/// Per-machine part of a consolidated version entry.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct VersionMachine {
    pub machine_id: String,
    pub deployment_date: u64,
    pub needs: Needs,
}

/// Consolidated version entry. The bpmn/name/description are stored once
/// globally, the machine sublist carries the machine specific bits.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Version {
    pub version: u32,
    pub version_name: String,
    pub version_description: String,
    pub bpmn: String,
    pub machines: Vec<VersionMachine>,
}

/// Consolidated instance summary inside a deployment.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct InstanceSummary {
    pub process_instance_id: String,
    pub process_version: u32,
    pub global_start_time: u64,
    pub machines: Vec<String>,
}

/// Consolidated view of a process deployment across all machines.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Deployment {
    pub definition_id: String,
    pub machines: Vec<Machine>,
    pub versions: Vec<Version>,
    pub instances: HashMap<String, InstanceSummary>,
    /// Derived index: instance id to the machines it is still executing on.
    pub running_instances: HashMap<String, Vec<String>>,
}

impl Deployment {
    pub fn new(definition_id: impl Into<String>) -> Self {
        Deployment {
            definition_id: definition_id.into(),
            machines: Vec::new(),
            versions: Vec::new(),
            instances: HashMap::new(),
            running_instances: HashMap::new(),
        }
    }
}

/// Active user task as reported by a machine's tasklist endpoint.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ReportedUserTask {
    pub id: String,
    #[serde(rename = "instanceID")]
    pub instance_id: String,
    #[serde(default, rename = "startTime")]
    pub start_time: u64,
    #[serde(default)]
    pub state: Option<String>,
}

/// Consolidated active user task including the rendered form.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ActiveUserTask {
    pub id: String,
    #[serde(rename = "instanceID")]
    pub instance_id: String,
    pub machine_id: String,
    pub start_time: u64,
    pub state: Option<String>,
    pub html: String,
}
