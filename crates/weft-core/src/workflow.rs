// Workflow graph types and execution records
//
// Nodes and edges arrive as opaque JSON from persistence; this module gives
// them their typed runtime shape. Edge conditions are parsed once into a
// tagged enum and matched against parent outputs during parent resolution.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

/// A workflow definition as the engine consumes it
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkflowGraph {
    pub id: Uuid,
    pub user_id: Uuid,
    pub nodes: Vec<NodeSpec>,
    pub edges: Vec<EdgeSpec>,
}

/// One node of a workflow graph
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NodeSpec {
    /// Stable within the workflow; edge endpoints reference it
    pub id: String,
    /// Type tag mapping to the node registry
    #[serde(rename = "type")]
    pub node_type: String,
    #[serde(default)]
    pub label: Option<String>,
    /// Editor-owned, opaque to the engine
    #[serde(default)]
    pub position: Option<Value>,
    #[serde(default)]
    pub config: serde_json::Map<String, Value>,
}

/// One edge of a workflow graph
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EdgeSpec {
    #[serde(default)]
    pub id: Option<String>,
    pub source: String,
    pub target: String,
    #[serde(default)]
    pub condition: Option<Value>,
}

impl EdgeSpec {
    /// Parse the raw condition value into its tagged form
    pub fn parsed_condition(&self) -> EdgeCondition {
        EdgeCondition::parse(self.condition.as_ref())
    }
}

/// Tagged edge condition, replacing the loose string/boolean union
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EdgeCondition {
    /// Absent, "always", or "any": edge is always taken
    Always,
    /// true/false (boolean or string): matched against the parent's
    /// `_condition.result` or `_evaluation.passed`
    Bool(bool),
    /// "pass": parent's `_evaluation.passed` (or `_condition.result`)
    /// must be true
    Pass,
    /// "fail": parent's `_evaluation.passed` (or `_condition.result`)
    /// must be false
    Fail,
    /// Any other string: matched case-insensitively against the parent's
    /// `_route` (or `_branch.route`, or `route`)
    Route(String),
}

impl EdgeCondition {
    pub fn parse(raw: Option<&Value>) -> Self {
        let Some(raw) = raw else {
            return EdgeCondition::Always;
        };
        match raw {
            Value::Null => EdgeCondition::Always,
            Value::Bool(b) => EdgeCondition::Bool(*b),
            Value::String(s) => match s.to_ascii_lowercase().as_str() {
                "" | "always" | "any" => EdgeCondition::Always,
                "true" => EdgeCondition::Bool(true),
                "false" => EdgeCondition::Bool(false),
                "pass" => EdgeCondition::Pass,
                "fail" => EdgeCondition::Fail,
                _ => EdgeCondition::Route(s.clone()),
            },
            // Non-string, non-boolean conditions have no defined match
            _ => EdgeCondition::Always,
        }
    }

    /// Whether this edge is satisfied by the parent node's output
    pub fn matches(&self, parent_output: &Value) -> bool {
        match self {
            EdgeCondition::Always => true,
            EdgeCondition::Bool(expected) => {
                branch_outcome(parent_output).map_or(false, |b| b == *expected)
            }
            EdgeCondition::Pass => pass_outcome(parent_output) == Some(true),
            EdgeCondition::Fail => pass_outcome(parent_output) == Some(false),
            EdgeCondition::Route(route) => parent_route(parent_output)
                .map_or(false, |r| r.eq_ignore_ascii_case(route)),
        }
    }
}

/// `_condition.result`, falling back to `_evaluation.passed`
fn branch_outcome(output: &Value) -> Option<bool> {
    output
        .pointer("/_condition/result")
        .and_then(Value::as_bool)
        .or_else(|| evaluation_passed(output))
}

fn evaluation_passed(output: &Value) -> Option<bool> {
    output.pointer("/_evaluation/passed").and_then(Value::as_bool)
}

/// `_evaluation.passed`, falling back to `_condition.result` so pass/fail
/// edges also branch off condition nodes
fn pass_outcome(output: &Value) -> Option<bool> {
    evaluation_passed(output).or_else(|| {
        output
            .pointer("/_condition/result")
            .and_then(Value::as_bool)
    })
}

/// `_route`, `_branch.route`, or `route`, in that order
fn parent_route(output: &Value) -> Option<&str> {
    output
        .get("_route")
        .and_then(Value::as_str)
        .or_else(|| output.pointer("/_branch/route").and_then(Value::as_str))
        .or_else(|| output.get("route").and_then(Value::as_str))
}

// ============================================================================
// Statuses
// ============================================================================

/// Execution lifecycle status
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ExecutionStatus {
    Pending,
    Running,
    Completed,
    Failed,
    Canceled,
    Timeout,
}

impl ExecutionStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            ExecutionStatus::Pending => "pending",
            ExecutionStatus::Running => "running",
            ExecutionStatus::Completed => "completed",
            ExecutionStatus::Failed => "failed",
            ExecutionStatus::Canceled => "canceled",
            ExecutionStatus::Timeout => "timeout",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            ExecutionStatus::Completed
                | ExecutionStatus::Failed
                | ExecutionStatus::Canceled
                | ExecutionStatus::Timeout
        )
    }
}

/// Per-step status
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StepStatus {
    Running,
    Completed,
    Failed,
    Skipped,
}

impl StepStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            StepStatus::Running => "running",
            StepStatus::Completed => "completed",
            StepStatus::Failed => "failed",
            StepStatus::Skipped => "skipped",
        }
    }
}

/// Per-attempt status within a step
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AttemptStatus {
    Completed,
    Retry,
    Failed,
}

impl AttemptStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            AttemptStatus::Completed => "completed",
            AttemptStatus::Retry => "retry",
            AttemptStatus::Failed => "failed",
        }
    }
}

// ============================================================================
// Execution records
// ============================================================================

/// One try of a node within a step
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StepAttempt {
    /// 1-based
    pub attempt: u32,
    pub status: AttemptStatus,
    pub duration_ms: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
}

/// Record of one node's run within an execution
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StepRecord {
    pub node_id: String,
    pub node_type: String,
    pub status: StepStatus,
    pub input: Value,
    pub output: Value,
    pub duration_ms: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl StepRecord {
    /// A skipped step carries its reason in `error` and empty input/output
    pub fn skipped(node_id: &str, node_type: &str, reason: &str) -> Self {
        StepRecord {
            node_id: node_id.to_string(),
            node_type: node_type.to_string(),
            status: StepStatus::Skipped,
            input: Value::Null,
            output: Value::Null,
            duration_ms: 0,
            error: Some(reason.to_string()),
        }
    }
}

/// Outcome of one execution attempt through the engine
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ExecutionResult {
    pub status: ExecutionStatus,
    pub steps: Vec<StepRecord>,
    pub total_duration_ms: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error_message: Option<String>,
    pub context: Value,
}

/// Why a context snapshot was taken
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SnapshotReason {
    Init,
    Step,
    Final,
    Error,
}

impl SnapshotReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            SnapshotReason::Init => "init",
            SnapshotReason::Step => "step",
            SnapshotReason::Final => "final",
            SnapshotReason::Error => "error",
        }
    }
}

/// One `on_context_update` emission
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ContextUpdate {
    pub reason: SnapshotReason,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub node_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub node_type: Option<String>,
    /// Deep snapshot of the context at emission time
    pub state: Value,
    pub taken_at: DateTime<Utc>,
}
