// Execution context: versioned, patchable shared state
//
// Five disjoint subtrees (memory, knowledge, control, retrieval, runtime),
// a monotonically increasing version, and an updated_at timestamp. The
// context lives in memory for one execution; snapshots are its durable
// projection and must be value-identical deep copies.

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::{EngineError, Result};

/// Default control ceilings; overridable per execution
pub const DEFAULT_MAX_LOOPS: u32 = 25;
pub const DEFAULT_MAX_RETRIES: u32 = 10;

/// Default aggregate retrieval budgets; overridable per execution
pub const DEFAULT_MAX_RETRIEVAL_REQUESTS: u64 = 50;
pub const DEFAULT_MAX_RETRIEVAL_FAILURES: u64 = 10;
pub const DEFAULT_MAX_RETRIEVAL_DURATION_MS: u64 = 60_000;

/// Loop/retry accounting and the terminate flag
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct ControlState {
    pub loop_count: u32,
    pub retry_count: u32,
    pub max_loops: u32,
    pub max_retries: u32,
    pub terminate: bool,
}

impl Default for ControlState {
    fn default() -> Self {
        ControlState {
            loop_count: 0,
            retry_count: 0,
            max_loops: DEFAULT_MAX_LOOPS,
            max_retries: DEFAULT_MAX_RETRIES,
            terminate: false,
        }
    }
}

/// Aggregate retrieval budget counters and caps
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct RetrievalState {
    pub total_requests: u64,
    pub total_successes: u64,
    pub total_empties: u64,
    pub total_failures: u64,
    pub total_duration_ms: u64,
    pub max_requests: u64,
    pub max_failures: u64,
    pub max_duration_ms: u64,
}

impl Default for RetrievalState {
    fn default() -> Self {
        RetrievalState {
            total_requests: 0,
            total_successes: 0,
            total_empties: 0,
            total_failures: 0,
            total_duration_ms: 0,
            max_requests: DEFAULT_MAX_RETRIEVAL_REQUESTS,
            max_failures: DEFAULT_MAX_RETRIEVAL_FAILURES,
            max_duration_ms: DEFAULT_MAX_RETRIEVAL_DURATION_MS,
        }
    }
}

/// Engine-owned progress markers
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct RuntimeState {
    pub started_at: Option<DateTime<Utc>>,
    pub updated_at: Option<DateTime<Utc>>,
    pub active_node_id: Option<String>,
    pub last_completed_node_id: Option<String>,
}

impl Default for RuntimeState {
    fn default() -> Self {
        RuntimeState {
            started_at: None,
            updated_at: None,
            active_node_id: None,
            last_completed_node_id: None,
        }
    }
}

/// A partial update applied to the context. Each present subtree is
/// shallow-merged; absent subtrees are untouched.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct ContextPatch {
    pub memory: Option<BTreeMap<String, Value>>,
    pub knowledge: Option<BTreeMap<String, Value>>,
    pub control: Option<serde_json::Map<String, Value>>,
    pub retrieval: Option<serde_json::Map<String, Value>>,
    pub runtime: Option<serde_json::Map<String, Value>>,
}

impl ContextPatch {
    /// Parse a patch from a node's `metadata.contextPatch` value.
    /// Unknown keys are ignored; a non-object yields None.
    pub fn from_value(value: &Value) -> Option<ContextPatch> {
        value
            .as_object()
            .map(|_| serde_json::from_value(value.clone()).unwrap_or_default())
    }

    pub fn memory_entry(key: impl Into<String>, value: Value) -> ContextPatch {
        let mut memory = BTreeMap::new();
        memory.insert(key.into(), value);
        ContextPatch {
            memory: Some(memory),
            ..ContextPatch::default()
        }
    }

    pub fn knowledge_entry(key: impl Into<String>, value: Value) -> ContextPatch {
        let mut knowledge = BTreeMap::new();
        knowledge.insert(key.into(), value);
        ContextPatch {
            knowledge: Some(knowledge),
            ..ContextPatch::default()
        }
    }
}

/// Versioned shared state for one execution
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ExecutionContext {
    pub memory: BTreeMap<String, Value>,
    pub knowledge: BTreeMap<String, Value>,
    pub control: ControlState,
    pub retrieval: RetrievalState,
    pub runtime: RuntimeState,
    pub version: u64,
    pub updated_at: DateTime<Utc>,
}

impl ExecutionContext {
    pub fn new() -> Self {
        let now = Utc::now();
        ExecutionContext {
            memory: BTreeMap::new(),
            knowledge: BTreeMap::new(),
            control: ControlState::default(),
            retrieval: RetrievalState::default(),
            runtime: RuntimeState {
                started_at: Some(now),
                updated_at: Some(now),
                ..RuntimeState::default()
            },
            version: 0,
            updated_at: now,
        }
    }

    /// Override retrieval caps (worker config ceilings)
    pub fn with_retrieval_caps(
        mut self,
        max_requests: u64,
        max_failures: u64,
        max_duration_ms: u64,
    ) -> Self {
        self.retrieval.max_requests = max_requests;
        self.retrieval.max_failures = max_failures;
        self.retrieval.max_duration_ms = max_duration_ms;
        self
    }

    /// Override control ceilings
    pub fn with_control_limits(mut self, max_loops: u32, max_retries: u32) -> Self {
        self.control.max_loops = max_loops;
        self.control.max_retries = max_retries;
        self
    }

    /// Shallow-merge each present subtree, bump version, stamp updated_at.
    /// The empty patch still bumps the version.
    pub fn apply_patch(&mut self, patch: &ContextPatch) {
        if let Some(memory) = &patch.memory {
            for (key, value) in memory {
                self.memory.insert(key.clone(), value.clone());
            }
        }
        if let Some(knowledge) = &patch.knowledge {
            for (key, value) in knowledge {
                self.knowledge.insert(key.clone(), value.clone());
            }
        }
        if let Some(control) = &patch.control {
            self.control = merge_subtree(&self.control, control);
        }
        if let Some(retrieval) = &patch.retrieval {
            let merged: RetrievalState = merge_subtree(&self.retrieval, retrieval);
            // Budget counters are monotonically non-decreasing
            self.retrieval = RetrievalState {
                total_requests: merged.total_requests.max(self.retrieval.total_requests),
                total_successes: merged.total_successes.max(self.retrieval.total_successes),
                total_empties: merged.total_empties.max(self.retrieval.total_empties),
                total_failures: merged.total_failures.max(self.retrieval.total_failures),
                total_duration_ms: merged
                    .total_duration_ms
                    .max(self.retrieval.total_duration_ms),
                ..merged
            };
        }
        if let Some(runtime) = &patch.runtime {
            self.runtime = merge_subtree(&self.runtime, runtime);
        }
        self.touch();
    }

    fn touch(&mut self) {
        self.version += 1;
        self.updated_at = Utc::now();
        self.runtime.updated_at = Some(self.updated_at);
    }

    pub fn get_memory(&self, key: &str) -> Option<&Value> {
        self.memory.get(key)
    }

    pub fn set_memory(&mut self, key: impl Into<String>, value: Value) {
        self.apply_patch(&ContextPatch::memory_entry(key, value));
    }

    /// Remove a memory key entirely (the clear operation)
    pub fn clear_memory(&mut self, key: &str) {
        self.memory.remove(key);
        self.touch();
    }

    pub fn set_knowledge(&mut self, key: impl Into<String>, value: Value) {
        self.apply_patch(&ContextPatch::knowledge_entry(key, value));
    }

    /// Direct runtime mutation used by the engine between steps
    pub fn set_active_node(&mut self, node_id: Option<&str>) {
        self.runtime.active_node_id = node_id.map(str::to_string);
        self.touch();
    }

    pub fn mark_node_completed(&mut self, node_id: &str) {
        self.runtime.active_node_id = None;
        self.runtime.last_completed_node_id = Some(node_id.to_string());
        self.touch();
    }

    /// Register one retry: retry_count always, loop_count when requested
    pub fn register_retry(&mut self, increment_loop: bool) {
        self.control.retry_count += 1;
        if increment_loop {
            self.control.loop_count += 1;
        }
        self.touch();
    }

    pub fn request_terminate(&mut self) {
        self.control.terminate = true;
        self.touch();
    }

    /// Check loop/retry ceilings; a violation terminates the execution
    pub fn check_control_limits(&self) -> Result<()> {
        if self.control.retry_count > self.control.max_retries {
            return Err(EngineError::control(format!(
                "retryCount {} exceeded maxRetries {}",
                self.control.retry_count, self.control.max_retries
            )));
        }
        if self.control.loop_count > self.control.max_loops {
            return Err(EngineError::control(format!(
                "loopCount {} exceeded maxLoops {}",
                self.control.loop_count, self.control.max_loops
            )));
        }
        Ok(())
    }

    /// Fold retrieval counters produced by an orchestration back in.
    /// Counters never decrease; caps are left as configured.
    pub fn merge_retrieval_counters(&mut self, observed: &RetrievalState) {
        self.retrieval.total_requests =
            self.retrieval.total_requests.max(observed.total_requests);
        self.retrieval.total_successes =
            self.retrieval.total_successes.max(observed.total_successes);
        self.retrieval.total_empties = self.retrieval.total_empties.max(observed.total_empties);
        self.retrieval.total_failures =
            self.retrieval.total_failures.max(observed.total_failures);
        self.retrieval.total_duration_ms = self
            .retrieval
            .total_duration_ms
            .max(observed.total_duration_ms);
        self.touch();
    }

    /// Deep copy suitable for emission to the persistence port. Serializing
    /// through serde_json guarantees no substructure is shared with the
    /// live state.
    pub fn snapshot(&self) -> Value {
        serde_json::to_value(self).unwrap_or(Value::Null)
    }
}

impl Default for ExecutionContext {
    fn default() -> Self {
        Self::new()
    }
}

/// Shallow-merge a JSON object into a typed subtree: serialize the current
/// value, overlay the patch keys, deserialize back. Unknown or ill-typed
/// patch keys fall back to the current state.
fn merge_subtree<T>(current: &T, patch: &serde_json::Map<String, Value>) -> T
where
    T: Serialize + for<'de> Deserialize<'de> + Clone,
{
    let mut base = match serde_json::to_value(current) {
        Ok(Value::Object(map)) => map,
        _ => return current.clone(),
    };
    for (key, value) in patch {
        base.insert(key.clone(), value.clone());
    }
    serde_json::from_value(Value::Object(base)).unwrap_or_else(|_| current.clone())
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn patch_bumps_version_and_merges_memory() {
        let mut ctx = ExecutionContext::new();
        assert_eq!(ctx.version, 0);
        ctx.set_memory("session.summary", json!("hello"));
        assert_eq!(ctx.version, 1);
        assert_eq!(ctx.get_memory("session.summary"), Some(&json!("hello")));

        ctx.set_memory("routing.preferredRetriever", json!("docs"));
        assert_eq!(ctx.version, 2);
        // Earlier keys survive the shallow merge
        assert_eq!(ctx.get_memory("session.summary"), Some(&json!("hello")));
    }

    #[test]
    fn empty_patch_still_bumps_version() {
        let mut ctx = ExecutionContext::new();
        let before = ctx.snapshot();
        ctx.apply_patch(&ContextPatch::default());
        assert_eq!(ctx.version, 1);
        assert_eq!(before["memory"], ctx.snapshot()["memory"]);
        assert_eq!(before["control"], ctx.snapshot()["control"]);
    }

    #[test]
    fn control_patch_is_shallow() {
        let mut ctx = ExecutionContext::new();
        let patch = ContextPatch {
            control: Some(
                json!({"maxLoops": 3, "terminate": true})
                    .as_object()
                    .cloned()
                    .unwrap(),
            ),
            ..ContextPatch::default()
        };
        ctx.apply_patch(&patch);
        assert_eq!(ctx.control.max_loops, 3);
        assert!(ctx.control.terminate);
        // Untouched fields keep their values
        assert_eq!(ctx.control.max_retries, DEFAULT_MAX_RETRIES);
    }

    #[test]
    fn retrieval_counters_never_decrease() {
        let mut ctx = ExecutionContext::new();
        let mut observed = ctx.retrieval.clone();
        observed.total_requests = 4;
        observed.total_failures = 1;
        ctx.merge_retrieval_counters(&observed);
        assert_eq!(ctx.retrieval.total_requests, 4);

        let stale = RetrievalState {
            total_requests: 2,
            ..ctx.retrieval.clone()
        };
        ctx.merge_retrieval_counters(&stale);
        assert_eq!(ctx.retrieval.total_requests, 4);
    }

    #[test]
    fn snapshot_is_a_deep_copy() {
        let mut ctx = ExecutionContext::new();
        ctx.set_memory("key", json!({"nested": [1, 2, 3]}));
        let snap = ctx.snapshot();
        ctx.set_memory("key", json!("overwritten"));
        assert_eq!(snap["memory"]["key"], json!({"nested": [1, 2, 3]}));
        assert_eq!(ctx.snapshot()["memory"]["key"], json!("overwritten"));
    }

    #[test]
    fn control_limits_flag_violations() {
        let mut ctx = ExecutionContext::new().with_control_limits(2, 1);
        ctx.register_retry(true);
        assert!(ctx.check_control_limits().is_ok());
        ctx.register_retry(true);
        let err = ctx.check_control_limits().unwrap_err();
        assert!(matches!(err, EngineError::ControlViolation(_)));
    }

    #[test]
    fn retry_registration_counts() {
        let mut ctx = ExecutionContext::new();
        ctx.register_retry(false);
        ctx.register_retry(true);
        assert_eq!(ctx.control.retry_count, 2);
        assert_eq!(ctx.control.loop_count, 1);
    }

    #[test]
    fn patch_parses_from_metadata_value() {
        let raw = json!({"memory": {"a.b": 1}, "control": {"terminate": true}});
        let patch = ContextPatch::from_value(&raw).unwrap();
        let mut ctx = ExecutionContext::new();
        ctx.apply_patch(&patch);
        assert_eq!(ctx.get_memory("a.b"), Some(&json!(1)));
        assert!(ctx.control.terminate);
        assert!(ContextPatch::from_value(&json!("nope")).is_none());
    }

    #[test]
    fn snapshot_uses_camel_case_keys() {
        let ctx = ExecutionContext::new();
        let snap = ctx.snapshot();
        assert!(snap["control"].get("loopCount").is_some());
        assert!(snap["retrieval"].get("totalRequests").is_some());
        assert!(snap["runtime"].get("activeNodeId").is_some());
        assert!(snap.get("updatedAt").is_some());
    }
}
