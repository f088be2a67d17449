// Retrieval orchestrator
//
// Resolves a node's retriever plans, applies the configured strategy,
// enforces per-request and aggregate budgets, and emits one event per
// retriever attempt (budget-denied attempts included). Speculative mode
// fans plans out concurrently; budget-counter updates and event emission
// are serialized through a single mutex-owned ledger either way.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use futures::future::join_all;
use serde::{Deserialize, Serialize};
use serde_json::{json, Map, Value};
use tokio::sync::Mutex;
use tracing::debug;
use uuid::Uuid;

use crate::context::RetrievalState;
use crate::error::{EngineError, Result};
use crate::node::NodeExecutionContext;
use crate::template::interpolate;
use crate::traits::{KnowledgeMatch, KnowledgeStore, RetrieveRequest, ScopeType};

const DEFAULT_TOP_K: usize = 5;
const DEFAULT_MIN_MATCHES: usize = 1;

// ============================================================================
// Configuration
// ============================================================================

/// Policy for combining multiple retriever outcomes
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum RetrievalStrategy {
    Single,
    Merge,
    FirstNonEmpty,
    BestScore,
    Adaptive,
}

impl RetrievalStrategy {
    pub fn as_str(&self) -> &'static str {
        match self {
            RetrievalStrategy::Single => "single",
            RetrievalStrategy::Merge => "merge",
            RetrievalStrategy::FirstNonEmpty => "first-non-empty",
            RetrievalStrategy::BestScore => "best-score",
            RetrievalStrategy::Adaptive => "adaptive",
        }
    }

    fn parse(s: &str) -> Option<Self> {
        match s.to_ascii_lowercase().as_str() {
            "single" => Some(RetrievalStrategy::Single),
            "merge" => Some(RetrievalStrategy::Merge),
            "first-non-empty" => Some(RetrievalStrategy::FirstNonEmpty),
            "best-score" => Some(RetrievalStrategy::BestScore),
            "adaptive" => Some(RetrievalStrategy::Adaptive),
            _ => None,
        }
    }
}

/// One named query plan against the knowledge port
#[derive(Debug, Clone)]
pub struct RetrieverPlan {
    pub key: String,
    pub query_template: String,
    pub fallback_query_template: Option<String>,
    pub top_k: usize,
    pub max_retries: u32,
    pub retry_delay_ms: u64,
    pub min_matches: usize,
    pub min_score: f64,
    pub fail_on_error: bool,
    pub scope_type: Option<ScopeType>,
    pub workflow_id_scope: Option<Uuid>,
    pub execution_id_scope: Option<Uuid>,
    pub corpus_id: Option<Uuid>,
}

impl RetrieverPlan {
    fn from_object(obj: &Map<String, Value>, fallback_key: String) -> Result<Self> {
        let query_template = obj
            .get("queryTemplate")
            .or_else(|| obj.get("query"))
            .and_then(Value::as_str)
            .ok_or_else(|| {
                EngineError::validation(format!(
                    "Retriever {fallback_key} is missing queryTemplate"
                ))
            })?
            .to_string();

        let scope = obj.get("scope").and_then(Value::as_object);
        let scope_field = |key: &str| -> Option<&Value> {
            scope.and_then(|s| s.get(key)).or_else(|| obj.get(key))
        };

        Ok(RetrieverPlan {
            key: obj
                .get("key")
                .and_then(Value::as_str)
                .map(str::to_string)
                .unwrap_or(fallback_key),
            query_template,
            fallback_query_template: obj
                .get("fallbackQueryTemplate")
                .and_then(Value::as_str)
                .map(str::to_string),
            top_k: obj
                .get("topK")
                .and_then(Value::as_u64)
                .map(|v| v as usize)
                .unwrap_or(DEFAULT_TOP_K),
            max_retries: obj
                .get("maxRetries")
                .and_then(Value::as_u64)
                .map(|v| v as u32)
                .unwrap_or(0),
            retry_delay_ms: obj.get("retryDelayMs").and_then(Value::as_u64).unwrap_or(0),
            min_matches: obj
                .get("minMatches")
                .and_then(Value::as_u64)
                .map(|v| v as usize)
                .unwrap_or(DEFAULT_MIN_MATCHES),
            min_score: obj.get("minScore").and_then(Value::as_f64).unwrap_or(0.0),
            fail_on_error: obj
                .get("failOnError")
                .and_then(Value::as_bool)
                .unwrap_or(false),
            scope_type: scope_field("type")
                .or_else(|| obj.get("scopeType"))
                .and_then(Value::as_str)
                .and_then(ScopeType::parse),
            workflow_id_scope: scope_field("workflowIdScope")
                .and_then(Value::as_str)
                .and_then(|s| Uuid::parse_str(s).ok()),
            execution_id_scope: scope_field("executionIdScope")
                .and_then(Value::as_str)
                .and_then(|s| Uuid::parse_str(s).ok()),
            corpus_id: obj
                .get("corpusId")
                .and_then(Value::as_str)
                .and_then(|s| Uuid::parse_str(s).ok()),
        })
    }

    /// Primary attempts plus one fallback attempt when configured
    fn max_attempts(&self) -> u32 {
        1 + self.max_retries + u32::from(self.fallback_query_template.is_some())
    }
}

/// A node's full retrieval configuration
#[derive(Debug, Clone)]
pub struct RetrievalSpec {
    pub retrievers: Vec<RetrieverPlan>,
    pub strategy: RetrievalStrategy,
    pub speculative: bool,
    pub preferred_retriever_memory_key: Option<String>,
    pub inject_as: String,
}

impl RetrievalSpec {
    /// Parse from a config object. Accepts a `retrievers` array or a flat
    /// single-retriever form (`query`/`queryTemplate` at the top level).
    pub fn parse(config: &Map<String, Value>) -> Result<RetrievalSpec> {
        let retrievers: Vec<RetrieverPlan> = match config.get("retrievers") {
            Some(Value::Array(items)) => items
                .iter()
                .enumerate()
                .map(|(idx, item)| {
                    item.as_object()
                        .ok_or_else(|| {
                            EngineError::validation("Each retriever must be an object")
                        })
                        .and_then(|obj| RetrieverPlan::from_object(obj, format!("retriever-{idx}")))
                })
                .collect::<Result<_>>()?,
            _ => vec![RetrieverPlan::from_object(config, "default".to_string())?],
        };

        if retrievers.is_empty() {
            return Err(EngineError::validation(
                "Retrieval config needs at least one retriever",
            ));
        }

        let strategy = match config.get("strategy").and_then(Value::as_str) {
            Some(s) => RetrievalStrategy::parse(s).ok_or_else(|| {
                EngineError::validation(format!("Unknown retrieval strategy: {s}"))
            })?,
            None => RetrievalStrategy::Single,
        };

        Ok(RetrievalSpec {
            retrievers,
            strategy,
            speculative: config
                .get("speculative")
                .and_then(Value::as_bool)
                .unwrap_or(false),
            preferred_retriever_memory_key: config
                .get("preferredRetrieverMemoryKey")
                .and_then(Value::as_str)
                .map(str::to_string),
            inject_as: config
                .get("injectAs")
                .or_else(|| config.get("outputKey"))
                .and_then(Value::as_str)
                .unwrap_or("_knowledge")
                .to_string(),
        })
    }

    /// Engine-mediated retrieval opt-in: a `retrieval` object on any node's
    /// config
    pub fn from_node_config(config: &Map<String, Value>) -> Option<Result<RetrievalSpec>> {
        config
            .get("retrieval")
            .and_then(Value::as_object)
            .map(RetrievalSpec::parse)
    }
}

// ============================================================================
// Events and results
// ============================================================================

/// Status of one retriever attempt
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RetrievalEventStatus {
    Success,
    Empty,
    Failed,
}

impl RetrievalEventStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            RetrievalEventStatus::Success => "success",
            RetrievalEventStatus::Empty => "empty",
            RetrievalEventStatus::Failed => "failed",
        }
    }
}

/// One retrieval event, emitted once per retriever attempt
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RetrievalEvent {
    pub node_id: String,
    pub node_type: String,
    pub query: String,
    pub top_k: usize,
    /// 1-based within the plan
    pub attempt: u32,
    pub max_attempts: u32,
    pub status: RetrievalEventStatus,
    pub matches_count: usize,
    pub duration_ms: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error_message: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub scope_type: Option<ScopeType>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub corpus_id: Option<Uuid>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub workflow_id_scope: Option<Uuid>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub execution_id_scope: Option<Uuid>,
    pub strategy: RetrievalStrategy,
    pub retriever_key: String,
    pub branch_index: usize,
    pub selected: bool,
}

/// How the orchestration arrived at its result
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct OrchestrationSummary {
    pub strategy: RetrievalStrategy,
    pub speculative: bool,
    pub retrievers_tried: Vec<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub selected_retriever_key: Option<String>,
    pub branch_count: usize,
}

/// Final orchestration result injected into the downstream node's input
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct QueryResult {
    pub query: String,
    pub top_k: usize,
    pub matches: Vec<KnowledgeMatch>,
    pub orchestration: OrchestrationSummary,
}

impl QueryResult {
    /// Compact summary patched under `knowledge["retrieval.<nodeId>"]`
    pub fn compact_summary(&self) -> Value {
        json!({
            "query": self.query,
            "matchesCount": self.matches.len(),
            "topScore": self.matches.first().map(|m| m.score),
            "strategy": self.orchestration.strategy.as_str(),
            "selectedRetrieverKey": self.orchestration.selected_retriever_key,
            "retrieversTried": self.orchestration.retrievers_tried,
        })
    }
}

/// Everything an orchestration run produces: the result (or fatal error),
/// the events to emit, and the updated budget counters to fold back in.
pub struct OrchestrationOutcome {
    pub result: Result<QueryResult>,
    pub events: Vec<RetrievalEvent>,
    pub budget: RetrievalState,
}

// ============================================================================
// Orchestrator
// ============================================================================

/// Identity fields threaded through to the knowledge port
#[derive(Debug, Clone)]
pub struct OrchestrationScope {
    pub execution_id: Uuid,
    pub workflow_id: Uuid,
    pub user_id: Uuid,
    pub node_id: String,
    pub node_type: String,
}

/// Budget counters and the event stream, owned by one mutex. Every path
/// that touches either goes through this ledger, in speculative runs too.
struct Ledger {
    budget: RetrievalState,
    events: Vec<RetrievalEvent>,
}

impl Ledger {
    /// Check aggregate caps and reserve one request slot. The denial
    /// message names the cap that was hit.
    fn check_and_reserve(&mut self) -> std::result::Result<(), String> {
        if self.budget.total_requests >= self.budget.max_requests {
            return Err(format!(
                "maxRequests reached ({})",
                self.budget.max_requests
            ));
        }
        if self.budget.total_failures >= self.budget.max_failures {
            return Err(format!(
                "maxFailures reached ({})",
                self.budget.max_failures
            ));
        }
        if self.budget.total_duration_ms >= self.budget.max_duration_ms {
            return Err(format!(
                "maxDurationMs reached ({})",
                self.budget.max_duration_ms
            ));
        }
        self.budget.total_requests += 1;
        Ok(())
    }
}

/// Result of running one plan to completion
struct PlanOutcome {
    key: String,
    /// The query that produced the final result (fallback included)
    query: String,
    top_k: usize,
    matches: Vec<KnowledgeMatch>,
    /// Post-filter matches met min_matches
    satisfied: bool,
    /// At least one request actually reached the knowledge port
    issued: bool,
    fail_on_error: bool,
    fatal: Option<EngineError>,
}

pub struct RetrievalOrchestrator {
    store: Arc<dyn KnowledgeStore>,
    scope: OrchestrationScope,
}

impl RetrievalOrchestrator {
    pub fn new(store: Arc<dyn KnowledgeStore>, scope: OrchestrationScope) -> Self {
        RetrievalOrchestrator { store, scope }
    }

    /// Run the full orchestration: plan ordering, per-plan attempts,
    /// strategy selection, event marking.
    pub async fn run(
        &self,
        spec: &RetrievalSpec,
        data: &Value,
        memory: &BTreeMap<String, Value>,
        budget: RetrievalState,
    ) -> OrchestrationOutcome {
        let ledger = Arc::new(Mutex::new(Ledger {
            budget,
            events: Vec::new(),
        }));

        let plans = self.ordered_plans(spec, memory);

        let outcomes: Vec<PlanOutcome> = match (spec.strategy, spec.speculative) {
            // single always runs exactly one plan, sequentially
            (RetrievalStrategy::Single, _) => {
                let (branch_index, plan) = plans[0];
                vec![self.run_plan(spec, plan, branch_index, data, &ledger).await]
            }
            (RetrievalStrategy::FirstNonEmpty | RetrievalStrategy::Adaptive, false) => {
                // Sequential short-circuit: stop issuing once satisfied
                let mut outcomes = Vec::new();
                for (branch_index, plan) in plans {
                    let outcome = self.run_plan(spec, plan, branch_index, data, &ledger).await;
                    let stop = outcome.satisfied || outcome.fatal.is_some();
                    outcomes.push(outcome);
                    if stop {
                        break;
                    }
                }
                outcomes
            }
            (_, true) => {
                // Speculative: all plans concurrently, wait for all
                let futures: Vec<_> = plans
                    .into_iter()
                    .map(|(branch_index, plan)| {
                        self.run_plan(spec, plan, branch_index, data, &ledger)
                    })
                    .collect();
                join_all(futures).await
            }
            (_, false) => {
                let mut outcomes = Vec::new();
                for (branch_index, plan) in plans {
                    let outcome = self.run_plan(spec, plan, branch_index, data, &ledger).await;
                    let fatal = outcome.fatal.is_some();
                    outcomes.push(outcome);
                    if fatal {
                        break;
                    }
                }
                outcomes
            }
        };

        let ledger = match Arc::try_unwrap(ledger) {
            Ok(inner) => inner.into_inner(),
            Err(arc) => {
                // Every plan future has completed, so the lock is free
                let guard = arc.try_lock().expect("ledger uncontended after join");
                Ledger {
                    budget: guard.budget.clone(),
                    events: guard.events.clone(),
                }
            }
        };
        let mut events = ledger.events;
        let budget = ledger.budget;

        // A fatal plan error aborts the orchestration
        if let Some(pos) = outcomes.iter().position(|o| o.fatal.is_some()) {
            let fatal = outcomes
                .into_iter()
                .nth(pos)
                .and_then(|o| o.fatal)
                .expect("fatal outcome present");
            return OrchestrationOutcome {
                result: Err(fatal),
                events,
                budget,
            };
        }

        let result = self.select(spec, outcomes, &mut events);
        OrchestrationOutcome {
            result,
            events,
            budget,
        }
    }

    /// Plans in strategy order: adaptive moves the preferred retriever to
    /// the front, everything else keeps config order.
    fn ordered_plans<'p>(
        &self,
        spec: &'p RetrievalSpec,
        memory: &BTreeMap<String, Value>,
    ) -> Vec<(usize, &'p RetrieverPlan)> {
        let mut plans: Vec<(usize, &RetrieverPlan)> = spec.retrievers.iter().enumerate().collect();
        if spec.strategy == RetrievalStrategy::Adaptive {
            if let Some(preferred) = spec
                .preferred_retriever_memory_key
                .as_deref()
                .and_then(|key| memory.get(key))
                .and_then(Value::as_str)
            {
                if let Some(pos) = plans.iter().position(|(_, p)| p.key == preferred) {
                    let chosen = plans.remove(pos);
                    plans.insert(0, chosen);
                    debug!(
                        retriever = preferred,
                        "adaptive strategy moved preferred retriever first"
                    );
                }
            }
        }
        plans
    }

    /// Drive one plan: primary attempts up to 1 + max_retries, then one
    /// fallback-template attempt if still unsatisfied. Every attempt emits
    /// exactly one event through the ledger.
    async fn run_plan(
        &self,
        spec: &RetrievalSpec,
        plan: &RetrieverPlan,
        branch_index: usize,
        data: &Value,
        ledger: &Arc<Mutex<Ledger>>,
    ) -> PlanOutcome {
        let primary_query = interpolate(&plan.query_template, data);
        let primary_attempts = 1 + plan.max_retries;
        let max_attempts = plan.max_attempts();

        let mut outcome = PlanOutcome {
            key: plan.key.clone(),
            query: primary_query.clone(),
            top_k: plan.top_k,
            matches: Vec::new(),
            satisfied: false,
            issued: false,
            fail_on_error: plan.fail_on_error,
            fatal: None,
        };

        let mut attempt: u32 = 0;
        loop {
            attempt += 1;
            if attempt > max_attempts {
                break;
            }

            // Fallback attempt only fires when the primaries stayed empty
            let is_fallback = attempt > primary_attempts;
            let query = if is_fallback {
                match &plan.fallback_query_template {
                    Some(template) => interpolate(template, data),
                    None => break,
                }
            } else {
                primary_query.clone()
            };

            // Budget gate, serialized with the counter updates
            let denied = {
                let mut guard = ledger.lock().await;
                match guard.check_and_reserve() {
                    Ok(()) => None,
                    Err(cap) => {
                        guard.events.push(self.event(
                            spec,
                            plan,
                            branch_index,
                            &query,
                            attempt,
                            max_attempts,
                            RetrievalEventStatus::Failed,
                            0,
                            0,
                            Some(format!("Retrieval budget exceeded: {cap}")),
                        ));
                        Some(cap)
                    }
                }
            };

            if let Some(cap) = denied {
                if plan.fail_on_error {
                    outcome.fatal = Some(EngineError::budget(cap));
                }
                return outcome;
            }

            let started = Instant::now();
            let response = self
                .store
                .retrieve(RetrieveRequest {
                    execution_id: self.scope.execution_id,
                    workflow_id: self.scope.workflow_id,
                    user_id: self.scope.user_id,
                    node_id: self.scope.node_id.clone(),
                    node_type: self.scope.node_type.clone(),
                    query: query.clone(),
                    top_k: plan.top_k,
                    corpus_id: plan.corpus_id,
                    scope_type: plan.scope_type,
                    workflow_id_scope: plan.workflow_id_scope,
                    execution_id_scope: plan.execution_id_scope,
                    retriever_key: Some(plan.key.clone()),
                    retrieval_strategy: Some(spec.strategy.as_str().to_string()),
                    branch_index: Some(branch_index),
                })
                .await;
            let duration_ms = started.elapsed().as_millis() as u64;
            outcome.issued = true;
            outcome.query = query.clone();

            match response {
                Ok(response) => {
                    let mut matches: Vec<KnowledgeMatch> = response
                        .matches
                        .into_iter()
                        .filter(|m| m.score >= plan.min_score)
                        .collect();
                    matches.truncate(plan.top_k);
                    let satisfied = matches.len() >= plan.min_matches;
                    let status = if satisfied {
                        RetrievalEventStatus::Success
                    } else {
                        RetrievalEventStatus::Empty
                    };

                    {
                        let mut guard = ledger.lock().await;
                        guard.budget.total_duration_ms += duration_ms;
                        if satisfied {
                            guard.budget.total_successes += 1;
                        } else {
                            guard.budget.total_empties += 1;
                        }
                        guard.events.push(self.event(
                            spec,
                            plan,
                            branch_index,
                            &query,
                            attempt,
                            max_attempts,
                            status,
                            matches.len(),
                            duration_ms,
                            None,
                        ));
                    }

                    outcome.matches = matches;
                    outcome.satisfied = satisfied;
                    if satisfied {
                        return outcome;
                    }
                }
                Err(err) => {
                    let message = crate::error::sanitize_message(&err.to_string());
                    {
                        let mut guard = ledger.lock().await;
                        guard.budget.total_failures += 1;
                        guard.budget.total_duration_ms += duration_ms;
                        guard.events.push(self.event(
                            spec,
                            plan,
                            branch_index,
                            &query,
                            attempt,
                            max_attempts,
                            RetrievalEventStatus::Failed,
                            0,
                            duration_ms,
                            Some(message.clone()),
                        ));
                    }

                    if attempt >= max_attempts {
                        if plan.fail_on_error {
                            outcome.fatal = Some(EngineError::node(format!(
                                "Retriever {} failed: {message}",
                                plan.key
                            )));
                        }
                        return outcome;
                    }
                }
            }

            if plan.retry_delay_ms > 0 {
                tokio::time::sleep(Duration::from_millis(plan.retry_delay_ms)).await;
            }
        }

        outcome
    }

    #[allow(clippy::too_many_arguments)]
    fn event(
        &self,
        spec: &RetrievalSpec,
        plan: &RetrieverPlan,
        branch_index: usize,
        query: &str,
        attempt: u32,
        max_attempts: u32,
        status: RetrievalEventStatus,
        matches_count: usize,
        duration_ms: u64,
        error_message: Option<String>,
    ) -> RetrievalEvent {
        RetrievalEvent {
            node_id: self.scope.node_id.clone(),
            node_type: self.scope.node_type.clone(),
            query: query.to_string(),
            top_k: plan.top_k,
            attempt,
            max_attempts,
            status,
            matches_count,
            duration_ms,
            error_message,
            scope_type: plan.scope_type,
            corpus_id: plan.corpus_id,
            workflow_id_scope: plan.workflow_id_scope,
            execution_id_scope: plan.execution_id_scope,
            strategy: spec.strategy,
            retriever_key: plan.key.clone(),
            branch_index,
            selected: false,
        }
    }

    /// Apply the strategy to the plan outcomes and mark selected events
    fn select(
        &self,
        spec: &RetrievalSpec,
        outcomes: Vec<PlanOutcome>,
        events: &mut [RetrievalEvent],
    ) -> Result<QueryResult> {
        let retrievers_tried: Vec<String> = outcomes
            .iter()
            .filter(|o| o.issued)
            .map(|o| o.key.clone())
            .collect();
        let branch_count = outcomes.len();

        let summary = |selected: Option<String>| OrchestrationSummary {
            strategy: spec.strategy,
            speculative: spec.speculative,
            retrievers_tried: retrievers_tried.clone(),
            selected_retriever_key: selected,
            branch_count,
        };

        match spec.strategy {
            RetrievalStrategy::Single => {
                let chosen = outcomes.into_iter().next().expect("single plan outcome");
                mark_selected(events, &chosen.key);
                Ok(QueryResult {
                    query: chosen.query,
                    top_k: chosen.top_k,
                    orchestration: summary(Some(chosen.key)),
                    matches: chosen.matches,
                })
            }
            RetrievalStrategy::Merge => {
                // Dedupe by chunk id keeping the max score, sort descending,
                // truncate to the first plan's top_k
                let top_k = outcomes.first().map(|o| o.top_k).unwrap_or(DEFAULT_TOP_K);
                let query = outcomes
                    .first()
                    .map(|o| o.query.clone())
                    .unwrap_or_default();
                let mut best: BTreeMap<Uuid, KnowledgeMatch> = BTreeMap::new();
                for outcome in outcomes {
                    for m in outcome.matches {
                        match best.get(&m.chunk_id) {
                            Some(existing) if existing.score >= m.score => {}
                            _ => {
                                best.insert(m.chunk_id, m);
                            }
                        }
                    }
                }
                let mut matches: Vec<KnowledgeMatch> = best.into_values().collect();
                matches.sort_by(|a, b| {
                    b.score
                        .partial_cmp(&a.score)
                        .unwrap_or(std::cmp::Ordering::Equal)
                });
                matches.truncate(top_k);
                for event in events.iter_mut() {
                    if event.status == RetrievalEventStatus::Success {
                        event.selected = true;
                    }
                }
                Ok(QueryResult {
                    query,
                    top_k,
                    matches,
                    orchestration: summary(None),
                })
            }
            RetrievalStrategy::FirstNonEmpty | RetrievalStrategy::Adaptive => {
                if let Some(pos) = outcomes.iter().position(|o| o.satisfied) {
                    let chosen = outcomes
                        .into_iter()
                        .nth(pos)
                        .expect("satisfied outcome present");
                    mark_selected(events, &chosen.key);
                    return Ok(QueryResult {
                        query: chosen.query,
                        top_k: chosen.top_k,
                        orchestration: summary(Some(chosen.key)),
                        matches: chosen.matches,
                    });
                }
                // None satisfied: last result, or raise when it demands so
                let last = outcomes.into_iter().last().expect("at least one outcome");
                if last.fail_on_error {
                    return Err(EngineError::node(format!(
                        "No retriever produced at least the minimum matches (last: {})",
                        last.key
                    )));
                }
                mark_selected(events, &last.key);
                Ok(QueryResult {
                    query: last.query,
                    top_k: last.top_k,
                    orchestration: summary(Some(last.key)),
                    matches: last.matches,
                })
            }
            RetrievalStrategy::BestScore => {
                // Highest top-1 score; ties broken by larger match count,
                // then lexicographic retriever key
                let mut ranked: Vec<PlanOutcome> = outcomes;
                ranked.sort_by(|a, b| {
                    let score_a = a.matches.first().map(|m| m.score).unwrap_or(f64::MIN);
                    let score_b = b.matches.first().map(|m| m.score).unwrap_or(f64::MIN);
                    score_b
                        .partial_cmp(&score_a)
                        .unwrap_or(std::cmp::Ordering::Equal)
                        .then(b.matches.len().cmp(&a.matches.len()))
                        .then(a.key.cmp(&b.key))
                });
                let chosen = ranked.into_iter().next().expect("at least one outcome");
                mark_selected(events, &chosen.key);
                Ok(QueryResult {
                    query: chosen.query,
                    top_k: chosen.top_k,
                    orchestration: summary(Some(chosen.key)),
                    matches: chosen.matches,
                })
            }
        }
    }
}

/// Mark the selected retriever's decisive event: the last success if there
/// is one, otherwise its last event.
fn mark_selected(events: &mut [RetrievalEvent], key: &str) {
    let success_pos = events
        .iter()
        .rposition(|e| e.retriever_key == key && e.status == RetrievalEventStatus::Success);
    let pos = success_pos.or_else(|| events.iter().rposition(|e| e.retriever_key == key));
    if let Some(pos) = pos {
        events[pos].selected = true;
    }
}

// ============================================================================
// Node bridge
// ============================================================================

/// Run an orchestration on behalf of a node: events buffer into the node's
/// context handle for the runner to drain, and budget counters fold back
/// into the execution context.
pub async fn orchestrate_for_node(
    ctx: &mut NodeExecutionContext<'_>,
    spec: &RetrievalSpec,
    data: &Value,
) -> Result<QueryResult> {
    let store = ctx
        .services()
        .knowledge
        .clone()
        .ok_or_else(|| EngineError::node("No knowledge store configured for retrieval"))?;

    let orchestrator = RetrievalOrchestrator::new(
        store,
        OrchestrationScope {
            execution_id: ctx.execution_id,
            workflow_id: ctx.workflow_id,
            user_id: ctx.user_id,
            node_id: ctx.node_id.clone(),
            node_type: ctx.node_type.clone(),
        },
    );

    let memory = ctx.memory_tree().clone();
    let budget = ctx.retrieval_state().clone();
    let outcome = orchestrator.run(spec, data, &memory, budget).await;

    ctx.push_retrieval_events(outcome.events);
    ctx.context_mut().merge_retrieval_counters(&outcome.budget);
    outcome.result
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::traits::RetrievalResponse;
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn scope() -> OrchestrationScope {
        OrchestrationScope {
            execution_id: Uuid::now_v7(),
            workflow_id: Uuid::now_v7(),
            user_id: Uuid::now_v7(),
            node_id: "retrieve-1".to_string(),
            node_type: "knowledge-retrieve".to_string(),
        }
    }

    fn make_match(score: f64) -> KnowledgeMatch {
        KnowledgeMatch {
            chunk_id: Uuid::now_v7(),
            corpus_id: Uuid::now_v7(),
            document_id: Uuid::now_v7(),
            chunk_index: 0,
            score,
            content: "chunk".to_string(),
            title: None,
            source_type: None,
            metadata: Value::Null,
        }
    }

    /// Store scripted per retriever key: a list of responses per key
    struct ScriptedStore {
        responses: std::sync::Mutex<BTreeMap<String, Vec<Result<RetrievalResponse>>>>,
        calls: AtomicUsize,
    }

    impl ScriptedStore {
        fn new(entries: Vec<(&str, Vec<Result<RetrievalResponse>>)>) -> Self {
            let mut responses = BTreeMap::new();
            for (key, scripted) in entries {
                responses.insert(key.to_string(), scripted);
            }
            ScriptedStore {
                responses: std::sync::Mutex::new(responses),
                calls: AtomicUsize::new(0),
            }
        }

        fn response(matches: Vec<KnowledgeMatch>) -> Result<RetrievalResponse> {
            Ok(RetrievalResponse {
                query: "q".to_string(),
                top_k: 5,
                matches,
            })
        }
    }

    #[async_trait]
    impl KnowledgeStore for ScriptedStore {
        async fn retrieve(&self, request: RetrieveRequest) -> Result<RetrievalResponse> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            let key = request.retriever_key.unwrap_or_default();
            let mut guard = self.responses.lock().unwrap();
            let scripted = guard
                .get_mut(&key)
                .ok_or_else(|| EngineError::node(format!("no script for {key}")))?;
            if scripted.is_empty() {
                return Ok(RetrievalResponse {
                    query: request.query,
                    top_k: request.top_k,
                    matches: Vec::new(),
                });
            }
            scripted.remove(0)
        }

        async fn ingest(
            &self,
            _request: crate::traits::IngestRequest,
        ) -> Result<crate::traits::IngestReceipt> {
            unimplemented!("not used in orchestrator tests")
        }
    }

    fn spec_with(retrievers: Vec<RetrieverPlan>, strategy: RetrievalStrategy) -> RetrievalSpec {
        RetrievalSpec {
            retrievers,
            strategy,
            speculative: false,
            preferred_retriever_memory_key: None,
            inject_as: "_knowledge".to_string(),
        }
    }

    fn plan(key: &str) -> RetrieverPlan {
        RetrieverPlan {
            key: key.to_string(),
            query_template: "what is {{topic}}".to_string(),
            fallback_query_template: None,
            top_k: 5,
            max_retries: 0,
            retry_delay_ms: 0,
            min_matches: 1,
            min_score: 0.0,
            fail_on_error: false,
            scope_type: None,
            workflow_id_scope: None,
            execution_id_scope: None,
            corpus_id: None,
        }
    }

    #[tokio::test]
    async fn first_non_empty_takes_first_satisfying_plan() {
        let store = Arc::new(ScriptedStore::new(vec![
            ("faq", vec![ScriptedStore::response(vec![])]),
            (
                "docs",
                vec![ScriptedStore::response(vec![
                    make_match(0.9),
                    make_match(0.8),
                    make_match(0.7),
                ])],
            ),
        ]));
        let orchestrator = RetrievalOrchestrator::new(store, scope());
        let spec = spec_with(
            vec![plan("faq"), plan("docs")],
            RetrievalStrategy::FirstNonEmpty,
        );

        let outcome = orchestrator
            .run(
                &spec,
                &json!({"topic": "billing"}),
                &BTreeMap::new(),
                RetrievalState::default(),
            )
            .await;

        let result = outcome.result.unwrap();
        assert_eq!(result.matches.len(), 3);
        assert_eq!(
            result.orchestration.selected_retriever_key.as_deref(),
            Some("docs")
        );
        assert_eq!(result.orchestration.retrievers_tried, vec!["faq", "docs"]);

        assert_eq!(outcome.events.len(), 2);
        assert_eq!(outcome.events[0].retriever_key, "faq");
        assert_eq!(outcome.events[0].status, RetrievalEventStatus::Empty);
        assert!(!outcome.events[0].selected);
        assert_eq!(outcome.events[1].retriever_key, "docs");
        assert_eq!(outcome.events[1].status, RetrievalEventStatus::Success);
        assert!(outcome.events[1].selected);
        // Queries were interpolated
        assert_eq!(outcome.events[0].query, "what is billing");
    }

    #[tokio::test]
    async fn budget_denial_emits_failed_event_and_stops_counting() {
        let store = Arc::new(ScriptedStore::new(vec![
            ("a", vec![ScriptedStore::response(vec![])]),
            ("b", vec![ScriptedStore::response(vec![])]),
            ("c", vec![]),
        ]));
        let orchestrator = RetrievalOrchestrator::new(store.clone(), scope());
        let spec = spec_with(
            vec![plan("a"), plan("b"), plan("c")],
            RetrievalStrategy::Merge,
        );

        let budget = RetrievalState {
            max_requests: 2,
            ..RetrievalState::default()
        };
        let outcome = orchestrator
            .run(&spec, &json!({}), &BTreeMap::new(), budget)
            .await;

        // Two issued, the third denied
        assert_eq!(store.calls.load(Ordering::SeqCst), 2);
        assert_eq!(outcome.budget.total_requests, 2);
        assert_eq!(outcome.events.len(), 3);
        let denied = &outcome.events[2];
        assert_eq!(denied.status, RetrievalEventStatus::Failed);
        assert!(denied
            .error_message
            .as_deref()
            .unwrap()
            .contains("maxRequests reached (2)"));

        // Soft by default: empty matches, only issued retrievers listed
        let result = outcome.result.unwrap();
        assert!(result.matches.is_empty());
        assert_eq!(result.orchestration.retrievers_tried, vec!["a", "b"]);
    }

    #[tokio::test]
    async fn budget_denial_is_fatal_with_fail_on_error() {
        let store = Arc::new(ScriptedStore::new(vec![("a", vec![])]));
        let orchestrator = RetrievalOrchestrator::new(store, scope());
        let mut failing = plan("a");
        failing.fail_on_error = true;
        let spec = spec_with(vec![failing], RetrievalStrategy::Single);

        let budget = RetrievalState {
            max_requests: 0,
            ..RetrievalState::default()
        };
        let outcome = orchestrator
            .run(&spec, &json!({}), &BTreeMap::new(), budget)
            .await;

        assert!(matches!(
            outcome.result.unwrap_err(),
            EngineError::RetrievalBudget(_)
        ));
        assert_eq!(outcome.events.len(), 1);
        assert_eq!(outcome.budget.total_requests, 0);
    }

    #[tokio::test]
    async fn retries_then_fallback_query() {
        let store = Arc::new(ScriptedStore::new(vec![(
            "a",
            vec![
                ScriptedStore::response(vec![]),
                ScriptedStore::response(vec![]),
                ScriptedStore::response(vec![make_match(0.5)]),
            ],
        )]));
        let orchestrator = RetrievalOrchestrator::new(store, scope());
        let mut retrying = plan("a");
        retrying.max_retries = 1;
        retrying.fallback_query_template = Some("fallback {{topic}}".to_string());
        let spec = spec_with(vec![retrying], RetrievalStrategy::Single);

        let outcome = orchestrator
            .run(
                &spec,
                &json!({"topic": "x"}),
                &BTreeMap::new(),
                RetrievalState::default(),
            )
            .await;

        let result = outcome.result.unwrap();
        assert_eq!(result.matches.len(), 1);
        // Attempts numbered 1..N in order; fallback query used on the last
        let attempts: Vec<u32> = outcome.events.iter().map(|e| e.attempt).collect();
        assert_eq!(attempts, vec![1, 2, 3]);
        assert_eq!(outcome.events[2].query, "fallback x");
        assert_eq!(outcome.events[2].status, RetrievalEventStatus::Success);
        assert_eq!(result.query, "fallback x");
    }

    #[tokio::test]
    async fn merge_dedupes_by_chunk_keeping_max_score() {
        let shared = make_match(0.4);
        let mut shared_better = shared.clone();
        shared_better.score = 0.9;
        let store = Arc::new(ScriptedStore::new(vec![
            (
                "a",
                vec![ScriptedStore::response(vec![shared, make_match(0.6)])],
            ),
            ("b", vec![ScriptedStore::response(vec![shared_better])]),
        ]));
        let orchestrator = RetrievalOrchestrator::new(store, scope());
        let spec = spec_with(vec![plan("a"), plan("b")], RetrievalStrategy::Merge);

        let outcome = orchestrator
            .run(&spec, &json!({}), &BTreeMap::new(), RetrievalState::default())
            .await;

        let result = outcome.result.unwrap();
        assert_eq!(result.matches.len(), 2);
        assert_eq!(result.matches[0].score, 0.9);
        assert!(result.matches[0].score >= result.matches[1].score);
        assert!(result.orchestration.selected_retriever_key.is_none());
    }

    #[tokio::test]
    async fn best_score_breaks_ties_deterministically() {
        let store = Arc::new(ScriptedStore::new(vec![
            (
                "zeta",
                vec![ScriptedStore::response(vec![make_match(0.8)])],
            ),
            (
                "alpha",
                vec![ScriptedStore::response(vec![make_match(0.8)])],
            ),
        ]));
        let orchestrator = RetrievalOrchestrator::new(store, scope());
        let spec = spec_with(vec![plan("zeta"), plan("alpha")], RetrievalStrategy::BestScore);

        let outcome = orchestrator
            .run(&spec, &json!({}), &BTreeMap::new(), RetrievalState::default())
            .await;

        // Equal top-1 score and match count: lexicographic key wins
        assert_eq!(
            outcome
                .result
                .unwrap()
                .orchestration
                .selected_retriever_key
                .as_deref(),
            Some("alpha")
        );
    }

    #[tokio::test]
    async fn adaptive_prefers_memory_named_retriever() {
        let store = Arc::new(ScriptedStore::new(vec![
            ("faq", vec![ScriptedStore::response(vec![])]),
            (
                "docs",
                vec![ScriptedStore::response(vec![make_match(0.7)])],
            ),
        ]));
        let orchestrator = RetrievalOrchestrator::new(store.clone(), scope());
        let mut spec = spec_with(vec![plan("faq"), plan("docs")], RetrievalStrategy::Adaptive);
        spec.preferred_retriever_memory_key = Some("routing.preferredRetriever".to_string());

        let mut memory = BTreeMap::new();
        memory.insert(
            "routing.preferredRetriever".to_string(),
            json!("docs"),
        );

        let outcome = orchestrator
            .run(&spec, &json!({}), &memory, RetrievalState::default())
            .await;

        // docs ran first and satisfied, so faq never issued
        assert_eq!(store.calls.load(Ordering::SeqCst), 1);
        assert_eq!(
            outcome
                .result
                .unwrap()
                .orchestration
                .selected_retriever_key
                .as_deref(),
            Some("docs")
        );
    }

    #[tokio::test]
    async fn speculative_runs_all_plans() {
        let store = Arc::new(ScriptedStore::new(vec![
            (
                "a",
                vec![ScriptedStore::response(vec![make_match(0.5)])],
            ),
            (
                "b",
                vec![ScriptedStore::response(vec![make_match(0.9)])],
            ),
        ]));
        let orchestrator = RetrievalOrchestrator::new(store.clone(), scope());
        let mut spec = spec_with(vec![plan("a"), plan("b")], RetrievalStrategy::FirstNonEmpty);
        spec.speculative = true;

        let outcome = orchestrator
            .run(&spec, &json!({}), &BTreeMap::new(), RetrievalState::default())
            .await;

        // Both issued despite the first being satisfied
        assert_eq!(store.calls.load(Ordering::SeqCst), 2);
        let result = outcome.result.unwrap();
        assert_eq!(result.orchestration.selected_retriever_key.as_deref(), Some("a"));
        assert_eq!(outcome.budget.total_requests, 2);
    }

    #[tokio::test]
    async fn min_score_filters_before_min_matches() {
        let store = Arc::new(ScriptedStore::new(vec![(
            "a",
            vec![ScriptedStore::response(vec![
                make_match(0.9),
                make_match(0.2),
            ])],
        )]));
        let orchestrator = RetrievalOrchestrator::new(store, scope());
        let mut filtered = plan("a");
        filtered.min_score = 0.5;
        filtered.min_matches = 2;
        let spec = spec_with(vec![filtered], RetrievalStrategy::Single);

        let outcome = orchestrator
            .run(&spec, &json!({}), &BTreeMap::new(), RetrievalState::default())
            .await;

        // Only one match survives the score filter, below min_matches
        assert_eq!(outcome.events[0].status, RetrievalEventStatus::Empty);
        assert_eq!(outcome.events[0].matches_count, 1);
    }

    #[tokio::test]
    async fn store_error_counts_as_failure_and_retries() {
        let store = Arc::new(ScriptedStore::new(vec![(
            "a",
            vec![
                Err(EngineError::node("index offline")),
                ScriptedStore::response(vec![make_match(0.8)]),
            ],
        )]));
        let orchestrator = RetrievalOrchestrator::new(store, scope());
        let mut retrying = plan("a");
        retrying.max_retries = 1;
        let spec = spec_with(vec![retrying], RetrievalStrategy::Single);

        let outcome = orchestrator
            .run(&spec, &json!({}), &BTreeMap::new(), RetrievalState::default())
            .await;

        assert!(outcome.result.is_ok());
        assert_eq!(outcome.events[0].status, RetrievalEventStatus::Failed);
        assert_eq!(outcome.events[1].status, RetrievalEventStatus::Success);
        assert_eq!(outcome.budget.total_failures, 1);
        assert_eq!(outcome.budget.total_successes, 1);
        assert_eq!(outcome.budget.total_requests, 2);
    }

    #[test]
    fn spec_parses_retrievers_and_strategy() {
        let config = json!({
            "retrievers": [
                {"key": "faq", "queryTemplate": "{{q}}", "topK": 3},
                {"key": "docs", "queryTemplate": "{{q}} docs", "minScore": 0.4}
            ],
            "strategy": "first-non-empty",
            "speculative": true,
            "injectAs": "_docs"
        })
        .as_object()
        .cloned()
        .unwrap();
        let spec = RetrievalSpec::parse(&config).unwrap();
        assert_eq!(spec.retrievers.len(), 2);
        assert_eq!(spec.strategy, RetrievalStrategy::FirstNonEmpty);
        assert!(spec.speculative);
        assert_eq!(spec.inject_as, "_docs");
        assert_eq!(spec.retrievers[0].top_k, 3);
        assert_eq!(spec.retrievers[1].min_score, 0.4);
    }

    #[test]
    fn spec_parses_flat_single_retriever() {
        let config = json!({"query": "find {{x}}", "topK": 2})
            .as_object()
            .cloned()
            .unwrap();
        let spec = RetrievalSpec::parse(&config).unwrap();
        assert_eq!(spec.retrievers.len(), 1);
        assert_eq!(spec.strategy, RetrievalStrategy::Single);
        assert_eq!(spec.retrievers[0].key, "default");
    }

    #[test]
    fn unknown_strategy_is_rejected() {
        let config = json!({"query": "x", "strategy": "psychic"})
            .as_object()
            .cloned()
            .unwrap();
        assert!(matches!(
            RetrievalSpec::parse(&config).unwrap_err(),
            EngineError::Validation(_)
        ));
    }
}
