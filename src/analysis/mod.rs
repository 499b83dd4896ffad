//! Analysis engine.
//!
//! Maps a goal name to its chain, checks the dataset against the goal's
//! minimum shape, drives the orchestrator and folds the run into an
//! [`AnalysisResult`]. Fatal problems (unknown goal, insufficient data, no
//! budget) are returned before any run starts and leave no metrics behind.

pub mod diagnosis;

pub use diagnosis::DiagnosisPolicy;

use crate::dataset::Dataset;
use crate::error::AnalysisError;
use crate::llm::ModelInvoker;
use crate::metrics::MetricsCollector;
use crate::models::{AnalysisResult, StageKind};
use crate::orchestrator::{ChainOrchestrator, ChainRun, OrchestratorConfig};
use crate::registry::{Goal, GoalRegistry};
use crate::stages::{metrics_to_watch, stage_for};
use crate::tokens::TokenBudget;
use chrono::Utc;
use futures::future::join_all;
use std::sync::{Arc, RwLock};
use std::time::Duration;
use tokio::sync::Semaphore;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};
use uuid::Uuid;

/// Engine-wide settings.
#[derive(Debug, Clone)]
pub struct EngineConfig {
    pub orchestrator: OrchestratorConfig,
    /// Default budget when neither the caller nor the goal sets one.
    pub budget: TokenBudget,
    /// Days an analysis stays valid.
    pub validity_days: i64,
    /// Default per-chain deadline.
    pub deadline: Option<Duration>,
    pub diagnosis: DiagnosisPolicy,
    /// Maximum chain runs in flight at once.
    pub concurrency: usize,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            orchestrator: OrchestratorConfig::default(),
            budget: TokenBudget::default(),
            validity_days: 7,
            deadline: None,
            diagnosis: DiagnosisPolicy::default(),
            concurrency: 4,
        }
    }
}

/// Per-request overrides.
#[derive(Debug, Clone, Default)]
pub struct AnalysisConstraints {
    pub max_tokens: Option<usize>,
    pub max_cost_usd: Option<f64>,
    pub deadline: Option<Duration>,
    /// Explicit pipeline id; generated when absent.
    pub pipeline_id: Option<String>,
}

/// Generates a pipeline id of the form `run_<8 hex>`.
pub fn new_pipeline_id() -> String {
    let id = Uuid::new_v4().simple().to_string();
    format!("run_{}", &id[..8])
}

/// Goal-driven analysis over a normalized dataset.
pub struct AnalysisEngine {
    registry: RwLock<Arc<GoalRegistry>>,
    orchestrator: ChainOrchestrator,
    metrics: Arc<MetricsCollector>,
    permits: Arc<Semaphore>,
    config: EngineConfig,
}

impl AnalysisEngine {
    /// Create an engine. Without an invoker every stage uses offline statistics.
    pub fn new(
        registry: Arc<GoalRegistry>,
        invoker: Option<Arc<dyn ModelInvoker>>,
        metrics: Arc<MetricsCollector>,
        config: EngineConfig,
    ) -> Self {
        let orchestrator =
            ChainOrchestrator::new(invoker, config.orchestrator.clone(), Arc::clone(&metrics));
        info!(
            goals = registry.len(),
            domain = registry.domain(),
            offline = orchestrator.is_offline(),
            concurrency = config.concurrency,
            "Analysis engine ready"
        );
        Self {
            registry: RwLock::new(registry),
            orchestrator,
            metrics,
            permits: Arc::new(Semaphore::new(config.concurrency.max(1))),
            config,
        }
    }

    /// Current registry snapshot.
    pub fn registry(&self) -> Arc<GoalRegistry> {
        match self.registry.read() {
            Ok(guard) => Arc::clone(&guard),
            Err(poisoned) => Arc::clone(&poisoned.into_inner()),
        }
    }

    /// Swap in a reloaded registry. Runs in flight keep the one they started with.
    pub fn replace_registry(&self, registry: Arc<GoalRegistry>) {
        info!(goals = registry.len(), "Goal registry replaced");
        match self.registry.write() {
            Ok(mut guard) => *guard = registry,
            Err(poisoned) => *poisoned.into_inner() = registry,
        }
    }

    pub fn metrics(&self) -> &Arc<MetricsCollector> {
        &self.metrics
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    pub async fn analyze(
        &self,
        dataset: &Dataset,
        goal_id: &str,
        constraints: &AnalysisConstraints,
    ) -> Result<AnalysisResult, AnalysisError> {
        self.analyze_cancellable(dataset, goal_id, constraints, CancellationToken::new())
            .await
    }

    /// Analyze with a caller-held cancellation token.
    pub async fn analyze_cancellable(
        &self,
        dataset: &Dataset,
        goal_id: &str,
        constraints: &AnalysisConstraints,
        cancel: CancellationToken,
    ) -> Result<AnalysisResult, AnalysisError> {
        let registry = self.registry();
        let goal = registry
            .get(goal_id)
            .ok_or_else(|| AnalysisError::UnknownGoal {
                goal: goal_id.to_string(),
            })?;

        validate_dataset(goal, dataset)?;

        let budget = self.effective_budget(goal, constraints);
        if budget.max_tokens == 0 || budget.max_cost_usd.is_some_and(|c| c <= 0.0) {
            return Err(AnalysisError::BudgetExhausted {
                goal: goal.id.clone(),
            });
        }

        let pipeline_id = constraints
            .pipeline_id
            .clone()
            .unwrap_or_else(new_pipeline_id);

        // Wait for a run slot; a cancelled caller goes straight to the
        // orchestrator, which resolves the run as cancelled.
        let _permit = tokio::select! {
            permit = self.permits.acquire() => permit.ok(),
            _ = cancel.cancelled() => None,
        };

        let deadline = constraints
            .deadline
            .or(self.config.deadline)
            .map(|d| Instant::now() + d);

        debug!(
            pipeline_id = %pipeline_id,
            goal = %goal.id,
            max_tokens = budget.max_tokens,
            "Starting analysis"
        );

        let outcome = self
            .orchestrator
            .run(ChainRun {
                pipeline_id: pipeline_id.clone(),
                goal,
                dataset,
                budget,
                deadline,
                cancel,
            })
            .await;

        let diagnosis =
            diagnosis::assemble(self.config.diagnosis, &goal.id, &outcome.stages, &outcome.state);
        let confidence = diagnosis::overall_confidence(
            &outcome.state,
            &outcome.stages,
            !outcome.unresolved.is_empty(),
        );
        let metrics_to_watch = outcome
            .outputs
            .get(&StageKind::Prediction)
            .map(metrics_to_watch)
            .unwrap_or_default();

        let created_at = Utc::now();
        let expires_at = created_at + chrono::Duration::days(self.config.validity_days);

        info!(
            pipeline_id = %pipeline_id,
            goal = %goal.id,
            state = %outcome.state,
            confidence = %confidence,
            tokens = outcome.usage.total_tokens,
            "Analysis finished"
        );

        Ok(AnalysisResult {
            id: Uuid::new_v4(),
            pipeline_id,
            goal: goal.id.clone(),
            diagnosis,
            stages: outcome.stages,
            run_state: outcome.state,
            confidence,
            metrics_to_watch,
            usage: outcome.usage,
            warnings: outcome.warnings,
            created_at,
            expires_at,
        })
    }

    /// Analyze several goals over one dataset concurrently, bounded by the
    /// engine's concurrency limit. Results come back in request order.
    pub async fn analyze_batch(
        &self,
        dataset: &Dataset,
        goal_ids: &[String],
        constraints: &AnalysisConstraints,
    ) -> Vec<(String, Result<AnalysisResult, AnalysisError>)> {
        let runs = goal_ids.iter().map(|goal_id| async move {
            // Per-run ids; a shared explicit id would merge their metrics.
            let constraints = AnalysisConstraints {
                pipeline_id: None,
                ..constraints.clone()
            };
            let result = self.analyze(dataset, goal_id, &constraints).await;
            (goal_id.clone(), result)
        });
        join_all(runs).await
    }

    fn effective_budget(&self, goal: &Goal, constraints: &AnalysisConstraints) -> TokenBudget {
        let defaults = &self.config.budget;
        TokenBudget {
            model: goal
                .parameters
                .model
                .clone()
                .unwrap_or_else(|| defaults.model.clone()),
            max_tokens: constraints
                .max_tokens
                .or(goal.budget.max_tokens)
                .unwrap_or(defaults.max_tokens),
            max_output_tokens: defaults.max_output_tokens,
            max_cost_usd: constraints
                .max_cost_usd
                .or(goal.budget.max_cost_usd)
                .or(defaults.max_cost_usd),
        }
    }
}

/// Check the dataset has what the goal's stages need.
pub fn validate_dataset(goal: &Goal, dataset: &Dataset) -> Result<(), AnalysisError> {
    let insufficient = |reason: String| AnalysisError::InsufficientData {
        goal: goal.id.clone(),
        reason,
    };

    if dataset.is_empty() {
        return Err(insufficient("dataset has no rows".to_string()));
    }

    let mut required: Vec<&str> = goal.requirements.columns.iter().map(String::as_str).collect();
    if !required.contains(&goal.primary_metric.as_str()) {
        required.push(&goal.primary_metric);
    }
    let missing: Vec<&str> = required
        .into_iter()
        .filter(|col| !dataset.has_column(col))
        .collect();
    if !missing.is_empty() {
        return Err(insufficient(format!("missing column(s): {}", missing.join(", "))));
    }

    let min_rows = goal
        .stages
        .iter()
        .map(|s| stage_for(s.kind).min_rows())
        .chain(std::iter::once(goal.requirements.min_rows))
        .max()
        .unwrap_or(1);
    if dataset.len() < min_rows {
        return Err(insufficient(format!(
            "{} row(s) but at least {} required",
            dataset.len(),
            min_rows
        )));
    }

    Ok(())
}
