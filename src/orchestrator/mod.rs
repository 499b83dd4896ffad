//! Chain orchestrator.
//!
//! Runs a goal's stages strictly in order. Each stage renders its template
//! against the dataset and earlier outputs, passes the token optimizer, then
//! goes to the model (or the offline statistics when no model is bound).
//! Stage failures are contained in the returned records; only a failed
//! required stage or a cancellation aborts the run.

pub mod context;

pub use context::{ExecutionContext, PromptEnv};

use crate::dataset::Dataset;
use crate::error::InvocationError;
use crate::llm::{invoke_with_timeout, InvocationRequest, ModelInvoker};
use crate::metrics::{MetricsCollector, RunRecorder};
use crate::models::{
    AbortReason, RunState, SkipReason, StageErrorKind, StageKind, StageOutput, StageRecord,
    StageResult,
};
use crate::registry::{Goal, GoalStage};
use crate::stages::{stage_for, StageAnswer, StageInput};
use crate::tokens::{self, PreparedPrompt, TokenBudget, TokenOptimizer, TruncationPolicy, UsageSummary};
use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Retry schedule for transient invocation failures.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    /// Retries after the first attempt.
    pub max_retries: u32,
    pub backoff_base: Duration,
    pub backoff_max: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_retries: 3,
            backoff_base: Duration::from_millis(500),
            backoff_max: Duration::from_secs(8),
        }
    }
}

impl RetryPolicy {
    /// Delay before retry number `retry` (0-based): base * 2^retry, capped.
    pub fn backoff(&self, retry: u32) -> Duration {
        let factor = 2u32.saturating_pow(retry.min(16));
        self.backoff_base
            .saturating_mul(factor)
            .min(self.backoff_max)
    }
}

/// Settings shared by every run of one orchestrator.
#[derive(Debug, Clone)]
pub struct OrchestratorConfig {
    pub model: String,
    pub temperature: Option<f32>,
    /// Upper bound for one model call.
    pub attempt_timeout: Duration,
    pub retry: RetryPolicy,
    pub truncation: TruncationPolicy,
    pub max_prompt_rows: usize,
}

impl Default for OrchestratorConfig {
    fn default() -> Self {
        Self {
            model: "llama3.2:latest".to_string(),
            temperature: None,
            attempt_timeout: Duration::from_secs(120),
            retry: RetryPolicy::default(),
            truncation: TruncationPolicy::Tail,
            max_prompt_rows: 50,
        }
    }
}

/// One chain run request.
pub struct ChainRun<'a> {
    pub pipeline_id: String,
    pub goal: &'a Goal,
    pub dataset: &'a Dataset,
    pub budget: TokenBudget,
    /// Overall deadline for the whole chain, separate from the per-attempt timeout.
    pub deadline: Option<Instant>,
    pub cancel: CancellationToken,
}

/// Terminal state of a run plus everything it produced.
#[derive(Debug)]
pub struct RunOutcome {
    pub state: RunState,
    /// One record per declared stage, in declared order.
    pub stages: Vec<StageRecord>,
    pub outputs: BTreeMap<StageKind, StageOutput>,
    pub usage: UsageSummary,
    pub warnings: Vec<String>,
    /// Placeholders left unresolved in any rendered prompt.
    pub unresolved: Vec<String>,
}

/// How one stage ended, before required/optional branching.
enum StageOutcome {
    Answered {
        answer: StageAnswer,
        output_tokens: usize,
        billable: bool,
        attempts: u32,
    },
    Failed {
        kind: StageErrorKind,
        message: String,
        attempts: u32,
        /// Output tokens the model spent on an answer we could not use.
        spent_output_tokens: Option<usize>,
    },
    Cancelled {
        attempts: u32,
    },
    DeadlineExceeded {
        attempts: u32,
    },
}

/// Executes chains against an optional model invoker.
pub struct ChainOrchestrator {
    invoker: Option<Arc<dyn ModelInvoker>>,
    config: OrchestratorConfig,
    metrics: Arc<MetricsCollector>,
}

impl ChainOrchestrator {
    pub fn new(
        invoker: Option<Arc<dyn ModelInvoker>>,
        config: OrchestratorConfig,
        metrics: Arc<MetricsCollector>,
    ) -> Self {
        Self {
            invoker,
            config,
            metrics,
        }
    }

    pub fn config(&self) -> &OrchestratorConfig {
        &self.config
    }

    /// True when stages are answered by the offline statistics.
    pub fn is_offline(&self) -> bool {
        self.invoker.is_none()
    }

    /// Run a chain to a terminal state.
    pub async fn run(&self, run: ChainRun<'_>) -> RunOutcome {
        let goal = run.goal;
        let recorder = self.metrics.begin_run(run.pipeline_id.clone(), goal.id.clone());
        recorder.run_started(goal.stages.len(), run.budget.max_tokens);

        let env = PromptEnv {
            goal,
            dataset: run.dataset,
            max_prompt_rows: self.config.max_prompt_rows,
        };
        let mut optimizer = TokenOptimizer::new(run.budget.clone(), self.config.truncation);
        let mut ctx = ExecutionContext::new();
        let mut records: Vec<StageRecord> = Vec::with_capacity(goal.stages.len());

        let mut degraded = false;
        let mut abort: Option<AbortReason> = None;
        // Once set, every remaining stage is skipped with this reason.
        let mut halt: Option<SkipReason> = None;

        for (index, stage) in goal.stages.iter().enumerate() {
            let name = stage.kind.name();

            if let Some(reason) = &halt {
                records.push(skipped(stage, reason.clone()));
                continue;
            }

            if run.cancel.is_cancelled() {
                info!(pipeline_id = %run.pipeline_id, stage = name, "Run cancelled");
                abort = Some(AbortReason::Cancelled);
                halt = Some(SkipReason::Cancelled);
                records.push(skipped(stage, SkipReason::Cancelled));
                continue;
            }

            if run.deadline.is_some_and(|d| Instant::now() >= d) {
                warn!(pipeline_id = %run.pipeline_id, stage = name, "Chain deadline exceeded");
                degraded = true;
                halt = Some(SkipReason::DeadlineExceeded);
                records.push(skipped(stage, SkipReason::DeadlineExceeded));
                continue;
            }

            let running = RunState::Running { stage: index };
            debug!(pipeline_id = %run.pipeline_id, state = %running, stage = name, "Entering stage");

            let prompt = ctx.render(stage.kind, &stage.template, &env);
            let prepared = match optimizer.prepare(name, &prompt) {
                Ok(prepared) => prepared,
                Err(_) => {
                    warn!(
                        pipeline_id = %run.pipeline_id,
                        stage = name,
                        used = optimizer.used_tokens(),
                        "Token budget exhausted, skipping remaining stages"
                    );
                    ctx.warn(format!("{}: token budget exhausted", name));
                    degraded = true;
                    halt = Some(SkipReason::BudgetExhausted);
                    records.push(skipped(stage, SkipReason::BudgetExhausted));
                    continue;
                }
            };

            let started = Instant::now();
            let outcome = self.execute_stage(stage, &prepared, &run, &recorder).await;
            let duration_ms = started.elapsed().as_millis() as u64;

            match outcome {
                StageOutcome::Answered {
                    answer,
                    output_tokens,
                    billable,
                    attempts,
                } => {
                    let used = optimizer.record(name, &prepared, output_tokens, billable);
                    let cost = if billable {
                        tokens::estimate_cost(
                            prepared.input_tokens,
                            used - prepared.input_tokens,
                            &run.budget.model,
                        )
                    } else {
                        0.0
                    };
                    recorder.stage_completed(name, true, duration_ms, used, cost, attempts, None);

                    ctx.record_output(stage.kind, answer.output.clone(), used, cost);
                    records.push(StageRecord {
                        stage: stage.kind,
                        required: stage.required,
                        result: StageResult::Success {
                            output: answer.output,
                            confidence: answer.confidence,
                            tokens_used: used,
                        },
                    });
                }
                StageOutcome::Failed {
                    kind,
                    message,
                    attempts,
                    spent_output_tokens,
                } => {
                    let (mut used, mut cost) = (0, 0.0);
                    if let Some(output_tokens) = spent_output_tokens {
                        used = optimizer.record(name, &prepared, output_tokens, true);
                        cost = tokens::estimate_cost(
                            prepared.input_tokens,
                            used - prepared.input_tokens,
                            &run.budget.model,
                        );
                        ctx.add_usage(used, cost);
                    }
                    recorder.stage_completed(
                        name,
                        false,
                        duration_ms,
                        used,
                        cost,
                        attempts,
                        Some(format!("{}: {}", kind, message)),
                    );

                    if stage.required {
                        warn!(
                            pipeline_id = %run.pipeline_id,
                            stage = name,
                            "Required stage failed, aborting run"
                        );
                        abort = Some(AbortReason::RequiredStageFailed { stage: stage.kind });
                        halt = Some(SkipReason::NotReached);
                        records.push(StageRecord {
                            stage: stage.kind,
                            required: true,
                            result: StageResult::Failed {
                                error_kind: kind,
                                message,
                            },
                        });
                    } else {
                        ctx.warn(format!("{}: optional stage failed: {}", name, message));
                        degraded = true;
                        records.push(skipped(
                            stage,
                            SkipReason::Failed {
                                error_kind: kind,
                                message,
                            },
                        ));
                    }
                }
                StageOutcome::Cancelled { attempts } => {
                    recorder.stage_completed(
                        name,
                        false,
                        duration_ms,
                        0,
                        0.0,
                        attempts,
                        Some("cancelled".to_string()),
                    );
                    abort = Some(AbortReason::Cancelled);
                    halt = Some(SkipReason::Cancelled);
                    records.push(skipped(stage, SkipReason::Cancelled));
                }
                StageOutcome::DeadlineExceeded { attempts } => {
                    recorder.stage_completed(
                        name,
                        false,
                        duration_ms,
                        0,
                        0.0,
                        attempts,
                        Some("deadline exceeded".to_string()),
                    );
                    ctx.warn(format!("{}: chain deadline exceeded", name));
                    degraded = true;
                    halt = Some(SkipReason::DeadlineExceeded);
                    records.push(skipped(stage, SkipReason::DeadlineExceeded));
                }
            }
        }

        let state = match abort {
            Some(reason) => RunState::Aborted { reason },
            None if degraded => RunState::Degraded,
            None => RunState::Completed,
        };

        let usage = optimizer.summary();
        debug_assert_eq!(ctx.cumulative_tokens(), usage.total_tokens);
        recorder.run_finished(&state.to_string(), ctx.cumulative_tokens(), ctx.cumulative_cost());

        let (outputs, warnings, unresolved) = ctx.into_parts();
        RunOutcome {
            state,
            stages: records,
            outputs,
            usage,
            warnings,
            unresolved,
        }
    }

    async fn execute_stage(
        &self,
        stage: &GoalStage,
        prepared: &PreparedPrompt,
        run: &ChainRun<'_>,
        recorder: &RunRecorder,
    ) -> StageOutcome {
        let handler = stage_for(stage.kind);

        let Some(invoker) = &self.invoker else {
            let answer = handler.offline(&StageInput {
                dataset: run.dataset,
                metric: &run.goal.primary_metric,
                id_column: run.goal.id_column.as_deref(),
            });
            let output_tokens = serde_json::to_string(&answer.output.data)
                .map(|s| tokens::estimate(&s))
                .unwrap_or(1);
            return StageOutcome::Answered {
                answer,
                output_tokens,
                billable: false,
                attempts: 1,
            };
        };

        let model = run
            .goal
            .parameters
            .model
            .clone()
            .unwrap_or_else(|| self.config.model.clone());
        let max_output_tokens = run
            .goal
            .parameters
            .max_tokens
            .map_or(prepared.max_output_tokens, |m| m.min(prepared.max_output_tokens));

        let mut attempts = 0u32;
        loop {
            if run.cancel.is_cancelled() {
                return StageOutcome::Cancelled { attempts };
            }

            let mut timeout = self.config.attempt_timeout;
            if let Some(deadline) = run.deadline {
                let left = deadline.saturating_duration_since(Instant::now());
                if left.is_zero() {
                    return StageOutcome::DeadlineExceeded { attempts };
                }
                timeout = timeout.min(left);
            }

            let request = InvocationRequest {
                prompt: prepared.prompt.clone(),
                model: model.clone(),
                max_output_tokens,
                temperature: run.goal.parameters.temperature.or(self.config.temperature),
                timeout,
            };

            attempts += 1;
            debug!(
                pipeline_id = recorder.pipeline_id(),
                stage = stage.kind.name(),
                attempt = attempts,
                invoker = invoker.name(),
                "Invoking model"
            );

            let error = match invoke_with_timeout(invoker.as_ref(), &request).await {
                Ok(raw) => {
                    let output_tokens = tokens::estimate(&raw);
                    return match handler.parse(&raw) {
                        Ok(answer) => StageOutcome::Answered {
                            answer,
                            output_tokens,
                            billable: true,
                            attempts,
                        },
                        Err(message) => StageOutcome::Failed {
                            kind: StageErrorKind::Parse,
                            message,
                            attempts,
                            spent_output_tokens: Some(output_tokens),
                        },
                    };
                }
                Err(error) => error,
            };

            if run.deadline.is_some_and(|d| Instant::now() >= d) {
                return StageOutcome::DeadlineExceeded { attempts };
            }

            let retry = attempts - 1;
            if !error.is_transient() || retry >= self.config.retry.max_retries {
                return StageOutcome::Failed {
                    kind: error_kind(&error),
                    message: if error.is_transient() {
                        format!("{} (after {} attempts)", error, attempts)
                    } else {
                        error.to_string()
                    },
                    attempts,
                    spent_output_tokens: None,
                };
            }

            let delay = self.config.retry.backoff(retry);
            warn!(
                pipeline_id = recorder.pipeline_id(),
                stage = stage.kind.name(),
                attempt = attempts,
                delay_ms = delay.as_millis() as u64,
                error = %error,
                "Transient model failure, retrying"
            );

            tokio::select! {
                _ = run.cancel.cancelled() => return StageOutcome::Cancelled { attempts },
                _ = tokio::time::sleep(delay) => {}
            }
        }
    }
}

fn skipped(stage: &GoalStage, reason: SkipReason) -> StageRecord {
    StageRecord {
        stage: stage.kind,
        required: stage.required,
        result: StageResult::Skipped { reason },
    }
}

fn error_kind(error: &InvocationError) -> StageErrorKind {
    match error {
        InvocationError::Timeout { .. } => StageErrorKind::Timeout,
        InvocationError::Malformed(_) => StageErrorKind::Parse,
        InvocationError::Transport(_) | InvocationError::Rejected { .. } => StageErrorKind::Invocation,
    }
}
