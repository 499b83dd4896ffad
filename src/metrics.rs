//! Append-only run metrics.
//!
//! Every chain run reports a `RunStarted`, one `StageCompleted` per executed
//! stage and a `RunFinished` event. Events are self-contained, so any number of
//! runs can write into one shared collector. Each event is also emitted as a
//! tracing event.

use chrono::{DateTime, Utc};
use serde::Serialize;
use std::sync::{Arc, Mutex, MutexGuard};
use tokio::time::Instant;
use tracing::{info, warn};

/// What happened.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum MetricEventKind {
    RunStarted {
        stages: usize,
        max_tokens: usize,
    },
    StageCompleted {
        stage: String,
        success: bool,
        duration_ms: u64,
        tokens: usize,
        cost_usd: f64,
        attempts: u32,
        #[serde(skip_serializing_if = "Option::is_none")]
        error: Option<String>,
    },
    RunFinished {
        state: String,
        total_tokens: usize,
        total_cost_usd: f64,
        duration_ms: u64,
    },
}

/// One metrics record.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct MetricEvent {
    pub pipeline_id: String,
    pub goal: String,
    pub timestamp: DateTime<Utc>,
    /// Milliseconds since the run started; never decreases within a run.
    pub offset_ms: u64,
    #[serde(flatten)]
    pub kind: MetricEventKind,
}

/// Shared, append-only event sink.
#[derive(Debug, Default)]
pub struct MetricsCollector {
    events: Mutex<Vec<MetricEvent>>,
}

impl MetricsCollector {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, Vec<MetricEvent>> {
        // A writer that panicked mid-push leaves a valid Vec behind.
        self.events.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Start recording one run.
    pub fn begin_run(
        self: &Arc<Self>,
        pipeline_id: impl Into<String>,
        goal: impl Into<String>,
    ) -> RunRecorder {
        RunRecorder {
            collector: Arc::clone(self),
            pipeline_id: pipeline_id.into(),
            goal: goal.into(),
            started: Instant::now(),
        }
    }

    pub fn record(&self, event: MetricEvent) {
        self.lock().push(event);
    }

    /// Copy of all events recorded so far.
    pub fn snapshot(&self) -> Vec<MetricEvent> {
        self.lock().clone()
    }

    /// Events of one run, in recording order.
    pub fn events_for(&self, pipeline_id: &str) -> Vec<MetricEvent> {
        self.lock()
            .iter()
            .filter(|e| e.pipeline_id == pipeline_id)
            .cloned()
            .collect()
    }

    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.lock().is_empty()
    }
}

/// Per-run handle that stamps events with the run's id and elapsed time.
#[derive(Debug, Clone)]
pub struct RunRecorder {
    collector: Arc<MetricsCollector>,
    pipeline_id: String,
    goal: String,
    started: Instant,
}

impl RunRecorder {
    pub fn pipeline_id(&self) -> &str {
        &self.pipeline_id
    }

    /// Milliseconds since the run started.
    pub fn elapsed_ms(&self) -> u64 {
        self.started.elapsed().as_millis() as u64
    }

    fn emit(&self, kind: MetricEventKind) {
        self.collector.record(MetricEvent {
            pipeline_id: self.pipeline_id.clone(),
            goal: self.goal.clone(),
            timestamp: Utc::now(),
            offset_ms: self.elapsed_ms(),
            kind,
        });
    }

    pub fn run_started(&self, stages: usize, max_tokens: usize) {
        info!(
            pipeline_id = %self.pipeline_id,
            goal = %self.goal,
            stages,
            max_tokens,
            "Chain run started"
        );
        self.emit(MetricEventKind::RunStarted { stages, max_tokens });
    }

    #[allow(clippy::too_many_arguments)]
    pub fn stage_completed(
        &self,
        stage: &str,
        success: bool,
        duration_ms: u64,
        tokens: usize,
        cost_usd: f64,
        attempts: u32,
        error: Option<String>,
    ) {
        match &error {
            None => info!(
                pipeline_id = %self.pipeline_id,
                stage,
                duration_ms,
                tokens,
                attempts,
                "Stage completed"
            ),
            Some(error) => warn!(
                pipeline_id = %self.pipeline_id,
                stage,
                duration_ms,
                attempts,
                error = %error,
                "Stage failed"
            ),
        }
        self.emit(MetricEventKind::StageCompleted {
            stage: stage.to_string(),
            success,
            duration_ms,
            tokens,
            cost_usd,
            attempts,
            error,
        });
    }

    pub fn run_finished(&self, state: &str, total_tokens: usize, total_cost_usd: f64) {
        let duration_ms = self.elapsed_ms();
        info!(
            pipeline_id = %self.pipeline_id,
            goal = %self.goal,
            state,
            total_tokens,
            total_cost_usd,
            duration_ms,
            "Chain run finished"
        );
        self.emit(MetricEventKind::RunFinished {
            state: state.to_string(),
            total_tokens,
            total_cost_usd,
            duration_ms,
        });
    }
}
