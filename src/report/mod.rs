//! Report assembly and rendering.

pub mod generator;

pub use generator::{generate_json_report, generate_markdown_report};

use crate::models::{AnalysisResult, RecommendationResult};
use chrono::{DateTime, Utc};
use serde::Serialize;

/// Everything one CLI invocation produced.
#[derive(Debug, Clone, Serialize)]
pub struct Report {
    pub metadata: ReportMetadata,
    pub goals: Vec<GoalReport>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub failures: Vec<GoalFailure>,
}

#[derive(Debug, Clone, Serialize)]
pub struct ReportMetadata {
    pub dataset: String,
    pub domain: String,
    pub generated_at: DateTime<Utc>,
    pub model_used: String,
    pub offline: bool,
    pub rows: usize,
    pub duration_seconds: f64,
}

/// Analysis and recommendations for one goal.
#[derive(Debug, Clone, Serialize)]
pub struct GoalReport {
    pub analysis: AnalysisResult,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub recommendations: Option<RecommendationResult>,
}

/// A goal that failed before producing an analysis.
#[derive(Debug, Clone, Serialize)]
pub struct GoalFailure {
    pub goal: String,
    pub kind: String,
    pub message: String,
}

impl Report {
    /// True if any run ended aborted.
    pub fn has_aborted_runs(&self) -> bool {
        self.goals
            .iter()
            .any(|g| g.analysis.run_state.is_aborted())
    }

    pub fn total_tokens(&self) -> usize {
        self.goals.iter().map(|g| g.analysis.usage.total_tokens).sum()
    }

    pub fn total_cost_usd(&self) -> f64 {
        self.goals.iter().map(|g| g.analysis.usage.total_cost_usd).sum()
    }
}
