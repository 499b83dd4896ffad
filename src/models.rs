//! Data models for the analysis core.
//!
//! This module contains the result structures produced by a chain run and by
//! the recommendation engine. Everything here is `Serialize`/`Deserialize` so a
//! storage or presentation collaborator can take the records as JSON.

use crate::tokens::UsageSummary;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use uuid::Uuid;

/// Priority of a recommended action.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Priority {
    Low,
    Medium,
    High,
}

impl fmt::Display for Priority {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Priority::Low => write!(f, "Low"),
            Priority::Medium => write!(f, "Medium"),
            Priority::High => write!(f, "High"),
        }
    }
}

impl Priority {
    /// Returns an emoji representation of the priority.
    pub fn emoji(&self) -> &'static str {
        match self {
            Priority::Low => "🟢",
            Priority::Medium => "🟡",
            Priority::High => "🔴",
        }
    }
}

/// Implementation effort of a recommended action.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Effort {
    Low,
    Medium,
    High,
}

impl fmt::Display for Effort {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Effort::Low => write!(f, "Low"),
            Effort::Medium => write!(f, "Medium"),
            Effort::High => write!(f, "High"),
        }
    }
}

/// Confidence reported by a stage or derived for a whole analysis.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Confidence {
    Low,
    Medium,
    High,
}

impl fmt::Display for Confidence {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Confidence::Low => write!(f, "low"),
            Confidence::Medium => write!(f, "medium"),
            Confidence::High => write!(f, "high"),
        }
    }
}

impl From<&str> for Confidence {
    /// Lenient parse used on model output; anything unrecognised is `Medium`.
    fn from(s: &str) -> Self {
        match s.trim().to_lowercase().as_str() {
            "high" => Confidence::High,
            "low" => Confidence::Low,
            _ => Confidence::Medium,
        }
    }
}

/// The kinds of reasoning stage a chain can contain.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StageKind {
    Trend,
    Anomaly,
    Ranking,
    Prediction,
}

impl StageKind {
    pub const ALL: [StageKind; 4] = [
        StageKind::Trend,
        StageKind::Anomaly,
        StageKind::Ranking,
        StageKind::Prediction,
    ];

    /// The stage name as used in goal files and placeholders.
    pub fn name(&self) -> &'static str {
        match self {
            StageKind::Trend => "trend",
            StageKind::Anomaly => "anomaly",
            StageKind::Ranking => "ranking",
            StageKind::Prediction => "prediction",
        }
    }
}

impl fmt::Display for StageKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

impl FromStr for StageKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "trend" => Ok(StageKind::Trend),
            "anomaly" => Ok(StageKind::Anomaly),
            "ranking" => Ok(StageKind::Ranking),
            "prediction" => Ok(StageKind::Prediction),
            other => Err(format!("unknown stage kind '{}'", other)),
        }
    }
}

/// Structured output of a successful stage.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StageOutput {
    /// One-line finding used when assembling the diagnosis.
    pub headline: String,
    /// The full structured payload (model JSON or offline statistics).
    pub data: serde_json::Value,
}

/// Why a stage failed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StageErrorKind {
    /// Model call failed (transport, rejected request) after retries.
    Invocation,
    /// Every attempt timed out.
    Timeout,
    /// The model answered but the output did not have the expected structure.
    Parse,
}

impl fmt::Display for StageErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            StageErrorKind::Invocation => write!(f, "invocation"),
            StageErrorKind::Timeout => write!(f, "timeout"),
            StageErrorKind::Parse => write!(f, "parse"),
        }
    }
}

/// Why a stage did not produce output.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "reason", rename_all = "snake_case")]
pub enum SkipReason {
    BudgetExhausted,
    NotReached,
    Cancelled,
    DeadlineExceeded,
    /// An optional stage failed; the chain carried on without it.
    Failed {
        error_kind: StageErrorKind,
        message: String,
    },
}

impl fmt::Display for SkipReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SkipReason::BudgetExhausted => write!(f, "budget exhausted"),
            SkipReason::NotReached => write!(f, "not reached"),
            SkipReason::Cancelled => write!(f, "cancelled"),
            SkipReason::DeadlineExceeded => write!(f, "deadline exceeded"),
            SkipReason::Failed {
                error_kind,
                message,
            } => write!(f, "failed ({}): {}", error_kind, message),
        }
    }
}

/// Tagged outcome of one stage.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum StageResult {
    Success {
        output: StageOutput,
        confidence: Confidence,
        tokens_used: usize,
    },
    Skipped {
        #[serde(flatten)]
        reason: SkipReason,
    },
    Failed {
        error_kind: StageErrorKind,
        message: String,
    },
}

impl StageResult {
    pub fn is_success(&self) -> bool {
        matches!(self, StageResult::Success { .. })
    }

    /// Output of a successful stage.
    pub fn output(&self) -> Option<&StageOutput> {
        match self {
            StageResult::Success { output, .. } => Some(output),
            _ => None,
        }
    }

    /// Tokens consumed by a successful stage, zero otherwise.
    pub fn tokens_used(&self) -> usize {
        match self {
            StageResult::Success { tokens_used, .. } => *tokens_used,
            _ => 0,
        }
    }

    pub fn confidence(&self) -> Option<Confidence> {
        match self {
            StageResult::Success { confidence, .. } => Some(*confidence),
            _ => None,
        }
    }

    /// Short status label for reports.
    pub fn label(&self) -> &'static str {
        match self {
            StageResult::Success { .. } => "success",
            StageResult::Skipped { .. } => "skipped",
            StageResult::Failed { .. } => "failed",
        }
    }
}

/// One entry of the per-stage result list, in declared chain order.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StageRecord {
    pub stage: StageKind,
    pub required: bool,
    pub result: StageResult,
}

/// Why a run was aborted.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "reason", rename_all = "snake_case")]
pub enum AbortReason {
    RequiredStageFailed { stage: StageKind },
    Cancelled,
}

impl fmt::Display for AbortReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            AbortReason::RequiredStageFailed { stage } => {
                write!(f, "required stage '{}' failed", stage)
            }
            AbortReason::Cancelled => write!(f, "cancelled"),
        }
    }
}

/// State of a chain run.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "state", rename_all = "snake_case")]
pub enum RunState {
    Pending,
    Running { stage: usize },
    Completed,
    Degraded,
    Aborted { reason: AbortReason },
}

impl RunState {
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            RunState::Completed | RunState::Degraded | RunState::Aborted { .. }
        )
    }

    pub fn is_aborted(&self) -> bool {
        matches!(self, RunState::Aborted { .. })
    }
}

impl fmt::Display for RunState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RunState::Pending => write!(f, "pending"),
            RunState::Running { stage } => write!(f, "running (stage {})", stage + 1),
            RunState::Completed => write!(f, "completed"),
            RunState::Degraded => write!(f, "degraded"),
            RunState::Aborted { reason } => write!(f, "aborted: {}", reason),
        }
    }
}

/// A metric the caller should track after acting on the analysis.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MetricToWatch {
    pub metric: String,
    pub target: String,
    pub period: String,
}

/// Structured diagnosis for one goal.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AnalysisResult {
    /// Unique id, referenced by recommendation results.
    pub id: Uuid,
    /// Pipeline id used in logs and metric events.
    pub pipeline_id: String,
    pub goal: String,
    /// Natural-language summary assembled from stage outputs.
    pub diagnosis: String,
    /// Exactly one entry per declared stage, in declared order.
    pub stages: Vec<StageRecord>,
    pub run_state: RunState,
    pub confidence: Confidence,
    pub metrics_to_watch: Vec<MetricToWatch>,
    pub usage: UsageSummary,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub warnings: Vec<String>,
    pub created_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
}

impl AnalysisResult {
    /// Returns the record of a stage, if the goal declared it.
    pub fn stage(&self, kind: StageKind) -> Option<&StageRecord> {
        self.stages.iter().find(|r| r.stage == kind)
    }

    /// Returns true if the given stage produced output.
    pub fn stage_succeeded(&self, kind: StageKind) -> bool {
        self.stage(kind).map(|r| r.result.is_success()).unwrap_or(false)
    }

    /// Total tokens used across successful stages.
    pub fn tokens_used(&self) -> usize {
        self.stages.iter().map(|r| r.result.tokens_used()).sum()
    }

    /// Returns true once the validity window has passed.
    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        now >= self.expires_at
    }
}

/// A single recommended action.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Action {
    pub id: String,
    pub description: String,
    pub priority: Priority,
    pub effort: Effort,
    /// Estimated impact score (higher is better), used as the secondary sort key.
    pub impact: f64,
    /// Human-readable expected effect, e.g. "CTR +5-15%".
    pub impact_metric: String,
    pub rationale: String,
    /// Estimated cost in USD.
    pub estimated_cost: f64,
}

/// Kind of caller-visible advisory attached to a recommendation result.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AdvisoryKind {
    LowConfidence,
}

/// A non-fatal signal that the recommendations rest on weak evidence.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Advisory {
    pub kind: AdvisoryKind,
    pub message: String,
}

/// Ranked, budget-filtered actions for one goal.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RecommendationResult {
    pub goal: String,
    /// Id of the analysis these actions were derived from.
    pub analysis_id: Uuid,
    /// Accepted actions, sorted by priority, impact, then declaration order.
    pub actions: Vec<Action>,
    pub total_estimated_cost: f64,
    pub budget: f64,
    /// Ids of candidates that did not fit the budget.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub rejected_for_cost: Vec<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub advisory: Option<Advisory>,
    pub created_at: DateTime<Utc>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_priority_ordering() {
        assert!(Priority::Low < Priority::Medium);
        assert!(Priority::Medium < Priority::High);
        assert!(Confidence::Low < Confidence::High);
    }

    #[test]
    fn test_stage_kind_from_str() {
        assert_eq!("trend".parse::<StageKind>(), Ok(StageKind::Trend));
        assert_eq!("Prediction".parse::<StageKind>(), Ok(StageKind::Prediction));
        assert!("sentiment".parse::<StageKind>().is_err());
        for kind in StageKind::ALL {
            assert_eq!(kind.name().parse::<StageKind>(), Ok(kind));
        }
    }

    #[test]
    fn test_confidence_from_str() {
        assert_eq!(Confidence::from("HIGH"), Confidence::High);
        assert_eq!(Confidence::from(" low "), Confidence::Low);
        assert_eq!(Confidence::from("somewhat"), Confidence::Medium);
    }

    #[test]
    fn test_stage_result_serialization_is_tagged() {
        let skipped = StageResult::Skipped {
            reason: SkipReason::BudgetExhausted,
        };
        let json = serde_json::to_value(&skipped).unwrap();
        assert_eq!(json["status"], "skipped");
        assert_eq!(json["reason"], "budget_exhausted");

        let failed_optional = StageResult::Skipped {
            reason: SkipReason::Failed {
                error_kind: StageErrorKind::Parse,
                message: "not json".to_string(),
            },
        };
        let json = serde_json::to_value(&failed_optional).unwrap();
        assert_eq!(json["reason"], "failed");
        assert_eq!(json["error_kind"], "parse");

        let back: StageResult = serde_json::from_value(json).unwrap();
        assert_eq!(back, failed_optional);
    }

    #[test]
    fn test_run_state_display() {
        let aborted = RunState::Aborted {
            reason: AbortReason::RequiredStageFailed {
                stage: StageKind::Trend,
            },
        };
        assert!(aborted.is_terminal());
        assert!(aborted.is_aborted());
        assert_eq!(aborted.to_string(), "aborted: required stage 'trend' failed");
        assert!(!RunState::Running { stage: 0 }.is_terminal());
    }

    #[test]
    fn test_stage_result_accessors() {
        let success = StageResult::Success {
            output: StageOutput {
                headline: "up".to_string(),
                data: serde_json::json!({}),
            },
            confidence: Confidence::High,
            tokens_used: 42,
        };
        assert!(success.is_success());
        assert_eq!(success.tokens_used(), 42);
        assert_eq!(success.confidence(), Some(Confidence::High));
        assert_eq!(success.output().map(|o| o.headline.as_str()), Some("up"));

        let failed = StageResult::Failed {
            error_kind: StageErrorKind::Invocation,
            message: "boom".to_string(),
        };
        assert_eq!(failed.tokens_used(), 0);
        assert_eq!(failed.label(), "failed");
    }
}
