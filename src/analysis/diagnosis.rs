//! Diagnosis text and overall confidence.

use crate::models::{Confidence, RunState, StageKind, StageRecord};
use serde::{Deserialize, Serialize};

/// How stage headlines are folded into the diagnosis.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DiagnosisPolicy {
    /// First successful headline, plus the prediction headline when present.
    #[default]
    FirstHeadline,
    /// Every successful headline, in chain order.
    AllHeadlines,
}

fn sentence(text: &str) -> String {
    let text = text.trim();
    if text.ends_with(['.', '!', '?']) {
        text.to_string()
    } else {
        format!("{}.", text)
    }
}

/// Build the diagnosis. Never empty, and identical for identical records.
pub fn assemble(
    policy: DiagnosisPolicy,
    goal: &str,
    stages: &[StageRecord],
    state: &RunState,
) -> String {
    let headlines: Vec<(StageKind, &str)> = stages
        .iter()
        .filter_map(|r| r.result.output().map(|o| (r.stage, o.headline.as_str())))
        .collect();

    let mut parts: Vec<String> = Vec::new();
    match policy {
        DiagnosisPolicy::FirstHeadline => {
            if let Some((first_kind, first)) = headlines.first() {
                parts.push(sentence(first));
                let prediction = headlines
                    .iter()
                    .find(|(kind, _)| *kind == StageKind::Prediction);
                if let Some((kind, outlook)) = prediction {
                    if kind != first_kind {
                        parts.push(format!("Outlook: {}", sentence(outlook)));
                    }
                }
            }
        }
        DiagnosisPolicy::AllHeadlines => {
            parts.extend(headlines.iter().map(|(_, h)| sentence(h)));
        }
    }

    if parts.is_empty() {
        parts.push(format!("No stage produced output for goal '{}'.", goal));
    }

    match state {
        RunState::Aborted { reason } => parts.push(format!("Analysis incomplete: {}.", reason)),
        RunState::Degraded => {
            let skipped = stages.iter().filter(|r| !r.result.is_success()).count();
            parts.push(format!("{} stage(s) did not contribute.", skipped));
        }
        _ => {}
    }

    parts.join(" ")
}

/// Overall confidence of an analysis.
///
/// `high` needs a completed run where every stage reported `high`; a degraded
/// or aborted run, or a prompt with unresolved placeholders, is `low`.
pub fn overall_confidence(state: &RunState, stages: &[StageRecord], unresolved: bool) -> Confidence {
    if unresolved {
        return Confidence::Low;
    }
    match state {
        RunState::Completed => {
            let all_high = !stages.is_empty()
                && stages
                    .iter()
                    .all(|r| r.result.confidence() == Some(Confidence::High));
            if all_high {
                Confidence::High
            } else {
                Confidence::Medium
            }
        }
        _ => Confidence::Low,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{AbortReason, SkipReason, StageOutput, StageResult};

    fn success(stage: StageKind, headline: &str, confidence: Confidence) -> StageRecord {
        StageRecord {
            stage,
            required: true,
            result: StageResult::Success {
                output: StageOutput {
                    headline: headline.to_string(),
                    data: serde_json::json!({}),
                },
                confidence,
                tokens_used: 10,
            },
        }
    }

    fn skipped(stage: StageKind) -> StageRecord {
        StageRecord {
            stage,
            required: false,
            result: StageResult::Skipped {
                reason: SkipReason::BudgetExhausted,
            },
        }
    }

    #[test]
    fn test_first_headline_with_outlook() {
        let stages = vec![
            success(StageKind::Trend, "Subscribers up 12%", Confidence::High),
            success(StageKind::Ranking, "v3 leads", Confidence::High),
            success(StageKind::Prediction, "Expect +150 next week", Confidence::Medium),
        ];
        let text = assemble(DiagnosisPolicy::FirstHeadline, "g", &stages, &RunState::Completed);
        assert_eq!(text, "Subscribers up 12%. Outlook: Expect +150 next week.");
    }

    #[test]
    fn test_all_headlines_and_degraded_note() {
        let stages = vec![
            success(StageKind::Trend, "Flat views.", Confidence::Medium),
            skipped(StageKind::Ranking),
        ];
        let text = assemble(DiagnosisPolicy::AllHeadlines, "g", &stages, &RunState::Degraded);
        assert_eq!(text, "Flat views. 1 stage(s) did not contribute.");
    }

    #[test]
    fn test_diagnosis_never_empty() {
        let state = RunState::Aborted {
            reason: AbortReason::Cancelled,
        };
        let text = assemble(
            DiagnosisPolicy::FirstHeadline,
            "increase_ctr",
            &[skipped(StageKind::Anomaly)],
            &state,
        );
        assert!(text.starts_with("No stage produced output for goal 'increase_ctr'."));
        assert!(text.ends_with("Analysis incomplete: cancelled."));
    }

    #[test]
    fn test_confidence_rules() {
        let all_high = vec![
            success(StageKind::Trend, "a", Confidence::High),
            success(StageKind::Ranking, "b", Confidence::High),
        ];
        let mixed = vec![
            success(StageKind::Trend, "a", Confidence::High),
            success(StageKind::Ranking, "b", Confidence::Medium),
        ];
        assert_eq!(overall_confidence(&RunState::Completed, &all_high, false), Confidence::High);
        assert_eq!(overall_confidence(&RunState::Completed, &mixed, false), Confidence::Medium);
        assert_eq!(overall_confidence(&RunState::Completed, &all_high, true), Confidence::Low);
        assert_eq!(overall_confidence(&RunState::Degraded, &all_high, false), Confidence::Low);
    }
}
