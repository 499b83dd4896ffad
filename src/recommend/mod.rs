//! Recommendation engine.
//!
//! Turns an [`AnalysisResult`] into a ranked list of actions drawn from the
//! goal's action catalogue, keeping the total estimated cost within budget.

use crate::error::AnalysisError;
use crate::models::{Action, Advisory, AdvisoryKind, AnalysisResult, Confidence, RecommendationResult};
use crate::registry::{ActionTemplate, GoalRegistry, Precondition};
use chrono::Utc;
use std::cmp::Ordering;
use std::sync::Arc;
use tracing::{debug, info, warn};

/// Default cap on returned actions.
pub const DEFAULT_MAX_ACTIONS: usize = 5;

/// Builds recommendation results from analyses.
pub struct RecommendationEngine {
    registry: Arc<GoalRegistry>,
    max_actions: usize,
}

impl RecommendationEngine {
    pub fn new(registry: Arc<GoalRegistry>) -> Self {
        Self {
            registry,
            max_actions: DEFAULT_MAX_ACTIONS,
        }
    }

    pub fn with_max_actions(mut self, max_actions: usize) -> Self {
        self.max_actions = max_actions;
        self
    }

    /// Recommend actions for `goal_id` within `budget` USD.
    ///
    /// Candidates are ordered by priority, then impact, then declaration
    /// order, and accepted greedily: an action that does not fit is skipped
    /// and cheaper ones after it are still tried.
    pub fn recommend(
        &self,
        analysis: &AnalysisResult,
        goal_id: &str,
        budget: f64,
    ) -> Result<RecommendationResult, AnalysisError> {
        let goal = self
            .registry
            .get(goal_id)
            .ok_or_else(|| AnalysisError::UnknownGoal {
                goal: goal_id.to_string(),
            })?;

        if analysis.goal != goal.id {
            warn!(
                analysis_goal = %analysis.goal,
                goal = %goal.id,
                "Recommending for a different goal than the analysis was run for"
            );
        }
        if analysis.is_expired(Utc::now()) {
            warn!(analysis_id = %analysis.id, "Analysis is past its validity window");
        }

        let budget = if budget.is_finite() { budget.max(0.0) } else { 0.0 };

        let mut candidates: Vec<&ActionTemplate> = goal
            .actions
            .iter()
            .filter(|t| preconditions_met(t, analysis))
            .collect();
        // sort_by is stable, so equal keys keep declaration order.
        candidates.sort_by(|a, b| {
            b.priority
                .cmp(&a.priority)
                .then_with(|| b.impact.partial_cmp(&a.impact).unwrap_or(Ordering::Equal))
        });

        let mut actions: Vec<Action> = Vec::new();
        let mut rejected_for_cost = Vec::new();
        let mut total = 0.0;

        for template in candidates {
            if actions.len() >= self.max_actions {
                break;
            }
            let next = total + template.cost;
            if next > budget {
                debug!(action = %template.id, cost = template.cost, total, budget, "Action over budget");
                rejected_for_cost.push(template.id.clone());
                continue;
            }
            total = next;
            actions.push(Action {
                id: template.id.clone(),
                description: template.description.clone(),
                priority: template.priority,
                effort: template.effort,
                impact: template.impact,
                impact_metric: template.impact_metric.clone(),
                rationale: template.rationale.clone(),
                estimated_cost: template.cost,
            });
        }

        let advisory = (analysis.confidence == Confidence::Low).then(|| Advisory {
            kind: AdvisoryKind::LowConfidence,
            message: format!(
                "Analysis confidence is low (run {}); treat these actions as a starting point.",
                analysis.run_state
            ),
        });

        info!(
            goal = %goal.id,
            actions = actions.len(),
            rejected = rejected_for_cost.len(),
            total_cost = total,
            "Recommendations generated"
        );

        Ok(RecommendationResult {
            goal: goal.id.clone(),
            analysis_id: analysis.id,
            actions,
            total_estimated_cost: total,
            budget,
            rejected_for_cost,
            advisory,
            created_at: Utc::now(),
        })
    }
}

fn preconditions_met(template: &ActionTemplate, analysis: &AnalysisResult) -> bool {
    template.preconditions.iter().all(|p| match p {
        Precondition::StageSucceeded(kind) => analysis.stage_succeeded(*kind),
        Precondition::HasMetricsToWatch => !analysis.metrics_to_watch.is_empty(),
        Precondition::MinConfidence(level) => analysis.confidence >= *level,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{
        MetricToWatch, RunState, SkipReason, StageKind, StageOutput, StageRecord, StageResult,
    };
    use crate::tokens::UsageSummary;
    use uuid::Uuid;

    const GOALS: &str = r#"
prompts:
  launch:
    description: Launch a product
    chain: [trend, ranking]
    optional: [ranking]
    primary_metric: sales
    trend_prompt: "trend"
    ranking_prompt: "rank"
    actions:
      - { id: a_low, description: Cheap tweak, priority: low, effort: low, impact: 0.9, cost: 100 }
      - { id: a_high, description: Big campaign, priority: high, effort: high, impact: 0.5, cost: 300 }
      - { id: a_med, description: Partner deal, priority: medium, effort: medium, impact: 0.7, cost: 250 }
      - { id: a_high_2, description: Fix funnel, priority: high, effort: medium, impact: 0.8, cost: 0, requires: [ranking] }
      - { id: a_watch, description: Track KPIs, priority: medium, effort: low, impact: 0.7, cost: 0, requires: [metrics_to_watch] }
  micro:
    description: Small paid boosts
    chain: [trend]
    primary_metric: sales
    trend_prompt: "trend"
    actions:
      - { id: m_dime, description: Boost one post, priority: high, effort: low, impact: 0.4, cost: 0.1 }
      - { id: m_fifth, description: Boost two posts, priority: medium, effort: low, impact: 0.6, cost: 0.2 }
      - { id: m_cent, description: Pin a comment, priority: low, effort: low, impact: 0.1, cost: 0.01 }
"#;

    fn registry() -> Arc<GoalRegistry> {
        Arc::new(GoalRegistry::from_yaml_str(GOALS).unwrap())
    }

    fn analysis(confidence: Confidence, ranking_ok: bool) -> AnalysisResult {
        let ranking = if ranking_ok {
            StageResult::Success {
                output: StageOutput {
                    headline: "p1 leads".to_string(),
                    data: serde_json::json!({}),
                },
                confidence,
                tokens_used: 10,
            }
        } else {
            StageResult::Skipped {
                reason: SkipReason::BudgetExhausted,
            }
        };
        let now = Utc::now();
        AnalysisResult {
            id: Uuid::new_v4(),
            pipeline_id: "run_test".to_string(),
            goal: "launch".to_string(),
            diagnosis: "Sales up.".to_string(),
            stages: vec![
                StageRecord {
                    stage: StageKind::Trend,
                    required: true,
                    result: StageResult::Success {
                        output: StageOutput {
                            headline: "Sales up".to_string(),
                            data: serde_json::json!({}),
                        },
                        confidence,
                        tokens_used: 10,
                    },
                },
                StageRecord {
                    stage: StageKind::Ranking,
                    required: false,
                    result: ranking,
                },
            ],
            run_state: if ranking_ok {
                RunState::Completed
            } else {
                RunState::Degraded
            },
            confidence,
            metrics_to_watch: vec![],
            usage: UsageSummary::default(),
            warnings: vec![],
            created_at: now,
            expires_at: now + chrono::Duration::days(7),
        }
    }

    fn ids(result: &RecommendationResult) -> Vec<&str> {
        result.actions.iter().map(|a| a.id.as_str()).collect()
    }

    #[test]
    fn test_ordering_priority_impact_declaration() {
        let engine = RecommendationEngine::new(registry());
        let result = engine
            .recommend(&analysis(Confidence::High, true), "launch", 10_000.0)
            .unwrap();
        assert_eq!(ids(&result), vec!["a_high_2", "a_high", "a_med", "a_low"]);
        assert!(result.advisory.is_none());
    }

    #[test]
    fn test_greedy_budget_skips_and_continues() {
        let engine = RecommendationEngine::new(registry());
        let result = engine
            .recommend(&analysis(Confidence::High, false), "launch", 500.0)
            .unwrap();
        assert_eq!(ids(&result), vec!["a_high", "a_low"]);
        assert_eq!(result.total_estimated_cost, 400.0);
        assert_eq!(result.rejected_for_cost, vec!["a_med".to_string()]);
        assert!(result.total_estimated_cost <= result.budget);
    }

    #[test]
    fn test_fractional_costs_never_exceed_budget() {
        let engine = RecommendationEngine::new(registry());
        let mut input = analysis(Confidence::High, true);
        input.goal = "micro".to_string();

        // 0.1 + 0.2 is 0.30000000000000004 in f64, one ulp over.
        let result = engine.recommend(&input, "micro", 0.3).unwrap();
        assert!(
            result.total_estimated_cost <= result.budget,
            "{} > {}",
            result.total_estimated_cost,
            result.budget
        );
        assert_eq!(ids(&result), vec!["m_dime", "m_cent"]);
        assert_eq!(result.rejected_for_cost, vec!["m_fifth".to_string()]);

        let result = engine.recommend(&input, "micro", 0.5).unwrap();
        assert_eq!(ids(&result), vec!["m_dime", "m_fifth", "m_cent"]);
        assert!(result.rejected_for_cost.is_empty());
    }

    #[test]
    fn test_preconditions_filter_candidates() {
        let engine = RecommendationEngine::new(registry());
        let result = engine
            .recommend(&analysis(Confidence::High, false), "launch", 10_000.0)
            .unwrap();
        assert!(!ids(&result).contains(&"a_high_2"));
        assert!(!ids(&result).contains(&"a_watch"));

        let mut with_metrics = analysis(Confidence::High, true);
        with_metrics.metrics_to_watch.push(MetricToWatch {
            metric: "sales".to_string(),
            target: "+10%".to_string(),
            period: "7 days".to_string(),
        });
        let result = engine.recommend(&with_metrics, "launch", 10_000.0).unwrap();
        assert_eq!(ids(&result), vec!["a_high_2", "a_high", "a_med", "a_watch", "a_low"]);
    }

    #[test]
    fn test_low_confidence_adds_advisory() {
        let engine = RecommendationEngine::new(registry());
        let result = engine
            .recommend(&analysis(Confidence::Low, false), "launch", 1000.0)
            .unwrap();
        let advisory = result.advisory.unwrap();
        assert_eq!(advisory.kind, AdvisoryKind::LowConfidence);
        assert!(advisory.message.contains("degraded"));
        assert!(!result.actions.is_empty());
    }

    #[test]
    fn test_max_actions_and_zero_budget() {
        let engine = RecommendationEngine::new(registry()).with_max_actions(2);
        let result = engine
            .recommend(&analysis(Confidence::High, true), "launch", 10_000.0)
            .unwrap();
        assert_eq!(ids(&result), vec!["a_high_2", "a_high"]);

        let engine = RecommendationEngine::new(registry());
        let result = engine
            .recommend(&analysis(Confidence::High, true), "launch", 0.0)
            .unwrap();
        assert_eq!(ids(&result), vec!["a_high_2"]);
        assert_eq!(result.total_estimated_cost, 0.0);
    }

    #[test]
    fn test_deterministic_for_identical_inputs() {
        let engine = RecommendationEngine::new(registry());
        let input = analysis(Confidence::Medium, true);
        let first = engine.recommend(&input, "launch", 600.0).unwrap();
        let second = engine.recommend(&input, "launch", 600.0).unwrap();
        assert_eq!(first.actions, second.actions);
    }

    #[test]
    fn test_unknown_goal() {
        let engine = RecommendationEngine::new(registry());
        let err = engine
            .recommend(&analysis(Confidence::High, true), "not_a_real_goal", 100.0)
            .unwrap_err();
        assert_eq!(err.kind(), "unknown_goal");
    }
}
