//! Markdown and JSON report generation.

use super::{GoalFailure, GoalReport, Report, ReportMetadata};
use crate::models::{AnalysisResult, Priority, RecommendationResult, StageResult};
use anyhow::Result;

/// Generate a complete Markdown report.
pub fn generate_markdown_report(report: &Report) -> String {
    let mut output = String::new();

    output.push_str("# Chainsight Report\n\n");
    output.push_str(&generate_metadata_section(&report.metadata));
    output.push_str(&generate_summary_section(report));

    for goal in &report.goals {
        output.push_str(&generate_goal_section(goal));
    }

    output.push_str(&generate_failures_section(&report.failures));
    output.push_str(&generate_footer());

    output
}

fn generate_metadata_section(metadata: &ReportMetadata) -> String {
    let mut section = String::new();

    section.push_str("## Metadata\n\n");
    section.push_str(&format!("- **Dataset:** `{}`\n", metadata.dataset));
    section.push_str(&format!("- **Domain:** {}\n", metadata.domain));
    section.push_str(&format!(
        "- **Generated:** {}\n",
        metadata.generated_at.format("%Y-%m-%d %H:%M:%S UTC")
    ));
    if metadata.offline {
        section.push_str("- **Model:** offline statistics (no model bound)\n");
    } else {
        section.push_str(&format!("- **Model:** `{}`\n", metadata.model_used));
    }
    section.push_str(&format!("- **Rows:** {}\n", metadata.rows));
    section.push_str(&format!(
        "- **Duration:** {:.1}s\n\n",
        metadata.duration_seconds
    ));

    section
}

fn generate_summary_section(report: &Report) -> String {
    let mut section = String::new();

    section.push_str("## Summary\n\n");
    if report.goals.is_empty() {
        section.push_str("No goal produced an analysis.\n\n");
        return section;
    }

    section.push_str("| Goal | Run | Confidence | Tokens | Cost (USD) | Actions |\n");
    section.push_str("|:---|:---|:---:|---:|---:|:---:|\n");
    for goal in &report.goals {
        let analysis = &goal.analysis;
        section.push_str(&format!(
            "| {} | {} | {} | {} | {:.4} | {} |\n",
            analysis.goal,
            analysis.run_state,
            analysis.confidence,
            analysis.usage.total_tokens,
            analysis.usage.total_cost_usd,
            goal.recommendations
                .as_ref()
                .map(|r| r.actions.len())
                .unwrap_or(0)
        ));
    }
    section.push_str(&format!(
        "\n**Total:** {} tokens, ${:.4}\n\n",
        report.total_tokens(),
        report.total_cost_usd()
    ));

    section
}

fn generate_goal_section(goal: &GoalReport) -> String {
    let analysis = &goal.analysis;
    let mut section = String::new();

    section.push_str(&format!("## Goal: {}\n\n", analysis.goal));
    section.push_str(&format!("> {}\n\n", analysis.diagnosis));
    section.push_str(&format!(
        "*Run `{}`: {} | Confidence: {} | Valid until {}*\n\n",
        analysis.pipeline_id,
        analysis.run_state,
        analysis.confidence,
        analysis.expires_at.format("%Y-%m-%d")
    ));

    section.push_str(&generate_stages_table(analysis));

    if !analysis.metrics_to_watch.is_empty() {
        section.push_str("### Metrics to Watch\n\n");
        section.push_str("| Metric | Target | Period |\n");
        section.push_str("|:---|:---|:---|\n");
        for metric in &analysis.metrics_to_watch {
            section.push_str(&format!(
                "| {} | {} | {} |\n",
                metric.metric, metric.target, metric.period
            ));
        }
        section.push('\n');
    }

    if let Some(recommendations) = &goal.recommendations {
        section.push_str(&generate_recommendations_section(recommendations));
    }

    if !analysis.warnings.is_empty() {
        section.push_str("<details>\n<summary>Warnings</summary>\n\n");
        for warning in &analysis.warnings {
            section.push_str(&format!("- {}\n", warning));
        }
        section.push_str("\n</details>\n\n");
    }

    section
}

fn generate_stages_table(analysis: &AnalysisResult) -> String {
    let mut table = String::new();

    table.push_str("### Stages\n\n");
    table.push_str("| Stage | Required | Status | Detail | Tokens |\n");
    table.push_str("|:---|:---:|:---|:---|---:|\n");
    for record in &analysis.stages {
        let detail = match &record.result {
            StageResult::Success {
                output, confidence, ..
            } => format!("{} ({})", output.headline, confidence),
            StageResult::Skipped { reason } => reason.to_string(),
            StageResult::Failed {
                error_kind,
                message,
            } => format!("{}: {}", error_kind, message),
        };
        table.push_str(&format!(
            "| {} | {} | {} | {} | {} |\n",
            record.stage,
            if record.required { "yes" } else { "no" },
            record.result.label(),
            detail.replace('|', "\\|"),
            record.result.tokens_used()
        ));
    }
    table.push('\n');

    table
}

fn generate_recommendations_section(result: &RecommendationResult) -> String {
    let mut section = String::new();

    section.push_str("### Recommended Actions\n\n");

    if let Some(advisory) = &result.advisory {
        section.push_str(&format!("> ⚠️ **Advisory:** {}\n\n", advisory.message));
    }

    if result.actions.is_empty() {
        section.push_str("No action fits the current budget and analysis.\n\n");
    } else {
        section.push_str("| # | Priority | Action | Effort | Expected Impact | Cost |\n");
        section.push_str("|:---:|:---|:---|:---:|:---|---:|\n");
        for (i, action) in result.actions.iter().enumerate() {
            section.push_str(&format!(
                "| {} | {} {} | {} | {} | {} | ${:.2} |\n",
                i + 1,
                priority_badge(action.priority),
                action.priority,
                action.description,
                action.effort,
                action.impact_metric,
                action.estimated_cost
            ));
        }
        section.push('\n');

        for action in result.actions.iter().filter(|a| !a.rationale.is_empty()) {
            section.push_str(&format!("- **{}:** {}\n", action.id, action.rationale));
        }
        section.push('\n');
    }

    section.push_str(&format!(
        "**Estimated cost:** ${:.2} of ${:.2} budget\n\n",
        result.total_estimated_cost, result.budget
    ));
    if !result.rejected_for_cost.is_empty() {
        section.push_str(&format!(
            "*Over budget: {}*\n\n",
            result.rejected_for_cost.join(", ")
        ));
    }

    section
}

fn priority_badge(priority: Priority) -> &'static str {
    priority.emoji()
}

fn generate_failures_section(failures: &[GoalFailure]) -> String {
    if failures.is_empty() {
        return String::new();
    }

    let mut section = String::new();
    section.push_str("## Failed Goals\n\n");
    for failure in failures {
        section.push_str(&format!(
            "- **{}** ({}): {}\n",
            failure.goal, failure.kind, failure.message
        ));
    }
    section.push('\n');

    section
}

fn generate_footer() -> String {
    format!(
        "---\n\n*Report generated by Chainsight v{}*\n",
        env!("CARGO_PKG_VERSION")
    )
}

/// Generate a JSON report.
pub fn generate_json_report(report: &Report) -> Result<String> {
    serde_json::to_string_pretty(report).map_err(Into::into)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{
        Action, Advisory, AdvisoryKind, Confidence, Effort, MetricToWatch, RunState, SkipReason,
        StageKind, StageOutput, StageRecord,
    };
    use crate::tokens::UsageSummary;
    use chrono::Utc;
    use uuid::Uuid;

    fn create_test_report() -> Report {
        let now = Utc::now();
        let analysis = AnalysisResult {
            id: Uuid::new_v4(),
            pipeline_id: "run_1a2b3c4d".to_string(),
            goal: "grow_subscribers".to_string(),
            diagnosis: "Subscribers up 12%. 1 stage(s) did not contribute.".to_string(),
            stages: vec![
                StageRecord {
                    stage: StageKind::Trend,
                    required: true,
                    result: StageResult::Success {
                        output: StageOutput {
                            headline: "Subscribers up 12%".to_string(),
                            data: serde_json::json!({"direction": "up"}),
                        },
                        confidence: Confidence::High,
                        tokens_used: 420,
                    },
                },
                StageRecord {
                    stage: StageKind::Ranking,
                    required: false,
                    result: StageResult::Skipped {
                        reason: SkipReason::BudgetExhausted,
                    },
                },
            ],
            run_state: RunState::Degraded,
            confidence: Confidence::Low,
            metrics_to_watch: vec![MetricToWatch {
                metric: "subscribers_gained".to_string(),
                target: "+150".to_string(),
                period: "7 days".to_string(),
            }],
            usage: UsageSummary {
                total_tokens: 420,
                ..UsageSummary::default()
            },
            warnings: vec!["ranking: token budget exhausted".to_string()],
            created_at: now,
            expires_at: now + chrono::Duration::days(7),
        };
        let recommendations = RecommendationResult {
            goal: "grow_subscribers".to_string(),
            analysis_id: analysis.id,
            actions: vec![Action {
                id: "gr_001".to_string(),
                description: "Analyze top videos".to_string(),
                priority: Priority::High,
                effort: Effort::Low,
                impact: 0.6,
                impact_metric: "Content clarity".to_string(),
                rationale: "Understanding what works informs strategy".to_string(),
                estimated_cost: 0.0,
            }],
            total_estimated_cost: 0.0,
            budget: 0.0,
            rejected_for_cost: vec!["gr_005".to_string()],
            advisory: Some(Advisory {
                kind: AdvisoryKind::LowConfidence,
                message: "Analysis confidence is low".to_string(),
            }),
            created_at: now,
        };

        Report {
            metadata: ReportMetadata {
                dataset: "fixtures/channel_30d.json".to_string(),
                domain: "youtube".to_string(),
                generated_at: now,
                model_used: "llama3.2:latest".to_string(),
                offline: false,
                rows: 30,
                duration_seconds: 2.5,
            },
            goals: vec![GoalReport {
                analysis,
                recommendations: Some(recommendations),
            }],
            failures: vec![GoalFailure {
                goal: "increase_ctr".to_string(),
                kind: "insufficient_data".to_string(),
                message: "missing column(s): ctr".to_string(),
            }],
        }
    }

    #[test]
    fn test_generate_markdown_report() {
        let report = create_test_report();
        let markdown = generate_markdown_report(&report);

        assert!(markdown.contains("# Chainsight Report"));
        assert!(markdown.contains("## Goal: grow_subscribers"));
        assert!(markdown.contains("> Subscribers up 12%."));
        assert!(markdown.contains("| ranking | no | skipped | budget exhausted | 0 |"));
        assert!(markdown.contains("subscribers_gained"));
        assert!(markdown.contains("Analyze top videos"));
        assert!(markdown.contains("**Advisory:**"));
        assert!(markdown.contains("*Over budget: gr_005*"));
        assert!(markdown.contains("## Failed Goals"));
    }

    #[test]
    fn test_offline_metadata() {
        let mut report = create_test_report();
        report.metadata.offline = true;
        let section = generate_metadata_section(&report.metadata);
        assert!(section.contains("offline statistics"));
        assert!(!section.contains("llama3.2"));
    }

    #[test]
    fn test_generate_json_report() {
        let report = create_test_report();
        let json = generate_json_report(&report).unwrap();
        let value: serde_json::Value = serde_json::from_str(&json).unwrap();

        assert_eq!(value["goals"][0]["analysis"]["run_state"]["state"], "degraded");
        assert_eq!(
            value["goals"][0]["analysis"]["stages"][1]["result"]["reason"],
            "budget_exhausted"
        );
        assert_eq!(value["failures"][0]["kind"], "insufficient_data");
    }
}
