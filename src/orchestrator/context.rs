//! Per-run execution context and prompt rendering.

use crate::dataset::Dataset;
use crate::models::{StageKind, StageOutput};
use crate::registry::{Goal, StageTemplate};
use std::collections::BTreeMap;
use tracing::warn;

/// What a template may reference besides earlier stage outputs.
#[derive(Debug, Clone, Copy)]
pub struct PromptEnv<'a> {
    pub goal: &'a Goal,
    pub dataset: &'a Dataset,
    pub max_prompt_rows: usize,
}

impl PromptEnv<'_> {
    fn builtin(&self, name: &str) -> Option<String> {
        let dataset = self.dataset;
        match name {
            "goal" => Some(self.goal.id.clone()),
            "goal_description" => Some(self.goal.description.clone()),
            "timeframe_days" => dataset.timeframe_days().map(|d| d.to_string()),
            "row_count" => Some(dataset.len().to_string()),
            "columns" => Some(dataset.columns().into_iter().collect::<Vec<_>>().join(", ")),
            "dataset" => Some(dataset.summarize(self.max_prompt_rows)),
            "primary_metric" => Some(self.goal.primary_metric.clone()),
            _ => {
                if let Some(column) = name.strip_suffix("_mean") {
                    return dataset.column_stats(column).map(|s| format!("{:.2}", s.mean));
                }
                if let Some(column) = name.strip_suffix("_variance") {
                    return dataset
                        .column_stats(column)
                        .map(|s| format!("{:.2}", s.variance));
                }
                None
            }
        }
    }
}

/// Mutable accumulator owned by one chain run.
#[derive(Debug, Default)]
pub struct ExecutionContext {
    outputs: BTreeMap<StageKind, StageOutput>,
    cumulative_tokens: usize,
    cumulative_cost: f64,
    warnings: Vec<String>,
    unresolved: Vec<String>,
}

impl ExecutionContext {
    pub fn new() -> Self {
        Self::default()
    }

    /// Merge a successful stage's output. Usage only ever grows.
    pub fn record_output(&mut self, stage: StageKind, output: StageOutput, tokens: usize, cost: f64) {
        self.outputs.insert(stage, output);
        self.add_usage(tokens, cost);
    }

    /// Count usage that produced no output (a parse failure still burned tokens).
    pub fn add_usage(&mut self, tokens: usize, cost: f64) {
        self.cumulative_tokens += tokens;
        self.cumulative_cost += cost.max(0.0);
    }

    pub fn output(&self, stage: StageKind) -> Option<&StageOutput> {
        self.outputs.get(&stage)
    }

    pub fn outputs(&self) -> &BTreeMap<StageKind, StageOutput> {
        &self.outputs
    }

    pub fn cumulative_tokens(&self) -> usize {
        self.cumulative_tokens
    }

    pub fn cumulative_cost(&self) -> f64 {
        self.cumulative_cost
    }

    pub fn warn(&mut self, message: impl Into<String>) {
        self.warnings.push(message.into());
    }

    pub fn warnings(&self) -> &[String] {
        &self.warnings
    }

    /// Placeholders that could not be resolved in any stage so far.
    pub fn unresolved(&self) -> &[String] {
        &self.unresolved
    }

    pub fn into_parts(self) -> (BTreeMap<StageKind, StageOutput>, Vec<String>, Vec<String>) {
        (self.outputs, self.warnings, self.unresolved)
    }

    fn from_outputs(&self, name: &str) -> Option<String> {
        if let Some(stage) = name.strip_suffix("_result") {
            let output = self.outputs.get(&stage.parse::<StageKind>().ok()?)?;
            return serde_json::to_string(&output.data).ok();
        }
        if let Some(stage) = name.strip_suffix("_headline") {
            let output = self.outputs.get(&stage.parse::<StageKind>().ok()?)?;
            return Some(output.headline.clone());
        }
        None
    }

    /// Resolve one placeholder: earlier stage outputs first, then built-ins,
    /// then dataset metadata.
    pub fn resolve(&self, name: &str, env: &PromptEnv<'_>) -> Option<String> {
        self.from_outputs(name)
            .or_else(|| env.builtin(name))
            .or_else(|| env.dataset.metadata_scalar(name))
    }

    /// Render a stage template. Unresolved placeholders stay verbatim and are
    /// recorded as warnings.
    pub fn render(&mut self, stage: StageKind, template: &StageTemplate, env: &PromptEnv<'_>) -> String {
        let rendered = template.render(|name| self.resolve(name, env));
        for name in rendered.unresolved {
            warn!(stage = %stage, placeholder = %name, "Unresolved placeholder left in prompt");
            self.warnings
                .push(format!("{}: unresolved placeholder '{{{}}}'", stage, name));
            if !self.unresolved.contains(&name) {
                self.unresolved.push(name);
            }
        }
        rendered.text
    }
}
