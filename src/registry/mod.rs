//! Goal registry.
//!
//! Goal definitions are declarative YAML documents keyed by goal name. They are
//! parsed once into strongly-typed [`Goal`]s and validated at load time; a
//! malformed definition is a [`ConfigurationError`] here and never at run time.
//! After loading, the registry is read-only and can be shared (behind an `Arc`)
//! by any number of concurrent runs.

pub mod template;

pub use template::{Rendered, StageTemplate};

use crate::error::ConfigurationError;
use crate::models::{Confidence, Effort, Priority, StageKind};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashSet};
use std::path::{Path, PathBuf};
use tracing::{debug, info, warn};

/// Goal definitions shipped with the binary.
pub const BUILTIN_GOALS: &str = include_str!("../../prompts/youtube_goals.yaml");

/// Optional model parameters for a goal.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct GoalParameters {
    #[serde(default)]
    pub temperature: Option<f32>,
    #[serde(default)]
    pub max_tokens: Option<usize>,
    #[serde(default)]
    pub model: Option<String>,
}

/// Default budget of a goal; unset fields fall back to the global config.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct GoalBudget {
    #[serde(default)]
    pub max_tokens: Option<usize>,
    #[serde(default)]
    pub max_cost_usd: Option<f64>,
}

/// Minimum dataset shape a goal needs.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct DataRequirements {
    #[serde(default)]
    pub columns: Vec<String>,
    #[serde(default)]
    pub min_rows: usize,
}

/// Condition an analysis must meet for an action template to apply.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Precondition {
    /// The named stage produced output.
    StageSucceeded(StageKind),
    /// The analysis carries at least one metric to watch.
    HasMetricsToWatch,
    /// Overall confidence is at least this level.
    MinConfidence(Confidence),
}

/// A goal-specific action the recommendation engine may propose.
#[derive(Debug, Clone, PartialEq)]
pub struct ActionTemplate {
    pub id: String,
    pub description: String,
    pub priority: Priority,
    pub effort: Effort,
    pub impact: f64,
    pub impact_metric: String,
    pub rationale: String,
    pub cost: f64,
    pub preconditions: Vec<Precondition>,
}

/// One stage of a goal's chain.
#[derive(Debug, Clone, PartialEq)]
pub struct GoalStage {
    pub kind: StageKind,
    pub required: bool,
    pub template: StageTemplate,
}

/// A named business objective and the chain of stages that serves it.
#[derive(Debug, Clone, PartialEq)]
pub struct Goal {
    pub id: String,
    pub description: String,
    /// Non-empty, unique by kind, in execution order.
    pub stages: Vec<GoalStage>,
    pub parameters: GoalParameters,
    pub budget: GoalBudget,
    /// Column the offline statistics are computed over.
    pub primary_metric: String,
    /// Column used to label rows in rankings.
    pub id_column: Option<String>,
    pub requirements: DataRequirements,
    pub actions: Vec<ActionTemplate>,
}

impl Goal {
    pub fn stage_names(&self) -> Vec<&'static str> {
        self.stages.iter().map(|s| s.kind.name()).collect()
    }

    pub fn stage(&self, kind: StageKind) -> Option<&GoalStage> {
        self.stages.iter().find(|s| s.kind == kind)
    }
}

#[derive(Debug, Deserialize)]
struct RawGoal {
    #[serde(default)]
    description: String,
    #[serde(default)]
    chain: Vec<String>,
    #[serde(default)]
    optional: Vec<String>,
    #[serde(default)]
    parameters: GoalParameters,
    #[serde(default)]
    budget: GoalBudget,
    #[serde(default)]
    primary_metric: Option<String>,
    #[serde(default)]
    id_column: Option<String>,
    #[serde(default)]
    requirements: DataRequirements,
    #[serde(default)]
    actions: Vec<RawAction>,
    /// Holds the `{stage}_prompt` fields.
    #[serde(flatten)]
    extra: BTreeMap<String, serde_yaml::Value>,
}

#[derive(Debug, Deserialize)]
struct RawAction {
    id: String,
    description: String,
    priority: Priority,
    effort: Effort,
    #[serde(default)]
    impact: f64,
    #[serde(default)]
    impact_metric: String,
    #[serde(default)]
    rationale: String,
    #[serde(default)]
    cost: f64,
    #[serde(default)]
    requires: Vec<String>,
    #[serde(default)]
    min_confidence: Option<Confidence>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
enum RegistrySource {
    Builtin,
    File(PathBuf),
    Inline,
}

/// Immutable collection of goals loaded from one document.
#[derive(Debug, Clone)]
pub struct GoalRegistry {
    domain: String,
    goals: BTreeMap<String, Goal>,
    source: RegistrySource,
}

impl GoalRegistry {
    /// Load the goal definitions embedded in the binary.
    pub fn builtin() -> Result<Self, ConfigurationError> {
        let mut registry = Self::from_yaml_str(BUILTIN_GOALS)?;
        registry.source = RegistrySource::Builtin;
        Ok(registry)
    }

    /// Load goal definitions from a YAML file.
    pub fn load(path: &Path) -> Result<Self, ConfigurationError> {
        let content = std::fs::read_to_string(path).map_err(|source| ConfigurationError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        let mut registry = Self::from_yaml_str(&content)?;
        registry.source = RegistrySource::File(path.to_path_buf());
        info!(
            "Loaded {} goal(s) for domain '{}' from {}",
            registry.len(),
            registry.domain,
            path.display()
        );
        Ok(registry)
    }

    /// Parse goal definitions from YAML text.
    ///
    /// Goals are read from a top-level `prompts` mapping when present, otherwise
    /// from the top-level mapping itself.
    pub fn from_yaml_str(content: &str) -> Result<Self, ConfigurationError> {
        let document: serde_yaml::Value = serde_yaml::from_str(content)?;
        let mut root = match document {
            serde_yaml::Value::Mapping(map) => map,
            serde_yaml::Value::Null => serde_yaml::Mapping::new(),
            _ => {
                return Err(ConfigurationError::invalid(
                    "*",
                    "goal file must be a mapping of goal names",
                ))
            }
        };

        let domain = match root.remove("domain") {
            Some(serde_yaml::Value::String(s)) => s,
            _ => "default".to_string(),
        };

        let entries = match root.remove("prompts") {
            Some(serde_yaml::Value::Mapping(map)) => map,
            Some(_) => {
                return Err(ConfigurationError::invalid(
                    "*",
                    "'prompts' must be a mapping of goal names",
                ))
            }
            None => root,
        };

        let mut goals = BTreeMap::new();
        for (key, value) in entries {
            let id = match key {
                serde_yaml::Value::String(s) => s,
                other => {
                    return Err(ConfigurationError::invalid(
                        format!("{:?}", other),
                        "goal names must be strings",
                    ))
                }
            };
            let raw: RawGoal = serde_yaml::from_value(value)
                .map_err(|e| ConfigurationError::invalid(&id, e.to_string()))?;
            let goal = build_goal(&id, raw)?;
            debug!("Registered goal '{}' with chain {:?}", id, goal.stage_names());
            goals.insert(id, goal);
        }

        if goals.is_empty() {
            return Err(ConfigurationError::invalid("*", "no goals defined"));
        }

        Ok(Self {
            domain,
            goals,
            source: RegistrySource::Inline,
        })
    }

    /// Re-read the registry from where it was loaded.
    ///
    /// Returns a fresh registry; the current one is left untouched so runs
    /// holding it are unaffected.
    pub fn reload(&self) -> Result<Self, ConfigurationError> {
        match &self.source {
            RegistrySource::Builtin => Self::builtin(),
            RegistrySource::File(path) => Self::load(path),
            RegistrySource::Inline => Ok(self.clone()),
        }
    }

    pub fn domain(&self) -> &str {
        &self.domain
    }

    pub fn get(&self, goal_id: &str) -> Option<&Goal> {
        self.goals.get(goal_id)
    }

    pub fn contains(&self, goal_id: &str) -> bool {
        self.goals.contains_key(goal_id)
    }

    /// Goal ids in sorted order.
    pub fn goal_ids(&self) -> impl Iterator<Item = &str> {
        self.goals.keys().map(String::as_str)
    }

    pub fn goals(&self) -> impl Iterator<Item = &Goal> {
        self.goals.values()
    }

    pub fn len(&self) -> usize {
        self.goals.len()
    }

    pub fn is_empty(&self) -> bool {
        self.goals.is_empty()
    }
}

fn build_goal(id: &str, raw: RawGoal) -> Result<Goal, ConfigurationError> {
    if raw.chain.is_empty() {
        return Err(ConfigurationError::invalid(id, "chain must not be empty"));
    }

    let mut kinds = Vec::with_capacity(raw.chain.len());
    for name in &raw.chain {
        let kind: StageKind = name
            .parse()
            .map_err(|e: String| ConfigurationError::invalid(id, e))?;
        if kinds.contains(&kind) {
            return Err(ConfigurationError::invalid(
                id,
                format!("stage '{}' appears more than once in chain", name),
            ));
        }
        kinds.push(kind);
    }

    let mut optional = HashSet::new();
    for name in &raw.optional {
        let kind: StageKind = name
            .parse()
            .map_err(|e: String| ConfigurationError::invalid(id, e))?;
        if !kinds.contains(&kind) {
            return Err(ConfigurationError::invalid(
                id,
                format!("optional stage '{}' is not in the chain", name),
            ));
        }
        optional.insert(kind);
    }

    let mut stages = Vec::with_capacity(kinds.len());
    for kind in kinds {
        let key = format!("{}_prompt", kind.name());
        let source = match raw.extra.get(&key) {
            Some(serde_yaml::Value::String(s)) if !s.trim().is_empty() => s,
            Some(_) => {
                return Err(ConfigurationError::invalid(
                    id,
                    format!("'{}' must be a non-empty string", key),
                ))
            }
            None => {
                return Err(ConfigurationError::invalid(
                    id,
                    format!("missing '{}' for stage '{}'", key, kind),
                ))
            }
        };
        stages.push(GoalStage {
            kind,
            required: !optional.contains(&kind),
            template: StageTemplate::parse(id, kind.name(), source)?,
        });
    }

    for key in raw.extra.keys() {
        let used = key
            .strip_suffix("_prompt")
            .and_then(|stage| stage.parse::<StageKind>().ok())
            .map(|kind| stages.iter().any(|s| s.kind == kind))
            .unwrap_or(false);
        if !used {
            warn!("Goal '{}': ignoring unused field '{}'", id, key);
        }
    }

    if let Some(t) = raw.parameters.temperature {
        if !(0.0..=2.0).contains(&t) {
            return Err(ConfigurationError::invalid(
                id,
                "parameters.temperature must be between 0.0 and 2.0",
            ));
        }
    }

    let primary_metric = raw
        .primary_metric
        .or_else(|| raw.requirements.columns.first().cloned())
        .ok_or_else(|| {
            ConfigurationError::invalid(id, "primary_metric or requirements.columns is required")
        })?;

    let mut actions = Vec::with_capacity(raw.actions.len());
    for action in raw.actions {
        if actions.iter().any(|a: &ActionTemplate| a.id == action.id) {
            return Err(ConfigurationError::invalid(
                id,
                format!("duplicate action id '{}'", action.id),
            ));
        }
        if !action.cost.is_finite() || action.cost < 0.0 {
            return Err(ConfigurationError::invalid(
                id,
                format!("action '{}' has an invalid cost", action.id),
            ));
        }
        if !action.impact.is_finite() {
            return Err(ConfigurationError::invalid(
                id,
                format!("action '{}' has an invalid impact", action.id),
            ));
        }

        let mut preconditions = Vec::new();
        for requirement in &action.requires {
            let condition = match requirement.as_str() {
                "metrics_to_watch" => Precondition::HasMetricsToWatch,
                other => {
                    let kind: StageKind = other.parse().map_err(|e: String| {
                        ConfigurationError::invalid(id, format!("action '{}': {}", action.id, e))
                    })?;
                    Precondition::StageSucceeded(kind)
                }
            };
            preconditions.push(condition);
        }
        if let Some(level) = action.min_confidence {
            preconditions.push(Precondition::MinConfidence(level));
        }

        actions.push(ActionTemplate {
            id: action.id,
            description: action.description,
            priority: action.priority,
            effort: action.effort,
            impact: action.impact,
            impact_metric: action.impact_metric,
            rationale: action.rationale,
            cost: action.cost,
            preconditions,
        });
    }

    Ok(Goal {
        id: id.to_string(),
        description: raw.description,
        stages,
        parameters: raw.parameters,
        budget: raw.budget,
        primary_metric,
        id_column: raw.id_column,
        requirements: raw.requirements,
        actions,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    const MINIMAL: &str = r#"
domain: test
prompts:
  quick_look:
    description: Minimal goal
    chain: [trend, ranking]
    optional: [ranking]
    primary_metric: views
    trend_prompt: "Trend of {primary_metric}"
    ranking_prompt: "Rank by {primary_metric} using {trend_result}"
"#;

    #[test]
    fn test_builtin_goals_load() {
        let registry = GoalRegistry::builtin().unwrap();
        assert_eq!(registry.domain(), "youtube");
        for id in ["grow_subscribers", "increase_ctr", "boost_watch_time"] {
            let goal = registry.get(id).unwrap();
            assert!(!goal.stages.is_empty());
            assert!(!goal.actions.is_empty());
        }
        assert_eq!(
            registry.get("grow_subscribers").unwrap().stage_names(),
            vec!["trend", "ranking", "prediction"]
        );
        assert_eq!(
            registry.get("increase_ctr").unwrap().stage_names(),
            vec!["anomaly", "ranking"]
        );
    }

    #[test]
    fn test_parse_minimal_goal() {
        let registry = GoalRegistry::from_yaml_str(MINIMAL).unwrap();
        let goal = registry.get("quick_look").unwrap();
        assert_eq!(goal.primary_metric, "views");
        assert!(goal.stages[0].required);
        assert!(!goal.stages[1].required);
        assert_eq!(
            goal.stages[1].template.placeholders().collect::<Vec<_>>(),
            vec!["primary_metric", "trend_result"]
        );
    }

    #[test]
    fn test_goals_without_prompts_key() {
        let yaml = r#"
solo:
  chain: [prediction]
  primary_metric: views
  prediction_prompt: "Predict {primary_metric}"
"#;
        let registry = GoalRegistry::from_yaml_str(yaml).unwrap();
        assert!(registry.contains("solo"));
        assert_eq!(registry.domain(), "default");
    }

    fn expect_invalid(yaml: &str, needle: &str) {
        let err = GoalRegistry::from_yaml_str(yaml).unwrap_err();
        assert!(
            err.to_string().contains(needle),
            "expected '{}' in '{}'",
            needle,
            err
        );
    }

    #[test]
    fn test_rejects_malformed_goals() {
        expect_invalid(
            "g:\n  chain: []\n  primary_metric: v\n",
            "chain must not be empty",
        );
        expect_invalid(
            "g:\n  chain: [sentiment]\n  primary_metric: v\n  sentiment_prompt: x\n",
            "unknown stage kind",
        );
        expect_invalid(
            "g:\n  chain: [trend, trend]\n  primary_metric: v\n  trend_prompt: x\n",
            "more than once",
        );
        expect_invalid(
            "g:\n  chain: [trend]\n  primary_metric: v\n",
            "missing 'trend_prompt'",
        );
        expect_invalid(
            "g:\n  chain: [trend]\n  optional: [ranking]\n  primary_metric: v\n  trend_prompt: x\n",
            "not in the chain",
        );
        expect_invalid(
            "g:\n  chain: [trend]\n  primary_metric: v\n  trend_prompt: \"{oops\"\n",
            "unclosed placeholder",
        );
        expect_invalid("g:\n  chain: [trend]\n  trend_prompt: x\n", "primary_metric");
        expect_invalid("[1, 2]", "mapping");
    }

    #[test]
    fn test_rejects_duplicate_action_ids() {
        let yaml = r#"
g:
  chain: [trend]
  primary_metric: v
  trend_prompt: x
  actions:
    - { id: a1, description: one, priority: high, effort: low }
    - { id: a1, description: two, priority: low, effort: low }
"#;
        expect_invalid(yaml, "duplicate action id");
    }

    #[test]
    fn test_action_preconditions() {
        let yaml = r#"
g:
  chain: [trend, prediction]
  primary_metric: v
  trend_prompt: x
  prediction_prompt: y
  actions:
    - id: a1
      description: one
      priority: high
      effort: low
      impact: 0.5
      cost: 10
      requires: [trend, metrics_to_watch]
      min_confidence: medium
"#;
        let registry = GoalRegistry::from_yaml_str(yaml).unwrap();
        let action = &registry.get("g").unwrap().actions[0];
        assert_eq!(
            action.preconditions,
            vec![
                Precondition::StageSucceeded(StageKind::Trend),
                Precondition::HasMetricsToWatch,
                Precondition::MinConfidence(Confidence::Medium),
            ]
        );
    }

    #[test]
    fn test_load_and_reload_from_file() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        file.write_all(MINIMAL.as_bytes()).unwrap();

        let registry = GoalRegistry::load(file.path()).unwrap();
        assert_eq!(registry.len(), 1);

        let reloaded = registry.reload().unwrap();
        assert!(reloaded.contains("quick_look"));

        let missing = GoalRegistry::load(Path::new("/nonexistent/goals.yaml"));
        assert!(matches!(missing, Err(ConfigurationError::Io { .. })));
    }
}
