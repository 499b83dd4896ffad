//! Configuration file handling.
//!
//! This module handles loading and merging configuration from
//! `.chainsight.toml` files.

use crate::analysis::{DiagnosisPolicy, EngineConfig};
use crate::llm::ollama::OllamaConfig;
use crate::orchestrator::{OrchestratorConfig, RetryPolicy};
use crate::tokens::{TokenBudget, TruncationPolicy, DEFAULT_PRICING_MODEL};
use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Default config file name, looked up in the current directory.
pub const DEFAULT_CONFIG_FILE: &str = ".chainsight.toml";

/// Root configuration structure.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Config {
    /// General settings.
    #[serde(default)]
    pub general: GeneralConfig,

    /// Model settings.
    #[serde(default)]
    pub model: ModelConfig,

    /// Token and cost budget settings.
    #[serde(default)]
    pub budget: BudgetConfig,

    /// Analysis engine settings.
    #[serde(default)]
    pub analysis: AnalysisConfig,

    /// Recommendation settings.
    #[serde(default)]
    pub recommendations: RecommendationConfig,
}

/// General application settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GeneralConfig {
    /// Default output file path.
    #[serde(default = "default_output")]
    pub output: String,

    /// Enable verbose logging by default.
    #[serde(default)]
    pub verbose: bool,

    /// Number of chain runs in flight at once.
    #[serde(default = "default_concurrency")]
    pub concurrency: usize,
}

impl Default for GeneralConfig {
    fn default() -> Self {
        Self {
            output: default_output(),
            verbose: false,
            concurrency: default_concurrency(),
        }
    }
}

fn default_output() -> String {
    "chainsight_report.md".to_string()
}

fn default_concurrency() -> usize {
    4
}

/// LLM model settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ModelConfig {
    /// Model name passed to Ollama.
    #[serde(default = "default_model")]
    pub name: String,

    /// Ollama API URL.
    #[serde(default = "default_ollama_url")]
    pub ollama_url: String,

    /// Temperature for generation.
    #[serde(default = "default_temperature")]
    pub temperature: f32,

    /// Maximum output tokens requested per stage.
    #[serde(default = "default_max_output_tokens")]
    pub max_output_tokens: usize,

    /// Timeout for one model call, in seconds.
    #[serde(default = "default_timeout")]
    pub timeout_seconds: u64,

    /// Retries after the first attempt on transient failures.
    #[serde(default = "default_retries")]
    pub retries: u32,

    #[serde(default = "default_backoff_base_ms")]
    pub backoff_base_ms: u64,

    #[serde(default = "default_backoff_max_ms")]
    pub backoff_max_ms: u64,

    /// Skip the model entirely and answer every stage from local statistics.
    #[serde(default)]
    pub offline: bool,
}

impl Default for ModelConfig {
    fn default() -> Self {
        Self {
            name: default_model(),
            ollama_url: default_ollama_url(),
            temperature: default_temperature(),
            max_output_tokens: default_max_output_tokens(),
            timeout_seconds: default_timeout(),
            retries: default_retries(),
            backoff_base_ms: default_backoff_base_ms(),
            backoff_max_ms: default_backoff_max_ms(),
            offline: false,
        }
    }
}

fn default_model() -> String {
    "llama3.2:latest".to_string()
}

fn default_ollama_url() -> String {
    "http://localhost:11434".to_string()
}

fn default_temperature() -> f32 {
    0.2
}

fn default_max_output_tokens() -> usize {
    1024
}

fn default_timeout() -> u64 {
    120
}

fn default_retries() -> u32 {
    3
}

fn default_backoff_base_ms() -> u64 {
    500
}

fn default_backoff_max_ms() -> u64 {
    8000
}

/// Token and cost budget settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BudgetConfig {
    /// Tokens one chain run may consume (input + output).
    #[serde(default = "default_max_tokens")]
    pub max_tokens: usize,

    /// Optional USD ceiling per chain run.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_cost_usd: Option<f64>,

    /// Model whose rates are used for cost estimates.
    #[serde(default = "default_pricing_model")]
    pub pricing_model: String,

    /// Which end of an oversized prompt is dropped.
    #[serde(default)]
    pub truncation: TruncationPolicy,

    /// Dataset rows rendered into `{dataset}`.
    #[serde(default = "default_max_prompt_rows")]
    pub max_prompt_rows: usize,
}

impl Default for BudgetConfig {
    fn default() -> Self {
        Self {
            max_tokens: default_max_tokens(),
            max_cost_usd: None,
            pricing_model: default_pricing_model(),
            truncation: TruncationPolicy::default(),
            max_prompt_rows: default_max_prompt_rows(),
        }
    }
}

fn default_max_tokens() -> usize {
    16_000
}

fn default_pricing_model() -> String {
    DEFAULT_PRICING_MODEL.to_string()
}

fn default_max_prompt_rows() -> usize {
    50
}

/// Analysis engine settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AnalysisConfig {
    /// Goal definitions file. The built-in YouTube goals are used when unset.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub goals_file: Option<PathBuf>,

    /// Days an analysis stays valid.
    #[serde(default = "default_validity_days")]
    pub validity_days: i64,

    /// Optional deadline for one chain run, in seconds.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub deadline_seconds: Option<u64>,

    #[serde(default)]
    pub diagnosis: DiagnosisPolicy,
}

impl Default for AnalysisConfig {
    fn default() -> Self {
        Self {
            goals_file: None,
            validity_days: default_validity_days(),
            deadline_seconds: None,
            diagnosis: DiagnosisPolicy::default(),
        }
    }
}

fn default_validity_days() -> i64 {
    7
}

/// Recommendation settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RecommendationConfig {
    /// Spend ceiling for recommended actions, in USD.
    #[serde(default)]
    pub budget: f64,

    /// Maximum actions returned per goal.
    #[serde(default = "default_max_actions")]
    pub max_actions: usize,
}

impl Default for RecommendationConfig {
    fn default() -> Self {
        Self {
            budget: 0.0,
            max_actions: default_max_actions(),
        }
    }
}

fn default_max_actions() -> usize {
    crate::recommend::DEFAULT_MAX_ACTIONS
}

impl Config {
    /// Load configuration from a file path.
    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file: {}", path.display()))?;

        let config: Config = toml::from_str(&content)
            .with_context(|| format!("Failed to parse config file: {}", path.display()))?;

        Ok(config)
    }

    /// Try to load configuration from the default location.
    ///
    /// Returns `Ok(None)` if the file doesn't exist, `Err` if it exists but can't be parsed.
    pub fn load_default() -> Result<Option<Self>> {
        let default_path = Path::new(DEFAULT_CONFIG_FILE);

        if default_path.exists() {
            Ok(Some(Self::load(default_path)?))
        } else {
            Ok(None)
        }
    }

    /// Merge this configuration with CLI arguments.
    ///
    /// CLI arguments take precedence over config file settings, but only
    /// when the flag was actually given.
    pub fn merge_with_args(&mut self, args: &crate::cli::Args) {
        if let Some(ref model) = args.model {
            self.model.name = model.clone();
        }
        if let Some(ref url) = args.ollama_url {
            self.model.ollama_url = url.clone();
        }
        if let Some(timeout) = args.timeout {
            self.model.timeout_seconds = timeout;
        }
        if let Some(retries) = args.retries {
            self.model.retries = retries;
        }
        if args.offline {
            self.model.offline = true;
        }

        if let Some(max_tokens) = args.max_tokens {
            self.budget.max_tokens = max_tokens;
        }
        if let Some(max_cost) = args.max_cost {
            self.budget.max_cost_usd = Some(max_cost);
        }

        if let Some(ref goals) = args.goals {
            self.analysis.goals_file = Some(goals.clone());
        }

        if let Some(budget) = args.budget {
            self.recommendations.budget = budget;
        }

        if let Some(concurrency) = args.concurrency {
            self.general.concurrency = concurrency;
        }
        if let Some(ref output) = args.output {
            self.general.output = output.display().to_string();
        }

        // Flags always override
        if args.verbose {
            self.general.verbose = true;
        }
    }

    /// Build the engine settings described by this configuration.
    pub fn engine_config(&self) -> EngineConfig {
        EngineConfig {
            orchestrator: OrchestratorConfig {
                model: self.model.name.clone(),
                temperature: Some(self.model.temperature),
                attempt_timeout: Duration::from_secs(self.model.timeout_seconds),
                retry: RetryPolicy {
                    max_retries: self.model.retries,
                    backoff_base: Duration::from_millis(self.model.backoff_base_ms),
                    backoff_max: Duration::from_millis(self.model.backoff_max_ms),
                },
                truncation: self.budget.truncation,
                max_prompt_rows: self.budget.max_prompt_rows,
            },
            budget: TokenBudget {
                model: self.budget.pricing_model.clone(),
                max_tokens: self.budget.max_tokens,
                max_output_tokens: self.model.max_output_tokens,
                max_cost_usd: self.budget.max_cost_usd,
            },
            validity_days: self.analysis.validity_days,
            deadline: self.analysis.deadline_seconds.map(Duration::from_secs),
            diagnosis: self.analysis.diagnosis,
            concurrency: self.general.concurrency.max(1),
        }
    }

    /// Connection settings for the Ollama invoker.
    pub fn ollama_config(&self) -> OllamaConfig {
        OllamaConfig {
            ollama_url: self.model.ollama_url.clone(),
            ..OllamaConfig::default()
        }
    }

    /// Generate a default configuration file content.
    pub fn default_toml() -> String {
        let config = Config::default();
        toml::to_string_pretty(&config).unwrap_or_else(|_| String::new())
    }
}
