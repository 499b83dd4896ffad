//! Command-line interface argument parsing.
//!
//! This module handles all CLI argument parsing using clap,
//! including validation and default values.

use clap::Parser;
use std::path::PathBuf;

/// Chainsight - goal-driven LLM analysis chains for channel metrics
///
/// Runs a chain of reasoning stages (trend, anomaly, ranking, prediction)
/// over a metrics dataset, then turns the diagnosis into budgeted actions.
/// Markdown/JSON reports. Works offline with local statistics.
///
/// Examples:
///   chainsight --dataset channel.json --goal grow_subscribers
///   chainsight --dataset channel.json --goal increase_ctr,boost_watch_time --budget 250
///   chainsight --dataset channel.json --offline --format json
///   chainsight --list-goals
///   chainsight --init-config
#[derive(Parser, Debug, Clone)]
#[command(author, version, about, long_about = None)]
#[command(propagate_version = true)]
pub struct Args {
    /// Dataset file to analyze
    ///
    /// JSON document with `rows`, optional `metadata` and `timeframe`.
    #[arg(
        short,
        long,
        value_name = "FILE",
        required_unless_present_any = ["init_config", "list_goals"]
    )]
    pub dataset: Option<PathBuf>,

    /// Goals to analyze (comma-separated)
    ///
    /// Several goals run concurrently. Defaults to every goal in the registry.
    #[arg(short, long, value_name = "GOALS", value_delimiter = ',')]
    pub goal: Vec<String>,

    /// Goal definitions file (YAML)
    ///
    /// Overrides the built-in YouTube goals.
    #[arg(long, value_name = "FILE")]
    pub goals: Option<PathBuf>,

    /// Spend ceiling for recommended actions, in USD
    #[arg(short, long, value_name = "USD")]
    pub budget: Option<f64>,

    /// Token budget for one chain run
    #[arg(long, value_name = "TOKENS")]
    pub max_tokens: Option<usize>,

    /// USD cost ceiling for one chain run
    #[arg(long, value_name = "USD")]
    pub max_cost: Option<f64>,

    /// Ollama model to use for analysis
    ///
    /// Can also be set via CHAINSIGHT_MODEL env var or .chainsight.toml config.
    #[arg(short, long, env = "CHAINSIGHT_MODEL")]
    pub model: Option<String>,

    /// Ollama API endpoint URL
    #[arg(long, env = "OLLAMA_URL")]
    pub ollama_url: Option<String>,

    /// Timeout for one model call, in seconds
    #[arg(long, value_name = "SECS")]
    pub timeout: Option<u64>,

    /// Retries after the first attempt on transient model failures
    #[arg(long, value_name = "COUNT")]
    pub retries: Option<u32>,

    /// Number of goals analyzed concurrently
    #[arg(long, value_name = "NUM")]
    pub concurrency: Option<usize>,

    /// Answer every stage from local statistics, without calling a model
    #[arg(long)]
    pub offline: bool,

    /// Output format (markdown, json)
    #[arg(long, default_value = "markdown", value_name = "FORMAT")]
    pub format: OutputFormat,

    /// Output file path for the report
    ///
    /// Default: from config or chainsight_report.md
    #[arg(short, long, value_name = "FILE")]
    pub output: Option<PathBuf>,

    /// Print the available goals and exit
    #[arg(long)]
    pub list_goals: bool,

    /// Generate a default .chainsight.toml configuration file
    #[arg(long)]
    pub init_config: bool,

    /// Path to configuration file
    ///
    /// If not specified, looks for .chainsight.toml in the current directory
    #[arg(short, long, value_name = "FILE")]
    pub config: Option<PathBuf>,

    /// Enable verbose logging output
    #[arg(short, long)]
    pub verbose: bool,

    /// Run in quiet mode (minimal output)
    #[arg(short, long)]
    pub quiet: bool,

    /// Emit logs as single-line JSON records
    #[arg(long)]
    pub log_json: bool,
}

/// Output format for the report.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, clap::ValueEnum)]
pub enum OutputFormat {
    /// Markdown format (default)
    #[default]
    Markdown,
    /// JSON format
    Json,
}

impl Args {
    /// Parse command-line arguments.
    pub fn parse_args() -> Self {
        Self::parse()
    }

    /// Validate the parsed arguments.
    pub fn validate(&self) -> Result<(), String> {
        if self.init_config {
            return Ok(());
        }

        if self.verbose && self.quiet {
            return Err("Cannot use both --verbose and --quiet".to_string());
        }

        if let Some(ref goals) = self.goals {
            if !goals.is_file() {
                return Err(format!("Goals file does not exist: {}", goals.display()));
            }
        }

        if self.list_goals {
            return Ok(());
        }

        if let Some(ref dataset) = self.dataset {
            if !dataset.exists() {
                return Err(format!("Dataset file does not exist: {}", dataset.display()));
            }
            if !dataset.is_file() {
                return Err(format!("Dataset path is not a file: {}", dataset.display()));
            }
        }

        if self.goal.iter().any(|g| g.trim().is_empty()) {
            return Err("Goal names must not be empty".to_string());
        }

        if let Some(ref url) = self.ollama_url {
            if !url.starts_with("http://") && !url.starts_with("https://") {
                return Err("Ollama URL must start with 'http://' or 'https://'".to_string());
            }
        }

        if let Some(budget) = self.budget {
            if !budget.is_finite() || budget < 0.0 {
                return Err("Budget must be a non-negative amount".to_string());
            }
        }

        if let Some(max_cost) = self.max_cost {
            if !max_cost.is_finite() || max_cost < 0.0 {
                return Err("Max cost must be a non-negative amount".to_string());
            }
        }

        if self.max_tokens == Some(0) {
            return Err("Max tokens must be at least 1".to_string());
        }

        if self.concurrency == Some(0) {
            return Err("Concurrency must be at least 1".to_string());
        }

        if self.timeout == Some(0) {
            return Err("Timeout must be at least 1 second".to_string());
        }

        Ok(())
    }

    /// Returns the log level based on verbosity settings.
    pub fn log_level(&self) -> tracing::Level {
        if self.quiet {
            tracing::Level::ERROR
        } else if self.verbose {
            tracing::Level::DEBUG
        } else {
            tracing::Level::INFO
        }
    }

    /// Requested goals with surrounding whitespace removed.
    pub fn goal_ids(&self) -> Vec<String> {
        self.goal.iter().map(|g| g.trim().to_string()).collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    fn make_args() -> Args {
        Args {
            dataset: None,
            goal: vec!["grow_subscribers".to_string()],
            goals: None,
            budget: None,
            max_tokens: None,
            max_cost: None,
            model: None,
            ollama_url: None,
            timeout: None,
            retries: None,
            concurrency: None,
            offline: false,
            format: OutputFormat::Markdown,
            output: None,
            list_goals: false,
            init_config: false,
            config: None,
            verbose: false,
            quiet: false,
            log_json: false,
        }
    }

    #[test]
    fn test_parse_comma_delimited_goals() {
        let args = Args::parse_from([
            "chainsight",
            "--dataset",
            "data.json",
            "--goal",
            "grow_subscribers, increase_ctr",
            "--format",
            "json",
        ]);
        assert_eq!(args.goal_ids(), vec!["grow_subscribers", "increase_ctr"]);
        assert_eq!(args.format, OutputFormat::Json);
    }

    #[test]
    fn test_dataset_required_unless_listing() {
        assert!(Args::try_parse_from(["chainsight"]).is_err());
        assert!(Args::try_parse_from(["chainsight", "--list-goals"]).is_ok());
        assert!(Args::try_parse_from(["chainsight", "--init-config"]).is_ok());
    }

    #[test]
    fn test_validation_missing_dataset_file() {
        let mut args = make_args();
        args.dataset = Some(PathBuf::from("/definitely/not/here.json"));
        assert!(args.validate().is_err());
    }

    #[test]
    fn test_validation_accepts_existing_dataset() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, "{{\"rows\": []}}").unwrap();

        let mut args = make_args();
        args.dataset = Some(file.path().to_path_buf());
        assert!(args.validate().is_ok());
    }

    #[test]
    fn test_validation_invalid_values() {
        let mut args = make_args();
        args.ollama_url = Some("localhost:11434".to_string());
        assert!(args.validate().is_err());

        let mut args = make_args();
        args.budget = Some(-5.0);
        assert!(args.validate().is_err());

        let mut args = make_args();
        args.concurrency = Some(0);
        assert!(args.validate().is_err());

        let mut args = make_args();
        args.goal = vec!["  ".to_string()];
        assert!(args.validate().is_err());
    }

    #[test]
    fn test_validation_conflicting_options() {
        let mut args = make_args();
        args.verbose = true;
        args.quiet = true;
        assert!(args.validate().is_err());
    }

    #[test]
    fn test_log_level() {
        let mut args = make_args();
        assert_eq!(args.log_level(), tracing::Level::INFO);

        args.verbose = true;
        assert_eq!(args.log_level(), tracing::Level::DEBUG);

        args.verbose = false;
        args.quiet = true;
        assert_eq!(args.log_level(), tracing::Level::ERROR);
    }
}
