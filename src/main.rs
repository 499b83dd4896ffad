//! Chainsight - goal-driven LLM analysis for channel metrics
//!
//! A CLI tool that runs analysis chains over a metrics dataset with Ollama
//! (or offline statistics) and writes a diagnosis plus budgeted actions.
//!
//! Exit codes:
//!   0 - Success
//!   1 - Runtime error (config, dataset, every goal failed, etc.)
//!   2 - At least one analysis run was aborted

use anyhow::{Context, Result};
use chainsight::analysis::{AnalysisConstraints, AnalysisEngine};
use chainsight::cli::{Args, OutputFormat};
use chainsight::config::{Config, DEFAULT_CONFIG_FILE};
use chainsight::dataset::Dataset;
use chainsight::llm::{ModelInvoker, OllamaInvoker};
use chainsight::metrics::MetricsCollector;
use chainsight::recommend::RecommendationEngine;
use chainsight::registry::GoalRegistry;
use chainsight::report::{self, GoalFailure, GoalReport, Report, ReportMetadata};
use chrono::Utc;
use indicatif::{ProgressBar, ProgressStyle};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, error, info, warn};
use tracing_subscriber::{EnvFilter, FmtSubscriber};

#[tokio::main]
async fn main() -> Result<()> {
    // Parse command-line arguments
    let args = Args::parse_args();

    // Validate arguments
    if let Err(e) = args.validate() {
        eprintln!("Error: {}", e);
        std::process::exit(1);
    }

    // Handle --init-config early (no logging needed)
    if args.init_config {
        return handle_init_config();
    }

    init_logging(&args);

    info!("Chainsight v{}", env!("CARGO_PKG_VERSION"));
    debug!("Arguments: {:?}", args);

    match run(args).await {
        Ok(exit_code) => {
            std::process::exit(exit_code);
        }
        Err(e) => {
            error!("Analysis failed: {:#}", e);
            eprintln!("\n❌ Error: {:#}", e);
            std::process::exit(1);
        }
    }
}

/// Handle --init-config: generate a default .chainsight.toml.
fn handle_init_config() -> Result<()> {
    let path = std::path::Path::new(DEFAULT_CONFIG_FILE);

    if path.exists() {
        eprintln!(
            "⚠️  {} already exists. Remove it first or edit it manually.",
            DEFAULT_CONFIG_FILE
        );
        std::process::exit(1);
    }

    let content = Config::default_toml();
    std::fs::write(path, &content)
        .with_context(|| format!("Failed to write {}", DEFAULT_CONFIG_FILE))?;

    println!("✅ Created {} with default settings.", DEFAULT_CONFIG_FILE);
    println!("   Edit it to customize model, budget, retries, and more.");
    Ok(())
}

/// Initialize logging based on verbosity settings.
///
/// `RUST_LOG` takes precedence over `-v`/`-q` when set.
fn init_logging(args: &Args) {
    let level = args.log_level().to_string().to_lowercase();
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level));

    let result = if args.log_json {
        let subscriber = FmtSubscriber::builder()
            .with_env_filter(filter)
            .with_target(false)
            .json()
            .flatten_event(true)
            .finish();
        tracing::subscriber::set_global_default(subscriber)
    } else {
        let subscriber = FmtSubscriber::builder()
            .with_env_filter(filter)
            .with_target(false)
            .with_thread_ids(false)
            .with_file(false)
            .with_line_number(false)
            .compact()
            .finish();
        tracing::subscriber::set_global_default(subscriber)
    };

    if let Err(e) = result {
        eprintln!("Failed to set tracing subscriber: {}", e);
    }
}

/// Run the analysis workflow. Returns the process exit code.
async fn run(args: Args) -> Result<i32> {
    let start_time = Instant::now();

    let mut config = load_config(&args)?;
    config.merge_with_args(&args);

    let registry = Arc::new(load_registry(&config)?);

    if args.list_goals {
        print_goals(&registry);
        return Ok(0);
    }

    let dataset_path = args
        .dataset
        .as_ref()
        .context("--dataset is required unless --list-goals or --init-config is given")?;
    println!("📂 Loading dataset: {}", dataset_path.display());
    let dataset = Dataset::load(dataset_path)?;
    info!(rows = dataset.len(), columns = dataset.columns().len(), "Dataset loaded");

    let goal_ids: Vec<String> = if args.goal.is_empty() {
        registry.goal_ids().map(String::from).collect()
    } else {
        args.goal_ids()
    };

    let invoker: Option<Arc<dyn ModelInvoker>> = if config.model.offline {
        None
    } else {
        Some(Arc::new(OllamaInvoker::new(config.ollama_config())))
    };

    println!("🤖 Initializing analysis engine...");
    if config.model.offline {
        println!("   Mode: offline statistics (no model calls)");
    } else {
        println!("   Model: {}", config.model.name);
        println!("   Ollama: {}", config.model.ollama_url);
        println!("   Timeout: {}s per call", config.model.timeout_seconds);
    }
    println!("   Token budget: {} per goal", config.budget.max_tokens);

    let metrics = Arc::new(MetricsCollector::new());
    let engine = AnalysisEngine::new(
        Arc::clone(&registry),
        invoker,
        Arc::clone(&metrics),
        config.engine_config(),
    );

    println!("\n🔬 Analyzing {} goal(s): {}\n", goal_ids.len(), goal_ids.join(", "));

    let spinner = if args.quiet {
        ProgressBar::hidden()
    } else {
        ProgressBar::new_spinner()
    };
    if let Ok(style) = ProgressStyle::default_spinner().template("{spinner:.green} [{elapsed_precise}] {msg}") {
        spinner.set_style(style);
    }
    spinner.set_message("Running analysis chains...");
    spinner.enable_steady_tick(Duration::from_millis(120));

    let results = engine
        .analyze_batch(&dataset, &goal_ids, &AnalysisConstraints::default())
        .await;

    spinner.finish_and_clear();

    println!("📝 Building recommendations...");
    let recommender = RecommendationEngine::new(Arc::clone(&registry))
        .with_max_actions(config.recommendations.max_actions);

    let mut goals = Vec::new();
    let mut failures = Vec::new();
    for (goal_id, result) in results {
        match result {
            Ok(analysis) => {
                let recommendations =
                    match recommender.recommend(&analysis, &goal_id, config.recommendations.budget) {
                        Ok(recommendations) => Some(recommendations),
                        Err(e) => {
                            warn!(goal = %goal_id, "Recommendation failed: {}", e);
                            None
                        }
                    };
                goals.push(GoalReport {
                    analysis,
                    recommendations,
                });
            }
            Err(e) => {
                warn!(goal = %goal_id, kind = e.kind(), "Analysis failed: {}", e);
                failures.push(GoalFailure {
                    goal: goal_id,
                    kind: e.kind().to_string(),
                    message: e.to_string(),
                });
            }
        }
    }

    debug!(events = metrics.len(), "Run metrics collected");

    let report = Report {
        metadata: ReportMetadata {
            dataset: dataset_path.display().to_string(),
            domain: registry.domain().to_string(),
            generated_at: Utc::now(),
            model_used: config.model.name.clone(),
            offline: config.model.offline,
            rows: dataset.len(),
            duration_seconds: start_time.elapsed().as_secs_f64(),
        },
        goals,
        failures,
    };

    let output = match args.format {
        OutputFormat::Json => report::generate_json_report(&report)?,
        OutputFormat::Markdown => report::generate_markdown_report(&report),
    };

    let output_path = &config.general.output;
    std::fs::write(output_path, &output)
        .with_context(|| format!("Failed to write report to {}", output_path))?;

    print_summary(&report);
    println!("\n✅ Analysis complete! Report saved to: {}", output_path);

    if report.goals.is_empty() && !report.failures.is_empty() {
        eprintln!("\n⛔ No goal could be analyzed (exit code 1).");
        return Ok(1);
    }
    if report.has_aborted_runs() {
        eprintln!("\n⛔ At least one analysis run was aborted (exit code 2).");
        return Ok(2);
    }

    Ok(0)
}

fn print_summary(report: &Report) {
    println!("\n📊 Analysis Summary:");
    for goal in &report.goals {
        let analysis = &goal.analysis;
        let actions = goal
            .recommendations
            .as_ref()
            .map(|r| r.actions.len())
            .unwrap_or(0);
        println!(
            "   {} - {} | confidence {} | {} tokens | {} action(s)",
            analysis.goal,
            analysis.run_state,
            analysis.confidence,
            analysis.usage.total_tokens,
            actions
        );
    }
    for failure in &report.failures {
        println!("   {} - failed ({}): {}", failure.goal, failure.kind, failure.message);
    }
    println!(
        "   Total: {} tokens, ${:.4} | Duration: {:.1}s",
        report.total_tokens(),
        report.total_cost_usd(),
        report.metadata.duration_seconds
    );
}

fn print_goals(registry: &GoalRegistry) {
    println!("Available goals ({}):\n", registry.domain());
    for goal in registry.goals() {
        println!("  {:<20} {}", goal.id, goal.description);
        println!("  {:<20} chain: {}", "", goal.stage_names().join(" → "));
    }
}

/// Load configuration from file or use defaults.
fn load_config(args: &Args) -> Result<Config> {
    // Try explicit config path
    if let Some(ref config_path) = args.config {
        info!("Loading config from: {}", config_path.display());
        return Config::load(config_path);
    }

    // Try default location
    match Config::load_default() {
        Ok(Some(config)) => {
            info!("Loaded default config from {}", DEFAULT_CONFIG_FILE);
            Ok(config)
        }
        Ok(None) => {
            debug!("No config file found, using defaults");
            Ok(Config::default())
        }
        Err(e) => {
            warn!("Failed to load config: {}", e);
            Ok(Config::default())
        }
    }
}

/// Load the goal registry from the configured file, or the built-in goals.
fn load_registry(config: &Config) -> Result<GoalRegistry> {
    match config.analysis.goals_file {
        Some(ref path) => {
            info!("Loading goals from: {}", path.display());
            GoalRegistry::load(path)
                .with_context(|| format!("Invalid goal definitions in {}", path.display()))
        }
        None => GoalRegistry::builtin().context("Built-in goal definitions are invalid"),
    }
}
