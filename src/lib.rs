//! Chainsight - goal-driven, budget-aware LLM analysis chains.
//!
//! A goal (for example `grow_subscribers`) names a chain of reasoning stages.
//! The [`analysis::AnalysisEngine`] runs that chain over a [`dataset::Dataset`]
//! under a token budget, and the [`recommend::RecommendationEngine`] turns the
//! resulting diagnosis into a ranked, cost-filtered list of actions.

pub mod analysis;
pub mod cli;
pub mod config;
pub mod dataset;
pub mod error;
pub mod llm;
pub mod metrics;
pub mod models;
pub mod orchestrator;
pub mod recommend;
pub mod registry;
pub mod report;
pub mod stages;
pub mod tokens;

pub use analysis::{AnalysisConstraints, AnalysisEngine, EngineConfig};
pub use dataset::Dataset;
pub use error::{AnalysisError, ConfigurationError, InvocationError};
pub use registry::GoalRegistry;
pub use recommend::RecommendationEngine;
