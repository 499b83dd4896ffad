//! Normalized dataset handed over by the ingestion layer.
//!
//! The analysis core does not parse source-specific formats. It only needs
//! tabular rows with named columns, a few scalar metadata fields and an
//! optional timeframe.

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::collections::{BTreeMap, BTreeSet};
use std::path::Path;

/// Analysis window covered by a dataset.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Timeframe {
    pub start: DateTime<Utc>,
    pub end: DateTime<Utc>,
}

impl Timeframe {
    /// Whole days between start and end (never negative).
    pub fn days(&self) -> i64 {
        (self.end - self.start).num_days().max(0)
    }
}

/// Summary statistics of a numeric column.
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct ColumnStats {
    pub count: usize,
    pub mean: f64,
    /// Population variance.
    pub variance: f64,
    pub min: f64,
    pub max: f64,
}

impl ColumnStats {
    pub fn from_values(values: &[f64]) -> Option<Self> {
        if values.is_empty() {
            return None;
        }
        let count = values.len();
        let mean = values.iter().sum::<f64>() / count as f64;
        let variance = values.iter().map(|v| (v - mean).powi(2)).sum::<f64>() / count as f64;
        let min = values.iter().copied().fold(f64::INFINITY, f64::min);
        let max = values.iter().copied().fold(f64::NEG_INFINITY, f64::max);
        Some(Self {
            count,
            mean,
            variance,
            min,
            max,
        })
    }

    pub fn std_dev(&self) -> f64 {
        self.variance.sqrt()
    }
}

/// Tabular rows plus scalar metadata.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Dataset {
    #[serde(default)]
    pub rows: Vec<Map<String, Value>>,
    #[serde(default)]
    pub metadata: BTreeMap<String, Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timeframe: Option<Timeframe>,
}

impl Dataset {
    pub fn new(rows: Vec<Map<String, Value>>) -> Self {
        Self {
            rows,
            ..Self::default()
        }
    }

    /// Build a dataset from JSON objects; non-object values are ignored.
    pub fn from_values(values: impl IntoIterator<Item = Value>) -> Self {
        let rows = values
            .into_iter()
            .filter_map(|v| match v {
                Value::Object(map) => Some(map),
                _ => None,
            })
            .collect();
        Self::new(rows)
    }

    pub fn with_metadata(mut self, key: impl Into<String>, value: impl Into<Value>) -> Self {
        self.metadata.insert(key.into(), value.into());
        self
    }

    pub fn with_timeframe(mut self, timeframe: Timeframe) -> Self {
        self.timeframe = Some(timeframe);
        self
    }

    /// Parse a dataset document (`{"rows": [...], "metadata": {...}, "timeframe": {...}}`).
    pub fn from_json_str(content: &str) -> Result<Self> {
        serde_json::from_str(content).context("Failed to parse dataset JSON")
    }

    /// Load a dataset document from disk.
    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read dataset file: {}", path.display()))?;
        Self::from_json_str(&content)
            .with_context(|| format!("Invalid dataset file: {}", path.display()))
    }

    pub fn len(&self) -> usize {
        self.rows.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }

    /// All column names present in any row, sorted.
    pub fn columns(&self) -> BTreeSet<String> {
        self.rows
            .iter()
            .flat_map(|row| row.keys().cloned())
            .collect()
    }

    pub fn has_column(&self, name: &str) -> bool {
        self.rows.iter().any(|row| row.contains_key(name))
    }

    /// Numeric values of a column in row order. Numeric strings are accepted;
    /// missing or non-numeric cells are skipped.
    pub fn numeric_column(&self, name: &str) -> Vec<f64> {
        self.rows
            .iter()
            .filter_map(|row| row.get(name))
            .filter_map(|value| match value {
                Value::Number(n) => n.as_f64(),
                Value::String(s) => s.trim().parse::<f64>().ok(),
                _ => None,
            })
            .collect()
    }

    pub fn column_stats(&self, name: &str) -> Option<ColumnStats> {
        ColumnStats::from_values(&self.numeric_column(name))
    }

    /// Timeframe length in days, from the timeframe or a `timeframe_days` metadata field.
    pub fn timeframe_days(&self) -> Option<i64> {
        self.timeframe.map(|t| t.days()).or_else(|| {
            self.metadata
                .get("timeframe_days")
                .and_then(|v| v.as_i64())
        })
    }

    /// Metadata value rendered as plain text, for scalar values only.
    pub fn metadata_scalar(&self, key: &str) -> Option<String> {
        match self.metadata.get(key)? {
            Value::String(s) => Some(s.clone()),
            Value::Number(n) => Some(n.to_string()),
            Value::Bool(b) => Some(b.to_string()),
            _ => None,
        }
    }

    /// Label of a row: the `id_column` value if present, else `row_<n>`.
    pub fn row_label(&self, index: usize, id_column: Option<&str>) -> String {
        id_column
            .and_then(|col| self.rows.get(index)?.get(col))
            .map(|v| match v {
                Value::String(s) => s.clone(),
                other => other.to_string(),
            })
            .unwrap_or_else(|| format!("row_{}", index + 1))
    }

    /// Compact text rendering for prompts: one JSON object per line, capped at
    /// `max_rows`, followed by a note on how many rows were left out.
    pub fn summarize(&self, max_rows: usize) -> String {
        let mut lines: Vec<String> = self
            .rows
            .iter()
            .take(max_rows)
            .map(|row| serde_json::to_string(row).unwrap_or_default())
            .collect();

        if self.rows.len() > max_rows {
            lines.push(format!("... ({} more rows)", self.rows.len() - max_rows));
        }

        lines.join("\n")
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn sample() -> Dataset {
        Dataset::from_values(vec![
            json!({"video_id": "a", "views": 100, "ctr": "4.0"}),
            json!({"video_id": "b", "views": 300, "ctr": "6.0"}),
            json!({"video_id": "c", "views": 200}),
        ])
        .with_metadata("channel", "Rust Weekly")
        .with_metadata("timeframe_days", 30)
    }

    #[test]
    fn test_columns_and_numeric_values() {
        let dataset = sample();
        assert_eq!(dataset.len(), 3);
        assert!(dataset.has_column("ctr"));
        assert!(!dataset.has_column("likes"));
        assert_eq!(
            dataset.columns().into_iter().collect::<Vec<_>>(),
            vec!["ctr", "video_id", "views"]
        );
        assert_eq!(dataset.numeric_column("ctr"), vec![4.0, 6.0]);
    }

    #[test]
    fn test_column_stats() {
        let stats = sample().column_stats("views").unwrap();
        assert_eq!(stats.count, 3);
        assert_eq!(stats.mean, 200.0);
        assert!((stats.variance - 6666.666).abs() < 0.01);
        assert_eq!(stats.min, 100.0);
        assert_eq!(stats.max, 300.0);
        assert!(sample().column_stats("video_id").is_none());
    }

    #[test]
    fn test_metadata_and_labels() {
        let dataset = sample();
        assert_eq!(dataset.metadata_scalar("channel").as_deref(), Some("Rust Weekly"));
        assert_eq!(dataset.timeframe_days(), Some(30));
        assert_eq!(dataset.row_label(1, Some("video_id")), "b");
        assert_eq!(dataset.row_label(1, None), "row_2");
    }

    #[test]
    fn test_summarize_caps_rows() {
        let text = sample().summarize(2);
        assert_eq!(text.lines().count(), 3);
        assert!(text.ends_with("... (1 more rows)"));
    }

    #[test]
    fn test_parse_document_with_timeframe() {
        let dataset = Dataset::from_json_str(
            r#"{
                "rows": [{"views": 1}],
                "timeframe": {"start": "2026-09-01T00:00:00Z", "end": "2026-10-01T00:00:00Z"}
            }"#,
        )
        .unwrap();
        assert_eq!(dataset.timeframe_days(), Some(30));
        assert!(Dataset::from_json_str("[1, 2]").is_err());
    }

    #[test]
    fn test_sample_fixture() {
        let path = Path::new(env!("CARGO_MANIFEST_DIR")).join("fixtures/channel_30d.json");
        let dataset = Dataset::load(&path).unwrap();
        assert_eq!(dataset.len(), 14);
        assert_eq!(dataset.timeframe_days(), Some(28));
        assert_eq!(
            dataset.metadata_scalar("channel_name").as_deref(),
            Some("Field Notes Kitchen")
        );
        for column in ["subscribers_gained", "ctr", "avg_view_duration"] {
            assert!(dataset.has_column(column), "missing {}", column);
        }
    }
}
