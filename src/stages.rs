//! Stage capabilities.
//!
//! Each [`StageKind`] has one [`Stage`] implementation that knows how to read
//! the model's answer for that kind of reasoning, and how to produce a
//! deterministic offline answer from simple dataset statistics when no model
//! is bound.

use crate::dataset::{ColumnStats, Dataset};
use crate::models::{Confidence, MetricToWatch, StageKind, StageOutput};
use serde_json::{json, Map, Value};

/// Period used for predictions and metrics to watch.
pub const PREDICTION_PERIOD: &str = "7 days";

/// Parsed stage answer.
#[derive(Debug, Clone, PartialEq)]
pub struct StageAnswer {
    pub output: StageOutput,
    pub confidence: Confidence,
}

/// What the offline path needs to know about the goal.
#[derive(Debug, Clone, Copy)]
pub struct StageInput<'a> {
    pub dataset: &'a Dataset,
    pub metric: &'a str,
    pub id_column: Option<&'a str>,
}

/// One kind of reasoning step.
pub trait Stage: Send + Sync {
    fn kind(&self) -> StageKind;

    /// Rows the stage needs to say anything meaningful.
    fn min_rows(&self) -> usize;

    /// Check kind-specific structure of a parsed model answer.
    fn validate(&self, object: &Map<String, Value>) -> Result<(), String>;

    /// Deterministic answer computed from the dataset alone.
    fn offline(&self, input: &StageInput<'_>) -> StageAnswer;

    /// Parse raw model text into a structured answer.
    fn parse(&self, raw: &str) -> Result<StageAnswer, String> {
        let object = extract_json_object(raw)?;
        self.validate(&object)?;

        let headline = ["headline", "insight", "summary"]
            .iter()
            .find_map(|key| object.get(*key).and_then(Value::as_str))
            .map(str::trim)
            .filter(|s| !s.is_empty())
            .ok_or_else(|| "response has no 'headline'".to_string())?
            .to_string();

        let confidence = object
            .get("confidence")
            .and_then(Value::as_str)
            .map(Confidence::from)
            .unwrap_or(Confidence::Medium);

        Ok(StageAnswer {
            output: StageOutput {
                headline,
                data: Value::Object(object),
            },
            confidence,
        })
    }
}

/// Returns the stage implementation for a kind.
pub fn stage_for(kind: StageKind) -> &'static dyn Stage {
    match kind {
        StageKind::Trend => &TrendStage,
        StageKind::Anomaly => &AnomalyStage,
        StageKind::Ranking => &RankingStage,
        StageKind::Prediction => &PredictionStage,
    }
}

/// Pull the JSON object out of a model reply, tolerating code fences and
/// chatter around it.
pub fn extract_json_object(raw: &str) -> Result<Map<String, Value>, String> {
    let start = raw.find('{').ok_or_else(|| "response contains no JSON object".to_string())?;
    let end = raw.rfind('}').ok_or_else(|| "response contains no JSON object".to_string())?;
    if end < start {
        return Err("response contains no JSON object".to_string());
    }

    match serde_json::from_str::<Value>(&raw[start..=end]) {
        Ok(Value::Object(map)) => Ok(map),
        Ok(_) => Err("response is not a JSON object".to_string()),
        Err(e) => Err(format!("invalid JSON in response: {}", e)),
    }
}

fn require_array(object: &Map<String, Value>, key: &str, required: bool) -> Result<(), String> {
    match object.get(key) {
        Some(Value::Array(_)) => Ok(()),
        Some(_) => Err(format!("'{}' must be an array", key)),
        None if required => Err(format!("response has no '{}' array", key)),
        None => Ok(()),
    }
}

fn round2(value: f64) -> f64 {
    if value.is_finite() {
        (value * 100.0).round() / 100.0
    } else {
        0.0
    }
}

fn mean(values: &[f64]) -> f64 {
    if values.is_empty() {
        0.0
    } else {
        values.iter().sum::<f64>() / values.len() as f64
    }
}

/// Extract metrics to watch from a prediction output.
pub fn metrics_to_watch(output: &StageOutput) -> Vec<MetricToWatch> {
    let Some(predictions) = output.data.get("predictions").and_then(Value::as_array) else {
        return Vec::new();
    };

    predictions
        .iter()
        .filter_map(|p| {
            let metric = p.get("metric")?.as_str()?.to_string();
            let target = ["target", "prediction"]
                .iter()
                .find_map(|key| match p.get(*key)? {
                    Value::String(s) => Some(s.clone()),
                    Value::Number(n) => Some(n.to_string()),
                    _ => None,
                })
                .unwrap_or_else(|| "baseline".to_string());
            let period = p
                .get("period")
                .and_then(Value::as_str)
                .unwrap_or(PREDICTION_PERIOD)
                .to_string();
            Some(MetricToWatch {
                metric,
                target,
                period,
            })
        })
        .collect()
}

/// Trend: compares the first and second half of the series.
pub struct TrendStage;

impl Stage for TrendStage {
    fn kind(&self) -> StageKind {
        StageKind::Trend
    }

    fn min_rows(&self) -> usize {
        2
    }

    fn validate(&self, _object: &Map<String, Value>) -> Result<(), String> {
        Ok(())
    }

    fn offline(&self, input: &StageInput<'_>) -> StageAnswer {
        let values = input.dataset.numeric_column(input.metric);
        let stats = ColumnStats::from_values(&values);
        let n = values.len();

        if n < 2 {
            return StageAnswer {
                output: StageOutput {
                    headline: format!("Not enough {} history to call a trend", input.metric),
                    data: json!({"stub": true, "metric": input.metric, "count": n}),
                },
                confidence: Confidence::Low,
            };
        }

        let (first, second) = values.split_at(n / 2);
        let first_mean = mean(first);
        let second_mean = mean(second);
        let change_pct = if first_mean.abs() > f64::EPSILON {
            (second_mean - first_mean) / first_mean.abs() * 100.0
        } else if second_mean > 0.0 {
            100.0
        } else {
            0.0
        };
        let direction = if change_pct > 5.0 {
            "up"
        } else if change_pct < -5.0 {
            "down"
        } else {
            "flat"
        };

        let headline = match direction {
            "flat" => format!("{} is flat across {} records", input.metric, n),
            _ => format!(
                "{} trending {} {:.1}% across {} records",
                input.metric,
                direction,
                change_pct.abs(),
                n
            ),
        };

        StageAnswer {
            output: StageOutput {
                headline,
                data: json!({
                    "stub": true,
                    "metric": input.metric,
                    "direction": direction,
                    "change_pct": round2(change_pct),
                    "first_half_mean": round2(first_mean),
                    "second_half_mean": round2(second_mean),
                    "mean": round2(stats.map(|s| s.mean).unwrap_or(0.0)),
                    "variance": round2(stats.map(|s| s.variance).unwrap_or(0.0)),
                    "count": n,
                }),
            },
            confidence: if n >= 14 {
                Confidence::High
            } else if n >= 7 {
                Confidence::Medium
            } else {
                Confidence::Low
            },
        }
    }
}

/// Anomaly: flags rows more than two standard deviations from the mean.
pub struct AnomalyStage;

const ANOMALY_Z_THRESHOLD: f64 = 2.0;

impl Stage for AnomalyStage {
    fn kind(&self) -> StageKind {
        StageKind::Anomaly
    }

    fn min_rows(&self) -> usize {
        3
    }

    fn validate(&self, object: &Map<String, Value>) -> Result<(), String> {
        require_array(object, "anomalies", false)
    }

    fn offline(&self, input: &StageInput<'_>) -> StageAnswer {
        let dataset = input.dataset;
        let values = dataset.numeric_column(input.metric);
        let stats = ColumnStats::from_values(&values);

        let mut anomalies = Vec::new();
        if let Some(stats) = stats.filter(|s| s.std_dev() > f64::EPSILON) {
            for (index, row) in dataset.rows.iter().enumerate() {
                let Some(value) = row.get(input.metric).and_then(|v| match v {
                    Value::Number(n) => n.as_f64(),
                    Value::String(s) => s.trim().parse::<f64>().ok(),
                    _ => None,
                }) else {
                    continue;
                };
                let z = (value - stats.mean) / stats.std_dev();
                if z.abs() >= ANOMALY_Z_THRESHOLD {
                    anomalies.push(json!({
                        "item_id": dataset.row_label(index, input.id_column),
                        "metric": input.metric,
                        "deviation": round2(z),
                        "direction": if z > 0.0 { "above_average" } else { "below_average" },
                    }));
                }
            }
        }

        let headline = if anomalies.is_empty() {
            format!("No anomalies in {} across {} records", input.metric, values.len())
        } else {
            format!(
                "{} anomalous record(s) in {} out of {}",
                anomalies.len(),
                input.metric,
                values.len()
            )
        };

        StageAnswer {
            output: StageOutput {
                headline,
                data: json!({
                    "stub": true,
                    "metric": input.metric,
                    "threshold": ANOMALY_Z_THRESHOLD,
                    "anomalies": anomalies,
                }),
            },
            confidence: Confidence::Medium,
        }
    }
}

/// Ranking: orders rows by the goal's metric.
pub struct RankingStage;

const RANKING_TOP_N: usize = 5;

impl Stage for RankingStage {
    fn kind(&self) -> StageKind {
        StageKind::Ranking
    }

    fn min_rows(&self) -> usize {
        1
    }

    fn validate(&self, object: &Map<String, Value>) -> Result<(), String> {
        require_array(object, "rankings", false)
    }

    fn offline(&self, input: &StageInput<'_>) -> StageAnswer {
        let dataset = input.dataset;
        let mut scored: Vec<(usize, f64)> = dataset
            .rows
            .iter()
            .enumerate()
            .filter_map(|(index, row)| {
                let value = match row.get(input.metric)? {
                    Value::Number(n) => n.as_f64()?,
                    Value::String(s) => s.trim().parse::<f64>().ok()?,
                    _ => return None,
                };
                Some((index, value))
            })
            .collect();
        // Stable sort keeps row order among equal scores.
        scored.sort_by(|a, b| b.1.partial_cmp(&a.1).unwrap_or(std::cmp::Ordering::Equal));

        let rankings: Vec<Value> = scored
            .iter()
            .take(RANKING_TOP_N)
            .enumerate()
            .map(|(rank, (index, score))| {
                json!({
                    "rank": rank + 1,
                    "item_id": dataset.row_label(*index, input.id_column),
                    "score": round2(*score),
                })
            })
            .collect();

        let headline = match scored.first() {
            Some((index, score)) => format!(
                "Top performer by {}: {} ({})",
                input.metric,
                dataset.row_label(*index, input.id_column),
                round2(*score)
            ),
            None => format!("No rows carry a numeric {}", input.metric),
        };

        StageAnswer {
            output: StageOutput {
                headline,
                data: json!({
                    "stub": true,
                    "metric": input.metric,
                    "rankings": rankings,
                }),
            },
            confidence: if scored.len() >= 3 {
                Confidence::High
            } else {
                Confidence::Medium
            },
        }
    }
}

/// Prediction: least-squares line over the series, projected one step ahead.
pub struct PredictionStage;

impl Stage for PredictionStage {
    fn kind(&self) -> StageKind {
        StageKind::Prediction
    }

    fn min_rows(&self) -> usize {
        2
    }

    fn validate(&self, object: &Map<String, Value>) -> Result<(), String> {
        require_array(object, "predictions", true)
    }

    fn offline(&self, input: &StageInput<'_>) -> StageAnswer {
        let values = input.dataset.numeric_column(input.metric);
        let n = values.len();

        if n < 2 {
            return StageAnswer {
                output: StageOutput {
                    headline: format!("Not enough {} history to project", input.metric),
                    data: json!({"stub": true, "metric": input.metric, "predictions": []}),
                },
                confidence: Confidence::Low,
            };
        }

        let x_mean = (n as f64 - 1.0) / 2.0;
        let y_mean = mean(&values);
        let (mut num, mut den) = (0.0, 0.0);
        for (i, y) in values.iter().enumerate() {
            let dx = i as f64 - x_mean;
            num += dx * (y - y_mean);
            den += dx * dx;
        }
        let slope = if den > 0.0 { num / den } else { 0.0 };
        let forecast = y_mean + slope * (n as f64 - x_mean);

        let predictions = vec![
            json!({
                "metric": input.metric,
                "target": format!("{:.1}", forecast),
                "period": PREDICTION_PERIOD,
                "confidence": "medium",
            }),
            json!({
                "metric": format!("{}_trend", input.metric),
                "target": format!("{:+.2} per record", slope),
                "period": PREDICTION_PERIOD,
                "confidence": "medium",
            }),
        ];

        StageAnswer {
            output: StageOutput {
                headline: format!(
                    "{} projected at {:.1} next period ({:+.2} per record)",
                    input.metric, forecast, slope
                ),
                data: json!({
                    "stub": true,
                    "metric": input.metric,
                    "slope": round2(slope),
                    "forecast": round2(forecast),
                    "predictions": predictions,
                }),
            },
            confidence: Confidence::Medium,
        }
    }
}
