use super::window::WindowAggregator;
use crate::model::{
    compare, AggregateOp, BaselineOp, CompareOp, DeviationMode, DeviceRollup, RuleDefinition,
    RuleKind,
};
use chrono::{DateTime, Duration as ChronoDuration, Utc};
use serde_json::{json, Value as JsonValue};
use std::collections::HashMap;
use uuid::Uuid;

/// Outcome of evaluating one rule against one device.
#[derive(Debug, Clone, PartialEq)]
pub enum Decision {
    /// Condition holds; forward to suppression and then the alert store.
    Fire { summary: String, details: JsonValue },
    /// Nothing to report yet (a duration gate is still running). Active alerts are left alone.
    NoFire,
    /// Condition evaluated and does not hold; any active alert should close.
    Clear,
    /// Rule could not be evaluated this cycle.
    Skip(String),
}

impl Decision {
    fn skip(reason: impl Into<String>) -> Self {
        Self::Skip(reason.into())
    }
}

/// Temporal state the evaluator keeps per tenant between cycles.
#[derive(Debug)]
pub struct EvalState {
    pub windows: WindowAggregator,
    condition_since: HashMap<(Uuid, i64), DateTime<Utc>>,
}

impl EvalState {
    pub fn new(max_window_keys: usize) -> Self {
        Self {
            windows: WindowAggregator::new(max_window_keys),
            condition_since: HashMap::new(),
        }
    }

    pub fn condition_since(&self, device_id: Uuid, rule_id: i64) -> Option<DateTime<Utc>> {
        self.condition_since.get(&(device_id, rule_id)).copied()
    }

    /// Forgets duration timers for (device, rule) pairs that no longer exist.
    pub fn retain_conditions(&mut self, mut keep: impl FnMut(Uuid, i64) -> bool) {
        self.condition_since
            .retain(|(device_id, rule_id), _| keep(*device_id, *rule_id));
    }
}

pub fn evaluate(
    rule: &RuleDefinition,
    device: &DeviceRollup,
    state: &mut EvalState,
    now: DateTime<Utc>,
) -> Decision {
    let key = (device.device_id, rule.rule_id);
    match &rule.kind {
        RuleKind::Threshold {
            metric,
            op,
            threshold,
            required_duration_seconds,
        } => {
            let Some(value) = device.metric(metric) else {
                state.condition_since.remove(&key);
                return Decision::skip(format!("metric {metric} absent"));
            };
            if !compare(value, *op, *threshold) {
                state.condition_since.remove(&key);
                return Decision::Clear;
            }
            let mut held_seconds = None;
            if let Some(required) = required_duration_seconds {
                let since = *state.condition_since.entry(key).or_insert(now);
                let held = (now - since).num_seconds();
                if held < *required {
                    return Decision::NoFire;
                }
                held_seconds = Some(held);
            }
            Decision::Fire {
                summary: comparison_summary(&rule.name, metric, value, *op, *threshold),
                details: json!({
                    "metric": metric,
                    "value": value,
                    "operator": op.symbol(),
                    "threshold": threshold,
                    "required_duration_seconds": required_duration_seconds,
                    "held_seconds": held_seconds,
                }),
            }
        }
        RuleKind::WindowAggregation {
            metric,
            aggregation,
            op,
            threshold,
            window_seconds,
        } => {
            let Some(value) = device.metric(metric) else {
                return Decision::skip(format!("metric {metric} absent"));
            };
            state
                .windows
                .append(device.device_id, rule.rule_id, now, value, *window_seconds);
            let Some(aggregate) =
                state
                    .windows
                    .aggregate(device.device_id, rule.rule_id, *aggregation)
            else {
                return Decision::skip("insufficient samples");
            };
            if !compare(aggregate, *op, *threshold) {
                return Decision::Clear;
            }
            let label = format!("{}({metric}) over {window_seconds}s", aggregate_name(*aggregation));
            Decision::Fire {
                summary: comparison_summary(&rule.name, &label, aggregate, *op, *threshold),
                details: json!({
                    "metric": metric,
                    "aggregation": aggregate_name(*aggregation),
                    "window_seconds": window_seconds,
                    "aggregate": aggregate,
                    "latest_value": value,
                    "operator": op.symbol(),
                    "threshold": threshold,
                }),
            }
        }
        RuleKind::Anomaly {
            metric,
            window_seconds,
            baseline,
            mode,
            deviation,
        } => {
            let Some(value) = device.metric(metric) else {
                return Decision::skip(format!("metric {metric} absent"));
            };
            // Baseline comes from history only; the current reading joins the window afterwards.
            let reference =
                state
                    .windows
                    .baseline(device.device_id, rule.rule_id, *baseline, now);
            state
                .windows
                .append(device.device_id, rule.rule_id, now, value, *window_seconds);
            let Some(reference) = reference else {
                return Decision::skip("insufficient samples");
            };
            let observed = match mode {
                DeviationMode::Absolute => (value - reference).abs(),
                DeviationMode::Percent => {
                    if reference == 0.0 {
                        return Decision::skip("zero baseline");
                    }
                    (value - reference).abs() / reference.abs() * 100.0
                }
            };
            if observed < *deviation {
                return Decision::Clear;
            }
            let unit = match mode {
                DeviationMode::Absolute => "",
                DeviationMode::Percent => "%",
            };
            Decision::Fire {
                summary: format!(
                    "{}: {metric} {value:.2} deviates {observed:.2}{unit} from {} baseline {reference:.2}",
                    rule.name,
                    baseline_name(*baseline),
                ),
                details: json!({
                    "metric": metric,
                    "value": value,
                    "baseline": baseline_name(*baseline),
                    "baseline_value": reference,
                    "mode": mode_name(*mode),
                    "deviation": observed,
                    "allowed_deviation": deviation,
                    "window_seconds": window_seconds,
                }),
            }
        }
        RuleKind::TelemetryGap { max_gap_seconds } => match device.last_telemetry_at {
            None => Decision::Fire {
                summary: format!("{}: no telemetry recorded", rule.name),
                details: json!({
                    "last_telemetry_at": JsonValue::Null,
                    "max_gap_seconds": max_gap_seconds,
                }),
            },
            Some(last) => {
                let gap = now - last;
                if gap <= ChronoDuration::seconds(*max_gap_seconds) {
                    return Decision::Clear;
                }
                Decision::Fire {
                    summary: format!(
                        "{}: no telemetry for {}s (limit {max_gap_seconds}s)",
                        rule.name,
                        gap.num_seconds()
                    ),
                    details: json!({
                        "last_telemetry_at": last.to_rfc3339(),
                        "gap_seconds": gap.num_seconds(),
                        "max_gap_seconds": max_gap_seconds,
                    }),
                }
            }
        },
    }
}

fn comparison_summary(name: &str, label: &str, value: f64, op: CompareOp, threshold: f64) -> String {
    format!("{name}: {label} {value:.2} {} {threshold}", op.symbol())
}

fn aggregate_name(op: AggregateOp) -> &'static str {
    match op {
        AggregateOp::Avg => "avg",
        AggregateOp::Min => "min",
        AggregateOp::Max => "max",
        AggregateOp::Count => "count",
        AggregateOp::Sum => "sum",
    }
}

fn mode_name(mode: DeviationMode) -> &'static str {
    match mode {
        DeviationMode::Absolute => "absolute",
        DeviationMode::Percent => "percent",
    }
}

fn baseline_name(op: BaselineOp) -> &'static str {
    match op {
        BaselineOp::Mean => "mean",
        BaselineOp::Median => "median",
    }
}
