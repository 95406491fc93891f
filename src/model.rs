use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;
use sqlx::types::Json as SqlJson;
use sqlx::FromRow;
use std::collections::HashMap;
use uuid::Uuid;

pub const MIN_WINDOW_SECONDS: i64 = 60;
pub const MAX_WINDOW_SECONDS: i64 = 3600;
pub const MIN_SEVERITY: i16 = 1;
pub const MAX_SEVERITY: i16 = 5;

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum CompareOp {
    Lt,
    Lte,
    Gt,
    Gte,
    Eq,
    Neq,
}

impl CompareOp {
    pub fn parse(raw: &str) -> Option<Self> {
        match raw.trim().to_ascii_lowercase().as_str() {
            "lt" | "<" => Some(Self::Lt),
            "lte" | "<=" => Some(Self::Lte),
            "gt" | ">" => Some(Self::Gt),
            "gte" | ">=" => Some(Self::Gte),
            "eq" | "==" | "=" => Some(Self::Eq),
            "neq" | "!=" => Some(Self::Neq),
            _ => None,
        }
    }

    pub fn symbol(self) -> &'static str {
        match self {
            Self::Lt => "<",
            Self::Lte => "<=",
            Self::Gt => ">",
            Self::Gte => ">=",
            Self::Eq => "==",
            Self::Neq => "!=",
        }
    }
}

pub fn compare(value: f64, op: CompareOp, threshold: f64) -> bool {
    match op {
        CompareOp::Lt => value < threshold,
        CompareOp::Lte => value <= threshold,
        CompareOp::Gt => value > threshold,
        CompareOp::Gte => value >= threshold,
        CompareOp::Eq => (value - threshold).abs() <= f64::EPSILON,
        CompareOp::Neq => (value - threshold).abs() > f64::EPSILON,
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum AggregateOp {
    Avg,
    Min,
    Max,
    Count,
    Sum,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "snake_case")]
pub enum BaselineOp {
    #[default]
    Mean,
    Median,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "snake_case")]
pub enum DeviationMode {
    #[default]
    Absolute,
    Percent,
}

/// Which devices a rule applies to. Every populated filter must match.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct RuleScope {
    #[serde(default)]
    pub site_ids: Vec<Uuid>,
    #[serde(default)]
    pub group_ids: Vec<i64>,
    #[serde(default)]
    pub single_device_group_id: Option<i64>,
}

impl RuleScope {
    pub fn is_unscoped(&self) -> bool {
        self.site_ids.is_empty() && self.group_ids.is_empty() && self.single_device_group_id.is_none()
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum RuleKind {
    Threshold {
        metric: String,
        op: CompareOp,
        threshold: f64,
        required_duration_seconds: Option<i64>,
    },
    WindowAggregation {
        metric: String,
        aggregation: AggregateOp,
        op: CompareOp,
        threshold: f64,
        window_seconds: i64,
    },
    Anomaly {
        metric: String,
        window_seconds: i64,
        baseline: BaselineOp,
        mode: DeviationMode,
        deviation: f64,
    },
    TelemetryGap {
        max_gap_seconds: i64,
    },
}

impl RuleKind {
    pub fn alert_kind(&self) -> AlertKind {
        match self {
            Self::Threshold { .. } => AlertKind::Threshold,
            Self::WindowAggregation { .. } => AlertKind::WindowAggregation,
            Self::Anomaly { .. } => AlertKind::Anomaly,
            Self::TelemetryGap { .. } => AlertKind::TelemetryGap,
        }
    }

    pub fn metric(&self) -> Option<&str> {
        match self {
            Self::Threshold { metric, .. }
            | Self::WindowAggregation { metric, .. }
            | Self::Anomaly { metric, .. } => Some(metric.as_str()),
            Self::TelemetryGap { .. } => None,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct RuleDefinition {
    pub rule_id: i64,
    pub tenant_id: Uuid,
    pub name: String,
    pub severity: i16,
    pub scope: RuleScope,
    pub kind: RuleKind,
}

#[derive(Debug, thiserror::Error, PartialEq)]
pub enum RuleConfigError {
    #[error("unknown rule kind '{0}'")]
    UnknownKind(String),
    #[error("{kind} rule requires {field}")]
    MissingField {
        kind: &'static str,
        field: &'static str,
    },
    #[error("invalid {kind} params: {message}")]
    InvalidParams { kind: &'static str, message: String },
    #[error("unknown comparison operator '{0}'")]
    UnknownOperator(String),
    #[error("window_seconds {0} outside 60..=3600")]
    WindowOutOfRange(i64),
    #[error("severity {0} outside 1..=5")]
    SeverityOutOfRange(i16),
    #[error("{0} must be finite")]
    NonFinite(&'static str),
    #[error("{field} must be >= {min}, got {value}")]
    TooSmall {
        field: &'static str,
        min: i64,
        value: i64,
    },
}

/// Raw rule row as stored by the registry; kind-specific settings live in `params`.
#[derive(Debug, Clone, FromRow)]
pub struct RuleRecord {
    pub rule_id: i64,
    pub tenant_id: Uuid,
    pub name: String,
    pub kind: String,
    pub metric_name: Option<String>,
    pub comparison_operator: Option<String>,
    pub threshold: Option<f64>,
    pub severity: i16,
    pub site_ids: Vec<Uuid>,
    pub group_ids: Vec<i64>,
    pub single_device_group_id: Option<i64>,
    pub params: SqlJson<JsonValue>,
}

#[derive(Debug, Default, Deserialize)]
struct ThresholdParams {
    #[serde(default)]
    required_duration_seconds: Option<i64>,
}

#[derive(Debug, Deserialize)]
struct WindowParams {
    aggregation: AggregateOp,
    #[serde(default)]
    window_seconds: Option<i64>,
}

#[derive(Debug, Deserialize)]
struct AnomalyParams {
    #[serde(default)]
    window_seconds: Option<i64>,
    #[serde(default)]
    baseline: BaselineOp,
    #[serde(default)]
    mode: DeviationMode,
    #[serde(default)]
    deviation: Option<f64>,
}

#[derive(Debug, Deserialize)]
struct GapParams {
    #[serde(default)]
    max_gap_seconds: Option<i64>,
}

impl RuleRecord {
    pub fn parse(&self) -> Result<RuleDefinition, RuleConfigError> {
        if !(MIN_SEVERITY..=MAX_SEVERITY).contains(&self.severity) {
            return Err(RuleConfigError::SeverityOutOfRange(self.severity));
        }

        let kind = match self.kind.trim().to_ascii_lowercase().as_str() {
            "threshold" => {
                let params: ThresholdParams = self.params_as("threshold")?;
                if let Some(value) = params.required_duration_seconds {
                    check_min("required_duration_seconds", value, 0)?;
                }
                RuleKind::Threshold {
                    metric: self.require_metric("threshold")?,
                    op: self.require_operator("threshold")?,
                    threshold: self.require_threshold("threshold")?,
                    required_duration_seconds: params
                        .required_duration_seconds
                        .filter(|value| *value > 0),
                }
            }
            "window_aggregation" => {
                let params: WindowParams = self.params_as("window_aggregation")?;
                let window_seconds = params.window_seconds.ok_or(RuleConfigError::MissingField {
                    kind: "window_aggregation",
                    field: "window_seconds",
                })?;
                check_window(window_seconds)?;
                RuleKind::WindowAggregation {
                    metric: self.require_metric("window_aggregation")?,
                    aggregation: params.aggregation,
                    op: self.require_operator("window_aggregation")?,
                    threshold: self.require_threshold("window_aggregation")?,
                    window_seconds,
                }
            }
            "anomaly" => {
                let params: AnomalyParams = self.params_as("anomaly")?;
                let window_seconds = params.window_seconds.ok_or(RuleConfigError::MissingField {
                    kind: "anomaly",
                    field: "window_seconds",
                })?;
                check_window(window_seconds)?;
                // The column threshold doubles as the deviation when params omit it.
                let deviation = params
                    .deviation
                    .or(self.threshold)
                    .ok_or(RuleConfigError::MissingField {
                        kind: "anomaly",
                        field: "deviation",
                    })?;
                if !deviation.is_finite() {
                    return Err(RuleConfigError::NonFinite("deviation"));
                }
                if deviation < 0.0 {
                    return Err(RuleConfigError::InvalidParams {
                        kind: "anomaly",
                        message: "deviation must be >= 0".to_string(),
                    });
                }
                RuleKind::Anomaly {
                    metric: self.require_metric("anomaly")?,
                    window_seconds,
                    baseline: params.baseline,
                    mode: params.mode,
                    deviation,
                }
            }
            "telemetry_gap" => {
                let params: GapParams = self.params_as("telemetry_gap")?;
                let max_gap_seconds = params
                    .max_gap_seconds
                    .or_else(|| self.threshold.map(|value| value.round() as i64))
                    .ok_or(RuleConfigError::MissingField {
                        kind: "telemetry_gap",
                        field: "max_gap_seconds",
                    })?;
                check_min("max_gap_seconds", max_gap_seconds, 1)?;
                RuleKind::TelemetryGap { max_gap_seconds }
            }
            other => return Err(RuleConfigError::UnknownKind(other.to_string())),
        };

        Ok(RuleDefinition {
            rule_id: self.rule_id,
            tenant_id: self.tenant_id,
            name: self.name.clone(),
            severity: self.severity,
            scope: RuleScope {
                site_ids: self.site_ids.clone(),
                group_ids: self.group_ids.clone(),
                single_device_group_id: self.single_device_group_id,
            },
            kind,
        })
    }

    fn params_as<T>(&self, kind: &'static str) -> Result<T, RuleConfigError>
    where
        T: for<'de> Deserialize<'de>,
    {
        let raw = if self.params.0.is_null() {
            JsonValue::Object(Default::default())
        } else {
            self.params.0.clone()
        };
        serde_json::from_value(raw).map_err(|err| RuleConfigError::InvalidParams {
            kind,
            message: err.to_string(),
        })
    }

    fn require_metric(&self, kind: &'static str) -> Result<String, RuleConfigError> {
        self.metric_name
            .as_deref()
            .map(str::trim)
            .filter(|value| !value.is_empty())
            .map(ToOwned::to_owned)
            .ok_or(RuleConfigError::MissingField {
                kind,
                field: "metric_name",
            })
    }

    fn require_operator(&self, kind: &'static str) -> Result<CompareOp, RuleConfigError> {
        let raw = self
            .comparison_operator
            .as_deref()
            .ok_or(RuleConfigError::MissingField {
                kind,
                field: "comparison_operator",
            })?;
        CompareOp::parse(raw).ok_or_else(|| RuleConfigError::UnknownOperator(raw.to_string()))
    }

    fn require_threshold(&self, kind: &'static str) -> Result<f64, RuleConfigError> {
        let value = self.threshold.ok_or(RuleConfigError::MissingField {
            kind,
            field: "threshold",
        })?;
        if !value.is_finite() {
            return Err(RuleConfigError::NonFinite("threshold"));
        }
        Ok(value)
    }
}

fn check_window(window_seconds: i64) -> Result<(), RuleConfigError> {
    if (MIN_WINDOW_SECONDS..=MAX_WINDOW_SECONDS).contains(&window_seconds) {
        Ok(())
    } else {
        Err(RuleConfigError::WindowOutOfRange(window_seconds))
    }
}

fn check_min(field: &'static str, value: i64, min: i64) -> Result<(), RuleConfigError> {
    if value < min {
        return Err(RuleConfigError::TooSmall { field, min, value });
    }
    Ok(())
}

#[derive(Debug, Clone, PartialEq)]
pub struct DeviceRollup {
    pub device_id: Uuid,
    pub site_id: Option<Uuid>,
    pub device_type: Option<String>,
    pub registry_status: Option<String>,
    pub last_heartbeat_at: Option<DateTime<Utc>>,
    pub last_telemetry_at: Option<DateTime<Utc>>,
    pub metrics: HashMap<String, f64>,
}

impl DeviceRollup {
    pub fn last_seen_at(&self) -> Option<DateTime<Utc>> {
        match (self.last_heartbeat_at, self.last_telemetry_at) {
            (Some(heartbeat), Some(telemetry)) => Some(heartbeat.max(telemetry)),
            (heartbeat, telemetry) => heartbeat.or(telemetry),
        }
    }

    pub fn metric(&self, name: &str) -> Option<f64> {
        self.metrics.get(name).copied().filter(|value| value.is_finite())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AlertKind {
    Threshold,
    WindowAggregation,
    Anomaly,
    TelemetryGap,
    NoHeartbeat,
}

impl AlertKind {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Threshold => "threshold",
            Self::WindowAggregation => "window_aggregation",
            Self::Anomaly => "anomaly",
            Self::TelemetryGap => "telemetry_gap",
            Self::NoHeartbeat => "no_heartbeat",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AlertStatus {
    Open,
    Acknowledged,
    Closed,
}

impl AlertStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Open => "open",
            Self::Acknowledged => "acknowledged",
            Self::Closed => "closed",
        }
    }

    pub fn is_active(self) -> bool {
        matches!(self, Self::Open | Self::Acknowledged)
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct AlertRecord {
    pub id: i64,
    pub tenant_id: Uuid,
    pub device_id: Uuid,
    pub rule_id: Option<i64>,
    pub fingerprint: String,
    pub kind: AlertKind,
    pub status: AlertStatus,
    pub severity: i16,
    pub summary: String,
    pub details: JsonValue,
    pub trigger_count: i64,
    pub last_triggered_at: DateTime<Utc>,
    pub created_at: DateTime<Utc>,
    pub closed_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum DeviceStatus {
    Unknown,
    Online,
    Stale,
}

impl DeviceStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Unknown => "unknown",
            Self::Online => "online",
            Self::Stale => "stale",
        }
    }

    /// Maps the registry's stored status; anything unrecognized counts as no prior record.
    pub fn from_registry(raw: Option<&str>) -> Self {
        match raw.map(|value| value.trim().to_ascii_lowercase()).as_deref() {
            Some("online") => Self::Online,
            Some("stale") | Some("offline") => Self::Stale,
            _ => Self::Unknown,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConnectionEventKind {
    FirstSeen,
    Connected,
    Disconnected,
}

impl ConnectionEventKind {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::FirstSeen => "first_seen",
            Self::Connected => "connected",
            Self::Disconnected => "disconnected",
        }
    }
}
