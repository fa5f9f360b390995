use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Syscall category label produced by the classifier. Categories are defined
/// by config rules, not hardcoded; `Category::other()` is the fixed fallback.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Category(String);

impl Category {
    pub fn new(name: impl Into<String>) -> Self {
        Self(name.into())
    }

    pub fn other() -> Self {
        Self("other".to_string())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for Category {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, Eq, PartialEq)]
#[serde(rename_all = "snake_case")]
pub enum AnomalyKind {
    Frequency,
    Parameter,
}

impl std::fmt::Display for AnomalyKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let text = match self {
            AnomalyKind::Frequency => "frequency",
            AnomalyKind::Parameter => "parameter",
        };
        write!(f, "{text}")
    }
}

/// A single statistical finding. `details` carries the raw evidence (rate,
/// mean, std, z-score, or parameter name/value/z-score) for audit.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Anomaly {
    pub timestamp: DateTime<Utc>,
    pub pid: i32,
    pub kind: AnomalyKind,
    pub severity: f64,
    pub description: String,
    pub details: serde_json::Value,
}

impl Anomaly {
    pub fn new(kind: AnomalyKind, severity: f64, description: String) -> Self {
        Self {
            timestamp: Utc::now(),
            pid: 0,
            kind,
            severity: severity.clamp(0.0, 1.0),
            description,
            details: serde_json::Value::Null,
        }
    }
}

/// A syscall argument value zipped out of the raw register tuple. Register
/// values are carried as signed integers so negative sentinels (fd = -1)
/// stay negative.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum ArgValue {
    Int(i64),
    Float(f64),
    Str(String),
}

impl ArgValue {
    pub fn as_f64(&self) -> Option<f64> {
        match self {
            ArgValue::Int(v) => Some(*v as f64),
            ArgValue::Float(v) => Some(*v),
            ArgValue::Str(_) => None,
        }
    }

    pub fn as_i64(&self) -> Option<i64> {
        match self {
            ArgValue::Int(v) => Some(*v),
            ArgValue::Float(_) | ArgValue::Str(_) => None,
        }
    }
}

/// One observed syscall, fully resolved and classified. `anomalies` is filled
/// in by the most recent batch pass that covered this pid and may stay empty.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SyscallEvent {
    pub pid: i32,
    pub name: String,
    pub category: Category,
    pub timestamp: DateTime<Utc>,
    pub args: BTreeMap<String, ArgValue>,
    #[serde(default)]
    pub anomalies: Vec<Anomaly>,
}

impl SyscallEvent {
    pub fn new(pid: i32, name: String, category: Category) -> Self {
        Self {
            pid,
            name,
            category,
            timestamp: Utc::now(),
            args: BTreeMap::new(),
            anomalies: Vec::new(),
        }
    }
}
