//! Wake policy: named rule documents evaluated against UPS telemetry.
//!
//! The orchestrator only sees [`PolicyEngine`]. The bundled engine,
//! [`RuleBook`], reads YAML documents from a rules directory:
//!
//! ```yaml
//! description: back on mains with a charged battery
//! when:
//!   all:
//!     - variable: ups.status
//!       op: contains
//!       value: OL
//!     - variable: battery.charge
//!       op: gte
//!       value: 80
//! ```
//!
//! A comparison holds when any UPS of the source (or only the one named by
//! `ups:`) carries the variable and it satisfies the operator. Missing
//! variables never match.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::path::{Component, Path, PathBuf};
use thiserror::Error;
use tokio::fs;
use tracing::debug;

#[derive(Debug, Error)]
pub enum PolicyError {
    #[error("rule {rule:?} not found at {}", path.display())]
    NotFound { rule: String, path: PathBuf },

    #[error("rule {rule:?}: cannot read {}: {source}", path.display())]
    Io {
        rule: String,
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("rule {rule:?}: cannot parse: {source}")]
    Parse {
        rule: String,
        #[source]
        source: serde_yaml::Error,
    },

    #[error("rule {rule:?} is invalid: {reason}")]
    Invalid { rule: String, reason: String },

    #[error("rule {rule:?}: telemetry is not valid JSON: {source}")]
    Telemetry {
        rule: String,
        #[source]
        source: serde_json::Error,
    },
}

/// Narrow capability the evaluator needs from a rule language.
#[async_trait]
pub trait PolicyEngine: Send + Sync {
    async fn validate(&self, rule: &str) -> Result<(), PolicyError>;
    async fn evaluate(&self, telemetry: &str, rule: &str) -> Result<bool, PolicyError>;
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RuleDocument {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    pub when: Condition,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum Condition {
    Compare(Comparison),
    All { all: Vec<Condition> },
    Any { any: Vec<Condition> },
    Not { not: Box<Condition> },
    Always { always: bool },
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Comparison {
    pub variable: String,
    pub op: CompareOp,
    pub value: Value,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ups: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CompareOp {
    Eq,
    Ne,
    Gt,
    Gte,
    Lt,
    Lte,
    Contains,
}

impl RuleDocument {
    pub fn check(&self) -> Result<(), String> {
        self.when.check()
    }

    pub fn evaluate(&self, telemetry: &Value) -> bool {
        self.when.evaluate(telemetry)
    }
}

impl Condition {
    fn check(&self) -> Result<(), String> {
        match self {
            Condition::Always { .. } => Ok(()),
            Condition::Not { not } => not.check(),
            Condition::All { all: list } | Condition::Any { any: list } => {
                if list.is_empty() {
                    return Err("all/any needs at least one condition".into());
                }
                list.iter().try_for_each(Condition::check)
            }
            Condition::Compare(c) => c.check(),
        }
    }

    fn evaluate(&self, telemetry: &Value) -> bool {
        match self {
            Condition::Always { always } => *always,
            Condition::Not { not } => !not.evaluate(telemetry),
            Condition::All { all } => all.iter().all(|c| c.evaluate(telemetry)),
            Condition::Any { any } => any.iter().any(|c| c.evaluate(telemetry)),
            Condition::Compare(c) => c.evaluate(telemetry),
        }
    }
}

impl Comparison {
    fn check(&self) -> Result<(), String> {
        if self.variable.trim().is_empty() {
            return Err("comparison without a variable".into());
        }
        match self.op {
            CompareOp::Gt | CompareOp::Gte | CompareOp::Lt | CompareOp::Lte
                if number(&self.value).is_none() =>
            {
                Err(format!("{:?} on {} needs a numeric value", self.op, self.variable))
            }
            CompareOp::Contains if !self.value.is_string() => {
                Err(format!("contains on {} needs a string value", self.variable))
            }
            _ => Ok(()),
        }
    }

    fn evaluate(&self, telemetry: &Value) -> bool {
        let Some(units) = telemetry.get("ups").and_then(Value::as_array) else {
            return false;
        };
        units
            .iter()
            .filter(|u| match &self.ups {
                Some(name) => u.get("name").and_then(Value::as_str) == Some(name.as_str()),
                None => true,
            })
            .filter_map(|u| u.get("variables").and_then(|v| v.get(&self.variable)))
            .any(|actual| self.holds(actual))
    }

    fn holds(&self, actual: &Value) -> bool {
        let ordered = |f: fn(f64, f64) -> bool| match (number(actual), number(&self.value)) {
            (Some(a), Some(b)) => f(a, b),
            _ => false,
        };
        match self.op {
            CompareOp::Eq => loosely_equal(actual, &self.value),
            CompareOp::Ne => !loosely_equal(actual, &self.value),
            CompareOp::Gt => ordered(|a, b| a > b),
            CompareOp::Gte => ordered(|a, b| a >= b),
            CompareOp::Lt => ordered(|a, b| a < b),
            CompareOp::Lte => ordered(|a, b| a <= b),
            CompareOp::Contains => match (actual.as_str(), self.value.as_str()) {
                (Some(hay), Some(needle)) => hay.contains(needle),
                _ => false,
            },
        }
    }
}

fn number(v: &Value) -> Option<f64> {
    match v {
        Value::Number(n) => n.as_f64(),
        Value::String(s) => s.trim().parse().ok(),
        _ => None,
    }
}

fn text(v: &Value) -> String {
    match v {
        Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}

fn loosely_equal(a: &Value, b: &Value) -> bool {
    match (number(a), number(b)) {
        (Some(x), Some(y)) => x == y,
        _ => text(a) == text(b),
    }
}

/// Rule documents stored as `<dir>/<name>.yaml` (or `.yml`).
#[derive(Debug, Clone)]
pub struct RuleBook {
    dir: PathBuf,
}

impl RuleBook {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    async fn resolve(&self, rule: &str) -> Result<PathBuf, PolicyError> {
        let rel = Path::new(rule);
        let safe = !rule.trim().is_empty()
            && rel.components().all(|c| matches!(c, Component::Normal(_)));
        if !safe {
            return Err(PolicyError::Invalid {
                rule: rule.to_string(),
                reason: "rule names must be relative paths inside the rules directory".into(),
            });
        }

        if matches!(rel.extension().and_then(|e| e.to_str()), Some("yaml" | "yml")) {
            return Ok(self.dir.join(rel));
        }
        for ext in ["yaml", "yml"] {
            let candidate = self.dir.join(format!("{rule}.{ext}"));
            if fs::try_exists(&candidate).await.unwrap_or(false) {
                return Ok(candidate);
            }
        }
        Ok(self.dir.join(format!("{rule}.yaml")))
    }

    pub async fn load(&self, rule: &str) -> Result<RuleDocument, PolicyError> {
        let path = self.resolve(rule).await?;
        let txt = match fs::read_to_string(&path).await {
            Ok(t) => t,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                return Err(PolicyError::NotFound { rule: rule.to_string(), path });
            }
            Err(source) => {
                return Err(PolicyError::Io { rule: rule.to_string(), path, source });
            }
        };
        let doc: RuleDocument = serde_yaml::from_str(&txt).map_err(|source| PolicyError::Parse {
            rule: rule.to_string(),
            source,
        })?;
        doc.check().map_err(|reason| PolicyError::Invalid {
            rule: rule.to_string(),
            reason,
        })?;
        Ok(doc)
    }
}

#[async_trait]
impl PolicyEngine for RuleBook {
    async fn validate(&self, rule: &str) -> Result<(), PolicyError> {
        self.load(rule).await.map(|_| ())
    }

    async fn evaluate(&self, telemetry: &str, rule: &str) -> Result<bool, PolicyError> {
        let doc = self.load(rule).await?;
        let value: Value = serde_json::from_str(telemetry).map_err(|source| PolicyError::Telemetry {
            rule: rule.to_string(),
            source,
        })?;
        let verdict = doc.evaluate(&value);
        debug!(rule, verdict, "rule evaluated");
        Ok(verdict)
    }
}
