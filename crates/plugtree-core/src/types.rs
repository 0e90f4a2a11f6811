//! Core types for Plugtree

use serde::{Deserialize, Serialize};
use std::fmt;

pub use serde_json::Value;

/// Keyword map used for keyword arguments, variables and manifest sections.
pub type Map = serde_json::Map<String, Value>;

/// Arguments for one plugin call: positional values plus keyword values.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Args {
    #[serde(default)]
    pub positional: Vec<Value>,
    #[serde(default)]
    pub keywords: Map,
}

impl Args {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_positional(values: impl IntoIterator<Item = Value>) -> Self {
        Self {
            positional: values.into_iter().collect(),
            keywords: Map::new(),
        }
    }

    /// Append a positional argument.
    pub fn arg(mut self, value: impl Into<Value>) -> Self {
        self.positional.push(value.into());
        self
    }

    /// Set a keyword argument.
    pub fn kwarg(mut self, name: impl Into<String>, value: impl Into<Value>) -> Self {
        self.keywords.insert(name.into(), value.into());
        self
    }

    pub fn len(&self) -> usize {
        self.positional.len() + self.keywords.len()
    }

    pub fn is_empty(&self) -> bool {
        self.positional.is_empty() && self.keywords.is_empty()
    }
}

/// Normalized outcome of a unit's virtual gate.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum GateResult {
    Allowed,
    Rejected(String),
    RejectedAndRenamed { reason: String, alias: String },
}

impl GateResult {
    /// Normalize the shapes a gate may return.
    ///
    /// `true`/`null` allow; `false` rejects; a string rejects with that message;
    /// `[false, msg]` rejects with `msg`; `[false, msg, alias]` rejects and records the
    /// rejection under `alias`; an array led by `true` allows.
    pub fn from_value(value: &Value) -> Self {
        match value {
            Value::Null | Value::Bool(true) => Self::Allowed,
            Value::Bool(false) => Self::Rejected("Virtual returned False".to_string()),
            Value::String(msg) => Self::Rejected(msg.clone()),
            Value::Array(items) => match items.first() {
                Some(Value::Bool(true)) => Self::Allowed,
                Some(Value::Bool(false)) => {
                    let reason = items
                        .get(1)
                        .map(value_text)
                        .unwrap_or_else(|| "Virtual returned False".to_string());
                    match items.get(2).and_then(Value::as_str) {
                        Some(alias) => Self::RejectedAndRenamed {
                            reason,
                            alias: alias.to_string(),
                        },
                        None => Self::Rejected(reason),
                    }
                }
                _ => Self::Rejected(format!("unexpected virtual result: {}", value)),
            },
            other => Self::Rejected(format!("unexpected virtual result: {}", other)),
        }
    }

    pub fn is_allowed(&self) -> bool {
        matches!(self, Self::Allowed)
    }
}

/// Render a value as plain text, without quotes for strings.
pub fn value_text(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}

/// Which source wins when merged plugin units export the same name.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MergeMode {
    #[default]
    FirstWins,
    LatestWins,
}

impl fmt::Display for MergeMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::FirstWins => write!(f, "first_wins"),
            Self::LatestWins => write!(f, "latest_wins"),
        }
    }
}
