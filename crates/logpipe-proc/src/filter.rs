//! Condition-based event filtering.
//!
//! Conditions are written as short strings and compiled at configure
//! time into a typed AST that is evaluated per event:
//!
//! - `exists:NAME` / `missing:NAME` — presence tests
//! - `NAME == V` / `NAME != V` — string equality
//! - `NAME < V`, `<=`, `>`, `>=` — numeric comparison
//! - `NAME =~ PATTERN` / `NAME !~ PATTERN` — regex match
//! - `NAME in [V1, V2]` / `NAME not in [V1, V2]` — membership
//!
//! Every operator except `missing` requires the field to be present;
//! a missing field fails the primitive. Conditions combine under
//! `any` or `all`, optionally negated.

use anyhow::Result;
use async_trait::async_trait;
use once_cell::sync::Lazy;
use regex::Regex;
use serde::Deserialize;

use logpipe_core::{parse_options, value_to_string, ConfigError, LogEvent, Processor};

static CONDITION: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"^(\w+)\s*(==|!=|>=|<=|>|<|=~|!~|not in|in)\s*(.*)$").expect("condition grammar")
});

#[derive(Debug, Deserialize)]
struct FilterOptions {
    #[serde(default)]
    condition: Option<String>,
    #[serde(default)]
    conditions: Vec<String>,
    #[serde(default = "default_mode")]
    mode: String,
    #[serde(default)]
    negate: bool,
}

fn default_mode() -> String {
    "any".to_string()
}

#[derive(Debug, Clone, Copy, PartialEq)]
enum CompareOp {
    Lt,
    Le,
    Gt,
    Ge,
}

/// One parsed condition primitive.
#[derive(Debug)]
enum Condition {
    Exists(String),
    Missing(String),
    Equals {
        field: String,
        value: String,
        negate: bool,
    },
    Compare {
        field: String,
        op: CompareOp,
        value: f64,
    },
    Match {
        field: String,
        pattern: Regex,
        negate: bool,
    },
    Member {
        field: String,
        values: Vec<String>,
        negate: bool,
    },
}

impl Condition {
    fn parse(condition: &str) -> Result<Self, ConfigError> {
        let condition = condition.trim();

        if let Some(field) = condition.strip_prefix("exists:") {
            return Ok(Condition::Exists(field.trim().to_string()));
        }
        if let Some(field) = condition.strip_prefix("missing:") {
            return Ok(Condition::Missing(field.trim().to_string()));
        }

        let caps = CONDITION.captures(condition).ok_or_else(|| {
            ConfigError::Invalid(format!("invalid condition format: {}", condition))
        })?;
        let field = caps[1].to_string();
        let op = &caps[2];
        let operand = caps[3].trim();

        match op {
            "in" | "not in" => {
                if !(operand.starts_with('[') && operand.ends_with(']')) {
                    return Err(ConfigError::Invalid(format!(
                        "invalid list format in condition: {}",
                        condition
                    )));
                }
                let values = operand[1..operand.len() - 1]
                    .split(',')
                    .map(|v| strip_quotes(v.trim()).to_string())
                    .collect();
                Ok(Condition::Member {
                    field,
                    values,
                    negate: op == "not in",
                })
            }
            "=~" | "!~" => {
                let pattern = Regex::new(strip_quotes(operand)).map_err(|e| {
                    ConfigError::Invalid(format!("invalid pattern in condition '{}': {}", condition, e))
                })?;
                Ok(Condition::Match {
                    field,
                    pattern,
                    negate: op == "!~",
                })
            }
            "==" | "!=" => Ok(Condition::Equals {
                field,
                value: strip_quotes(operand).to_string(),
                negate: op == "!=",
            }),
            _ => {
                let value: f64 = strip_quotes(operand).parse().map_err(|_| {
                    ConfigError::Invalid(format!(
                        "numeric operand required in condition: {}",
                        condition
                    ))
                })?;
                let op = match op {
                    "<" => CompareOp::Lt,
                    "<=" => CompareOp::Le,
                    ">" => CompareOp::Gt,
                    _ => CompareOp::Ge,
                };
                Ok(Condition::Compare { field, op, value })
            }
        }
    }

    /// Evaluate against an event's fields.
    ///
    /// Numeric comparison against a non-numeric field value is a
    /// processing error: the event is dropped and counted, matching
    /// the error policy for processor failures.
    fn evaluate(&self, event: &LogEvent) -> Result<bool> {
        Ok(match self {
            Condition::Exists(field) => event.fields.contains_key(field),
            Condition::Missing(field) => !event.fields.contains_key(field),
            Condition::Equals {
                field,
                value,
                negate,
            } => match event.fields.get(field) {
                Some(actual) => (value_to_string(actual) == *value) != *negate,
                None => false,
            },
            Condition::Compare { field, op, value } => match event.fields.get(field) {
                Some(actual) => {
                    let actual = numeric(actual).ok_or_else(|| {
                        anyhow::anyhow!("field '{}' is not numeric", field)
                    })?;
                    match op {
                        CompareOp::Lt => actual < *value,
                        CompareOp::Le => actual <= *value,
                        CompareOp::Gt => actual > *value,
                        CompareOp::Ge => actual >= *value,
                    }
                }
                None => false,
            },
            Condition::Match {
                field,
                pattern,
                negate,
            } => match event.fields.get(field) {
                Some(actual) => pattern.is_match(&value_to_string(actual)) != *negate,
                None => false,
            },
            Condition::Member {
                field,
                values,
                negate,
            } => match event.fields.get(field) {
                Some(actual) => values.contains(&value_to_string(actual)) != *negate,
                None => false,
            },
        })
    }
}

fn strip_quotes(value: &str) -> &str {
    value.trim_matches(|c| c == '"' || c == '\'')
}

fn numeric(value: &serde_json::Value) -> Option<f64> {
    match value {
        serde_json::Value::Number(n) => n.as_f64(),
        serde_json::Value::String(s) => s.trim().parse().ok(),
        _ => None,
    }
}

/// Evaluates boolean conditions against event fields.
///
/// The event passes through unchanged when the combined result is
/// truthy and is dropped otherwise.
pub struct FilterProcessor {
    name: String,
    conditions: Vec<Condition>,
    all: bool,
    negate: bool,
}

impl FilterProcessor {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            conditions: Vec::new(),
            all: false,
            negate: false,
        }
    }
}

#[async_trait]
impl Processor for FilterProcessor {
    fn name(&self) -> &str {
        &self.name
    }

    async fn configure(&mut self, options: &serde_yaml::Value) -> Result<(), ConfigError> {
        let opts: FilterOptions = parse_options("filter processor", options)?;

        let mut raw = opts.conditions;
        if let Some(single) = opts.condition {
            raw.push(single);
        }
        if raw.is_empty() {
            return Err(ConfigError::invalid(
                "filter processor: at least one condition is required",
            ));
        }

        self.conditions = raw
            .iter()
            .map(|c| Condition::parse(c))
            .collect::<Result<_, _>>()?;

        self.all = match opts.mode.as_str() {
            "any" => false,
            "all" => true,
            other => {
                return Err(ConfigError::Invalid(format!(
                    "filter processor: invalid mode: {}",
                    other
                )))
            }
        };
        self.negate = opts.negate;
        Ok(())
    }

    async fn process(&self, event: LogEvent) -> Result<Option<LogEvent>> {
        let mut results = Vec::with_capacity(self.conditions.len());
        for condition in &self.conditions {
            results.push(condition.evaluate(&event)?);
        }

        let mut passed = if self.all {
            results.iter().all(|r| *r)
        } else {
            results.iter().any(|r| *r)
        };
        if self.negate {
            passed = !passed;
        }

        Ok(passed.then_some(event))
    }

    async fn release(&self) -> Result<()> {
        Ok(())
    }
}
