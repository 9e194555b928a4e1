//! Declarative field filter loaded from JSON.
//!
//! ```json
//! {
//!   "include": ["id", "email", "status"],
//!   "rename": { "email": "contactEmail" },
//!   "required": ["id"],
//!   "onMissingRequired": "drop",
//!   "match": [{ "field": "status", "equals": "active" }]
//! }
//! ```

use std::collections::BTreeMap;

use regex::Regex;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use super::{FilterError, Record, RecordTransform, TransformError};

/// What happens to a record missing a required field.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum MissingFieldPolicy {
    #[default]
    Drop,
    Fail,
}

/// One record gate. Exactly one of `equals` / `regex` should be set.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct MatchRule {
    pub field: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub equals: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub regex: Option<String>,
}

/// Raw filter definition.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct FieldFilterConfig {
    /// When non-empty, only these fields are kept.
    #[serde(default)]
    pub include: Vec<String>,
    #[serde(default)]
    pub exclude: Vec<String>,
    /// Old name to new name, applied last.
    #[serde(default)]
    pub rename: BTreeMap<String, String>,
    #[serde(default)]
    pub required: Vec<String>,
    #[serde(default)]
    pub on_missing_required: MissingFieldPolicy,
    /// All rules must match for a record to pass the gate.
    #[serde(default, rename = "match")]
    pub match_rules: Vec<MatchRule>,
}

enum Condition {
    Equals(String),
    Regex(Regex),
    Present,
}

/// Compiled [`FieldFilterConfig`].
pub struct FieldFilter {
    config: FieldFilterConfig,
    conditions: Vec<(String, Condition)>,
}

impl FieldFilter {
    pub fn new(config: FieldFilterConfig) -> Result<Self, FilterError> {
        let conditions = config
            .match_rules
            .iter()
            .map(|rule| {
                let condition = match (&rule.equals, &rule.regex) {
                    (Some(value), _) => Condition::Equals(value.clone()),
                    (None, Some(pattern)) => {
                        Condition::Regex(Regex::new(pattern).map_err(|source| {
                            FilterError::InvalidRegex {
                                field: rule.field.clone(),
                                source,
                            }
                        })?)
                    }
                    (None, None) => Condition::Present,
                };
                Ok((rule.field.clone(), condition))
            })
            .collect::<Result<Vec<_>, FilterError>>()?;

        Ok(Self { config, conditions })
    }

    pub fn from_json(json: &str) -> Result<Self, FilterError> {
        Self::new(serde_json::from_str(json)?)
    }

    pub fn config(&self) -> &FieldFilterConfig {
        &self.config
    }
}

fn field_text(record: &Record, field: &str) -> Option<String> {
    match record.get(field)? {
        Value::Null => None,
        Value::String(s) => Some(s.clone()),
        other => Some(other.to_string()),
    }
}

impl RecordTransform for FieldFilter {
    fn filter(&self, record: &Record) -> bool {
        self.conditions.iter().all(|(field, condition)| {
            let Some(value) = field_text(record, field) else {
                return false;
            };
            match condition {
                Condition::Equals(expected) => &value == expected,
                Condition::Regex(re) => re.is_match(&value),
                Condition::Present => true,
            }
        })
    }

    fn transform(&self, mut record: Record) -> Result<Option<Record>, TransformError> {
        for field in &self.config.required {
            let present = field_text(&record, field).is_some_and(|v| !v.trim().is_empty());
            if !present {
                return match self.config.on_missing_required {
                    MissingFieldPolicy::Drop => Ok(None),
                    MissingFieldPolicy::Fail => Err(TransformError::MissingRequiredField {
                        field: field.clone(),
                    }),
                };
            }
        }

        if !self.config.include.is_empty() {
            record.retain(|key, _| self.config.include.iter().any(|f| f == key));
        }
        for field in &self.config.exclude {
            record.remove(field);
        }
        for (from, to) in &self.config.rename {
            if let Some(value) = record.remove(from) {
                record.insert(to.clone(), value);
            }
        }

        if record.is_empty() {
            return Ok(None);
        }
        Ok(Some(record))
    }
}
