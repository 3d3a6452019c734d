//! The condition tree and its evaluation against [`Selectable`] entities.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::cel::{CelBindings, CelExpression};
use crate::date::{parse_timestamp, truncate_to_second};
use crate::error::{SelectorError, SelectorResult};

/// Maximum nesting of comparison conditions accepted by `validate`.
const MAX_DEPTH: usize = 32;

/// String-valued columns an entity may expose.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum Column {
    Id,
    Name,
    Version,
    Kind,
    Identifier,
}

/// Timestamp fields usable in date conditions.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum DateField {
    #[serde(rename = "createdAt")]
    CreatedAt,
    #[serde(rename = "updatedAt")]
    UpdatedAt,
}

/// Operators for string columns and metadata values.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum StringOperator {
    Equals,
    StartsWith,
    EndsWith,
    Contains,
}

impl StringOperator {
    pub fn apply(self, actual: &str, expected: &str) -> bool {
        match self {
            Self::Equals => actual == expected,
            Self::StartsWith => actual.starts_with(expected),
            Self::EndsWith => actual.ends_with(expected),
            Self::Contains => actual.contains(expected),
        }
    }
}

/// Operators for date conditions. Comparison is at second granularity.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum DateOperator {
    Equals,
    Before,
    After,
    BeforeOrOn,
    AfterOrOn,
}

impl DateOperator {
    pub fn apply(self, actual: DateTime<Utc>, expected: DateTime<Utc>) -> bool {
        let actual = truncate_to_second(actual);
        let expected = truncate_to_second(expected);
        match self {
            Self::Equals => actual == expected,
            Self::Before => actual < expected,
            Self::After => actual > expected,
            Self::BeforeOrOn => actual <= expected,
            Self::AfterOrOn => actual >= expected,
        }
    }
}

/// Boolean combinators for comparison conditions.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum LogicalOperator {
    And,
    Or,
}

/// Read access to the fields a condition can reference.
///
/// Unknown columns, metadata keys and timestamps are reported as `None`
/// and treated as absent by every condition.
pub trait Selectable {
    /// Variable name under which the entity is bound in CEL programs.
    fn cel_name(&self) -> &'static str;

    fn column(&self, column: Column) -> Option<&str>;

    fn metadata(&self, key: &str) -> Option<&str>;

    fn timestamp(&self, field: DateField) -> Option<DateTime<Utc>>;

    /// JSON view of the entity handed to CEL programs.
    fn to_cel_value(&self) -> serde_json::Value;
}

/// A declarative predicate over an entity.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "kebab-case")]
pub enum Condition {
    Id {
        operator: StringOperator,
        value: String,
    },
    Name {
        operator: StringOperator,
        value: String,
    },
    Version {
        operator: StringOperator,
        value: String,
    },
    Kind {
        operator: StringOperator,
        value: String,
    },
    Identifier {
        operator: StringOperator,
        value: String,
    },
    Metadata {
        key: String,
        operator: StringOperator,
        value: String,
    },
    MetadataNull {
        key: String,
    },
    Date {
        field: DateField,
        operator: DateOperator,
        value: String,
    },
    Comparison {
        operator: LogicalOperator,
        #[serde(default)]
        not: bool,
        conditions: Vec<Condition>,
    },
    Cel {
        expression: CelExpression,
    },
}

impl Condition {
    // ── Constructors ───────────────────────────────────────────────

    /// A condition that matches every entity (an empty conjunction).
    pub fn all() -> Self {
        Self::Comparison {
            operator: LogicalOperator::And,
            not: false,
            conditions: Vec::new(),
        }
    }

    pub fn id_equals(value: impl Into<String>) -> Self {
        Self::Id {
            operator: StringOperator::Equals,
            value: value.into(),
        }
    }

    pub fn name_equals(value: impl Into<String>) -> Self {
        Self::Name {
            operator: StringOperator::Equals,
            value: value.into(),
        }
    }

    pub fn kind_equals(value: impl Into<String>) -> Self {
        Self::Kind {
            operator: StringOperator::Equals,
            value: value.into(),
        }
    }

    pub fn metadata_equals(key: impl Into<String>, value: impl Into<String>) -> Self {
        Self::Metadata {
            key: key.into(),
            operator: StringOperator::Equals,
            value: value.into(),
        }
    }

    pub fn and(conditions: Vec<Condition>) -> Self {
        Self::Comparison {
            operator: LogicalOperator::And,
            not: false,
            conditions,
        }
    }

    pub fn or(conditions: Vec<Condition>) -> Self {
        Self::Comparison {
            operator: LogicalOperator::Or,
            not: false,
            conditions,
        }
    }

    pub fn cel(expression: impl Into<String>) -> Self {
        Self::Cel {
            expression: CelExpression::new(expression),
        }
    }

    // ── Validation ─────────────────────────────────────────────────

    /// Check the static shape of the condition: dates parse, keys are
    /// non-empty, CEL compiles and nesting stays bounded.
    pub fn validate(&self) -> SelectorResult<()> {
        self.validate_at(0)
    }

    fn validate_at(&self, depth: usize) -> SelectorResult<()> {
        if depth > MAX_DEPTH {
            return Err(SelectorError::Invalid(format!(
                "conditions nested deeper than {MAX_DEPTH}"
            )));
        }
        match self {
            Self::Id { .. }
            | Self::Name { .. }
            | Self::Version { .. }
            | Self::Kind { .. }
            | Self::Identifier { .. } => Ok(()),
            Self::Metadata { key, .. } | Self::MetadataNull { key } => {
                if key.is_empty() {
                    return Err(SelectorError::Invalid("metadata key is empty".to_string()));
                }
                Ok(())
            }
            Self::Date { value, .. } => parse_timestamp(value).map(|_| ()),
            Self::Comparison { conditions, .. } => conditions
                .iter()
                .try_for_each(|c| c.validate_at(depth + 1)),
            Self::Cel { expression } => expression.validate(),
        }
    }

    // ── Evaluation ─────────────────────────────────────────────────

    /// Evaluate the condition against a single entity.
    ///
    /// Missing fields are a negative match. Errors are returned only for
    /// conditions that cannot be evaluated (unparseable date literal,
    /// CEL that fails to compile).
    pub fn matches(&self, entity: &dyn Selectable) -> SelectorResult<bool> {
        match self {
            Self::Id { operator, value } => Ok(column_matches(entity, Column::Id, *operator, value)),
            Self::Name { operator, value } => {
                Ok(column_matches(entity, Column::Name, *operator, value))
            }
            Self::Version { operator, value } => {
                Ok(column_matches(entity, Column::Version, *operator, value))
            }
            Self::Kind { operator, value } => {
                Ok(column_matches(entity, Column::Kind, *operator, value))
            }
            Self::Identifier { operator, value } => {
                Ok(column_matches(entity, Column::Identifier, *operator, value))
            }
            Self::Metadata {
                key,
                operator,
                value,
            } => Ok(entity
                .metadata(key)
                .is_some_and(|actual| operator.apply(actual, value))),
            Self::MetadataNull { key } => Ok(entity.metadata(key).is_none()),
            Self::Date {
                field,
                operator,
                value,
            } => {
                let expected = parse_timestamp(value)?;
                Ok(entity
                    .timestamp(*field)
                    .is_some_and(|actual| operator.apply(actual, expected)))
            }
            Self::Comparison {
                operator,
                not,
                conditions,
            } => {
                let result = match operator {
                    LogicalOperator::And => {
                        let mut all = true;
                        for c in conditions {
                            if !c.matches(entity)? {
                                all = false;
                                break;
                            }
                        }
                        all
                    }
                    LogicalOperator::Or => {
                        let mut any = false;
                        for c in conditions {
                            if c.matches(entity)? {
                                any = true;
                                break;
                            }
                        }
                        any
                    }
                };
                Ok(result != *not)
            }
            Self::Cel { expression } => {
                let bindings =
                    CelBindings::new().bind(entity.cel_name(), entity.to_cel_value());
                expression.evaluate(&bindings)
            }
        }
    }

    /// Evaluate an optional selector where `None` means "match everything".
    pub fn matches_optional(
        selector: Option<&Condition>,
        entity: &dyn Selectable,
    ) -> SelectorResult<bool> {
        match selector {
            Some(condition) => condition.matches(entity),
            None => Ok(true),
        }
    }
}

fn column_matches(
    entity: &dyn Selectable,
    column: Column,
    operator: StringOperator,
    expected: &str,
) -> bool {
    entity
        .column(column)
        .is_some_and(|actual| operator.apply(actual, expected))
}
