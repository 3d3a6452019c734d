//! shipyard-selector: declarative predicates over entity fields.
//!
//! A [`Condition`] is a JSON-serializable tree of field comparisons
//! (`id`, `name`, `version`, `kind`, `identifier`, `metadata[key]`,
//! `createdAt`/`updatedAt`), boolean combinators and embedded CEL
//! programs. Entities expose their fields through the [`Selectable`]
//! trait, so the language stays independent of the data model.
//!
//! Two error channels are kept apart: [`Condition::validate`] reports a
//! malformed condition, while [`Condition::matches`] only fails when the
//! condition itself cannot be evaluated. Absent data is a negative match,
//! never an error.

pub mod cel;
pub mod condition;
pub mod date;
pub mod error;

pub use cel::{CelBindings, CelExpression};
pub use condition::{
    Column, Condition, DateField, DateOperator, LogicalOperator, Selectable, StringOperator,
};
pub use error::{SelectorError, SelectorResult};
