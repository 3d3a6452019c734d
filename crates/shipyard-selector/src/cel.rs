//! CEL expressions with lazily compiled, shared programs.
//!
//! An expression is compiled at most once; the compiled program (or the
//! compile error) is cached inside the [`CelExpression`]. Evaluation binds
//! named JSON values (`resource`, `deployment`, `from`, `to`, ...) and
//! coerces the result to a boolean: a non-boolean result or a runtime
//! type error is a negative match.

use std::fmt;
use std::sync::{Arc, OnceLock};

use cel_interpreter::{Context, Program, Value};
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::error::{SelectorError, SelectorResult};

/// A CEL source string plus its cached compiled program.
#[derive(Clone, Serialize, Deserialize)]
#[serde(from = "String", into = "String")]
pub struct CelExpression {
    source: String,
    program: OnceLock<Result<Arc<Program>, String>>,
}

impl CelExpression {
    pub fn new(source: impl Into<String>) -> Self {
        Self {
            source: source.into(),
            program: OnceLock::new(),
        }
    }

    /// The expression text as written.
    pub fn source(&self) -> &str {
        &self.source
    }

    /// Compile (once) and return the shared program.
    pub fn compile(&self) -> SelectorResult<Arc<Program>> {
        let compiled = self.program.get_or_init(|| {
            Program::compile(&self.source)
                .map(Arc::new)
                .map_err(|e| e.to_string())
        });
        compiled.clone().map_err(|reason| SelectorError::InvalidCel {
            expression: self.source.clone(),
            reason,
        })
    }

    /// Check that the expression compiles.
    pub fn validate(&self) -> SelectorResult<()> {
        if self.source.trim().is_empty() {
            return Err(SelectorError::InvalidCel {
                expression: self.source.clone(),
                reason: "expression is empty".to_string(),
            });
        }
        self.compile().map(|_| ())
    }

    /// Evaluate against the given bindings.
    ///
    /// Only a compile failure is an error; every runtime failure yields
    /// `Ok(false)`.
    pub fn evaluate(&self, bindings: &CelBindings) -> SelectorResult<bool> {
        let program = self.compile()?;

        let mut context = Context::default();
        for (name, value) in &bindings.vars {
            if let Err(e) = context.add_variable(name.clone(), value) {
                debug!(expression = %self.source, variable = %name, error = %e, "cel binding failed");
                return Ok(false);
            }
        }

        match program.execute(&context) {
            Ok(Value::Bool(result)) => Ok(result),
            Ok(other) => {
                debug!(expression = %self.source, result = ?other, "cel result is not a boolean");
                Ok(false)
            }
            Err(e) => {
                debug!(expression = %self.source, error = %e, "cel evaluation failed");
                Ok(false)
            }
        }
    }
}

impl From<String> for CelExpression {
    fn from(source: String) -> Self {
        Self::new(source)
    }
}

impl From<&str> for CelExpression {
    fn from(source: &str) -> Self {
        Self::new(source)
    }
}

impl From<CelExpression> for String {
    fn from(expr: CelExpression) -> Self {
        expr.source
    }
}

impl PartialEq for CelExpression {
    fn eq(&self, other: &Self) -> bool {
        self.source == other.source
    }
}

impl fmt::Debug for CelExpression {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("CelExpression").field(&self.source).finish()
    }
}

/// Named variables made visible to a CEL program.
#[derive(Debug, Clone, Default)]
pub struct CelBindings {
    vars: Vec<(String, serde_json::Value)>,
}

impl CelBindings {
    pub fn new() -> Self {
        Self::default()
    }

    /// Bind `name` to `value`, replacing an earlier binding of the same name.
    pub fn bind(mut self, name: impl Into<String>, value: serde_json::Value) -> Self {
        self.insert(name, value);
        self
    }

    pub fn insert(&mut self, name: impl Into<String>, value: serde_json::Value) {
        let name = name.into();
        match self.vars.iter_mut().find(|(n, _)| *n == name) {
            Some(slot) => slot.1 = value,
            None => self.vars.push((name, value)),
        }
    }

    pub fn get(&self, name: &str) -> Option<&serde_json::Value> {
        self.vars.iter().find(|(n, _)| n == name).map(|(_, v)| v)
    }
}
