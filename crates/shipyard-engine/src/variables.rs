//! Release variable resolution.
//!
//! For each variable declared on the deployment, the first source that
//! yields a value wins:
//!
//! 1. a [`ResourceVariable`] with the same key on the target's resource
//! 2. the highest-priority [`DeploymentVariableValue`] whose resource
//!    selector matches the resource (no selector matches every resource)
//! 3. the variable's default value
//!
//! A variable with no source is left out. Sensitive values are returned
//! and their keys listed as encrypted.

use std::collections::BTreeMap;
use std::sync::Arc;

use serde_json::Value;
use shipyard_core::{RelatableKind, ReleaseTarget, Resource, VariableValue};
use shipyard_selector::Condition;
use shipyard_state::Store;
use shipyard_targets::RelationshipIndex;
use tracing::{debug, warn};

use crate::error::{EngineError, EngineResult};

/// Variables of one release, ready to persist.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ResolvedVariables {
    pub values: BTreeMap<String, Value>,
    /// Keys whose values must only be passed on encrypted.
    pub encrypted: Vec<String>,
}

pub trait VariableManager: Send + Sync {
    /// Fails with [`EngineError::VariablesUnavailable`] when a variable
    /// has candidate sources but none of them resolves.
    fn resolve(&self, target: &ReleaseTarget) -> EngineResult<ResolvedVariables>;
}

pub struct StoreVariableManager {
    store: Arc<Store>,
    relationships: Arc<RelationshipIndex>,
}

enum Resolved {
    Plain(Value),
    Sensitive(Value),
    /// A reference that did not lead anywhere.
    Dangling(String),
}

impl StoreVariableManager {
    pub fn new(store: Arc<Store>, relationships: Arc<RelationshipIndex>) -> Self {
        Self {
            store,
            relationships,
        }
    }

    fn resolve_value(&self, resource: &Resource, value: &VariableValue) -> Resolved {
        match value {
            VariableValue::Literal { value } => Resolved::Plain(value.clone()),
            VariableValue::Sensitive { value } => Resolved::Sensitive(value.clone()),
            VariableValue::Reference { reference, path } => {
                let related =
                    self.relationships
                        .resolve_reference(reference, RelatableKind::Resource, &resource.id);
                match related.and_then(|entity| follow_path(entity, path)) {
                    Some(value) => Resolved::Plain(value),
                    None => Resolved::Dangling(format!("{reference}.{}", path.join("."))),
                }
            }
        }
    }

    /// Candidate sources of one variable, in precedence order.
    fn candidates(
        &self,
        resource: &Resource,
        variable_id: &str,
        key: &str,
        default: Option<&VariableValue>,
    ) -> Vec<VariableValue> {
        let mut candidates = Vec::new();
        if let Some(over) = self.store.resource_variable(&resource.id, key) {
            candidates.push(over.value);
        }
        for value in self.store.values_for_variable(variable_id) {
            match Condition::matches_optional(value.resource_selector.as_ref(), resource) {
                Ok(true) => candidates.push(value.value),
                Ok(false) => {}
                Err(e) => {
                    warn!(value_id = %value.id, error = %e, "variable value selector failed");
                }
            }
        }
        candidates.extend(default.cloned());
        candidates
    }
}

impl VariableManager for StoreVariableManager {
    #[tracing::instrument(name = "VariableManager.Resolve", skip_all, fields(target = %target))]
    fn resolve(&self, target: &ReleaseTarget) -> EngineResult<ResolvedVariables> {
        let resource = self.store.resources.get(&target.resource_id).ok_or_else(|| {
            EngineError::VariablesUnavailable(format!("resource {} not found", target.resource_id))
        })?;

        let mut resolved = ResolvedVariables::default();
        for variable in self.store.variables_for_deployment(&target.deployment_id) {
            let candidates = self.candidates(
                &resource,
                &variable.id,
                &variable.key,
                variable.default_value.as_ref(),
            );
            let mut dangling = Vec::new();
            let mut found = false;
            for candidate in &candidates {
                match self.resolve_value(&resource, candidate) {
                    Resolved::Plain(value) => {
                        resolved.values.insert(variable.key.clone(), value);
                        found = true;
                        break;
                    }
                    Resolved::Sensitive(value) => {
                        resolved.values.insert(variable.key.clone(), value);
                        resolved.encrypted.push(variable.key.clone());
                        found = true;
                        break;
                    }
                    Resolved::Dangling(reference) => {
                        debug!(key = %variable.key, %reference, "reference unresolved; trying next source");
                        dangling.push(reference);
                    }
                }
            }
            if !found && !dangling.is_empty() {
                return Err(EngineError::VariablesUnavailable(format!(
                    "{}: unresolved reference {}",
                    variable.key,
                    dangling.join(", ")
                )));
            }
        }
        resolved.encrypted.sort();
        Ok(resolved)
    }
}

/// Walk `path` through nested objects of `value`.
fn follow_path(value: Value, path: &[String]) -> Option<Value> {
    let mut current = value;
    for segment in path {
        current = match current {
            Value::Object(mut map) => map.remove(segment)?,
            Value::Array(mut items) => {
                let index: usize = segment.parse().ok()?;
                if index >= items.len() {
                    return None;
                }
                items.swap_remove(index)
            }
            _ => return None,
        };
    }
    Some(current)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn path_walks_objects_and_arrays() {
        let value = json!({"config": {"hosts": ["a", "b"], "port": 5432}});
        assert_eq!(
            follow_path(value.clone(), &["config".into(), "port".into()]),
            Some(json!(5432))
        );
        assert_eq!(
            follow_path(value.clone(), &["config".into(), "hosts".into(), "1".into()]),
            Some(json!("b"))
        );
        assert_eq!(follow_path(value.clone(), &["missing".into()]), None);
        assert_eq!(follow_path(value.clone(), &[]), Some(value));
    }
}
