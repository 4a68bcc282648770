//! Declarative input bindings and their reconciliation against a node's
//! expected input names.

use crate::error::{Error, Result};

/// Placeholder internal name that binds every expected input under a common
/// external prefix.
pub const BIND_ALL: &str = "-";

/// One edge binding an upstream output to a node-local input name.
///
/// `external_name` addresses the context tree: a leading `/` walks from the
/// root, anything else resolves relative to the parent scope. `internal_name`
/// is the key the consuming node sees.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InputBinding {
    pub external_name: String,
    pub internal_name: String,
}

impl InputBinding {
    pub fn new(external: impl Into<String>, internal: impl Into<String>) -> Self {
        Self {
            external_name: external.into(),
            internal_name: internal.into(),
        }
    }

    /// Binding with no explicit internal name; the internal name defaults to
    /// the external name until reconciliation assigns the positional one.
    pub fn from_external(external: impl Into<String>) -> Self {
        let external = external.into();
        Self {
            internal_name: external.clone(),
            external_name: external,
        }
    }

    /// Binding that adopts the node's positional input name at
    /// reconciliation time.
    pub fn positional(external: impl Into<String>) -> Self {
        Self {
            external_name: external.into(),
            internal_name: String::new(),
        }
    }
}

/// Reconcile declared bindings against the ordered input names a node
/// expects, producing the mapping that drives input resolution.
///
/// No declarations defaults to an identity mapping over `required`. A single
/// `-` placeholder expands its external name as a prefix over every required
/// name. Otherwise the lengths must match; entries without an explicit
/// internal name adopt the positional required name.
pub fn resolve_input_names(
    declared: &[InputBinding],
    required: &[String],
) -> Result<Vec<InputBinding>> {
    if declared.is_empty() {
        return Ok(required
            .iter()
            .map(|name| InputBinding::new(name.clone(), name.clone()))
            .collect());
    }

    if declared.len() == 1 && declared[0].internal_name == BIND_ALL {
        let prefix = declared[0].external_name.trim_end_matches('/');
        return Ok(required
            .iter()
            .map(|name| InputBinding::new(format!("{prefix}/{name}"), name.clone()))
            .collect());
    }

    if declared.len() != required.len() {
        return Err(Error::InputArityMismatch {
            declared: declared.len(),
            required: required.len(),
        });
    }

    Ok(declared
        .iter()
        .zip(required)
        .map(|(binding, name)| {
            if binding.internal_name.is_empty() {
                InputBinding::new(binding.external_name.clone(), name.clone())
            } else {
                binding.clone()
            }
        })
        .collect())
}
