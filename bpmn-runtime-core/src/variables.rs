//! Hierarchical variable frames, one per scope-owning execution.
//!
//! Lookups walk a scope chain (nearest scope first); the first frame that
//! declares the name wins. Writes go to the nearest frame that already
//! declares the name, otherwise to the nearest frame.

use regex::Regex;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::sync::LazyLock;

use crate::error::{EngineError, EngineResult};
use crate::types::{ExecutionId, Variables};

static VARIABLE_NAME_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^[A-Za-z_][A-Za-z0-9_]*$").unwrap());

/// Reject names that are not identifier-like.
pub fn validate_variable_name(name: &str) -> EngineResult<()> {
    if VARIABLE_NAME_RE.is_match(name) {
        Ok(())
    } else {
        Err(EngineError::InvalidVariableName(name.to_string()))
    }
}

/// Validate every key of a payload before any of it is written.
pub fn validate_variables(vars: &Variables) -> EngineResult<()> {
    vars.keys().try_for_each(|k| validate_variable_name(k))
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum VariableType {
    Null,
    Boolean,
    Number,
    String,
    Array,
    Object,
}

impl VariableType {
    pub fn of(value: &serde_json::Value) -> Self {
        match value {
            serde_json::Value::Null => VariableType::Null,
            serde_json::Value::Bool(_) => VariableType::Boolean,
            serde_json::Value::Number(_) => VariableType::Number,
            serde_json::Value::String(_) => VariableType::String,
            serde_json::Value::Array(_) => VariableType::Array,
            serde_json::Value::Object(_) => VariableType::Object,
        }
    }
}

/// Flat row view of one variable, as a relational store would persist it.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct VariableRow {
    pub owner: ExecutionId,
    pub name: String,
    pub value_type: VariableType,
    pub value: serde_json::Value,
}

#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct VariableScopes {
    frames: BTreeMap<ExecutionId, Variables>,
}

impl VariableScopes {
    pub fn create_frame(&mut self, owner: ExecutionId) {
        self.frames.entry(owner).or_default();
    }

    pub fn drop_frame(&mut self, owner: ExecutionId) -> Option<Variables> {
        self.frames.remove(&owner)
    }

    pub fn has_frame(&self, owner: ExecutionId) -> bool {
        self.frames.contains_key(&owner)
    }

    pub fn frame(&self, owner: ExecutionId) -> Option<&Variables> {
        self.frames.get(&owner)
    }

    /// Nearest-scope-wins lookup along `chain`.
    pub fn get(&self, chain: &[ExecutionId], name: &str) -> Option<&serde_json::Value> {
        chain
            .iter()
            .filter_map(|id| self.frames.get(id))
            .find_map(|frame| frame.get(name))
    }

    /// Write to the nearest frame declaring `name`, else the nearest frame.
    pub fn set(&mut self, chain: &[ExecutionId], name: &str, value: serde_json::Value) {
        let owner = chain
            .iter()
            .copied()
            .find(|id| self.frames.get(id).is_some_and(|f| f.contains_key(name)))
            .or_else(|| chain.first().copied());
        if let Some(owner) = owner {
            self.set_local(owner, name, value);
        }
    }

    pub fn set_all(&mut self, chain: &[ExecutionId], vars: &Variables) {
        for (k, v) in vars {
            self.set(chain, k, v.clone());
        }
    }

    /// Declare in exactly this frame, shadowing any outer value.
    pub fn set_local(&mut self, owner: ExecutionId, name: &str, value: serde_json::Value) {
        self.frames
            .entry(owner)
            .or_default()
            .insert(name.to_string(), value);
    }

    pub fn get_local(&self, owner: ExecutionId, name: &str) -> Option<&serde_json::Value> {
        self.frames.get(&owner).and_then(|f| f.get(name))
    }

    /// Merged view along `chain`: inner frames shadow outer ones.
    pub fn visible(&self, chain: &[ExecutionId]) -> Variables {
        let mut out = Variables::new();
        for id in chain.iter().rev() {
            if let Some(frame) = self.frames.get(id) {
                out.extend(frame.iter().map(|(k, v)| (k.clone(), v.clone())));
            }
        }
        out
    }

    pub fn rows(&self) -> Vec<VariableRow> {
        self.frames
            .iter()
            .flat_map(|(owner, frame)| {
                frame.iter().map(move |(name, value)| VariableRow {
                    owner: *owner,
                    name: name.clone(),
                    value_type: VariableType::of(value),
                    value: value.clone(),
                })
            })
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    const ROOT: ExecutionId = ExecutionId(0);
    const SUB: ExecutionId = ExecutionId(3);

    #[test]
    fn test_nearest_scope_shadows() {
        let mut vars = VariableScopes::default();
        vars.set_local(ROOT, "x", json!(1));
        vars.set_local(SUB, "x", json!(2));
        assert_eq!(vars.get(&[SUB, ROOT], "x"), Some(&json!(2)));
        assert_eq!(vars.get(&[ROOT], "x"), Some(&json!(1)));
        assert_eq!(vars.visible(&[SUB, ROOT])["x"], json!(2));
    }

    #[test]
    fn test_write_targets_declaring_scope() {
        let mut vars = VariableScopes::default();
        vars.create_frame(SUB);
        vars.set_local(ROOT, "total", json!(10));
        vars.set(&[SUB, ROOT], "total", json!(11));
        vars.set(&[SUB, ROOT], "fresh", json!(true));
        assert_eq!(vars.get_local(ROOT, "total"), Some(&json!(11)));
        assert_eq!(vars.get_local(SUB, "total"), None);
        assert_eq!(vars.get_local(SUB, "fresh"), Some(&json!(true)));
    }

    #[test]
    fn test_variable_name_rule() {
        assert!(validate_variable_name("approved_by").is_ok());
        assert!(validate_variable_name("_x1").is_ok());
        assert!(matches!(
            validate_variable_name("bad!"),
            Err(EngineError::InvalidVariableName(_))
        ));
        assert!(validate_variable_name("1st").is_err());
        assert!(validate_variable_name("").is_err());
    }

    #[test]
    fn test_rows_carry_types() {
        let mut vars = VariableScopes::default();
        vars.set_local(ROOT, "n", json!(3));
        vars.set_local(ROOT, "s", json!("a"));
        let rows = vars.rows();
        assert_eq!(rows.len(), 2);
        assert_eq!(rows[0].value_type, VariableType::Number);
        assert_eq!(rows[1].value_type, VariableType::String);
    }
}
