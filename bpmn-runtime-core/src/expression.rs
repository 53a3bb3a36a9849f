//! Guard, cardinality, correlation and timer expressions.
//!
//! Expressions run on a locked-down Rhai engine. Every visible variable of
//! the requesting execution is pushed into the Rhai scope by name, so a guard
//! reads like `amount > 1000 && approved`.

use rhai::{Array, Dynamic, Engine, Map, Scope, AST};
use serde_json::{Map as JsonMap, Number, Value};
use std::collections::HashMap;
use std::sync::{Arc, RwLock};

use crate::clock::add_duration;
use crate::error::{EngineError, EngineResult};
use crate::types::{Timestamp, Variables};

pub struct ExpressionEngine {
    engine: Engine,
    cache: RwLock<HashMap<String, Arc<AST>>>,
}

impl Default for ExpressionEngine {
    fn default() -> Self {
        let mut engine = Engine::new();
        engine.set_max_operations(50_000);
        engine.set_max_call_levels(32);
        engine.set_max_expr_depths(64, 32);
        engine.set_max_string_size(64 * 1024);
        engine.set_max_array_size(10_000);
        engine.on_print(|_| {});
        engine.on_debug(|_, _, _| {});
        ExpressionEngine {
            engine,
            cache: RwLock::new(HashMap::new()),
        }
    }
}

impl std::fmt::Debug for ExpressionEngine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ExpressionEngine").finish_non_exhaustive()
    }
}

impl ExpressionEngine {
    pub fn new() -> Self {
        Self::default()
    }

    fn compiled(&self, expr: &str) -> EngineResult<Arc<AST>> {
        if let Some(ast) = self
            .cache
            .read()
            .unwrap_or_else(|p| p.into_inner())
            .get(expr)
        {
            return Ok(ast.clone());
        }
        let ast = Arc::new(
            self.engine
                .compile_expression(expr)
                .map_err(|e| EngineError::expression(expr, format!("compile error: {e}")))?,
        );
        self.cache
            .write()
            .unwrap_or_else(|p| p.into_inner())
            .insert(expr.to_string(), ast.clone());
        Ok(ast)
    }

    /// Evaluate against a variable view.
    pub fn evaluate(&self, expr: &str, vars: &Variables) -> EngineResult<Value> {
        let ast = self.compiled(expr)?;
        let mut scope = Scope::new();
        for (name, value) in vars {
            scope.push_dynamic(name.as_str(), to_dynamic(value));
        }
        let result = self
            .engine
            .eval_ast_with_scope::<Dynamic>(&mut scope, &ast)
            .map_err(|e| EngineError::expression(expr, e))?;
        Ok(from_dynamic(result))
    }

    pub fn evaluate_bool(&self, expr: &str, vars: &Variables) -> EngineResult<bool> {
        match self.evaluate(expr, vars)? {
            Value::Bool(b) => Ok(b),
            other => Err(EngineError::expression(
                expr,
                format!("expected a boolean, got {other}"),
            )),
        }
    }

    /// Non-negative integer, e.g. a multi-instance cardinality.
    pub fn evaluate_count(&self, expr: &str, vars: &Variables) -> EngineResult<usize> {
        let value = self.evaluate(expr, vars)?;
        value
            .as_u64()
            .and_then(|n| usize::try_from(n).ok())
            .ok_or_else(|| {
                EngineError::expression(expr, format!("expected a non-negative integer, got {value}"))
            })
    }

    pub fn evaluate_collection(&self, expr: &str, vars: &Variables) -> EngineResult<Vec<Value>> {
        match self.evaluate(expr, vars)? {
            Value::Array(items) => Ok(items),
            Value::Null => Ok(Vec::new()),
            other => Err(EngineError::expression(
                expr,
                format!("expected an array, got {other}"),
            )),
        }
    }

    /// Optional string, e.g. an assignee. `()` means "nobody".
    pub fn evaluate_string(&self, expr: &str, vars: &Variables) -> EngineResult<Option<String>> {
        Ok(match self.evaluate(expr, vars)? {
            Value::Null => None,
            Value::String(s) => Some(s),
            other => Some(other.to_string()),
        })
    }

    /// Timer expression: milliseconds from `now`, or an RFC 3339 instant.
    pub fn evaluate_due(
        &self,
        expr: &str,
        vars: &Variables,
        now: Timestamp,
    ) -> EngineResult<Timestamp> {
        match self.evaluate(expr, vars)? {
            Value::Number(n) => n
                .as_u64()
                .map(|ms| add_duration(now, std::time::Duration::from_millis(ms)))
                .ok_or_else(|| {
                    EngineError::expression(expr, format!("timer delay must be >= 0 ms, got {n}"))
                }),
            Value::String(s) => chrono::DateTime::parse_from_rfc3339(&s)
                .map(|d| d.with_timezone(&chrono::Utc))
                .map_err(|e| EngineError::expression(expr, format!("bad timer date {s:?}: {e}"))),
            other => Err(EngineError::expression(
                expr,
                format!("expected milliseconds or an RFC 3339 date, got {other}"),
            )),
        }
    }
}

fn to_dynamic(value: &Value) -> Dynamic {
    match value {
        Value::Null => Dynamic::UNIT,
        Value::Bool(b) => Dynamic::from(*b),
        Value::Number(n) => {
            if let Some(i) = n.as_i64() {
                Dynamic::from(i)
            } else if let Some(f) = n.as_f64() {
                Dynamic::from(f)
            } else {
                Dynamic::from(0_i64)
            }
        }
        Value::String(s) => Dynamic::from(s.clone()),
        Value::Array(items) => Dynamic::from_array(items.iter().map(to_dynamic).collect()),
        Value::Object(map) => {
            let mut rhai_map = Map::new();
            for (key, value) in map {
                rhai_map.insert(key.into(), to_dynamic(value));
            }
            Dynamic::from_map(rhai_map)
        }
    }
}

fn from_dynamic(value: Dynamic) -> Value {
    if value.is_unit() {
        return Value::Null;
    }
    if let Some(b) = value.clone().try_cast::<bool>() {
        return Value::Bool(b);
    }
    if let Some(i) = value.clone().try_cast::<i64>() {
        return Value::Number(Number::from(i));
    }
    if let Some(f) = value.clone().try_cast::<f64>() {
        if let Some(num) = Number::from_f64(f) {
            return Value::Number(num);
        }
    }
    if let Some(s) = value.clone().try_cast::<String>() {
        return Value::String(s);
    }
    if let Some(arr) = value.clone().try_cast::<Array>() {
        return Value::Array(arr.into_iter().map(from_dynamic).collect());
    }
    if let Some(map) = value.try_cast::<Map>() {
        let mut json_map = JsonMap::new();
        for (key, value) in map {
            json_map.insert(key.into(), from_dynamic(value));
        }
        return Value::Object(json_map);
    }
    Value::Null
}
