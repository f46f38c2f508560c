//! Expression evaluation for script instructions
//!
//! Every `put`, `set`, `append`, `if` and submit-parameter instruction
//! carries an expression evaluated against the execution context's
//! variables. The grammar itself is a collaborator concern: the runtime only
//! depends on the [`Evaluator`] contract (`evaluate(variables, source,
//! expected type) → value`). The shipped implementation is backed by Rhai
//! with a compiled-AST cache so each expression is parsed once per process.
//!
//! ## Variable scope
//!
//! Context variables are projected into the expression scope as follows:
//!
//! - primitives map to their Rhai equivalents
//! - timestamps become epoch-millisecond integers
//! - lists become Rhai arrays, records become Rhai maps (so scripts can use
//!   `param.period` or `msg.readings[0]` naturally)

use crate::error::{Result, RuntimeError};
use crate::types::{AttributeType, Value};
use chrono::DateTime;
use rhai::{Dynamic, Engine, Scope, AST};
use std::collections::HashMap;
use std::sync::RwLock;

/// Contract between the runtime and the expression language
///
/// Implementations must be thread safe: one evaluator instance is shared by
/// every concurrently running script.
pub trait Evaluator: Send + Sync {
    /// Check an expression for syntax errors without evaluating it.
    ///
    /// Used by the compiler so malformed expressions surface at compile
    /// time rather than on first execution.
    fn validate(&self, source: &str) -> Result<()>;

    /// Evaluate `source` against `variables`, coercing the result to `ty`
    fn evaluate(
        &self,
        variables: &HashMap<String, Value>,
        source: &str,
        ty: AttributeType,
    ) -> Result<Value>;
}

/// Rhai-backed [`Evaluator`] with a per-source compiled-AST cache
pub struct RhaiEvaluator {
    engine: Engine,
    cache: RwLock<HashMap<String, AST>>,
}

impl RhaiEvaluator {
    /// Create a new evaluator with safety limits applied
    pub fn new() -> Self {
        let mut engine = Engine::new();

        // Expressions are small; keep the engine on a short leash so a bad
        // descriptor cannot stall a worker thread.
        engine.set_max_expr_depths(64, 64);
        engine.set_max_call_levels(32);
        engine.set_max_operations(10_000);
        engine.set_max_string_size(10_000);
        engine.set_max_array_size(1_000);
        engine.set_max_map_size(1_000);

        Self {
            engine,
            cache: RwLock::new(HashMap::new()),
        }
    }

    /// Get a cached AST or compile and cache it
    fn get_or_compile(&self, source: &str) -> Result<AST> {
        if let Ok(cache) = self.cache.read() {
            if let Some(ast) = cache.get(source) {
                return Ok(ast.clone());
            }
        }

        let ast = self
            .engine
            .compile_expression(source)
            .map_err(|e| RuntimeError::Expression {
                source_text: source.to_string(),
                message: format!("compilation error: {e}"),
            })?;

        if let Ok(mut cache) = self.cache.write() {
            cache.insert(source.to_string(), ast.clone());
        }
        Ok(ast)
    }

    fn to_dynamic(value: &Value) -> Dynamic {
        match value {
            Value::Null => Dynamic::UNIT,
            Value::Integer(i) => Dynamic::from(*i),
            Value::Float(f) => Dynamic::from(*f),
            Value::Bool(b) => Dynamic::from(*b),
            Value::String(s) => Dynamic::from(s.clone()),
            Value::Timestamp(t) => Dynamic::from(t.timestamp_millis()),
            Value::List(items) => {
                let arr: rhai::Array = items.iter().map(Self::to_dynamic).collect();
                Dynamic::from_array(arr)
            }
            Value::Record(fields) => {
                let mut map = rhai::Map::new();
                for (k, v) in fields {
                    map.insert(k.as_str().into(), Self::to_dynamic(v));
                }
                Dynamic::from_map(map)
            }
        }
    }

    fn coerce(source: &str, result: Dynamic, ty: AttributeType) -> Result<Value> {
        let found = result.type_name();
        let mismatch = || RuntimeError::TypeMismatch {
            expected: ty.name().to_string(),
            found: found.to_string(),
        };

        match ty {
            AttributeType::Integer => result.as_int().map(Value::Integer).map_err(|_| mismatch()),
            AttributeType::Float => {
                if let Ok(f) = result.as_float() {
                    Ok(Value::Float(f))
                } else {
                    // Integer results widen to float.
                    result
                        .as_int()
                        .map(|i| Value::Float(i as f64))
                        .map_err(|_| mismatch())
                }
            }
            AttributeType::Bool => result.as_bool().map(Value::Bool).map_err(|_| mismatch()),
            AttributeType::String => result
                .into_string()
                .map(Value::String)
                .map_err(|_| mismatch()),
            AttributeType::Timestamp => {
                let millis = result.as_int().map_err(|_| mismatch())?;
                DateTime::from_timestamp_millis(millis)
                    .map(Value::Timestamp)
                    .ok_or_else(|| RuntimeError::Expression {
                        source_text: source.to_string(),
                        message: format!("{millis} is out of range for a timestamp"),
                    })
            }
        }
    }
}

impl Default for RhaiEvaluator {
    fn default() -> Self {
        Self::new()
    }
}

impl Evaluator for RhaiEvaluator {
    fn validate(&self, source: &str) -> Result<()> {
        self.get_or_compile(source).map(|_| ())
    }

    fn evaluate(
        &self,
        variables: &HashMap<String, Value>,
        source: &str,
        ty: AttributeType,
    ) -> Result<Value> {
        let ast = self.get_or_compile(source)?;

        let mut scope = Scope::new();
        for (name, value) in variables {
            scope.push_dynamic(name.as_str(), Self::to_dynamic(value));
        }

        let result = self
            .engine
            .eval_ast_with_scope::<Dynamic>(&mut scope, &ast)
            .map_err(|e| RuntimeError::Expression {
                source_text: source.to_string(),
                message: e.to_string(),
            })?;

        Self::coerce(source, result, ty)
    }
}
