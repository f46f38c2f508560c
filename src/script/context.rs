//! Per-execution mutable state
//!
//! An [`ExecutionContext`] is the scratch space of exactly one script
//! execution: its variables, the sample buffer being filled by `put`
//! instructions, the completed samples, and the instruction-local store.
//!
//! Contexts are pooled ([`ContextPool`]) and cleared between executions so
//! the variable map and expression-evaluation machinery are not reallocated
//! per invocation. A context is never shared between two concurrently
//! active runners.

use crate::error::{Result, RuntimeError};
use crate::expr::Evaluator;
use crate::script::ScriptParams;
use crate::types::{Attribute, AttributeType, Sample, Value};
use std::collections::HashMap;
use std::sync::{Arc, Mutex};

/// Reserved variable name exposing caller-supplied parameters to scripts
pub const PARAM_VARIABLE: &str = "param";

/// Execution-scoped memory owned by one shared instruction instance
///
/// Instructions are immutable and shared between concurrent executions;
/// anything per-invocation (a loop's running index, a submit's sent flag)
/// lives here, keyed by the instruction's process-wide unique id.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum InstructionLocal {
    Counter(usize),
    Flag(bool),
}

/// Per-execution scratch space for one script run
pub struct ExecutionContext {
    variables: HashMap<String, Value>,
    /// Current sample buffer, sized to the script's emit-list length
    buffer: Vec<Value>,
    /// Completed samples, drained by [`take_samples`](Self::take_samples)
    samples: Vec<Sample>,
    /// Instruction-local store keyed by instruction id
    locals: HashMap<u64, InstructionLocal>,
    emit_attributes: Arc<Vec<Attribute>>,
    evaluator: Arc<dyn Evaluator>,
}

impl ExecutionContext {
    fn new(evaluator: Arc<dyn Evaluator>) -> Self {
        Self {
            variables: HashMap::new(),
            buffer: Vec::new(),
            samples: Vec::new(),
            locals: HashMap::new(),
            emit_attributes: Arc::new(Vec::new()),
            evaluator,
        }
    }

    /// Reset this context for a fresh execution
    pub(crate) fn prepare(&mut self, emit_attributes: Arc<Vec<Attribute>>, params: ScriptParams) {
        self.clear();
        self.buffer = vec![Value::Null; emit_attributes.len()];
        self.emit_attributes = emit_attributes;
        self.variables
            .insert(PARAM_VARIABLE.to_string(), Value::Record(params));
    }

    fn clear(&mut self) {
        self.variables.clear();
        self.buffer.clear();
        self.samples.clear();
        self.locals.clear();
        self.emit_attributes = Arc::new(Vec::new());
    }

    /// Evaluate an expression against the current variables
    pub fn evaluate(&self, source: &str, ty: AttributeType) -> Result<Value> {
        self.evaluator.evaluate(&self.variables, source, ty)
    }

    pub fn variable(&self, name: &str) -> Option<&Value> {
        self.variables.get(name)
    }

    pub fn set_variable(&mut self, name: impl Into<String>, value: Value) {
        self.variables.insert(name.into(), value);
    }

    pub fn variables(&self) -> &HashMap<String, Value> {
        &self.variables
    }

    /// Set `field` of the record variable `name`
    pub fn set_field(&mut self, name: &str, field: &str, value: Value) -> Result<()> {
        match self.variables.get_mut(name) {
            Some(Value::Record(fields)) => {
                fields.insert(field.to_string(), value);
                Ok(())
            }
            Some(other) => Err(RuntimeError::TypeMismatch {
                expected: "record".to_string(),
                found: other.type_name().to_string(),
            }),
            None => Err(RuntimeError::UnknownVariable(name.to_string())),
        }
    }

    /// Append `value` to the list field `field` of the record variable `name`
    pub fn append_field(&mut self, name: &str, field: &str, value: Value) -> Result<()> {
        match self.variables.get_mut(name) {
            Some(Value::Record(fields)) => {
                match fields.get_mut(field) {
                    Some(Value::List(items)) => items.push(value),
                    Some(other) => {
                        return Err(RuntimeError::TypeMismatch {
                            expected: "list".to_string(),
                            found: other.type_name().to_string(),
                        })
                    }
                    None => {
                        fields.insert(field.to_string(), Value::List(vec![value]));
                    }
                }
                Ok(())
            }
            Some(other) => Err(RuntimeError::TypeMismatch {
                expected: "record".to_string(),
                found: other.type_name().to_string(),
            }),
            None => Err(RuntimeError::UnknownVariable(name.to_string())),
        }
    }

    /// Write `value` into sample slot `slot` (last write wins until the next
    /// emit)
    pub fn put_attribute(&mut self, slot: usize, value: Value) -> Result<()> {
        match self.buffer.get_mut(slot) {
            Some(entry) => {
                *entry = value;
                Ok(())
            }
            None => Err(RuntimeError::Script(format!(
                "sample slot {slot} out of range ({} slots)",
                self.buffer.len()
            ))),
        }
    }

    /// Copy the current buffer into the completed-sample list.
    ///
    /// The buffer is intentionally not cleared: a script may mutate only a
    /// subset of attributes between successive emits.
    pub fn emit_sample(&mut self) {
        self.samples.push(Sample::new(
            self.emit_attributes.clone(),
            self.buffer.clone(),
        ));
    }

    /// Drain and reset the completed-sample list
    pub fn take_samples(&mut self) -> Vec<Sample> {
        std::mem::take(&mut self.samples)
    }

    pub fn sample_count(&self) -> usize {
        self.samples.len()
    }

    // ── Instruction-local store ──

    pub(crate) fn counter(&self, id: u64) -> usize {
        match self.locals.get(&id) {
            Some(InstructionLocal::Counter(n)) => *n,
            _ => 0,
        }
    }

    pub(crate) fn set_counter(&mut self, id: u64, value: usize) {
        self.locals.insert(id, InstructionLocal::Counter(value));
    }

    pub(crate) fn flag(&self, id: u64) -> bool {
        matches!(self.locals.get(&id), Some(InstructionLocal::Flag(true)))
    }

    pub(crate) fn set_flag(&mut self, id: u64, value: bool) {
        self.locals.insert(id, InstructionLocal::Flag(value));
    }

    pub(crate) fn clear_local(&mut self, id: u64) {
        self.locals.remove(&id);
    }
}

/// Free-list of reusable execution contexts
///
/// Reuse avoids rebuilding the variable map and evaluator wiring on every
/// script invocation. Pooling is a performance measure only; behavior is
/// identical with a fresh context per run.
pub struct ContextPool {
    evaluator: Arc<dyn Evaluator>,
    free: Mutex<Vec<ExecutionContext>>,
}

impl ContextPool {
    pub fn new(evaluator: Arc<dyn Evaluator>) -> Self {
        Self {
            evaluator,
            free: Mutex::new(Vec::new()),
        }
    }

    /// Take a context from the pool, or allocate one if the pool is empty
    pub fn acquire(&self) -> ExecutionContext {
        self.free
            .lock()
            .ok()
            .and_then(|mut free| free.pop())
            .unwrap_or_else(|| ExecutionContext::new(self.evaluator.clone()))
    }

    /// Return a context for reuse
    pub fn release(&self, mut context: ExecutionContext) {
        context.clear();
        if let Ok(mut free) = self.free.lock() {
            free.push(context);
        }
    }

    #[cfg(test)]
    pub(crate) fn pooled(&self) -> usize {
        self.free.lock().map(|f| f.len()).unwrap_or(0)
    }
}
