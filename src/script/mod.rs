//! Script compilation and execution
//!
//! A [`Script`] is an immutable compiled program built by the
//! [`compiler`] from serialized instruction descriptors. Scripts run on the
//! [`executor`]'s worker pool; each run is driven by a [`runner::Runner`]
//! holding the per-execution state, and reports back through a
//! [`ScriptHandler`].
//!
//! ## Lifecycle
//!
//! ```text
//! descriptors ──compile──▶ Script ──execute──▶ Runner ──▶ handler callbacks
//!                            │                   │
//!                            └── shared, reused ─┴── suspends on submit,
//!                                                    resumed by I/O outcome
//! ```
//!
//! Compiled scripts are cheap to share (`Arc`) and may be executing any
//! number of times concurrently; all mutable state lives in the runner's
//! execution context.

pub mod compiler;
pub mod context;
pub mod executor;
mod instruction;
pub mod runner;

pub use context::{ContextPool, ExecutionContext, PARAM_VARIABLE};
pub use instruction::Instruction;

use crate::error::RuntimeError;
use crate::types::{Attribute, Sample, Value};
use std::collections::HashMap;
use std::sync::Arc;

/// Caller-supplied parameters for one execution, visible to expressions as
/// the reserved `param` record
pub type ScriptParams = HashMap<String, Value>;

/// An immutable compiled script
///
/// Built by [`compiler::compile`]; the entry instruction anchors the whole
/// graph. The emit list fixes the order of sample slots; the set list names
/// the writable device attributes the script reads from `param`.
pub struct Script {
    name: String,
    entry: Arc<Instruction>,
    emit: Arc<Vec<Attribute>>,
    set: Vec<Attribute>,
}

impl Script {
    pub(crate) fn new(
        name: String,
        entry: Arc<Instruction>,
        emit: Vec<Attribute>,
        set: Vec<Attribute>,
    ) -> Self {
        Self {
            name,
            entry,
            emit: Arc::new(emit),
            set,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub(crate) fn entry(&self) -> &Arc<Instruction> {
        &self.entry
    }

    /// Attributes of the samples this script emits, in slot order
    pub fn emit_attributes(&self) -> &[Attribute] {
        &self.emit
    }

    pub(crate) fn emit_attributes_arc(&self) -> &Arc<Vec<Attribute>> {
        &self.emit
    }

    /// Writable device attributes this script consumes from `param`
    pub fn set_attributes(&self) -> &[Attribute] {
        &self.set
    }
}

impl std::fmt::Debug for Script {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Script")
            .field("name", &self.name)
            .field("emit", &self.emit)
            .field("set", &self.set)
            .finish()
    }
}

/// Consumer callbacks for one script execution
///
/// Exactly one of `complete` or `error` fires per execution, on a worker
/// thread. Implementations must not block.
pub trait ScriptHandler: Send + Sync {
    /// The script ran to its stop instruction; `samples` are everything it
    /// emitted, in order
    fn complete(&self, script: &Arc<Script>, samples: Vec<Sample>);

    /// The script failed or was cancelled
    fn error(&self, script: &Arc<Script>, error: RuntimeError);
}

/// Debugger hook invoked at breakpoint instructions
///
/// The execution blocks for the duration of the callback; the context is
/// read-only at that point.
pub trait ScriptDebugger: Send + Sync {
    fn breakpoint(&self, script: &Arc<Script>, context: &ExecutionContext);
}
