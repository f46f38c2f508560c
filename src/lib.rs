//! # devmux: sensor/device middleware runtime
//!
//! The runtime core of a device abstraction layer: compiled device
//! interaction scripts with suspend/resume execution, and a scheduling
//! layer that multiplexes one physical capability across any number of
//! consumers.
//!
//! ## Architecture
//!
//! - **Script engine**: immutable instruction graphs compiled from
//!   serialized descriptors, executed on a worker pool; the submit
//!   instruction suspends on asynchronous device I/O and resumes when the
//!   channel answers
//! - **Expressions**: Rhai-backed evaluation for every computed value in a
//!   script, with a compiled-AST cache
//! - **Operations**: one-shot, runtime-periodic, device-native-periodic
//!   and event flavors; fastest requested period wins, slower tasks are
//!   downsampled
//! - **Scheduler**: best-fit matching of attribute requests against pools
//!   of operations
//!
//! The transport side (channels, message mappers, the push-message
//! registry) is a set of traits implemented by collaborators; in-memory
//! implementations for tests live in [`channel::mock`].
//!
//! ## Example
//!
//! ```ignore
//! use devmux::expr::RhaiEvaluator;
//! use devmux::ops::{Operation, PeriodicOperation};
//! use devmux::script::compiler::{compile, CompilerEnv};
//! use devmux::script::executor::{Executor, ExecutorConfig};
//! use std::sync::Arc;
//!
//! let evaluator = Arc::new(RhaiEvaluator::new());
//! let executor = Arc::new(Executor::new(ExecutorConfig::default(), evaluator.clone()));
//!
//! // Descriptors usually come from the device descriptor layer as JSON.
//! let env = CompilerEnv::new(evaluator);
//! let script = compile("sample-temperature", &descriptors, &env)?;
//!
//! let operation = PeriodicOperation::new(script, executor);
//! let task = operation.schedule(params, handler)?;
//! // ... samples arrive on the handler until:
//! task.stop();
//! ```

pub mod channel;
pub mod error;
pub mod expr;
pub mod ops;
pub mod script;
pub mod types;

pub use error::{Result, RuntimeError};
pub use ops::{
    event::EventOperation,
    native::{MessageScript, NativePeriodicOperation, NativeState},
    oneshot::OneShotOperation,
    periodic::PeriodicOperation,
    Operation, SamplePipeline, SamplePipelineBuilder, Scheduler, Task, TaskHandler,
};
pub use script::executor::{Executor, ExecutorConfig};
pub use script::{Script, ScriptDebugger, ScriptHandler, ScriptParams};
pub use types::{Attribute, AttributeType, Permission, Sample, Value};
