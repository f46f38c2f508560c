//! Operation layer: scheduling device sampling for many consumers
//!
//! An [`Operation`] multiplexes one kind of device activity (a one-shot
//! read, periodic sampling, event notification) across any number of
//! consumer [`Task`]s. Consumers never talk to scripts or channels
//! directly; they pick an operation through the [`scheduler::Scheduler`]
//! and call `schedule`, and the operation arbitrates between everyone's
//! demands (fastest requested period wins, slower tasks are downsampled).
//!
//! Four operation flavors:
//!
//! - [`oneshot::OneShotOperation`]: one script execution per schedule call
//! - [`periodic::PeriodicOperation`]: a runtime-driven ticker executes the
//!   sampling script at the fastest requested period
//! - [`native::NativePeriodicOperation`]: the device samples on its own
//!   once told to start; pushed messages are assembled into composite
//!   samples
//! - [`event::EventOperation`]: a script runs per device push, no period

pub mod event;
pub mod native;
pub mod oneshot;
pub mod periodic;
pub mod pipeline;
pub mod scheduler;
pub mod task;

pub use pipeline::{SamplePipeline, SamplePipelineBuilder};
pub use scheduler::Scheduler;
pub use task::{Downsampler, Task, TaskHandler};

use crate::error::{Result, RuntimeError};
use crate::script::ScriptParams;
use crate::types::{Attribute, Value};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use tracing::{error, warn};

/// Scheduling parameter naming the requested sampling period (ms)
pub const PERIOD_PARAM: &str = "period";

static NEXT_OPERATION_ID: AtomicU64 = AtomicU64::new(1);

pub(crate) fn next_operation_id() -> u64 {
    NEXT_OPERATION_ID.fetch_add(1, Ordering::Relaxed)
}

/// One schedulable kind of device activity
pub trait Operation: Send + Sync {
    /// Process-wide unique id
    fn id(&self) -> u64;

    /// Attributes this operation can produce, in its native slot order
    fn attributes(&self) -> &[Attribute];

    /// Whether new tasks may still be scheduled
    fn schedulable(&self) -> bool;

    /// Schedule a task with an explicit sample pipeline
    fn schedule_with_pipeline(
        self: Arc<Self>,
        params: ScriptParams,
        handler: Arc<dyn TaskHandler>,
        pipeline: SamplePipeline,
    ) -> Result<Arc<Task>>;

    /// Schedule a task receiving samples in the operation's native shape
    fn schedule(
        self: Arc<Self>,
        params: ScriptParams,
        handler: Arc<dyn TaskHandler>,
    ) -> Result<Arc<Task>> {
        let pipeline = SamplePipeline::identity(Arc::new(self.attributes().to_vec()));
        self.schedule_with_pipeline(params, handler, pipeline)
    }

    /// Detach a task; called by [`Task::stop`]
    fn remove_task(&self, task: &Arc<Task>);

    /// Shut the operation down for good.
    ///
    /// Remaining tasks get their `complete` callback, ongoing device
    /// activity is wound down asynchronously, and `on_stopped` fires with
    /// the operation id once that is done. A stopped operation is
    /// permanently unschedulable.
    fn stop(&self, on_stopped: Box<dyn FnOnce(u64) + Send>);
}

/// What remains after removing one task
#[derive(Debug, PartialEq, Eq)]
pub(crate) enum RemoveOutcome {
    /// The task list is now empty; the operation should wind down its
    /// device activity (it stays schedulable)
    Empty,
    /// Other tasks remain
    Remaining,
    /// The task was not attached (already removed)
    NotFound,
}

struct CoreInner {
    tasks: Vec<Arc<Task>>,
    schedulable: bool,
}

/// Task bookkeeping shared by every operation flavor
pub(crate) struct OperationCore {
    id: u64,
    attributes: Arc<Vec<Attribute>>,
    inner: Mutex<CoreInner>,
}

impl OperationCore {
    pub(crate) fn new(attributes: Vec<Attribute>) -> Self {
        Self {
            id: next_operation_id(),
            attributes: Arc::new(attributes),
            inner: Mutex::new(CoreInner {
                tasks: Vec::new(),
                schedulable: true,
            }),
        }
    }

    pub(crate) fn id(&self) -> u64 {
        self.id
    }

    pub(crate) fn attributes(&self) -> &[Attribute] {
        &self.attributes
    }

    pub(crate) fn attributes_arc(&self) -> &Arc<Vec<Attribute>> {
        &self.attributes
    }

    pub(crate) fn is_schedulable(&self) -> bool {
        self.inner.lock().unwrap().schedulable
    }

    /// Attach a task, refusing if the operation already stopped
    pub(crate) fn add_task(&self, task: Arc<Task>) -> Result<()> {
        let mut inner = self.inner.lock().unwrap();
        if !inner.schedulable {
            return Err(RuntimeError::NotSchedulable(self.id));
        }
        inner.tasks.push(task);
        Ok(())
    }

    pub(crate) fn remove_task(&self, task: &Arc<Task>) -> RemoveOutcome {
        let mut inner = self.inner.lock().unwrap();
        let before = inner.tasks.len();
        inner.tasks.retain(|t| !Arc::ptr_eq(t, task));
        if inner.tasks.len() == before {
            RemoveOutcome::NotFound
        } else if inner.tasks.is_empty() {
            RemoveOutcome::Empty
        } else {
            RemoveOutcome::Remaining
        }
    }

    /// Snapshot of the attached tasks
    pub(crate) fn tasks(&self) -> Vec<Arc<Task>> {
        self.inner.lock().unwrap().tasks.clone()
    }

    pub(crate) fn task_count(&self) -> usize {
        self.inner.lock().unwrap().tasks.len()
    }

    /// Fastest period any attached task asked for
    pub(crate) fn min_period(&self) -> Option<u64> {
        self.inner
            .lock()
            .unwrap()
            .tasks
            .iter()
            .map(|t| t.requested_period())
            .filter(|p| *p > 0)
            .min()
    }

    /// Mark unschedulable and drain every task
    pub(crate) fn shut_down(&self) -> Vec<Arc<Task>> {
        let mut inner = self.inner.lock().unwrap();
        inner.schedulable = false;
        std::mem::take(&mut inner.tasks)
    }
}

/// Fan an operation-wide failure out to the drained tasks.
///
/// The unsupported-period error passes through unwrapped so consumers can
/// reschedule with the suggested period; everything else is wrapped with
/// the operation context.
pub(crate) fn fan_out_error(
    operation_id: u64,
    tasks: Vec<Arc<Task>>,
    cause: RuntimeError,
) {
    if cause.is_unsupported_period() {
        warn!(operation = operation_id, error = %cause, "operation rejected the sampling period");
    } else {
        error!(operation = operation_id, error = %cause, "operation failed");
    }
    let delivered = if cause.is_unsupported_period() {
        cause
    } else {
        cause.operation(format!("operation {operation_id}"))
    };
    for task in tasks {
        task.fail_operation(delivered.clone());
    }
}

/// Read the requested period out of scheduling parameters
pub(crate) fn required_period(params: &ScriptParams) -> Result<u64> {
    match params.get(PERIOD_PARAM).and_then(Value::as_integer) {
        Some(period) if period > 0 => Ok(period as u64),
        _ => Err(RuntimeError::MissingParameter(PERIOD_PARAM.to_string())),
    }
}
