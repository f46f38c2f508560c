//! One-shot operations
//!
//! Every `schedule` call runs the script once and delivers whatever it
//! emitted to that one task, which then completes. The operation itself
//! stays schedulable indefinitely; there is no device activity to wind
//! down.

use crate::error::{Result, RuntimeError};
use crate::ops::{Operation, OperationCore, SamplePipeline, Task, TaskHandler};
use crate::script::executor::Executor;
use crate::script::{Script, ScriptHandler, ScriptParams};
use crate::types::{Attribute, Sample};
use std::sync::{Arc, Weak};
use tracing::debug;

/// Runs its script once per scheduled task
pub struct OneShotOperation {
    core: OperationCore,
    script: Arc<Script>,
    executor: Arc<Executor>,
}

impl OneShotOperation {
    pub fn new(script: Arc<Script>, executor: Arc<Executor>) -> Arc<Self> {
        let attributes = script.emit_attributes().to_vec();
        Arc::new(Self {
            core: OperationCore::new(attributes),
            script,
            executor,
        })
    }
}

impl Operation for OneShotOperation {
    fn id(&self) -> u64 {
        self.core.id()
    }

    fn attributes(&self) -> &[Attribute] {
        self.core.attributes()
    }

    fn schedulable(&self) -> bool {
        self.core.is_schedulable()
    }

    fn schedule_with_pipeline(
        self: Arc<Self>,
        params: ScriptParams,
        handler: Arc<dyn TaskHandler>,
        pipeline: SamplePipeline,
    ) -> Result<Arc<Task>> {
        let operation: Arc<dyn Operation> = self.clone();
        let task = Task::new(Arc::downgrade(&operation), handler, pipeline, 0);
        self.core.add_task(task.clone())?;

        let script_handler = Arc::new(OneShotHandler {
            operation: Arc::downgrade(&self),
            task: task.clone(),
        });
        if let Err(e) = self
            .executor
            .execute(self.script.clone(), params, script_handler)
        {
            self.core.remove_task(&task);
            return Err(e);
        }
        debug!(operation = self.id(), script = self.script.name(), "one-shot scheduled");
        Ok(task)
    }

    fn remove_task(&self, task: &Arc<Task>) {
        // Nothing to wind down; the in-flight execution (if any) notices
        // the stopped task when it tries to deliver.
        self.core.remove_task(task);
    }

    fn stop(&self, on_stopped: Box<dyn FnOnce(u64) + Send>) {
        let tasks = self.core.shut_down();
        for task in tasks {
            task.finish();
        }
        on_stopped(self.core.id());
    }
}

/// Bridges one script execution to its task
struct OneShotHandler {
    operation: Weak<OneShotOperation>,
    task: Arc<Task>,
}

impl ScriptHandler for OneShotHandler {
    fn complete(&self, _script: &Arc<Script>, samples: Vec<Sample>) {
        for sample in &samples {
            self.task.deliver(sample);
        }
        self.task.finish();
        if let Some(operation) = self.operation.upgrade() {
            operation.core.remove_task(&self.task);
        }
    }

    fn error(&self, _script: &Arc<Script>, error: RuntimeError) {
        // The failure is scoped to this one execution, so the task gets a
        // plain error rather than an operation-wide one.
        self.task.fail(error);
        if let Some(operation) = self.operation.upgrade() {
            operation.core.remove_task(&self.task);
        }
    }
}
