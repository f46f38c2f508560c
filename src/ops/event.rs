//! Event operations
//!
//! No clock anywhere: the device pushes a message whenever it has
//! something to say, the event script turns it into samples, and every
//! attached task receives them. The push callback is registered while at
//! least one task is attached and removed when the last one leaves, so an
//! idle event operation costs nothing.

use crate::channel::{ChannelManager, Mapper, Message, MessageCallback};
use crate::error::RuntimeError;
use crate::ops::{
    fan_out_error, Operation, OperationCore, RemoveOutcome, SamplePipeline, Task, TaskHandler,
};
use crate::script::executor::Executor;
use crate::script::{Script, ScriptHandler, ScriptParams};
use crate::types::{Attribute, Sample};
use std::sync::{Arc, Mutex, Weak};
use tracing::{debug, warn};

/// Runs its script once per device-pushed message
pub struct EventOperation {
    weak: Weak<Self>,
    core: OperationCore,
    script: Arc<Script>,
    mapper: Arc<dyn Mapper>,
    executor: Arc<Executor>,
    channels: Arc<dyn ChannelManager>,
    registered: Mutex<bool>,
}

impl EventOperation {
    pub fn new(
        script: Arc<Script>,
        mapper: Arc<dyn Mapper>,
        executor: Arc<Executor>,
        channels: Arc<dyn ChannelManager>,
    ) -> Arc<Self> {
        Arc::new_cyclic(|weak| Self {
            weak: weak.clone(),
            core: OperationCore::new(script.emit_attributes().to_vec()),
            script,
            mapper,
            executor,
            channels,
            registered: Mutex::new(false),
        })
    }

    fn register(&self) {
        let mut registered = self.registered.lock().unwrap();
        if !*registered {
            *registered = true;
            debug!(operation = self.core.id(), message_type = self.mapper.message_type(), "listening for events");
            self.channels.add_callback(
                self.mapper.clone(),
                Arc::new(EventCallback {
                    operation: self.weak.clone(),
                }),
            );
        }
    }

    fn deregister(&self) {
        let mut registered = self.registered.lock().unwrap();
        if *registered {
            *registered = false;
            self.channels.remove_callback(self.mapper.message_type());
        }
    }

    fn handle_message(self: Arc<Self>, message: Message) {
        if self.core.task_count() == 0 {
            // A push raced the deregistration; drop it.
            return;
        }
        let mut params = ScriptParams::new();
        params.insert("message".to_string(), message.to_value());
        let handler = Arc::new(EventHandler {
            operation: self.weak.clone(),
        });
        if let Err(e) = self.executor.execute(self.script.clone(), params, handler) {
            self.unrecoverable(e);
        }
    }

    fn distribute(&self, samples: Vec<Sample>) {
        let tasks = self.core.tasks();
        for sample in &samples {
            for task in &tasks {
                task.deliver(sample);
            }
        }
    }

    /// The event script failed: the operation is finished for good
    fn unrecoverable(&self, cause: RuntimeError) {
        let tasks = self.core.shut_down();
        if tasks.is_empty() {
            // Already shut down by a racing failure.
            return;
        }
        warn!(operation = self.core.id(), "event handling failed, shutting down");
        self.deregister();
        fan_out_error(self.core.id(), tasks, cause);
    }
}

impl Operation for EventOperation {
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
        _params: ScriptParams,
        handler: Arc<dyn TaskHandler>,
        pipeline: SamplePipeline,
    ) -> crate::error::Result<Arc<Task>> {
        // Event tasks have no sampling period.
        let operation: Arc<dyn Operation> = self.clone();
        let task = Task::new(Arc::downgrade(&operation), handler, pipeline, 0);
        self.core.add_task(task.clone())?;
        self.register();
        Ok(task)
    }

    fn remove_task(&self, task: &Arc<Task>) {
        match self.core.remove_task(task) {
            RemoveOutcome::NotFound | RemoveOutcome::Remaining => {}
            // Idle event operations stop listening but stay schedulable.
            RemoveOutcome::Empty => self.deregister(),
        }
    }

    fn stop(&self, on_stopped: Box<dyn FnOnce(u64) + Send>) {
        let tasks = self.core.shut_down();
        self.deregister();
        for task in tasks {
            task.finish();
        }
        on_stopped(self.core.id());
    }
}

/// Bridges one event script execution back to the tasks
struct EventHandler {
    operation: Weak<EventOperation>,
}

impl ScriptHandler for EventHandler {
    fn complete(&self, _script: &Arc<Script>, samples: Vec<Sample>) {
        if let Some(operation) = self.operation.upgrade() {
            operation.distribute(samples);
        }
    }

    fn error(&self, _script: &Arc<Script>, error: RuntimeError) {
        if let Some(operation) = self.operation.upgrade() {
            operation.unrecoverable(error);
        }
    }
}

struct EventCallback {
    operation: Weak<EventOperation>,
}

impl MessageCallback for EventCallback {
    fn on_message(&self, message: Message) {
        if let Some(operation) = self.operation.upgrade() {
            operation.handle_message(message);
        }
    }
}
