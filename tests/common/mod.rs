//! Common test utilities and helpers

#![allow(dead_code)] // Test utilities may not all be used in every test file

pub mod fixtures;

use crossbeam_channel::Sender;
use devmux::{RuntimeError, Sample, Script, ScriptHandler, Task, TaskHandler};
use std::sync::Arc;
use std::time::{Duration, Instant};

/// Generous timeout for cross-thread assertions
pub fn test_timeout() -> Duration {
    Duration::from_secs(5)
}

/// Poll `cond` until it holds or the timeout expires
pub fn wait_for(what: &str, mut cond: impl FnMut() -> bool) {
    let deadline = Instant::now() + test_timeout();
    while !cond() {
        assert!(Instant::now() < deadline, "timed out waiting for {what}");
        std::thread::sleep(Duration::from_millis(5));
    }
}

/// Terminal outcome of one script execution
pub enum ScriptOutcome {
    Complete(Vec<Sample>),
    Error(RuntimeError),
}

/// Script handler forwarding outcomes over a channel
pub struct CollectScript(pub Sender<ScriptOutcome>);

impl ScriptHandler for CollectScript {
    fn complete(&self, _script: &Arc<Script>, samples: Vec<Sample>) {
        let _ = self.0.send(ScriptOutcome::Complete(samples));
    }

    fn error(&self, _script: &Arc<Script>, error: RuntimeError) {
        let _ = self.0.send(ScriptOutcome::Error(error));
    }
}

/// One task callback, in arrival order
pub enum TaskEvent {
    Data(Sample),
    Complete,
    Error(RuntimeError),
    OperationError(RuntimeError),
}

/// Task handler forwarding callbacks over a channel
pub struct CollectTask(pub Sender<TaskEvent>);

impl TaskHandler for CollectTask {
    fn data(&self, _task: &Arc<Task>, sample: Sample) {
        let _ = self.0.send(TaskEvent::Data(sample));
    }

    fn complete(&self, _task: &Arc<Task>) {
        let _ = self.0.send(TaskEvent::Complete);
    }

    fn error(&self, _task: &Arc<Task>, error: RuntimeError) {
        let _ = self.0.send(TaskEvent::Error(error));
    }

    fn operation_error(&self, _task: &Arc<Task>, error: RuntimeError) {
        let _ = self.0.send(TaskEvent::OperationError(error));
    }
}
