//! Runtime-driven periodic operations
//!
//! The runtime owns the clock: a dedicated ticker thread executes the
//! sampling script at the fastest period any attached task requested.
//! Tasks that asked for a slower rate are downsampled on delivery. Adding
//! or removing tasks re-arbitrates the period on the fly; removing the
//! last task parks the ticker but leaves the operation schedulable.

use crate::error::RuntimeError;
use crate::ops::{
    fan_out_error, required_period, Operation, OperationCore, SamplePipeline, Task, TaskHandler,
    PERIOD_PARAM,
};
use crate::script::executor::Executor;
use crate::script::{Script, ScriptHandler, ScriptParams};
use crate::types::{Attribute, Sample, Value};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Condvar, Mutex, Weak};
use std::time::Duration;
use tracing::{debug, warn};

struct TickerShared {
    period_ms: Mutex<u64>,
    changed: Condvar,
    stop: AtomicBool,
}

struct TickerHandle {
    shared: Arc<TickerShared>,
    thread: Option<std::thread::JoinHandle<()>>,
}

impl TickerHandle {
    fn set_period(&self, period_ms: u64) {
        *self.shared.period_ms.lock().unwrap() = period_ms;
        self.shared.changed.notify_all();
    }

    fn stop(mut self) {
        self.shared.stop.store(true, Ordering::SeqCst);
        self.shared.changed.notify_all();
        if let Some(handle) = self.thread.take() {
            // The ticker may stop itself (an unrecoverable error surfacing
            // on its own tick); joining would self-deadlock then.
            if handle.thread().id() != std::thread::current().id() {
                let _ = handle.join();
            }
        }
    }
}

struct Sampling {
    /// Current arbitrated period; 0 while no periodic task is attached
    period: u64,
    ticker: Option<TickerHandle>,
}

/// Samples by executing its script on a runtime clock
pub struct PeriodicOperation {
    weak: Weak<Self>,
    core: OperationCore,
    script: Arc<Script>,
    executor: Arc<Executor>,
    sampling: Mutex<Sampling>,
}

impl PeriodicOperation {
    pub fn new(script: Arc<Script>, executor: Arc<Executor>) -> Arc<Self> {
        Arc::new_cyclic(|weak| Self {
            weak: weak.clone(),
            core: OperationCore::new(script.emit_attributes().to_vec()),
            script,
            executor,
            sampling: Mutex::new(Sampling {
                period: 0,
                ticker: None,
            }),
        })
    }

    /// Current arbitrated sampling period in ms; 0 while idle
    pub fn current_period(&self) -> u64 {
        self.sampling.lock().unwrap().period
    }

    /// Re-arbitrate the sampling period after the task set changed
    fn update_sampling(&self) {
        let mut sampling = self.sampling.lock().unwrap();
        // Read under the lock so a racing schedule/remove cannot land a
        // stale period last.
        let fastest = self.core.min_period();
        match fastest {
            None => {
                if let Some(ticker) = sampling.ticker.take() {
                    debug!(operation = self.core.id(), "last periodic task gone, parking ticker");
                    ticker.stop();
                }
                sampling.period = 0;
            }
            Some(fastest) => {
                let changed = sampling.period != fastest;
                sampling.period = fastest;
                match &sampling.ticker {
                    Some(ticker) if changed => {
                        debug!(operation = self.core.id(), period = fastest, "sampling period changed");
                        ticker.set_period(fastest);
                    }
                    Some(_) => {}
                    None => sampling.ticker = Some(self.spawn_ticker(fastest)),
                }
                // New tasks need a downsampler even when the period is
                // unchanged, so always rebuild.
                for task in self.core.tasks() {
                    task.set_input_period(fastest);
                }
            }
        }
    }

    fn spawn_ticker(&self, period_ms: u64) -> TickerHandle {
        let shared = Arc::new(TickerShared {
            period_ms: Mutex::new(period_ms),
            changed: Condvar::new(),
            stop: AtomicBool::new(false),
        });
        let weak = self.weak.clone();
        let thread_shared = shared.clone();
        let thread = std::thread::Builder::new()
            .name(format!("sampler-{}", self.core.id()))
            .spawn(move || {
                loop {
                    if thread_shared.stop.load(Ordering::SeqCst) {
                        break;
                    }
                    match weak.upgrade() {
                        Some(operation) => operation.tick(),
                        None => break,
                    }
                    let guard = thread_shared.period_ms.lock().unwrap();
                    let wait = Duration::from_millis(*guard);
                    // A period change or stop wakes the wait early; both
                    // are re-checked at the loop head.
                    let _ = thread_shared.changed.wait_timeout(guard, wait).unwrap();
                }
            })
            .expect("failed to spawn sampler thread");
        debug!(operation = self.core.id(), period = period_ms, "ticker started");
        TickerHandle {
            shared,
            thread: Some(thread),
        }
    }

    /// Execute one sampling round
    fn tick(self: Arc<Self>) {
        let period = self.current_period();
        let mut params = ScriptParams::new();
        params.insert(PERIOD_PARAM.to_string(), Value::Integer(period as i64));
        let handler = Arc::new(TickHandler {
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

    /// A sampling round failed: the operation is finished for good
    fn unrecoverable(&self, cause: RuntimeError) {
        let tasks = self.core.shut_down();
        if tasks.is_empty() {
            // Already shut down by a racing failure.
            return;
        }
        warn!(operation = self.core.id(), "periodic sampling failed, shutting down");
        {
            let mut sampling = self.sampling.lock().unwrap();
            if let Some(ticker) = sampling.ticker.take() {
                ticker.stop();
            }
            sampling.period = 0;
        }
        fan_out_error(self.core.id(), tasks, cause);
    }
}

impl Operation for PeriodicOperation {
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
    ) -> crate::error::Result<Arc<Task>> {
        let period = required_period(&params)?;
        let operation: Arc<dyn Operation> = self.clone();
        let task = Task::new(Arc::downgrade(&operation), handler, pipeline, period);
        self.core.add_task(task.clone())?;
        debug!(operation = self.id(), period, "periodic task scheduled");
        self.update_sampling();
        Ok(task)
    }

    fn remove_task(&self, task: &Arc<Task>) {
        use crate::ops::RemoveOutcome;
        match self.core.remove_task(task) {
            RemoveOutcome::NotFound => {}
            // Covers both cases: with tasks left the period may relax,
            // with none left the ticker parks.
            RemoveOutcome::Empty | RemoveOutcome::Remaining => self.update_sampling(),
        }
    }

    fn stop(&self, on_stopped: Box<dyn FnOnce(u64) + Send>) {
        let tasks = self.core.shut_down();
        {
            let mut sampling = self.sampling.lock().unwrap();
            if let Some(ticker) = sampling.ticker.take() {
                ticker.stop();
            }
            sampling.period = 0;
        }
        for task in tasks {
            task.finish();
        }
        on_stopped(self.core.id());
    }
}

/// Bridges one sampling round back to the operation
struct TickHandler {
    operation: Weak<PeriodicOperation>,
}

impl ScriptHandler for TickHandler {
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
