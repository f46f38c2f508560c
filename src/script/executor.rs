//! Worker pool driving script executions
//!
//! The [`Executor`] owns a fixed set of worker threads fed from an unbounded
//! job queue. Initial dispatches and post-I/O resumes are both queue jobs,
//! so a suspended script never pins a worker: the thread that parked it goes
//! back to the queue, and whichever worker picks up the resume continues the
//! execution.
//!
//! Shutdown is graceful: new executions are refused immediately, in-flight
//! ones get a configurable grace period, and whatever is still alive after
//! the deadline is cancelled.

use crate::error::{Result, RuntimeError};
use crate::expr::Evaluator;
use crate::script::context::ContextPool;
use crate::script::runner::Runner;
use crate::script::{Script, ScriptDebugger, ScriptHandler, ScriptParams};
use crossbeam_channel::{unbounded, Receiver, Sender};
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Condvar, Mutex, Weak};
use std::time::{Duration, Instant};
use tracing::{debug, info, trace, warn};

/// Executor tuning knobs
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ExecutorConfig {
    /// Number of worker threads
    pub workers: usize,
    /// Grace period granted to in-flight executions on shutdown
    pub shutdown_timeout_ms: u64,
}

impl Default for ExecutorConfig {
    fn default() -> Self {
        Self {
            workers: std::thread::available_parallelism()
                .map(|n| n.get())
                .unwrap_or(4),
            shutdown_timeout_ms: 5_000,
        }
    }
}

enum Job {
    Execute(Arc<Runner>),
    Resume(Arc<Runner>),
}

/// Shared half of the executor; runners hold a `Weak` to it
pub(crate) struct ExecutorCore {
    /// `None` once shutdown has dropped the queue
    jobs: Mutex<Option<Sender<Job>>>,
    shutdown: AtomicBool,
    /// Runners created but not yet terminal
    inflight: Mutex<usize>,
    idle: Condvar,
    live: Mutex<Vec<Weak<Runner>>>,
}

impl ExecutorCore {
    /// Queue a resume for a runner whose I/O outcome was just posted
    pub(crate) fn enqueue_resume(self: &Arc<Self>, runner: Arc<Runner>) {
        let sent = {
            let jobs = self.jobs.lock().unwrap();
            match jobs.as_ref() {
                Some(sender) => sender.send(Job::Resume(runner.clone())).is_ok(),
                None => false,
            }
        };
        if !sent {
            // Queue is gone; resume on the calling thread. The runner was
            // cancelled during shutdown, so this discards the outcome.
            trace!("job queue closed, resuming inline");
            runner.resume();
        }
    }

    /// A runner reached a terminal state
    pub(crate) fn runner_finished(&self) {
        let mut inflight = self.inflight.lock().unwrap();
        *inflight = inflight.saturating_sub(1);
        if *inflight == 0 {
            self.idle.notify_all();
        }
        drop(inflight);

        let mut live = self.live.lock().unwrap();
        live.retain(|w| w.upgrade().is_some_and(|r| !r.is_done()));
    }
}

/// Thread pool executing compiled scripts
pub struct Executor {
    core: Arc<ExecutorCore>,
    pool: Arc<ContextPool>,
    config: ExecutorConfig,
    workers: Mutex<Vec<std::thread::JoinHandle<()>>>,
}

impl Executor {
    pub fn new(config: ExecutorConfig, evaluator: Arc<dyn Evaluator>) -> Self {
        let (sender, receiver) = unbounded();
        let core = Arc::new(ExecutorCore {
            jobs: Mutex::new(Some(sender)),
            shutdown: AtomicBool::new(false),
            inflight: Mutex::new(0),
            idle: Condvar::new(),
            live: Mutex::new(Vec::new()),
        });

        let worker_count = config.workers.max(1);
        let mut workers = Vec::with_capacity(worker_count);
        for i in 0..worker_count {
            let receiver: Receiver<Job> = receiver.clone();
            let handle = std::thread::Builder::new()
                .name(format!("script-worker-{i}"))
                .spawn(move || worker_loop(receiver))
                .expect("failed to spawn script worker");
            workers.push(handle);
        }
        info!(workers = worker_count, "executor started");

        Self {
            core,
            pool: Arc::new(ContextPool::new(evaluator)),
            config,
            workers: Mutex::new(workers),
        }
    }

    /// Dispatch one execution of `script`
    pub fn execute(
        &self,
        script: Arc<Script>,
        params: ScriptParams,
        handler: Arc<dyn ScriptHandler>,
    ) -> Result<Arc<Runner>> {
        self.dispatch(script, params, handler, None)
    }

    /// Dispatch one execution with a debugger attached
    pub fn execute_with_debugger(
        &self,
        script: Arc<Script>,
        params: ScriptParams,
        handler: Arc<dyn ScriptHandler>,
        debugger: Arc<dyn ScriptDebugger>,
    ) -> Result<Arc<Runner>> {
        self.dispatch(script, params, handler, Some(debugger))
    }

    fn dispatch(
        &self,
        script: Arc<Script>,
        params: ScriptParams,
        handler: Arc<dyn ScriptHandler>,
        debugger: Option<Arc<dyn ScriptDebugger>>,
    ) -> Result<Arc<Runner>> {
        if self.core.shutdown.load(Ordering::SeqCst) {
            return Err(RuntimeError::ExecutorShutdown);
        }

        let runner = Runner::new(
            script,
            params,
            handler,
            debugger,
            self.pool.clone(),
            Arc::downgrade(&self.core),
        );

        {
            let mut inflight = self.core.inflight.lock().unwrap();
            *inflight += 1;
        }
        self.core
            .live
            .lock()
            .unwrap()
            .push(Arc::downgrade(&runner));

        let sent = {
            let jobs = self.core.jobs.lock().unwrap();
            match jobs.as_ref() {
                Some(sender) => sender.send(Job::Execute(runner.clone())).is_ok(),
                None => false,
            }
        };
        if !sent {
            self.core.runner_finished();
            return Err(RuntimeError::ExecutorShutdown);
        }
        Ok(runner)
    }

    /// Number of executions not yet terminal (suspended ones included)
    pub fn in_flight(&self) -> usize {
        *self.core.inflight.lock().unwrap()
    }

    /// Stop accepting work, wait out the grace period, cancel stragglers.
    ///
    /// Returns the number of executions that had to be cancelled. Resumes of
    /// already in-flight executions are still honored during the grace
    /// period. Idempotent.
    pub fn shutdown(&self) -> usize {
        if self.core.shutdown.swap(true, Ordering::SeqCst) {
            return 0;
        }
        info!("executor shutting down");

        let deadline = Instant::now() + Duration::from_millis(self.config.shutdown_timeout_ms);
        {
            let mut inflight = self.core.inflight.lock().unwrap();
            while *inflight > 0 {
                let now = Instant::now();
                if now >= deadline {
                    break;
                }
                let (guard, _) = self
                    .core
                    .idle
                    .wait_timeout(inflight, deadline - now)
                    .unwrap();
                inflight = guard;
            }
        }

        // Whatever outlived the grace period gets cancelled.
        let stragglers: Vec<Arc<Runner>> = {
            let live = self.core.live.lock().unwrap();
            live.iter().filter_map(|w| w.upgrade()).collect()
        };
        let mut cancelled = 0;
        for runner in stragglers {
            if !runner.is_done() {
                warn!(script = runner.script().name(), "cancelling at shutdown");
                runner.cancel();
                cancelled += 1;
            }
        }

        // Close the queue; workers drain remaining jobs and exit.
        self.core.jobs.lock().unwrap().take();
        let workers = std::mem::take(&mut *self.workers.lock().unwrap());
        for handle in workers {
            let _ = handle.join();
        }
        debug!(cancelled, "executor stopped");
        cancelled
    }
}

impl Drop for Executor {
    fn drop(&mut self) {
        self.shutdown();
    }
}

fn worker_loop(receiver: Receiver<Job>) {
    for job in receiver {
        match job {
            Job::Execute(runner) => runner.execute(),
            Job::Resume(runner) => runner.resume(),
        }
    }
    trace!("worker exiting");
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::channel::mock::{ManualChannel, MockChannel};
    use crate::channel::Channel;
    use crate::expr::RhaiEvaluator;
    use crate::script::instruction::{Instruction, InstructionKind};
    use crate::script::runner::RunnerState;
    use crate::types::{Attribute, AttributeType, Sample, Value};

    enum Outcome {
        Complete(Vec<Sample>),
        Error(RuntimeError),
    }

    struct Notify(Sender<Outcome>);

    impl ScriptHandler for Notify {
        fn complete(&self, _script: &Arc<Script>, samples: Vec<Sample>) {
            let _ = self.0.send(Outcome::Complete(samples));
        }

        fn error(&self, _script: &Arc<Script>, error: RuntimeError) {
            let _ = self.0.send(Outcome::Error(error));
        }
    }

    fn executor(workers: usize) -> Executor {
        Executor::new(
            ExecutorConfig {
                workers,
                shutdown_timeout_ms: 200,
            },
            Arc::new(RhaiEvaluator::new()),
        )
    }

    fn emitting_script() -> Arc<Script> {
        let stop = Instruction::new(InstructionKind::Stop, None);
        let emit = Instruction::new(InstructionKind::Emit, Some(stop));
        let put = Instruction::new(
            InstructionKind::Put {
                slot: 0,
                ty: AttributeType::Integer,
                expression: "6 * 7".to_string(),
            },
            Some(emit),
        );
        Arc::new(Script::new(
            "emitting".to_string(),
            put,
            vec![Attribute::new("answer", AttributeType::Integer)],
            Vec::new(),
        ))
    }

    fn submitting_script(channel: Arc<dyn Channel>) -> Arc<Script> {
        let stop = Instruction::new(InstructionKind::Stop, None);
        let submit = Instruction::new(
            InstructionKind::Submit {
                channel,
                request: "read".to_string(),
                parameters: Vec::new(),
                result: None,
            },
            Some(stop),
        );
        Arc::new(Script::new(
            "submitting".to_string(),
            submit,
            Vec::new(),
            Vec::new(),
        ))
    }

    fn wait_for<F: Fn() -> bool>(what: &str, cond: F) {
        let deadline = Instant::now() + Duration::from_secs(5);
        while !cond() {
            assert!(Instant::now() < deadline, "timed out waiting for {what}");
            std::thread::sleep(Duration::from_millis(5));
        }
    }

    #[test]
    fn test_execute_delivers_on_worker() {
        let exec = executor(2);
        let (tx, rx) = unbounded();
        exec.execute(emitting_script(), ScriptParams::new(), Arc::new(Notify(tx)))
            .unwrap();

        match rx.recv_timeout(Duration::from_secs(5)).unwrap() {
            Outcome::Complete(samples) => {
                assert_eq!(samples.len(), 1);
                assert_eq!(samples[0].value(0), Some(&Value::Integer(42)));
            }
            Outcome::Error(e) => panic!("unexpected error: {e}"),
        }
        wait_for("in-flight drain", || exec.in_flight() == 0);
    }

    #[test]
    fn test_resume_is_dispatched_through_pool() {
        let exec = executor(2);
        let channel = Arc::new(ManualChannel::new());
        let (tx, rx) = unbounded();
        let runner = exec
            .execute(
                submitting_script(channel.clone()),
                ScriptParams::new(),
                Arc::new(Notify(tx)),
            )
            .unwrap();

        wait_for("suspension", || runner.is_suspended());
        assert_eq!(exec.in_flight(), 1);

        assert!(channel.complete_next(None));
        match rx.recv_timeout(Duration::from_secs(5)).unwrap() {
            Outcome::Complete(_) => {}
            Outcome::Error(e) => panic!("unexpected error: {e}"),
        }
        assert_eq!(runner.state(), RunnerState::Stopped);
    }

    #[test]
    fn test_many_concurrent_executions() {
        let exec = executor(4);
        let channel = Arc::new(MockChannel::new("c0").with_delay(Duration::from_millis(1)));
        let channel: Arc<dyn Channel> = channel;
        let script = submitting_script(channel);

        let (tx, rx) = unbounded();
        for _ in 0..50 {
            exec.execute(script.clone(), ScriptParams::new(), Arc::new(Notify(tx.clone())))
                .unwrap();
        }
        for _ in 0..50 {
            match rx.recv_timeout(Duration::from_secs(5)).unwrap() {
                Outcome::Complete(_) => {}
                Outcome::Error(e) => panic!("unexpected error: {e}"),
            }
        }
        wait_for("in-flight drain", || exec.in_flight() == 0);
    }

    #[test]
    fn test_shutdown_refuses_new_work() {
        let exec = executor(1);
        exec.shutdown();
        let (tx, _rx) = unbounded();
        let err = exec
            .execute(emitting_script(), ScriptParams::new(), Arc::new(Notify(tx)))
            .unwrap_err();
        assert!(matches!(err, RuntimeError::ExecutorShutdown));
    }

    #[test]
    fn test_shutdown_cancels_stuck_execution() {
        let exec = executor(1);
        let channel = Arc::new(ManualChannel::new());
        let (tx, rx) = unbounded();
        let runner = exec
            .execute(
                submitting_script(channel.clone()),
                ScriptParams::new(),
                Arc::new(Notify(tx)),
            )
            .unwrap();

        wait_for("suspension", || runner.is_suspended());

        // The channel never answers; shutdown must cancel after the grace
        // period rather than hang.
        let cancelled = exec.shutdown();
        assert_eq!(cancelled, 1);
        match rx.recv_timeout(Duration::from_secs(5)).unwrap() {
            Outcome::Error(RuntimeError::Cancelled(_)) => {}
            Outcome::Error(e) => panic!("unexpected error: {e}"),
            Outcome::Complete(_) => panic!("unexpected completion"),
        }

        // The parked transport callback fires into the closed executor and
        // is discarded.
        assert!(channel.complete_next(None));
        assert_eq!(runner.state(), RunnerState::Cancelled);
    }

    #[test]
    fn test_shutdown_waits_for_in_flight() {
        let exec = Executor::new(
            ExecutorConfig {
                workers: 2,
                shutdown_timeout_ms: 2_000,
            },
            Arc::new(RhaiEvaluator::new()),
        );
        // Mock channels answer with a default completion after the delay.
        let channel: Arc<dyn Channel> =
            Arc::new(MockChannel::new("c0").with_delay(Duration::from_millis(20)));
        let (tx, rx) = unbounded();
        for _ in 0..5 {
            exec.execute(
                submitting_script(channel.clone()),
                ScriptParams::new(),
                Arc::new(Notify(tx.clone())),
            )
            .unwrap();
        }

        let cancelled = exec.shutdown();
        assert_eq!(cancelled, 0);
        assert_eq!(rx.try_iter().count(), 5);
    }
}
