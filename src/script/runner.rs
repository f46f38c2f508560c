//! Script execution state machine
//!
//! A [`Runner`] owns exactly one execution of one script: its program
//! counter, execution context, and lifecycle state. Runners are driven by
//! the [`executor`](crate::script::executor)'s workers and park themselves
//! whenever a submit instruction is waiting on channel I/O.
//!
//! ## Locking
//!
//! Two locks with distinct jobs:
//!
//! - the **run lock** serializes instruction stepping; it is held for the
//!   whole of `execute`/`resume` so at most one thread advances the program
//!   counter at a time.
//! - the **state lock** guards lifecycle transitions only and is never held
//!   while stepping, so `cancel` and state queries stay responsive while a
//!   script runs.
//!
//! `cancel` never waits on the run lock while holding the state lock, which
//! rules out deadlock between a cancelling thread and the run thread.
//!
//! ## Terminal notification
//!
//! Exactly one of `ScriptHandler::complete` / `ScriptHandler::error` fires
//! per runner. Whichever thread wins the transition into a terminal state
//! owns the notification: the run thread for normal completion, failure and
//! cancel-while-running; the cancelling thread for cancel-while-new and
//! cancel-while-suspended.

use crate::channel::{Channel, IoHandler, IoRequest, Payload};
use crate::error::RuntimeError;
use crate::script::context::{ContextPool, ExecutionContext};
use crate::script::executor::ExecutorCore;
use crate::script::instruction::{
    ExecEnv, Instruction, InstructionServices, IoOutcome, Step,
};
use crate::script::{Script, ScriptDebugger, ScriptHandler, ScriptParams};
use std::sync::{Arc, Mutex, Weak};
use tracing::{debug, trace, warn};

/// Lifecycle state of one script execution
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunnerState {
    /// Created but not yet dispatched
    New,
    /// A worker is stepping instructions
    Running,
    /// Parked on an in-flight I/O request
    Suspended,
    /// Ran to its stop instruction
    Stopped,
    /// Cancelled, or failed with an error
    Cancelled,
}

impl RunnerState {
    pub fn is_terminal(self) -> bool {
        matches!(self, RunnerState::Stopped | RunnerState::Cancelled)
    }
}

/// What `cancel` decided under the state lock
enum CancelAction {
    /// The cancelling thread delivers the notification
    Notify,
    /// A worker is mid-step; it observes the state and notifies
    RunThreadNotifies,
    /// Already terminal
    AlreadyDone,
}

/// Program counter and context, guarded by the run lock
struct RunState {
    pc: Option<Arc<Instruction>>,
    context: Option<ExecutionContext>,
}

/// One execution of one script
pub struct Runner {
    script: Arc<Script>,
    handler: Arc<dyn ScriptHandler>,
    debugger: Option<Arc<dyn ScriptDebugger>>,
    pool: Arc<ContextPool>,
    executor: Weak<ExecutorCore>,
    state: Mutex<RunnerState>,
    run: Mutex<RunState>,
    /// Outcome of the in-flight submit, posted by the channel callback
    io: Mutex<Option<IoOutcome>>,
}

impl Runner {
    pub(crate) fn new(
        script: Arc<Script>,
        params: ScriptParams,
        handler: Arc<dyn ScriptHandler>,
        debugger: Option<Arc<dyn ScriptDebugger>>,
        pool: Arc<ContextPool>,
        executor: Weak<ExecutorCore>,
    ) -> Arc<Self> {
        let mut context = pool.acquire();
        context.prepare(script.emit_attributes_arc().clone(), params);
        let entry = script.entry().clone();
        Arc::new(Self {
            script,
            handler,
            debugger,
            pool,
            executor,
            state: Mutex::new(RunnerState::New),
            run: Mutex::new(RunState {
                pc: Some(entry),
                context: Some(context),
            }),
            io: Mutex::new(None),
        })
    }

    pub fn script(&self) -> &Arc<Script> {
        &self.script
    }

    pub fn state(&self) -> RunnerState {
        *self.state.lock().unwrap()
    }

    pub fn is_done(&self) -> bool {
        self.state().is_terminal()
    }

    pub fn is_suspended(&self) -> bool {
        self.state() == RunnerState::Suspended
    }

    fn transition(&self, from: RunnerState, to: RunnerState) -> bool {
        let mut state = self.state.lock().unwrap();
        if *state == from {
            *state = to;
            true
        } else {
            false
        }
    }

    /// First dispatch, called by a worker thread
    pub(crate) fn execute(self: &Arc<Self>) {
        if !self.transition(RunnerState::New, RunnerState::Running) {
            // Cancelled before dispatch; the cancelling thread notified.
            trace!(script = self.script.name(), "skipping cancelled runner");
            return;
        }
        let mut run = self.run.lock().unwrap();
        trace!(script = self.script.name(), "execution started");
        self.run_loop(&mut run);
    }

    /// Re-dispatch after an I/O outcome was posted
    pub(crate) fn resume(self: &Arc<Self>) {
        let mut run = self.run.lock().unwrap();
        if !self.transition(RunnerState::Suspended, RunnerState::Running) {
            // Cancelled while parked; the outcome is discarded.
            trace!(script = self.script.name(), "dropping resume of cancelled runner");
            return;
        }
        trace!(script = self.script.name(), "execution resumed");
        self.run_loop(&mut run);
    }

    /// Step instructions until the execution parks or terminates
    fn run_loop(self: &Arc<Self>, run: &mut RunState) {
        loop {
            if self.state() == RunnerState::Cancelled {
                self.finish_cancelled(run);
                return;
            }

            let Some(instruction) = run.pc.clone() else {
                // The compiler guarantees a terminal stop instruction, so a
                // dangling program counter is a bug in graph construction.
                self.finish_error(
                    run,
                    RuntimeError::Script("instruction graph ended without a stop".to_string()),
                );
                return;
            };

            let Some(context) = run.context.as_mut() else {
                self.finish_error(
                    run,
                    RuntimeError::Script("execution context already recycled".to_string()),
                );
                return;
            };

            let mut io = self.io.lock().unwrap().take();
            let services = RunnerServices { runner: self };
            let step = {
                let mut env = ExecEnv {
                    context,
                    io: &mut io,
                    services: &services,
                };
                instruction.execute(&mut env)
            };

            match step {
                Ok(Step::Next(next)) => run.pc = next,
                Ok(Step::Stop) => {
                    self.finish_complete(run);
                    return;
                }
                Ok(Step::Suspend) => {
                    // The program counter stays on the submit instruction;
                    // the resumed visit consumes the posted outcome.
                    if !self.transition(RunnerState::Running, RunnerState::Suspended) {
                        self.finish_cancelled(run);
                    }
                    return;
                }
                Err(e) => {
                    self.finish_error(run, e);
                    return;
                }
            }
        }
    }

    /// Cancel this execution.
    ///
    /// Idempotent. A suspended execution is cancelled immediately; its
    /// channel callback may still fire later, but the posted outcome is
    /// discarded. A running execution observes the cancellation at its next
    /// instruction boundary.
    pub fn cancel(&self) {
        let action = {
            let mut state = self.state.lock().unwrap();
            match *state {
                RunnerState::New | RunnerState::Suspended => {
                    *state = RunnerState::Cancelled;
                    CancelAction::Notify
                }
                RunnerState::Running => {
                    *state = RunnerState::Cancelled;
                    CancelAction::RunThreadNotifies
                }
                RunnerState::Stopped | RunnerState::Cancelled => CancelAction::AlreadyDone,
            }
        };

        match action {
            CancelAction::Notify => {
                let mut run = self.run.lock().unwrap();
                self.finish_cancelled(&mut run);
            }
            CancelAction::RunThreadNotifies => {
                debug!(script = self.script.name(), "cancel requested mid-run");
            }
            CancelAction::AlreadyDone => {}
        }
    }

    /// Channel callback entry point: park the outcome and re-dispatch
    fn resume_with(self: &Arc<Self>, outcome: IoOutcome) {
        *self.io.lock().unwrap() = Some(outcome);
        match self.executor.upgrade() {
            Some(executor) => executor.enqueue_resume(self.clone()),
            // No executor (standalone runner, or shutdown finished): resume
            // on the calling thread.
            None => self.resume(),
        }
    }

    // ── Terminal transitions; each fires its handler callback exactly once ──

    fn finish_complete(&self, run: &mut RunState) {
        if !self.transition(RunnerState::Running, RunnerState::Stopped) {
            // A cancel won the race mid-step.
            self.finish_cancelled(run);
            return;
        }
        run.pc = None;
        let samples = run
            .context
            .as_mut()
            .map(|c| c.take_samples())
            .unwrap_or_default();
        self.recycle(run);
        debug!(
            script = self.script.name(),
            samples = samples.len(),
            "script completed"
        );
        self.handler.complete(&self.script, samples);
        self.notify_finished();
    }

    fn finish_error(&self, run: &mut RunState, error: RuntimeError) {
        if !self.transition(RunnerState::Running, RunnerState::Cancelled) {
            self.finish_cancelled(run);
            return;
        }
        run.pc = None;
        self.recycle(run);
        warn!(script = self.script.name(), error = %error, "script failed");
        self.handler.error(&self.script, error);
        self.notify_finished();
    }

    /// Deliver the cancellation callback; the state is already `Cancelled`
    /// and this thread owns the notification.
    fn finish_cancelled(&self, run: &mut RunState) {
        run.pc = None;
        self.recycle(run);
        debug!(script = self.script.name(), "script cancelled");
        self.handler
            .error(&self.script, RuntimeError::Cancelled(self.script.name().to_string()));
        self.notify_finished();
    }

    fn recycle(&self, run: &mut RunState) {
        if let Some(context) = run.context.take() {
            self.pool.release(context);
        }
    }

    fn notify_finished(&self) {
        if let Some(executor) = self.executor.upgrade() {
            executor.runner_finished();
        }
    }
}

impl std::fmt::Debug for Runner {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Runner")
            .field("script", &self.script.name())
            .field("state", &self.state())
            .finish()
    }
}

/// Instruction-side view of the runner
struct RunnerServices<'a> {
    runner: &'a Arc<Runner>,
}

impl InstructionServices for RunnerServices<'_> {
    fn submit(&self, channel: &Arc<dyn Channel>, request: IoRequest) {
        trace!(
            script = self.runner.script.name(),
            channel = channel.id(),
            request = request.name.as_str(),
            "submitting i/o request"
        );
        let handler: Arc<dyn IoHandler> = Arc::new(RunnerIoHandler {
            runner: self.runner.clone(),
        });
        channel.submit(request, handler);
    }

    fn breakpoint(&self, context: &ExecutionContext) {
        if let Some(debugger) = &self.runner.debugger {
            debugger.breakpoint(&self.runner.script, context);
        }
    }
}

/// Channel completion callback bound to one suspended execution
struct RunnerIoHandler {
    runner: Arc<Runner>,
}

impl IoHandler for RunnerIoHandler {
    fn complete(&self, _request: &IoRequest, payload: Option<Payload>) {
        self.runner.resume_with(Ok(payload));
    }

    fn error(&self, _request: &IoRequest, cause: RuntimeError) {
        self.runner.resume_with(Err(cause));
    }
}
