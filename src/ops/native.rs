//! Device-driven periodic operations
//!
//! The device owns the clock: a start script tells it to begin sampling at
//! the arbitrated period, and it pushes messages until a stop script turns
//! it off. Pushed messages arrive as partial updates; each registered
//! message script writes its slice of a composite value vector, and the
//! message type marked synchronizing closes a round by snapshotting the
//! composite into a sample for every task.
//!
//! Period changes go through a stop/start cycle, since the device only
//! reads its period at start time. Requests that arrive mid-transition are
//! absorbed into the pending period, so a burst of schedule calls costs at
//! most one extra cycle.

use crate::channel::{ChannelManager, Mapper, Message, MessageCallback};
use crate::error::RuntimeError;
use crate::ops::{
    fan_out_error, required_period, Operation, OperationCore, RemoveOutcome, SamplePipeline,
    Task, TaskHandler, PERIOD_PARAM,
};
use crate::script::executor::Executor;
use crate::script::{Script, ScriptHandler, ScriptParams};
use crate::types::{Attribute, Sample, Value};
use std::sync::{Arc, Mutex, Weak};
use tracing::{debug, warn};

/// Lifecycle of the device-side sampling
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NativeState {
    /// Device idle, no start issued
    Stopped,
    /// Start script in flight
    Starting,
    /// Device sampling at the current period
    Running,
    /// Stop script in flight
    Stopping,
}

/// One pushed message type and the script that folds it into the composite
pub struct MessageScript {
    pub mapper: Arc<dyn Mapper>,
    pub script: Arc<Script>,
    /// A push of this type closes the sampling round: after merging, the
    /// composite is snapshotted and delivered to every task
    pub synchronizing: bool,
}

struct MessageRoute {
    mapper: Arc<dyn Mapper>,
    script: Arc<Script>,
    synchronizing: bool,
    /// Emit slot i of the script maps to composite slot `slots[i]`; None
    /// for emitted attributes the operation does not expose
    slots: Vec<Option<usize>>,
}

struct NativeInner {
    state: NativeState,
    /// Period the device is currently sampling at; 0 outside Running
    current_period: u64,
    /// Period the next start will use; absorbed while a transition is in
    /// flight
    pending_period: u64,
    /// Message callbacks are live exactly while the device runs
    registered: bool,
    stop_waiters: Vec<Box<dyn FnOnce(u64) + Send>>,
}

/// Next device command decided under the state lock, issued after it
enum DeviceCommand {
    Start(u64),
    Stop,
    None,
}

#[derive(Debug, Clone, Copy)]
enum Phase {
    Start,
    Stop,
}

/// Samples on the device's own clock, assembled from pushed messages
pub struct NativePeriodicOperation {
    weak: Weak<Self>,
    core: OperationCore,
    start_script: Arc<Script>,
    stop_script: Arc<Script>,
    routes: Vec<MessageRoute>,
    executor: Arc<Executor>,
    channels: Arc<dyn ChannelManager>,
    /// Last known value per attribute slot; Null until first written
    composite: Mutex<Vec<Value>>,
    inner: Mutex<NativeInner>,
}

impl NativePeriodicOperation {
    pub fn new(
        attributes: Vec<Attribute>,
        start_script: Arc<Script>,
        stop_script: Arc<Script>,
        messages: Vec<MessageScript>,
        executor: Arc<Executor>,
        channels: Arc<dyn ChannelManager>,
    ) -> Arc<Self> {
        let routes = messages
            .into_iter()
            .map(|m| {
                let slots = m
                    .script
                    .emit_attributes()
                    .iter()
                    .map(|attr| attributes.iter().position(|a| a == attr))
                    .collect();
                MessageRoute {
                    mapper: m.mapper,
                    script: m.script,
                    synchronizing: m.synchronizing,
                    slots,
                }
            })
            .collect();
        let composite = vec![Value::Null; attributes.len()];
        Arc::new_cyclic(|weak| Self {
            weak: weak.clone(),
            core: OperationCore::new(attributes),
            start_script,
            stop_script,
            routes,
            executor,
            channels,
            composite: Mutex::new(composite),
            inner: Mutex::new(NativeInner {
                state: NativeState::Stopped,
                current_period: 0,
                pending_period: 0,
                registered: false,
                stop_waiters: Vec::new(),
            }),
        })
    }

    pub fn state(&self) -> NativeState {
        self.inner.lock().unwrap().state
    }

    /// Period the device is sampling at; 0 outside Running
    pub fn current_period(&self) -> u64 {
        self.inner.lock().unwrap().current_period
    }

    /// Re-arbitrate the device period from the attached task set; an empty
    /// set winds the device down.
    ///
    /// The fastest requested period is read under the transition lock, so
    /// a racing schedule/remove cannot land a stale value last. Transitions
    /// in flight are never interrupted: the target lands in
    /// `pending_period` and the completing transition picks it up, so each
    /// settled period costs exactly one start.
    fn request_period(&self) {
        let command = {
            let mut inner = self.inner.lock().unwrap();
            let period = self.core.min_period().unwrap_or(0);
            match inner.state {
                NativeState::Stopped if period > 0 => {
                    inner.state = NativeState::Starting;
                    inner.pending_period = period;
                    DeviceCommand::Start(period)
                }
                NativeState::Stopped => DeviceCommand::None,
                NativeState::Starting | NativeState::Stopping => {
                    inner.pending_period = period;
                    DeviceCommand::None
                }
                NativeState::Running if period != inner.current_period => {
                    inner.pending_period = period;
                    inner.state = NativeState::Stopping;
                    DeviceCommand::Stop
                }
                NativeState::Running => DeviceCommand::None,
            }
        };
        self.issue(command);
    }

    fn issue(&self, command: DeviceCommand) {
        let (script, params, phase) = match command {
            DeviceCommand::None => return,
            DeviceCommand::Start(period) => {
                debug!(operation = self.core.id(), period, "starting device sampling");
                let mut params = ScriptParams::new();
                params.insert(PERIOD_PARAM.to_string(), Value::Integer(period as i64));
                (self.start_script.clone(), params, Phase::Start)
            }
            DeviceCommand::Stop => {
                debug!(operation = self.core.id(), "stopping device sampling");
                (self.stop_script.clone(), ScriptParams::new(), Phase::Stop)
            }
        };
        let handler = Arc::new(LifecycleHandler {
            operation: self.weak.clone(),
            phase,
        });
        if let Err(e) = self.executor.execute(script, params, handler) {
            self.lifecycle_failed(e);
        }
    }

    fn lifecycle_complete(&self, phase: Phase) {
        let mut command = DeviceCommand::None;
        let mut waiters = Vec::new();
        let mut register = false;
        let mut deregister = false;
        let mut running_at = None;
        {
            let mut inner = self.inner.lock().unwrap();
            match phase {
                Phase::Start => {
                    if inner.pending_period == 0 {
                        // Everyone left while the start was in flight.
                        inner.state = NativeState::Stopping;
                        command = DeviceCommand::Stop;
                    } else {
                        inner.state = NativeState::Running;
                        inner.current_period = inner.pending_period;
                        running_at = Some(inner.current_period);
                        if !inner.registered {
                            inner.registered = true;
                            register = true;
                        }
                    }
                }
                Phase::Stop => {
                    if inner.pending_period > 0 {
                        inner.state = NativeState::Starting;
                        command = DeviceCommand::Start(inner.pending_period);
                    } else {
                        inner.state = NativeState::Stopped;
                        inner.current_period = 0;
                        if inner.registered {
                            inner.registered = false;
                            deregister = true;
                        }
                        waiters = std::mem::take(&mut inner.stop_waiters);
                    }
                }
            }
        }
        if register {
            self.register_routes();
        }
        if deregister {
            self.deregister_routes();
        }
        if let Some(period) = running_at {
            debug!(operation = self.core.id(), period, "device sampling");
            for task in self.core.tasks() {
                task.set_input_period(period);
            }
        }
        self.issue(command);
        for waiter in waiters {
            waiter(self.core.id());
        }
    }

    /// A start or stop script failed: the operation is finished for good
    fn lifecycle_failed(&self, cause: RuntimeError) {
        let (deregister, waiters) = {
            let mut inner = self.inner.lock().unwrap();
            inner.state = NativeState::Stopped;
            inner.current_period = 0;
            inner.pending_period = 0;
            let deregister = std::mem::take(&mut inner.registered);
            (deregister, std::mem::take(&mut inner.stop_waiters))
        };
        if deregister {
            self.deregister_routes();
        }
        let tasks = self.core.shut_down();
        if !tasks.is_empty() {
            fan_out_error(self.core.id(), tasks, cause);
        } else {
            warn!(operation = self.core.id(), error = %cause, "device transition failed");
        }
        for waiter in waiters {
            waiter(self.core.id());
        }
    }

    /// A message script failed: drain the tasks and wind the device down
    fn unrecoverable(&self, cause: RuntimeError) {
        let tasks = self.core.shut_down();
        if tasks.is_empty() {
            // Already shut down by a racing failure.
            return;
        }
        warn!(operation = self.core.id(), "message handling failed, shutting down");
        fan_out_error(self.core.id(), tasks, cause);
        self.request_period();
    }

    fn register_routes(&self) {
        for (idx, route) in self.routes.iter().enumerate() {
            self.channels.add_callback(
                route.mapper.clone(),
                Arc::new(RouteCallback {
                    operation: self.weak.clone(),
                    route: idx,
                }),
            );
        }
    }

    fn deregister_routes(&self) {
        for route in &self.routes {
            self.channels.remove_callback(route.mapper.message_type());
        }
    }

    fn handle_message(self: Arc<Self>, route: usize, message: Message) {
        if self.inner.lock().unwrap().state != NativeState::Running {
            // A push raced the stop; drop it.
            return;
        }
        let Some(entry) = self.routes.get(route) else {
            return;
        };
        let mut params = ScriptParams::new();
        params.insert("message".to_string(), message.to_value());
        let handler = Arc::new(MessageHandler {
            operation: self.weak.clone(),
            route,
        });
        if let Err(e) = self.executor.execute(entry.script.clone(), params, handler) {
            self.unrecoverable(e);
        }
    }

    /// Merge a message script's output into the composite; a synchronizing
    /// route closes the round and fans the snapshot out
    fn absorb(&self, route: usize, samples: Vec<Sample>) {
        let Some(entry) = self.routes.get(route) else {
            return;
        };
        let snapshot = {
            let mut composite = self.composite.lock().unwrap();
            for sample in &samples {
                for (i, value) in sample.values().iter().enumerate() {
                    if let Some(slot) = entry.slots.get(i).copied().flatten() {
                        composite[slot] = value.clone();
                    }
                }
            }
            entry.synchronizing.then(|| composite.clone())
        };
        if let Some(values) = snapshot {
            let sample = Sample::new(self.core.attributes_arc().clone(), values);
            for task in self.core.tasks() {
                task.deliver(&sample);
            }
        }
    }
}

impl Operation for NativePeriodicOperation {
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
        debug!(operation = self.id(), period, "native task scheduled");
        {
            let inner = self.inner.lock().unwrap();
            if inner.state == NativeState::Running {
                task.set_input_period(inner.current_period);
            }
        }
        self.request_period();
        Ok(task)
    }

    fn remove_task(&self, task: &Arc<Task>) {
        match self.core.remove_task(task) {
            RemoveOutcome::NotFound => {}
            // Covers both cases: with tasks left the period may relax, an
            // empty set winds the device down (it stays schedulable).
            RemoveOutcome::Empty | RemoveOutcome::Remaining => self.request_period(),
        }
    }

    fn stop(&self, on_stopped: Box<dyn FnOnce(u64) + Send>) {
        let tasks = self.core.shut_down();
        for task in tasks {
            task.finish();
        }
        let mut on_stopped = Some(on_stopped);
        {
            let mut inner = self.inner.lock().unwrap();
            if inner.state != NativeState::Stopped {
                inner.pending_period = 0;
                if let Some(waiter) = on_stopped.take() {
                    inner.stop_waiters.push(waiter);
                }
            }
        }
        match on_stopped {
            // Device already idle.
            Some(waiter) => waiter(self.core.id()),
            // The task set is drained, so this targets period 0.
            None => self.request_period(),
        }
    }
}

/// Bridges one start or stop execution back to the state machine
struct LifecycleHandler {
    operation: Weak<NativePeriodicOperation>,
    phase: Phase,
}

impl ScriptHandler for LifecycleHandler {
    fn complete(&self, _script: &Arc<Script>, _samples: Vec<Sample>) {
        if let Some(operation) = self.operation.upgrade() {
            operation.lifecycle_complete(self.phase);
        }
    }

    fn error(&self, _script: &Arc<Script>, error: RuntimeError) {
        if let Some(operation) = self.operation.upgrade() {
            operation.lifecycle_failed(error);
        }
    }
}

/// Bridges one message script execution back to the composite
struct MessageHandler {
    operation: Weak<NativePeriodicOperation>,
    route: usize,
}

impl ScriptHandler for MessageHandler {
    fn complete(&self, _script: &Arc<Script>, samples: Vec<Sample>) {
        if let Some(operation) = self.operation.upgrade() {
            operation.absorb(self.route, samples);
        }
    }

    fn error(&self, _script: &Arc<Script>, error: RuntimeError) {
        if let Some(operation) = self.operation.upgrade() {
            operation.unrecoverable(error);
        }
    }
}

struct RouteCallback {
    operation: Weak<NativePeriodicOperation>,
    route: usize,
}

impl MessageCallback for RouteCallback {
    fn on_message(&self, message: Message) {
        if let Some(operation) = self.operation.upgrade() {
            operation.handle_message(self.route, message);
        }
    }
}
