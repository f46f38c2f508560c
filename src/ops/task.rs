//! Tasks: one consumer's subscription to an operation
//!
//! A [`Task`] is handed out by `Operation::schedule` and stays alive until
//! the consumer stops it or the operation shuts it down. Samples flow
//! through the task's [`Downsampler`] (periodic tasks only) and
//! [`SamplePipeline`] before reaching the consumer's [`TaskHandler`].

use crate::error::RuntimeError;
use crate::ops::{Operation, SamplePipeline};
use crate::types::{Attribute, Sample};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, Weak};
use tracing::debug;

/// Consumer callbacks for one task
///
/// Callbacks arrive on runtime threads and must not block. After `complete`
/// or an error, no further `data` calls are made for the task.
pub trait TaskHandler: Send + Sync {
    /// One sample, already downsampled and pipelined
    fn data(&self, task: &Arc<Task>, sample: Sample);

    /// The task ended cleanly (one-shot finished, or the operation stopped)
    fn complete(&self, task: &Arc<Task>);

    /// The task failed
    fn error(&self, task: &Arc<Task>, error: RuntimeError);

    /// The whole operation failed; every task of the operation gets this.
    /// Defaults to the plain error callback.
    fn operation_error(&self, task: &Arc<Task>, error: RuntimeError) {
        self.error(task, error);
    }
}

/// Drops samples so a task sees (approximately) its requested rate
///
/// The operation samples at the fastest period any of its tasks asked for;
/// tasks that asked for a slower rate admit every `ratio`-th sample. The
/// ratio is the requested-to-input period quotient rounded half-to-even,
/// never below 1; the relative error between the delivered and requested
/// rate is exposed so consumers can judge the approximation.
#[derive(Debug)]
pub struct Downsampler {
    ratio: u64,
    count: u64,
    error: f64,
}

impl Downsampler {
    /// `input_period` is the operation's actual sampling period,
    /// `output_period` the task's requested one; both in milliseconds, > 0
    pub fn new(input_period: u64, output_period: u64) -> Self {
        let ratio = (output_period as f64 / input_period as f64)
            .round_ties_even()
            .max(1.0) as u64;
        let delivered = ratio as f64 * input_period as f64;
        let error = (delivered - output_period as f64) / output_period as f64;
        Self {
            ratio,
            count: 0,
            error,
        }
    }

    /// Whether the next sample passes; admits the first, then every
    /// `ratio`-th
    pub fn admit(&mut self) -> bool {
        let admitted = self.count == 0;
        self.count = (self.count + 1) % self.ratio;
        admitted
    }

    pub fn ratio(&self) -> u64 {
        self.ratio
    }

    /// Relative rate error in percent; negative when samples arrive faster
    /// than requested
    pub fn error_percent(&self) -> f64 {
        self.error * 100.0
    }
}

/// One consumer's live subscription to an operation
pub struct Task {
    operation: Weak<dyn Operation>,
    handler: Arc<dyn TaskHandler>,
    pipeline: SamplePipeline,
    running: AtomicBool,
    /// Requested sampling period in ms; 0 for event-driven and one-shot
    /// tasks
    requested_period: u64,
    /// Present while the operation samples at a faster period than
    /// requested; rebuilt whenever the operation's period changes
    downsampler: Mutex<Option<Downsampler>>,
}

impl Task {
    pub(crate) fn new(
        operation: Weak<dyn Operation>,
        handler: Arc<dyn TaskHandler>,
        pipeline: SamplePipeline,
        requested_period: u64,
    ) -> Arc<Self> {
        Arc::new(Self {
            operation,
            handler,
            pipeline,
            running: AtomicBool::new(true),
            requested_period,
            downsampler: Mutex::new(None),
        })
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    pub fn requested_period(&self) -> u64 {
        self.requested_period
    }

    /// Attributes of the samples this task delivers, in slot order
    pub fn attributes(&self) -> &[Attribute] {
        self.pipeline.attributes()
    }

    /// Relative rate error of the current downsampling, in percent; 0 when
    /// no downsampling applies
    pub fn error_percent(&self) -> f64 {
        self.downsampler
            .lock()
            .unwrap()
            .as_ref()
            .map(Downsampler::error_percent)
            .unwrap_or(0.0)
    }

    /// Stop receiving samples and detach from the operation
    pub fn stop(self: &Arc<Self>) {
        if self.running.swap(false, Ordering::SeqCst) {
            debug!("task stopped by consumer");
            self.handler.complete(self);
            if let Some(operation) = self.operation.upgrade() {
                operation.remove_task(self);
            }
        }
    }

    /// Rebuild the downsampler for a new operation sampling period
    pub(crate) fn set_input_period(&self, input_period: u64) {
        let mut downsampler = self.downsampler.lock().unwrap();
        *downsampler = if input_period > 0 && self.requested_period > 0 {
            Some(Downsampler::new(input_period, self.requested_period))
        } else {
            None
        };
    }

    /// Deliver one raw sample, subject to downsampling and the pipeline
    pub(crate) fn deliver(self: &Arc<Self>, sample: &Sample) {
        if !self.running.load(Ordering::SeqCst) {
            return;
        }
        if let Some(downsampler) = self.downsampler.lock().unwrap().as_mut() {
            if !downsampler.admit() {
                return;
            }
        }
        let sample = self.pipeline.process(sample);
        self.handler.data(self, sample);
    }

    /// Operation-side clean stop
    pub(crate) fn finish(self: &Arc<Self>) {
        if self.running.swap(false, Ordering::SeqCst) {
            self.handler.complete(self);
        }
    }

    /// Task-scoped failure
    pub(crate) fn fail(self: &Arc<Self>, error: RuntimeError) {
        if self.running.swap(false, Ordering::SeqCst) {
            self.handler.error(self, error);
        }
    }

    /// Operation-wide failure fan-out
    pub(crate) fn fail_operation(self: &Arc<Self>, error: RuntimeError) {
        if self.running.swap(false, Ordering::SeqCst) {
            self.handler.operation_error(self, error);
        }
    }
}

impl std::fmt::Debug for Task {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Task")
            .field("running", &self.is_running())
            .field("requested_period", &self.requested_period)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn test_downsampler_half_rate() {
        let mut ds = Downsampler::new(100, 200);
        assert_eq!(ds.ratio(), 2);
        assert_eq!(ds.error_percent(), 0.0);

        let admitted = (0..10_000).filter(|_| ds.admit()).count();
        assert_eq!(admitted, 5_000);
    }

    #[test]
    fn test_downsampler_never_below_one() {
        // Requested faster than the input: every sample passes, with a
        // negative rate error.
        let mut ds = Downsampler::new(100, 60);
        assert_eq!(ds.ratio(), 1);
        assert!(ds.error_percent() < 0.0);
        assert!((0..100).all(|_| ds.admit()));
    }

    #[test]
    fn test_downsampler_rounds_ties_to_even() {
        // 150/100 = 1.5 rounds to 2, 250/100 = 2.5 also rounds to 2.
        assert_eq!(Downsampler::new(100, 150).ratio(), 2);
        assert_eq!(Downsampler::new(100, 250).ratio(), 2);
        assert_eq!(Downsampler::new(100, 350).ratio(), 4);
    }

    #[test]
    fn test_downsampler_ratio_wider_than_u32() {
        // A millisecond input against a multi-month output period.
        let output = u32::MAX as u64 * 4;
        let ds = Downsampler::new(1, output);
        assert_eq!(ds.ratio(), output);
        assert_eq!(ds.error_percent(), 0.0);
    }

    #[test]
    fn test_downsampler_error_sign() {
        // ratio 2 at input 100 delivers every 200 ms against 150 requested:
        // +33.3% slower than asked.
        let ds = Downsampler::new(100, 150);
        assert!(ds.error_percent() > 33.0 && ds.error_percent() < 34.0);

        // Exact multiple: no error.
        assert_eq!(Downsampler::new(50, 100).error_percent(), 0.0);
    }

    proptest! {
        #[test]
        fn prop_admits_every_ratio_th_sample(
            input in 1u64..1_000,
            output in 1u64..10_000,
            ticks in 1usize..500,
        ) {
            let mut ds = Downsampler::new(input, output);
            let ratio = ds.ratio() as usize;
            let admitted = (0..ticks).filter(|_| ds.admit()).count();
            prop_assert_eq!(admitted, ticks.div_ceil(ratio));
        }
    }
}
