//! In-memory channel implementations for testing
//!
//! [`MockChannel`] answers submissions from a table of scripted outcomes,
//! either inline or from a background thread. [`ManualChannel`] parks
//! submissions until the test releases them, which is how suspension and
//! cancellation behavior is exercised. [`MockChannelManager`] lets tests
//! push unsolicited messages by hand.

use super::{
    Channel, ChannelManager, IoHandler, IoRequest, Mapper, Message, MessageCallback, Payload,
};
use crate::error::RuntimeError;
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

/// Scripted outcome for one request name
#[derive(Debug, Clone)]
pub enum MockOutcome {
    /// Invoke `complete` with the given payload
    Complete(Option<Payload>),
    /// Invoke `error` with a channel error carrying this text
    Error(String),
}

/// A channel that answers from a table of scripted outcomes
pub struct MockChannel {
    id: String,
    outcomes: Mutex<HashMap<String, MockOutcome>>,
    submissions: Mutex<Vec<IoRequest>>,
    /// When set, outcomes are delivered from a spawned thread after this delay
    delay: Option<Duration>,
}

impl MockChannel {
    pub fn new(id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            outcomes: Mutex::new(HashMap::new()),
            submissions: Mutex::new(Vec::new()),
            delay: None,
        }
    }

    /// Deliver outcomes asynchronously after `delay`
    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = Some(delay);
        self
    }

    /// Script the outcome for requests named `request`
    pub fn on(&self, request: impl Into<String>, outcome: MockOutcome) {
        self.outcomes
            .lock()
            .unwrap()
            .insert(request.into(), outcome);
    }

    /// All requests submitted so far, in order
    pub fn submissions(&self) -> Vec<IoRequest> {
        self.submissions.lock().unwrap().clone()
    }

    pub fn submission_count(&self) -> usize {
        self.submissions.lock().unwrap().len()
    }

    fn deliver(request: IoRequest, outcome: MockOutcome, handler: Arc<dyn IoHandler>) {
        match outcome {
            MockOutcome::Complete(payload) => handler.complete(&request, payload),
            MockOutcome::Error(text) => handler.error(&request, RuntimeError::Channel(text)),
        }
    }
}

impl Channel for MockChannel {
    fn id(&self) -> &str {
        &self.id
    }

    fn submit(&self, request: IoRequest, handler: Arc<dyn IoHandler>) {
        self.submissions.lock().unwrap().push(request.clone());

        let outcome = self
            .outcomes
            .lock()
            .unwrap()
            .get(&request.name)
            .cloned()
            .unwrap_or(MockOutcome::Complete(None));

        match self.delay {
            Some(delay) => {
                std::thread::spawn(move || {
                    std::thread::sleep(delay);
                    Self::deliver(request, outcome, handler);
                });
            }
            None => Self::deliver(request, outcome, handler),
        }
    }
}

/// A channel that parks submissions until the test releases them
#[derive(Default)]
pub struct ManualChannel {
    pending: Mutex<Vec<(IoRequest, Arc<dyn IoHandler>)>>,
}

impl ManualChannel {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of submissions currently parked
    pub fn pending_count(&self) -> usize {
        self.pending.lock().unwrap().len()
    }

    /// Complete the oldest parked submission; false when none is parked
    pub fn complete_next(&self, payload: Option<Payload>) -> bool {
        let entry = {
            let mut pending = self.pending.lock().unwrap();
            if pending.is_empty() {
                return false;
            }
            pending.remove(0)
        };
        entry.1.complete(&entry.0, payload);
        true
    }

    /// Fail the oldest parked submission; false when none is parked
    pub fn error_next(&self, cause: RuntimeError) -> bool {
        let entry = {
            let mut pending = self.pending.lock().unwrap();
            if pending.is_empty() {
                return false;
            }
            pending.remove(0)
        };
        entry.1.error(&entry.0, cause);
        true
    }
}

impl Channel for ManualChannel {
    fn id(&self) -> &str {
        "manual"
    }

    fn submit(&self, request: IoRequest, handler: Arc<dyn IoHandler>) {
        self.pending.lock().unwrap().push((request, handler));
    }
}

/// A channel manager that delivers only what the test pushes
#[derive(Default)]
pub struct MockChannelManager {
    callbacks: Mutex<HashMap<String, (Arc<dyn Mapper>, Arc<dyn MessageCallback>)>>,
}

impl MockChannelManager {
    pub fn new() -> Self {
        Self::default()
    }

    /// Deliver `message` to the callback registered for its type, if any
    pub fn push(&self, message: Message) -> bool {
        let callback = {
            let callbacks = self.callbacks.lock().unwrap();
            callbacks
                .get(message.message_type())
                .map(|(_, cb)| cb.clone())
        };
        match callback {
            Some(cb) => {
                cb.on_message(message);
                true
            }
            None => false,
        }
    }

    /// Whether a callback is registered for `message_type`
    pub fn has_callback(&self, message_type: &str) -> bool {
        self.callbacks.lock().unwrap().contains_key(message_type)
    }
}

impl ChannelManager for MockChannelManager {
    fn add_callback(&self, mapper: Arc<dyn Mapper>, callback: Arc<dyn MessageCallback>) {
        self.callbacks
            .lock()
            .unwrap()
            .insert(mapper.message_type().to_string(), (mapper, callback));
    }

    fn remove_callback(&self, message_type: &str) {
        self.callbacks.lock().unwrap().remove(message_type);
    }
}
