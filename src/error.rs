//! Error handling for the devmux runtime
//!
//! This module defines the runtime error type and a Result alias used
//! throughout the crate. Compile-time validation errors are a separate,
//! accumulated type defined in [`crate::script::compiler`].

use thiserror::Error;

/// Main error type for runtime operations
#[derive(Error, Debug, Clone)]
pub enum RuntimeError {
    /// A script referenced a variable that does not exist at runtime
    #[error("Unknown variable '{0}'")]
    UnknownVariable(String),

    /// A variable or expression produced a value of the wrong type
    #[error("Type error: expected {expected}, found {found}")]
    TypeMismatch { expected: String, found: String },

    /// Expression evaluation failed
    #[error("Expression error in '{source_text}': {message}")]
    Expression {
        source_text: String,
        message: String,
    },

    /// Errors raised by the Error script instruction
    #[error("Script error: {0}")]
    Script(String),

    /// A Submit instruction resumed without an I/O result being posted
    #[error("Channel produced no result for request '{0}'")]
    MissingResult(String),

    /// Errors reported by a channel
    #[error("Channel error: {0}")]
    Channel(String),

    /// Message marshalling/unmarshalling failed
    #[error("Mapper error for message type '{message_type}': {message}")]
    Mapper {
        message_type: String,
        message: String,
    },

    /// The requested sampling period cannot be honored by the device.
    ///
    /// Raised unwrapped so callers can retry with `suggested` instead of
    /// treating it as a generic failure.
    #[error("Unsupported sampling period {requested} ms, suggested {suggested} ms")]
    UnsupportedPeriod { requested: u64, suggested: u64 },

    /// The script execution was cancelled before completion
    #[error("Script '{0}' cancelled")]
    Cancelled(String),

    /// The executor refused new work (already shut down)
    #[error("Executor is shut down")]
    ExecutorShutdown,

    /// A required scheduling parameter was not supplied
    #[error("Missing required parameter '{0}'")]
    MissingParameter(String),

    /// A sample pipeline output attribute has no source
    #[error("No source for pipeline attribute '{0}'")]
    UnmappedAttribute(String),

    /// The operation is no longer schedulable
    #[error("Operation {0} is not schedulable")]
    NotSchedulable(u64),

    /// An operation-wide failure, fanned out to every active task
    #[error("Operation failure: {context}: {source}")]
    Operation {
        context: String,
        #[source]
        source: Box<RuntimeError>,
    },

    /// A runtime failure wrapping an underlying cause
    #[error("{context}: {source}")]
    WithContext {
        context: String,
        #[source]
        source: Box<RuntimeError>,
    },
}

impl RuntimeError {
    /// Add context to an error
    pub fn with_context(self, context: impl Into<String>) -> Self {
        RuntimeError::WithContext {
            context: context.into(),
            source: Box::new(self),
        }
    }

    /// Wrap an error as an operation-wide failure
    pub fn operation(self, context: impl Into<String>) -> Self {
        RuntimeError::Operation {
            context: context.into(),
            source: Box::new(self),
        }
    }

    /// True for errors that must be propagated unwrapped so callers can act
    /// on their payload (currently only the unsupported-period error).
    pub fn is_unsupported_period(&self) -> bool {
        matches!(self, RuntimeError::UnsupportedPeriod { .. })
    }
}

/// Result type alias for runtime operations
pub type Result<T> = std::result::Result<T, RuntimeError>;

/// Extension trait for adding context to Results
pub trait ResultExt<T> {
    /// Add context to an error result
    fn context(self, context: impl Into<String>) -> Result<T>;

    /// Add context lazily to an error result
    fn with_context<F>(self, f: F) -> Result<T>
    where
        F: FnOnce() -> String;
}

impl<T> ResultExt<T> for Result<T> {
    fn context(self, context: impl Into<String>) -> Result<T> {
        self.map_err(|e| e.with_context(context))
    }

    fn with_context<F>(self, f: F) -> Result<T>
    where
        F: FnOnce() -> String,
    {
        self.map_err(|e| e.with_context(f()))
    }
}
