//! Error handling for the MediaFlow-RS application layer
//!
//! The runtime core reports [`NodeError`]; this module wraps it together with
//! configuration, I/O and graph-construction failures for the code that loads
//! files and drives whole graphs.

use crate::pipeline::error::NodeError;
use thiserror::Error;

/// Main error type for MediaFlow-RS operations
#[derive(Error, Debug)]
pub enum MediaFlowError {
    /// Errors raised by nodes, ports, tunnels or the broker
    #[error("Node error: {0}")]
    Node(#[from] NodeError),

    /// Errors related to configuration loading/saving
    #[error("Configuration error: {0}")]
    Config(String),

    /// Errors in a graph description (unknown node, bad link, ...)
    #[error("Graph error: {0}")]
    Graph(String),

    /// Errors starting or stopping the scheduler
    #[error("Scheduler error: {0}")]
    Scheduler(String),

    /// Timeout errors
    #[error("Timeout: {0}")]
    Timeout(String),

    /// IO errors
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// Serialization errors
    #[error("Serialization error: {0}")]
    Serialization(String),

    /// Generic errors with context
    #[error("{context}: {source}")]
    WithContext {
        context: String,
        #[source]
        source: Box<MediaFlowError>,
    },
}

impl MediaFlowError {
    /// Add context to an error
    pub fn with_context(self, context: impl Into<String>) -> Self {
        MediaFlowError::WithContext {
            context: context.into(),
            source: Box::new(self),
        }
    }

    /// The runtime error at the root of this one, if any.
    pub fn node_error(&self) -> Option<&NodeError> {
        match self {
            MediaFlowError::Node(e) => Some(e),
            MediaFlowError::WithContext { source, .. } => source.node_error(),
            _ => None,
        }
    }
}

/// Result type alias for MediaFlow-RS operations
pub type Result<T> = std::result::Result<T, MediaFlowError>;

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

impl<T> ResultExt<T> for std::result::Result<T, NodeError> {
    fn context(self, context: impl Into<String>) -> Result<T> {
        self.map_err(|e| MediaFlowError::from(e).with_context(context))
    }

    fn with_context<F>(self, f: F) -> Result<T>
    where
        F: FnOnce() -> String,
    {
        self.map_err(|e| MediaFlowError::from(e).with_context(f()))
    }
}
