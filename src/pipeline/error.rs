//! Runtime error taxonomy.

use crate::pipeline::buffer::Buffer;
use thiserror::Error;

/// Errors raised by nodes, ports, tunnels and the resource broker.
///
/// `Clone` so an error can travel inside an [`Event`](crate::pipeline::event::Event).
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum NodeError {
    /// Transient condition; the operation is retried on a later worker pass.
    #[error("not ready")]
    NotReady,

    /// The node is in `Invalid` or the request needs a state it is not in.
    #[error("invalid state")]
    InvalidState,

    #[error("operation not allowed in the current state")]
    IncorrectStateOperation,

    #[error("illegal state transition")]
    IncorrectStateTransition,

    #[error("node is already in the requested state")]
    SameState,

    #[error("bad port index {0}")]
    BadPortIndex(usize),

    #[error("bad parameter: {0}")]
    BadParameter(String),

    /// No slot available in a resource pool.
    #[error("insufficient resources")]
    InsufficientResources,

    #[error("component version mismatch")]
    VersionMismatch,

    #[error("port is enabled but not populated")]
    PortUnpopulated,

    #[error("ports are not compatible")]
    PortsNotCompatible,

    /// Resources were taken away while the node was idle.
    #[error("resources lost")]
    ResourcesLost,

    /// Resources were taken away while the node was executing.
    #[error("resources preempted")]
    ResourcesPreempted,

    #[error("timed out")]
    Timeout,

    #[error("not implemented")]
    NotImplemented,

    #[error("unsupported setting: {0}")]
    UnsupportedSetting(String),

    #[error("undefined error: {0}")]
    Undefined(String),
}

impl NodeError {
    /// True for conditions the state machine retries instead of surfacing.
    pub fn is_not_ready(&self) -> bool {
        matches!(self, NodeError::NotReady | NodeError::InsufficientResources)
    }
}

pub type NodeResult<T> = std::result::Result<T, NodeError>;

/// A buffer handoff that failed. The buffer comes back to the caller.
#[derive(Debug)]
pub struct Rejected {
    pub error: NodeError,
    pub buffer: Buffer,
}

impl Rejected {
    pub fn new(error: NodeError, buffer: Buffer) -> Self {
        Self { error, buffer }
    }
}

impl std::fmt::Display for Rejected {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "buffer {} rejected: {}", self.buffer.index(), self.error)
    }
}

impl std::error::Error for Rejected {}

/// Result of handing a buffer across a port boundary.
pub type TransferResult = std::result::Result<(), Rejected>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_not_ready_classification() {
        assert!(NodeError::NotReady.is_not_ready());
        assert!(NodeError::InsufficientResources.is_not_ready());
        assert!(!NodeError::InvalidState.is_not_ready());
        assert!(!NodeError::VersionMismatch.is_not_ready());
    }

    #[test]
    fn test_error_display() {
        assert_eq!(NodeError::BadPortIndex(3).to_string(), "bad port index 3");
        assert_eq!(
            NodeError::BadParameter("size".into()).to_string(),
            "bad parameter: size"
        );
    }
}
