//! Events and buffer callbacks delivered to the external driver.

use crate::pipeline::buffer::{Buffer, BufferFlags};
use crate::pipeline::command::Command;
use crate::pipeline::error::{NodeError, Rejected, TransferResult};
use crate::pipeline::id::NodeId;
use crossbeam_channel::{unbounded, Receiver, Sender};

/// Notifications a node raises toward its driver.
#[derive(Debug, Clone, PartialEq)]
pub enum Event {
    /// A command finished. Flush/Enable/Disable report once per port, and
    /// once more for `PortTarget::All`.
    CommandComplete { node: NodeId, command: Command },

    /// A command failed with `error`.
    CommandFailed {
        node: NodeId,
        command: Command,
        error: NodeError,
    },

    /// Asynchronous error not tied to a command.
    Error {
        node: NodeId,
        error: NodeError,
        port: Option<usize>,
    },

    /// A buffer carrying notable flags (end of stream) finished on `port`.
    BufferFlag {
        node: NodeId,
        port: usize,
        flags: BufferFlags,
    },

    /// A marked buffer reached its target node.
    Mark { node: NodeId, data: u64 },

    /// The first buffer was rendered on `port`.
    FirstFrame { node: NodeId, port: usize },

    /// A port changed its buffer requirements.
    PortSettingsChanged { node: NodeId, port: usize },
}

impl Event {
    pub fn node(&self) -> NodeId {
        match self {
            Event::CommandComplete { node, .. }
            | Event::CommandFailed { node, .. }
            | Event::Error { node, .. }
            | Event::BufferFlag { node, .. }
            | Event::Mark { node, .. }
            | Event::FirstFrame { node, .. }
            | Event::PortSettingsChanged { node, .. } => *node,
        }
    }
}

/// Implemented by whoever drives the graph.
///
/// The buffer callbacks take ownership of a buffer leaving a non-tunneled
/// port. Returning `Err` hands the buffer back; the port then keeps it
/// pending and retries on a later worker pass.
pub trait EventSink: Send + Sync {
    fn on_event(&self, event: Event);

    /// An input port finished consuming `buffer`.
    fn empty_buffer_done(&self, node: NodeId, buffer: Buffer) -> TransferResult;

    /// An output port filled `buffer`.
    fn fill_buffer_done(&self, node: NodeId, buffer: Buffer) -> TransferResult;
}

/// Messages produced by [`ChannelSink`].
#[derive(Debug)]
pub enum SinkMessage {
    Event(Event),
    EmptyBufferDone { node: NodeId, buffer: Buffer },
    FillBufferDone { node: NodeId, buffer: Buffer },
}

/// `EventSink` that forwards everything over a crossbeam channel.
pub struct ChannelSink {
    tx: Sender<SinkMessage>,
}

impl ChannelSink {
    pub fn new() -> (Self, Receiver<SinkMessage>) {
        let (tx, rx) = unbounded();
        (Self { tx }, rx)
    }
}

impl EventSink for ChannelSink {
    fn on_event(&self, event: Event) {
        if self.tx.send(SinkMessage::Event(event)).is_err() {
            tracing::debug!("event dropped: sink receiver gone");
        }
    }

    fn empty_buffer_done(&self, node: NodeId, buffer: Buffer) -> TransferResult {
        self.tx
            .send(SinkMessage::EmptyBufferDone { node, buffer })
            .map_err(|e| match e.into_inner() {
                SinkMessage::EmptyBufferDone { buffer, .. } => {
                    Rejected::new(NodeError::NotReady, buffer)
                }
                _ => unreachable!("send returns the message it was given"),
            })
    }

    fn fill_buffer_done(&self, node: NodeId, buffer: Buffer) -> TransferResult {
        self.tx
            .send(SinkMessage::FillBufferDone { node, buffer })
            .map_err(|e| match e.into_inner() {
                SinkMessage::FillBufferDone { buffer, .. } => {
                    Rejected::new(NodeError::NotReady, buffer)
                }
                _ => unreachable!("send returns the message it was given"),
            })
    }
}
