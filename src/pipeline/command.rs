//! Node commands and the bounded command queue.

use crate::pipeline::buffer::Mark;
use crate::pipeline::error::{NodeError, NodeResult};
use crate::pipeline::state::NodeState;
use std::collections::VecDeque;
use std::fmt;

/// A single port or every port of a node.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum PortTarget {
    Index(usize),
    All,
}

impl PortTarget {
    /// Resolve to concrete port indices for a node with `port_count` ports.
    pub fn ports(self, port_count: usize) -> std::ops::Range<usize> {
        match self {
            PortTarget::Index(i) => i..i + 1,
            PortTarget::All => 0..port_count,
        }
    }

    pub fn validate(self, port_count: usize) -> NodeResult<()> {
        match self {
            PortTarget::Index(i) if i >= port_count => Err(NodeError::BadPortIndex(i)),
            _ => Ok(()),
        }
    }
}

impl fmt::Display for PortTarget {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PortTarget::Index(i) => write!(f, "port {}", i),
            PortTarget::All => write!(f, "all ports"),
        }
    }
}

/// Commands an external driver submits to a node.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Command {
    SetState(NodeState),
    Flush(PortTarget),
    EnablePort(PortTarget),
    DisablePort(PortTarget),
    MarkBuffer(usize, Mark),
}

impl Command {
    /// Validate port indices against a node with `port_count` ports.
    pub fn validate(&self, port_count: usize) -> NodeResult<()> {
        match *self {
            Command::SetState(_) => Ok(()),
            Command::Flush(t) | Command::EnablePort(t) | Command::DisablePort(t) => {
                t.validate(port_count)
            }
            Command::MarkBuffer(port, _) if port >= port_count => {
                Err(NodeError::BadPortIndex(port))
            }
            Command::MarkBuffer(..) => Ok(()),
        }
    }
}

/// Bounded FIFO of commands. The worker peeks the head and only pops it once
/// the command has been processed, so a not-ready command is retried.
#[derive(Debug)]
pub struct CommandQueue {
    entries: VecDeque<Command>,
    capacity: usize,
}

impl CommandQueue {
    pub fn new(capacity: usize) -> Self {
        Self {
            entries: VecDeque::with_capacity(capacity),
            capacity,
        }
    }

    pub fn push(&mut self, command: Command) -> NodeResult<()> {
        if self.entries.len() >= self.capacity {
            return Err(NodeError::NotReady);
        }
        self.entries.push_back(command);
        Ok(())
    }

    pub fn peek(&self) -> Option<Command> {
        self.entries.front().copied()
    }

    pub fn pop(&mut self) -> Option<Command> {
        self.entries.pop_front()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}
