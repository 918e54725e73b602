//! The node behavior interface.
//!
//! The runtime owns lifecycle, ports and tunnels; a `NodeBehavior` supplies
//! what is specific to one kind of node: which ports it has, what resources
//! it needs, and what it does with buffers once they are ready.

use crate::pipeline::buffer::{self, Buffer};
use crate::pipeline::command::PortTarget;
use crate::pipeline::config_slot::ConfigValue;
use crate::pipeline::error::{NodeError, NodeResult};
use crate::pipeline::event::Event;
use crate::pipeline::id::NodeId;
use crate::pipeline::node::Node;
use crate::pipeline::port::PortDescriptor;
use crate::pipeline::state::NodeState;
use std::time::Duration;

/// Outcome of one worker callback.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct WorkStatus {
    /// Run another pass right away.
    pub more_work: bool,
    /// Run another pass after this delay.
    pub next_call: Option<Duration>,
}

impl WorkStatus {
    pub const fn idle() -> Self {
        Self {
            more_work: false,
            next_call: None,
        }
    }

    pub const fn more() -> Self {
        Self {
            more_work: true,
            next_call: None,
        }
    }

    pub const fn after(delay: Duration) -> Self {
        Self {
            more_work: false,
            next_call: Some(delay),
        }
    }

    /// Combine two statuses: more work wins, otherwise the sooner delay.
    pub fn merge(self, other: WorkStatus) -> WorkStatus {
        let next_call = match (self.next_call, other.next_call) {
            (Some(a), Some(b)) => Some(a.min(b)),
            (a, b) => a.or(b),
        };
        WorkStatus {
            more_work: self.more_work || other.more_work,
            next_call,
        }
    }
}

/// Node-specific behavior. Every hook runs with the node's worker mutex held.
pub trait NodeBehavior: Send {
    /// Human-readable name of this node kind.
    fn name(&self) -> &str;

    /// Port descriptors, in port-index order.
    fn ports(&self) -> Vec<PortDescriptor>;

    /// `(input, output)` pairs that may share buffer storage.
    fn sharing_candidates(&self) -> Vec<(usize, usize)> {
        Vec::new()
    }

    /// Broker pools this node needs one unit of, besides its thread slot.
    fn resources(&self) -> Vec<String> {
        Vec::new()
    }

    fn open(&mut self, _node: NodeId) -> NodeResult<()> {
        Ok(())
    }

    fn close(&mut self) -> NodeResult<()> {
        Ok(())
    }

    fn get_parameter(&self, key: &str) -> NodeResult<ConfigValue> {
        Err(NodeError::UnsupportedSetting(key.to_string()))
    }

    fn set_parameter(&mut self, key: &str, _value: ConfigValue) -> NodeResult<()> {
        Err(NodeError::UnsupportedSetting(key.to_string()))
    }

    fn get_config(&self, key: &str) -> NodeResult<ConfigValue> {
        Err(NodeError::UnsupportedSetting(key.to_string()))
    }

    fn set_config(&mut self, key: &str, _value: ConfigValue) -> NodeResult<()> {
        Err(NodeError::UnsupportedSetting(key.to_string()))
    }

    /// Process buffers. `all_ports_ready` is true when every enabled port
    /// holds a current buffer.
    fn work(&mut self, ctx: &mut WorkerContext<'_>, all_ports_ready: bool)
        -> NodeResult<WorkStatus>;

    fn acquire_resources(&mut self) -> NodeResult<()> {
        Ok(())
    }

    fn release_resources(&mut self) -> NodeResult<()> {
        Ok(())
    }

    /// Called on the submitting thread when a `SetState` command is queued.
    fn pre_check_change_state(&mut self, _target: NodeState) {}

    fn pre_change_state(&mut self, _from: NodeState, _to: NodeState) {}

    fn change_state(&mut self, _from: NodeState, _to: NodeState) -> NodeResult<()> {
        Ok(())
    }

    fn flush(&mut self, _target: PortTarget) -> NodeResult<()> {
        Ok(())
    }

    /// A port was enabled or disabled.
    fn port_event(&mut self, _port: usize, _enabled: bool) -> NodeResult<()> {
        Ok(())
    }
}

/// Buffer access handed to [`NodeBehavior::work`].
pub struct WorkerContext<'a> {
    node: &'a Node,
}

impl<'a> WorkerContext<'a> {
    pub(crate) fn new(node: &'a Node) -> Self {
        Self { node }
    }

    pub fn node_id(&self) -> NodeId {
        self.node.id()
    }

    pub fn state(&self) -> NodeState {
        self.node.state()
    }

    pub fn send_event(&self, event: Event) {
        self.node.emit(event);
    }

    pub fn is_port_ready(&self, port: usize) -> bool {
        self.node
            .port(port)
            .map(|p| p.lock().is_ready())
            .unwrap_or(false)
    }

    /// True if `port` holds a current buffer.
    pub fn has_buffer(&self, port: usize) -> bool {
        self.node
            .port(port)
            .map(|p| p.lock().current.is_some())
            .unwrap_or(false)
    }

    /// Pull the next queued buffer into the port's current slot.
    pub fn get_next_buffer(&self, port: usize) -> bool {
        self.node.get_next_buffer(port)
    }

    /// Run `f` on the current buffer of `port`.
    pub fn with_buffer<R>(&self, port: usize, f: impl FnOnce(&mut Buffer) -> R) -> Option<R> {
        let lock = self.node.port(port).ok()?;
        let mut p = lock.lock();
        p.current.as_mut().map(f)
    }

    /// Run `f` on the current buffers of `input` and `output` together.
    pub fn with_buffers<R>(
        &self,
        input: usize,
        output: usize,
        f: impl FnOnce(&mut Buffer, &mut Buffer) -> R,
    ) -> Option<R> {
        let in_lock = self.node.port(input).ok()?;
        let out_lock = self.node.port(output).ok()?;
        let mut a = in_lock.lock().current.take()?;
        let Some(mut b) = out_lock.lock().current.take() else {
            in_lock.lock().current = Some(a);
            return None;
        };
        let result = f(&mut a, &mut b);
        in_lock.lock().current = Some(a);
        out_lock.lock().current = Some(b);
        Some(result)
    }

    /// Propagate mark, timestamp and flags from input to output.
    pub fn copy_metadata(&self, input: usize, output: usize) -> NodeResult<()> {
        self.with_buffers(input, output, buffer::copy_metadata)
            .ok_or(NodeError::NotReady)
    }

    /// True if the current buffers of both ports sit on the same storage.
    pub fn shares_storage(&self, input: usize, output: usize) -> bool {
        self.with_buffers(input, output, |a, b| a.memory().same_storage(b.memory()))
            .unwrap_or(false)
    }

    /// Hand the current input buffer back toward its producer.
    pub fn release_buffer(&self, port: usize) -> NodeResult<()> {
        let buffer = self.take_current(port)?;
        self.node.release_buffer(port, buffer)
    }

    /// Send the current output buffer downstream.
    pub fn deliver_buffer(&self, port: usize) -> NodeResult<()> {
        let buffer = self.take_current(port)?;
        self.node.deliver_full_buffer(port, buffer)
    }

    fn take_current(&self, port: usize) -> NodeResult<Buffer> {
        self.node
            .port(port)?
            .lock()
            .current
            .take()
            .ok_or(NodeError::NotReady)
    }
}
