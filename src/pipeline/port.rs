//! Ports: a node's typed buffer gateways.
//!
//! Each node declares its ports via `PortDescriptor`s. At runtime a `Port`
//! keeps the buffer queues, tunnel link and supplier state for one of them;
//! the node guards every `Port` with its own mutex.
//!
//! An input port queues full buffers waiting to be consumed; an output port
//! queues empty buffers waiting to be filled. Both have at most one
//! `current` buffer under processing and a `pending` list of buffers that
//! could not be handed on yet.

use crate::pipeline::buffer::{Buffer, Mark, Memory};
use crate::pipeline::error::NodeError;
use crate::pipeline::tunnel::{is_supplier, SharingView, SupplierRole, TunnelLink};
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;

pub const DEFAULT_MAX_BUFFER_COUNT: usize = 0x10000;
pub const DEFAULT_MAX_BUFFER_SIZE: usize = 0x0200_0000;

/// The kind of payload flowing through a port.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PortDomain {
    Audio,
    Video,
    Image,
    Other,
}

/// Whether a port is an input or output.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PortDirection {
    Input,
    Output,
}

/// Static descriptor for a node's port.
#[derive(Debug, Clone)]
pub struct PortDescriptor {
    pub name: &'static str,
    pub direction: PortDirection,
    pub domain: PortDomain,
    pub buffer_count: usize,
    pub buffer_size: usize,
    pub supplier_preference: SupplierRole,
}

impl PortDescriptor {
    pub const fn input(name: &'static str, domain: PortDomain) -> Self {
        Self {
            name,
            direction: PortDirection::Input,
            domain,
            buffer_count: 1,
            buffer_size: 1024,
            supplier_preference: SupplierRole::Unspecified,
        }
    }

    pub const fn output(name: &'static str, domain: PortDomain) -> Self {
        Self {
            name,
            direction: PortDirection::Output,
            domain,
            buffer_count: 1,
            buffer_size: 1024,
            supplier_preference: SupplierRole::Unspecified,
        }
    }

    pub const fn with_buffers(mut self, count: usize, size: usize) -> Self {
        self.buffer_count = count;
        self.buffer_size = size;
        self
    }

    pub const fn with_supplier(mut self, preference: SupplierRole) -> Self {
        self.supplier_preference = preference;
        self
    }
}

/// Public view of a port's configuration and population state.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PortDefinition {
    pub index: usize,
    pub direction: PortDirection,
    pub domain: PortDomain,
    pub enabled: bool,
    pub populated: bool,
    pub buffer_count_actual: usize,
    pub buffer_count_min: usize,
    pub buffer_count_max: usize,
    pub buffer_size: usize,
    pub buffer_size_min: usize,
    pub buffer_size_max: usize,
    pub supplier: SupplierRole,
}

/// Per-port counters.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PortStats {
    /// `EmptyThisBuffer` calls accepted by this port.
    pub empty_this_buffer_calls: u64,
    /// `FillThisBuffer` calls accepted by this port.
    pub fill_this_buffer_calls: u64,
    pub delivered: u64,
    pub released: u64,
    pub returned: u64,
    pub flushed: u64,
}

/// Runtime state for one port.
#[derive(Debug)]
pub(crate) struct Port {
    pub index: usize,
    pub name: &'static str,
    pub direction: PortDirection,
    pub domain: PortDomain,

    pub enabled: bool,
    pub populated: bool,
    pub started: bool,

    pub count_min: usize,
    pub count_max: usize,
    pub size_min: usize,
    pub size_max: usize,
    pub requested_count: usize,
    pub requested_size: usize,
    /// Tunnel requirements were merged for the current population cycle.
    pub requirements_merged: bool,

    pub preference: SupplierRole,
    pub supplier: SupplierRole,
    pub tunnel: Option<TunnelLink>,

    /// Sibling ports this port could share storage with.
    pub candidates: Vec<usize>,
    /// Sibling ports this port actually shares with.
    pub sharing: Vec<usize>,
    /// Buffers registered by this port point at a sibling's storage.
    pub reusing: bool,

    /// Headers registered on this port, owned anywhere.
    pub n_buffers: usize,
    /// Storage of every registered header, by slot index.
    pub memories: Vec<Memory>,

    /// Full buffers (input) or empty buffers (output) ready for `current`.
    pub queue: VecDeque<Buffer>,
    pub pending: VecDeque<Buffer>,
    /// Buffers at rest: a supplier's fresh allocations, or shared buffers
    /// parked until the sibling hands ownership back.
    pub held: Vec<Buffer>,
    pub current: Option<Buffer>,
    pub marks: VecDeque<Mark>,

    pub stats: PortStats,
}

impl Port {
    pub fn new(index: usize, desc: &PortDescriptor) -> Self {
        Self {
            index,
            name: desc.name,
            direction: desc.direction,
            domain: desc.domain,
            enabled: true,
            populated: false,
            started: false,
            count_min: desc.buffer_count,
            count_max: DEFAULT_MAX_BUFFER_COUNT,
            size_min: desc.buffer_size,
            size_max: DEFAULT_MAX_BUFFER_SIZE,
            requested_count: desc.buffer_count,
            requested_size: desc.buffer_size,
            requirements_merged: false,
            preference: desc.supplier_preference,
            supplier: SupplierRole::Unspecified,
            tunnel: None,
            candidates: Vec::new(),
            sharing: Vec::new(),
            reusing: false,
            n_buffers: 0,
            memories: Vec::new(),
            queue: VecDeque::new(),
            pending: VecDeque::new(),
            held: Vec::new(),
            current: None,
            marks: VecDeque::new(),
            stats: PortStats::default(),
        }
    }

    #[inline]
    pub fn is_input(&self) -> bool {
        self.direction == PortDirection::Input
    }

    #[inline]
    pub fn is_ready(&self) -> bool {
        self.enabled && self.populated
    }

    #[inline]
    pub fn is_tunneled(&self) -> bool {
        self.tunnel.is_some()
    }

    pub fn is_supplier(&self) -> bool {
        is_supplier(self.direction, self.is_tunneled(), self.supplier)
    }

    /// Supplier that allocates fresh storage instead of reusing a sibling's.
    pub fn is_allocator(&self) -> bool {
        self.is_supplier() && self.sharing.is_empty()
    }

    pub fn is_sharing(&self) -> bool {
        !self.sharing.is_empty()
    }

    /// Error for a handoff arriving while the port is not accepting buffers.
    pub fn not_accepting_error(&self) -> NodeError {
        if self.enabled {
            NodeError::PortUnpopulated
        } else {
            NodeError::IncorrectStateOperation
        }
    }

    /// Buffers physically owned by this port right now.
    pub fn in_hand(&self) -> usize {
        self.queue.len() + self.pending.len() + self.held.len() + usize::from(self.current.is_some())
    }

    /// Take every buffer this port currently owns.
    pub fn take_all(&mut self) -> Vec<Buffer> {
        let mut all: Vec<Buffer> = self.current.take().into_iter().collect();
        all.extend(self.queue.drain(..));
        all.extend(self.pending.drain(..));
        all.append(&mut self.held);
        all
    }

    pub fn sharing_view(&self) -> SharingView {
        SharingView {
            index: self.index,
            direction: self.direction,
            enabled: self.enabled,
            tunneled: self.is_tunneled(),
            supplier: self.supplier,
        }
    }

    pub fn definition(&self) -> PortDefinition {
        PortDefinition {
            index: self.index,
            direction: self.direction,
            domain: self.domain,
            enabled: self.enabled,
            populated: self.populated,
            buffer_count_actual: self.requested_count,
            buffer_count_min: self.count_min,
            buffer_count_max: self.count_max,
            buffer_size: self.requested_size,
            buffer_size_min: self.size_min,
            buffer_size_max: self.size_max,
            supplier: self.supplier,
        }
    }

    /// Pull the next queued buffer into `current` if none is held.
    ///
    /// `preferred` selects a specific slot on an output port that shares
    /// storage with an input, so both sides process the same slot.
    pub fn take_next(&mut self, preferred: Option<usize>) -> bool {
        if self.current.is_none() {
            let position = preferred
                .and_then(|slot| self.queue.iter().position(|b| b.index() == slot))
                .unwrap_or(0);
            if let Some(mut buffer) = self.queue.remove(position) {
                if self.direction == PortDirection::Output {
                    buffer.reset();
                }
                buffer.send_events = true;
                self.current = Some(buffer);
            }
        }

        if let Some(current) = self.current.as_mut() {
            if current.mark.is_none() {
                current.mark = self.marks.pop_front();
            }
            true
        } else {
            false
        }
    }

    /// Forget all storage once every header has been freed.
    pub fn clear_pool(&mut self) {
        self.memories.clear();
        self.queue.clear();
        self.pending.clear();
        self.held.clear();
        self.current = None;
        self.marks.clear();
        self.requirements_merged = false;
        self.started = false;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pipeline::id::NodeId;

    fn buffer(index: usize) -> Buffer {
        Buffer::new(index, NodeId(0), Memory::allocate(16))
    }

    #[test]
    fn test_defaults_from_descriptor() {
        let desc = PortDescriptor::input("in", PortDomain::Audio).with_buffers(4, 2048);
        let port = Port::new(0, &desc);
        assert!(port.enabled);
        assert!(!port.populated);
        assert_eq!(port.requested_count, 4);
        assert_eq!(port.count_max, DEFAULT_MAX_BUFFER_COUNT);
        assert_eq!(port.size_max, DEFAULT_MAX_BUFFER_SIZE);
        assert_eq!(port.not_accepting_error(), NodeError::PortUnpopulated);
    }

    #[test]
    fn test_take_next_holds_at_most_one() {
        let desc = PortDescriptor::input("in", PortDomain::Audio);
        let mut port = Port::new(0, &desc);
        port.queue.push_back(buffer(0));
        port.queue.push_back(buffer(1));

        assert!(port.take_next(None));
        assert!(port.take_next(None));
        assert_eq!(port.current.as_ref().map(|b| b.index()), Some(0));
        assert_eq!(port.queue.len(), 1);
    }

    #[test]
    fn test_take_next_prefers_slot_and_resets_output() {
        let desc = PortDescriptor::output("out", PortDomain::Audio);
        let mut port = Port::new(1, &desc);
        let mut dirty = buffer(1);
        dirty.filled_len = 5;
        port.queue.push_back(buffer(0));
        port.queue.push_back(dirty);

        assert!(port.take_next(Some(1)));
        let current = port.current.as_ref().unwrap();
        assert_eq!(current.index(), 1);
        assert_eq!(current.filled_len, 0);
        assert!(current.send_events);
    }

    #[test]
    fn test_take_next_attaches_pending_mark() {
        let desc = PortDescriptor::input("in", PortDomain::Audio);
        let mut port = Port::new(0, &desc);
        port.marks.push_back(Mark {
            target: NodeId(3),
            data: 11,
        });
        assert!(!port.take_next(None));
        port.queue.push_back(buffer(0));
        assert!(port.take_next(None));
        assert_eq!(port.current.as_ref().and_then(|b| b.mark).map(|m| m.data), Some(11));
        assert!(port.marks.is_empty());
    }

    #[test]
    fn test_take_all_counts_everything() {
        let desc = PortDescriptor::input("in", PortDomain::Audio);
        let mut port = Port::new(0, &desc);
        port.queue.push_back(buffer(0));
        port.pending.push_back(buffer(1));
        port.held.push(buffer(2));
        port.current = Some(buffer(3));
        assert_eq!(port.in_hand(), 4);
        assert_eq!(port.take_all().len(), 4);
        assert_eq!(port.in_hand(), 0);
    }
}
