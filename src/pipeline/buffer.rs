//! Buffers and their backing storage.
//!
//! Storage is allocated by the supplier port as one [`BufferArena`] holding
//! `count` slots. A [`Memory`] is a cheap handle to one slot; two headers
//! may point at the same slot only when the ports that own them share
//! storage. A [`Buffer`] header is never cloned: whoever holds the value owns
//! the buffer, so moving it between queues, peers and the external driver is
//! the ownership transfer.

use crate::pipeline::error::{NodeError, NodeResult};
use crate::pipeline::id::NodeId;
use parking_lot::Mutex;
use std::fmt;
use std::ops::{BitOr, BitOrAssign};
use std::sync::Arc;

/// Per-buffer flag bits.
#[derive(Clone, Copy, PartialEq, Eq, Hash, Default)]
pub struct BufferFlags(pub u32);

impl BufferFlags {
    pub const NONE: BufferFlags = BufferFlags(0);
    pub const EOS: BufferFlags = BufferFlags(0x0000_0001);
    pub const START_TIME: BufferFlags = BufferFlags(0x0000_0002);
    pub const DECODE_ONLY: BufferFlags = BufferFlags(0x0000_0004);
    pub const DATA_CORRUPT: BufferFlags = BufferFlags(0x0000_0008);
    pub const END_OF_FRAME: BufferFlags = BufferFlags(0x0000_0010);
    pub const SYNC_FRAME: BufferFlags = BufferFlags(0x0000_0020);
    pub const CODEC_CONFIG: BufferFlags = BufferFlags(0x0000_0080);

    #[inline]
    pub fn contains(self, other: BufferFlags) -> bool {
        self.0 & other.0 == other.0 && other.0 != 0
    }

    #[inline]
    pub fn insert(&mut self, other: BufferFlags) {
        self.0 |= other.0;
    }

    #[inline]
    pub fn remove(&mut self, other: BufferFlags) {
        self.0 &= !other.0;
    }

    #[inline]
    pub fn is_empty(self) -> bool {
        self.0 == 0
    }
}

impl BitOr for BufferFlags {
    type Output = BufferFlags;

    fn bitor(self, rhs: BufferFlags) -> BufferFlags {
        BufferFlags(self.0 | rhs.0)
    }
}

impl BitOrAssign for BufferFlags {
    fn bitor_assign(&mut self, rhs: BufferFlags) {
        self.0 |= rhs.0;
    }
}

impl fmt::Debug for BufferFlags {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "BufferFlags({:#x})", self.0)
    }
}

/// A mark token. The node identified by `target` raises a mark event when
/// the marked buffer finishes there.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Mark {
    pub target: NodeId,
    pub data: u64,
}

/// Fixed set of equally sized storage slots owned by an allocating port.
pub struct BufferArena {
    slots: Vec<Mutex<Box<[u8]>>>,
    slot_size: usize,
}

impl BufferArena {
    pub fn new(count: usize, slot_size: usize) -> Arc<Self> {
        let slots = (0..count)
            .map(|_| Mutex::new(vec![0u8; slot_size].into_boxed_slice()))
            .collect();
        Arc::new(Self { slots, slot_size })
    }

    /// Wrap caller-provided bytes as a single-slot arena.
    pub fn from_vec(data: Vec<u8>) -> Arc<Self> {
        let slot_size = data.len();
        Arc::new(Self {
            slots: vec![Mutex::new(data.into_boxed_slice())],
            slot_size,
        })
    }

    pub fn len(&self) -> usize {
        self.slots.len()
    }

    pub fn is_empty(&self) -> bool {
        self.slots.is_empty()
    }

    pub fn slot_size(&self) -> usize {
        self.slot_size
    }

    pub fn memory(self: &Arc<Self>, slot: usize) -> Option<Memory> {
        (slot < self.slots.len()).then(|| Memory {
            arena: Arc::clone(self),
            slot,
        })
    }
}

/// Handle to one arena slot.
#[derive(Clone)]
pub struct Memory {
    arena: Arc<BufferArena>,
    slot: usize,
}

impl Memory {
    /// Fresh single-slot memory of `size` zeroed bytes.
    pub fn allocate(size: usize) -> Self {
        Self {
            arena: BufferArena::new(1, size),
            slot: 0,
        }
    }

    pub fn from_vec(data: Vec<u8>) -> Self {
        Self {
            arena: BufferArena::from_vec(data),
            slot: 0,
        }
    }

    pub fn capacity(&self) -> usize {
        self.arena.slot_size
    }

    /// True when both handles address the same slot of the same arena.
    pub fn same_storage(&self, other: &Memory) -> bool {
        Arc::ptr_eq(&self.arena, &other.arena) && self.slot == other.slot
    }

    pub fn read<R>(&self, f: impl FnOnce(&[u8]) -> R) -> R {
        let guard = self.arena.slots[self.slot].lock();
        f(&guard)
    }

    pub fn write<R>(&self, f: impl FnOnce(&mut [u8]) -> R) -> R {
        let mut guard = self.arena.slots[self.slot].lock();
        f(&mut guard)
    }
}

impl fmt::Debug for Memory {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Memory")
            .field("slot", &self.slot)
            .field("capacity", &self.capacity())
            .finish()
    }
}

/// A buffer header: storage handle plus mutable payload metadata.
pub struct Buffer {
    index: usize,
    node: NodeId,
    memory: Memory,
    input_port: Option<usize>,
    output_port: Option<usize>,
    pub filled_len: usize,
    pub offset: usize,
    pub flags: BufferFlags,
    /// Presentation time in microseconds.
    pub timestamp: i64,
    pub tick_count: u32,
    pub mark: Option<Mark>,
    pub(crate) send_events: bool,
}

impl Buffer {
    pub(crate) fn new(index: usize, node: NodeId, memory: Memory) -> Self {
        Self {
            index,
            node,
            memory,
            input_port: None,
            output_port: None,
            filled_len: 0,
            offset: 0,
            flags: BufferFlags::NONE,
            timestamp: 0,
            tick_count: 0,
            mark: None,
            send_events: false,
        }
    }

    /// Slot index in the pool of the port that registered this header.
    pub fn index(&self) -> usize {
        self.index
    }

    /// Node whose port created this header.
    pub fn node(&self) -> NodeId {
        self.node
    }

    pub fn capacity(&self) -> usize {
        self.memory.capacity()
    }

    pub fn memory(&self) -> &Memory {
        &self.memory
    }

    pub fn input_port(&self) -> Option<usize> {
        self.input_port
    }

    pub fn output_port(&self) -> Option<usize> {
        self.output_port
    }

    pub(crate) fn set_input_port(&mut self, port: usize) {
        self.input_port = Some(port);
    }

    pub(crate) fn set_output_port(&mut self, port: usize) {
        self.output_port = Some(port);
    }

    pub fn is_eos(&self) -> bool {
        self.flags.contains(BufferFlags::EOS)
    }

    /// Copy the filled region out.
    pub fn payload(&self) -> Vec<u8> {
        let (start, end) = (self.offset, self.offset + self.filled_len);
        self.memory.read(|bytes| bytes[start..end.min(bytes.len())].to_vec())
    }

    /// Replace the payload with `data`, starting at offset zero.
    pub fn write_payload(&mut self, data: &[u8]) -> NodeResult<usize> {
        if data.len() > self.capacity() {
            return Err(NodeError::BadParameter(format!(
                "payload of {} bytes exceeds buffer capacity {}",
                data.len(),
                self.capacity()
            )));
        }
        self.memory.write(|bytes| bytes[..data.len()].copy_from_slice(data));
        self.offset = 0;
        self.filled_len = data.len();
        Ok(data.len())
    }

    /// Reset payload metadata before the buffer is handed out for filling.
    pub(crate) fn reset(&mut self) {
        self.tick_count = 0;
        self.mark = None;
        self.timestamp = 0;
        self.flags = BufferFlags::NONE;
        self.offset = 0;
        self.filled_len = 0;
    }

    /// Drop payload and flags when a buffer is returned by flush or stop.
    pub(crate) fn clear_payload(&mut self) {
        self.filled_len = 0;
        self.offset = 0;
        self.flags = BufferFlags::NONE;
    }
}

impl fmt::Debug for Buffer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Buffer")
            .field("index", &self.index)
            .field("node", &self.node)
            .field("filled_len", &self.filled_len)
            .field("flags", &self.flags)
            .field("timestamp", &self.timestamp)
            .field("mark", &self.mark)
            .finish()
    }
}

/// Copy mark, timestamp and flags from `input` to `output`. Event
/// responsibility moves with them: the output raises EOS/mark events and the
/// input no longer does.
pub fn copy_metadata(input: &mut Buffer, output: &mut Buffer) {
    output.mark = input.mark.take();
    output.timestamp = input.timestamp;
    output.flags = input.flags;
    output.tick_count = input.tick_count;
    input.send_events = false;
    output.send_events = true;
}
