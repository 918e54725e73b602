//! Recording stand-ins for the driver and broker clients

use mediaflow_rs::broker::{ResourceClient, ResourceHandle};
use mediaflow_rs::pipeline::{Buffer, Event, EventSink, NodeError, NodeId, PoolId, Rejected, TransferResult};
use parking_lot::Mutex;
use std::sync::atomic::{AtomicBool, Ordering};

/// Driver sink that keeps everything it is handed.
///
/// While `accepting` is off, buffer callbacks are refused with `NotReady`.
pub struct RecordingSink {
    events: Mutex<Vec<Event>>,
    empty_done: Mutex<Vec<(NodeId, Buffer)>>,
    fill_done: Mutex<Vec<(NodeId, Buffer)>>,
    accepting: AtomicBool,
}

impl RecordingSink {
    pub fn new() -> Self {
        Self {
            events: Mutex::new(Vec::new()),
            empty_done: Mutex::new(Vec::new()),
            fill_done: Mutex::new(Vec::new()),
            accepting: AtomicBool::new(true),
        }
    }

    pub fn set_accepting(&self, accepting: bool) {
        self.accepting.store(accepting, Ordering::SeqCst);
    }

    pub fn events(&self) -> Vec<Event> {
        self.events.lock().clone()
    }

    pub fn events_for(&self, node: NodeId) -> Vec<Event> {
        self.events().into_iter().filter(|e| e.node() == node).collect()
    }

    pub fn has_error(&self, node: NodeId, error: NodeError) -> bool {
        self.events().iter().any(|e| {
            matches!(e, Event::Error { node: n, error: err, .. } if *n == node && *err == error)
        })
    }

    /// Slot indices of buffers returned by input ports, in arrival order.
    pub fn emptied(&self) -> Vec<usize> {
        self.empty_done.lock().iter().map(|(_, b)| b.index()).collect()
    }

    pub fn take_emptied(&self) -> Vec<Buffer> {
        self.empty_done.lock().drain(..).map(|(_, b)| b).collect()
    }

    pub fn take_filled(&self) -> Vec<Buffer> {
        self.fill_done.lock().drain(..).map(|(_, b)| b).collect()
    }
}

impl Default for RecordingSink {
    fn default() -> Self {
        Self::new()
    }
}

impl EventSink for RecordingSink {
    fn on_event(&self, event: Event) {
        self.events.lock().push(event);
    }

    fn empty_buffer_done(&self, node: NodeId, buffer: Buffer) -> TransferResult {
        if !self.accepting.load(Ordering::SeqCst) {
            return Err(Rejected::new(NodeError::NotReady, buffer));
        }
        self.empty_done.lock().push((node, buffer));
        Ok(())
    }

    fn fill_buffer_done(&self, node: NodeId, buffer: Buffer) -> TransferResult {
        if !self.accepting.load(Ordering::SeqCst) {
            return Err(Rejected::new(NodeError::NotReady, buffer));
        }
        self.fill_done.lock().push((node, buffer));
        Ok(())
    }
}

/// Broker client that records every callback.
#[derive(Default)]
pub struct RecordingClient {
    pub acquired: Mutex<Vec<(PoolId, Option<ResourceHandle>)>>,
    pub reclaimed: Mutex<Vec<(PoolId, ResourceHandle)>>,
}

impl RecordingClient {
    pub fn last_acquired(&self) -> Option<Option<ResourceHandle>> {
        self.acquired.lock().last().map(|(_, h)| *h)
    }

    pub fn reclaim_count(&self) -> usize {
        self.reclaimed.lock().len()
    }
}

impl ResourceClient for RecordingClient {
    fn on_acquired(&self, pool: PoolId, handle: Option<ResourceHandle>) {
        self.acquired.lock().push((pool, handle));
    }

    fn on_reclaimed(&self, pool: PoolId, handle: ResourceHandle) {
        self.reclaimed.lock().push((pool, handle));
    }
}
