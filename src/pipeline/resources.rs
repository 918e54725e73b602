//! Node-side resource tracking and the broker callback adapter.

use crate::broker::{Priority, ResourceClient, ResourceHandle, ResourceRequest};
use crate::pipeline::error::{NodeError, NodeResult};
use crate::pipeline::event::Event;
use crate::pipeline::id::{ClientId, PoolId};
use crate::pipeline::node::{Node, WorkerState};
use crate::pipeline::state::ResourcesState;
use std::sync::{Arc, Weak};
use tracing::{debug, info, warn};

/// Which declared pools a node holds a unit of.
#[derive(Debug)]
pub(crate) struct ResourceTracker {
    pub pools: Vec<PoolId>,
    pub handles: Vec<Option<ResourceHandle>>,
    pub acquired: usize,
    pub state: ResourcesState,
    pub priority: Priority,
}

impl ResourceTracker {
    pub fn new(pools: Vec<PoolId>, priority: Priority) -> Self {
        let handles = vec![None; pools.len()];
        Self {
            pools,
            handles,
            acquired: 0,
            state: ResourcesState::HaveNone,
            priority,
        }
    }

    fn missing(&self) -> Vec<(usize, PoolId)> {
        self.pools
            .iter()
            .zip(&self.handles)
            .enumerate()
            .filter(|(_, (_, h))| h.is_none())
            .map(|(slot, (pool, _))| (slot, *pool))
            .collect()
    }

    fn settle(&mut self) {
        self.state = if self.acquired == self.pools.len() {
            ResourcesState::HaveAll
        } else if self.acquired > 0 {
            ResourcesState::HaveSome
        } else {
            ResourcesState::HaveNone
        };
    }
}

/// Forwards broker callbacks to a node without keeping it alive.
pub(crate) struct NodeClient {
    node: Weak<Node>,
}

impl NodeClient {
    pub fn new(node: Weak<Node>) -> Self {
        Self { node }
    }
}

impl ResourceClient for NodeClient {
    fn on_acquired(&self, pool: PoolId, handle: Option<ResourceHandle>) {
        if let Some(node) = self.node.upgrade() {
            node.on_resource_acquired(pool, handle);
        }
    }

    fn on_reclaimed(&self, pool: PoolId, handle: ResourceHandle) {
        if let Some(node) = self.node.upgrade() {
            node.on_resource_reclaimed(pool, handle);
        }
    }
}

impl Node {
    fn client_id(&self) -> ClientId {
        ClientId::from(self.id())
    }

    fn client_callbacks(&self) -> Arc<dyn ResourceClient> {
        self.client.clone()
    }

    /// One-shot acquisition of every declared pool not yet held.
    pub(crate) fn acquire_resources(&self, ws: &mut WorkerState) -> NodeResult<()> {
        ws.behavior.acquire_resources()?;

        let (missing, priority) = {
            let mut tracker = self.resources.lock();
            if tracker.state == ResourcesState::Provided {
                tracker.settle();
                return match tracker.state {
                    ResourcesState::HaveAll => Ok(()),
                    _ => Err(NodeError::InsufficientResources),
                };
            }
            (tracker.missing(), tracker.priority)
        };

        let mut failure = None;
        for (slot, pool) in missing {
            match self.env.broker.acquire(
                self.client_id(),
                self.client_callbacks(),
                priority,
                pool,
                ResourceRequest::default(),
            ) {
                Ok(handle) => {
                    let mut tracker = self.resources.lock();
                    tracker.handles[slot] = Some(handle);
                    tracker.acquired += 1;
                }
                Err(e) => {
                    debug!("{} could not acquire {:?}: {}", self.id(), pool, e);
                    failure = Some(e);
                    break;
                }
            }
        }

        let mut tracker = self.resources.lock();
        tracker.settle();
        match failure {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }

    /// Give back every held unit, in reverse declaration order.
    pub(crate) fn release_resources(&self, ws: &mut WorkerState) -> NodeResult<()> {
        let result = ws.behavior.release_resources();
        let held: Vec<(PoolId, ResourceHandle)> = {
            let mut tracker = self.resources.lock();
            let pools = tracker.pools.clone();
            let held = pools
                .into_iter()
                .zip(tracker.handles.iter_mut())
                .filter_map(|(pool, handle)| handle.take().map(|h| (pool, h)))
                .collect();
            tracker.acquired = 0;
            tracker.state = ResourcesState::HaveNone;
            held
        };
        for (pool, handle) in held.into_iter().rev() {
            if let Err(e) = self.env.broker.release(pool, handle) {
                warn!("{} release of {:?} failed: {}", self.id(), handle, e);
            }
        }
        result
    }

    /// Queue waits for every declared pool not yet held.
    pub(crate) fn wait_for_resources(&self) -> NodeResult<()> {
        let (missing, priority) = {
            let tracker = self.resources.lock();
            (tracker.missing(), tracker.priority)
        };
        for (_, pool) in missing {
            self.env.broker.wait_for(
                self.client_id(),
                self.client_callbacks(),
                priority,
                pool,
                ResourceRequest::default(),
            )?;
        }
        Ok(())
    }

    pub(crate) fn cancel_resource_wait(&self) {
        let pools = self.resources.lock().pools.clone();
        for pool in pools.into_iter().rev() {
            if let Err(e) = self.env.broker.cancel_wait(self.client_id(), pool) {
                warn!("{} cancel wait on {:?} failed: {}", self.id(), pool, e);
            }
        }
    }

    pub(crate) fn on_resource_acquired(&self, pool: PoolId, handle: Option<ResourceHandle>) {
        let Some(handle) = handle else {
            self.emit(Event::Error {
                node: self.id(),
                error: NodeError::InsufficientResources,
                port: None,
            });
            return;
        };

        let mut tracker = self.resources.lock();
        let slot = tracker
            .pools
            .iter()
            .zip(&tracker.handles)
            .position(|(p, h)| *p == pool && h.is_none());
        match slot {
            Some(slot) => {
                tracker.handles[slot] = Some(handle);
                tracker.acquired += 1;
                let complete = tracker.acquired == tracker.pools.len()
                    && tracker.state != ResourcesState::HaveAll;
                if complete {
                    tracker.state = ResourcesState::Provided;
                }
                drop(tracker);
                if complete {
                    info!("{} has all resources", self.id());
                    self.trigger();
                }
            }
            None => {
                drop(tracker);
                if let Err(e) = self.env.broker.release(pool, handle) {
                    warn!("{} could not return surplus {:?}: {}", self.id(), handle, e);
                }
            }
        }
    }

    pub(crate) fn on_resource_reclaimed(&self, pool: PoolId, handle: ResourceHandle) {
        let mut tracker = self.resources.lock();
        if let Some(slot) = tracker.handles.iter().position(|h| *h == Some(handle)) {
            tracker.handles[slot] = None;
            tracker.acquired = tracker.acquired.saturating_sub(1);
        }
        if tracker.state != ResourcesState::HaveNone {
            tracker.state = ResourcesState::Reclaimed;
        }
        drop(tracker);
        info!("{} lost {:?} from {:?}", self.id(), handle, pool);
        self.trigger();
    }
}
