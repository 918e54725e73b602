//! Priority-based resource broker.
//!
//! The broker keeps a registry of named pools. Each pool has a provider that
//! actually hands out units, plus a list of client entries that either hold a
//! unit or wait for one. One lock guards all of it.
//!
//! # Arbitration
//!
//! After every `wait_for` and every `release` the affected pool is
//! re-arbitrated:
//!
//! 1. Pick the best waiter: lowest `group_priority`, earliest registration.
//! 2. Ask the provider. On success the waiter becomes a holder.
//! 3. Otherwise pick the lowest-priority holder that is not already being
//!    reclaimed and is strictly outranked by the waiter. Every holder of the
//!    victim's group is marked as reclaiming, whatever its own priority.
//! 4. Drop the lock, call `on_reclaimed` on each victim, retake the lock,
//!    return the victims' units to the provider and go back to 1.
//! 5. When the best waiter cannot be served, waiters that do not wait
//!    indefinitely are failed with a `None` handle.
//!
//! Client callbacks are always invoked without the broker lock held.

pub mod client;
pub mod provider;

pub use client::{Priority, ResourceClient, ResourceHandle, ResourceRequest};
pub use provider::{CountingProvider, ResourceProvider};

use crate::pipeline::error::{NodeError, NodeResult};
use crate::pipeline::id::{ClientId, PoolId};
use parking_lot::Mutex;
use std::sync::Arc;
use tracing::{debug, info, warn};

struct ClientEntry {
    id: ClientId,
    callbacks: Arc<dyn ResourceClient>,
    priority: Priority,
    request: ResourceRequest,
    handle: Option<ResourceHandle>,
    reclaiming: bool,
    /// Registration order, used as tie-break and as a stable entry key.
    seq: u64,
}

impl ClientEntry {
    fn is_waiting(&self) -> bool {
        self.handle.is_none()
    }
}

struct Pool {
    name: String,
    provider: Arc<dyn ResourceProvider>,
    clients: Vec<ClientEntry>,
}

impl Pool {
    fn best_waiter(&self) -> Option<usize> {
        self.clients
            .iter()
            .enumerate()
            .filter(|(_, c)| c.is_waiting())
            .min_by_key(|(_, c)| (c.priority.group_priority, c.seq))
            .map(|(i, _)| i)
    }

    fn victim_for(&self, waiter: &Priority) -> Option<usize> {
        self.clients
            .iter()
            .enumerate()
            .filter(|(_, c)| c.handle.is_some() && !c.reclaiming && waiter.outranks(&c.priority))
            .max_by_key(|(_, c)| (c.priority.group_priority, c.seq))
            .map(|(i, _)| i)
    }
}

struct BrokerInner {
    pools: Vec<Pool>,
    next_seq: u64,
}

impl BrokerInner {
    fn pool_mut(&mut self, pool: PoolId) -> NodeResult<&mut Pool> {
        self.pools
            .get_mut(pool.index())
            .ok_or_else(|| NodeError::BadParameter(format!("unknown pool {:?}", pool)))
    }

    fn pool(&self, pool: PoolId) -> NodeResult<&Pool> {
        self.pools
            .get(pool.index())
            .ok_or_else(|| NodeError::BadParameter(format!("unknown pool {:?}", pool)))
    }

    fn next_seq(&mut self) -> u64 {
        self.next_seq += 1;
        self.next_seq
    }
}

struct Reclaim {
    seq: u64,
    client: ClientId,
    callbacks: Arc<dyn ResourceClient>,
    handle: ResourceHandle,
}

/// Explicit broker instance shared by every node of a graph.
pub struct ResourceBroker {
    inner: Mutex<BrokerInner>,
}

impl ResourceBroker {
    pub fn new() -> Self {
        Self {
            inner: Mutex::new(BrokerInner {
                pools: Vec::new(),
                next_seq: 0,
            }),
        }
    }

    /// Broker with one `CountingProvider` pool per `(name, capacity)`.
    pub fn with_counting_pools<'a>(
        pools: impl IntoIterator<Item = (&'a str, usize)>,
    ) -> NodeResult<Self> {
        let broker = Self::new();
        for (name, capacity) in pools {
            broker.register_provider(name, Arc::new(CountingProvider::new(capacity)))?;
        }
        Ok(broker)
    }

    // ── Registry ──

    pub fn register_provider(
        &self,
        name: &str,
        provider: Arc<dyn ResourceProvider>,
    ) -> NodeResult<PoolId> {
        let mut inner = self.inner.lock();
        if inner.pools.iter().any(|p| p.name == name) {
            return Err(NodeError::BadParameter(format!(
                "pool '{}' already registered",
                name
            )));
        }
        let id = PoolId(inner.pools.len() as u32);
        inner.pools.push(Pool {
            name: name.to_string(),
            provider,
            clients: Vec::new(),
        });
        info!("Registered resource pool '{}' as {:?}", name, id);
        Ok(id)
    }

    pub fn pool_id(&self, name: &str) -> Option<PoolId> {
        let inner = self.inner.lock();
        inner
            .pools
            .iter()
            .position(|p| p.name == name)
            .map(|i| PoolId(i as u32))
    }

    pub fn pool_name(&self, pool: PoolId) -> Option<String> {
        self.inner.lock().pool(pool).ok().map(|p| p.name.clone())
    }

    pub fn pool_names(&self) -> Vec<String> {
        self.inner.lock().pools.iter().map(|p| p.name.clone()).collect()
    }

    /// Current holders of `pool`, in registration order.
    pub fn holders(&self, pool: PoolId) -> Vec<(ClientId, ResourceHandle)> {
        let inner = self.inner.lock();
        inner
            .pool(pool)
            .map(|p| {
                p.clients
                    .iter()
                    .filter_map(|c| c.handle.map(|h| (c.id, h)))
                    .collect()
            })
            .unwrap_or_default()
    }

    /// Clients still waiting on `pool`, in registration order.
    pub fn waiters(&self, pool: PoolId) -> Vec<ClientId> {
        let inner = self.inner.lock();
        inner
            .pool(pool)
            .map(|p| {
                p.clients
                    .iter()
                    .filter(|c| c.is_waiting())
                    .map(|c| c.id)
                    .collect()
            })
            .unwrap_or_default()
    }

    // ── Client operations ──

    /// One-shot acquisition. The request is not remembered on failure.
    pub fn acquire(
        &self,
        client: ClientId,
        callbacks: Arc<dyn ResourceClient>,
        priority: Priority,
        pool: PoolId,
        request: ResourceRequest,
    ) -> NodeResult<ResourceHandle> {
        let mut inner = self.inner.lock();
        let seq = inner.next_seq();
        let p = inner.pool_mut(pool)?;
        let handle = p
            .provider
            .acquire(&request)
            .ok_or(NodeError::InsufficientResources)?;
        p.clients.push(ClientEntry {
            id: client,
            callbacks,
            priority,
            request,
            handle: Some(handle),
            reclaiming: false,
            seq,
        });
        debug!("{} acquired {:?} from '{}'", client, handle, p.name);
        Ok(handle)
    }

    /// Queue a request and arbitrate. The outcome arrives via `on_acquired`.
    pub fn wait_for(
        &self,
        client: ClientId,
        callbacks: Arc<dyn ResourceClient>,
        priority: Priority,
        pool: PoolId,
        request: ResourceRequest,
    ) -> NodeResult<()> {
        {
            let mut inner = self.inner.lock();
            let seq = inner.next_seq();
            let p = inner.pool_mut(pool)?;
            p.clients.push(ClientEntry {
                id: client,
                callbacks,
                priority,
                request,
                handle: None,
                reclaiming: false,
                seq,
            });
            debug!("{} waiting on '{}' at {:?}", client, p.name, priority);
        }
        self.arbitrate(pool);
        Ok(())
    }

    /// Withdraw every still-waiting request of `client` on `pool`.
    pub fn cancel_wait(&self, client: ClientId, pool: PoolId) -> NodeResult<()> {
        let mut inner = self.inner.lock();
        let p = inner.pool_mut(pool)?;
        p.clients.retain(|c| !(c.id == client && c.is_waiting()));
        Ok(())
    }

    /// Return a unit and hand it to the best waiter.
    pub fn release(&self, pool: PoolId, handle: ResourceHandle) -> NodeResult<()> {
        {
            let mut inner = self.inner.lock();
            let p = inner.pool_mut(pool)?;
            let pos = p
                .clients
                .iter()
                .position(|c| c.handle == Some(handle))
                .ok_or_else(|| {
                    NodeError::BadParameter(format!("{:?} is not held in '{}'", handle, p.name))
                })?;
            let entry = p.clients.remove(pos);
            p.provider.release(handle);
            debug!("{} released {:?} to '{}'", entry.id, handle, p.name);
        }
        self.arbitrate(pool);
        Ok(())
    }

    // ── Arbitration ──

    fn arbitrate(&self, pool: PoolId) {
        let mut granted: Vec<(Arc<dyn ResourceClient>, Option<ResourceHandle>)> = Vec::new();
        let mut inner = self.inner.lock();

        loop {
            let Ok(p) = inner.pool_mut(pool) else {
                break;
            };
            let Some(best) = p.best_waiter() else {
                break;
            };

            let request = p.clients[best].request;
            if let Some(handle) = p.provider.acquire(&request) {
                let entry = &mut p.clients[best];
                entry.handle = Some(handle);
                debug!("{} granted {:?} from '{}'", entry.id, handle, p.name);
                granted.push((Arc::clone(&entry.callbacks), Some(handle)));
                continue;
            }

            let waiter = p.clients[best].priority;
            let Some(victim) = p.victim_for(&waiter) else {
                // Nothing left to demote: fail whoever will not wait.
                let name = p.name.clone();
                p.clients.retain(|c| {
                    if c.is_waiting() && !c.priority.wait_indefinitely {
                        debug!("{} failed on '{}'", c.id, name);
                        granted.push((Arc::clone(&c.callbacks), None));
                        false
                    } else {
                        true
                    }
                });
                break;
            };

            let group = p.clients[victim].priority.group_id;
            let mut reclaims = Vec::new();
            for c in p.clients.iter_mut() {
                if let Some(handle) = c.handle {
                    if c.priority.group_id == group && !c.reclaiming {
                        c.reclaiming = true;
                        reclaims.push(Reclaim {
                            seq: c.seq,
                            client: c.id,
                            callbacks: Arc::clone(&c.callbacks),
                            handle,
                        });
                    }
                }
            }
            info!(
                "Reclaiming {} unit(s) of '{}' from group {}",
                reclaims.len(),
                p.name,
                group
            );

            drop(inner);
            for r in &reclaims {
                r.callbacks.on_reclaimed(pool, r.handle);
            }
            inner = self.inner.lock();

            let Ok(p) = inner.pool_mut(pool) else {
                break;
            };
            for r in reclaims {
                // The client may have released it during the callback.
                if let Some(pos) = p
                    .clients
                    .iter()
                    .position(|c| c.seq == r.seq && c.handle == Some(r.handle))
                {
                    p.clients.remove(pos);
                    p.provider.release(r.handle);
                    debug!("{} reclaimed {:?} in '{}'", r.client, r.handle, p.name);
                }
            }
        }

        drop(inner);
        for (callbacks, handle) in granted {
            if handle.is_none() {
                warn!("Resource wait on {:?} failed", pool);
            }
            callbacks.on_acquired(pool, handle);
        }
    }
}

impl Default for ResourceBroker {
    fn default() -> Self {
        Self::new()
    }
}
