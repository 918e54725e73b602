//! Client-facing broker types.

use crate::pipeline::id::PoolId;
use serde::{Deserialize, Serialize};
use std::fmt;

/// Scheduling priority of a resource client. Lower `group_priority` wins.
///
/// Clients sharing a `group_id` are demoted together when one of them is
/// chosen as a reclaim victim.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Priority {
    pub group_id: u32,
    pub group_priority: u32,
    /// Keep waiting even while a better client holds the pool.
    #[serde(default = "default_wait_indefinitely")]
    pub wait_indefinitely: bool,
}

fn default_wait_indefinitely() -> bool {
    true
}

impl Priority {
    pub fn new(group_id: u32, group_priority: u32) -> Self {
        Self {
            group_id,
            group_priority,
            wait_indefinitely: true,
        }
    }

    pub fn one_shot(mut self) -> Self {
        self.wait_indefinitely = false;
        self
    }

    /// Strictly higher priority than `other`.
    #[inline]
    pub fn outranks(&self, other: &Priority) -> bool {
        self.group_priority < other.group_priority
    }
}

impl Default for Priority {
    fn default() -> Self {
        Self::new(0, 100)
    }
}

/// Opaque token for one unit of a pool, issued by its provider.
#[derive(Clone, Copy, PartialEq, Eq, Hash)]
pub struct ResourceHandle(pub u64);

impl fmt::Debug for ResourceHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "ResourceHandle({:#x})", self.0)
    }
}

/// What a client asks a provider for.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ResourceRequest {
    pub units: u32,
}

impl Default for ResourceRequest {
    fn default() -> Self {
        Self { units: 1 }
    }
}

/// Callbacks the broker invokes on a client. Always called with the broker
/// lock released, so implementations may call back into the broker.
pub trait ResourceClient: Send + Sync {
    /// A waited-for resource arrived, or the wait was failed (`None`).
    fn on_acquired(&self, pool: PoolId, handle: Option<ResourceHandle>);

    /// The broker is taking `handle` back for a higher-priority client.
    fn on_reclaimed(&self, pool: PoolId, handle: ResourceHandle);
}
