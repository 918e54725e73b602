//! Resource providers: the allocators behind each broker pool.

use crate::broker::client::{ResourceHandle, ResourceRequest};
use parking_lot::Mutex;

/// Hands out and takes back units of one resource pool.
#[cfg_attr(test, mockall::automock)]
pub trait ResourceProvider: Send + Sync {
    /// Try to serve `request`. `None` when the pool is exhausted.
    fn acquire(&self, request: &ResourceRequest) -> Option<ResourceHandle>;

    fn release(&self, handle: ResourceHandle);

    /// Total units, if the provider knows it.
    fn capacity(&self) -> Option<usize> {
        None
    }
}

/// Fixed number of interchangeable slots.
///
/// A request for `units` slots is served all at once or not at all, and the
/// handle it returns gives every one of them back on release.
#[derive(Debug)]
pub struct CountingProvider {
    inner: Mutex<Slots>,
}

#[derive(Debug)]
struct Slots {
    owners: Vec<Option<ResourceHandle>>,
    next_handle: u64,
}

impl CountingProvider {
    pub fn new(capacity: usize) -> Self {
        Self {
            inner: Mutex::new(Slots {
                owners: vec![None; capacity],
                next_handle: 1,
            }),
        }
    }

    pub fn in_use(&self) -> usize {
        self.inner.lock().owners.iter().filter(|o| o.is_some()).count()
    }
}

impl ResourceProvider for CountingProvider {
    fn acquire(&self, request: &ResourceRequest) -> Option<ResourceHandle> {
        let wanted = request.units as usize;
        if wanted == 0 {
            return None;
        }
        let mut slots = self.inner.lock();
        let free: Vec<usize> = slots
            .owners
            .iter()
            .enumerate()
            .filter(|(_, o)| o.is_none())
            .map(|(i, _)| i)
            .take(wanted)
            .collect();
        if free.len() < wanted {
            return None;
        }
        let handle = ResourceHandle(slots.next_handle);
        slots.next_handle += 1;
        for i in free {
            slots.owners[i] = Some(handle);
        }
        Some(handle)
    }

    fn release(&self, handle: ResourceHandle) {
        let mut slots = self.inner.lock();
        let mut freed = 0;
        for owner in slots.owners.iter_mut().filter(|o| **o == Some(handle)) {
            *owner = None;
            freed += 1;
        }
        if freed == 0 {
            tracing::warn!("release of unknown handle {:?}", handle);
        }
    }

    fn capacity(&self) -> Option<usize> {
        Some(self.inner.lock().owners.len())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_counting_provider_exhausts_and_recovers() {
        let provider = CountingProvider::new(2);
        let request = ResourceRequest::default();
        let a = provider.acquire(&request).unwrap();
        let b = provider.acquire(&request).unwrap();
        assert_ne!(a, b);
        assert!(provider.acquire(&request).is_none());
        assert_eq!(provider.in_use(), 2);

        provider.release(a);
        let c = provider.acquire(&request).unwrap();
        assert_ne!(c, b);
        assert_eq!(provider.in_use(), 2);
        assert_eq!(provider.capacity(), Some(2));
    }

    #[test]
    fn test_multi_unit_request_is_all_or_nothing() {
        let provider = CountingProvider::new(2);
        assert_eq!(provider.acquire(&ResourceRequest { units: 3 }), None);
        assert_eq!(provider.in_use(), 0);

        let pair = provider.acquire(&ResourceRequest { units: 2 }).unwrap();
        assert_eq!(provider.in_use(), 2);
        assert!(provider.acquire(&ResourceRequest::default()).is_none());

        provider.release(pair);
        assert_eq!(provider.in_use(), 0);
        assert!(provider.acquire(&ResourceRequest { units: 2 }).is_some());
    }

    #[test]
    fn test_zero_units_are_refused() {
        let provider = CountingProvider::new(1);
        assert_eq!(provider.acquire(&ResourceRequest { units: 0 }), None);
    }

    #[test]
    fn test_unknown_handle_is_ignored() {
        let provider = CountingProvider::new(1);
        provider.release(ResourceHandle(0));
        provider.release(ResourceHandle(9));
        assert_eq!(provider.in_use(), 0);
    }
}
