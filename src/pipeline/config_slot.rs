//! Synchronous configuration requests.
//!
//! `Node::set_config` must apply a setting on the worker thread while the
//! caller waits. The node keeps a single-entry slot guarded by its own mutex,
//! separate from the worker mutex, so the caller never contends with a worker
//! pass that is already running:
//!
//! 1. The caller parks the request (`Pending`) and triggers the worker.
//! 2. The worker picks it up (`Processing`), applies it, stores the result
//!    (`Complete`) and signals the condvar.
//! 3. The caller waits up to a timeout. If the worker never picked the
//!    request up, it is withdrawn and the caller gets `Timeout`; if the worker
//!    is mid-way, the caller waits for it to finish.

use crate::pipeline::error::{NodeError, NodeResult};
use parking_lot::{Condvar, Mutex};
use serde::{Deserialize, Serialize};
use std::time::{Duration, Instant};

/// Loosely typed value for behavior parameters and configs.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum ConfigValue {
    Bool(bool),
    Int(i64),
    Float(f64),
    String(String),
}

impl ConfigValue {
    pub fn as_bool(&self) -> Option<bool> {
        match self {
            ConfigValue::Bool(v) => Some(*v),
            _ => None,
        }
    }

    pub fn as_int(&self) -> Option<i64> {
        match self {
            ConfigValue::Int(v) => Some(*v),
            _ => None,
        }
    }

    pub fn as_float(&self) -> Option<f64> {
        match self {
            ConfigValue::Float(v) => Some(*v),
            ConfigValue::Int(v) => Some(*v as f64),
            _ => None,
        }
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            ConfigValue::String(v) => Some(v),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum SlotState {
    NothingPending,
    Pending,
    Processing,
    Complete,
}

#[derive(Debug)]
struct SlotInner {
    state: SlotState,
    request: Option<(String, ConfigValue)>,
    result: NodeResult<()>,
}

#[derive(Debug)]
pub(crate) struct ConfigSlot {
    inner: Mutex<SlotInner>,
    done: Condvar,
}

impl ConfigSlot {
    pub fn new() -> Self {
        Self {
            inner: Mutex::new(SlotInner {
                state: SlotState::NothingPending,
                request: None,
                result: Ok(()),
            }),
            done: Condvar::new(),
        }
    }

    pub fn state(&self) -> SlotState {
        self.inner.lock().state
    }

    /// Park a request. `NotReady` if another one is in flight.
    pub fn submit(&self, key: &str, value: ConfigValue) -> NodeResult<()> {
        let mut inner = self.inner.lock();
        if inner.state != SlotState::NothingPending {
            return Err(NodeError::NotReady);
        }
        inner.request = Some((key.to_string(), value));
        inner.result = Err(NodeError::Timeout);
        inner.state = SlotState::Pending;
        Ok(())
    }

    /// Worker side: claim the parked request, if any.
    pub fn begin(&self) -> Option<(String, ConfigValue)> {
        let mut inner = self.inner.lock();
        if inner.state != SlotState::Pending {
            return None;
        }
        inner.state = SlotState::Processing;
        inner.request.take()
    }

    /// Worker side: publish the result and wake the caller.
    pub fn finish(&self, result: NodeResult<()>) {
        let mut inner = self.inner.lock();
        inner.result = result;
        inner.state = SlotState::Complete;
        self.done.notify_all();
    }

    /// Caller side: wait for the worker, then reset the slot.
    ///
    /// `timeout` of `None` skips the timed wait; use it when the worker pass
    /// already ran inline on the caller's thread.
    pub fn wait(&self, timeout: Option<Duration>) -> NodeResult<()> {
        let mut inner = self.inner.lock();
        if let Some(timeout) = timeout {
            let deadline = Instant::now() + timeout;
            while inner.state == SlotState::Pending {
                if self.done.wait_until(&mut inner, deadline).timed_out() {
                    break;
                }
            }
        }
        while inner.state == SlotState::Processing {
            self.done.wait(&mut inner);
        }
        if inner.state == SlotState::Pending {
            inner.request = None;
            inner.result = Err(NodeError::Timeout);
        }
        inner.state = SlotState::NothingPending;
        std::mem::replace(&mut inner.result, Ok(()))
    }
}

impl Default for ConfigSlot {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    #[test]
    fn test_config_value_accessors() {
        assert_eq!(ConfigValue::Bool(true).as_bool(), Some(true));
        assert_eq!(ConfigValue::Int(42).as_int(), Some(42));
        assert_eq!(ConfigValue::Int(2).as_float(), Some(2.0));
        assert_eq!(ConfigValue::String("hello".into()).as_str(), Some("hello"));
        assert_eq!(ConfigValue::Float(1.5).as_int(), None);
    }

    #[test]
    fn test_second_submit_is_not_ready() {
        let slot = ConfigSlot::new();
        slot.submit("gain", ConfigValue::Int(1)).unwrap();
        assert_eq!(
            slot.submit("gain", ConfigValue::Int(2)),
            Err(NodeError::NotReady)
        );
    }

    #[test]
    fn test_unclaimed_request_times_out() {
        let slot = ConfigSlot::new();
        slot.submit("gain", ConfigValue::Int(1)).unwrap();
        let result = slot.wait(Some(Duration::from_millis(10)));
        assert_eq!(result, Err(NodeError::Timeout));
        assert_eq!(slot.state(), SlotState::NothingPending);
        assert!(slot.begin().is_none());
    }

    #[test]
    fn test_worker_completes_request() {
        let slot = Arc::new(ConfigSlot::new());
        slot.submit("gain", ConfigValue::Int(3)).unwrap();

        let worker = {
            let slot = Arc::clone(&slot);
            std::thread::spawn(move || {
                let (key, value) = slot.begin().unwrap();
                assert_eq!(key, "gain");
                assert_eq!(value, ConfigValue::Int(3));
                slot.finish(Err(NodeError::UnsupportedSetting(key)));
            })
        };

        let result = slot.wait(Some(Duration::from_secs(2)));
        worker.join().unwrap();
        assert_eq!(result, Err(NodeError::UnsupportedSetting("gain".into())));
        assert_eq!(slot.state(), SlotState::NothingPending);
    }
}
