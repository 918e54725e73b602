//! Node lifecycle states and the transition table.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::atomic::{AtomicU8, Ordering};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NodeState {
    Loaded,
    WaitForResources,
    Idle,
    Executing,
    Pause,
    Invalid,
}

impl NodeState {
    pub const ALL: [NodeState; 6] = [
        NodeState::Loaded,
        NodeState::WaitForResources,
        NodeState::Idle,
        NodeState::Executing,
        NodeState::Pause,
        NodeState::Invalid,
    ];

    /// True if `self -> target` is in the transition table.
    pub fn can_transition_to(self, target: NodeState) -> bool {
        use NodeState::*;
        match (self, target) {
            (Invalid, _) => false,
            (_, Invalid) => true,
            (Loaded, Idle | WaitForResources) => true,
            (WaitForResources, Idle | Loaded) => true,
            (Idle, Pause | Executing | Loaded) => true,
            (Executing, Idle | Pause) => true,
            (Pause, Executing | Idle) => true,
            _ => false,
        }
    }

    /// States in which buffers flow.
    pub fn is_running(self) -> bool {
        matches!(self, NodeState::Executing | NodeState::Pause)
    }

    fn as_u8(self) -> u8 {
        match self {
            NodeState::Loaded => 0,
            NodeState::WaitForResources => 1,
            NodeState::Idle => 2,
            NodeState::Executing => 3,
            NodeState::Pause => 4,
            NodeState::Invalid => 5,
        }
    }

    fn from_u8(v: u8) -> Self {
        match v {
            0 => NodeState::Loaded,
            1 => NodeState::WaitForResources,
            2 => NodeState::Idle,
            3 => NodeState::Executing,
            4 => NodeState::Pause,
            _ => NodeState::Invalid,
        }
    }
}

impl fmt::Display for NodeState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            NodeState::Loaded => "Loaded",
            NodeState::WaitForResources => "WaitForResources",
            NodeState::Idle => "Idle",
            NodeState::Executing => "Executing",
            NodeState::Pause => "Pause",
            NodeState::Invalid => "Invalid",
        };
        f.write_str(name)
    }
}

/// Current and pending state, readable by tunnel peers without the worker lock.
#[derive(Debug)]
pub(crate) struct StateCell {
    current: AtomicU8,
    pending: AtomicU8,
}

impl StateCell {
    pub fn new(state: NodeState) -> Self {
        Self {
            current: AtomicU8::new(state.as_u8()),
            pending: AtomicU8::new(state.as_u8()),
        }
    }

    pub fn current(&self) -> NodeState {
        NodeState::from_u8(self.current.load(Ordering::Acquire))
    }

    pub fn pending(&self) -> NodeState {
        NodeState::from_u8(self.pending.load(Ordering::Acquire))
    }

    pub fn set_pending(&self, state: NodeState) {
        self.pending.store(state.as_u8(), Ordering::Release);
    }

    /// Commit a transition: current and pending both become `state`.
    pub fn commit(&self, state: NodeState) {
        self.pending.store(state.as_u8(), Ordering::Release);
        self.current.store(state.as_u8(), Ordering::Release);
    }
}

/// How much of its declared resource set a node holds.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ResourcesState {
    #[default]
    HaveNone,
    HaveSome,
    /// Every resource arrived through asynchronous waits; not yet committed.
    Provided,
    HaveAll,
    /// The broker took at least one resource back.
    Reclaimed,
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn test_table_spot_checks() {
        use NodeState::*;
        assert!(Loaded.can_transition_to(Idle));
        assert!(Loaded.can_transition_to(WaitForResources));
        assert!(!Loaded.can_transition_to(Executing));
        assert!(Executing.can_transition_to(Pause));
        assert!(!Executing.can_transition_to(Loaded));
        assert!(Pause.can_transition_to(Idle));
        assert!(Idle.can_transition_to(Invalid));
        assert!(!Invalid.can_transition_to(Loaded));
        assert!(!Invalid.can_transition_to(Invalid));
    }

    #[test]
    fn test_state_cell_commit() {
        let cell = StateCell::new(NodeState::Loaded);
        cell.set_pending(NodeState::Idle);
        assert_eq!(cell.current(), NodeState::Loaded);
        assert_eq!(cell.pending(), NodeState::Idle);
        cell.commit(NodeState::Idle);
        assert_eq!(cell.current(), NodeState::Idle);
    }

    fn any_state() -> impl Strategy<Value = NodeState> {
        prop::sample::select(NodeState::ALL.to_vec())
    }

    proptest! {
        #[test]
        fn test_roundtrip_and_invalid_is_terminal(s in any_state(), t in any_state()) {
            prop_assert_eq!(NodeState::from_u8(s.as_u8()), s);
            if s == NodeState::Invalid {
                prop_assert!(!s.can_transition_to(t));
            }
            if t == NodeState::Invalid && s != NodeState::Invalid {
                prop_assert!(s.can_transition_to(t));
            }
        }
    }
}
