//! Tunnel negotiation and buffer-sharing decisions.
//!
//! A tunnel pairs an output port with an input port of another node. Setup is
//! two-phase: the output side proposes its supplier preference, then the input
//! side settles the role and tells the output. The settled supplier allocates
//! buffer storage; the other side only registers headers over it.
//!
//! Sharing is a separate, node-local decision: an input and an output of the
//! same node may reuse one set of buffer storage so a pass-through needs no
//! copy. Exactly one of the two sibling ports owns each shared slot at any
//! time; [`SharedSlots`] records that owner.

use crate::pipeline::error::{NodeError, NodeResult};
use crate::pipeline::id::NodeId;
use crate::pipeline::node::Node;
use crate::pipeline::port::PortDirection;
use serde::{Deserialize, Serialize};
use std::sync::{Arc, Weak};
use tracing::warn;

/// Which side of a tunnel allocates buffers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SupplierRole {
    #[default]
    Unspecified,
    Input,
    Output,
}

/// Applied whenever the two sides disagree or neither has a preference.
pub const TIE_BREAK: SupplierRole = SupplierRole::Input;

/// State carried between the two phases of tunnel setup.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct TunnelSetup {
    pub supplier: SupplierRole,
}

/// Input-side decision given the input's own preference and the output's proposal.
pub fn negotiate_supplier(own: SupplierRole, proposed: SupplierRole) -> SupplierRole {
    let mut choice = proposed;
    if own != SupplierRole::Unspecified && own != proposed {
        choice = if proposed == SupplierRole::Unspecified {
            own
        } else {
            TIE_BREAK
        };
    }
    if choice == SupplierRole::Unspecified {
        choice = TIE_BREAK;
    }
    choice
}

/// True if a port in `direction` with this settled role allocates buffers.
pub fn is_supplier(direction: PortDirection, tunneled: bool, role: SupplierRole) -> bool {
    tunneled
        && matches!(
            (direction, role),
            (PortDirection::Input, SupplierRole::Input)
                | (PortDirection::Output, SupplierRole::Output)
        )
}

/// Connect `output:out_port` to `input:in_port`.
///
/// The output side is asked first; if the input side refuses, the output's
/// half of the link is torn down again. Returns the settled supplier role.
pub fn setup_tunnel(
    output: &Arc<Node>,
    out_port: usize,
    input: &Arc<Node>,
    in_port: usize,
) -> NodeResult<SupplierRole> {
    let mut setup = TunnelSetup::default();
    output.tunnel_request(out_port, Some((input, in_port)), &mut setup)?;
    if let Err(e) = input.tunnel_request(in_port, Some((output, out_port)), &mut setup) {
        warn!(
            "tunnel {}:{} -> {}:{} refused by input: {}",
            output.id(),
            out_port,
            input.id(),
            in_port,
            e
        );
        if let Err(undo) = output.tunnel_request(out_port, None, &mut TunnelSetup::default()) {
            warn!("rollback of {}:{} failed: {}", output.id(), out_port, undo);
        }
        return Err(e);
    }
    Ok(setup.supplier)
}

/// Remove the tunnel between `output:out_port` and `input:in_port`.
/// Both halves are attempted; the first error is returned.
pub fn teardown_tunnel(
    output: &Arc<Node>,
    out_port: usize,
    input: &Arc<Node>,
    in_port: usize,
) -> NodeResult<()> {
    let first = input.tunnel_request(in_port, None, &mut TunnelSetup::default());
    let second = output.tunnel_request(out_port, None, &mut TunnelSetup::default());
    first.and(second)
}

/// Link from a port to its tunnel peer.
#[derive(Clone)]
pub(crate) struct TunnelLink {
    pub node: Weak<Node>,
    pub node_id: NodeId,
    pub port: usize,
}

impl TunnelLink {
    pub fn new(node: &Arc<Node>, port: usize) -> Self {
        Self {
            node: Arc::downgrade(node),
            node_id: node.id(),
            port,
        }
    }

    pub fn peer(&self) -> NodeResult<Arc<Node>> {
        self.node
            .upgrade()
            .ok_or_else(|| NodeError::Undefined(format!("tunnel peer {} dropped", self.node_id)))
    }
}

impl std::fmt::Debug for TunnelLink {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "TunnelLink({}:{})", self.node_id.0, self.port)
    }
}

/// Snapshot of the port fields the sharing decision reads.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SharingView {
    pub index: usize,
    pub direction: PortDirection,
    pub enabled: bool,
    pub tunneled: bool,
    pub supplier: SupplierRole,
}

impl SharingView {
    fn is_settled(&self) -> bool {
        !self.tunneled || self.supplier != SupplierRole::Unspecified
    }

    fn eligible(&self) -> bool {
        self.enabled && self.tunneled
    }
}

/// Decide which sibling ports `port` shares storage with.
///
/// Returns `NotReady` while the port's own supplier role, or that of any
/// enabled tunneled candidate, is still unresolved.
pub fn decide_sharing(port: &SharingView, candidates: &[SharingView]) -> NodeResult<Vec<usize>> {
    if !port.enabled || !port.tunneled || candidates.is_empty() {
        return Ok(Vec::new());
    }
    if port.supplier == SupplierRole::Unspecified {
        return Err(NodeError::NotReady);
    }
    if candidates.iter().any(|c| c.enabled && !c.is_settled()) {
        return Err(NodeError::NotReady);
    }

    let shared = match port.direction {
        PortDirection::Input if candidates.len() > 1 => candidates
            .iter()
            .filter(|c| c.eligible() && c.supplier == SupplierRole::Output)
            .map(|c| c.index)
            .collect(),
        PortDirection::Input => {
            let c = &candidates[0];
            let share = c.eligible()
                && (port.supplier == SupplierRole::Input || c.supplier == SupplierRole::Output);
            if share {
                vec![c.index]
            } else {
                Vec::new()
            }
        }
        PortDirection::Output => {
            let c = &candidates[0];
            let share = c.eligible()
                && (port.supplier == SupplierRole::Output || c.supplier == SupplierRole::Input);
            if share {
                vec![c.index]
            } else {
                Vec::new()
            }
        }
    };
    Ok(shared)
}

/// Ownership of shared slots between one input and one output of a node.
#[derive(Debug, Clone)]
pub(crate) struct SharedSlots {
    pub input: usize,
    pub output: usize,
    owners: Vec<usize>,
}

impl SharedSlots {
    pub fn new(input: usize, output: usize, count: usize, owner: usize) -> Self {
        debug_assert!(owner == input || owner == output);
        Self {
            input,
            output,
            owners: vec![owner; count],
        }
    }

    pub fn involves(&self, port: usize) -> bool {
        self.input == port || self.output == port
    }

    pub fn sibling_of(&self, port: usize) -> usize {
        if port == self.input {
            self.output
        } else {
            self.input
        }
    }

    pub fn len(&self) -> usize {
        self.owners.len()
    }

    pub fn owner(&self, slot: usize) -> Option<usize> {
        self.owners.get(slot).copied()
    }

    pub fn is_owner(&self, slot: usize, port: usize) -> bool {
        self.owner(slot) == Some(port)
    }

    pub fn assign(&mut self, slot: usize, port: usize) {
        debug_assert!(self.involves(port));
        if let Some(owner) = self.owners.get_mut(slot) {
            *owner = port;
        }
    }

    pub fn owned_by(&self, port: usize) -> usize {
        self.owners.iter().filter(|&&o| o == port).count()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    fn view(index: usize, direction: PortDirection, supplier: SupplierRole) -> SharingView {
        SharingView {
            index,
            direction,
            enabled: true,
            tunneled: true,
            supplier,
        }
    }

    #[test]
    fn test_negotiation_table() {
        use SupplierRole::*;
        assert_eq!(negotiate_supplier(Unspecified, Unspecified), Input);
        assert_eq!(negotiate_supplier(Unspecified, Output), Output);
        assert_eq!(negotiate_supplier(Output, Unspecified), Output);
        assert_eq!(negotiate_supplier(Input, Output), TIE_BREAK);
        assert_eq!(negotiate_supplier(Output, Output), Output);
    }

    #[test]
    fn test_is_supplier_requires_tunnel() {
        assert!(is_supplier(PortDirection::Input, true, SupplierRole::Input));
        assert!(!is_supplier(PortDirection::Input, false, SupplierRole::Input));
        assert!(!is_supplier(PortDirection::Output, true, SupplierRole::Input));
    }

    #[test]
    fn test_unsettled_role_is_not_ready() {
        let input = view(0, PortDirection::Input, SupplierRole::Unspecified);
        let output = view(1, PortDirection::Output, SupplierRole::Output);
        assert_eq!(decide_sharing(&input, &[output]), Err(NodeError::NotReady));

        let input = view(0, PortDirection::Input, SupplierRole::Input);
        let output = view(1, PortDirection::Output, SupplierRole::Unspecified);
        assert_eq!(decide_sharing(&input, &[output]), Err(NodeError::NotReady));
    }

    #[test]
    fn test_supplier_input_shares_with_single_output() {
        let input = view(0, PortDirection::Input, SupplierRole::Input);
        let output = view(1, PortDirection::Output, SupplierRole::Input);
        assert_eq!(decide_sharing(&input, &[output]), Ok(vec![1]));
        assert_eq!(decide_sharing(&output, &[input]), Ok(vec![0]));
    }

    #[test]
    fn test_no_sharing_when_neither_side_supplies() {
        let input = view(0, PortDirection::Input, SupplierRole::Output);
        let output = view(1, PortDirection::Output, SupplierRole::Input);
        assert_eq!(decide_sharing(&input, &[output]), Ok(vec![]));
    }

    #[test]
    fn test_fan_out_shares_with_supplier_outputs_only() {
        let input = view(0, PortDirection::Input, SupplierRole::Output);
        let a = view(1, PortDirection::Output, SupplierRole::Output);
        let b = view(2, PortDirection::Output, SupplierRole::Input);
        let c = view(3, PortDirection::Output, SupplierRole::Output);
        assert_eq!(decide_sharing(&input, &[a, b, c]), Ok(vec![1, 3]));
    }

    #[test]
    fn test_untunneled_port_never_shares() {
        let mut input = view(0, PortDirection::Input, SupplierRole::Unspecified);
        input.tunneled = false;
        let output = view(1, PortDirection::Output, SupplierRole::Output);
        assert_eq!(decide_sharing(&input, &[output]), Ok(vec![]));
    }

    proptest! {
        #[test]
        fn test_shared_slots_have_exactly_one_owner(
            ops in prop::collection::vec((0usize..4, prop::bool::ANY), 0..64)
        ) {
            let mut slots = SharedSlots::new(0, 1, 4, 1);
            for (slot, to_input) in ops {
                slots.assign(slot, if to_input { 0 } else { 1 });
                for s in 0..slots.len() {
                    let owner = slots.owner(s).unwrap();
                    prop_assert!(slots.is_owner(s, 0) != slots.is_owner(s, 1));
                    prop_assert!(owner == 0 || owner == 1);
                }
                prop_assert_eq!(slots.owned_by(0) + slots.owned_by(1), 4);
            }
        }
    }
}
