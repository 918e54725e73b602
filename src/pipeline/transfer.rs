//! Buffer movement across ports, tunnels and the driver callbacks.
//!
//! Every function here locks one port at a time and drops the lock before
//! calling a tunnel peer or the event sink. Buffers that cannot be handed on
//! go to the port's `pending` list; nothing is dropped.

use crate::pipeline::buffer::{Buffer, BufferArena, Memory};
use crate::pipeline::error::{NodeError, NodeResult, Rejected, TransferResult};
use crate::pipeline::event::Event;
use crate::pipeline::node::Node;
use crate::pipeline::port::PortDirection;
use crate::pipeline::state::NodeState;
use crate::pipeline::tunnel::{decide_sharing, is_supplier, SharedSlots, SupplierRole, TunnelLink};
use tracing::{debug, trace, warn};

impl Node {
    // ── Worker-side buffer access ──

    /// Make the next queued buffer current on `port`.
    ///
    /// An output sharing storage with an input only takes the slot the input
    /// currently holds, so both sides work on the same memory.
    pub(crate) fn get_next_buffer(&self, port: usize) -> bool {
        let Ok(lock) = self.port(port) else {
            return false;
        };
        let sibling = {
            let p = lock.lock();
            if !p.is_ready() {
                return false;
            }
            match p.direction {
                PortDirection::Output => p.sharing.first().copied(),
                PortDirection::Input => None,
            }
        };

        let preferred = match sibling {
            Some(input) => {
                let slot = self
                    .ports
                    .get(input)
                    .and_then(|s| s.lock().current.as_ref().map(Buffer::index));
                match slot {
                    Some(slot) => Some(slot),
                    None => return false,
                }
            }
            None => None,
        };

        let mut p = lock.lock();
        if let Some(slot) = preferred {
            if p.current.is_none() && !p.queue.iter().any(|b| b.index() == slot) {
                return false;
            }
        }
        p.take_next(preferred)
    }

    /// An input EOS is only reported when no output of this node is active.
    fn eos_event_allowed(&self, port: usize) -> bool {
        let is_output = self
            .ports
            .get(port)
            .is_some_and(|p| p.lock().direction == PortDirection::Output);
        is_output
            || !self.ports.iter().enumerate().any(|(i, lock)| {
                let p = lock.lock();
                i != port && p.direction == PortDirection::Output && p.is_ready()
            })
    }

    fn emit_buffer_events(&self, port: usize, buffer: &mut Buffer, eos_allowed: bool) {
        if !buffer.send_events {
            return;
        }
        if buffer.is_eos() && eos_allowed {
            debug!("{} port {} end of stream", self.id(), port);
            self.emit(Event::BufferFlag {
                node: self.id(),
                port,
                flags: buffer.flags,
            });
        }
        if let Some(mark) = buffer.mark {
            if mark.target == self.id() {
                self.emit(Event::Mark {
                    node: self.id(),
                    data: mark.data,
                });
                buffer.mark = None;
            }
        }
    }

    /// Hand a buffer to the tunnel peer, or to the driver when untunneled.
    fn hand_off(
        &self,
        direction: PortDirection,
        link: Option<&TunnelLink>,
        buffer: Buffer,
    ) -> TransferResult {
        match link {
            Some(link) => {
                let peer = match link.peer() {
                    Ok(peer) => peer,
                    Err(e) => return Err(Rejected::new(e, buffer)),
                };
                match direction {
                    PortDirection::Input => peer.fill_this_buffer(link.port, buffer),
                    PortDirection::Output => peer.empty_this_buffer(link.port, buffer),
                }
            }
            None => match direction {
                PortDirection::Input => self.env.events.empty_buffer_done(self.id(), buffer),
                PortDirection::Output => self.env.events.fill_buffer_done(self.id(), buffer),
            },
        }
    }

    /// Hand a consumed buffer back toward its producer.
    pub(crate) fn release_buffer(&self, port: usize, mut buffer: Buffer) -> NodeResult<()> {
        let eos_allowed = self.eos_event_allowed(port);
        let lock = self.port(port)?;
        let (direction, link, sharing) = {
            let mut p = lock.lock();
            if !p.is_ready() {
                let e = p.not_accepting_error();
                p.pending.push_back(buffer);
                return Err(e);
            }
            p.stats.released += 1;
            (p.direction, p.tunnel.clone(), p.is_sharing())
        };

        self.emit_buffer_events(port, &mut buffer, eos_allowed);

        if sharing && !self.owns_shared(port, buffer.index()) {
            trace!("{} port {} parks shared slot {}", self.id(), port, buffer.index());
            lock.lock().held.push(buffer);
            return Ok(());
        }

        match direction {
            PortDirection::Input => {
                if link.is_none() && self.state() == NodeState::Pause {
                    lock.lock().pending.push_back(buffer);
                    return Ok(());
                }
                match self.hand_off(direction, link.as_ref(), buffer) {
                    Ok(()) => Ok(()),
                    Err(rejected) => {
                        trace!("{} port {} release deferred: {}", self.id(), port, rejected.error);
                        lock.lock().pending.push_back(rejected.buffer);
                        if rejected.error == NodeError::NotReady {
                            Ok(())
                        } else {
                            Err(rejected.error)
                        }
                    }
                }
            }
            PortDirection::Output => {
                lock.lock().queue.push_back(buffer);
                Ok(())
            }
        }
    }

    /// Send a filled buffer downstream.
    pub(crate) fn deliver_full_buffer(&self, port: usize, mut buffer: Buffer) -> NodeResult<()> {
        let eos_allowed = self.eos_event_allowed(port);
        let lock = self.port(port)?;
        let (link, sharing) = {
            let mut p = lock.lock();
            if p.direction != PortDirection::Output {
                if p.current.is_none() {
                    p.current = Some(buffer);
                } else {
                    p.pending.push_back(buffer);
                }
                return Err(NodeError::BadParameter(format!(
                    "port {} is not an output",
                    port
                )));
            }
            if !p.is_ready() {
                let e = p.not_accepting_error();
                p.pending.push_back(buffer);
                return Err(e);
            }
            p.stats.delivered += 1;
            (p.tunnel.clone(), p.is_sharing())
        };

        self.emit_buffer_events(port, &mut buffer, eos_allowed);
        if sharing {
            self.assign_shared(port, buffer.index(), port);
        }

        trace!("{} port {} delivers buffer {}", self.id(), port, buffer.index());
        match self.hand_off(PortDirection::Output, link.as_ref(), buffer) {
            Ok(()) => Ok(()),
            Err(rejected) => {
                lock.lock().pending.push_back(rejected.buffer);
                if rejected.error == NodeError::NotReady {
                    Ok(())
                } else {
                    Err(rejected.error)
                }
            }
        }
    }

    /// Retry buffers that could not be handed on earlier, in order.
    pub(crate) fn send_pending(&self, port: usize) -> NodeResult<()> {
        let lock = self.port(port)?;
        let (direction, link) = {
            let p = lock.lock();
            (p.direction, p.tunnel.clone())
        };
        loop {
            let Some(buffer) = lock.lock().pending.pop_front() else {
                return Ok(());
            };
            if let Err(rejected) = self.hand_off(direction, link.as_ref(), buffer) {
                lock.lock().pending.push_front(rejected.buffer);
                return Err(rejected.error);
            }
        }
    }

    pub(crate) fn has_pending(&self, port: usize) -> bool {
        self.ports
            .get(port)
            .is_some_and(|p| !p.lock().pending.is_empty())
    }

    // ── Flush, return, start ──

    /// Return every buffer of `port` to whoever fills it next.
    pub(crate) fn flush_port(&self, port: usize) -> NodeResult<()> {
        let lock = self.port(port)?;
        let mut p = lock.lock();
        if p.n_buffers == 0 {
            return Ok(());
        }

        if p.is_tunneled() && p.direction == PortDirection::Output {
            if let Some(current) = p.current.as_mut() {
                current.filled_len = 0;
            }
            while let Some(buffer) = p.pending.pop_front() {
                p.queue.push_back(buffer);
            }
            return Ok(());
        }

        // Oldest first: parked handoffs, the buffer in work, then the queue.
        let mut outgoing: Vec<Buffer> = p.pending.drain(..).collect();
        outgoing.extend(p.current.take());
        outgoing.extend(p.queue.drain(..));
        p.stats.flushed += outgoing.len() as u64;
        let direction = p.direction;
        let link = p.tunnel.clone();
        drop(p);

        let mut outgoing = outgoing.into_iter();
        while let Some(mut buffer) = outgoing.next() {
            buffer.clear_payload();
            if let Err(rejected) = self.hand_off(direction, link.as_ref(), buffer) {
                debug!("{} port {} flush stalled: {}", self.id(), port, rejected.error);
                let mut p = lock.lock();
                p.pending.push_back(rejected.buffer);
                p.pending.extend(outgoing);
                return Err(NodeError::NotReady);
            }
        }
        self.send_pending(port)
    }

    /// Return buffers that belong elsewhere on the way out of a running
    /// state. Suppliers gather theirs back at rest.
    pub(crate) fn return_port_buffers(&self, port: usize) -> NodeResult<()> {
        let lock = self.port(port)?;
        let mut p = lock.lock();
        if p.n_buffers == 0 {
            return Ok(());
        }
        let direction = p.direction;
        let link = p.tunnel.clone();

        if link.is_some() && p.reusing {
            // At rest a reusing port parks every header and the sibling owns
            // the slot.
            let mut rest: Vec<Buffer> = p.pending.drain(..).collect();
            rest.extend(p.current.take());
            if direction == PortDirection::Input {
                rest.extend(p.queue.drain(..));
            }
            let slots: Vec<usize> = rest.iter().map(Buffer::index).collect();
            for mut buffer in rest {
                buffer.clear_payload();
                match direction {
                    PortDirection::Input => p.held.push(buffer),
                    PortDirection::Output => p.queue.push_back(buffer),
                }
            }
            p.started = false;
            let sibling = p.sharing.first().copied();
            drop(p);
            if let Some(sibling) = sibling {
                for slot in slots {
                    self.assign_shared(port, slot, sibling);
                }
            }
            return Ok(());
        }

        if link.is_some() && p.is_supplier() {
            if let Some(mut current) = p.current.take() {
                current.clear_payload();
                p.queue.push_back(current);
            }
            while let Some(mut buffer) = p.pending.pop_front() {
                buffer.clear_payload();
                p.queue.push_back(buffer);
            }
            p.started = false;
            return Ok(());
        }

        let mut outgoing: Vec<Buffer> = p.queue.drain(..).collect();
        outgoing.extend(p.current.take());
        p.stats.returned += outgoing.len() as u64;
        let shares_output = direction == PortDirection::Output && p.is_sharing();
        p.started = false;
        drop(p);

        for mut buffer in outgoing {
            buffer.filled_len = 0;
            if shares_output {
                self.assign_shared(port, buffer.index(), port);
            }
            if let Err(rejected) = self.hand_off(direction, link.as_ref(), buffer) {
                trace!("{} port {} return deferred: {}", self.id(), port, rejected.error);
                lock.lock().pending.push_back(rejected.buffer);
            }
        }
        if let Err(e) = self.send_pending(port) {
            trace!("{} port {} pending after return: {}", self.id(), port, e);
        }
        Ok(())
    }

    /// Start a port. A supplier input without sharing hands every buffer to
    /// its peer for filling.
    pub(crate) fn start_port(&self, port: usize) -> NodeResult<()> {
        let lock = self.port(port)?;
        let mut p = lock.lock();
        let feeds_peer = p.is_tunneled()
            && p.direction == PortDirection::Input
            && p.supplier == SupplierRole::Input
            && !p.is_sharing()
            && !p.started;
        if !feeds_peer {
            p.started = true;
            return Ok(());
        }

        let mut outgoing: Vec<Buffer> = p.pending.drain(..).collect();
        outgoing.extend(p.queue.drain(..));
        let mut at_rest = std::mem::take(&mut p.held);
        at_rest.sort_by_key(Buffer::index);
        outgoing.extend(at_rest);
        let link = p.tunnel.clone();
        drop(p);

        debug!("{} port {} starting with {} buffer(s)", self.id(), port, outgoing.len());
        let mut outgoing = outgoing.into_iter();
        while let Some(mut buffer) = outgoing.next() {
            buffer.clear_payload();
            if let Err(rejected) = self.hand_off(PortDirection::Input, link.as_ref(), buffer) {
                debug!("{} port {} start stalled: {}", self.id(), port, rejected.error);
                let mut p = lock.lock();
                p.pending.push_back(rejected.buffer);
                p.pending.extend(outgoing);
                return Err(NodeError::NotReady);
            }
        }
        lock.lock().started = true;
        Ok(())
    }

    /// True once every supplier port holds all of its buffers again.
    pub(crate) fn can_stop(&self, was_executing: bool) -> bool {
        self.ports.iter().all(|lock| {
            let p = lock.lock();
            if !p.is_tunneled() {
                return true;
            }
            let must_hold = p.reusing
                || (p.is_supplier() && (p.direction == PortDirection::Output || was_executing));
            if must_hold && p.in_hand() < p.n_buffers {
                trace!(
                    "{} port {} waits for buffers ({} of {})",
                    self.id(),
                    p.index,
                    p.in_hand(),
                    p.n_buffers
                );
                return false;
            }
            true
        })
    }

    // ── Population ──

    /// Decide sharing for every port that holds no buffers yet.
    pub(crate) fn decide_all_sharing(&self) -> NodeResult<()> {
        let snapshot: Vec<_> = self
            .ports
            .iter()
            .map(|lock| {
                let p = lock.lock();
                (p.sharing_view(), p.candidates.clone(), p.n_buffers > 0, p.sharing.clone())
            })
            .collect();

        let mut decided: Vec<Option<Vec<usize>>> = Vec::with_capacity(snapshot.len());
        for (view, candidates, has_buffers, _) in &snapshot {
            if *has_buffers {
                decided.push(None);
                continue;
            }
            let views: Vec<_> = candidates.iter().map(|&c| snapshot[c].0).collect();
            decided.push(Some(decide_sharing(view, &views)?));
        }

        // Sharing is mutual; drop links the sibling did not choose.
        let chosen: Vec<Vec<usize>> = decided
            .iter()
            .zip(&snapshot)
            .map(|(d, s)| d.clone().unwrap_or_else(|| s.3.clone()))
            .collect();

        for (index, decision) in decided.into_iter().enumerate() {
            let Some(mut sharing) = decision else {
                continue;
            };
            sharing.retain(|&sibling| chosen[sibling].contains(&index));
            let view = snapshot[index].0;
            let sibling_supplies = sharing.iter().any(|&s| {
                let v = snapshot[s].0;
                is_supplier(v.direction, v.tunneled, v.supplier)
            });

            let mut p = self.ports[index].lock();
            p.reusing = p.is_supplier()
                && !sharing.is_empty()
                && !(view.direction == PortDirection::Input && sibling_supplies);
            if !sharing.is_empty() {
                debug!(
                    "{} port {} shares with {:?}{}",
                    self.id(),
                    index,
                    sharing,
                    if p.reusing { " (reusing)" } else { "" }
                );
            }
            p.sharing = sharing;
        }
        Ok(())
    }

    /// Settle buffer count and size with the peer and its sharing siblings.
    fn merge_requirements(&self, port: usize, link: &TunnelLink) -> NodeResult<(usize, usize)> {
        let peer = link.peer()?;
        let peer_def = peer.port_definition(link.port)?;
        let (mut count, mut size, siblings) = {
            let p = self.port(port)?.lock();
            (
                p.requested_count.max(peer_def.buffer_count_min),
                p.requested_size.max(peer_def.buffer_size),
                p.sharing.clone(),
            )
        };
        for &sibling in &siblings {
            let s = self.port(sibling)?.lock();
            count = count.max(s.requested_count);
            size = size.max(s.requested_size);
        }
        for &index in std::iter::once(&port).chain(siblings.iter()) {
            let mut p = self.port(index)?.lock();
            if p.n_buffers == 0 {
                p.requested_count = count.min(p.count_max);
                p.requested_size = size.min(p.size_max);
            }
        }
        self.port(port)?.lock().requirements_merged = true;
        trace!("{} port {} requires {} x {} bytes", self.id(), port, count, size);
        Ok((count, size))
    }

    /// Populate `port` through its tunnel, or check that the driver did.
    pub(crate) fn create_tunnel(&self, port: usize) -> NodeResult<()> {
        let lock = self.port(port)?;
        let (link, supplier, reusing, sibling, merged, n) = {
            let mut p = lock.lock();
            let Some(link) = p.tunnel.clone() else {
                if p.n_buffers < p.requested_count {
                    return if p.enabled {
                        Err(NodeError::NotReady)
                    } else {
                        Ok(())
                    };
                }
                p.populated = true;
                return Ok(());
            };
            if p.supplier == SupplierRole::Unspecified {
                return Err(NodeError::NotReady);
            }
            if !p.is_supplier() {
                if p.n_buffers >= p.requested_count {
                    p.populated = true;
                    return Ok(());
                }
                return Err(NodeError::NotReady);
            }
            if p.populated {
                return Ok(());
            }
            (
                link,
                p.is_supplier(),
                p.reusing,
                p.sharing.first().copied(),
                p.requirements_merged,
                p.n_buffers,
            )
        };
        debug_assert!(supplier);

        let memories: Vec<Memory> = match (reusing, sibling) {
            (true, Some(sibling)) => {
                self.create_tunnel(sibling)?;
                let memories = self.port(sibling)?.lock().memories.clone();
                let size = memories.iter().map(Memory::capacity).min().unwrap_or(0);
                link.peer()?
                    .apply_tunnel_requirements(link.port, memories.len(), size)?;
                let mut p = lock.lock();
                p.requested_count = memories.len();
                p.requirements_merged = true;
                memories
            }
            _ => {
                let (count, size) = if merged && n > 0 {
                    let p = lock.lock();
                    (p.requested_count, p.requested_size)
                } else {
                    self.merge_requirements(port, &link)?
                };
                link.peer()?.apply_tunnel_requirements(link.port, count, size)?;
                let arena = BufferArena::new(count.saturating_sub(n), size);
                let mut memories = lock.lock().memories.clone();
                memories.extend((0..arena.len()).filter_map(|slot| arena.memory(slot)));
                memories
            }
        };

        let peer = link.peer()?;
        for memory in memories.into_iter().skip(n) {
            let buffer = peer.register_buffer(link.port, memory.clone(), Some(port))?;
            let mut p = lock.lock();
            p.n_buffers += 1;
            p.memories.push(memory);
            match p.direction {
                PortDirection::Output => p.queue.push_back(buffer),
                PortDirection::Input => p.held.push(buffer),
            }
        }

        let mut p = lock.lock();
        p.populated = p.n_buffers >= p.requested_count;
        if !p.populated {
            return Err(NodeError::NotReady);
        }
        let count = p.n_buffers;
        let direction = p.direction;
        drop(p);

        if let (true, Some(sibling)) = (reusing, sibling) {
            let (input, output) = match direction {
                PortDirection::Input => (port, sibling),
                PortDirection::Output => (sibling, port),
            };
            let mut shared = self.shared.lock();
            shared.retain(|s| !(s.involves(input) && s.involves(output)));
            shared.push(SharedSlots::new(input, output, count, sibling));
        }
        debug!(
            "{} port {} populated {} buffer(s) through tunnel to {:?}",
            self.id(),
            port,
            count,
            link
        );
        Ok(())
    }

    /// Free tunnel buffers. Suppliers free their headers on the peer;
    /// everyone waits until its count reaches zero.
    pub(crate) fn release_port_resources(&self, port: usize) -> NodeResult<()> {
        let lock = self.port(port)?;
        let mut first_error = None;

        let (supplier, link, buffers) = {
            let mut p = lock.lock();
            let supplier = p.is_supplier();
            let buffers = if supplier { p.take_all() } else { Vec::new() };
            (supplier, p.tunnel.clone(), buffers)
        };

        if supplier {
            let peer = link.as_ref().map(TunnelLink::peer);
            for buffer in buffers {
                match (&peer, &link) {
                    (Some(Ok(peer)), Some(link)) => match peer.free_buffer(link.port, buffer) {
                        Ok(()) => {
                            let mut p = lock.lock();
                            p.n_buffers = p.n_buffers.saturating_sub(1);
                        }
                        Err(rejected) => {
                            warn!("{} port {} free failed: {}", self.id(), port, rejected.error);
                            first_error.get_or_insert(rejected.error);
                            lock.lock().held.push(rejected.buffer);
                        }
                    },
                    _ => {
                        // Peer is gone; the header goes with it.
                        let mut p = lock.lock();
                        p.n_buffers = p.n_buffers.saturating_sub(1);
                    }
                }
            }
        }

        let mut p = lock.lock();
        if p.n_buffers < p.requested_count {
            p.populated = false;
        }
        if p.n_buffers > 0 {
            return Err(first_error.unwrap_or(NodeError::NotReady));
        }
        p.clear_pool();
        p.sharing.clear();
        p.reusing = false;
        drop(p);
        self.shared.lock().retain(|s| !s.involves(port));
        Ok(())
    }
}
