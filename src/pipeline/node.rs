//! Processing nodes.
//!
//! A `Node` owns an ordered set of ports, a command queue, a configuration
//! slot and a boxed [`NodeBehavior`]. External drivers and tunnel peers call
//! the methods here from any thread; all state changes and buffer processing
//! happen later in [`Node::run_worker`], serialized by the worker mutex.
//!
//! Lock layout:
//! - `worker`: behavior plus lifecycle bookkeeping; held for a whole pass.
//! - one mutex per port: queues and population state.
//! - `commands`, `config`, `resources`, `shared`: small independent locks.
//!
//! No port lock is held while calling into a tunnel peer, and port-level
//! entry points used by peers never take the worker mutex.
//!
//! Events raised during a worker pass wait in the node's outbox and reach
//! the [`EventSink`] once the pass has dropped the worker mutex, so a sink
//! may call back into any node from `on_event`.

use crate::broker::{Priority, ResourceBroker, ResourceHandle};
use crate::config::NodeSettings;
use crate::pipeline::behavior::NodeBehavior;
use crate::pipeline::buffer::{Buffer, Memory};
use crate::pipeline::command::{Command, CommandQueue};
use crate::pipeline::config_slot::{ConfigSlot, ConfigValue};
use crate::pipeline::error::{NodeError, NodeResult, Rejected, TransferResult};
use crate::pipeline::event::{Event, EventSink};
use crate::pipeline::id::{NodeId, PoolId};
use crate::pipeline::port::{Port, PortDefinition, PortDirection, PortStats};
use crate::pipeline::resources::{NodeClient, ResourceTracker};
use crate::pipeline::scheduler::WorkerTrigger;
use crate::pipeline::state::{NodeState, ResourcesState, StateCell};
use crate::pipeline::tunnel::{negotiate_supplier, SharedSlots, SupplierRole, TunnelLink, TunnelSetup};
use parking_lot::Mutex;
use std::cell::RefCell;
use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;
use tracing::{debug, info, trace};

/// Interface version a node implements. Tunnel peers must agree on `major`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Version {
    pub major: u8,
    pub minor: u8,
}

impl Version {
    pub const CURRENT: Version = Version { major: 1, minor: 1 };

    pub fn is_compatible(self, other: Version) -> bool {
        self.major == other.major
    }
}

/// Collaborators every node needs.
#[derive(Clone)]
pub struct NodeEnv {
    pub broker: Arc<ResourceBroker>,
    pub events: Arc<dyn EventSink>,
    pub trigger: Arc<dyn WorkerTrigger>,
    pub settings: NodeSettings,
    /// Pool every node takes one unit of, if registered with the broker.
    pub thread_pool: Option<String>,
}

/// State touched only by the worker pass.
pub(crate) struct WorkerState {
    pub behavior: Box<dyn NodeBehavior>,
    pub was_executing: bool,
    pub unpopulated_checks: u32,
    pub loss_reported: bool,
    /// Head `SetState` already announced to `pre_check_change_state`.
    pub prechecked: Option<Command>,
}

thread_local! {
    /// Nodes whose worker pass is running on this thread, innermost last.
    static ACTIVE_PASSES: RefCell<Vec<NodeId>> = const { RefCell::new(Vec::new()) };
}

/// Marks a node's pass as running on the current thread until dropped.
pub(crate) struct PassGuard;

impl PassGuard {
    pub(crate) fn enter(id: NodeId) -> PassGuard {
        ACTIVE_PASSES.with(|active| active.borrow_mut().push(id));
        PassGuard
    }
}

impl Drop for PassGuard {
    fn drop(&mut self) {
        ACTIVE_PASSES.with(|active| {
            active.borrow_mut().pop();
        });
    }
}

enum PassContext {
    None,
    Own,
    Other,
}

fn pass_context(id: NodeId) -> PassContext {
    ACTIVE_PASSES.with(|active| {
        let active = active.borrow();
        if active.is_empty() {
            PassContext::None
        } else if active.contains(&id) {
            PassContext::Own
        } else {
            PassContext::Other
        }
    })
}

pub struct Node {
    id: NodeId,
    name: String,
    version: Version,
    pub(crate) status: StateCell,
    pub(crate) ports: Vec<Mutex<Port>>,
    pub(crate) shared: Mutex<Vec<SharedSlots>>,
    pub(crate) worker: Mutex<WorkerState>,
    pub(crate) commands: Mutex<CommandQueue>,
    pub(crate) config: ConfigSlot,
    pub(crate) resources: Mutex<ResourceTracker>,
    pub(crate) client: Arc<NodeClient>,
    pub(crate) env: NodeEnv,
    outbox: Mutex<VecDeque<Event>>,
    dispatching: Mutex<()>,
    scheduled: AtomicBool,
    weak_self: Weak<Node>,
}

impl Node {
    /// Build a node in `Loaded` around `behavior` and call its `open` hook.
    pub fn new(
        id: NodeId,
        name: impl Into<String>,
        behavior: Box<dyn NodeBehavior>,
        env: NodeEnv,
    ) -> NodeResult<Arc<Node>> {
        let name = name.into();
        let descriptors = behavior.ports();
        let mut ports: Vec<Port> = descriptors
            .iter()
            .enumerate()
            .map(|(i, d)| Port::new(i, d))
            .collect();

        for (input, output) in behavior.sharing_candidates() {
            let valid = ports.get(input).map(|p| p.direction) == Some(PortDirection::Input)
                && ports.get(output).map(|p| p.direction) == Some(PortDirection::Output);
            if !valid {
                return Err(NodeError::BadParameter(format!(
                    "sharing pair ({}, {}) must be (input, output)",
                    input, output
                )));
            }
            ports[input].candidates.push(output);
            ports[output].candidates.push(input);
        }

        let mut pools: Vec<PoolId> = Vec::new();
        if let Some(thread_pool) = env.thread_pool.as_deref() {
            if let Some(pool) = env.broker.pool_id(thread_pool) {
                pools.push(pool);
            }
        }
        for resource in behavior.resources() {
            let pool = env.broker.pool_id(&resource).ok_or_else(|| {
                NodeError::BadParameter(format!("unknown resource pool '{}'", resource))
            })?;
            pools.push(pool);
        }

        let queue_depth = env.settings.command_queue_depth;
        let priority = Priority {
            group_id: id.0,
            ..Priority::default()
        };

        let node = Arc::new_cyclic(|weak: &Weak<Node>| Node {
            id,
            name,
            version: Version::CURRENT,
            status: StateCell::new(NodeState::Loaded),
            ports: ports.into_iter().map(Mutex::new).collect(),
            shared: Mutex::new(Vec::new()),
            worker: Mutex::new(WorkerState {
                behavior,
                was_executing: false,
                unpopulated_checks: 0,
                loss_reported: false,
                prechecked: None,
            }),
            commands: Mutex::new(CommandQueue::new(queue_depth)),
            config: ConfigSlot::new(),
            resources: Mutex::new(ResourceTracker::new(pools, priority)),
            client: Arc::new(NodeClient::new(weak.clone())),
            env,
            outbox: Mutex::new(VecDeque::new()),
            dispatching: Mutex::new(()),
            scheduled: AtomicBool::new(false),
            weak_self: weak.clone(),
        });

        node.worker.lock().behavior.open(id)?;
        info!(
            "Created node {} '{}' with {} port(s)",
            node.id,
            node.name,
            node.ports.len()
        );
        Ok(node)
    }

    // ── Identity ──

    pub fn id(&self) -> NodeId {
        self.id
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn version(&self) -> Version {
        self.version
    }

    pub fn check_version(&self, caller: Version) -> NodeResult<()> {
        if self.version.is_compatible(caller) {
            Ok(())
        } else {
            Err(NodeError::VersionMismatch)
        }
    }

    pub fn state(&self) -> NodeState {
        self.status.current()
    }

    pub fn pending_state(&self) -> NodeState {
        self.status.pending()
    }

    pub fn port_count(&self) -> usize {
        self.ports.len()
    }

    pub(crate) fn port(&self, index: usize) -> NodeResult<&Mutex<Port>> {
        self.ports.get(index).ok_or(NodeError::BadPortIndex(index))
    }

    pub(crate) fn self_arc(&self) -> Option<Arc<Node>> {
        self.weak_self.upgrade()
    }

    /// Raise an event. Delivery waits while a worker pass runs on this
    /// thread; a pass of another node hands delivery to this node's next pass.
    pub(crate) fn emit(&self, event: Event) {
        trace!("{} event {:?}", self.id, event);
        self.outbox.lock().push_back(event);
        match pass_context(self.id) {
            PassContext::None => self.dispatch_events(),
            PassContext::Own => {}
            PassContext::Other => self.trigger(),
        }
    }

    /// Deliver queued events in order. Only one thread delivers at a time;
    /// a nested call from inside `on_event` leaves the work to the outer one.
    pub(crate) fn dispatch_events(&self) {
        loop {
            let Some(guard) = self.dispatching.try_lock() else {
                return;
            };
            loop {
                let batch = std::mem::take(&mut *self.outbox.lock());
                if batch.is_empty() {
                    break;
                }
                for event in batch {
                    self.env.events.on_event(event);
                }
            }
            drop(guard);
            if self.outbox.lock().is_empty() {
                return;
            }
        }
    }

    /// Request a worker pass.
    pub fn trigger(&self) {
        if !self.scheduled.swap(true, Ordering::AcqRel) {
            self.env.trigger.schedule(self.weak_self.clone(), None);
        }
    }

    /// Scheduler entry point: clear the queued flag and run one pass.
    pub(crate) fn run_scheduled(&self) -> crate::pipeline::behavior::WorkStatus {
        self.scheduled.store(false, Ordering::Release);
        self.run_worker()
    }

    // ── Ports ──

    pub fn port_definition(&self, port: usize) -> NodeResult<PortDefinition> {
        Ok(self.port(port)?.lock().definition())
    }

    pub fn port_stats(&self, port: usize) -> NodeResult<PortStats> {
        Ok(self.port(port)?.lock().stats)
    }

    /// Change requested buffer count and size. Only in `Loaded` or on a
    /// disabled port.
    pub fn set_port_definition(&self, port: usize, count: usize, size: usize) -> NodeResult<()> {
        let state = self.state();
        let mut p = self.port(port)?.lock();
        if state != NodeState::Loaded && p.enabled {
            return Err(NodeError::IncorrectStateOperation);
        }
        if count < p.count_min || count > p.count_max {
            return Err(NodeError::BadParameter(format!(
                "buffer count {} outside {}..={}",
                count, p.count_min, p.count_max
            )));
        }
        if size < p.size_min || size > p.size_max {
            return Err(NodeError::BadParameter(format!(
                "buffer size {} outside {}..={}",
                size, p.size_min, p.size_max
            )));
        }
        p.requested_count = count;
        p.requested_size = size;
        Ok(())
    }

    pub fn set_supplier_preference(&self, port: usize, role: SupplierRole) -> NodeResult<()> {
        let state = self.state();
        let mut p = self.port(port)?.lock();
        if state != NodeState::Loaded && p.enabled {
            return Err(NodeError::IncorrectStateOperation);
        }
        p.preference = role;
        Ok(())
    }

    pub fn buffer_supplier(&self, port: usize) -> NodeResult<SupplierRole> {
        Ok(self.port(port)?.lock().supplier)
    }

    /// Settled supplier role, pushed by the input side of a tunnel.
    pub(crate) fn set_buffer_supplier(&self, port: usize, role: SupplierRole) -> NodeResult<()> {
        let mut p = self.port(port)?.lock();
        if !p.is_tunneled() {
            return Err(NodeError::BadParameter(format!("port {} is not tunneled", port)));
        }
        p.supplier = role;
        Ok(())
    }

    /// Adopt the buffer count and size chosen by the supplier of a tunnel.
    pub(crate) fn apply_tunnel_requirements(
        &self,
        port: usize,
        count: usize,
        size: usize,
    ) -> NodeResult<()> {
        let changed = {
            let mut p = self.port(port)?.lock();
            if p.n_buffers > 0 {
                return Ok(());
            }
            let count = count.min(p.count_max);
            let size = size.min(p.size_max);
            let changed = (p.requested_count, p.requested_size) != (count, size);
            p.requested_count = count;
            p.requested_size = size;
            changed
        };
        if changed {
            debug!("{} port {} settings changed by tunnel peer", self.id, port);
            self.emit(Event::PortSettingsChanged { node: self.id, port });
        }
        Ok(())
    }

    /// One phase of tunnel setup. `None` tears the tunnel down.
    ///
    /// The output side records the link and proposes its preference in
    /// `setup`; the input side settles the role and informs the output.
    pub fn tunnel_request(
        &self,
        port: usize,
        peer: Option<(&Arc<Node>, usize)>,
        setup: &mut TunnelSetup,
    ) -> NodeResult<()> {
        let state = self.state();
        if state == NodeState::Invalid {
            return Err(NodeError::InvalidState);
        }
        {
            let p = self.port(port)?.lock();
            if state != NodeState::Loaded && p.enabled {
                return Err(NodeError::IncorrectStateOperation);
            }
        }

        let Some((peer, peer_port)) = peer else {
            let released = self.release_port_resources(port);
            let mut p = self.port(port)?.lock();
            p.tunnel = None;
            p.supplier = SupplierRole::Unspecified;
            p.sharing.clear();
            p.reusing = false;
            debug!("{} port {} untunneled", self.id, port);
            return match released {
                Err(e) if !e.is_not_ready() => Err(e),
                _ => Ok(()),
            };
        };

        peer.check_version(self.version)?;
        let peer_def = peer.port_definition(peer_port)?;

        let mut p = self.port(port)?.lock();
        if peer_def.direction == p.direction || peer_def.domain != p.domain {
            return Err(NodeError::PortsNotCompatible);
        }
        p.tunnel = Some(TunnelLink::new(peer, peer_port));

        match p.direction {
            PortDirection::Output => {
                setup.supplier = p.preference;
                Ok(())
            }
            PortDirection::Input => {
                let role = negotiate_supplier(p.preference, setup.supplier);
                p.supplier = role;
                setup.supplier = role;
                drop(p);
                if let Err(e) = peer.set_buffer_supplier(peer_port, role) {
                    let mut p = self.port(port)?.lock();
                    p.tunnel = None;
                    p.supplier = SupplierRole::Unspecified;
                    return Err(e);
                }
                debug!(
                    "{} port {} tunneled to {}:{} (supplier {:?})",
                    self.id,
                    port,
                    peer.id(),
                    peer_port,
                    role
                );
                Ok(())
            }
        }
    }

    // ── Buffer registration ──

    /// Register caller-provided storage on a non-tunneled port.
    pub fn use_buffer(&self, port: usize, data: Vec<u8>) -> NodeResult<Buffer> {
        self.check_external(port)?;
        self.register_buffer(port, Memory::from_vec(data), None)
    }

    /// Allocate storage for a non-tunneled port and register it.
    pub fn allocate_buffer(&self, port: usize, size: usize) -> NodeResult<Buffer> {
        self.check_external(port)?;
        self.register_buffer(port, Memory::allocate(size), None)
    }

    fn check_external(&self, port: usize) -> NodeResult<()> {
        if self.port(port)?.lock().is_tunneled() {
            return Err(NodeError::IncorrectStateOperation);
        }
        Ok(())
    }

    /// Create a header over `memory` on `port`. Used by external callers and
    /// by the supplier side of a tunnel.
    pub(crate) fn register_buffer(
        &self,
        port: usize,
        memory: Memory,
        peer_port: Option<usize>,
    ) -> NodeResult<Buffer> {
        let state = self.state();
        if state == NodeState::Invalid {
            return Err(NodeError::InvalidState);
        }
        let mut p = self.port(port)?.lock();
        if state != NodeState::Loaded && p.is_ready() {
            return Err(NodeError::IncorrectStateOperation);
        }
        if p.n_buffers >= p.count_max {
            return Err(NodeError::InsufficientResources);
        }
        if memory.capacity() < p.requested_size {
            return Err(NodeError::BadParameter(format!(
                "buffer of {} bytes is smaller than required {}",
                memory.capacity(),
                p.requested_size
            )));
        }

        let mut buffer = Buffer::new(p.n_buffers, self.id, memory.clone());
        match p.direction {
            PortDirection::Input => {
                buffer.set_input_port(port);
                if let Some(pp) = peer_port {
                    buffer.set_output_port(pp);
                }
            }
            PortDirection::Output => {
                buffer.set_output_port(port);
                if let Some(pp) = peer_port {
                    buffer.set_input_port(pp);
                }
            }
        }
        p.n_buffers += 1;
        p.memories.push(memory);

        let now_populated = !p.populated && p.n_buffers >= p.requested_count;
        if now_populated {
            p.populated = true;
        }
        trace!("{} port {} registered buffer {}", self.id, port, buffer.index());
        drop(p);

        if now_populated {
            debug!("{} port {} populated", self.id, port);
            self.trigger();
        }
        Ok(buffer)
    }

    /// Give a header back to the port that registered it.
    pub fn free_buffer(&self, port: usize, buffer: Buffer) -> TransferResult {
        if self.state() == NodeState::WaitForResources {
            return Err(Rejected::new(NodeError::IncorrectStateOperation, buffer));
        }
        let lock = match self.port(port) {
            Ok(lock) => lock,
            Err(e) => return Err(Rejected::new(e, buffer)),
        };
        let mut p = lock.lock();
        let side = match p.direction {
            PortDirection::Input => buffer.input_port(),
            PortDirection::Output => buffer.output_port(),
        };
        if buffer.node() != self.id || side != Some(port) {
            return Err(Rejected::new(
                NodeError::BadParameter(format!("buffer was not registered on port {}", port)),
                buffer,
            ));
        }
        if p.is_supplier() {
            return Err(Rejected::new(
                NodeError::BadParameter("supplier ports free their own buffers".into()),
                buffer,
            ));
        }

        let was_populated = p.populated;
        p.populated = false;
        p.n_buffers = p.n_buffers.saturating_sub(1);
        if p.n_buffers == 0 {
            p.clear_pool();
        }
        drop(p);
        drop(buffer);

        if was_populated {
            if let Err(e) = self.return_port_buffers(port) {
                debug!("{} port {} return after free: {}", self.id, port, e);
            }
            self.trigger();
        }
        Ok(())
    }

    // ── Buffer handoff ──

    /// Node-level gate for buffers arriving from peers or the driver.
    fn check_handoff(&self, port: usize) -> NodeResult<()> {
        let state = self.state();
        let pending = self.pending_state();
        if !state.is_running() && !pending.is_running() {
            return Err(NodeError::NotReady);
        }
        // While draining toward Idle only suppliers take buffers back.
        if pending == NodeState::Idle && !self.port(port)?.lock().is_supplier() {
            return Err(NodeError::NotReady);
        }
        Ok(())
    }

    /// Hand a full buffer to an input port.
    pub fn empty_this_buffer(&self, port: usize, buffer: Buffer) -> TransferResult {
        if let Err(e) = self.check_handoff(port) {
            return Err(Rejected::new(e, buffer));
        }
        self.accept_full(port, buffer)?;
        self.trigger();
        Ok(())
    }

    /// Hand an empty buffer to an output port.
    pub fn fill_this_buffer(&self, port: usize, buffer: Buffer) -> TransferResult {
        if let Err(e) = self.check_handoff(port) {
            return Err(Rejected::new(e, buffer));
        }
        self.accept_empty(port, buffer)?;
        self.trigger();
        Ok(())
    }

    pub(crate) fn accept_full(&self, port: usize, buffer: Buffer) -> TransferResult {
        let lock = match self.port(port) {
            Ok(lock) => lock,
            Err(e) => return Err(Rejected::new(e, buffer)),
        };
        let mut p = lock.lock();
        if p.direction != PortDirection::Input {
            return Err(Rejected::new(NodeError::BadPortIndex(port), buffer));
        }
        if !p.is_ready() {
            let e = p.not_accepting_error();
            return Err(Rejected::new(e, buffer));
        }
        p.stats.empty_this_buffer_calls += 1;
        let slot = buffer.index();
        let sharing = p.is_sharing();
        trace!("{} port {} full buffer {}", self.id, port, slot);
        p.queue.push_back(buffer);
        drop(p);

        if sharing {
            self.assign_shared(port, slot, port);
        }
        Ok(())
    }

    pub(crate) fn accept_empty(&self, port: usize, buffer: Buffer) -> TransferResult {
        let lock = match self.port(port) {
            Ok(lock) => lock,
            Err(e) => return Err(Rejected::new(e, buffer)),
        };
        let mut p = lock.lock();
        if p.direction != PortDirection::Output {
            return Err(Rejected::new(NodeError::BadPortIndex(port), buffer));
        }
        if !p.is_ready() {
            let e = p.not_accepting_error();
            return Err(Rejected::new(e, buffer));
        }
        p.stats.fill_this_buffer_calls += 1;
        let slot = buffer.index();
        let sibling = p.sharing.first().copied();
        trace!("{} port {} empty buffer {}", self.id, port, slot);
        p.queue.push_back(buffer);
        drop(p);

        if let Some(input) = sibling {
            self.assign_shared(port, slot, input);
            self.release_parked(input, slot);
        }
        Ok(())
    }

    // ── Sharing bookkeeping ──

    /// Give `slot` to `owner` in every shared pair involving `via`.
    pub(crate) fn assign_shared(&self, via: usize, slot: usize, owner: usize) {
        let mut shared = self.shared.lock();
        for pair in shared.iter_mut().filter(|s| s.involves(via) && s.involves(owner)) {
            pair.assign(slot, owner);
        }
    }

    /// True if `port` may hand `slot` on. A fan-out input needs the slot back
    /// from every output it shares with; ports outside any shared pair own
    /// everything they hold.
    pub(crate) fn owns_shared(&self, port: usize, slot: usize) -> bool {
        let shared = self.shared.lock();
        shared
            .iter()
            .filter(|s| s.involves(port))
            .all(|s| s.is_owner(slot, port))
    }

    /// Release a parked buffer once ownership of its slot came back.
    fn release_parked(&self, port: usize, slot: usize) {
        let parked = {
            let Ok(lock) = self.port(port) else {
                return;
            };
            let mut p = lock.lock();
            let pos = p.held.iter().position(|b| b.index() == slot);
            pos.map(|i| p.held.swap_remove(i))
        };
        if let Some(buffer) = parked {
            if let Err(e) = self.release_buffer(port, buffer) {
                debug!("{} port {} parked release: {}", self.id, port, e);
            }
        }
    }

    // ── Commands ──

    /// Queue a command. Its effect happens on a later worker pass.
    pub fn send_command(&self, command: Command) -> NodeResult<()> {
        if self.state() == NodeState::Invalid {
            return Err(NodeError::InvalidState);
        }
        command.validate(self.ports.len())?;
        self.commands.lock().push(command)?;
        debug!("{} queued {:?}", self.id, command);
        self.trigger();
        Ok(())
    }

    pub fn queued_commands(&self) -> usize {
        self.commands.lock().len()
    }

    // ── Parameters and configs ──

    pub fn get_parameter(&self, key: &str) -> NodeResult<ConfigValue> {
        if self.state() == NodeState::Invalid {
            return Err(NodeError::InvalidState);
        }
        self.worker.lock().behavior.get_parameter(key)
    }

    pub fn set_parameter(&self, key: &str, value: ConfigValue) -> NodeResult<()> {
        if self.state() == NodeState::Invalid {
            return Err(NodeError::InvalidState);
        }
        self.worker.lock().behavior.set_parameter(key, value)
    }

    pub fn get_config(&self, key: &str) -> NodeResult<ConfigValue> {
        if self.state() == NodeState::Invalid {
            return Err(NodeError::InvalidState);
        }
        self.worker.lock().behavior.get_config(key)
    }

    /// Apply a config on the worker and wait for the result.
    ///
    /// Returns `NotReady` if another request is in flight and `Timeout` if
    /// the worker did not pick the request up in time.
    pub fn set_config(&self, key: &str, value: ConfigValue) -> NodeResult<()> {
        if self.state() == NodeState::Invalid {
            return Err(NodeError::InvalidState);
        }
        if let Err(e) = self.config.submit(key, value) {
            self.trigger();
            return Err(e);
        }
        if self.env.trigger.is_threaded() {
            self.trigger();
            self.config
                .wait(Some(Duration::from_millis(self.env.settings.set_config_timeout_ms)))
        } else {
            self.run_worker();
            self.config.wait(None)
        }
    }

    /// `set_config`, retrying while the slot is busy.
    pub fn set_config_with_retry(&self, key: &str, value: ConfigValue) -> NodeResult<()> {
        let retries = self.env.settings.set_config_retries;
        let interval = Duration::from_millis(self.env.settings.set_config_retry_interval_ms);
        let mut attempt = 0;
        loop {
            match self.set_config(key, value.clone()) {
                Err(NodeError::NotReady) if attempt < retries => {
                    attempt += 1;
                    std::thread::sleep(interval);
                }
                other => return other,
            }
        }
    }

    /// Worker side of `set_config`. Caller holds the worker mutex.
    pub(crate) fn perform_pending_config(&self, ws: &mut WorkerState) {
        if let Some((key, value)) = self.config.begin() {
            debug!("{} applying config '{}'", self.id, key);
            let result = ws.behavior.set_config(&key, value);
            self.config.finish(result);
        }
    }

    // ── Resources ──

    pub fn priority(&self) -> Priority {
        self.resources.lock().priority
    }

    pub fn set_priority(&self, priority: Priority) {
        self.resources.lock().priority = priority;
    }

    pub fn resources_state(&self) -> ResourcesState {
        self.resources.lock().state
    }

    /// Handles currently held, by pool.
    pub fn resource_handles(&self) -> Vec<(PoolId, Option<ResourceHandle>)> {
        let tracker = self.resources.lock();
        tracker
            .pools
            .iter()
            .copied()
            .zip(tracker.handles.iter().copied())
            .collect()
    }

    /// Call the behavior's `close` hook. Only in `Loaded` or `Invalid`.
    pub fn close(&self) -> NodeResult<()> {
        match self.state() {
            NodeState::Loaded | NodeState::Invalid => self.worker.lock().behavior.close(),
            _ => Err(NodeError::IncorrectStateOperation),
        }
    }
}

impl std::fmt::Debug for Node {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Node")
            .field("id", &self.id)
            .field("name", &self.name)
            .field("state", &self.state())
            .field("ports", &self.ports.len())
            .finish()
    }
}
