//! Graph driver.
//!
//! A [`Graph`] owns what a set of nodes shares: the resource broker, the
//! scheduler and the event sink. It hands out node ids, wires tunnels between
//! nodes and drives every node through the same state changes.
//!
//! ```text
//!  Graph ──► Node(src) ══tunnel══► Node(copy) ══tunnel══► Node(sink)
//!    │            │                    │                      │
//!    ├── ResourceBroker ◄──────────────┴──────────────────────┘
//!    └── Scheduler (worker passes)
//! ```

use crate::broker::{Priority, ResourceBroker};
use crate::config::{GraphConfig, NodeConfig, RuntimeConfig, THREAD_POOL};
use crate::error::{MediaFlowError, Result, ResultExt};
use crate::pipeline::behavior::NodeBehavior;
use crate::pipeline::command::Command;
use crate::pipeline::event::{ChannelSink, EventSink, SinkMessage};
use crate::pipeline::id::NodeId;
use crate::pipeline::node::{Node, NodeEnv};
use crate::pipeline::nodes::build_behavior;
use crate::pipeline::port::PortStats;
use crate::pipeline::scheduler::Scheduler;
use crate::pipeline::state::NodeState;
use crate::pipeline::tunnel::{setup_tunnel, teardown_tunnel, SupplierRole};
use crossbeam_channel::Receiver;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};

/// Passes the manual scheduler may run in one `run_until_idle` call.
const MAX_IDLE_PASSES: usize = 10_000;

/// A tunnel between two nodes of the graph.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Link {
    pub from: NodeId,
    pub out_port: usize,
    pub to: NodeId,
    pub in_port: usize,
    pub supplier: SupplierRole,
}

/// Snapshot of one node for reporting.
#[derive(Debug, Clone)]
pub struct NodeReport {
    pub id: NodeId,
    pub name: String,
    pub state: NodeState,
    pub ports: Vec<PortStats>,
}

pub struct Graph {
    config: RuntimeConfig,
    broker: Arc<ResourceBroker>,
    scheduler: Scheduler,
    events: Arc<dyn EventSink>,
    nodes: Vec<Arc<Node>>,
    names: HashMap<String, NodeId>,
    links: Vec<Link>,
}

impl Graph {
    /// Graph whose events and buffer callbacks arrive on the returned channel.
    pub fn new(config: RuntimeConfig) -> Result<(Self, Receiver<SinkMessage>)> {
        let (sink, rx) = ChannelSink::new();
        let graph = Self::with_sink(config, Arc::new(sink))?;
        Ok((graph, rx))
    }

    /// Graph reporting to a caller-provided sink.
    pub fn with_sink(config: RuntimeConfig, events: Arc<dyn EventSink>) -> Result<Self> {
        config.validate()?;
        let broker = ResourceBroker::with_counting_pools(
            config.resources.iter().map(|p| (p.name.as_str(), p.capacity)),
        )
        .context("registering resource pools")?;
        let scheduler = Scheduler::new(&config.scheduler)?;
        Ok(Self {
            config,
            broker: Arc::new(broker),
            scheduler,
            events,
            nodes: Vec::new(),
            names: HashMap::new(),
            links: Vec::new(),
        })
    }

    /// Build every node and link of `description`.
    pub fn load(
        config: RuntimeConfig,
        description: &GraphConfig,
    ) -> Result<(Self, Receiver<SinkMessage>)> {
        description.validate()?;
        let (mut graph, rx) = Self::new(config)?;
        for node in &description.nodes {
            graph
                .add_from_config(node)
                .with_context(|| format!("creating node '{}'", node.name))?;
        }
        for link in &description.links {
            let (from, to) = link.endpoints()?;
            let out_id = graph.require(&from.node)?;
            let in_id = graph.require(&to.node)?;
            graph
                .connect(out_id, from.port, in_id, to.port)
                .with_context(|| format!("connecting {} -> {}", from, to))?;
        }
        Ok((graph, rx))
    }

    // ── Nodes ──

    /// Create a node around `behavior`. Ids are handed out in insertion order.
    pub fn add_node(&mut self, name: &str, behavior: Box<dyn NodeBehavior>) -> Result<NodeId> {
        if self.names.contains_key(name) {
            return Err(MediaFlowError::Graph(format!(
                "duplicate node name '{}'",
                name
            )));
        }
        let id = NodeId(self.nodes.len() as u32);
        let env = NodeEnv {
            broker: self.broker.clone(),
            events: self.events.clone(),
            trigger: self.scheduler.trigger(),
            settings: self.config.node.clone(),
            thread_pool: Some(THREAD_POOL.to_string()),
        };
        let node = Node::new(id, name, behavior, env)?;
        self.nodes.push(node);
        self.names.insert(name.to_string(), id);
        Ok(id)
    }

    /// Create a node from its description, applying priority and supplier
    /// preferences.
    pub fn add_from_config(&mut self, config: &NodeConfig) -> Result<NodeId> {
        let id = self.add_node(&config.name, build_behavior(config))?;
        let node = self.require_id(id)?;
        if let Some(group_priority) = config.group_priority {
            node.set_priority(Priority {
                group_priority,
                ..node.priority()
            });
        }
        for preference in &config.suppliers {
            node.set_supplier_preference(preference.port, preference.supplier)?;
        }
        Ok(id)
    }

    pub fn node(&self, id: NodeId) -> Option<&Arc<Node>> {
        self.nodes.get(id.index())
    }

    pub fn node_by_name(&self, name: &str) -> Option<&Arc<Node>> {
        self.names.get(name).and_then(|id| self.node(*id))
    }

    pub fn id_of(&self, name: &str) -> Option<NodeId> {
        self.names.get(name).copied()
    }

    pub fn nodes(&self) -> &[Arc<Node>] {
        &self.nodes
    }

    pub fn links(&self) -> &[Link] {
        &self.links
    }

    pub fn broker(&self) -> &Arc<ResourceBroker> {
        &self.broker
    }

    pub fn scheduler(&self) -> &Scheduler {
        &self.scheduler
    }

    pub fn config(&self) -> &RuntimeConfig {
        &self.config
    }

    fn require(&self, name: &str) -> Result<NodeId> {
        self.id_of(name)
            .ok_or_else(|| MediaFlowError::Graph(format!("unknown node '{}'", name)))
    }

    fn require_id(&self, id: NodeId) -> Result<&Arc<Node>> {
        self.node(id)
            .ok_or_else(|| MediaFlowError::Graph(format!("unknown node {}", id)))
    }

    // ── Tunnels ──

    /// Tunnel `from:out_port` to `to:in_port`. Both nodes must be in `Loaded`
    /// or have the ports disabled.
    pub fn connect(
        &mut self,
        from: NodeId,
        out_port: usize,
        to: NodeId,
        in_port: usize,
    ) -> Result<SupplierRole> {
        let output = self.require_id(from)?.clone();
        let input = self.require_id(to)?.clone();
        let supplier = setup_tunnel(&output, out_port, &input, in_port)?;
        info!(
            "Connected {}:{} -> {}:{} (supplier {:?})",
            from, out_port, to, in_port, supplier
        );
        self.links.push(Link {
            from,
            out_port,
            to,
            in_port,
            supplier,
        });
        Ok(supplier)
    }

    pub fn disconnect(
        &mut self,
        from: NodeId,
        out_port: usize,
        to: NodeId,
        in_port: usize,
    ) -> Result<()> {
        let pos = self
            .links
            .iter()
            .position(|l| l.from == from && l.out_port == out_port && l.to == to && l.in_port == in_port)
            .ok_or_else(|| {
                MediaFlowError::Graph(format!(
                    "no link {}:{} -> {}:{}",
                    from, out_port, to, in_port
                ))
            })?;
        let output = self.require_id(from)?.clone();
        let input = self.require_id(to)?.clone();
        teardown_tunnel(&output, out_port, &input, in_port)?;
        self.links.remove(pos);
        debug!("Disconnected {}:{} -> {}:{}", from, out_port, to, in_port);
        Ok(())
    }

    // ── Driving ──

    /// Queue `command` on every node.
    pub fn send_all(&self, command: Command) -> Result<()> {
        for node in &self.nodes {
            node.send_command(command)
                .with_context(|| format!("sending {:?} to {}", command, node.id()))?;
        }
        Ok(())
    }

    /// Queue `SetState(target)` on every node.
    pub fn set_state_all(&self, target: NodeState) -> Result<()> {
        info!("Moving {} node(s) to {:?}", self.nodes.len(), target);
        self.send_all(Command::SetState(target))
    }

    /// Wait until every node settled in `target` with nothing left queued.
    ///
    /// Fails early if a node drops to `Invalid` on the way.
    pub fn wait_for_state(&self, target: NodeState, timeout: Duration) -> Result<()> {
        let mut failed: Option<NodeId> = None;
        let settled = self.scheduler.pump(timeout, || {
            if target != NodeState::Invalid {
                failed = self
                    .nodes
                    .iter()
                    .find(|n| n.state() == NodeState::Invalid)
                    .map(|n| n.id());
                if failed.is_some() {
                    return true;
                }
            }
            self.nodes
                .iter()
                .all(|n| n.state() == target && n.queued_commands() == 0)
        });

        if let Some(id) = failed {
            return Err(MediaFlowError::Graph(format!(
                "node {} went invalid while moving to {:?}",
                id, target
            )));
        }
        if !settled {
            let lagging: Vec<String> = self
                .nodes
                .iter()
                .filter(|n| n.state() != target)
                .map(|n| format!("{}={:?}", n.name(), n.state()))
                .collect();
            return Err(MediaFlowError::Timeout(format!(
                "waiting for {:?}; still at [{}]",
                target,
                lagging.join(", ")
            )));
        }
        Ok(())
    }

    /// `set_state_all` followed by `wait_for_state`.
    pub fn transition_all(&self, target: NodeState, timeout: Duration) -> Result<()> {
        self.set_state_all(target)?;
        self.wait_for_state(target, timeout)
    }

    /// Keep the graph running until `done` holds or `timeout` passes.
    pub fn wait_until(&self, timeout: Duration, mut done: impl FnMut(&Graph) -> bool) -> bool {
        self.scheduler.pump(timeout, || done(self))
    }

    /// Manual scheduling: run queued passes until nothing is runnable.
    pub fn run_until_idle(&self) -> usize {
        self.scheduler.run_until_idle(MAX_IDLE_PASSES)
    }

    pub fn reports(&self) -> Vec<NodeReport> {
        self.nodes
            .iter()
            .map(|node| NodeReport {
                id: node.id(),
                name: node.name().to_string(),
                state: node.state(),
                ports: (0..node.port_count())
                    .filter_map(|p| node.port_stats(p).ok())
                    .collect(),
            })
            .collect()
    }

    /// Bring every node back to `Loaded`, tear the tunnels down and stop the
    /// scheduler.
    pub fn shutdown(&mut self, timeout: Duration) -> Result<()> {
        if self.nodes.iter().any(|n| n.state().is_running()) {
            self.send_running(NodeState::Idle)?;
            self.wait_for_state(NodeState::Idle, timeout)?;
        }
        if self
            .nodes
            .iter()
            .any(|n| matches!(n.state(), NodeState::Idle | NodeState::WaitForResources))
        {
            self.set_state_all(NodeState::Loaded)?;
            self.wait_for_state(NodeState::Loaded, timeout)?;
        }

        for link in std::mem::take(&mut self.links).into_iter().rev() {
            let (Some(output), Some(input)) = (self.node(link.from), self.node(link.to)) else {
                continue;
            };
            if let Err(e) = teardown_tunnel(output, link.out_port, input, link.in_port) {
                warn!(
                    "teardown {}:{} -> {}:{} failed: {}",
                    link.from, link.out_port, link.to, link.in_port, e
                );
            }
        }
        for node in &self.nodes {
            if let Err(e) = node.close() {
                warn!("closing {} failed: {}", node.id(), e);
            }
        }
        self.scheduler.shutdown();
        Ok(())
    }

    fn send_running(&self, target: NodeState) -> Result<()> {
        for node in self.nodes.iter().filter(|n| n.state().is_running()) {
            node.send_command(Command::SetState(target))?;
        }
        Ok(())
    }
}

impl std::fmt::Debug for Graph {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Graph")
            .field("nodes", &self.nodes)
            .field("links", &self.links)
            .field("scheduler", &self.scheduler)
            .finish()
    }
}
