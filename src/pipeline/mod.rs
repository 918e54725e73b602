//! Component/port media runtime.
//!
//! Nodes own ports and talk to each other through tunnels. A buffer moves
//! between an output and the input it is tunneled to; whoever supplies the
//! buffers keeps them between runs. All processing happens in worker passes
//! that a [`Scheduler`] runs on behalf of the node.
//!
//! # Architecture
//!
//! ```text
//! [SourceNode] ══► [CopyNode] ══► [SinkNode]
//!       │               │              │
//!       └─── ResourceBroker (thread slots, renderers, ...)
//! ```
//!
//! # Design
//!
//! - **Behavior table**: a node is generic machinery plus a boxed
//!   [`NodeBehavior`] providing its hooks.
//! - **Commands are asynchronous**: `send_command` only queues; the worker
//!   applies it and reports with an [`Event`].
//! - **Ownership on failure**: a refused buffer handoff returns the buffer in
//!   [`Rejected`].
//! - **Explicit broker**: every graph owns one [`ResourceBroker`](crate::broker::ResourceBroker).

pub mod behavior;
pub mod buffer;
pub mod command;
pub mod config_slot;
pub mod error;
pub mod event;
pub mod graph;
pub mod id;
mod lifecycle;
pub mod node;
pub mod nodes;
pub mod port;
mod resources;
pub mod scheduler;
pub mod state;
mod transfer;
pub mod tunnel;
mod worker;

pub use behavior::{NodeBehavior, WorkStatus, WorkerContext};
pub use buffer::{copy_metadata, Buffer, BufferArena, BufferFlags, Mark, Memory};
pub use command::{Command, CommandQueue, PortTarget};
pub use config_slot::ConfigValue;
pub use error::{NodeError, NodeResult, Rejected, TransferResult};
pub use event::{ChannelSink, Event, EventSink, SinkMessage};
pub use graph::{Graph, Link, NodeReport};
pub use id::{ClientId, NodeId, PoolId, PortId};
pub use node::{Node, NodeEnv, Version};
pub use nodes::{CopyNode, SinkNode, SourceNode};
pub use port::{PortDefinition, PortDescriptor, PortDirection, PortDomain, PortStats};
pub use scheduler::{Scheduler, WorkerTrigger};
pub use state::{NodeState, ResourcesState};
pub use tunnel::{setup_tunnel, teardown_tunnel, SupplierRole};
