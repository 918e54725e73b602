//! # MediaFlow-RS: component/port media runtime
//!
//! Processing nodes with typed ports, connected by tunnels that move buffers
//! between them. Every node runs an asynchronous state machine driven by a
//! command queue, and competes for scarce units (threads, renderers, decoders)
//! through a priority-based resource broker.
//!
//! ## Architecture
//!
//! - **Pipeline**: nodes, ports, tunnels, buffer sharing and the worker pass
//! - **Broker**: named resource pools with priority preemption
//! - **Scheduler**: worker threads and delayed retries, or a manual mode
//!   that runs passes on the caller's thread
//! - **Config**: runtime settings and graph descriptions (TOML or JSON)
//!
//! ## Configuration
//!
//! The default runtime config lives in the platform-appropriate data directory
//! under `dev.hxyulin.mediaflow-rs`:
//!
//! - **Linux**: `~/.local/share/dev.hxyulin.mediaflow-rs/`
//! - **macOS**: `~/Library/Application Support/dev.hxyulin.mediaflow-rs/`
//! - **Windows**: `%APPDATA%\dev.hxyulin.mediaflow-rs\`
//!
//! ## Example
//!
//! ```ignore
//! use mediaflow_rs::{config::{GraphConfig, RuntimeConfig}, pipeline::{Graph, NodeState}};
//! use std::time::Duration;
//!
//! fn main() -> mediaflow_rs::Result<()> {
//!     let (mut graph, _events) = Graph::load(RuntimeConfig::default(), &GraphConfig::pass_through())?;
//!     let timeout = Duration::from_secs(5);
//!     graph.transition_all(NodeState::Idle, timeout)?;
//!     graph.transition_all(NodeState::Executing, timeout)?;
//!     // ... wait for end of stream ...
//!     graph.shutdown(timeout)
//! }
//! ```

pub mod broker;
pub mod config;
pub mod error;
pub mod logging;
pub mod pipeline;

// Re-export commonly used types
pub use broker::{Priority, ResourceBroker};
pub use config::{GraphConfig, RuntimeConfig};
pub use error::{MediaFlowError, Result};
pub use pipeline::{Graph, Node, NodeError, NodeState};
