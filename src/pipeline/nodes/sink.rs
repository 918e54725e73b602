//! SinkNode: renderer-like consumer.
//!
//! Consumes every full buffer on its input, counts frames and bytes, raises
//! `FirstFrame` once per run and releases the buffer back upstream. Besides
//! the thread slot every node takes, a sink can declare extra broker pools
//! (a render channel, say), which makes it subject to preemption.

use crate::pipeline::behavior::{NodeBehavior, WorkStatus, WorkerContext};
use crate::pipeline::config_slot::ConfigValue;
use crate::pipeline::error::{NodeError, NodeResult};
use crate::pipeline::event::Event;
use crate::pipeline::port::{PortDescriptor, PortDomain};
use crate::pipeline::state::NodeState;
use crate::pipeline::tunnel::SupplierRole;
use tracing::{debug, info};

pub const IN: usize = 0;

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct SinkStats {
    pub frames: u64,
    pub bytes: u64,
    pub checksum: u64,
    pub eos: bool,
}

pub struct SinkNode {
    stats: SinkStats,
    first_frame_sent: bool,
    resources: Vec<String>,
    buffer_count: usize,
    buffer_size: usize,
    supplier: SupplierRole,
    domain: PortDomain,
}

impl SinkNode {
    pub fn new() -> Self {
        Self {
            stats: SinkStats::default(),
            first_frame_sent: false,
            resources: Vec::new(),
            buffer_count: 2,
            buffer_size: 1024,
            supplier: SupplierRole::Unspecified,
            domain: PortDomain::Audio,
        }
    }

    /// Broker pools this sink needs while it is Idle or beyond.
    pub fn with_resources<I, S>(mut self, pools: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.resources = pools.into_iter().map(Into::into).collect();
        self
    }

    pub fn with_buffers(mut self, count: usize, size: usize) -> Self {
        self.buffer_count = count;
        self.buffer_size = size;
        self
    }

    pub fn with_supplier(mut self, preference: SupplierRole) -> Self {
        self.supplier = preference;
        self
    }

    pub fn stats(&self) -> SinkStats {
        self.stats
    }
}

impl Default for SinkNode {
    fn default() -> Self {
        Self::new()
    }
}

impl NodeBehavior for SinkNode {
    fn name(&self) -> &str {
        "Sink"
    }

    fn ports(&self) -> Vec<PortDescriptor> {
        vec![PortDescriptor::input("in", self.domain)
            .with_buffers(self.buffer_count, self.buffer_size)
            .with_supplier(self.supplier)]
    }

    fn resources(&self) -> Vec<String> {
        self.resources.clone()
    }

    fn get_parameter(&self, key: &str) -> NodeResult<ConfigValue> {
        match key {
            "frames" => Ok(ConfigValue::Int(self.stats.frames as i64)),
            "bytes" => Ok(ConfigValue::Int(self.stats.bytes as i64)),
            "checksum" => Ok(ConfigValue::Int(self.stats.checksum as i64)),
            "eos" => Ok(ConfigValue::Bool(self.stats.eos)),
            _ => Err(NodeError::UnsupportedSetting(key.to_string())),
        }
    }

    fn change_state(&mut self, from: NodeState, to: NodeState) -> NodeResult<()> {
        if to == NodeState::Idle && !from.is_running() {
            self.stats = SinkStats::default();
            self.first_frame_sent = false;
        }
        Ok(())
    }

    fn acquire_resources(&mut self) -> NodeResult<()> {
        debug!("sink acquiring {:?}", self.resources);
        Ok(())
    }

    fn work(&mut self, ctx: &mut WorkerContext<'_>, _all_ports_ready: bool) -> NodeResult<WorkStatus> {
        while ctx.get_next_buffer(IN) {
            let (len, sum, eos) = ctx
                .with_buffer(IN, |buffer| {
                    let payload = buffer.payload();
                    let sum = payload.iter().fold(0u64, |acc, &b| acc.wrapping_add(b as u64));
                    (payload.len(), sum, buffer.is_eos())
                })
                .ok_or(NodeError::NotReady)?;

            // Buffers returned empty by a stopping producer.
            if len == 0 && !eos {
                ctx.release_buffer(IN)?;
                continue;
            }

            if !self.first_frame_sent {
                self.first_frame_sent = true;
                ctx.send_event(Event::FirstFrame {
                    node: ctx.node_id(),
                    port: IN,
                });
            }
            self.stats.frames += 1;
            self.stats.bytes += len as u64;
            self.stats.checksum = self.stats.checksum.wrapping_add(sum);
            if eos {
                self.stats.eos = true;
                info!(
                    "{} rendered {} frame(s), {} byte(s)",
                    ctx.node_id(),
                    self.stats.frames,
                    self.stats.bytes
                );
            }

            ctx.release_buffer(IN)?;
        }
        Ok(WorkStatus::idle())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_declared_resources() {
        let sink = SinkNode::new().with_resources(["Nvx.HW.AudioRenderers"]);
        assert_eq!(sink.resources(), vec!["Nvx.HW.AudioRenderers".to_string()]);
        assert!(SinkNode::new().resources().is_empty());
    }

    #[test]
    fn test_stats_reset_on_new_run() {
        let mut sink = SinkNode::new();
        sink.stats.frames = 3;
        sink.stats.eos = true;
        sink.change_state(NodeState::Pause, NodeState::Idle).unwrap();
        assert_eq!(sink.get_parameter("frames"), Ok(ConfigValue::Int(3)));
        sink.change_state(NodeState::WaitForResources, NodeState::Idle).unwrap();
        assert_eq!(sink.stats(), SinkStats::default());
        assert_eq!(sink.get_parameter("eos"), Ok(ConfigValue::Bool(false)));
    }
}
