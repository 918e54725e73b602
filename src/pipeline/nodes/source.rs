//! SourceNode: synthetic frame producer.
//!
//! Fills every empty buffer that reaches its single output with a numbered
//! frame until the configured frame count is reached. The last frame carries
//! EOS; frame 0 carries START_TIME.

use crate::pipeline::behavior::{NodeBehavior, WorkStatus, WorkerContext};
use crate::pipeline::buffer::BufferFlags;
use crate::pipeline::config_slot::ConfigValue;
use crate::pipeline::error::{NodeError, NodeResult};
use crate::pipeline::port::{PortDescriptor, PortDomain};
use crate::pipeline::state::NodeState;
use crate::pipeline::tunnel::SupplierRole;
use tracing::debug;

pub const OUT: usize = 0;

/// Spacing of frame timestamps, in microseconds.
pub const FRAME_INTERVAL_US: i64 = 20_000;

/// Payload of frame `frame`: a byte ramp starting at the frame number.
pub fn frame_payload(frame: u64, len: usize) -> Vec<u8> {
    (0..len).map(|i| (frame as usize).wrapping_add(i) as u8).collect()
}

pub struct SourceNode {
    frames: u64,
    frame_size: usize,
    produced: u64,
    buffer_count: usize,
    buffer_size: usize,
    supplier: SupplierRole,
    domain: PortDomain,
}

impl SourceNode {
    pub fn new(frames: u64) -> Self {
        Self {
            frames,
            frame_size: 256,
            produced: 0,
            buffer_count: 2,
            buffer_size: 1024,
            supplier: SupplierRole::Unspecified,
            domain: PortDomain::Audio,
        }
    }

    pub fn with_frame_size(mut self, size: usize) -> Self {
        self.frame_size = size;
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

    pub fn with_domain(mut self, domain: PortDomain) -> Self {
        self.domain = domain;
        self
    }

    pub fn produced(&self) -> u64 {
        self.produced
    }

    fn read(&self, key: &str) -> NodeResult<ConfigValue> {
        match key {
            "frames" => Ok(ConfigValue::Int(self.frames as i64)),
            "frame_size" => Ok(ConfigValue::Int(self.frame_size as i64)),
            "produced" => Ok(ConfigValue::Int(self.produced as i64)),
            _ => Err(NodeError::UnsupportedSetting(key.to_string())),
        }
    }

    fn write(&mut self, key: &str, value: ConfigValue) -> NodeResult<()> {
        let number = value
            .as_int()
            .filter(|v| *v >= 0)
            .ok_or_else(|| NodeError::BadParameter(format!("{} must be a non-negative integer", key)))?;
        match key {
            "frames" => self.frames = number as u64,
            "frame_size" => self.frame_size = number as usize,
            _ => return Err(NodeError::UnsupportedSetting(key.to_string())),
        }
        Ok(())
    }
}

impl NodeBehavior for SourceNode {
    fn name(&self) -> &str {
        "Source"
    }

    fn ports(&self) -> Vec<PortDescriptor> {
        vec![PortDescriptor::output("out", self.domain)
            .with_buffers(self.buffer_count, self.buffer_size)
            .with_supplier(self.supplier)]
    }

    fn get_parameter(&self, key: &str) -> NodeResult<ConfigValue> {
        self.read(key)
    }

    fn set_parameter(&mut self, key: &str, value: ConfigValue) -> NodeResult<()> {
        self.write(key, value)
    }

    fn get_config(&self, key: &str) -> NodeResult<ConfigValue> {
        self.read(key)
    }

    fn set_config(&mut self, key: &str, value: ConfigValue) -> NodeResult<()> {
        self.write(key, value)
    }

    fn change_state(&mut self, from: NodeState, to: NodeState) -> NodeResult<()> {
        if to == NodeState::Idle && !from.is_running() {
            self.produced = 0;
        }
        Ok(())
    }

    fn work(&mut self, ctx: &mut WorkerContext<'_>, _all_ports_ready: bool) -> NodeResult<WorkStatus> {
        while self.produced < self.frames && ctx.get_next_buffer(OUT) {
            let frame = self.produced;
            let last = frame + 1 == self.frames;
            let size = self.frame_size;
            ctx.with_buffer(OUT, |buffer| -> NodeResult<()> {
                let len = size.min(buffer.capacity());
                buffer.write_payload(&frame_payload(frame, len))?;
                buffer.timestamp = frame as i64 * FRAME_INTERVAL_US;
                if frame == 0 {
                    buffer.flags.insert(BufferFlags::START_TIME);
                }
                if last {
                    buffer.flags.insert(BufferFlags::EOS);
                }
                Ok(())
            })
            .ok_or(NodeError::NotReady)??;

            ctx.deliver_buffer(OUT)?;
            self.produced += 1;
            if last {
                debug!("{} produced final frame {}", ctx.node_id(), frame);
            }
        }
        Ok(WorkStatus::idle())
    }
}
