//! CopyNode: pass-through between one input and one output.
//!
//! The two ports are declared as a sharing pair. When the runtime settles on
//! shared storage the output buffer already holds the input's bytes and only
//! metadata moves; otherwise the payload is copied.
//!
//! The output is delivered before the input is released: with shared storage
//! the input may only hand the slot upstream once downstream gave it back.

use crate::pipeline::behavior::{NodeBehavior, WorkStatus, WorkerContext};
use crate::pipeline::buffer::copy_metadata;
use crate::pipeline::config_slot::ConfigValue;
use crate::pipeline::error::{NodeError, NodeResult};
use crate::pipeline::port::{PortDescriptor, PortDomain};
use crate::pipeline::tunnel::SupplierRole;

pub const IN: usize = 0;
pub const OUT: usize = 1;

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct CopyStats {
    pub copied: u64,
    pub shared: u64,
    pub bytes: u64,
}

pub struct CopyNode {
    stats: CopyStats,
    buffer_count: usize,
    buffer_size: usize,
    input_supplier: SupplierRole,
    output_supplier: SupplierRole,
    domain: PortDomain,
}

impl CopyNode {
    pub fn new() -> Self {
        Self {
            stats: CopyStats::default(),
            buffer_count: 2,
            buffer_size: 1024,
            input_supplier: SupplierRole::Unspecified,
            output_supplier: SupplierRole::Unspecified,
            domain: PortDomain::Audio,
        }
    }

    pub fn with_buffers(mut self, count: usize, size: usize) -> Self {
        self.buffer_count = count;
        self.buffer_size = size;
        self
    }

    pub fn with_suppliers(mut self, input: SupplierRole, output: SupplierRole) -> Self {
        self.input_supplier = input;
        self.output_supplier = output;
        self
    }

    pub fn stats(&self) -> CopyStats {
        self.stats
    }
}

impl Default for CopyNode {
    fn default() -> Self {
        Self::new()
    }
}

impl NodeBehavior for CopyNode {
    fn name(&self) -> &str {
        "Copy"
    }

    fn ports(&self) -> Vec<PortDescriptor> {
        vec![
            PortDescriptor::input("in", self.domain)
                .with_buffers(self.buffer_count, self.buffer_size)
                .with_supplier(self.input_supplier),
            PortDescriptor::output("out", self.domain)
                .with_buffers(self.buffer_count, self.buffer_size)
                .with_supplier(self.output_supplier),
        ]
    }

    fn sharing_candidates(&self) -> Vec<(usize, usize)> {
        vec![(IN, OUT)]
    }

    fn get_parameter(&self, key: &str) -> NodeResult<ConfigValue> {
        match key {
            "copied" => Ok(ConfigValue::Int(self.stats.copied as i64)),
            "shared" => Ok(ConfigValue::Int(self.stats.shared as i64)),
            "bytes" => Ok(ConfigValue::Int(self.stats.bytes as i64)),
            _ => Err(NodeError::UnsupportedSetting(key.to_string())),
        }
    }

    fn work(&mut self, ctx: &mut WorkerContext<'_>, _all_ports_ready: bool) -> NodeResult<WorkStatus> {
        while ctx.get_next_buffer(IN) && ctx.get_next_buffer(OUT) {
            let shared = ctx.shares_storage(IN, OUT);
            let moved = ctx
                .with_buffers(IN, OUT, |input, output| -> NodeResult<usize> {
                    if shared {
                        output.offset = input.offset;
                        output.filled_len = input.filled_len;
                    } else {
                        output.write_payload(&input.payload())?;
                    }
                    copy_metadata(input, output);
                    Ok(output.filled_len)
                })
                .ok_or(NodeError::NotReady)??;

            ctx.deliver_buffer(OUT)?;
            ctx.release_buffer(IN)?;

            if shared {
                self.stats.shared += 1;
            } else {
                self.stats.copied += 1;
            }
            self.stats.bytes += moved as u64;
        }
        Ok(WorkStatus::idle())
    }
}
