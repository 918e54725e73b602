//! Graph and node builders for tests

use super::mock_helpers::RecordingSink;
use mediaflow_rs::config::RuntimeConfig;
use mediaflow_rs::pipeline::{
    ConfigValue, Graph, NodeBehavior, NodeError, NodeResult, PortDescriptor, PortDomain,
    SupplierRole, WorkStatus, WorkerContext,
};
use std::sync::Arc;

/// Graph reporting to a fresh [`RecordingSink`]
pub fn recording_graph(config: RuntimeConfig) -> (Graph, Arc<RecordingSink>) {
    let sink = Arc::new(RecordingSink::new());
    let graph = Graph::with_sink(config, sink.clone()).expect("graph");
    (graph, sink)
}

/// One input port; releases at most `limit` buffers, then leaves the rest queued.
pub struct ConsumeLimit {
    limit: usize,
    consumed: usize,
    count: usize,
    size: usize,
    supplier: SupplierRole,
}

impl ConsumeLimit {
    pub fn new(limit: usize) -> Self {
        Self {
            limit,
            consumed: 0,
            count: 2,
            size: 64,
            supplier: SupplierRole::Unspecified,
        }
    }

    pub fn buffers(mut self, count: usize, size: usize) -> Self {
        self.count = count;
        self.size = size;
        self
    }

    pub fn supplier(mut self, role: SupplierRole) -> Self {
        self.supplier = role;
        self
    }
}

impl NodeBehavior for ConsumeLimit {
    fn name(&self) -> &str {
        "ConsumeLimit"
    }

    fn ports(&self) -> Vec<PortDescriptor> {
        vec![PortDescriptor::input("in", PortDomain::Audio)
            .with_buffers(self.count, self.size)
            .with_supplier(self.supplier)]
    }

    fn work(&mut self, ctx: &mut WorkerContext<'_>, _all_ports_ready: bool) -> NodeResult<WorkStatus> {
        while self.consumed < self.limit && ctx.get_next_buffer(0) {
            ctx.release_buffer(0)?;
            self.consumed += 1;
        }
        Ok(WorkStatus::idle())
    }
}

/// One input, one output. Copies the payload and flags by hand, then releases
/// the input before delivering the output.
pub struct Forwarder;

impl NodeBehavior for Forwarder {
    fn name(&self) -> &str {
        "Forwarder"
    }

    fn ports(&self) -> Vec<PortDescriptor> {
        vec![
            PortDescriptor::input("in", PortDomain::Audio).with_buffers(2, 1024),
            PortDescriptor::output("out", PortDomain::Audio).with_buffers(2, 1024),
        ]
    }

    fn work(&mut self, ctx: &mut WorkerContext<'_>, _all_ports_ready: bool) -> NodeResult<WorkStatus> {
        while ctx.get_next_buffer(0) && ctx.get_next_buffer(1) {
            ctx.with_buffers(0, 1, |input, output| -> NodeResult<()> {
                output.write_payload(&input.payload())?;
                output.flags = input.flags;
                output.timestamp = input.timestamp;
                Ok(())
            })
            .ok_or(NodeError::NotReady)??;
            ctx.release_buffer(0)?;
            ctx.deliver_buffer(1)?;
        }
        Ok(WorkStatus::idle())
    }
}

pub const SPLIT_IN: usize = 0;
pub const SPLIT_LEFT: usize = 1;
pub const SPLIT_RIGHT: usize = 2;

/// One input fanned out to two outputs that both supply their tunnels, so
/// both outputs reuse the input's storage.
#[derive(Default)]
pub struct Splitter {
    shared: i64,
    copied: i64,
}

impl NodeBehavior for Splitter {
    fn name(&self) -> &str {
        "Splitter"
    }

    fn ports(&self) -> Vec<PortDescriptor> {
        vec![
            PortDescriptor::input("in", PortDomain::Audio).with_buffers(2, 1024),
            PortDescriptor::output("left", PortDomain::Audio)
                .with_buffers(2, 1024)
                .with_supplier(SupplierRole::Output),
            PortDescriptor::output("right", PortDomain::Audio)
                .with_buffers(2, 1024)
                .with_supplier(SupplierRole::Output),
        ]
    }

    fn sharing_candidates(&self) -> Vec<(usize, usize)> {
        vec![(SPLIT_IN, SPLIT_LEFT), (SPLIT_IN, SPLIT_RIGHT)]
    }

    fn get_parameter(&self, key: &str) -> NodeResult<ConfigValue> {
        match key {
            "shared" => Ok(ConfigValue::Int(self.shared)),
            "copied" => Ok(ConfigValue::Int(self.copied)),
            _ => Err(NodeError::UnsupportedSetting(key.to_string())),
        }
    }

    fn work(&mut self, ctx: &mut WorkerContext<'_>, _all_ports_ready: bool) -> NodeResult<WorkStatus> {
        while ctx.get_next_buffer(SPLIT_IN)
            && ctx.get_next_buffer(SPLIT_LEFT)
            && ctx.get_next_buffer(SPLIT_RIGHT)
        {
            for out in [SPLIT_LEFT, SPLIT_RIGHT] {
                let shared = ctx.shares_storage(SPLIT_IN, out);
                ctx.with_buffers(SPLIT_IN, out, |input, output| -> NodeResult<()> {
                    if shared {
                        output.offset = input.offset;
                        output.filled_len = input.filled_len;
                    } else {
                        output.write_payload(&input.payload())?;
                    }
                    output.flags = input.flags;
                    output.timestamp = input.timestamp;
                    Ok(())
                })
                .ok_or(NodeError::NotReady)??;
                if shared {
                    self.shared += 1;
                } else {
                    self.copied += 1;
                }
            }
            ctx.deliver_buffer(SPLIT_LEFT)?;
            ctx.deliver_buffer(SPLIT_RIGHT)?;
            ctx.release_buffer(SPLIT_IN)?;
        }
        Ok(WorkStatus::idle())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_consume_limit_ports() {
        let node = ConsumeLimit::new(1).buffers(3, 128);
        let ports = node.ports();
        assert_eq!(ports.len(), 1);
        assert_eq!(ports[0].buffer_count, 3);
    }

    #[test]
    fn test_splitter_pairs_input_with_both_outputs() {
        let splitter = Splitter::default();
        assert_eq!(splitter.ports().len(), 3);
        assert_eq!(
            splitter.sharing_candidates(),
            vec![(SPLIT_IN, SPLIT_LEFT), (SPLIT_IN, SPLIT_RIGHT)]
        );
    }
}
