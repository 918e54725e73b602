//! Every buffer header is always in exactly one place

mod common;

use common::builders::{recording_graph, ConsumeLimit};
use common::{manual_config, test_timeout};
use mediaflow_rs::pipeline::nodes::source::frame_payload;
use mediaflow_rs::pipeline::{
    Buffer, Command, ConfigValue, CopyNode, NodeState, PortTarget, SinkNode, SourceNode,
};
use proptest::prelude::*;
use std::collections::HashSet;

const BUFFERS: usize = 4;

#[derive(Debug, Clone)]
enum Op {
    Submit,
    Collect,
    Run,
    Accepting(bool),
    Flush,
}

fn op() -> impl Strategy<Value = Op> {
    prop_oneof![
        3 => Just(Op::Submit),
        2 => Just(Op::Collect),
        2 => Just(Op::Run),
        1 => any::<bool>().prop_map(Op::Accepting),
        1 => Just(Op::Flush),
    ]
}

const FRAMES: u64 = 12;

fn int_parameter(value: Result<ConfigValue, mediaflow_rs::pipeline::NodeError>) -> i64 {
    match value {
        Ok(ConfigValue::Int(n)) => n,
        other => panic!("unexpected {:?}", other),
    }
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(24))]

    /// Worker passes of a shared source -> copy -> sink chain run in random
    /// order. Every frame arrives intact and every header goes home.
    #[test]
    fn prop_shared_tunnel_chain_keeps_every_buffer(
        passes in prop::collection::vec(0usize..4, 1..60),
    ) {
        let (mut graph, _sink) = recording_graph(manual_config());
        let src = graph.add_node("src", Box::new(SourceNode::new(FRAMES))).unwrap();
        let copy = graph.add_node("copy", Box::new(CopyNode::new())).unwrap();
        let out = graph.add_node("out", Box::new(SinkNode::new())).unwrap();
        graph.connect(src, 0, copy, 0).unwrap();
        graph.connect(copy, 1, out, 0).unwrap();
        let nodes = [
            graph.node(src).unwrap().clone(),
            graph.node(copy).unwrap().clone(),
            graph.node(out).unwrap().clone(),
        ];
        graph.transition_all(NodeState::Idle, test_timeout()).unwrap();
        graph.transition_all(NodeState::Executing, test_timeout()).unwrap();

        for pick in passes {
            match nodes.get(pick) {
                Some(node) => {
                    node.run_worker();
                }
                None => {
                    graph.run_until_idle();
                }
            }
            let frames = int_parameter(nodes[2].get_parameter("frames"));
            prop_assert!(frames <= FRAMES as i64);
        }

        let sink_node = nodes[2].clone();
        let reached_eos = graph.wait_until(test_timeout(), |_| {
            sink_node.get_parameter("eos") == Ok(ConfigValue::Bool(true))
        });
        prop_assert!(reached_eos);
        prop_assert_eq!(int_parameter(sink_node.get_parameter("frames")), FRAMES as i64);
        let expected = (0..FRAMES)
            .flat_map(|f| frame_payload(f, 256))
            .fold(0u64, |acc, b| acc.wrapping_add(b as u64)) as i64;
        prop_assert_eq!(int_parameter(sink_node.get_parameter("checksum")), expected);
        let moved = int_parameter(nodes[1].get_parameter("copied"))
            + int_parameter(nodes[1].get_parameter("shared"));
        prop_assert_eq!(moved, FRAMES as i64);

        // Back at rest every supplier holds its whole pool again.
        graph.transition_all(NodeState::Idle, test_timeout()).unwrap();
        for node in &nodes {
            for port in 0..node.port_count() {
                let definition = node.port_definition(port).unwrap();
                prop_assert!(definition.populated);
                prop_assert!(definition.buffer_count_actual > 0);
            }
        }

        graph.shutdown(test_timeout()).unwrap();
        for node in &nodes {
            for port in 0..node.port_count() {
                prop_assert_eq!(node.port_definition(port).unwrap().buffer_count_actual, 0);
            }
        }
    }

    #[test]
    fn prop_buffers_are_never_lost_or_duplicated(ops in prop::collection::vec(op(), 1..40)) {
        let mut config = manual_config();
        config.node.not_ready_backoff_ms = 1;
        let (mut graph, sink) = recording_graph(config);
        let id = graph
            .add_node("drain", Box::new(ConsumeLimit::new(usize::MAX).buffers(BUFFERS, 32)))
            .unwrap();
        let node = graph.node(id).unwrap().clone();

        let mut hand: Vec<Buffer> = (0..BUFFERS)
            .map(|_| node.allocate_buffer(0, 32).unwrap())
            .collect();
        graph.transition_all(NodeState::Idle, test_timeout()).unwrap();
        graph.transition_all(NodeState::Executing, test_timeout()).unwrap();

        for op in ops {
            match op {
                Op::Submit => {
                    if let Some(buffer) = hand.pop() {
                        if let Err(rejected) = node.empty_this_buffer(0, buffer) {
                            hand.push(rejected.buffer);
                        }
                    }
                }
                Op::Collect => hand.extend(sink.take_emptied()),
                Op::Run => {
                    graph.run_until_idle();
                }
                Op::Accepting(on) => sink.set_accepting(on),
                Op::Flush => {
                    node.send_command(Command::Flush(PortTarget::All)).unwrap();
                }
            }
            prop_assert!(hand.len() + sink.emptied().len() <= BUFFERS);
        }

        sink.set_accepting(true);
        node.send_command(Command::Flush(PortTarget::All)).unwrap();
        let settled = graph.wait_until(test_timeout(), |_| {
            hand.len() + sink.emptied().len() == BUFFERS && node.queued_commands() == 0
        });
        prop_assert!(settled);

        hand.extend(sink.take_emptied());
        let slots: HashSet<usize> = hand.iter().map(|b| b.index()).collect();
        prop_assert_eq!(slots.len(), BUFFERS);
    }
}
