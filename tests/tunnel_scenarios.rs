//! Buffer flow through tunnels, flushes and marks

mod common;

use common::builders::{recording_graph, ConsumeLimit, Forwarder, Splitter, SPLIT_LEFT, SPLIT_RIGHT};
use common::{manual_config, test_timeout, threaded_config};
use mediaflow_rs::config::GraphConfig;
use mediaflow_rs::pipeline::nodes::source::frame_payload;
use mediaflow_rs::pipeline::{
    BufferFlags, Command, ConfigValue, CopyNode, Event, Graph, Mark, NodeState, PortTarget,
    SinkNode, SourceNode, SupplierRole,
};

fn expected_checksum(frames: u64, frame_size: usize) -> i64 {
    (0..frames)
        .flat_map(|f| frame_payload(f, frame_size))
        .fold(0u64, |acc, b| acc.wrapping_add(b as u64)) as i64
}

fn eos_flags(events: &[Event]) -> Vec<usize> {
    events
        .iter()
        .filter_map(|e| match e {
            Event::BufferFlag { port, flags, .. } if flags.contains(BufferFlags::EOS) => Some(*port),
            _ => None,
        })
        .collect()
}

#[test]
fn test_supplying_input_hands_every_buffer_upstream() {
    let (mut graph, sink) = recording_graph(manual_config());
    let src = graph
        .add_node("m", Box::new(SourceNode::new(0).with_buffers(1, 1024)))
        .unwrap();
    let dst = graph
        .add_node(
            "n",
            Box::new(
                SinkNode::new()
                    .with_buffers(4, 2048)
                    .with_supplier(SupplierRole::Input),
            ),
        )
        .unwrap();
    assert_eq!(graph.connect(src, 0, dst, 0).unwrap(), SupplierRole::Input);

    graph.transition_all(NodeState::Idle, test_timeout()).unwrap();
    let input = graph.node(dst).unwrap().port_definition(0).unwrap();
    assert!(input.populated);
    assert_eq!(input.buffer_count_actual, 4);
    assert_eq!(input.buffer_size, 2048);

    // The output adopted the larger requirements.
    let output = graph.node(src).unwrap().port_definition(0).unwrap();
    assert_eq!(output.buffer_count_actual, 4);
    assert!(output.populated);

    graph
        .transition_all(NodeState::Executing, test_timeout())
        .unwrap();
    graph.run_until_idle();

    let stats = graph.node(src).unwrap().port_stats(0).unwrap();
    assert_eq!(stats.fill_this_buffer_calls, 4);
    assert!(sink.events_for(src).iter().any(|e| matches!(
        e,
        Event::PortSettingsChanged { port: 0, .. }
    )));
    assert!(!sink
        .events_for(dst)
        .iter()
        .any(|e| matches!(e, Event::PortSettingsChanged { .. })));

    graph.shutdown(test_timeout()).unwrap();
}

#[test]
fn test_flush_returns_buffers_oldest_first() {
    let (mut graph, sink) = recording_graph(manual_config());
    let id = graph
        .add_node("hold", Box::new(ConsumeLimit::new(1).buffers(3, 64)))
        .unwrap();
    let node = graph.node(id).unwrap().clone();

    let a = node.allocate_buffer(0, 64).unwrap();
    let b = node.allocate_buffer(0, 64).unwrap();
    let c = node.allocate_buffer(0, 64).unwrap();
    graph.transition_all(NodeState::Idle, test_timeout()).unwrap();
    graph
        .transition_all(NodeState::Executing, test_timeout())
        .unwrap();

    // The first buffer is consumed but its return is refused and parked.
    sink.set_accepting(false);
    node.empty_this_buffer(0, a).unwrap();
    graph.run_until_idle();
    node.empty_this_buffer(0, b).unwrap();
    node.empty_this_buffer(0, c).unwrap();
    graph.run_until_idle();
    assert!(sink.emptied().is_empty());

    sink.set_accepting(true);
    node.send_command(Command::Flush(PortTarget::Index(0))).unwrap();
    graph.run_until_idle();

    assert_eq!(sink.emptied(), vec![0, 1, 2]);
    assert!(sink.events_for(id).iter().any(|e| matches!(
        e,
        Event::CommandComplete {
            command: Command::Flush(PortTarget::Index(0)),
            ..
        }
    )));
    let definition = node.port_definition(0).unwrap();
    assert!(definition.populated);
    assert_eq!(definition.buffer_count_actual, 3);

    graph.shutdown(test_timeout()).ok();
}

#[test]
fn test_flush_of_unknown_port_is_rejected() {
    let (mut graph, _sink) = recording_graph(manual_config());
    let id = graph
        .add_node("hold", Box::new(ConsumeLimit::new(1)))
        .unwrap();
    let node = graph.node(id).unwrap();
    assert!(node.send_command(Command::Flush(PortTarget::Index(3))).is_err());
    assert_eq!(node.queued_commands(), 0);
}

#[test]
fn test_source_to_sink_delivers_every_frame() {
    let (mut graph, sink) = recording_graph(manual_config());
    let src = graph.add_node("src", Box::new(SourceNode::new(8))).unwrap();
    let copy = graph.add_node("copy", Box::new(CopyNode::new())).unwrap();
    let out = graph.add_node("out", Box::new(SinkNode::new())).unwrap();
    graph.connect(src, 0, copy, 0).unwrap();
    graph.connect(copy, 1, out, 0).unwrap();

    graph.transition_all(NodeState::Idle, test_timeout()).unwrap();
    graph
        .transition_all(NodeState::Executing, test_timeout())
        .unwrap();
    let out_node = graph.node(out).unwrap().clone();
    assert!(graph.wait_until(test_timeout(), |_| {
        out_node.get_parameter("eos") == Ok(ConfigValue::Bool(true))
    }));

    assert_eq!(out_node.get_parameter("frames"), Ok(ConfigValue::Int(8)));
    assert_eq!(
        out_node.get_parameter("checksum"),
        Ok(ConfigValue::Int(expected_checksum(8, 256)))
    );

    let copy_node = graph.node(copy).unwrap();
    let copied = match copy_node.get_parameter("copied") {
        Ok(ConfigValue::Int(n)) => n,
        other => panic!("unexpected {:?}", other),
    };
    let shared = match copy_node.get_parameter("shared") {
        Ok(ConfigValue::Int(n)) => n,
        other => panic!("unexpected {:?}", other),
    };
    assert_eq!(copied + shared, 8);

    let events = sink.events_for(out);
    assert_eq!(
        events
            .iter()
            .filter(|e| matches!(e, Event::FirstFrame { .. }))
            .count(),
        1
    );
    assert_eq!(eos_flags(&events), vec![0]);
    // The copy raises end of stream once, on its output.
    assert_eq!(eos_flags(&sink.events_for(copy)), vec![1]);

    graph.shutdown(test_timeout()).unwrap();
    assert!(graph.nodes().iter().all(|n| n.state() == NodeState::Loaded));
}

#[test]
fn test_input_end_of_stream_is_quiet_while_output_runs() {
    let (mut graph, sink) = recording_graph(manual_config());
    let src = graph.add_node("src", Box::new(SourceNode::new(3))).unwrap();
    let fwd = graph.add_node("fwd", Box::new(Forwarder)).unwrap();
    let out = graph.add_node("out", Box::new(SinkNode::new())).unwrap();
    graph.connect(src, 0, fwd, 0).unwrap();
    graph.connect(fwd, 1, out, 0).unwrap();

    graph.transition_all(NodeState::Idle, test_timeout()).unwrap();
    graph
        .transition_all(NodeState::Executing, test_timeout())
        .unwrap();
    let out_node = graph.node(out).unwrap().clone();
    assert!(graph.wait_until(test_timeout(), |_| {
        out_node.get_parameter("eos") == Ok(ConfigValue::Bool(true))
    }));
    graph.run_until_idle();

    assert_eq!(eos_flags(&sink.events_for(fwd)), vec![1]);
    assert_eq!(eos_flags(&sink.events_for(out)), vec![0]);
    assert_eq!(out_node.get_parameter("frames"), Ok(ConfigValue::Int(3)));

    graph.shutdown(test_timeout()).unwrap();
}

#[test]
fn test_fan_out_outputs_share_input_storage() {
    let (mut graph, sink) = recording_graph(manual_config());
    let src = graph
        .add_node(
            "src",
            Box::new(SourceNode::new(10).with_supplier(SupplierRole::Output)),
        )
        .unwrap();
    let split = graph.add_node("split", Box::new(Splitter::default())).unwrap();
    let left = graph.add_node("left", Box::new(SinkNode::new())).unwrap();
    let right = graph.add_node("right", Box::new(SinkNode::new())).unwrap();
    assert_eq!(graph.connect(src, 0, split, 0).unwrap(), SupplierRole::Output);
    assert_eq!(
        graph.connect(split, SPLIT_LEFT, left, 0).unwrap(),
        SupplierRole::Output
    );
    assert_eq!(
        graph.connect(split, SPLIT_RIGHT, right, 0).unwrap(),
        SupplierRole::Output
    );

    graph.transition_all(NodeState::Idle, test_timeout()).unwrap();
    let split_node = graph.node(split).unwrap().clone();
    let input = split_node.port_definition(0).unwrap();
    for port in [SPLIT_LEFT, SPLIT_RIGHT] {
        let output = split_node.port_definition(port).unwrap();
        assert!(output.populated);
        assert_eq!(output.buffer_count_actual, input.buffer_count_actual);
    }

    graph
        .transition_all(NodeState::Executing, test_timeout())
        .unwrap();
    let sinks = [
        graph.node(left).unwrap().clone(),
        graph.node(right).unwrap().clone(),
    ];
    assert!(graph.wait_until(test_timeout(), |_| {
        sinks
            .iter()
            .all(|n| n.get_parameter("eos") == Ok(ConfigValue::Bool(true)))
    }));

    for node in &sinks {
        assert_eq!(node.get_parameter("frames"), Ok(ConfigValue::Int(10)));
        assert_eq!(
            node.get_parameter("checksum"),
            Ok(ConfigValue::Int(expected_checksum(10, 256)))
        );
    }
    assert_eq!(split_node.get_parameter("shared"), Ok(ConfigValue::Int(20)));
    assert_eq!(split_node.get_parameter("copied"), Ok(ConfigValue::Int(0)));
    assert_eq!(eos_flags(&sink.events_for(split)), vec![SPLIT_LEFT, SPLIT_RIGHT]);

    graph.shutdown(test_timeout()).unwrap();
    assert!(graph.nodes().iter().all(|n| n.state() == NodeState::Loaded));
}

#[test]
fn test_mark_reaches_its_target() {
    let (mut graph, sink) = recording_graph(manual_config());
    let src = graph.add_node("src", Box::new(SourceNode::new(4))).unwrap();
    let out = graph.add_node("out", Box::new(SinkNode::new())).unwrap();
    graph.connect(src, 0, out, 0).unwrap();

    graph.transition_all(NodeState::Idle, test_timeout()).unwrap();
    graph
        .node(src)
        .unwrap()
        .send_command(Command::MarkBuffer(0, Mark { target: out, data: 7 }))
        .unwrap();
    graph
        .transition_all(NodeState::Executing, test_timeout())
        .unwrap();
    assert!(graph.wait_until(test_timeout(), |_| {
        sink.events_for(out)
            .iter()
            .any(|e| matches!(e, Event::Mark { data: 7, .. }))
    }));
    assert!(!sink
        .events_for(src)
        .iter()
        .any(|e| matches!(e, Event::Mark { .. })));

    graph.shutdown(test_timeout()).unwrap();
}

#[test]
fn test_pass_through_on_worker_threads() {
    let (mut graph, _events) = Graph::load(threaded_config(2), &GraphConfig::pass_through()).unwrap();
    graph.transition_all(NodeState::Idle, test_timeout()).unwrap();
    graph
        .transition_all(NodeState::Executing, test_timeout())
        .unwrap();

    let out = graph.node_by_name("sink").unwrap().clone();
    assert!(graph.wait_until(test_timeout(), |_| {
        out.get_parameter("eos") == Ok(ConfigValue::Bool(true))
    }));
    assert_eq!(out.get_parameter("frames"), Ok(ConfigValue::Int(64)));
    assert_eq!(
        out.get_parameter("checksum"),
        Ok(ConfigValue::Int(expected_checksum(64, 256)))
    );

    graph.shutdown(test_timeout()).unwrap();
}
