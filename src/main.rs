//! MediaFlow - Main Entry Point
//!
//! Runs a graph description end to end and prints per-node port counters.

use anyhow::{bail, Context};
use clap::{Parser, Subcommand};
use mediaflow_rs::{
    config::{default_config_path, GraphConfig, NodeKind, RuntimeConfig},
    logging,
    pipeline::{ConfigValue, Event, Graph, NodeState, SinkMessage},
};
use std::path::PathBuf;
use std::time::Duration;

#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    #[command(subcommand)]
    command: Cmd,
}

#[derive(Subcommand, Debug)]
enum Cmd {
    /// Run a graph until every sink saw end of stream
    Run {
        /// Runtime config (TOML or JSON); the app data dir copy otherwise
        #[arg(short, long)]
        config: Option<PathBuf>,

        /// Graph description; source -> copy -> sink otherwise
        #[arg(short, long)]
        graph: Option<PathBuf>,

        /// Budget for each state change and for the run itself
        #[arg(long, default_value = "10000")]
        timeout_ms: u64,
    },

    /// List the configured resource pools
    Pools {
        #[arg(short, long)]
        config: Option<PathBuf>,
    },

    /// Print the default runtime config as TOML
    DefaultConfig,
}

fn load_runtime(path: Option<&PathBuf>) -> anyhow::Result<RuntimeConfig> {
    match path {
        Some(path) => RuntimeConfig::load(path)
            .with_context(|| format!("loading runtime config {}", path.display())),
        None => Ok(RuntimeConfig::load_or_default()),
    }
}

fn run(config: RuntimeConfig, description: GraphConfig, timeout: Duration) -> anyhow::Result<()> {
    let (mut graph, events) = Graph::load(config, &description)?;

    let sinks: Vec<_> = description
        .nodes
        .iter()
        .filter(|n| n.kind == NodeKind::Sink)
        .filter_map(|n| graph.node_by_name(&n.name).cloned())
        .collect();
    if sinks.is_empty() {
        bail!("graph has no sink node");
    }

    graph.transition_all(NodeState::Idle, timeout)?;
    graph.transition_all(NodeState::Executing, timeout)?;
    tracing::info!("Graph running");

    let finished = graph.wait_until(timeout, |_| {
        while let Ok(message) = events.try_recv() {
            if let SinkMessage::Event(event @ Event::Error { .. }) = message {
                tracing::warn!("{:?}", event);
            }
        }
        sinks
            .iter()
            .all(|sink| sink.get_parameter("eos") == Ok(ConfigValue::Bool(true)))
    });
    if !finished {
        tracing::warn!("Timed out before end of stream");
    }

    for sink in &sinks {
        let frames = sink.get_parameter("frames")?;
        let bytes = sink.get_parameter("bytes")?;
        println!("{}: {:?} frame(s), {:?} byte(s)", sink.name(), frames, bytes);
    }
    println!();
    for report in graph.reports() {
        println!("{} [{}] {:?}", report.name, report.id, report.state);
        for (i, stats) in report.ports.iter().enumerate() {
            println!(
                "  port {}: etb={} ftb={} delivered={} released={} returned={} flushed={}",
                i,
                stats.empty_this_buffer_calls,
                stats.fill_this_buffer_calls,
                stats.delivered,
                stats.released,
                stats.returned,
                stats.flushed
            );
        }
    }

    graph.shutdown(timeout)?;
    if !finished {
        bail!("graph did not reach end of stream within {:?}", timeout);
    }
    Ok(())
}

fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    match args.command {
        Cmd::Run {
            config,
            graph,
            timeout_ms,
        } => {
            let runtime = load_runtime(config.as_ref())?;
            let _guard = logging::init(&runtime.logging)?;
            tracing::info!("Starting MediaFlow");

            let description = match graph {
                Some(path) => GraphConfig::load(&path)
                    .with_context(|| format!("loading graph {}", path.display()))?,
                None => GraphConfig::pass_through(),
            };
            run(runtime, description, Duration::from_millis(timeout_ms))
        }
        Cmd::Pools { config } => {
            let runtime = load_runtime(config.as_ref())?;
            for pool in &runtime.resources {
                println!("{:<32} {}", pool.name, pool.capacity);
            }
            Ok(())
        }
        Cmd::DefaultConfig => {
            if let Some(path) = default_config_path() {
                eprintln!("# default location: {}", path.display());
            }
            print!("{}", RuntimeConfig::default_toml()?);
            Ok(())
        }
    }
}
