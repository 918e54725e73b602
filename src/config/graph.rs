//! Graph descriptions
//!
//! A [`GraphConfig`] names the nodes of a demo graph and the tunnels between
//! them. Links are written `"node:port"`, from an output to an input:
//!
//! ```toml
//! [[nodes]]
//! name = "src"
//! kind = "source"
//! frames = 16
//!
//! [[nodes]]
//! name = "out"
//! kind = "sink"
//! group_priority = 1
//! resources = ["Nvx.HW.AudioRenderers"]
//!
//! [[links]]
//! from = "src:0"
//! to = "out:0"
//! ```

use crate::error::{MediaFlowError, Result};
use crate::pipeline::tunnel::SupplierRole;
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::fmt;
use std::str::FromStr;

/// Built-in node behaviors a description can instantiate
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NodeKind {
    Source,
    Copy,
    Sink,
}

impl fmt::Display for NodeKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            NodeKind::Source => write!(f, "source"),
            NodeKind::Copy => write!(f, "copy"),
            NodeKind::Sink => write!(f, "sink"),
        }
    }
}

/// Supplier preference for one port
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct PortPreference {
    pub port: usize,
    pub supplier: SupplierRole,
}

/// One node of the graph
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NodeConfig {
    /// Unique name, used in links
    pub name: String,

    pub kind: NodeKind,

    /// Broker priority; lower wins. Node default when unset.
    #[serde(default)]
    pub group_priority: Option<u32>,

    /// Frames a source produces before end of stream
    #[serde(default)]
    pub frames: Option<u64>,

    /// Payload bytes per frame (source) or buffer size (all kinds)
    #[serde(default)]
    pub buffer_size: Option<usize>,

    /// Buffers per port
    #[serde(default)]
    pub buffer_count: Option<usize>,

    /// Extra broker pools the node needs
    #[serde(default)]
    pub resources: Vec<String>,

    #[serde(default)]
    pub suppliers: Vec<PortPreference>,
}

impl NodeConfig {
    pub fn new(name: impl Into<String>, kind: NodeKind) -> Self {
        Self {
            name: name.into(),
            kind,
            group_priority: None,
            frames: None,
            buffer_size: None,
            buffer_count: None,
            resources: Vec::new(),
            suppliers: Vec::new(),
        }
    }
}

/// `node:port` endpoint of a link
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Endpoint {
    pub node: String,
    pub port: usize,
}

impl FromStr for Endpoint {
    type Err = MediaFlowError;

    fn from_str(s: &str) -> Result<Self> {
        let (node, port) = s
            .rsplit_once(':')
            .ok_or_else(|| MediaFlowError::Graph(format!("endpoint '{}' is not node:port", s)))?;
        if node.is_empty() {
            return Err(MediaFlowError::Graph(format!("endpoint '{}' has no node", s)));
        }
        let port = port
            .parse()
            .map_err(|_| MediaFlowError::Graph(format!("endpoint '{}' has a bad port", s)))?;
        Ok(Self {
            node: node.to_string(),
            port,
        })
    }
}

impl fmt::Display for Endpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.node, self.port)
    }
}

/// A tunnel from an output endpoint to an input endpoint
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LinkConfig {
    pub from: String,
    pub to: String,
}

impl LinkConfig {
    pub fn new(from: impl Into<String>, to: impl Into<String>) -> Self {
        Self {
            from: from.into(),
            to: to.into(),
        }
    }

    pub fn endpoints(&self) -> Result<(Endpoint, Endpoint)> {
        Ok((self.from.parse()?, self.to.parse()?))
    }
}

/// Nodes plus links
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct GraphConfig {
    #[serde(default)]
    pub nodes: Vec<NodeConfig>,

    #[serde(default)]
    pub links: Vec<LinkConfig>,
}

impl GraphConfig {
    /// `src -> copy -> sink`, the graph the CLI runs without a description.
    pub fn pass_through() -> Self {
        let mut source = NodeConfig::new("src", NodeKind::Source);
        source.frames = Some(64);
        let mut sink = NodeConfig::new("sink", NodeKind::Sink);
        sink.group_priority = Some(10);
        Self {
            nodes: vec![
                source,
                NodeConfig::new("copy", NodeKind::Copy),
                sink,
            ],
            links: vec![
                LinkConfig::new("src:0", "copy:0"),
                LinkConfig::new("copy:1", "sink:0"),
            ],
        }
    }

    pub fn node(&self, name: &str) -> Option<&NodeConfig> {
        self.nodes.iter().find(|n| n.name == name)
    }

    /// Check names are unique and every link names known nodes.
    pub fn validate(&self) -> Result<()> {
        let mut names = HashSet::new();
        for node in &self.nodes {
            if !names.insert(node.name.as_str()) {
                return Err(MediaFlowError::Graph(format!(
                    "duplicate node name '{}'",
                    node.name
                )));
            }
        }
        for link in &self.links {
            let (from, to) = link.endpoints()?;
            for end in [&from, &to] {
                if !names.contains(end.node.as_str()) {
                    return Err(MediaFlowError::Graph(format!(
                        "link {} -> {} names unknown node '{}'",
                        link.from, link.to, end.node
                    )));
                }
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_endpoint_parsing() {
        let end: Endpoint = "dec:1".parse().unwrap();
        assert_eq!(end, Endpoint { node: "dec".into(), port: 1 });
        assert_eq!(end.to_string(), "dec:1");
        assert!("dec".parse::<Endpoint>().is_err());
        assert!(":1".parse::<Endpoint>().is_err());
        assert!("dec:x".parse::<Endpoint>().is_err());
    }

    #[test]
    fn test_pass_through_is_valid() {
        let graph = GraphConfig::pass_through();
        graph.validate().unwrap();
        assert_eq!(graph.node("copy").map(|n| n.kind), Some(NodeKind::Copy));
    }

    #[test]
    fn test_validate_rejects_unknown_and_duplicate() {
        let mut graph = GraphConfig::pass_through();
        graph.links.push(LinkConfig::new("copy:1", "nowhere:0"));
        assert!(graph.validate().is_err());

        let mut graph = GraphConfig::pass_through();
        graph.nodes.push(NodeConfig::new("src", NodeKind::Sink));
        assert!(graph.validate().is_err());
    }

    #[test]
    fn test_toml_description() {
        let text = r#"
            [[nodes]]
            name = "src"
            kind = "source"
            frames = 4

            [[nodes]]
            name = "out"
            kind = "sink"
            resources = ["Nvx.HW.AudioRenderers"]
            suppliers = [{ port = 0, supplier = "output" }]

            [[links]]
            from = "src:0"
            to = "out:0"
        "#;
        let graph: GraphConfig = toml::from_str(text).unwrap();
        graph.validate().unwrap();
        let out = graph.node("out").unwrap();
        assert_eq!(out.kind, NodeKind::Sink);
        assert_eq!(out.suppliers[0].supplier, SupplierRole::Output);
        assert_eq!(graph.node("src").unwrap().frames, Some(4));
    }
}
