//! Built-in node behaviors.
//!
//! ```text
//! [SourceNode] ──► [CopyNode] ──► [SinkNode]
//! ```

pub mod copy;
pub mod sink;
pub mod source;

pub use copy::{CopyNode, CopyStats};
pub use sink::{SinkNode, SinkStats};
pub use source::SourceNode;

use crate::config::{NodeConfig, NodeKind};
use crate::pipeline::behavior::NodeBehavior;

pub const DEFAULT_FRAMES: u64 = 64;
pub const DEFAULT_BUFFER_COUNT: usize = 2;
pub const DEFAULT_BUFFER_SIZE: usize = 1024;

/// Instantiate the behavior a node description asks for.
pub fn build_behavior(config: &NodeConfig) -> Box<dyn NodeBehavior> {
    let count = config.buffer_count.unwrap_or(DEFAULT_BUFFER_COUNT);
    let size = config.buffer_size.unwrap_or(DEFAULT_BUFFER_SIZE);
    match config.kind {
        NodeKind::Source => Box::new(
            SourceNode::new(config.frames.unwrap_or(DEFAULT_FRAMES))
                .with_buffers(count, size)
                .with_frame_size(size / 4),
        ),
        NodeKind::Copy => Box::new(CopyNode::new().with_buffers(count, size)),
        NodeKind::Sink => Box::new(
            SinkNode::new()
                .with_buffers(count, size)
                .with_resources(config.resources.iter().cloned()),
        ),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_build_behavior_by_kind() {
        let mut config = NodeConfig::new("a", NodeKind::Source);
        config.buffer_size = Some(512);
        let source = build_behavior(&config);
        assert_eq!(source.name(), "Source");
        assert_eq!(source.ports()[0].buffer_size, 512);

        let copy = build_behavior(&NodeConfig::new("b", NodeKind::Copy));
        assert_eq!(copy.sharing_candidates(), vec![(0, 1)]);

        let mut config = NodeConfig::new("c", NodeKind::Sink);
        config.resources = vec!["Nvx.HW.AudioRenderers".to_string()];
        let sink = build_behavior(&config);
        assert_eq!(sink.resources().len(), 1);
    }
}
