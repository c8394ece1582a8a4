//! Link/unlink bookkeeping
//!
//! The left-chain nodes of the network are cut into segments at every branch
//! point. A segment keeps one bit per node and is linked when all of them are
//! set; a rule's path is linked when every segment it runs through is linked.
//! Nodes that can be empty (left input adapters, joins, exists and async
//! receive nodes) flip their bit as their input goes empty and non-empty.
//! Every other node keeps its bit permanently set.
//!
//! Layouts are computed once when the network is built. The bitmaps live per
//! partition and are mutated on every propagation.

use crate::network::Node;
use crate::types::{NodeId, PartitionId, RuleId};
use roaring::RoaringBitmap;

pub type SegmentId = usize;
pub type PathId = usize;

#[derive(Debug, Clone)]
pub struct SegmentLayout {
    pub id: SegmentId,
    pub nodes: Vec<NodeId>,
    pub partition: PartitionId,
    /// Paths running through this segment, with the segment's position in each
    pub paths: Vec<(PathId, u32)>,
    /// Positions whose bit never changes
    pub always_linked: Vec<u32>,
}

#[derive(Debug, Clone)]
pub struct PathLayout {
    pub id: PathId,
    pub rule: RuleId,
    pub segments: Vec<SegmentId>,
    pub end: NodeId,
    pub partition: PartitionId,
}

/// Static segmentation of a built network
#[derive(Debug, Clone, Default)]
pub struct SegmentLayouts {
    pub segments: Vec<SegmentLayout>,
    pub paths: Vec<PathLayout>,
    pub node_segment: Vec<Option<(SegmentId, u32)>>,
    pub node_paths: Vec<Vec<PathId>>,
}

impl SegmentLayouts {
    /// `rule_ends[r]` is the terminal or async-send node ending rule `r`
    pub fn compute(nodes: &[Node], rule_ends: &[NodeId]) -> Self {
        let mut layouts = Self {
            node_segment: vec![None; nodes.len()],
            node_paths: vec![Vec::new(); nodes.len()],
            ..Self::default()
        };

        for node in nodes {
            let Some(partition) = node.partition else {
                continue;
            };
            let continues = node
                .left_parent
                .filter(|parent| nodes[*parent].left_sinks.len() == 1)
                .and_then(|parent| layouts.node_segment[parent]);
            let (segment, position) = match continues {
                Some((segment, _)) => {
                    let position = layouts.segments[segment].nodes.len() as u32;
                    layouts.segments[segment].nodes.push(node.id);
                    (segment, position)
                }
                None => {
                    let segment = layouts.segments.len();
                    layouts.segments.push(SegmentLayout {
                        id: segment,
                        nodes: vec![node.id],
                        partition,
                        paths: Vec::new(),
                        always_linked: Vec::new(),
                    });
                    (segment, 0)
                }
            };
            if !node.kind.has_link_bit() {
                layouts.segments[segment].always_linked.push(position);
            }
            layouts.node_segment[node.id] = Some((segment, position));
        }

        for (rule, end) in rule_ends.iter().copied().enumerate() {
            let mut segments: Vec<SegmentId> = Vec::new();
            let mut cursor = Some(end);
            while let Some(node) = cursor {
                if let Some((segment, _)) = layouts.node_segment[node] {
                    if segments.last() != Some(&segment) {
                        segments.push(segment);
                    }
                }
                cursor = nodes[node].left_parent;
            }
            segments.reverse();

            let path = layouts.paths.len();
            for (position, segment) in segments.iter().enumerate() {
                layouts.segments[*segment].paths.push((path, position as u32));
                for node in &layouts.segments[*segment].nodes {
                    layouts.node_paths[*node].push(path);
                }
            }
            layouts.paths.push(PathLayout {
                id: path,
                rule,
                segments,
                end,
                partition: nodes[end].partition.unwrap_or_default(),
            });
        }
        layouts
    }
}

/// Runtime link state of one segment
#[derive(Debug, Clone)]
pub struct SegmentMemory {
    linked: RoaringBitmap,
    size: u32,
}

impl SegmentMemory {
    pub fn new(layout: &SegmentLayout) -> Self {
        let mut linked = RoaringBitmap::new();
        for position in &layout.always_linked {
            linked.insert(*position);
        }
        Self { linked, size: layout.nodes.len() as u32 }
    }

    /// Set a node bit; true when this completes the segment
    pub fn link_node(&mut self, position: u32) -> bool {
        let was_linked = self.is_linked();
        self.linked.insert(position);
        !was_linked && self.is_linked()
    }

    /// Clear a node bit; true when the segment was linked before
    pub fn unlink_node(&mut self, position: u32) -> bool {
        let was_linked = self.is_linked();
        self.linked.remove(position);
        was_linked && !self.is_linked()
    }

    pub fn is_linked(&self) -> bool {
        self.linked.len() == u64::from(self.size)
    }
}

/// Runtime link state of one rule's path
#[derive(Debug, Clone)]
pub struct PathMemory {
    linked: RoaringBitmap,
    size: u32,
}

impl PathMemory {
    pub fn new(layout: &PathLayout) -> Self {
        Self { linked: RoaringBitmap::new(), size: layout.segments.len() as u32 }
    }

    pub fn link_segment(&mut self, position: u32) -> bool {
        let was_linked = self.is_linked();
        self.linked.insert(position);
        !was_linked && self.is_linked()
    }

    pub fn unlink_segment(&mut self, position: u32) -> bool {
        let was_linked = self.is_linked();
        self.linked.remove(position);
        was_linked && !self.is_linked()
    }

    pub fn is_linked(&self) -> bool {
        self.linked.len() == u64::from(self.size)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn layout(size: usize, always: &[u32]) -> SegmentLayout {
        SegmentLayout {
            id: 0,
            nodes: (0..size).collect(),
            partition: 0,
            paths: Vec::new(),
            always_linked: always.to_vec(),
        }
    }

    #[test]
    fn test_segment_links_when_all_bits_set() {
        let mut segment = SegmentMemory::new(&layout(3, &[2]));
        assert!(!segment.is_linked());
        assert!(!segment.link_node(0));
        assert!(segment.link_node(1));
        assert!(segment.is_linked());
        assert!(!segment.link_node(1));
        assert!(segment.unlink_node(0));
        assert!(!segment.unlink_node(0));
        // the fixed bit survives unlinking the variable ones
        assert!(segment.link_node(0));
    }

    #[test]
    fn test_path_needs_every_segment() {
        let path_layout =
            PathLayout { id: 0, rule: 0, segments: vec![0, 1], end: 4, partition: 0 };
        let mut path = PathMemory::new(&path_layout);
        assert!(!path.link_segment(1));
        assert!(path.link_segment(0));
        assert!(path.is_linked());
        assert!(path.unlink_segment(1));
        assert!(!path.is_linked());
    }

    #[test]
    fn test_segment_without_variable_bits_starts_linked() {
        let segment = SegmentMemory::new(&layout(2, &[0, 1]));
        assert!(segment.is_linked());
    }
}
