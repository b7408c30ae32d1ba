use crate::node::NodeConfig;
use crate::NodeId;
use std::ops::Range;

/// Flat numbering of every core in the cluster.
///
/// A global bit position `offset(n) + k` denotes local core `k` on node `n`.
/// Rebuilt whenever the node table changes; all bitmaps derived from the old
/// numbering are invalid afterwards and must be reconstructed by callers.
#[derive(Debug, Clone, Default)]
pub struct CoreMap {
    offsets: Vec<u32>,
    cores: Vec<u16>,
}

impl CoreMap {
    pub fn build(nodes: &[NodeConfig]) -> Self {
        let mut map = CoreMap::default();
        map.rebuild(nodes);
        map
    }

    pub fn rebuild(&mut self, nodes: &[NodeConfig]) {
        self.cores.clear();
        self.offsets.clear();
        self.offsets.reserve(nodes.len() + 1);
        let mut offset = 0u32;
        for node in nodes {
            self.offsets.push(offset);
            self.cores.push(node.cores);
            offset += u32::from(node.cores);
        }
        self.offsets.push(offset);
    }

    #[inline]
    pub fn node_count(&self) -> usize {
        self.cores.len()
    }

    #[inline]
    pub fn offset(&self, node: NodeId) -> usize {
        self.offsets[node.as_num() as usize] as usize
    }

    #[inline]
    pub fn cores(&self, node: NodeId) -> u16 {
        self.cores[node.as_num() as usize]
    }

    #[inline]
    pub fn total_cores(&self) -> usize {
        self.offsets.last().copied().unwrap_or(0) as usize
    }

    /// The global bit range covering all cores of `node`.
    #[inline]
    pub fn node_span(&self, node: NodeId) -> Range<usize> {
        let n = node.as_num() as usize;
        self.offsets[n] as usize..self.offsets[n + 1] as usize
    }
}

#[cfg(test)]
mod tests {
    use super::CoreMap;
    use crate::node::NodeConfig;
    use crate::NodeId;

    #[test]
    fn test_offsets_are_prefix_sums() {
        let nodes: Vec<_> = [2u16, 4, 1, 3]
            .iter()
            .enumerate()
            .map(|(i, &c)| NodeConfig::with_cores(&format!("n{i}"), c))
            .collect();
        let map = CoreMap::build(&nodes);
        assert_eq!(map.total_cores(), 10);
        assert_eq!(map.offset(NodeId::new(0)), 0);
        assert_eq!(map.offset(NodeId::new(2)), 6);
        assert_eq!(map.node_span(NodeId::new(1)), 2..6);
        assert_eq!(map.cores(NodeId::new(3)), 3);
    }

    #[test]
    fn test_rebuild_replaces_layout() {
        let mut map = CoreMap::build(&[NodeConfig::with_cores("a", 8)]);
        assert_eq!(map.total_cores(), 8);
        map.rebuild(&[
            NodeConfig::with_cores("a", 2),
            NodeConfig::with_cores("b", 2),
        ]);
        assert_eq!(map.total_cores(), 4);
        assert_eq!(map.node_span(NodeId::new(1)), 2..4);
    }
}
