use crate::common::Bitmap;
use crate::coremap::CoreMap;
use crate::node::NodeConfig;
use crate::NodeId;

/// Granularity at which nodes are handed to jobs.
///
/// The engine is written against this interface and receives an
/// implementation at construction time; consumable cores is the normal mode,
/// the node-level selector reproduces linear (whole-node) selection.
pub trait SelectorPolicy: std::fmt::Debug {
    fn name(&self) -> &'static str;

    /// Cores on `node` a new job could take, given the current global
    /// free-core map.
    fn avail_cores_on_node(
        &self,
        cfg: &NodeConfig,
        cmap: &CoreMap,
        node: NodeId,
        free: &Bitmap,
    ) -> u16;

    /// Availability map over the candidate nodes: every selectable core set,
    /// specialized cores left clear.
    fn mark_avail_cores(&self, cmap: &CoreMap, nodes: &[NodeConfig], candidates: &Bitmap)
        -> Bitmap;

    /// Logical cpus represented by `cores` allocated cores of this node.
    /// When the node reports more cpus than cores, cpus count hardware
    /// threads and allocation scales by the thread factor.
    fn cpus_from_cores(&self, cfg: &NodeConfig, cores: u16) -> u16;
}

fn mark_selectable(cmap: &CoreMap, nodes: &[NodeConfig], candidates: &Bitmap) -> Bitmap {
    let mut avail = Bitmap::zeros(cmap.total_cores());
    for n in candidates.iter_ones() {
        let node = NodeId::new(n as u32);
        let start = cmap.offset(node);
        let selectable = nodes[n].selectable_cores() as usize;
        avail.set_range(start..start + selectable);
    }
    avail
}

fn scale_cpus(cfg: &NodeConfig, cores: u16) -> u16 {
    if cfg.cores < cfg.cpus {
        cores.saturating_mul(cfg.threads).min(cfg.cpus)
    } else {
        cores
    }
}

/// Consumable-core selection: jobs take individual cores.
#[derive(Debug, Default)]
pub struct CoreSelector;

impl SelectorPolicy for CoreSelector {
    fn name(&self) -> &'static str {
        "cores"
    }

    fn avail_cores_on_node(
        &self,
        cfg: &NodeConfig,
        cmap: &CoreMap,
        node: NodeId,
        free: &Bitmap,
    ) -> u16 {
        let span = cmap.node_span(node);
        let free_cores = free.count_range(span) as u16;
        free_cores.min(cfg.selectable_cores())
    }

    fn mark_avail_cores(
        &self,
        cmap: &CoreMap,
        nodes: &[NodeConfig],
        candidates: &Bitmap,
    ) -> Bitmap {
        mark_selectable(cmap, nodes, candidates)
    }

    fn cpus_from_cores(&self, cfg: &NodeConfig, cores: u16) -> u16 {
        scale_cpus(cfg, cores)
    }
}

/// Linear selection: a node is usable only when entirely free, and a job
/// always takes all of it.
#[derive(Debug, Default)]
pub struct NodeSelector;

impl SelectorPolicy for NodeSelector {
    fn name(&self) -> &'static str {
        "nodes"
    }

    fn avail_cores_on_node(
        &self,
        cfg: &NodeConfig,
        cmap: &CoreMap,
        node: NodeId,
        free: &Bitmap,
    ) -> u16 {
        let span = cmap.node_span(node);
        let selectable = cfg.selectable_cores();
        if free.count_range(span) as u16 >= selectable {
            selectable
        } else {
            0
        }
    }

    fn mark_avail_cores(
        &self,
        cmap: &CoreMap,
        nodes: &[NodeConfig],
        candidates: &Bitmap,
    ) -> Bitmap {
        mark_selectable(cmap, nodes, candidates)
    }

    fn cpus_from_cores(&self, cfg: &NodeConfig, cores: u16) -> u16 {
        scale_cpus(cfg, cores)
    }
}

#[cfg(test)]
mod tests {
    use super::{CoreSelector, NodeSelector, SelectorPolicy};
    use crate::common::Bitmap;
    use crate::coremap::CoreMap;
    use crate::node::NodeConfig;
    use crate::NodeId;

    #[test]
    fn test_core_selector_counts_free() {
        let nodes = vec![NodeConfig::with_cores("n0", 4)];
        let cmap = CoreMap::build(&nodes);
        let policy = CoreSelector;
        let mut free = policy.mark_avail_cores(&cmap, &nodes, &Bitmap::from_indices(1, &[0]));
        assert_eq!(free.set_count(), 4);
        free.clear(1);
        assert_eq!(
            policy.avail_cores_on_node(&nodes[0], &cmap, NodeId::new(0), &free),
            3
        );
    }

    #[test]
    fn test_node_selector_is_all_or_nothing() {
        let nodes = vec![NodeConfig::with_cores("n0", 4)];
        let cmap = CoreMap::build(&nodes);
        let policy = NodeSelector;
        let mut free = policy.mark_avail_cores(&cmap, &nodes, &Bitmap::from_indices(1, &[0]));
        assert_eq!(
            policy.avail_cores_on_node(&nodes[0], &cmap, NodeId::new(0), &free),
            4
        );
        free.clear(0);
        assert_eq!(
            policy.avail_cores_on_node(&nodes[0], &cmap, NodeId::new(0), &free),
            0
        );
    }

    #[test]
    fn test_spec_cores_are_not_selectable() {
        let mut cfg = NodeConfig::with_cores("n0", 4);
        cfg.core_spec_cnt = 1;
        let nodes = vec![cfg];
        let cmap = CoreMap::build(&nodes);
        let policy = CoreSelector;
        let free = policy.mark_avail_cores(&cmap, &nodes, &Bitmap::from_indices(1, &[0]));
        // the high core stays clear
        assert_eq!(free.set_count(), 3);
        assert!(!free.test(3));
    }

    #[test]
    fn test_smt_scaling() {
        let mut cfg = NodeConfig::with_cores("n0", 2);
        cfg.cpus = 4;
        cfg.threads = 2;
        let policy = CoreSelector;
        assert_eq!(policy.cpus_from_cores(&cfg, 1), 2);
        assert_eq!(policy.cpus_from_cores(&cfg, 2), 4);
        // no SMT: identity
        let flat = NodeConfig::with_cores("n1", 2);
        assert_eq!(policy.cpus_from_cores(&flat, 2), 2);
    }
}
