use crate::common::Bitmap;
use crate::coremap::CoreMap;
use crate::devices::DeviceSubsystem;
use crate::node::{NodeConfig, NodeUsage};
use crate::partition::PartitionRes;
use crate::NodeId;

pub const TRES_CPU: usize = 0;
pub const TRES_MEM: usize = 1;
pub const TRES_DEVICE_BASE: usize = 2;

/// Per-node allocation snapshot derived from the row tables and the usage
/// table, for external queries.
#[derive(Debug, Clone, Default)]
pub struct NodeInfo {
    pub alloc_cpus: u16,
    pub alloc_memory: u64,
    pub tres_alloc: Vec<u64>,
    pub tres_weighted: f64,
}

#[derive(Debug, Eq, PartialEq)]
pub enum RollupOutcome {
    Updated,
    NoChange,
}

#[derive(Debug, Default)]
pub struct NodeInfoCache {
    infos: Vec<NodeInfo>,
    last_set_all: u64,
}

impl NodeInfoCache {
    pub fn reset(&mut self, node_count: usize) {
        self.infos = vec![NodeInfo::default(); node_count];
        self.last_set_all = 0;
    }

    pub fn get(&self, node: NodeId) -> Option<&NodeInfo> {
        self.infos.get(node.as_num() as usize)
    }

    /// Recompute every node's snapshot unless nothing changed since the last
    /// rollup.
    pub fn set_all(
        &mut self,
        cmap: &CoreMap,
        nodes: &[NodeConfig],
        usage: &[NodeUsage],
        partitions: &[PartitionRes],
        devices: &dyn DeviceSubsystem,
        last_node_update: u64,
    ) -> RollupOutcome {
        if self.last_set_all != 0 && last_node_update < self.last_set_all {
            log::debug!("node select info has not changed since {}", self.last_set_all);
            return RollupOutcome::NoChange;
        }
        self.last_set_all = last_node_update + 1;

        // cores allocated to any active job, over every row of every partition
        let mut alloc_cores: Option<Bitmap> = None;
        for part in partitions {
            for row in &part.rows {
                let Some(bitmap) = &row.row_bitmap else {
                    continue;
                };
                match &mut alloc_cores {
                    None => alloc_cores = Some(bitmap.clone()),
                    Some(acc) if acc.len() == bitmap.len() => acc.or_with(bitmap),
                    Some(_) => (),
                }
            }
        }

        let tres_len = TRES_DEVICE_BASE + devices.tres_count();
        for (n, cfg) in nodes.iter().enumerate() {
            let node = NodeId::new(n as u32);
            let span = cmap.node_span(node);
            let node_cores = span.len() as u16;
            let mut alloc_cpus = match &alloc_cores {
                Some(acc) => acc.count_range(span) as u16,
                None => 0,
            };
            // a resumed job can oversubscribe cores; never report more in
            // use than configured
            if alloc_cpus > node_cores {
                alloc_cpus = node_cores;
            }
            // the minimum allocatable unit may be a core, so scale by the
            // thread count up to the proper cpu count
            if node_cores < cfg.cpus {
                alloc_cpus = alloc_cpus.saturating_mul(cfg.threads).min(cfg.cpus);
            }

            let info = &mut self.infos[n];
            info.alloc_cpus = alloc_cpus;
            info.alloc_memory = usage[n].alloc_memory;
            info.tres_alloc.clear();
            info.tres_alloc.resize(tres_len, 0);
            info.tres_alloc[TRES_CPU] = u64::from(alloc_cpus);
            info.tres_alloc[TRES_MEM] = info.alloc_memory;
            devices.set_node_tres_cnt(
                usage[n].device_state.as_ref(),
                &mut info.tres_alloc[TRES_DEVICE_BASE..],
            );
            info.tres_weighted = match &cfg.tres_weights {
                Some(weights) => devices.tres_weighted(&info.tres_alloc, weights),
                None => 0.0,
            };
        }
        RollupOutcome::Updated
    }
}
