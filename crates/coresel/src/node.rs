use serde::{Deserialize, Serialize};

use crate::devices::DeviceHandle;

/// Static per-node configuration as replayed by the controller.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NodeConfig {
    pub name: String,
    /// Allocatable cores.
    pub cores: u16,
    /// Logical cpus; exceeds `cores` when SMT is enabled and cpus count
    /// hardware threads.
    pub cpus: u16,
    /// Hardware threads per core.
    pub threads: u16,
    pub real_memory: u64,
    /// Memory reserved for system use, never allocatable to jobs.
    pub mem_spec_limit: u64,
    /// Specialized cores (taken from the high end of the node's core range)
    /// excluded from job allocations.
    pub core_spec_cnt: u16,
    pub powered_down: bool,
    /// Per-TRES billing weights, when the cluster configures them.
    pub tres_weights: Option<Vec<f64>>,
}

impl NodeConfig {
    pub fn with_cores(name: &str, cores: u16) -> Self {
        NodeConfig {
            name: name.to_string(),
            cores,
            cpus: cores,
            threads: 1,
            real_memory: 0,
            mem_spec_limit: 0,
            core_spec_cnt: 0,
            powered_down: false,
            tres_weights: None,
        }
    }

    /// Memory a job may actually consume on this node.
    #[inline]
    pub fn avail_memory(&self) -> u64 {
        self.real_memory.saturating_sub(self.mem_spec_limit)
    }

    /// Count of cores jobs may be placed on (specialized cores excluded).
    #[inline]
    pub fn selectable_cores(&self) -> u16 {
        self.cores.saturating_sub(self.core_spec_cnt)
    }
}

/// Sharing mode a job imposes on each of its nodes.
#[derive(Debug, Copy, Clone, Eq, PartialEq, Serialize, Deserialize)]
pub enum NodeReq {
    /// Fully shareable.
    Available,
    /// Shareable, but only with jobs in the same row.
    OneRow,
    /// Exclusive use of the node.
    Exclusive,
}

impl NodeReq {
    #[inline]
    pub fn weight(self) -> u16 {
        match self {
            NodeReq::Available => 0,
            NodeReq::OneRow => 1,
            NodeReq::Exclusive => 2,
        }
    }
}

/// Accumulated sharing weight of the jobs resident on a node.
///
/// A count at or above the exclusive weight means nobody else may enter;
/// zero means the node is entirely free of sharing constraints.
#[derive(Debug, Copy, Clone, Default, Eq, PartialEq)]
pub struct SharingState(u16);

impl SharingState {
    #[inline]
    pub fn add(&mut self, req: NodeReq) {
        self.0 += req.weight();
    }

    /// Decrement by the job's sharing weight. Underflow is a state miscount:
    /// repaired to zero and logged, the operation continues.
    pub fn remove(&mut self, req: NodeReq, node_name: &str) {
        let w = req.weight();
        if self.0 >= w {
            self.0 -= w;
        } else {
            log::error!("node {node_name}: sharing state miscount, clamping to available");
            self.0 = 0;
        }
    }

    #[inline]
    pub fn is_available(&self) -> bool {
        self.0 == 0
    }

    /// Some resident job holds the node exclusively (or enough one-row jobs
    /// accumulated to the same weight).
    #[inline]
    pub fn is_exclusive(&self) -> bool {
        self.0 >= NodeReq::Exclusive.weight()
    }

    #[inline]
    pub fn count(&self) -> u16 {
        self.0
    }
}

/// Per-node allocation bookkeeping; lives for the node's lifetime.
#[derive(Debug, Clone, Default)]
pub struct NodeUsage {
    pub node_state: SharingState,
    pub alloc_memory: u64,
    pub device_state: Option<DeviceHandle>,
}
