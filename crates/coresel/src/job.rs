use std::ops::Range;

use crate::common::{Bitmap, Map};
use crate::coremap::CoreMap;
use crate::node::NodeReq;
use crate::{JobId, NodeId, PartitionId};

/// Resources selected for one job: which nodes, how many cpus and how much
/// memory on each, and which exact cores.
///
/// Per-node arrays are indexed by *rank* — the position of the node within
/// `node_bitmap` — not by the global node index. `core_bitmap` is packed: it
/// covers only the selected nodes, one contiguous slice per rank, with no
/// gaps for unselected nodes.
#[derive(Debug, Clone)]
pub struct JobResources {
    pub node_bitmap: Bitmap,
    pub nhosts: u32,
    pub ncpus: u32,
    pub cpus: Vec<u16>,
    pub cpus_used: Vec<u16>,
    pub memory_allocated: Vec<u64>,
    pub memory_used: Vec<u64>,
    pub core_bitmap: Bitmap,
    pub node_req: NodeReq,
    pub whole_node: bool,
}

impl JobResources {
    /// Empty record sized for `node_cnt` selected nodes out of `total_nodes`,
    /// with `core_bits` packed core positions.
    pub fn sized(node_cnt: usize, total_nodes: usize, core_bits: usize) -> Self {
        JobResources {
            node_bitmap: Bitmap::zeros(total_nodes),
            nhosts: node_cnt as u32,
            ncpus: 0,
            cpus: vec![0; node_cnt],
            cpus_used: vec![0; node_cnt],
            memory_allocated: vec![0; node_cnt],
            memory_used: vec![0; node_cnt],
            core_bitmap: Bitmap::zeros(core_bits),
            node_req: NodeReq::Available,
            whole_node: false,
        }
    }

    /// Rank of `node` within the selected set, if selected.
    pub fn rank_of(&self, node: NodeId) -> Option<usize> {
        let n = node.as_num() as usize;
        if n >= self.node_bitmap.len() || !self.node_bitmap.test(n) {
            return None;
        }
        Some(self.node_bitmap.count_range(0..n))
    }

    pub fn selected_nodes(&self) -> impl Iterator<Item = NodeId> + '_ {
        self.node_bitmap.iter_ones().map(|n| NodeId::new(n as u32))
    }

    /// Packed range of `rank`'s cores within `core_bitmap`.
    pub fn packed_span(&self, cmap: &CoreMap, rank: usize) -> Range<usize> {
        let mut start = 0usize;
        let mut node_cores = 0usize;
        for (r, node) in self.selected_nodes().enumerate() {
            node_cores = cmap.cores(node) as usize;
            if r == rank {
                break;
            }
            start += node_cores;
        }
        start..start + node_cores
    }

    /// Allocated cores on `rank`'s node.
    pub fn cores_on_rank(&self, cmap: &CoreMap, rank: usize) -> usize {
        let span = self.packed_span(cmap, rank);
        self.core_bitmap.count_range(span)
    }

    /// Sort key used by the row packer: the coremap offset of the first
    /// selected node plus the first set bit of the packed core map.
    pub fn first_global_core(&self, cmap: &CoreMap) -> usize {
        let first_node = match self.node_bitmap.first_set() {
            Some(n) => NodeId::new(n as u32),
            None => return 0,
        };
        cmap.offset(first_node) + self.core_bitmap.first_set().unwrap_or(0)
    }

    /// OR this job's cores into a cluster-wide core map (a row bitmap).
    pub fn add_to_cores(&self, cmap: &CoreMap, row: &mut Bitmap) {
        let mut packed = 0usize;
        for node in self.selected_nodes() {
            let len = cmap.cores(node) as usize;
            row.or_range(cmap.offset(node), &self.core_bitmap, packed, len);
            packed += len;
        }
    }

    /// Clear this job's cores from a cluster-wide core map.
    pub fn remove_from_cores(&self, cmap: &CoreMap, row: &mut Bitmap) {
        let mut packed = 0usize;
        for node in self.selected_nodes() {
            let len = cmap.cores(node) as usize;
            row.and_not_range(cmap.offset(node), &self.core_bitmap, packed, len);
            packed += len;
        }
    }

    /// True when none of this job's cores is occupied in `row`.
    pub fn fits_into_cores(&self, cmap: &CoreMap, row: &Bitmap) -> bool {
        let mut packed = 0usize;
        for node in self.selected_nodes() {
            let len = cmap.cores(node) as usize;
            let span = cmap.node_span(node);
            if self.whole_node {
                // an exclusive node must have no occupied core at all
                if row.range_any(span) {
                    return false;
                }
            } else if !self
                .core_bitmap
                .range_disjoint(packed..packed + len, row, span.start)
            {
                return false;
            }
            packed += len;
        }
        true
    }

    /// Drop one node (by rank) from the record in place: per-node arrays,
    /// the packed core slice, the node bit, the host count.
    pub fn extract_node(&mut self, cmap: &CoreMap, rank: usize, node: NodeId) {
        let span = self.packed_span(cmap, rank);
        self.ncpus = self.ncpus.saturating_sub(u32::from(self.cpus[rank]));
        self.cpus.remove(rank);
        self.cpus_used.remove(rank);
        self.memory_allocated.remove(rank);
        self.memory_used.remove(rank);
        self.core_bitmap.remove_range(span);
        self.node_bitmap.clear(node.as_num() as usize);
        self.nhosts -= 1;
    }

    /// OR `other_rank`'s core bits of `other` into `my_rank`'s slice here.
    /// Both ranks must refer to the same physical node.
    pub fn or_rank_bits_from(
        &mut self,
        cmap: &CoreMap,
        my_rank: usize,
        other: &JobResources,
        other_rank: usize,
    ) {
        let dst = self.packed_span(cmap, my_rank);
        let src = other.packed_span(cmap, other_rank);
        let len = dst.len().min(src.len());
        self.core_bitmap
            .or_range(dst.start, &other.core_bitmap, src.start, len);
    }
}

/// Controller-side job state the engine needs to see. The engine never owns
/// jobs; rows reference them by id only.
#[derive(Debug, Clone)]
pub struct Job {
    pub id: JobId,
    pub partition: PartitionId,
    /// Controller's view of the nodes still attached to the job; may lag
    /// `resources.node_bitmap` while a resize is in flight.
    pub node_bitmap: Bitmap,
    pub suspended: bool,
    /// Controller-provided completion estimate, used for preemption hints.
    pub end_time: u64,
    pub total_cpus: u32,
    pub min_cpus: u32,
    pub max_cpus: u32,
    /// Memory is recalculated from node capacity after the job starts.
    pub mem_calc: bool,
    pub pn_min_memory: u64,
    /// Row the job last occupied; resume tries it first.
    pub last_row: Option<usize>,
    pub resources: Option<JobResources>,
}

impl Job {
    pub fn new(id: JobId, partition: PartitionId, total_nodes: usize) -> Self {
        Job {
            id,
            partition,
            node_bitmap: Bitmap::zeros(total_nodes),
            suspended: false,
            end_time: 0,
            total_cpus: 0,
            min_cpus: 0,
            max_cpus: 0,
            mem_calc: false,
            pn_min_memory: 0,
            last_row: None,
            resources: None,
        }
    }
}

pub type JobMap = Map<JobId, Job>;
