use crate::common::Bitmap;
use crate::devices::NullDevices;
use crate::engine::{PartitionConfig, SelectEngine};
use crate::job::{Job, JobMap, JobResources};
use crate::node::{NodeConfig, NodeReq};
use crate::policy::CoreSelector;
use crate::{JobId, NodeId, PartitionId};

pub const TEST_NODE_MEMORY: u64 = 1024;

pub fn cluster(node_cores: &[u16]) -> Vec<NodeConfig> {
    node_cores
        .iter()
        .enumerate()
        .map(|(i, &cores)| {
            let mut cfg = NodeConfig::with_cores(&format!("n{i}"), cores);
            cfg.real_memory = TEST_NODE_MEMORY;
            cfg
        })
        .collect()
}

/// Engine over a uniform cluster with a single partition 0.
pub fn engine(node_cores: &[u16], num_rows: u32) -> SelectEngine {
    let mut engine = SelectEngine::new(Box::new(CoreSelector), Box::new(NullDevices));
    engine
        .node_init(
            cluster(node_cores),
            &[PartitionConfig {
                id: PartitionId::new(0),
                num_rows,
            }],
        )
        .unwrap();
    engine
}

pub struct JobBuilder {
    id: u32,
    entries: Vec<(usize, Vec<usize>, u64)>,
    node_req: NodeReq,
    whole_node: bool,
    end_time: u64,
}

impl JobBuilder {
    pub fn new(id: u32) -> Self {
        JobBuilder {
            id,
            entries: Vec::new(),
            node_req: NodeReq::Available,
            whole_node: false,
            end_time: 0,
        }
    }

    /// Allocate `cores` (local indices) on `node`, one cpu per core.
    pub fn on(mut self, node: usize, cores: &[usize]) -> Self {
        self.entries.push((node, cores.to_vec(), 0));
        self
    }

    pub fn on_mem(mut self, node: usize, cores: &[usize], memory: u64) -> Self {
        self.entries.push((node, cores.to_vec(), memory));
        self
    }

    pub fn node_req(mut self, req: NodeReq) -> Self {
        self.node_req = req;
        self
    }

    pub fn whole_node(mut self) -> Self {
        self.whole_node = true;
        self
    }

    pub fn end_time(mut self, t: u64) -> Self {
        self.end_time = t;
        self
    }

    pub fn build(mut self, engine: &SelectEngine) -> Job {
        self.entries.sort_by_key(|e| e.0);
        let cmap = engine.core_map();
        let total_nodes = engine.node_count();
        let core_bits: usize = self
            .entries
            .iter()
            .map(|&(n, _, _)| cmap.cores(NodeId::new(n as u32)) as usize)
            .sum();

        let mut res = JobResources::sized(self.entries.len(), total_nodes, core_bits);
        res.node_req = self.node_req;
        res.whole_node = self.whole_node;
        let mut packed = 0usize;
        for (rank, (n, cores, memory)) in self.entries.iter().enumerate() {
            res.node_bitmap.set(*n);
            res.cpus[rank] = cores.len() as u16;
            res.memory_allocated[rank] = *memory;
            for &c in cores {
                res.core_bitmap.set(packed + c);
            }
            packed += cmap.cores(NodeId::new(*n as u32)) as usize;
        }
        res.ncpus = res.cpus.iter().map(|&c| u32::from(c)).sum();

        let mut job = Job::new(JobId::new(self.id), PartitionId::new(0), total_nodes);
        job.node_bitmap = res.node_bitmap.clone();
        job.total_cpus = res.ncpus;
        job.end_time = self.end_time;
        job.resources = Some(res);
        job
    }
}

pub fn insert(jobs: &mut JobMap, job: Job) -> JobId {
    let id = job.id;
    jobs.insert(id, job);
    id
}

pub fn all_nodes(engine: &SelectEngine) -> Bitmap {
    let mut map = Bitmap::zeros(engine.node_count());
    for n in 0..engine.node_count() {
        map.set(n);
    }
    map
}

/// Popcount of one node's slice of a core bitmap.
pub fn cores_on_node(engine: &SelectEngine, cores: &Bitmap, node: usize) -> usize {
    cores.count_range(engine.core_map().node_span(NodeId::new(node as u32)))
}
