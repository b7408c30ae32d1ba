use serde::{Deserialize, Serialize};

use crate::common::index::IndexVec;
use crate::common::Bitmap;
use crate::coremap::CoreMap;
use crate::devices::DeviceSubsystem;
use crate::job::{JobMap, JobResources};
use crate::node::{NodeConfig, NodeUsage};
use crate::nodeinfo::{NodeInfo, NodeInfoCache, RollupOutcome};
use crate::packer;
use crate::partition::PartitionRes;
use crate::policy::SelectorPolicy;
use crate::{JobId, NodeId, PartitionId, Result, SelectError, SwitchId};

/// Which half of a job's footprint an add/remove touches.
///
/// `MemoryOnly` replays a suspended job after a controller restart (memory
/// stays charged while the cores are free); `CoresOnly` is the
/// suspend/resume path.
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub enum AllocAction {
    Normal,
    MemoryOnly,
    CoresOnly,
}

/// One switch in the interconnect tree. Level 0 switches are leaves directly
/// connecting nodes; higher levels aggregate lower ones.
#[derive(Debug, Clone)]
pub struct SwitchRecord {
    pub name: String,
    pub level: u16,
    pub node_bitmap: Bitmap,
}

#[derive(Debug, Copy, Clone, Serialize, Deserialize)]
pub struct PartitionConfig {
    pub id: PartitionId,
    /// Oversubscription limit: how many rows of jobs may stack on the
    /// partition's cores.
    pub num_rows: u32,
}

/// The consumable-resource engine: core map, node usage and partition row
/// state, behind the entry points the controller drives.
///
/// All state lives in this struct; the controller constructs one per cluster
/// and calls it under its own write lock. Jobs are owned by the controller
/// and passed in by table; rows reference them by id only.
pub struct SelectEngine {
    pub(crate) core_map: CoreMap,
    pub(crate) nodes: IndexVec<NodeId, NodeConfig>,
    pub(crate) usage: IndexVec<NodeId, NodeUsage>,
    pub(crate) partitions: Vec<PartitionRes>,
    pub(crate) switches: Vec<SwitchRecord>,
    pub(crate) policy: Box<dyn SelectorPolicy>,
    pub(crate) devices: Box<dyn DeviceSubsystem>,
    pub(crate) nodeinfo: NodeInfoCache,
    pub(crate) last_node_update: u64,
}

impl SelectEngine {
    pub fn new(policy: Box<dyn SelectorPolicy>, devices: Box<dyn DeviceSubsystem>) -> Self {
        SelectEngine {
            core_map: CoreMap::default(),
            nodes: Vec::new().into(),
            usage: Vec::new().into(),
            partitions: Vec::new(),
            switches: Vec::new(),
            policy,
            devices,
            nodeinfo: NodeInfoCache::default(),
            last_node_update: 0,
        }
    }

    /// (Re)build the core map and allocate fresh usage and row tables.
    /// Every bitmap derived from a previous node table is invalid afterwards.
    pub fn node_init(
        &mut self,
        nodes: Vec<NodeConfig>,
        partitions: &[PartitionConfig],
    ) -> Result<()> {
        for cfg in &nodes {
            if cfg.cores == 0 || cfg.cpus < cfg.cores {
                return Err(SelectError::InvalidInput(format!(
                    "node {}: cores {} cpus {}",
                    cfg.name, cfg.cores, cfg.cpus
                )));
            }
        }
        log::info!("initializing select engine with {} nodes", nodes.len());
        self.core_map.rebuild(&nodes);
        self.usage = IndexVec::filled(NodeUsage::default(), nodes.len());
        self.nodes = nodes.into();
        self.partitions = partitions
            .iter()
            .map(|p| PartitionRes::new(p.id, p.num_rows.max(1)))
            .collect();
        self.switches.clear();
        self.nodeinfo.reset(self.nodes.len());
        self.last_node_update += 1;
        Ok(())
    }

    /// Install the interconnect tree used by topology-aware selection.
    pub fn set_switch_table(&mut self, switches: Vec<SwitchRecord>) -> Result<()> {
        for sw in &switches {
            if sw.node_bitmap.len() != self.nodes.len() {
                return Err(SelectError::InvalidInput(format!(
                    "switch {}: node bitmap length {} does not match node count {}",
                    sw.name,
                    sw.node_bitmap.len(),
                    self.nodes.len()
                )));
            }
        }
        self.switches = switches;
        Ok(())
    }

    #[inline]
    pub fn core_map(&self) -> &CoreMap {
        &self.core_map
    }

    #[inline]
    pub fn node_count(&self) -> usize {
        self.nodes.len()
    }

    pub fn node_config(&self, node: NodeId) -> &NodeConfig {
        &self.nodes[node]
    }

    pub fn node_usage(&self, node: NodeId) -> &NodeUsage {
        &self.usage[node]
    }

    pub fn partition(&self, id: PartitionId) -> Option<&PartitionRes> {
        self.partitions.iter().find(|p| p.id == id)
    }

    pub fn switch(&self, id: SwitchId) -> Option<&SwitchRecord> {
        self.switches.get(id.as_num() as usize)
    }

    pub(crate) fn partition_index(&self, id: PartitionId) -> Result<usize> {
        self.partitions
            .iter()
            .position(|p| p.id == id)
            .ok_or_else(|| SelectError::NotFound(format!("partition {id}")))
    }

    fn job_resources<'a>(&self, jobs: &'a JobMap, job_id: JobId) -> Result<&'a JobResources> {
        let job = jobs
            .get(&job_id)
            .ok_or_else(|| SelectError::NotFound(format!("job {job_id}")))?;
        let res = job.resources.as_ref().ok_or_else(|| {
            log::error!("job {job_id} lacks a job resources record");
            SelectError::StateInvariant(format!("job {job_id} lacks a job resources record"))
        })?;
        if res.node_bitmap.len() != self.nodes.len() {
            return Err(SelectError::InvalidInput(format!(
                "job {job_id}: node bitmap length {} does not match node count {}",
                res.node_bitmap.len(),
                self.nodes.len()
            )));
        }
        Ok(res)
    }

    /// Charge a running (or replayed) job's footprint into the engine:
    /// memory into the usage table and the cores into the first partition
    /// row the job fits.
    pub fn add_job_to_res(
        &mut self,
        jobs: &mut JobMap,
        job_id: JobId,
        action: AllocAction,
    ) -> Result<()> {
        let mut chosen_row = None;
        {
            let res = self.job_resources(jobs, job_id)?;
            let job = &jobs[&job_id];

            if action != AllocAction::CoresOnly {
                for (rank, node) in res.selected_nodes().enumerate() {
                    let cfg = &self.nodes[node];
                    let usage = &mut self.usage[node];
                    usage.alloc_memory += res.memory_allocated[rank];
                    if usage.alloc_memory > cfg.avail_memory() {
                        log::error!(
                            "node {} memory is overallocated ({} > {}) for job {job_id}",
                            cfg.name,
                            usage.alloc_memory,
                            cfg.avail_memory()
                        );
                    }
                }
            }

            if action != AllocAction::MemoryOnly {
                let pi = self.partition_index(job.partition)?;
                let part = &mut self.partitions[pi];
                // a resumed job prefers the row it was suspended out of;
                // everything else is plain first-fit
                let preferred = if action == AllocAction::CoresOnly {
                    job.last_row.filter(|&r| r < part.rows.len())
                } else {
                    None
                };
                let row_idx = preferred
                    .filter(|&r| part.rows[r].fits(res, &self.core_map))
                    .or_else(|| {
                        part.rows
                            .iter()
                            .position(|row| row.fits(res, &self.core_map))
                    });
                match row_idx {
                    Some(r) => {
                        part.rows[r].add_job(job_id, res, &self.core_map);
                        chosen_row = Some(r);
                    }
                    None => {
                        log::error!(
                            "job {job_id} could not fit into any of partition {}'s {} rows",
                            part.id,
                            part.rows.len()
                        );
                        return Err(SelectError::NoFit);
                    }
                }
                for node in res.selected_nodes() {
                    self.usage[node].node_state.add(res.node_req);
                }
            }
        }
        if let Some(r) = chosen_row {
            if let Some(job) = jobs.get_mut(&job_id) {
                job.last_row = Some(r);
            }
        }
        self.last_node_update += 1;
        Ok(())
    }

    /// Release a job's footprint. `reconstruct` selects a full repack of the
    /// partition; otherwise only the job's own bits are cleared from its row.
    pub fn rm_job_from_res(
        &mut self,
        jobs: &JobMap,
        job_id: JobId,
        action: AllocAction,
        reconstruct: bool,
    ) -> Result<()> {
        let res = self.job_resources(jobs, job_id)?;
        let job = &jobs[&job_id];

        if action != AllocAction::CoresOnly {
            for (rank, node) in res.selected_nodes().enumerate() {
                let cfg = &self.nodes[node];
                let usage = &mut self.usage[node];
                let mem = res.memory_allocated[rank];
                if usage.alloc_memory < mem {
                    log::error!(
                        "node {} memory is underallocated ({} < {}) for job {job_id}",
                        cfg.name,
                        usage.alloc_memory,
                        mem
                    );
                    usage.alloc_memory = 0;
                } else {
                    usage.alloc_memory -= mem;
                }
                if action == AllocAction::Normal {
                    self.devices.dealloc(job_id, rank, &cfg.name, true);
                }
            }
        }

        if action != AllocAction::MemoryOnly {
            let pi = self.partition_index(job.partition)?;
            let part = &mut self.partitions[pi];
            let row = part.remove_job(job_id);
            match row {
                Some(row_idx) => {
                    if reconstruct {
                        packer::build_row_bitmaps(&self.core_map, part, jobs, Some(res));
                    } else if let Some(bitmap) = &mut part.rows[row_idx].row_bitmap {
                        res.remove_from_cores(&self.core_map, bitmap);
                    }
                }
                None => {
                    log::error!("could not find job {job_id} in partition {}", part.id);
                    return Err(SelectError::NotFound(format!(
                        "job {job_id} not resident in partition {}",
                        part.id
                    )));
                }
            }
            for node in res.selected_nodes() {
                let name = &self.nodes[node].name;
                self.usage[node].node_state.remove(res.node_req, name);
            }
        }

        self.last_node_update += 1;
        Ok(())
    }

    /// Drop one node from a running or suspended job (node failure or job
    /// shrink), rewriting the job's resource record in place.
    pub fn rm_job_from_one_node(
        &mut self,
        jobs: &mut JobMap,
        job_id: JobId,
        node: NodeId,
    ) -> Result<()> {
        let (partition, suspended, node_req);
        {
            let job = jobs
                .get_mut(&job_id)
                .ok_or_else(|| SelectError::NotFound(format!("job {job_id}")))?;
            let res = job.resources.as_mut().ok_or_else(|| {
                log::error!("job {job_id} has no job resources info");
                SelectError::StateInvariant(format!("job {job_id} has no job resources info"))
            })?;
            let cfg = &self.nodes[node];
            let rank = res.rank_of(node).ok_or_else(|| {
                SelectError::NotFound(format!("node {} not allocated to job {job_id}", cfg.name))
            })?;
            if res.cpus[rank] == 0 {
                log::info!("attempt to remove node {} from job {job_id} again", cfg.name);
                return Ok(());
            }
            log::debug!("removing node {} from job {job_id}", cfg.name);

            self.devices.dealloc(job_id, rank, &cfg.name, true);

            let mem = res.memory_allocated[rank];
            let usage = &mut self.usage[node];
            if usage.alloc_memory < mem {
                log::error!(
                    "node {} memory is underallocated ({} < {}) for job {job_id}",
                    cfg.name,
                    usage.alloc_memory,
                    mem
                );
                usage.alloc_memory = 0;
            } else {
                usage.alloc_memory -= mem;
            }

            res.extract_node(&self.core_map, rank, node);
            node_req = res.node_req;
            partition = job.partition;
            suspended = job.suspended;
        }

        // a suspended job holds no cores, so the rows are already correct
        if suspended {
            self.last_node_update += 1;
            return Ok(());
        }

        let pi = self.partition_index(partition)?;
        if self.partitions[pi].find_job_row(job_id).is_none() {
            log::error!(
                "could not find job {job_id} in partition {}",
                self.partitions[pi].id
            );
            return Err(SelectError::NotFound(format!(
                "job {job_id} not resident in partition {partition}"
            )));
        }

        // part of the job left the core map, so refresh the row bitmaps
        packer::build_row_bitmaps(&self.core_map, &mut self.partitions[pi], jobs, None);

        let name = &self.nodes[node].name;
        self.usage[node].node_state.remove(node_req, name);
        self.last_node_update += 1;
        Ok(())
    }

    /// Merge all resources of `from` into `to`, leaving `from` empty.
    pub fn job_expand(&mut self, jobs: &mut JobMap, from_id: JobId, to_id: JobId) -> Result<()> {
        if from_id == to_id {
            log::error!("attempt to merge job {from_id} with self");
            return Err(SelectError::InvalidInput(format!(
                "cannot merge job {from_id} with itself"
            )));
        }
        self.job_resources(jobs, from_id)?;
        self.job_resources(jobs, to_id)?;

        let _ = self.rm_job_from_res(jobs, from_id, AllocAction::Normal, true);
        let _ = self.rm_job_from_res(jobs, to_id, AllocAction::Normal, true);

        let mut from = jobs.remove(&from_id).expect("validated above");
        let mut to = jobs.remove(&to_id).expect("validated above");
        {
            let from_res = from.resources.as_mut().expect("validated above");
            let to_res = to.resources.as_mut().expect("validated above");
            let cmap = &self.core_map;

            let mut target = from_res.node_bitmap.clone();
            target.or_with(&to_res.node_bitmap);
            let mut controller_view = from.node_bitmap.clone();
            controller_view.or_with(&to.node_bitmap);
            target.and_with(&controller_view);

            let node_cnt = target.set_count();
            let core_bits: usize = target
                .iter_ones()
                .map(|n| cmap.cores(NodeId::new(n as u32)) as usize)
                .sum();
            let mut new_res = JobResources::sized(node_cnt, self.nodes.len(), core_bits);
            new_res.ncpus = from_res.ncpus + to_res.ncpus;
            new_res.node_req = to_res.node_req;
            new_res.whole_node = to_res.whole_node;
            new_res.node_bitmap = target.clone();

            let merge_from_nodes = from_res.node_bitmap.clone();
            let merge_to_nodes = to_res.node_bitmap.clone();

            let mut total_cpus = 0u32;
            let (mut from_rank, mut to_rank, mut new_rank) = (0usize, 0usize, 0usize);
            for i in 0..self.nodes.len() {
                let mut from_used = false;
                let mut to_used = false;
                let (mut fr, mut tr) = (0usize, 0usize);
                if from_res.node_bitmap.test(i) {
                    from_used = from.node_bitmap.test(i);
                    fr = from_rank;
                    from_rank += 1;
                }
                if to_res.node_bitmap.test(i) {
                    to_used = to.node_bitmap.test(i);
                    tr = to_rank;
                    to_rank += 1;
                }
                if !from_used && !to_used {
                    continue;
                }
                let nr = new_rank;
                new_rank += 1;

                if from_used {
                    // merge alloc info from both jobs, leave "from" with no
                    // allocated cpus or memory
                    new_res.cpus[nr] = from_res.cpus[fr];
                    from_res.cpus[fr] = 0;
                    new_res.memory_allocated[nr] = from_res.memory_allocated[fr];
                    new_res.or_rank_bits_from(cmap, nr, from_res, fr);
                }
                if to_used {
                    new_res.cpus[nr] += to_res.cpus[tr];
                    new_res.cpus_used[nr] += to_res.cpus_used[tr];
                    new_res.memory_allocated[nr] += to_res.memory_allocated[tr];
                    new_res.memory_used[nr] += to_res.memory_used[tr];
                    new_res.or_rank_bits_from(cmap, nr, to_res, tr);
                    if from_used {
                        // do not double count cpus on cores both jobs held
                        let from_cores = from_res.cores_on_rank(cmap, fr) as u32;
                        let to_cores = to_res.cores_on_rank(cmap, tr) as u32;
                        let new_cores = new_res.cores_on_rank(cmap, nr) as u32;
                        if from_cores + to_cores != new_cores {
                            let scaled =
                                u32::from(new_res.cpus[nr]) * new_cores / (from_cores + to_cores);
                            new_res.cpus[nr] = scaled as u16;
                        }
                    }
                }
                total_cpus += if new_res.whole_node {
                    u32::from(self.nodes[NodeId::new(i as u32)].cpus)
                } else {
                    u32::from(new_res.cpus[nr])
                };
            }

            self.devices
                .merge(from_id, &merge_from_nodes, to_id, &merge_to_nodes);

            from_res.ncpus = 0;
            from_res.nhosts = 0;
            from_res.node_bitmap.clear_all();
            from.total_cpus = 0;
            from.min_cpus = 0;
            from.max_cpus = 0;

            to.node_bitmap.or_with(&from.node_bitmap);
            from.node_bitmap.clear_all();

            to.resources = Some(new_res);
            to.total_cpus = total_cpus;
            to.min_cpus = total_cpus;
            to.max_cpus = total_cpus;
        }
        jobs.insert(from_id, from);
        jobs.insert(to_id, to);

        self.add_job_to_res(jobs, to_id, AllocAction::Normal)
    }

    /// Take a suspended job's cores out of its row; memory stays charged.
    /// `indf_susp` false means a gang-scheduling transient suspend, which
    /// does not release resources.
    pub fn job_suspend(&mut self, jobs: &mut JobMap, job_id: JobId, indf_susp: bool) -> Result<()> {
        if !indf_susp {
            return Ok(());
        }
        let row = {
            let job = jobs
                .get(&job_id)
                .ok_or_else(|| SelectError::NotFound(format!("job {job_id}")))?;
            self.partition_index(job.partition)
                .ok()
                .and_then(|pi| self.partitions[pi].find_job_row(job_id))
        };
        self.rm_job_from_res(jobs, job_id, AllocAction::CoresOnly, false)?;
        if let Some(job) = jobs.get_mut(&job_id) {
            job.suspended = true;
            job.last_row = row;
        }
        Ok(())
    }

    /// Re-add a suspended job's cores, preferring the row it came from.
    pub fn job_resume(&mut self, jobs: &mut JobMap, job_id: JobId, indf_susp: bool) -> Result<()> {
        if !indf_susp {
            return Ok(());
        }
        self.add_job_to_res(jobs, job_id, AllocAction::CoresOnly)?;
        if let Some(job) = jobs.get_mut(&job_id) {
            job.suspended = false;
        }
        Ok(())
    }

    /// For jobs whose memory is recalculated after start: charge each
    /// allocated node's full available memory and record the lowest per-node
    /// amount back into the job.
    pub fn job_mem_confirm(&mut self, jobs: &mut JobMap, job_id: JobId) -> Result<()> {
        let job = jobs
            .get_mut(&job_id)
            .ok_or_else(|| SelectError::NotFound(format!("job {job_id}")))?;
        if !job.mem_calc {
            return Ok(());
        }
        let res = job.resources.as_mut().ok_or_else(|| {
            SelectError::StateInvariant(format!("job {job_id} lacks a job resources record"))
        })?;
        let mut lowest_mem = 0u64;
        for (rank, node) in res.node_bitmap.iter_ones().enumerate() {
            let avail = self.nodes[NodeId::new(node as u32)].avail_memory();
            res.memory_allocated[rank] = avail;
            self.usage[NodeId::new(node as u32)].alloc_memory = avail;
            if rank == 0 || lowest_mem > avail {
                lowest_mem = avail;
            }
        }
        job.pn_min_memory = lowest_mem;
        self.last_node_update += 1;
        Ok(())
    }

    /// Whether all of a job's allocated nodes are powered up and usable.
    pub fn job_ready(&self, jobs: &JobMap, job_id: JobId) -> Result<bool> {
        let job = jobs
            .get(&job_id)
            .ok_or_else(|| SelectError::NotFound(format!("job {job_id}")))?;
        Ok(job
            .node_bitmap
            .iter_ones()
            .all(|n| !self.nodes[NodeId::new(n as u32)].powered_down))
    }

    /// Refresh one node's memory configuration. Core geometry changes are
    /// only accepted when the total core count is preserved; anything else
    /// needs a full `node_init`.
    pub fn update_node_config(&mut self, node: NodeId, cfg: NodeConfig) -> Result<()> {
        let idx = node.as_num() as usize;
        if idx >= self.nodes.len() {
            log::error!("update_node_config: index too large {idx} >= {}", self.nodes.len());
            return Err(SelectError::InvalidInput(format!(
                "node index {idx} out of range"
            )));
        }
        let current = &mut self.nodes[node];
        if cfg.cores != current.cores {
            log::error!(
                "node {}: core count change {} -> {} requires reinitialization",
                current.name,
                current.cores,
                cfg.cores
            );
            return Err(SelectError::InvalidInput(format!(
                "node {}: core count change requires node_init",
                current.name
            )));
        }
        current.cpus = cfg.cpus;
        current.threads = cfg.threads;
        current.real_memory = cfg.real_memory;
        current.mem_spec_limit = cfg.mem_spec_limit;
        current.powered_down = cfg.powered_down;
        current.tres_weights = cfg.tres_weights;
        self.last_node_update += 1;
        Ok(())
    }

    /// Node state changes (drain, power state) carry no engine-side record.
    pub fn update_node_state(&mut self, _node: NodeId) -> Result<()> {
        Ok(())
    }

    /// Rebuild every derived structure and replay the controller's jobs into
    /// fresh rows. Running jobs are re-added in full; suspended jobs keep
    /// only their memory charge.
    pub fn reconfigure(&mut self, jobs: &mut JobMap) -> Result<()> {
        log::info!("reconfiguring select engine");
        self.core_map.rebuild(&self.nodes);
        self.usage = IndexVec::filled(NodeUsage::default(), self.nodes.len());
        for part in &mut self.partitions {
            *part = PartitionRes::new(part.id, part.num_rows);
        }
        self.nodeinfo.reset(self.nodes.len());
        self.last_node_update += 1;

        let mut ids: Vec<(JobId, bool)> = jobs
            .iter()
            .filter(|(_, job)| job.resources.is_some())
            .map(|(&id, job)| (id, job.suspended))
            .collect();
        ids.sort();
        for (id, suspended) in ids {
            let action = if suspended {
                AllocAction::MemoryOnly
            } else {
                AllocAction::Normal
            };
            self.add_job_to_res(jobs, id, action)?;
        }
        Ok(())
    }

    /// Recompute the per-node allocation snapshots unless nothing changed.
    pub fn nodeinfo_set_all(&mut self) -> RollupOutcome {
        self.nodeinfo.set_all(
            &self.core_map,
            &self.nodes,
            &self.usage,
            &self.partitions,
            self.devices.as_ref(),
            self.last_node_update,
        )
    }

    pub fn nodeinfo(&self, node: NodeId) -> Option<&NodeInfo> {
        self.nodeinfo.get(node)
    }
}
