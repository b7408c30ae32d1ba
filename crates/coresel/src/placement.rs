use smallvec::SmallVec;

use crate::common::index::IndexVec;
use crate::common::Bitmap;
use crate::engine::SelectEngine;
use crate::job::{JobMap, JobResources};
use crate::node::{NodeConfig, NodeReq, NodeUsage};
use crate::partition::PartRow;
use crate::{JobId, NodeId, Result, SelectError};

#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub enum SelectMode {
    /// Schedule against the current occupancy.
    RunNow,
    /// Test whether the job could ever run on the configured capacity,
    /// ignoring occupancy.
    TestOnly,
    /// Determine whether the job could run after preempting candidates, and
    /// which ones.
    WillRun,
}

/// Scheduling requirements of one pending job.
#[derive(Debug, Clone)]
pub struct JobRequest {
    pub partition: crate::PartitionId,
    pub min_nodes: u32,
    /// 0 means unbounded.
    pub max_nodes: u32,
    /// Desired node count; treated as a target above `min_nodes`.
    pub req_nodes: u32,
    /// Nodes that must be part of the allocation.
    pub required_nodes: Option<Bitmap>,
    pub min_cpus: u32,
    pub cpus_per_task: u16,
    /// Per-node memory, or per-cpu when `mem_per_cpu` is set.
    pub pn_min_memory: u64,
    pub mem_per_cpu: bool,
    pub node_req: NodeReq,
    pub whole_node: bool,
    pub contiguous: bool,
}

impl JobRequest {
    pub fn new(partition: crate::PartitionId) -> Self {
        JobRequest {
            partition,
            min_nodes: 1,
            max_nodes: 0,
            req_nodes: 1,
            required_nodes: None,
            min_cpus: 1,
            cpus_per_task: 1,
            pn_min_memory: 0,
            mem_per_cpu: false,
            node_req: NodeReq::Available,
            whole_node: false,
            contiguous: false,
        }
    }
}

/// A successful selection: the nodes, the fully built resource record, and —
/// for `WillRun` — the preemptions the selection depends on.
#[derive(Debug)]
pub struct Placement {
    pub nodes: Bitmap,
    pub resources: JobResources,
    pub preemptees: Vec<JobId>,
    /// Latest completion estimate among the needed preemptees; `None` when
    /// the job can start immediately.
    pub start_hint: Option<u64>,
}

struct Selected {
    nodes: Vec<NodeId>,
    cores: Bitmap,
    cpus: Vec<u16>,
}

#[inline]
fn thread_factor(cfg: &NodeConfig) -> u16 {
    if cfg.cores < cfg.cpus {
        cfg.threads.max(1)
    } else {
        1
    }
}

#[inline]
fn cores_for_cpus(cfg: &NodeConfig, cpus: u32) -> u32 {
    cpus.div_ceil(u32::from(thread_factor(cfg)))
}

impl SelectEngine {
    /// Identify nodes that "best" satisfy the request and build the resource
    /// record the controller will hand to `add_job_to_res`.
    pub fn job_test(
        &self,
        jobs: &JobMap,
        request: &JobRequest,
        candidates: &Bitmap,
        mode: SelectMode,
        preemptees: &[JobId],
        exclude_cores: Option<&Bitmap>,
    ) -> Result<Placement> {
        if candidates.len() != self.node_count() {
            return Err(SelectError::InvalidInput(format!(
                "candidate bitmap length {} does not match node count {}",
                candidates.len(),
                self.node_count()
            )));
        }
        if let Some(required) = &request.required_nodes {
            if !required.is_subset_of(candidates) {
                return Err(SelectError::InvalidInput(
                    "required nodes outside the candidate set".to_string(),
                ));
            }
        }
        log::debug!(
            "job test in mode {mode:?} over {} candidate nodes",
            candidates.set_count()
        );

        match mode {
            SelectMode::TestOnly => {
                let usable = self.filter_candidates(request, candidates, None)?;
                let free = self.free_cores(&usable, exclude_cores);
                let selected = self
                    .try_select(request, &usable, &free)
                    .ok_or(SelectError::NoFit)?;
                Ok(self.build_placement(request, selected, Vec::new()))
            }
            SelectMode::RunNow => {
                let usable = self.filter_candidates(request, candidates, Some(&self.usage))?;
                let pi = self.partition_index(request.partition)?;
                let selected = self
                    .select_against_rows(request, &usable, &self.partitions[pi].rows, exclude_cores)
                    .ok_or(SelectError::NoFit)?;
                Ok(self.build_placement(request, selected, Vec::new()))
            }
            SelectMode::WillRun => {
                self.will_run_test(jobs, request, candidates, preemptees, exclude_cores)
            }
        }
    }

    /// Cores open to this job on the usable nodes: every selectable core,
    /// minus the exclusions the caller carries (reserved or specialized).
    fn free_cores(&self, usable: &Bitmap, exclude_cores: Option<&Bitmap>) -> Bitmap {
        let mut free = self.policy.mark_avail_cores(&self.core_map, &self.nodes, usable);
        if let Some(excl) = exclude_cores {
            free.and_not(excl);
        }
        free
    }

    /// Drop candidate nodes the job cannot use: sharing conflicts and memory
    /// shortfalls. With `usage == None` the test runs against configured
    /// capacity only. Losing a required node fails the whole request.
    fn filter_candidates(
        &self,
        request: &JobRequest,
        candidates: &Bitmap,
        usage: Option<&IndexVec<NodeId, NodeUsage>>,
    ) -> Result<Bitmap> {
        let mut usable = candidates.clone();
        for n in candidates.iter_ones() {
            let node = NodeId::new(n as u32);
            let cfg = &self.nodes[node];
            let mut ok = true;

            if let Some(usage) = usage {
                let state = &usage[node].node_state;
                if state.is_exclusive() {
                    ok = false;
                } else if !state.is_available() && request.node_req == NodeReq::Exclusive {
                    ok = false;
                }
            }

            if ok {
                let needed = if request.mem_per_cpu {
                    request.pn_min_memory * u64::from(request.cpus_per_task.max(1))
                } else {
                    request.pn_min_memory
                };
                let headroom = match usage {
                    Some(usage) => cfg.avail_memory().saturating_sub(usage[node].alloc_memory),
                    None => cfg.avail_memory(),
                };
                if needed > 0 && needed > headroom {
                    ok = false;
                }
            }

            if !ok {
                if request
                    .required_nodes
                    .as_ref()
                    .is_some_and(|req| req.test(n))
                {
                    return Err(SelectError::NoFit);
                }
                usable.clear(n);
            }
        }
        Ok(usable)
    }

    /// RunNow core test: try each row in order; the first row whose free
    /// cores admit a selection wins.
    fn select_against_rows(
        &self,
        request: &JobRequest,
        usable: &Bitmap,
        rows: &[PartRow],
        exclude_cores: Option<&Bitmap>,
    ) -> Option<Selected> {
        let base = self.free_cores(usable, exclude_cores);
        for row in rows {
            let mut free = base.clone();
            if let Some(bitmap) = &row.row_bitmap {
                free.and_not(bitmap);
            }
            if let Some(selected) = self.try_select(request, usable, &free) {
                return Some(selected);
            }
        }
        None
    }

    fn will_run_test(
        &self,
        jobs: &JobMap,
        request: &JobRequest,
        candidates: &Bitmap,
        preemptees: &[JobId],
        exclude_cores: Option<&Bitmap>,
    ) -> Result<Placement> {
        let pi = self.partition_index(request.partition)?;

        // can it run without touching anybody?
        if let Ok(usable) = self.filter_candidates(request, candidates, Some(&self.usage)) {
            if let Some(selected) =
                self.select_against_rows(request, &usable, &self.partitions[pi].rows, exclude_cores)
            {
                return Ok(self.build_placement(request, selected, Vec::new()));
            }
        }

        // simulate terminating preemptees one at a time, re-testing after
        // each removal
        let mut sim_usage = self.usage.clone();
        let mut sim_rows = self.partitions[pi].rows.to_vec();
        let mut used: Vec<JobId> = Vec::new();
        for &pid in preemptees {
            let Some(job) = jobs.get(&pid) else {
                log::error!("preemptee {pid} vanished from the job table");
                continue;
            };
            let Some(res) = job.resources.as_ref() else {
                continue;
            };
            for (rank, node) in res.selected_nodes().enumerate() {
                let u = &mut sim_usage[node];
                u.alloc_memory = u.alloc_memory.saturating_sub(res.memory_allocated[rank]);
                u.node_state.remove(res.node_req, &self.nodes[node].name);
            }
            if job.partition == request.partition {
                for row in &mut sim_rows {
                    if let Some(pos) = row.job_ids.iter().position(|&id| id == pid) {
                        row.job_ids.remove(pos);
                        if let Some(bitmap) = &mut row.row_bitmap {
                            res.remove_from_cores(&self.core_map, bitmap);
                        }
                    }
                }
            }
            used.push(pid);

            let Ok(usable) = self.filter_candidates(request, candidates, Some(&sim_usage)) else {
                continue;
            };
            if let Some(selected) =
                self.select_against_rows(request, &usable, &sim_rows, exclude_cores)
            {
                let mut placement = self.build_placement(request, selected, used);
                placement.start_hint = placement
                    .preemptees
                    .iter()
                    .filter_map(|id| jobs.get(id))
                    .map(|j| j.end_time)
                    .max();
                return Ok(placement);
            }
        }
        Err(SelectError::NoFit)
    }

    /// Preference order: required nodes, then — when a switch table is
    /// configured — the tightest sufficient leaf switch, then ascending node
    /// index. Contiguous requests scan runs of adjacent usable nodes.
    fn try_select(&self, request: &JobRequest, usable: &Bitmap, free: &Bitmap) -> Option<Selected> {
        let req_nodes = request.req_nodes.max(request.min_nodes).max(1);

        if request.contiguous {
            return self.select_contiguous(request, usable, free, req_nodes);
        }

        let required: SmallVec<[NodeId; 8]> = request
            .required_nodes
            .iter()
            .flat_map(|b| b.iter_ones())
            .map(|n| NodeId::new(n as u32))
            .collect();

        if required.is_empty() && !self.switches.is_empty() {
            // prefer the tightest leaf switch wholly containing the allocation
            let mut best: Option<(usize, usize)> = None; // (usable count, switch idx)
            for (i, sw) in self.switches.iter().enumerate() {
                if sw.level != 0 {
                    continue;
                }
                let mut leaf_usable = usable.clone();
                leaf_usable.and_with(&sw.node_bitmap);
                let count = leaf_usable.set_count();
                if count < req_nodes as usize {
                    continue;
                }
                if self
                    .greedy_take(request, &leaf_usable, free, &[], req_nodes)
                    .is_some()
                    && best.is_none_or(|(c, _)| count < c)
                {
                    best = Some((count, i));
                }
            }
            if let Some((_, i)) = best {
                let mut leaf_usable = usable.clone();
                leaf_usable.and_with(&self.switches[i].node_bitmap);
                return self.greedy_take(request, &leaf_usable, free, &[], req_nodes);
            }
        }

        self.greedy_take(request, usable, free, &required, req_nodes)
    }

    fn select_contiguous(
        &self,
        request: &JobRequest,
        usable: &Bitmap,
        free: &Bitmap,
        req_nodes: u32,
    ) -> Option<Selected> {
        // adjacency counts only nodes that can actually contribute
        let mut viable = Bitmap::zeros(usable.len());
        for n in usable.iter_ones() {
            let node = NodeId::new(n as u32);
            let cfg = &self.nodes[node];
            let avail =
                u32::from(self.policy.avail_cores_on_node(cfg, &self.core_map, node, free));
            let min_cores = cores_for_cpus(cfg, u32::from(request.cpus_per_task.max(1)));
            let enough = if request.whole_node {
                avail >= u32::from(cfg.selectable_cores())
            } else {
                avail >= min_cores
            };
            if enough {
                viable.set(n);
            }
        }

        let mut run: Vec<usize> = Vec::new();
        for n in 0..=viable.len() {
            if n < viable.len() && viable.test(n) {
                run.push(n);
                continue;
            }
            if !run.is_empty() {
                let run_map = Bitmap::from_indices(viable.len(), &run);
                if let Some(sel) = self.greedy_take(request, &run_map, free, &[], req_nodes) {
                    return Some(sel);
                }
                run.clear();
            }
        }
        None
    }

    /// Take nodes in ascending order (required ones first) until the cpu and
    /// node-count targets are both met.
    fn greedy_take(
        &self,
        request: &JobRequest,
        usable: &Bitmap,
        free: &Bitmap,
        required: &[NodeId],
        req_nodes: u32,
    ) -> Option<Selected> {
        let mut nodes: Vec<NodeId> = Vec::new();
        let mut cpus: Vec<u16> = Vec::new();
        let mut acc_cpus = 0u32;

        let mut order: Vec<NodeId> = required.to_vec();
        for n in usable.iter_ones() {
            let node = NodeId::new(n as u32);
            if !required.contains(&node) {
                order.push(node);
            }
        }

        for node in order {
            let is_required = required.contains(&node);
            let done_nodes = nodes.len() as u32 >= req_nodes;
            let done_cpus = acc_cpus >= request.min_cpus;
            if done_nodes && done_cpus && !is_required {
                break;
            }
            if request.max_nodes != 0 && nodes.len() as u32 >= request.max_nodes {
                if is_required || !done_cpus {
                    return None;
                }
                break;
            }

            let cfg = &self.nodes[node];
            let avail_cores =
                u32::from(self.policy.avail_cores_on_node(cfg, &self.core_map, node, free));
            let min_cores = cores_for_cpus(cfg, u32::from(request.cpus_per_task.max(1)));
            if avail_cores < min_cores
                || (request.whole_node && avail_cores < u32::from(cfg.selectable_cores()))
            {
                if is_required {
                    return None;
                }
                continue;
            }

            let take_cores = if request.whole_node {
                avail_cores
            } else {
                let remaining = request.min_cpus.saturating_sub(acc_cpus);
                cores_for_cpus(cfg, remaining.max(1)).clamp(min_cores, avail_cores)
            };
            let node_cpus = self.policy.cpus_from_cores(cfg, take_cores as u16);
            nodes.push(node);
            cpus.push(node_cpus);
            acc_cpus += u32::from(node_cpus);
        }

        if (nodes.len() as u32) < request.min_nodes || acc_cpus < request.min_cpus {
            return None;
        }

        // lowest-index cores first on every selected node
        let mut cores = Bitmap::zeros(self.core_map.total_cores());
        for (i, &node) in nodes.iter().enumerate() {
            let cfg = &self.nodes[node];
            let span = self.core_map.node_span(node);
            let want = cores_for_cpus(cfg, u32::from(cpus[i])).max(1) as usize;
            let mut taken = 0;
            for bit in free.ones_in_range(span) {
                if taken == want {
                    break;
                }
                cores.set(bit);
                taken += 1;
            }
            if taken < want {
                return None;
            }
        }

        Some(Selected { nodes, cores, cpus })
    }

    fn build_placement(
        &self,
        request: &JobRequest,
        selected: Selected,
        preemptees: Vec<JobId>,
    ) -> Placement {
        // ranks are positions within the node bitmap, so per-node data must
        // be laid out in ascending node order
        let mut picked: Vec<(NodeId, u16)> = selected
            .nodes
            .iter()
            .copied()
            .zip(selected.cpus.iter().copied())
            .collect();
        picked.sort_by_key(|&(n, _)| n);

        let core_bits: usize = picked
            .iter()
            .map(|&(n, _)| self.core_map.cores(n) as usize)
            .sum();
        let mut res = JobResources::sized(picked.len(), self.node_count(), core_bits);
        res.node_req = request.node_req;
        res.whole_node = request.whole_node;

        let mut packed = 0usize;
        for (rank, &(node, node_cpus)) in picked.iter().enumerate() {
            res.node_bitmap.set(node.as_num() as usize);
            res.cpus[rank] = node_cpus;
            res.memory_allocated[rank] = if request.mem_per_cpu {
                request.pn_min_memory * u64::from(node_cpus)
            } else {
                request.pn_min_memory
            };
            let span = self.core_map.node_span(node);
            for bit in selected.cores.ones_in_range(span.clone()) {
                res.core_bitmap.set(packed + (bit - span.start));
            }
            packed += span.len();
        }
        res.ncpus = picked.iter().map(|&(_, c)| u32::from(c)).sum();

        let mut nodes = Bitmap::zeros(self.node_count());
        for &(n, _) in &picked {
            nodes.set(n.as_num() as usize);
        }
        Placement {
            nodes,
            resources: res,
            preemptees,
            start_hint: None,
        }
    }
}
