use smallvec::SmallVec;

use crate::common::Bitmap;
use crate::engine::SelectEngine;
use crate::NodeId;

/// A reservation request: how many nodes, optionally how many cores, and the
/// selection strategy flags.
///
/// `core_cnt` is either a per-node array (entry per selected node, in
/// selection order) or an aggregate: a single entry giving the total core
/// count to spread across the selection.
#[derive(Debug, Clone, Default)]
pub struct ResvRequest {
    pub core_cnt: Option<Vec<u32>>,
    /// Take the lowest free cores of each node, walking nodes in order.
    pub first_cores: bool,
}

impl ResvRequest {
    fn aggregate(&self) -> bool {
        match &self.core_cnt {
            Some(counts) => counts.len() == 1 || counts.iter().skip(1).all(|&c| c == 0),
            None => false,
        }
    }
}

struct ResvSelection {
    nodes: Bitmap,
    cores: Bitmap,
}

impl SelectEngine {
    /// Pick nodes (and, when core counts are given, exact cores) for a
    /// reservation. `core_bitmap` carries cores already excluded on input
    /// and receives the selected cores on success; on failure it is left
    /// untouched and `None` is returned — never a partial commit.
    pub fn resv_test(
        &self,
        request: &ResvRequest,
        node_cnt: u32,
        avail: &Bitmap,
        core_bitmap: &mut Option<Bitmap>,
    ) -> Option<Bitmap> {
        if avail.len() != self.node_count() {
            log::error!(
                "resv_test: avail bitmap length {} does not match node count {}",
                avail.len(),
                self.node_count()
            );
            return None;
        }

        let selection = if request.first_cores && request.core_cnt.is_some() {
            self.pick_first_cores(request, node_cnt, avail, core_bitmap.as_ref())
        } else if self.switches.is_empty() || node_cnt == 0 {
            self.sequential_pick(request, node_cnt, avail, core_bitmap.as_ref())
        } else {
            self.topology_pick(request, node_cnt, avail, core_bitmap.as_ref())
        }?;

        if request.core_cnt.is_some() {
            *core_bitmap = Some(selection.cores);
        }
        Some(selection.nodes)
    }

    /// Cores unusable for the reservation: everything that is not a
    /// selectable core of an available node, plus whatever the caller
    /// already excluded.
    fn resv_exclusion(&self, avail: &Bitmap, existing: Option<&Bitmap>) -> Bitmap {
        let mut excl = self
            .policy
            .mark_avail_cores(&self.core_map, &self.nodes, avail);
        excl.invert();
        if let Some(existing) = existing {
            excl.or_with(existing);
        }
        excl
    }

    fn free_on_node(&self, excl: &Bitmap, node: NodeId) -> usize {
        let span = self.core_map.node_span(node);
        span.len() - excl.count_range(span)
    }

    /// FIRST_CORES strategy: walk nodes in ascending order, taking exactly
    /// `core_cnt[i]` of the lowest free cores on each; skip nodes that
    /// cannot provide them.
    fn pick_first_cores(
        &self,
        request: &ResvRequest,
        node_cnt: u32,
        avail: &Bitmap,
        excluded: Option<&Bitmap>,
    ) -> Option<ResvSelection> {
        let core_cnt = request.core_cnt.as_ref()?;
        if core_cnt.first().copied().unwrap_or(0) == 0 {
            return None;
        }
        let excl = self.resv_exclusion(avail, excluded);
        let mut nodes = Bitmap::zeros(self.node_count());
        let mut cores = Bitmap::zeros(self.core_map.total_cores());

        let mut node_offset = 0usize;
        for n in avail.iter_ones() {
            let node = NodeId::new(n as u32);
            let span = self.core_map.node_span(node);
            let want = core_cnt[node_offset] as usize;

            let free: SmallVec<[usize; 16]> = span
                .clone()
                .filter(|&c| !excl.test(c) && !cores.test(c))
                .take(want)
                .collect();
            if free.len() < want {
                log::debug!("skipping node {n}: {} free cores, {want} needed", free.len());
                continue;
            }
            for c in free {
                cores.set(c);
            }
            nodes.set(n);
            node_offset += 1;
            if node_offset >= core_cnt.len() || core_cnt[node_offset] == 0 {
                break;
            }
            if node_cnt != 0 && nodes.set_count() >= node_cnt as usize {
                break;
            }
        }

        let satisfied = node_offset >= core_cnt.len()
            || core_cnt[node_offset] == 0
            || (node_cnt != 0 && nodes.set_count() >= node_cnt as usize);
        if !satisfied {
            log::info!("reservation request can not be satisfied");
            return None;
        }
        Some(ResvSelection { nodes, cores })
    }

    /// Plain ascending-order selection: full nodes when no core counts are
    /// given, otherwise the required cores per node until the target is
    /// reached. Aggregate requests spread `ceil(total / node_cnt)` cores per
    /// node, then sweep again with a per-node minimum of one if a residual
    /// remains.
    fn sequential_pick(
        &self,
        request: &ResvRequest,
        node_cnt: u32,
        avail: &Bitmap,
        excluded: Option<&Bitmap>,
    ) -> Option<ResvSelection> {
        let mut nodes = Bitmap::zeros(self.node_count());

        let Some(core_cnt) = &request.core_cnt else {
            // full-node reservation
            let mut remaining = node_cnt;
            for n in avail.iter_ones() {
                if remaining == 0 {
                    break;
                }
                nodes.set(n);
                remaining -= 1;
            }
            if remaining > 0 {
                log::info!("reservation request can not be satisfied");
                return None;
            }
            return Some(ResvSelection {
                nodes,
                cores: Bitmap::zeros(self.core_map.total_cores()),
            });
        };

        let excl = self.resv_exclusion(avail, excluded);
        let mut cores = Bitmap::zeros(self.core_map.total_cores());
        let aggregate = request.aggregate();

        let mut total: u64 = if aggregate {
            u64::from(core_cnt[0])
        } else {
            core_cnt
                .iter()
                .take_while(|&&c| c != 0)
                .map(|&c| u64::from(c))
                .sum()
        };
        let mut cores_per_node = if aggregate {
            (core_cnt[0]).div_ceil(node_cnt.max(1)) as usize
        } else {
            0
        };
        log::debug!("reserving {total} cores across {node_cnt} nodes");

        loop {
            let before = total;
            let mut node_list_inx = 0usize;
            for n in avail.iter_ones() {
                if total == 0 {
                    break;
                }
                let node = NodeId::new(n as u32);
                let per = if aggregate {
                    cores_per_node
                } else {
                    match core_cnt.get(node_list_inx) {
                        Some(&c) if c != 0 => c as usize,
                        _ => break,
                    }
                };
                let span = self.core_map.node_span(node);
                if span.len() < per {
                    log::debug!("skip node {n} (local: {}, needed: {per})", span.len());
                    continue;
                }
                let free: SmallVec<[usize; 16]> = span
                    .clone()
                    .filter(|&c| !excl.test(c) && !cores.test(c))
                    .collect();
                if free.len() < per {
                    log::debug!("skip node {n} (avail: {}, needed: {per})", free.len());
                    continue;
                }
                let mut taken_this_visit = 0usize;
                for c in free {
                    if total == 0 || taken_this_visit >= per {
                        break;
                    }
                    cores.set(c);
                    total -= 1;
                    taken_this_visit += 1;
                }
                if taken_this_visit > 0 {
                    nodes.set(n);
                }
                node_list_inx += 1;
            }

            if total == 0 {
                break;
            }
            if !aggregate || total == before {
                log::info!("reservation request can not be satisfied");
                return None;
            }
            // residual sweep: drop the per-node minimum to one and refill
            cores_per_node = 1;
        }

        Some(ResvSelection { nodes, cores })
    }

    /// Topology-aware best fit: choose the lowest switch whose candidate
    /// nodes and free cores meet the demand, then consume its leaves
    /// tightest-first.
    fn topology_pick(
        &self,
        request: &ResvRequest,
        node_cnt: u32,
        avail: &Bitmap,
        excluded: Option<&Bitmap>,
    ) -> Option<ResvSelection> {
        if avail.set_count() < node_cnt as usize {
            return None;
        }
        let core_cnt = request.core_cnt.as_deref();
        let aggregate = request.aggregate();
        let excl = core_cnt.map(|_| self.resv_exclusion(avail, excluded));

        let mut rem_nodes = node_cnt as i64;
        let mut rem_cores: i64 = 0;
        let mut cores_per_node = 1usize;
        match core_cnt {
            Some(counts) if !aggregate => {
                rem_cores = counts
                    .iter()
                    .take_while(|&&c| c != 0)
                    .map(|&c| i64::from(c))
                    .sum();
                cores_per_node = counts
                    .iter()
                    .take_while(|&&c| c != 0)
                    .map(|&c| c as usize)
                    .min()
                    .unwrap_or(1);
            }
            Some(counts) => {
                rem_cores = i64::from(counts[0]);
                cores_per_node = counts[0].div_ceil(node_cnt.max(1)) as usize;
            }
            None => {
                if self.node_count() > 0 {
                    cores_per_node = self.core_map.cores(NodeId::new(0)) as usize;
                }
            }
        }
        let rem_cores_save = rem_cores;

        // per-switch candidate sets, indexed as the switch table
        let mut sw_nodes: Vec<Bitmap> = Vec::with_capacity(self.switches.len());
        let mut sw_node_cnt: Vec<i64> = Vec::with_capacity(self.switches.len());
        let mut sw_core_cnt: Vec<i64> = Vec::with_capacity(self.switches.len());
        for sw in &self.switches {
            let mut nodes = sw.node_bitmap.clone();
            nodes.and_with(avail);
            let cores: i64 = match &excl {
                Some(excl) => nodes
                    .iter_ones()
                    .map(|n| self.free_on_node(excl, NodeId::new(n as u32)) as i64)
                    .sum(),
                None => 0,
            };
            sw_node_cnt.push(nodes.set_count() as i64);
            sw_core_cnt.push(cores);
            sw_nodes.push(nodes);
        }

        // prune nodes that cannot contribute enough cores
        if let Some(excl) = &excl {
            for n in avail.iter_ones() {
                let c = self.free_on_node(excl, NodeId::new(n as u32));
                if c >= cores_per_node {
                    continue;
                }
                for k in 0..sw_nodes.len() {
                    if sw_nodes[k].test(n) {
                        sw_nodes[k].clear(n);
                        sw_node_cnt[k] -= 1;
                        sw_core_cnt[k] -= c as i64;
                    }
                }
            }
        }

        // lowest-level switch satisfying the request, ties to fewer nodes
        let mut best_fit: Option<usize> = None;
        for (j, sw) in self.switches.iter().enumerate() {
            if sw_node_cnt[j] < rem_nodes || (core_cnt.is_some() && sw_core_cnt[j] < rem_cores) {
                continue;
            }
            best_fit = match best_fit {
                None => Some(j),
                Some(b)
                    if sw.level < self.switches[b].level
                        || (sw.level == self.switches[b].level
                            && sw_node_cnt[j] < sw_node_cnt[b]) =>
                {
                    Some(j)
                }
                keep => keep,
            };
        }
        let best_fit = match best_fit {
            Some(b) => b,
            None => {
                log::debug!("could not find resources for reservation");
                return None;
            }
        };

        // only leaves under the best-fit switch stay usable
        for j in 0..self.switches.len() {
            if self.switches[j].level != 0 || !sw_nodes[j].is_subset_of(&sw_nodes[best_fit]) {
                sw_node_cnt[j] = 0;
            }
        }

        let mut nodes = Bitmap::zeros(self.node_count());
        while rem_nodes > 0 {
            // tightest sufficient leaf; if none suffices, the biggest one
            let mut best_leaf: Option<(usize, i64, bool)> = None;
            for j in 0..self.switches.len() {
                if sw_node_cnt[j] == 0 {
                    continue;
                }
                let sufficient = sw_node_cnt[j] >= rem_nodes
                    && (core_cnt.is_none() || sw_core_cnt[j] >= rem_cores);
                best_leaf = match best_leaf {
                    None => Some((j, sw_node_cnt[j], sufficient)),
                    Some((_, bn, bs))
                        if (sufficient && !bs)
                            || (sufficient && sw_node_cnt[j] < bn)
                            || (!bs && !sufficient && sw_node_cnt[j] > bn) =>
                    {
                        Some((j, sw_node_cnt[j], sufficient))
                    }
                    keep => keep,
                };
            }
            let Some((leaf, _, _)) = best_leaf else {
                break;
            };
            let leaf_nodes: Vec<usize> = sw_nodes[leaf].iter_ones().collect();
            for n in leaf_nodes {
                sw_nodes[leaf].clear(n);
                sw_node_cnt[leaf] -= 1;
                if nodes.test(n) {
                    // node under multiple leaves and already selected
                    continue;
                }
                let mut avail_cores_in_node = 0usize;
                if let Some(excl) = &excl {
                    avail_cores_in_node = self.free_on_node(excl, NodeId::new(n as u32));
                    if avail_cores_in_node < cores_per_node {
                        continue;
                    }
                }
                nodes.set(n);
                rem_cores -= avail_cores_in_node as i64;
                rem_nodes -= 1;
                if rem_nodes <= 0 {
                    break;
                }
            }
            sw_node_cnt[leaf] = 0;
        }

        if rem_nodes > 0 || rem_cores > 0 {
            log::debug!("insufficient resources for reservation");
            return None;
        }

        let Some(excl) = excl else {
            return Some(ResvSelection {
                nodes,
                cores: Bitmap::zeros(self.core_map.total_cores()),
            });
        };

        // second pass: pick the exact cores on the selected nodes
        let core_cnt = core_cnt.expect("exclusion implies core counts");
        let mut cores = Bitmap::zeros(self.core_map.total_cores());
        let mut rem = rem_cores_save;
        let mut per = cores_per_node;
        loop {
            let before = rem;
            let mut visit = 0usize;
            for n in nodes.iter_ones() {
                if rem == 0 {
                    break;
                }
                let node = NodeId::new(n as u32);
                let span = self.core_map.node_span(node);
                let limit = if aggregate {
                    per
                } else {
                    core_cnt.get(visit).copied().unwrap_or(0) as usize
                };
                let mut taken_this_visit = 0usize;
                for c in span {
                    if rem == 0 || taken_this_visit >= limit {
                        break;
                    }
                    if !excl.test(c) && !cores.test(c) {
                        cores.set(c);
                        rem -= 1;
                        taken_this_visit += 1;
                    }
                }
                visit += 1;
            }
            if rem == 0 {
                break;
            }
            if !aggregate || rem == before {
                log::info!("reservation request can not be satisfied");
                return None;
            }
            // make another pass over the nodes to reach the aggregate count
            per = 1;
        }

        Some(ResvSelection { nodes, cores })
    }
}
