use crate::common::Bitmap;
use crate::coremap::CoreMap;
use crate::job::{JobMap, JobResources};
use crate::{JobId, PartitionId};

/// One oversubscription lane. Jobs resident in the same row have pairwise
/// disjoint core maps; `row_bitmap` is the OR of all of them and is
/// allocated lazily on the first insert.
#[derive(Debug, Clone, Default)]
pub struct PartRow {
    pub job_ids: Vec<JobId>,
    pub row_bitmap: Option<Bitmap>,
}

impl PartRow {
    #[inline]
    pub fn num_jobs(&self) -> usize {
        self.job_ids.len()
    }

    /// Occupancy test per the fit policy: an empty row always fits; otherwise
    /// the job's projected cores must be disjoint from the row bitmap, and a
    /// whole-node job additionally needs each of its nodes fully idle.
    pub fn fits(&self, res: &JobResources, cmap: &CoreMap) -> bool {
        if self.job_ids.is_empty() {
            return true;
        }
        match &self.row_bitmap {
            None => true,
            Some(row) => res.fits_into_cores(cmap, row),
        }
    }

    pub fn add_job(&mut self, id: JobId, res: &JobResources, cmap: &CoreMap) {
        let row = self
            .row_bitmap
            .get_or_insert_with(|| Bitmap::zeros(cmap.total_cores()));
        res.add_to_cores(cmap, row);
        self.job_ids.push(id);
    }

    pub fn clear(&mut self) {
        self.job_ids.clear();
        if let Some(row) = &mut self.row_bitmap {
            row.clear_all();
        }
    }

    /// Rebuild the bitmap from the resident job list. Jobs missing from the
    /// table are skipped; the controller owns job lifetime and a miss here
    /// means it already dropped the record.
    pub fn rebuild_bitmap(&mut self, jobs: &JobMap, cmap: &CoreMap) {
        let row = self
            .row_bitmap
            .get_or_insert_with(|| Bitmap::zeros(cmap.total_cores()));
        row.clear_all();
        for id in &self.job_ids {
            if let Some(res) = jobs.get(id).and_then(|j| j.resources.as_ref()) {
                res.add_to_cores(cmap, row);
            } else {
                log::error!("row rebuild: job {id} vanished from the job table");
            }
        }
    }

    fn set_count(&self) -> usize {
        self.row_bitmap.as_ref().map_or(0, |b| b.set_count())
    }
}

/// Per-partition row table. Rows 0..num_rows are used in order; after
/// packing, earlier rows are at least as dense as later ones.
#[derive(Debug, Clone)]
pub struct PartitionRes {
    pub id: PartitionId,
    pub num_rows: u32,
    pub rows: Vec<PartRow>,
}

impl PartitionRes {
    pub fn new(id: PartitionId, num_rows: u32) -> Self {
        PartitionRes {
            id,
            num_rows,
            rows: (0..num_rows).map(|_| PartRow::default()).collect(),
        }
    }

    pub fn total_jobs(&self) -> usize {
        self.rows.iter().map(|r| r.num_jobs()).sum()
    }

    /// Index of the row holding `job`, if resident.
    pub fn find_job_row(&self, job: JobId) -> Option<usize> {
        self.rows
            .iter()
            .position(|r| r.job_ids.contains(&job))
    }

    /// Remove `job` from whichever row holds it. The row bitmap is left
    /// untouched; callers rebuild or repack afterwards.
    pub fn remove_job(&mut self, job: JobId) -> Option<usize> {
        for (i, row) in self.rows.iter_mut().enumerate() {
            if let Some(pos) = row.job_ids.iter().position(|&id| id == job) {
                row.job_ids.remove(pos);
                return Some(i);
            }
        }
        None
    }

    /// Order rows so that fuller rows come first; ties keep their relative
    /// order (stable sort), which preserves the original row index ordering.
    pub fn sort_rows(&mut self) {
        self.rows.sort_by_key(|r| std::cmp::Reverse(r.set_count()));
    }

    /// Count of rows currently holding at least one job.
    pub fn used_rows(&self) -> usize {
        self.rows.iter().filter(|r| r.num_jobs() > 0).count()
    }
}

#[cfg(test)]
mod tests {
    use super::{PartRow, PartitionRes};
    use crate::common::Bitmap;
    use crate::coremap::CoreMap;
    use crate::node::NodeConfig;
    use crate::{JobId, PartitionId};

    fn cmap() -> CoreMap {
        CoreMap::build(&[
            NodeConfig::with_cores("n0", 2),
            NodeConfig::with_cores("n1", 2),
        ])
    }

    fn job_res(nodes: &[usize], cores: &[usize]) -> crate::job::JobResources {
        let mut res = crate::job::JobResources::sized(nodes.len(), 2, 2 * nodes.len());
        res.node_bitmap = Bitmap::from_indices(2, nodes);
        for &c in cores {
            res.core_bitmap.set(c);
        }
        res
    }

    #[test]
    fn test_empty_row_always_fits() {
        let cmap = cmap();
        let row = PartRow::default();
        let res = job_res(&[0, 1], &[0, 2]);
        assert!(row.fits(&res, &cmap));
    }

    #[test]
    fn test_row_add_and_conflict() {
        let cmap = cmap();
        let mut row = PartRow::default();
        let a = job_res(&[0], &[0]);
        row.add_job(JobId::new(1), &a, &cmap);
        let same_core = job_res(&[0], &[0]);
        let other_core = job_res(&[0], &[1]);
        assert!(!row.fits(&same_core, &cmap));
        assert!(row.fits(&other_core, &cmap));
    }

    #[test]
    fn test_sort_rows_densest_first() {
        let cmap = cmap();
        let mut part = PartitionRes::new(PartitionId::new(0), 3);
        let small = job_res(&[0], &[0]);
        let big = job_res(&[0, 1], &[0, 1, 2, 3]);
        part.rows[1].add_job(JobId::new(1), &small, &cmap);
        part.rows[2].add_job(JobId::new(2), &big, &cmap);
        part.sort_rows();
        assert_eq!(part.rows[0].job_ids, vec![JobId::new(2)]);
        assert_eq!(part.rows[1].job_ids, vec![JobId::new(1)]);
        assert_eq!(part.rows[2].num_jobs(), 0);
        assert_eq!(part.used_rows(), 2);
    }
}
