use crate::coremap::CoreMap;
use crate::job::{JobMap, JobResources};
use crate::partition::PartitionRes;
use crate::JobId;

struct SortSupport {
    id: JobId,
    jstart: usize,
    ncpus: u32,
}

/// A job has been removed from the partition, so the row bitmaps need to be
/// reconstructed. Pack the remaining jobs into the least number of rows and
/// make the lower rows as dense as possible.
///
/// `removed` is the record of the job just taken out, when the caller still
/// has it; with a single row this allows clearing just that job's bits
/// instead of rebuilding.
///
/// Ordering jobs by their first set core bit keeps allocations that stay "in
/// blocks" together without a combinatorial search. If the packed layout
/// fails to place some job, the pre-packing layout is restored, so the
/// result is never worse than the input.
pub fn build_row_bitmaps(
    cmap: &CoreMap,
    part: &mut PartitionRes,
    jobs: &JobMap,
    removed: Option<&JobResources>,
) {
    if part.rows.is_empty() {
        return;
    }

    if part.rows.len() == 1 {
        let row = &mut part.rows[0];
        if row.num_jobs() == 0 {
            if let Some(bitmap) = &mut row.row_bitmap {
                bitmap.clear_all();
            }
        } else if let (Some(res), Some(bitmap)) = (removed, &mut row.row_bitmap) {
            // just clear the removed job's cores
            res.remove_from_cores(cmap, bitmap);
        } else {
            row.rebuild_bitmap(jobs, cmap);
        }
        return;
    }

    let num_jobs = part.total_jobs();
    if num_jobs == 0 {
        for row in &mut part.rows {
            if let Some(bitmap) = &mut row.row_bitmap {
                bitmap.clear_all();
            }
        }
        return;
    }
    log::debug!(
        "partition {}: reshuffling {num_jobs} jobs across {} rows",
        part.id,
        part.rows.len()
    );

    // keep the current layout, in case we cannot do better than it
    let orig: Vec<Vec<JobId>> = part.rows.iter().map(|r| r.job_ids.clone()).collect();

    // master job list; rows are cleared out entirely
    let mut support: Vec<SortSupport> = Vec::with_capacity(num_jobs);
    for row in &mut part.rows {
        for &id in &row.job_ids {
            match jobs.get(&id).and_then(|j| j.resources.as_ref()) {
                Some(res) => support.push(SortSupport {
                    id,
                    jstart: res.first_global_core(cmap),
                    ncpus: res.ncpus,
                }),
                None => log::error!("row pack: job {id} vanished from the job table"),
            }
        }
        row.clear();
    }

    support.sort_by(|a, b| a.jstart.cmp(&b.jstart).then(b.ncpus.cmp(&a.ncpus)));

    let mut dangling = false;
    for entry in &support {
        let res = match jobs.get(&entry.id).and_then(|j| j.resources.as_ref()) {
            Some(res) => res,
            None => continue,
        };
        match part.rows.iter().position(|row| row.fits(res, cmap)) {
            Some(i) => part.rows[i].add_job(entry.id, res, cmap),
            None => dangling = true,
        }
        // shuffle the rows so the fullest comes first for the next job
        part.sort_rows();
    }

    if dangling {
        // the packing could not improve on the existing layout; restore it
        log::debug!("partition {}: dangling job found, restoring layout", part.id);
        for (row, ids) in part.rows.iter_mut().zip(orig) {
            row.job_ids = ids;
            if row.job_ids.is_empty() {
                if let Some(bitmap) = &mut row.row_bitmap {
                    bitmap.clear_all();
                }
            } else {
                row.rebuild_bitmap(jobs, cmap);
            }
        }
    }
}
