use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use serde::Serialize;
use tracing::{debug, info, warn};

use crate::checkpoint::{Checkpoint, CheckpointStore};
use crate::errors::{AppError, AppResult};
use crate::executor::run_parallel;
use crate::resolver::{AddressPair, DistanceResult, DistanceSource, PairResolver, ResolutionStatus};

pub const DEFAULT_CHUNK_SIZE: usize = 50;

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct BatchProgress {
    pub completed: usize,
    pub total: usize,
    pub label: String,
}

pub type ProgressObserver = Arc<dyn Fn(BatchProgress) + Send + Sync>;

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct BatchStats {
    pub total: usize,
    pub ok: usize,
    pub warning: usize,
    pub error: usize,
    pub both: usize,
    pub average: usize,
    pub nominatim: usize,
    pub ors: usize,
    pub none: usize,
}

impl BatchStats {
    pub fn from_results(results: &[DistanceResult]) -> Self {
        let mut stats = BatchStats {
            total: results.len(),
            ..Default::default()
        };
        for result in results {
            match result.status {
                ResolutionStatus::Ok => stats.ok += 1,
                ResolutionStatus::Warning => stats.warning += 1,
                ResolutionStatus::Error => stats.error += 1,
            }
            match result.source {
                DistanceSource::Both => stats.both += 1,
                DistanceSource::Average => stats.average += 1,
                DistanceSource::Nominatim => stats.nominatim += 1,
                DistanceSource::OpenRouteService => stats.ors += 1,
                DistanceSource::None => stats.none += 1,
            }
        }
        stats
    }
}

/// Result table aligned with the input rows, plus its statistics.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct BatchOutcome {
    pub results: Vec<DistanceResult>,
    pub stats: BatchStats,
    pub resumed_chunks: usize,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct PendingSession {
    pub pending: bool,
    pub chunk_count: usize,
}

/// Stable session identifier for a batch source such as an uploaded file name.
pub fn session_id_for(source_name: &str) -> String {
    format!("{:x}", md5::compute(source_name.as_bytes()))
}

/// Rows worth resolving and where they sit in the caller's table.
struct WorkList {
    pairs: Vec<AddressPair>,
    row_indices: Vec<usize>,
}

impl WorkList {
    fn from_rows(rows: &[AddressPair]) -> Self {
        let (row_indices, pairs) = rows
            .iter()
            .enumerate()
            .filter(|(_, pair)| !pair.is_blank())
            .map(|(index, pair)| (index, pair.clone()))
            .unzip();
        Self { pairs, row_indices }
    }

    fn chunk_count(&self, chunk_size: usize) -> usize {
        self.pairs.len().div_ceil(chunk_size)
    }

    fn chunk_bounds(&self, chunk_index: usize, chunk_size: usize) -> (usize, usize) {
        let start = chunk_index * chunk_size;
        (start, (start + chunk_size).min(self.pairs.len()))
    }
}

pub struct BatchProcessor {
    store: Arc<dyn CheckpointStore>,
    chunk_size: usize,
    concurrency: usize,
}

impl BatchProcessor {
    pub fn new(store: Arc<dyn CheckpointStore>, chunk_size: usize, concurrency: usize) -> Self {
        Self {
            store,
            chunk_size: chunk_size.max(1),
            concurrency: concurrency.max(1),
        }
    }

    pub fn chunk_size(&self) -> usize {
        self.chunk_size
    }

    /// Resolves every non-blank row chunk by chunk, persisting each chunk
    /// before starting the next and resuming from whatever an earlier run
    /// of the same session already persisted.
    ///
    /// A checkpoint write failure or cancellation aborts the run; persisted
    /// chunks stay in place for the next attempt.
    pub async fn process<R>(
        &self,
        rows: &[AddressPair],
        session_id: &str,
        resolver: Arc<R>,
        progress: Option<ProgressObserver>,
        cancel: Option<Arc<AtomicBool>>,
    ) -> AppResult<BatchOutcome>
    where
        R: PairResolver + ?Sized + 'static,
    {
        let work = WorkList::from_rows(rows);
        let total = work.pairs.len();
        let chunk_count = work.chunk_count(self.chunk_size);
        info!(
            target: "batch_processor",
            session_id,
            rows = rows.len(),
            valid = total,
            chunks = chunk_count,
            "batch started"
        );

        let resumed = self.load_resumable(session_id, &work)?;
        let resumed_chunks = resumed.len();
        let mut results: Vec<DistanceResult> =
            resumed.into_iter().flat_map(|checkpoint| checkpoint.results).collect();
        if resumed_chunks > 0 {
            info!(
                target: "batch_processor",
                session_id,
                resumed_chunks,
                resumed_rows = results.len(),
                "resuming from checkpoints"
            );
        }

        for chunk_index in resumed_chunks..chunk_count {
            if cancel
                .as_ref()
                .is_some_and(|flag| flag.load(Ordering::SeqCst))
            {
                info!(target: "batch_processor", session_id, chunk_index, "batch cancelled");
                return Err(AppError::Cancelled);
            }

            let (start, end) = work.chunk_bounds(chunk_index, self.chunk_size);
            let label = format!("chunk {}/{}", chunk_index + 1, chunk_count);
            notify(&progress, results.len(), total, label.clone());
            debug!(target: "batch_processor", session_id, chunk_index, rows = end - start, "processing chunk");

            let chunk_results = run_parallel(
                work.pairs[start..end].to_vec(),
                Arc::clone(&resolver),
                self.concurrency,
            )
            .await;

            let checkpoint = Checkpoint::new(
                session_id,
                chunk_index,
                work.row_indices[start..end].to_vec(),
                chunk_results,
            );
            self.store.write(&checkpoint).map_err(|err| {
                warn!(
                    target: "batch_processor",
                    session_id,
                    chunk_index,
                    error = %err,
                    "checkpoint write failed; aborting batch"
                );
                err
            })?;
            results.extend(checkpoint.results);

            notify(&progress, results.len(), total, format!("{label} done"));
        }

        let removed = match self.store.delete_all(session_id) {
            Ok(removed) => removed,
            Err(err) => {
                warn!(
                    target: "batch_processor",
                    session_id,
                    error = %err,
                    "checkpoint cleanup failed; results are complete"
                );
                0
            }
        };
        let table = assemble(rows, &work.row_indices, results);
        let stats = BatchStats::from_results(&table);
        info!(
            target: "batch_processor",
            session_id,
            ok = stats.ok,
            warning = stats.warning,
            error = stats.error,
            checkpoints_removed = removed,
            "batch complete"
        );
        Ok(BatchOutcome {
            results: table,
            stats,
            resumed_chunks,
        })
    }

    pub fn has_pending_session(&self, session_id: &str) -> AppResult<PendingSession> {
        let chunk_count = self.store.count(session_id)?;
        Ok(PendingSession {
            pending: chunk_count > 0,
            chunk_count,
        })
    }

    /// Table built from the persisted chunks of an unfinished session, or
    /// `None` when nothing was persisted. Rows not computed yet carry a
    /// pending error result.
    pub fn partial_results(
        &self,
        session_id: &str,
        rows: &[AddressPair],
    ) -> AppResult<Option<BatchOutcome>> {
        let work = WorkList::from_rows(rows);
        let checkpoints = self.load_resumable(session_id, &work)?;
        if checkpoints.is_empty() {
            return Ok(None);
        }
        let resumed_chunks = checkpoints.len();
        let results: Vec<DistanceResult> = checkpoints
            .into_iter()
            .flat_map(|checkpoint| checkpoint.results)
            .collect();
        let table = assemble(rows, &work.row_indices[..results.len()], results);
        let stats = BatchStats::from_results(&table);
        Ok(Some(BatchOutcome {
            results: table,
            stats,
            resumed_chunks,
        }))
    }

    pub fn discard_session(&self, session_id: &str) -> AppResult<usize> {
        self.store.delete_all(session_id)
    }

    /// Persisted chunks for `session_id`, checked against the rows they must
    /// cover.
    fn load_resumable(&self, session_id: &str, work: &WorkList) -> AppResult<Vec<Checkpoint>> {
        let checkpoints = self.store.read_range(session_id)?;
        let chunk_count = work.chunk_count(self.chunk_size);
        if checkpoints.len() > chunk_count {
            return Err(AppError::Checkpoint(format!(
                "session {session_id} has {} checkpoints but the input only needs {chunk_count}",
                checkpoints.len()
            )));
        }
        for checkpoint in &checkpoints {
            let (start, end) = work.chunk_bounds(checkpoint.chunk_index, self.chunk_size);
            let expected = &work.row_indices[start..end];
            if checkpoint.original_row_indices != expected
                || checkpoint.results.len() != expected.len()
            {
                return Err(AppError::Checkpoint(format!(
                    "chunk {} of session {session_id} does not match the current input",
                    checkpoint.chunk_index
                )));
            }
        }
        Ok(checkpoints)
    }
}

fn notify(progress: &Option<ProgressObserver>, completed: usize, total: usize, label: String) {
    if let Some(observer) = progress {
        observer(BatchProgress {
            completed,
            total,
            label,
        });
    }
}

fn assemble(rows: &[AddressPair], row_indices: &[usize], results: Vec<DistanceResult>) -> Vec<DistanceResult> {
    let mut table: Vec<DistanceResult> = rows
        .iter()
        .map(|row| {
            if row.is_blank() {
                DistanceResult::missing_address(row.clone())
            } else {
                DistanceResult::pending(row.clone())
            }
        })
        .collect();
    for (row, result) in row_indices.iter().zip(results) {
        if let Some(slot) = table.get_mut(*row) {
            *slot = result;
        }
    }
    table
}
