use std::collections::BTreeMap;
use std::fs;
use std::io::{BufWriter, Write};
use std::path::{Path, PathBuf};

#[cfg(test)]
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
#[cfg(test)]
use std::sync::Arc;

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tempfile::NamedTempFile;
use tracing::{debug, info, warn};

use crate::db::now_timestamp;
use crate::errors::{AppError, AppResult};
use crate::resolver::DistanceResult;

/// Durable record of one finished chunk.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Checkpoint {
    pub session_id: String,
    pub chunk_index: usize,
    /// Row positions in the caller's original table, one per result.
    pub original_row_indices: Vec<usize>,
    pub results: Vec<DistanceResult>,
    pub completed_at: String,
}

impl Checkpoint {
    pub fn new(
        session_id: impl Into<String>,
        chunk_index: usize,
        original_row_indices: Vec<usize>,
        results: Vec<DistanceResult>,
    ) -> Self {
        Self {
            session_id: session_id.into(),
            chunk_index,
            original_row_indices,
            results,
            completed_at: now_timestamp(),
        }
    }
}

pub trait CheckpointStore: Send + Sync {
    /// Must not return before the record is durable.
    fn write(&self, checkpoint: &Checkpoint) -> AppResult<()>;

    fn read(&self, session_id: &str, chunk_index: usize) -> AppResult<Option<Checkpoint>>;

    fn count(&self, session_id: &str) -> AppResult<usize>;

    fn delete_all(&self, session_id: &str) -> AppResult<usize>;

    /// Contiguous run of checkpoints starting at chunk 0. The first absent or
    /// unreadable record ends the run.
    fn read_range(&self, session_id: &str) -> AppResult<Vec<Checkpoint>> {
        let mut loaded = Vec::new();
        loop {
            let chunk_index = loaded.len();
            match self.read(session_id, chunk_index) {
                Ok(Some(checkpoint)) => loaded.push(checkpoint),
                Ok(None) => break,
                Err(AppError::Json(err)) => {
                    warn!(
                        target: "checkpoint_store",
                        session_id,
                        chunk_index,
                        error = %err,
                        "unreadable checkpoint ends resume scan"
                    );
                    break;
                }
                Err(err) => return Err(err),
            }
        }
        Ok(loaded)
    }
}

fn validate_session_id(session_id: &str) -> AppResult<()> {
    let valid = !session_id.is_empty()
        && session_id
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_');
    if valid {
        Ok(())
    } else {
        Err(AppError::Checkpoint(format!(
            "invalid session id: {session_id:?}"
        )))
    }
}

/// One JSON file per chunk, named `{session_id}_chunk_{n}.json`.
pub struct FileCheckpointStore {
    dir: PathBuf,
}

impl FileCheckpointStore {
    pub fn new<P: AsRef<Path>>(dir: P) -> AppResult<Self> {
        let dir = dir.as_ref().to_path_buf();
        fs::create_dir_all(&dir)?;
        Ok(Self { dir })
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    pub fn chunk_path(&self, session_id: &str, chunk_index: usize) -> PathBuf {
        self.dir
            .join(format!("{session_id}_chunk_{chunk_index}.json"))
    }

    fn session_files(&self, session_id: &str) -> AppResult<Vec<PathBuf>> {
        let prefix = format!("{session_id}_chunk_");
        let mut files = Vec::new();
        for entry in fs::read_dir(&self.dir)? {
            let path = entry?.path();
            let Some(name) = path.file_name().and_then(|n| n.to_str()) else {
                continue;
            };
            let is_chunk = name
                .strip_prefix(&prefix)
                .and_then(|rest| rest.strip_suffix(".json"))
                .is_some_and(|n| !n.is_empty() && n.bytes().all(|b| b.is_ascii_digit()));
            if is_chunk {
                files.push(path);
            }
        }
        Ok(files)
    }
}

impl CheckpointStore for FileCheckpointStore {
    fn write(&self, checkpoint: &Checkpoint) -> AppResult<()> {
        validate_session_id(&checkpoint.session_id)?;
        let path = self.chunk_path(&checkpoint.session_id, checkpoint.chunk_index);

        let mut temp = NamedTempFile::new_in(&self.dir)?;
        {
            let mut writer = BufWriter::new(temp.as_file_mut());
            serde_json::to_writer(&mut writer, checkpoint)?;
            writer.flush()?;
        }
        temp.as_file().sync_all()?;
        temp.persist(&path).map_err(|err| AppError::Io(err.error))?;

        debug!(
            target: "checkpoint_store",
            path = %path.display(),
            rows = checkpoint.results.len(),
            "checkpoint written"
        );
        Ok(())
    }

    fn read(&self, session_id: &str, chunk_index: usize) -> AppResult<Option<Checkpoint>> {
        validate_session_id(session_id)?;
        let path = self.chunk_path(session_id, chunk_index);
        let raw = match fs::read(&path) {
            Ok(raw) => raw,
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(err) => return Err(err.into()),
        };
        let checkpoint: Checkpoint = serde_json::from_slice(&raw)?;
        if checkpoint.session_id != session_id || checkpoint.chunk_index != chunk_index {
            return Err(AppError::Checkpoint(format!(
                "{} holds chunk {} of session {}",
                path.display(),
                checkpoint.chunk_index,
                checkpoint.session_id
            )));
        }
        Ok(Some(checkpoint))
    }

    fn count(&self, session_id: &str) -> AppResult<usize> {
        validate_session_id(session_id)?;
        Ok(self.session_files(session_id)?.len())
    }

    fn delete_all(&self, session_id: &str) -> AppResult<usize> {
        validate_session_id(session_id)?;
        let files = self.session_files(session_id)?;
        let mut removed = 0;
        for path in &files {
            match fs::remove_file(path) {
                Ok(()) => removed += 1,
                Err(err) => warn!(
                    target: "checkpoint_store",
                    path = %path.display(),
                    error = %err,
                    "failed to delete checkpoint"
                ),
            }
        }
        if removed > 0 {
            info!(
                target: "checkpoint_store",
                session_id,
                removed,
                left = files.len() - removed,
                "session checkpoints deleted"
            );
        }
        Ok(removed)
    }
}

/// Process-local store for tests and runs that need no crash recovery.
#[derive(Default)]
pub struct MemoryCheckpointStore {
    records: Mutex<BTreeMap<(String, usize), Checkpoint>>,
    #[cfg(test)]
    fault_injector: Option<Arc<TestFaultInjector>>,
}

impl MemoryCheckpointStore {
    pub fn new() -> Self {
        Self::default()
    }
}

impl CheckpointStore for MemoryCheckpointStore {
    fn write(&self, checkpoint: &Checkpoint) -> AppResult<()> {
        validate_session_id(&checkpoint.session_id)?;
        #[cfg(test)]
        if self
            .fault_injector
            .as_ref()
            .is_some_and(|hooks| hooks.take_write_failure(checkpoint.chunk_index))
        {
            return Err(AppError::Io(std::io::Error::new(
                std::io::ErrorKind::WriteZero,
                "simulated checkpoint write failure",
            )));
        }
        self.records.lock().insert(
            (checkpoint.session_id.clone(), checkpoint.chunk_index),
            checkpoint.clone(),
        );
        Ok(())
    }

    fn read(&self, session_id: &str, chunk_index: usize) -> AppResult<Option<Checkpoint>> {
        Ok(self
            .records
            .lock()
            .get(&(session_id.to_string(), chunk_index))
            .cloned())
    }

    fn count(&self, session_id: &str) -> AppResult<usize> {
        Ok(self
            .records
            .lock()
            .keys()
            .filter(|(session, _)| session == session_id)
            .count())
    }

    fn delete_all(&self, session_id: &str) -> AppResult<usize> {
        #[cfg(test)]
        if self
            .fault_injector
            .as_ref()
            .is_some_and(|hooks| hooks.fail_delete.load(Ordering::SeqCst))
        {
            return Err(AppError::Io(std::io::Error::new(
                std::io::ErrorKind::PermissionDenied,
                "simulated checkpoint delete failure",
            )));
        }
        let mut records = self.records.lock();
        let before = records.len();
        records.retain(|(session, _), _| session != session_id);
        Ok(before - records.len())
    }
}

#[cfg(test)]
#[derive(Debug)]
pub struct TestFaultInjector {
    fail_chunk: AtomicUsize,
    fail_delete: AtomicBool,
}

#[cfg(test)]
impl Default for TestFaultInjector {
    fn default() -> Self {
        Self {
            fail_chunk: AtomicUsize::new(usize::MAX),
            fail_delete: AtomicBool::new(false),
        }
    }
}

#[cfg(test)]
impl TestFaultInjector {
    pub fn fail_write_of_chunk(&self, chunk_index: usize) {
        self.fail_chunk.store(chunk_index, Ordering::SeqCst);
    }

    pub fn fail_deletes(&self, fail: bool) {
        self.fail_delete.store(fail, Ordering::SeqCst);
    }

    fn take_write_failure(&self, chunk_index: usize) -> bool {
        self.fail_chunk
            .compare_exchange(chunk_index, usize::MAX, Ordering::SeqCst, Ordering::SeqCst)
            .is_ok()
    }
}

#[cfg(test)]
impl MemoryCheckpointStore {
    pub fn enable_test_hooks(&mut self) -> Arc<TestFaultInjector> {
        let hooks = Arc::new(TestFaultInjector::default());
        self.fault_injector = Some(hooks.clone());
        hooks
    }
}

#[cfg(test)]
mod tests {
    use tempfile::tempdir;

    use crate::resolver::AddressPair;

    use super::*;

    fn checkpoint(session: &str, chunk_index: usize) -> Checkpoint {
        let rows: Vec<usize> = (chunk_index * 2..chunk_index * 2 + 2).collect();
        let results = rows
            .iter()
            .map(|row| DistanceResult::pending(AddressPair::new(format!("A{row}"), "B")))
            .collect();
        Checkpoint::new(session, chunk_index, rows, results)
    }

    #[test]
    fn file_store_round_trips_and_probes_contiguously() {
        let dir = tempdir().unwrap();
        let store = FileCheckpointStore::new(dir.path().join("temp_batches")).unwrap();
        let written: Vec<_> = [0, 1, 3]
            .into_iter()
            .map(|chunk| {
                let record = checkpoint("abc123", chunk);
                store.write(&record).unwrap();
                record
            })
            .collect();

        assert!(store.chunk_path("abc123", 0).ends_with("abc123_chunk_0.json"));
        assert_eq!(store.read("abc123", 1).unwrap().as_ref(), Some(&written[1]));
        assert_eq!(store.read("abc123", 2).unwrap(), None);

        let loaded = store.read_range("abc123").unwrap();
        assert_eq!(loaded, written[..2].to_vec());
        assert_eq!(loaded[1].original_row_indices, vec![2, 3]);
        assert_eq!(store.count("abc123").unwrap(), 3);
    }

    #[test]
    fn corrupt_checkpoint_ends_scan() {
        let dir = tempdir().unwrap();
        let store = FileCheckpointStore::new(dir.path()).unwrap();
        store.write(&checkpoint("s1", 0)).unwrap();
        fs::write(store.chunk_path("s1", 1), b"{ not json").unwrap();
        store.write(&checkpoint("s1", 2)).unwrap();

        let loaded = store.read_range("s1").unwrap();
        assert_eq!(loaded.len(), 1);
        assert!(matches!(store.read("s1", 1), Err(AppError::Json(_))));
    }

    #[test]
    fn delete_all_only_touches_one_session() {
        let dir = tempdir().unwrap();
        let store = FileCheckpointStore::new(dir.path()).unwrap();
        store.write(&checkpoint("s1", 0)).unwrap();
        store.write(&checkpoint("s1", 1)).unwrap();
        store.write(&checkpoint("s10", 0)).unwrap();
        fs::write(dir.path().join("s1_chunk_notes.txt"), b"keep").unwrap();

        assert_eq!(store.delete_all("s1").unwrap(), 2);
        assert_eq!(store.count("s1").unwrap(), 0);
        assert_eq!(store.count("s10").unwrap(), 1);
        assert!(dir.path().join("s1_chunk_notes.txt").exists());
        assert_eq!(store.delete_all("s1").unwrap(), 0);
    }

    #[test]
    fn delete_all_keeps_going_past_undeletable_entries() {
        let dir = tempdir().unwrap();
        let store = FileCheckpointStore::new(dir.path()).unwrap();
        store.write(&checkpoint("s1", 0)).unwrap();
        store.write(&checkpoint("s1", 2)).unwrap();
        fs::create_dir(store.chunk_path("s1", 1)).unwrap();

        assert_eq!(store.delete_all("s1").unwrap(), 2);
        assert!(!store.chunk_path("s1", 0).exists());
        assert!(!store.chunk_path("s1", 2).exists());
        assert!(store.chunk_path("s1", 1).is_dir());
    }

    #[test]
    fn rejects_session_ids_that_escape_the_directory() {
        let dir = tempdir().unwrap();
        let store = FileCheckpointStore::new(dir.path()).unwrap();
        assert!(matches!(
            store.write(&checkpoint("../evil", 0)),
            Err(AppError::Checkpoint(_))
        ));
        assert!(store.read("", 0).is_err());
    }

    #[test]
    fn overwrite_leaves_no_temp_files() {
        let dir = tempdir().unwrap();
        let store = FileCheckpointStore::new(dir.path()).unwrap();
        store.write(&checkpoint("s1", 0)).unwrap();
        store.write(&checkpoint("s1", 0)).unwrap();

        let entries: Vec<_> = fs::read_dir(dir.path()).unwrap().collect();
        assert_eq!(entries.len(), 1);
    }

    #[test]
    fn memory_store_matches_file_semantics() {
        let store = MemoryCheckpointStore::new();
        store.write(&checkpoint("s1", 0)).unwrap();
        store.write(&checkpoint("s1", 2)).unwrap();
        store.write(&checkpoint("s2", 0)).unwrap();

        assert_eq!(store.read_range("s1").unwrap().len(), 1);
        assert_eq!(store.count("s1").unwrap(), 2);
        assert_eq!(store.delete_all("s1").unwrap(), 2);
        assert_eq!(store.count("s2").unwrap(), 1);
    }

    #[test]
    fn injected_write_failure_fires_once() {
        let mut store = MemoryCheckpointStore::new();
        let hooks = store.enable_test_hooks();
        hooks.fail_write_of_chunk(1);

        store.write(&checkpoint("s1", 0)).unwrap();
        assert!(store.write(&checkpoint("s1", 1)).is_err());
        store.write(&checkpoint("s1", 1)).unwrap();
        assert_eq!(store.count("s1").unwrap(), 2);
    }
}
