//! File-backed checkpoint store.
//!
//! Each job is one file, `<dir>/<job-id>.json`, holding an envelope:
//!
//! ```text
//! { "schema": 1, "sequence": 7, "digest": "<sha256 of record>", "record": { … } }
//! ```
//!
//! - Writes go to `<job-id>.json.tmp`, are fsynced, then renamed over the
//!   live file and the directory is fsynced. A crash leaves either the old
//!   or the new file in place.
//! - The digest covers the exact bytes of `record`, so truncation and
//!   hand edits are caught on load instead of producing a half-valid job.
//! - The store remembers the highest sequence it saved or loaded per job and
//!   refuses anything older.

use super::{CheckpointRecord, CheckpointStore};
use crate::error::CheckpointError;
use crate::model::JobId;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::value::RawValue;
use sha2::{Digest, Sha256};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use tokio::io::AsyncWriteExt;
use tokio::sync::Mutex;
use tracing::{debug, warn};

/// Envelope schema understood by this build.
pub const SCHEMA_VERSION: u32 = 1;

#[derive(Serialize)]
struct EnvelopeOut<'a> {
    schema: u32,
    sequence: u64,
    digest: String,
    record: &'a RawValue,
}

#[derive(Deserialize)]
struct EnvelopeIn {
    schema: u32,
    sequence: u64,
    digest: String,
    record: Box<RawValue>,
}

pub struct FileCheckpointStore {
    dir: PathBuf,
    watermarks: Mutex<HashMap<JobId, u64>>,
}

impl FileCheckpointStore {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self {
            dir: dir.into(),
            watermarks: Mutex::new(HashMap::new()),
        }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    pub fn path_for(&self, job: &JobId) -> PathBuf {
        self.dir.join(format!("{job}.json"))
    }

    /// Every readable checkpoint in the directory, sorted by job id.
    /// Corrupt files are logged and skipped.
    pub async fn list(&self) -> Result<Vec<CheckpointRecord>, CheckpointError> {
        let mut entries = match tokio::fs::read_dir(&self.dir).await {
            Ok(e) => e,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(source) => {
                return Err(CheckpointError::Io {
                    path: self.dir.clone(),
                    source,
                })
            }
        };

        let mut ids = Vec::new();
        loop {
            let entry = entries
                .next_entry()
                .await
                .map_err(|source| CheckpointError::Io {
                    path: self.dir.clone(),
                    source,
                })?;
            let Some(entry) = entry else { break };
            let path = entry.path();
            if path.extension().and_then(|e| e.to_str()) != Some("json") {
                continue;
            }
            let stem = path.file_stem().and_then(|s| s.to_str()).unwrap_or_default();
            if let Ok(id) = JobId::parse(stem) {
                ids.push(id);
            }
        }
        ids.sort();

        let mut records = Vec::with_capacity(ids.len());
        for id in ids {
            match self.load(&id).await {
                Ok(Some(record)) => records.push(record),
                Ok(None) => {}
                Err(e) => warn!("skipping checkpoint {id}: {e}"),
            }
        }
        Ok(records)
    }

    /// Delete a job's checkpoint. Returns whether a file existed.
    pub async fn remove(&self, job: &JobId) -> Result<bool, CheckpointError> {
        let mut marks = self.watermarks.lock().await;
        marks.remove(job);
        let path = self.path_for(job);
        match tokio::fs::remove_file(&path).await {
            Ok(()) => Ok(true),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(false),
            Err(source) => Err(CheckpointError::Io { path, source }),
        }
    }

    fn decode(job: &JobId, bytes: &[u8]) -> Result<CheckpointRecord, CheckpointError> {
        let corrupt = |detail: String| CheckpointError::Corrupt {
            job: job.clone(),
            detail,
        };

        if bytes.is_empty() {
            return Err(corrupt("file is empty".into()));
        }
        let envelope: EnvelopeIn = serde_json::from_slice(bytes)
            .map_err(|e| corrupt(format!("truncated or malformed envelope: {e}")))?;
        if envelope.schema != SCHEMA_VERSION {
            return Err(corrupt(format!(
                "unsupported schema {} (expected {SCHEMA_VERSION})",
                envelope.schema
            )));
        }
        let actual = digest(envelope.record.get());
        if actual != envelope.digest {
            return Err(corrupt(format!(
                "digest mismatch (stored {}, computed {actual})",
                envelope.digest
            )));
        }
        let record: CheckpointRecord = serde_json::from_str(envelope.record.get())
            .map_err(|e| corrupt(format!("record does not match the expected layout: {e}")))?;
        if record.sequence == 0 || record.sequence != envelope.sequence {
            return Err(corrupt(format!(
                "sequence mismatch (envelope {}, record {})",
                envelope.sequence, record.sequence
            )));
        }
        if &record.job.id != job {
            return Err(corrupt(format!("file holds job '{}'", record.job.id)));
        }
        record.validate().map_err(corrupt)?;
        Ok(record)
    }
}

#[async_trait]
impl CheckpointStore for FileCheckpointStore {
    async fn load(&self, job: &JobId) -> Result<Option<CheckpointRecord>, CheckpointError> {
        let path = self.path_for(job);
        let bytes = match tokio::fs::read(&path).await {
            Ok(b) => b,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(source) => return Err(CheckpointError::Io { path, source }),
        };
        let record = Self::decode(job, &bytes)?;

        let mut marks = self.watermarks.lock().await;
        let mark = marks.entry(job.clone()).or_insert(0);
        if record.sequence < *mark {
            return Err(CheckpointError::Corrupt {
                job: job.clone(),
                detail: format!(
                    "stale record: sequence {} is older than already seen {}",
                    record.sequence, mark
                ),
            });
        }
        *mark = record.sequence;
        debug!("loaded checkpoint {job} at sequence {}", record.sequence);
        Ok(Some(record))
    }

    async fn save(&self, record: &CheckpointRecord) -> Result<(), CheckpointError> {
        let job = &record.job.id;
        // Held for the whole write so concurrent saves cannot interleave.
        let mut marks = self.watermarks.lock().await;
        let last = marks.get(job).copied().unwrap_or(0);
        if record.sequence <= last {
            return Err(CheckpointError::OutOfOrder {
                job: job.clone(),
                last,
                attempted: record.sequence,
            });
        }

        let serialize = |e: serde_json::Error| CheckpointError::Serialize {
            job: job.clone(),
            detail: e.to_string(),
        };
        let body = serde_json::to_string(record).map_err(serialize)?;
        let raw = RawValue::from_string(body).map_err(serialize)?;
        let envelope = EnvelopeOut {
            schema: SCHEMA_VERSION,
            sequence: record.sequence,
            digest: digest(raw.get()),
            record: &raw,
        };
        let bytes = serde_json::to_vec(&envelope).map_err(serialize)?;

        write_atomic(&self.path_for(job), &bytes).await?;
        marks.insert(job.clone(), record.sequence);
        debug!("saved checkpoint {job} at sequence {}", record.sequence);
        Ok(())
    }
}

fn digest(text: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(text.as_bytes());
    hex::encode(hasher.finalize())
}

fn io(path: &Path) -> impl FnOnce(std::io::Error) -> CheckpointError {
    let path = path.to_path_buf();
    move |source| CheckpointError::Io { path, source }
}

/// Write `bytes` to `path` through a synced temp file and a rename.
pub async fn write_atomic(path: &Path, bytes: &[u8]) -> Result<(), CheckpointError> {
    if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
        tokio::fs::create_dir_all(parent).await.map_err(io(parent))?;
    }

    let mut tmp_name = path.as_os_str().to_owned();
    tmp_name.push(".tmp");
    let tmp_path = PathBuf::from(tmp_name);

    let mut file = tokio::fs::File::create(&tmp_path)
        .await
        .map_err(io(&tmp_path))?;
    file.write_all(bytes).await.map_err(io(&tmp_path))?;
    file.sync_all().await.map_err(io(&tmp_path))?;
    drop(file);

    tokio::fs::rename(&tmp_path, path).await.map_err(io(path))?;
    sync_parent(path).await
}

/// Flush the directory entry so the rename itself survives power loss.
#[cfg(unix)]
async fn sync_parent(path: &Path) -> Result<(), CheckpointError> {
    let parent = match path.parent().filter(|p| !p.as_os_str().is_empty()) {
        Some(parent) => parent,
        None => Path::new("."),
    };
    let dir = tokio::fs::File::open(parent).await.map_err(io(parent))?;
    dir.sync_all().await.map_err(io(parent))?;
    Ok(())
}

#[cfg(not(unix))]
async fn sync_parent(_path: &Path) -> Result<(), CheckpointError> {
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{Chunk, Job, StageName, UnitState};
    use tempfile::TempDir;

    fn sample(id: &str) -> CheckpointRecord {
        let id = JobId::parse(id).unwrap();
        let job = Job::new(id, "pkg.pdf".into(), "pkg.pdf".into(), "ab".repeat(32));
        let mut record = CheckpointRecord::new(job);
        record.chunks = Chunk::plan(90, 30, Path::new("pkg.pdf"));
        record.set_unit(StageName::Split, 0, UnitState::Completed);
        record.complete_stage(StageName::Split);
        record.sequence = 1;
        record
    }

    #[tokio::test]
    async fn save_then_load_returns_same_record() {
        let dir = TempDir::new().unwrap();
        let store = FileCheckpointStore::new(dir.path());
        let record = sample("pkg-01");
        store.save(&record).await.unwrap();

        let fresh = FileCheckpointStore::new(dir.path());
        let loaded = fresh.load(&record.job.id).await.unwrap().unwrap();
        assert_eq!(loaded, record);
        assert!(!dir.path().join("pkg-01.json.tmp").exists());
    }

    #[tokio::test]
    async fn write_atomic_replaces_and_leaves_no_temp_file() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("deep").join("artifact.json");
        write_atomic(&path, b"first").await.unwrap();
        write_atomic(&path, b"second").await.unwrap();

        assert_eq!(std::fs::read(&path).unwrap(), b"second");
        let names: Vec<_> = std::fs::read_dir(path.parent().unwrap())
            .unwrap()
            .map(|e| e.unwrap().file_name())
            .collect();
        assert_eq!(names, vec![std::ffi::OsString::from("artifact.json")]);
    }

    #[tokio::test]
    async fn missing_checkpoint_is_none() {
        let dir = TempDir::new().unwrap();
        let store = FileCheckpointStore::new(dir.path().join("nested"));
        let id = JobId::parse("nothing").unwrap();
        assert!(store.load(&id).await.unwrap().is_none());
        assert!(store.list().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn out_of_order_save_is_rejected() {
        let dir = TempDir::new().unwrap();
        let store = FileCheckpointStore::new(dir.path());
        let mut record = sample("pkg-02");
        record.sequence = 5;
        store.save(&record).await.unwrap();

        record.sequence = 5;
        let err = store.save(&record).await.unwrap_err();
        assert!(matches!(err, CheckpointError::OutOfOrder { last: 5, attempted: 5, .. }));
        record.sequence = 6;
        store.save(&record).await.unwrap();
    }

    #[tokio::test]
    async fn truncated_file_is_corrupt() {
        let dir = TempDir::new().unwrap();
        let store = FileCheckpointStore::new(dir.path());
        let record = sample("pkg-03");
        store.save(&record).await.unwrap();

        let path = store.path_for(&record.job.id);
        let bytes = std::fs::read(&path).unwrap();
        std::fs::write(&path, &bytes[..bytes.len() / 2]).unwrap();

        let err = FileCheckpointStore::new(dir.path())
            .load(&record.job.id)
            .await
            .unwrap_err();
        assert!(matches!(err, CheckpointError::Corrupt { .. }), "got: {err}");
    }

    #[tokio::test]
    async fn edited_record_fails_digest() {
        let dir = TempDir::new().unwrap();
        let store = FileCheckpointStore::new(dir.path());
        let record = sample("pkg-04");
        store.save(&record).await.unwrap();

        let path = store.path_for(&record.job.id);
        let text = std::fs::read_to_string(&path).unwrap();
        std::fs::write(&path, text.replace("\"pending\"", "\"completed\"")).unwrap();

        let err = FileCheckpointStore::new(dir.path())
            .load(&record.job.id)
            .await
            .unwrap_err();
        match err {
            CheckpointError::Corrupt { detail, .. } => {
                assert!(detail.contains("digest"), "got: {detail}")
            }
            other => panic!("unexpected error: {other}"),
        }
    }

    #[tokio::test]
    async fn unknown_schema_is_corrupt() {
        let dir = TempDir::new().unwrap();
        let store = FileCheckpointStore::new(dir.path());
        let id = JobId::parse("pkg-05").unwrap();
        std::fs::write(
            store.path_for(&id),
            r#"{"schema":99,"sequence":1,"digest":"00","record":{}}"#,
        )
        .unwrap();
        let err = store.load(&id).await.unwrap_err();
        assert!(err.to_string().contains("schema"), "got: {err}");
    }

    #[tokio::test]
    async fn stale_file_after_newer_save_is_rejected() {
        let dir = TempDir::new().unwrap();
        let store = FileCheckpointStore::new(dir.path());
        let mut record = sample("pkg-06");
        store.save(&record).await.unwrap();
        let path = store.path_for(&record.job.id);
        let old = std::fs::read(&path).unwrap();

        record.sequence = 2;
        store.save(&record).await.unwrap();
        std::fs::write(&path, old).unwrap();

        let err = store.load(&record.job.id).await.unwrap_err();
        assert!(err.to_string().contains("stale"), "got: {err}");
    }

    #[tokio::test]
    async fn list_and_remove() {
        let dir = TempDir::new().unwrap();
        let store = FileCheckpointStore::new(dir.path());
        store.save(&sample("b-job")).await.unwrap();
        store.save(&sample("a-job")).await.unwrap();
        std::fs::write(dir.path().join("broken.json"), b"{").unwrap();

        let ids: Vec<String> = store
            .list()
            .await
            .unwrap()
            .into_iter()
            .map(|r| r.job.id.to_string())
            .collect();
        assert_eq!(ids, vec!["a-job", "b-job"]);

        let id = JobId::parse("a-job").unwrap();
        assert!(store.remove(&id).await.unwrap());
        assert!(!store.remove(&id).await.unwrap());
        assert!(store.load(&id).await.unwrap().is_none());
    }
}
