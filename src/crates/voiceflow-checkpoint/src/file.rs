//! File-backed checkpoint store
//!
//! Local fallback for deployments without a managed key-value table.
//!
//! ```text
//! {root}/
//!   {session_id}/
//!     checkpoints/{checkpoint_id}.json   one file per record
//!     wal.jsonl                          pending batch, one record per line
//! ```
//!
//! `persist` appends the whole batch to `wal.jsonl` and syncs it, writes
//! each record file, then removes the log. A crash between those steps
//! leaves the log behind; [`recover`](CheckpointStore::recover) replays it
//! and compacts it away.

use crate::{
    error::{CheckpointError, Result},
    record::CheckpointRecord,
    serializer::{JsonSerializer, SerializerProtocol},
    traits::CheckpointStore,
};
use async_trait::async_trait;
use std::path::{Path, PathBuf};
use std::time::SystemTime;
use tokio::fs;
use tokio::io::AsyncWriteExt;
use tracing::{debug, warn};

const WAL_FILE: &str = "wal.jsonl";
const CHECKPOINT_DIR: &str = "checkpoints";

/// Reject identifiers that would escape their directory
pub fn validate_path_component(kind: &str, value: &str) -> Result<()> {
    if value.is_empty()
        || value == "."
        || value == ".."
        || value.contains(|c: char| c == '/' || c == '\\' || c == '\0')
    {
        return Err(CheckpointError::Invalid(format!(
            "{} is not a valid path component: {:?}",
            kind, value
        )));
    }
    Ok(())
}

/// Checkpoint store writing one file per record
#[derive(Debug, Clone)]
pub struct FileCheckpointStore<S = JsonSerializer> {
    root: PathBuf,
    serializer: S,
}

impl FileCheckpointStore<JsonSerializer> {
    /// Store rooted at `root`, using pretty JSON for record files
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self::with_serializer(root, JsonSerializer::pretty())
    }
}

impl<S: SerializerProtocol> FileCheckpointStore<S> {
    pub fn with_serializer(root: impl Into<PathBuf>, serializer: S) -> Self {
        Self {
            root: root.into(),
            serializer,
        }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    fn session_dir(&self, session_id: &str) -> Result<PathBuf> {
        validate_path_component("session_id", session_id)?;
        Ok(self.root.join(session_id))
    }

    fn wal_path(&self, session_id: &str) -> Result<PathBuf> {
        Ok(self.session_dir(session_id)?.join(WAL_FILE))
    }

    fn checkpoint_path(&self, session_id: &str, checkpoint_id: &str) -> Result<PathBuf> {
        validate_path_component("checkpoint_id", checkpoint_id)?;
        Ok(self
            .session_dir(session_id)?
            .join(CHECKPOINT_DIR)
            .join(format!("{}.{}", checkpoint_id, self.serializer.extension())))
    }

    async fn append_wal(&self, session_id: &str, records: &[&CheckpointRecord]) -> Result<()> {
        let path = self.wal_path(session_id)?;
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).await?;
        }

        let mut buf = Vec::new();
        for record in records {
            serde_json::to_writer(&mut buf, record)?;
            buf.push(b'\n');
        }

        let mut file = fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&path)
            .await?;
        file.write_all(&buf).await?;
        file.sync_all().await?;
        Ok(())
    }

    async fn write_record(&self, record: &CheckpointRecord) -> Result<()> {
        let path = self.checkpoint_path(&record.session_id, &record.checkpoint_id)?;
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).await?;
        }
        let bytes = self.serializer.dumps(record)?;
        fs::write(&path, bytes).await?;
        Ok(())
    }

    async fn remove_wal(&self, session_id: &str) -> Result<()> {
        let path = self.wal_path(session_id)?;
        match fs::remove_file(&path).await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }
}

#[async_trait]
impl<S: SerializerProtocol + std::fmt::Debug + 'static> CheckpointStore for FileCheckpointStore<S> {
    async fn persist(&self, records: &[CheckpointRecord]) -> Result<()> {
        // Group by session so each log stays local to its partition
        let mut sessions: Vec<&str> = records.iter().map(|r| r.session_id.as_str()).collect();
        sessions.sort_unstable();
        sessions.dedup();

        for session_id in sessions {
            let batch: Vec<&CheckpointRecord> = records
                .iter()
                .filter(|r| r.session_id == session_id)
                .collect();

            self.append_wal(session_id, &batch).await?;
            for record in &batch {
                self.write_record(record).await?;
            }
            self.remove_wal(session_id).await?;
            debug!(session_id, count = batch.len(), "Persisted checkpoint batch");
        }
        Ok(())
    }

    async fn load(
        &self,
        session_id: &str,
        checkpoint_id: &str,
    ) -> Result<Option<CheckpointRecord>> {
        let path = self.checkpoint_path(session_id, checkpoint_id)?;
        match fs::read(&path).await {
            Ok(bytes) => Ok(Some(self.serializer.loads(&bytes)?)),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    async fn delete(&self, session_id: &str, checkpoint_id: &str) -> Result<bool> {
        let path = self.checkpoint_path(session_id, checkpoint_id)?;
        match fs::remove_file(&path).await {
            Ok(()) => Ok(true),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(false),
            Err(e) => Err(e.into()),
        }
    }

    async fn list_ids(&self, session_id: &str) -> Result<Vec<String>> {
        let dir = self.session_dir(session_id)?.join(CHECKPOINT_DIR);
        let mut entries = match fs::read_dir(&dir).await {
            Ok(entries) => entries,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(e.into()),
        };

        let suffix = format!(".{}", self.serializer.extension());
        let mut found: Vec<(SystemTime, String)> = Vec::new();
        while let Some(entry) = entries.next_entry().await? {
            let name = entry.file_name().to_string_lossy().into_owned();
            let Some(id) = name.strip_suffix(&suffix) else {
                continue;
            };
            let modified = entry
                .metadata()
                .await?
                .modified()
                .unwrap_or(SystemTime::UNIX_EPOCH);
            found.push((modified, id.to_string()));
        }

        found.sort();
        Ok(found.into_iter().map(|(_, id)| id).collect())
    }

    async fn recover(&self, session_id: &str) -> Result<Vec<CheckpointRecord>> {
        let path = self.wal_path(session_id)?;
        let content = match fs::read_to_string(&path).await {
            Ok(content) => content,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(e.into()),
        };

        let mut recovered = Vec::new();
        for (line_no, line) in content.lines().enumerate() {
            if line.trim().is_empty() {
                continue;
            }
            match serde_json::from_str::<CheckpointRecord>(line) {
                Ok(record) => recovered.push(record),
                // A torn final line is expected after a crash mid-append
                Err(e) => warn!(session_id, line_no, error = %e, "Skipping unreadable WAL entry"),
            }
        }

        for record in &recovered {
            self.write_record(record).await?;
        }
        self.remove_wal(session_id).await?;
        debug!(session_id, count = recovered.len(), "Replayed checkpoint WAL");
        Ok(recovered)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use tempfile::TempDir;

    fn record(session: &str, id: &str, n: i64) -> CheckpointRecord {
        CheckpointRecord::new(session, id, json!({ "n": n }), json!({"source": "test"}), 1)
    }

    #[tokio::test]
    async fn test_persist_and_load() {
        let dir = TempDir::new().unwrap();
        let store = FileCheckpointStore::new(dir.path());

        store.persist(&[record("call-1", "cp_1", 1)]).await.unwrap();

        let loaded = store.load("call-1", "cp_1").await.unwrap().unwrap();
        assert_eq!(loaded.state, json!({"n": 1}));
        assert!(!dir.path().join("call-1").join(WAL_FILE).exists());
    }

    #[tokio::test]
    async fn test_load_missing_is_none() {
        let dir = TempDir::new().unwrap();
        let store = FileCheckpointStore::new(dir.path());
        assert!(store.load("call-1", "nope").await.unwrap().is_none());
        assert!(store.list_ids("call-1").await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_list_ids_and_delete() {
        let dir = TempDir::new().unwrap();
        let store = FileCheckpointStore::new(dir.path());
        store
            .persist(&[record("call-1", "a", 1), record("call-1", "b", 2)])
            .await
            .unwrap();

        let mut ids = store.list_ids("call-1").await.unwrap();
        ids.sort();
        assert_eq!(ids, vec!["a", "b"]);

        assert!(store.delete("call-1", "a").await.unwrap());
        assert!(!store.delete("call-1", "a").await.unwrap());
        assert_eq!(store.list_ids("call-1").await.unwrap(), vec!["b"]);
    }

    #[tokio::test]
    async fn test_recover_replays_leftover_wal() {
        let dir = TempDir::new().unwrap();
        let store = FileCheckpointStore::new(dir.path());

        // Simulate a crash after the log append but before record files
        let session_dir = dir.path().join("call-1");
        std::fs::create_dir_all(&session_dir).unwrap();
        let mut wal = serde_json::to_string(&record("call-1", "cp_9", 9)).unwrap();
        wal.push('\n');
        wal.push_str("{\"torn\":");
        std::fs::write(session_dir.join(WAL_FILE), wal).unwrap();

        let recovered = store.recover("call-1").await.unwrap();
        assert_eq!(recovered.len(), 1);
        assert!(store.load("call-1", "cp_9").await.unwrap().is_some());
        assert!(!session_dir.join(WAL_FILE).exists());
    }

    #[tokio::test]
    async fn test_rejects_path_traversal() {
        let dir = TempDir::new().unwrap();
        let store = FileCheckpointStore::new(dir.path());

        let err = store.load("../etc", "passwd").await.unwrap_err();
        assert!(matches!(err, CheckpointError::Invalid(_)));
        let err = store.load("call-1", "a/b").await.unwrap_err();
        assert!(matches!(err, CheckpointError::Invalid(_)));
    }
}
