use std::fmt;
use std::io::{self, Write};
use std::path::{Path, PathBuf};

use chrono::Utc;
use serde::{Deserialize, Serialize};
use tempfile::NamedTempFile;
use thiserror::Error;
use tracing::debug;

use crate::quality::Quality;

#[derive(Debug, Error)]
pub enum RegistryError {
    #[error("failed to read registry {path}: {source}")]
    Read { source: io::Error, path: PathBuf },
    #[error("failed to parse registry {path}: {source}")]
    Parse {
        source: serde_json::Error,
        path: PathBuf,
    },
    #[error("failed to persist registry {path}: {source}")]
    Persist { source: io::Error, path: PathBuf },
    #[error("invalid stream status: {0}")]
    InvalidStatus(String),
    #[error("stream record not found: {0}")]
    NotFound(u64),
}

pub type RegistryResult<T> = Result<T, RegistryError>;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum StreamStatus {
    #[default]
    Waiting,
    Running,
    Stopped,
    Finished,
}

impl StreamStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            StreamStatus::Waiting => "Waiting",
            StreamStatus::Running => "Running",
            StreamStatus::Stopped => "Stopped",
            StreamStatus::Finished => "Finished",
        }
    }

    /// Terminal until an explicit re-arm by the operator.
    pub fn is_terminal(&self) -> bool {
        matches!(self, StreamStatus::Stopped | StreamStatus::Finished)
    }
}

impl fmt::Display for StreamStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl std::str::FromStr for StreamStatus {
    type Err = RegistryError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "Waiting" => Ok(Self::Waiting),
            "Running" => Ok(Self::Running),
            "Stopped" => Ok(Self::Stopped),
            "Finished" => Ok(Self::Finished),
            other => Err(RegistryError::InvalidStatus(other.to_string())),
        }
    }
}

/// Shortens an ingest key for logs and listings. The full key never leaves
/// the registry file and the encoder command line.
pub fn mask_key(key: &str) -> String {
    let prefix: String = key.chars().take(8).collect();
    format!("{prefix}****")
}

/// One configured stream job. Field names follow the legacy on-disk columns
/// so existing registry files keep loading; missing optional columns
/// back-fill serde defaults.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StreamRecord {
    #[serde(rename = "Id", default)]
    pub id: u64,
    #[serde(rename = "Video")]
    pub media_path: String,
    #[serde(rename = "Streaming Key")]
    pub ingest_key: String,
    /// "NOW", "HH:MM <label>", or the actual start stamp once launched.
    #[serde(rename = "Jam Mulai")]
    pub start_at: String,
    #[serde(rename = "Status", default)]
    pub status: StreamStatus,
    #[serde(rename = "PID", default)]
    pub pid: u32,
    #[serde(rename = "Is Shorts", default)]
    pub is_shorts: bool,
    #[serde(rename = "Quality", default)]
    pub quality: Quality,
    #[serde(rename = "Broadcast ID", default)]
    pub broadcast_ref: String,
    #[serde(rename = "Channel", default = "default_channel")]
    pub channel: String,
}

fn default_channel() -> String {
    "default".to_string()
}

impl StreamRecord {
    pub fn masked_key(&self) -> String {
        mask_key(&self.ingest_key)
    }

    pub fn has_broadcast(&self) -> bool {
        !self.broadcast_ref.is_empty()
    }
}

#[derive(Debug, Serialize, Deserialize)]
struct RegistrySnapshot {
    streams: Vec<StreamRecord>,
    #[serde(default)]
    last_updated: Option<String>,
}

/// Durable table of stream records, insertion-ordered. The file on disk is
/// the single source of truth across restarts; every status-affecting
/// mutation is followed by a synchronous [`persist`](Self::persist).
#[derive(Debug)]
pub struct StreamRegistry {
    path: PathBuf,
    streams: Vec<StreamRecord>,
    next_id: u64,
}

impl StreamRegistry {
    /// Loads the registry, treating a missing file as empty. Records from
    /// legacy files without an `Id` column get fresh ids here, once.
    pub fn load(path: impl AsRef<Path>) -> RegistryResult<Self> {
        let path = path.as_ref().to_path_buf();
        if !path.exists() {
            debug!(path = %path.display(), "registry file missing, starting empty");
            return Ok(Self {
                path,
                streams: Vec::new(),
                next_id: 1,
            });
        }
        let content = std::fs::read_to_string(&path).map_err(|source| RegistryError::Read {
            source,
            path: path.clone(),
        })?;
        let snapshot: RegistrySnapshot =
            serde_json::from_str(&content).map_err(|source| RegistryError::Parse {
                source,
                path: path.clone(),
            })?;
        let mut streams = snapshot.streams;
        let mut max_id = streams.iter().map(|record| record.id).max().unwrap_or(0);
        for record in streams.iter_mut().filter(|record| record.id == 0) {
            max_id += 1;
            record.id = max_id;
        }
        Ok(Self {
            path,
            streams,
            next_id: max_id + 1,
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn list(&self) -> &[StreamRecord] {
        &self.streams
    }

    pub fn len(&self) -> usize {
        self.streams.len()
    }

    pub fn is_empty(&self) -> bool {
        self.streams.is_empty()
    }

    pub fn get(&self, id: u64) -> Option<&StreamRecord> {
        self.streams.iter().find(|record| record.id == id)
    }

    pub fn get_mut(&mut self, id: u64) -> Option<&mut StreamRecord> {
        self.streams.iter_mut().find(|record| record.id == id)
    }

    /// Inserts a new record, assigning the next stable id.
    pub fn add(&mut self, mut record: StreamRecord) -> u64 {
        record.id = self.next_id;
        self.next_id += 1;
        let id = record.id;
        self.streams.push(record);
        id
    }

    /// Replaces the record with the same id, or appends it.
    pub fn upsert(&mut self, record: StreamRecord) {
        if let Some(existing) = self.get_mut(record.id) {
            *existing = record;
        } else {
            self.next_id = self.next_id.max(record.id + 1);
            self.streams.push(record);
        }
    }

    pub fn remove(&mut self, id: u64) -> RegistryResult<StreamRecord> {
        let position = self
            .streams
            .iter()
            .position(|record| record.id == id)
            .ok_or(RegistryError::NotFound(id))?;
        Ok(self.streams.remove(position))
    }

    /// Records persisted as `Running` have no live process after a restart;
    /// mark them `Stopped` so the operator re-arms explicitly.
    pub fn reconcile_orphans(&mut self) -> usize {
        let mut count = 0;
        for record in &mut self.streams {
            if record.status == StreamStatus::Running {
                record.status = StreamStatus::Stopped;
                record.pid = 0;
                count += 1;
            }
        }
        count
    }

    /// Atomic full-snapshot write: temp file in the same directory, then
    /// rename over the target. A crash never leaves a partial file.
    pub fn persist(&self) -> RegistryResult<()> {
        self.persist_to(&self.path)
    }

    pub fn persist_to(&self, path: &Path) -> RegistryResult<()> {
        let persist_err = |source: io::Error| RegistryError::Persist {
            source,
            path: path.to_path_buf(),
        };
        let parent = path.parent().unwrap_or_else(|| Path::new("."));
        std::fs::create_dir_all(parent).map_err(persist_err)?;
        let snapshot = RegistrySnapshot {
            streams: self.streams.clone(),
            last_updated: Some(Utc::now().to_rfc3339()),
        };
        let json = serde_json::to_string_pretty(&snapshot).map_err(|source| {
            persist_err(io::Error::new(io::ErrorKind::InvalidData, source))
        })?;
        let mut temp = NamedTempFile::new_in(parent).map_err(persist_err)?;
        temp.write_all(json.as_bytes()).map_err(persist_err)?;
        temp.write_all(b"\n").map_err(persist_err)?;
        temp.persist(path).map_err(|error| persist_err(error.error))?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn record(media: &str) -> StreamRecord {
        StreamRecord {
            id: 0,
            media_path: media.to_string(),
            ingest_key: "abcd1234efgh5678".to_string(),
            start_at: "NOW".to_string(),
            status: StreamStatus::Waiting,
            pid: 0,
            is_shorts: false,
            quality: Quality::Q720,
            broadcast_ref: String::new(),
            channel: "default".to_string(),
        }
    }

    #[test]
    fn missing_file_loads_empty() {
        let dir = TempDir::new().unwrap();
        let registry = StreamRegistry::load(dir.path().join("streams.json")).unwrap();
        assert!(registry.is_empty());
    }

    #[test]
    fn round_trips_all_fields() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("streams.json");
        let mut registry = StreamRegistry::load(&path).unwrap();
        let mut first = record("a.mp4");
        first.quality = Quality::Q1080;
        first.broadcast_ref = "bc-1".to_string();
        first.channel = "gaming".to_string();
        first.is_shorts = true;
        let mut second = record("b.mp4");
        second.start_at = "07:30 WIB".to_string();
        second.status = StreamStatus::Finished;
        registry.add(first);
        registry.add(second);
        registry.persist().unwrap();

        let reloaded = StreamRegistry::load(&path).unwrap();
        assert_eq!(reloaded.list(), registry.list());
    }

    #[test]
    fn legacy_rows_back_fill_defaults() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("streams.json");
        std::fs::write(
            &path,
            r#"{"streams": [
                {"Video": "old.mp4", "Streaming Key": "k", "Jam Mulai": "NOW"},
                {"Video": "new.mp4", "Streaming Key": "k2", "Jam Mulai": "08:00 WIB",
                 "Status": "Running", "PID": 4242, "Quality": "1080p",
                 "Broadcast ID": "bc-9", "Channel": "music"}
            ]}"#,
        )
        .unwrap();

        let registry = StreamRegistry::load(&path).unwrap();
        let old = &registry.list()[0];
        assert_eq!(old.status, StreamStatus::Waiting);
        assert_eq!(old.pid, 0);
        assert_eq!(old.quality, Quality::Q720);
        assert_eq!(old.broadcast_ref, "");
        assert_eq!(old.channel, "default");
        assert!(!old.is_shorts);

        let new = &registry.list()[1];
        assert_eq!(new.status, StreamStatus::Running);
        assert_eq!(new.pid, 4242);
        assert_eq!(new.quality, Quality::Q1080);
    }

    #[test]
    fn legacy_rows_without_ids_get_distinct_ids() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("streams.json");
        std::fs::write(
            &path,
            r#"{"streams": [
                {"Video": "a.mp4", "Streaming Key": "k", "Jam Mulai": "NOW"},
                {"Video": "b.mp4", "Streaming Key": "k", "Jam Mulai": "NOW"},
                {"Id": 7, "Video": "c.mp4", "Streaming Key": "k", "Jam Mulai": "NOW"}
            ]}"#,
        )
        .unwrap();

        let mut registry = StreamRegistry::load(&path).unwrap();
        let ids: Vec<u64> = registry.list().iter().map(|r| r.id).collect();
        assert_eq!(ids, vec![8, 9, 7]);
        let fresh = registry.add(record("d.mp4"));
        assert_eq!(fresh, 10);
    }

    #[test]
    fn remove_unknown_id_errors() {
        let dir = TempDir::new().unwrap();
        let mut registry = StreamRegistry::load(dir.path().join("s.json")).unwrap();
        assert!(matches!(registry.remove(3), Err(RegistryError::NotFound(3))));
    }

    #[test]
    fn reconcile_orphans_marks_running_rows_stopped() {
        let dir = TempDir::new().unwrap();
        let mut registry = StreamRegistry::load(dir.path().join("s.json")).unwrap();
        let mut running = record("a.mp4");
        running.status = StreamStatus::Running;
        running.pid = 999;
        registry.add(running);
        registry.add(record("b.mp4"));

        assert_eq!(registry.reconcile_orphans(), 1);
        assert_eq!(registry.list()[0].status, StreamStatus::Stopped);
        assert_eq!(registry.list()[0].pid, 0);
        assert_eq!(registry.list()[1].status, StreamStatus::Waiting);
    }

    #[test]
    fn masked_key_keeps_prefix_only() {
        assert_eq!(mask_key("abcd1234efgh"), "abcd1234****");
        assert_eq!(mask_key("ab"), "ab****");
    }
}
