//! Persistent state: the single "latest" baseline and the history of diff artifacts.

use std::fmt;
use std::fs::{self, OpenOptions};
use std::io::{ErrorKind, Write};
use std::path::{Path, PathBuf};

use chrono::{DateTime, NaiveDateTime, TimeZone, Utc};
use serde_json::Value;

use crate::codec::{self, RasterImage};
use crate::error::{Error, Result};
use crate::util::{ensure_parent_dir, write_json_pretty};

const LATEST_FILE: &str = "latest.png";
const HISTORY_DIR: &str = "history";
const LOCK_FILE: &str = ".cycle.lock";

/// Timestamp-derived history identifier, e.g. `20261017-093015-042`.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord)]
pub struct SnapshotId {
    millis: i64,
    text: String,
}

impl SnapshotId {
    fn from_millis(millis: i64) -> Self {
        let ts = Utc
            .timestamp_millis_opt(millis)
            .single()
            .unwrap_or_else(Utc::now);
        let text = format!(
            "{}-{:03}",
            ts.format("%Y%m%d-%H%M%S"),
            ts.timestamp_subsec_millis()
        );
        Self { millis, text }
    }

    pub fn parse(raw: &str) -> Option<Self> {
        let (stamp, millis) = raw.rsplit_once('-')?;
        if millis.len() != 3 {
            return None;
        }
        let millis: i64 = millis.parse().ok()?;
        let naive = NaiveDateTime::parse_from_str(stamp, "%Y%m%d-%H%M%S").ok()?;
        let total = Utc.from_utc_datetime(&naive).timestamp_millis() + millis;
        Some(Self::from_millis(total))
    }

    pub fn as_str(&self) -> &str {
        &self.text
    }

    pub fn created_at(&self) -> DateTime<Utc> {
        Utc.timestamp_millis_opt(self.millis)
            .single()
            .unwrap_or_else(Utc::now)
    }
}

impl fmt::Display for SnapshotId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.text)
    }
}

/// Hands out strictly increasing ids even when the clock stalls or steps back.
#[derive(Debug, Default, Clone)]
pub struct IdClock {
    last_millis: Option<i64>,
}

impl IdClock {
    pub fn starting_after(last: Option<&SnapshotId>) -> Self {
        Self {
            last_millis: last.map(|id| id.millis),
        }
    }

    pub fn next(&mut self, now: DateTime<Utc>) -> SnapshotId {
        let mut millis = now.timestamp_millis();
        if let Some(last) = self.last_millis {
            if millis <= last {
                millis = last + 1;
            }
        }
        self.last_millis = Some(millis);
        SnapshotId::from_millis(millis)
    }
}

/// The only persistent state the change-detection cycle depends on.
pub trait Storage {
    fn read_latest(&self) -> Result<Option<RasterImage>>;

    fn write_latest(&mut self, image: &RasterImage) -> Result<()>;

    /// Stores an encoded overlay and returns a reference to it.
    fn append_history(&mut self, id: &SnapshotId, overlay_png: &[u8]) -> Result<String>;

    fn append_report(&mut self, _id: &SnapshotId, _report: &Value) -> Result<()> {
        Ok(())
    }

    /// Drops the overlay and report stored under `id`. Missing entries are not an error.
    fn remove_history(&mut self, id: &SnapshotId) -> Result<()>;

    fn next_id(&mut self, now: DateTime<Utc>) -> SnapshotId;

    fn latest_ref(&self) -> String;

    /// Cross-process guard held for the duration of one cycle, if the backend needs one.
    fn lock_cycle(&self) -> Result<Option<CycleLock>> {
        Ok(None)
    }
}

#[derive(Debug)]
pub struct FsStorage {
    root: PathBuf,
    clock: IdClock,
}

impl FsStorage {
    pub fn open(root: impl Into<PathBuf>) -> Result<Self> {
        let root = root.into();
        let history = root.join(HISTORY_DIR);
        fs::create_dir_all(&history).map_err(|e| Error::storage(&history, e))?;

        let probe = root.join(".write_test");
        fs::write(&probe, b"ok").map_err(|e| Error::storage(&probe, e))?;
        if let Err(err) = fs::remove_file(&probe) {
            log::warn!("failed to remove probe {}: {}", probe.display(), err);
        }

        let last = last_history_id(&history)?;
        if let Some(id) = &last {
            log::debug!("resuming snapshot ids after {}", id);
        }

        Ok(Self {
            root,
            clock: IdClock::starting_after(last.as_ref()),
        })
    }

    pub fn latest_path(&self) -> PathBuf {
        self.root.join(LATEST_FILE)
    }

    pub fn history_dir(&self) -> PathBuf {
        self.root.join(HISTORY_DIR)
    }

    /// Exclusive guard for one cycle; fails if another process holds it.
    pub fn lock(&self) -> Result<CycleLock> {
        CycleLock::acquire(self.root.join(LOCK_FILE))
    }
}

fn last_history_id(history: &Path) -> Result<Option<SnapshotId>> {
    let entries = fs::read_dir(history).map_err(|e| Error::storage(history, e))?;
    let mut last: Option<SnapshotId> = None;
    for entry in entries {
        let entry = entry.map_err(|e| Error::storage(history, e))?;
        let path = entry.path();
        let Some(stem) = path.file_stem().and_then(|s| s.to_str()) else {
            continue;
        };
        if let Some(id) = SnapshotId::parse(stem) {
            if last.as_ref().map_or(true, |l| id > *l) {
                last = Some(id);
            }
        }
    }
    Ok(last)
}

impl Storage for FsStorage {
    fn read_latest(&self) -> Result<Option<RasterImage>> {
        let path = self.latest_path();
        if !path.exists() {
            return Ok(None);
        }
        codec::decode_file(&path).map(Some)
    }

    fn write_latest(&mut self, image: &RasterImage) -> Result<()> {
        let bytes = codec::encode(image)?;
        let path = self.latest_path();
        let tmp = self.root.join(format!("{LATEST_FILE}.tmp"));
        ensure_parent_dir(&path)?;
        fs::write(&tmp, &bytes).map_err(|e| Error::storage(&tmp, e))?;
        fs::rename(&tmp, &path).map_err(|e| Error::storage(&path, e))?;
        log::debug!("latest baseline replaced: {}", path.display());
        Ok(())
    }

    fn append_history(&mut self, id: &SnapshotId, overlay_png: &[u8]) -> Result<String> {
        let path = self.history_dir().join(format!("{id}.png"));
        ensure_parent_dir(&path)?;
        fs::write(&path, overlay_png).map_err(|e| Error::storage(&path, e))?;
        Ok(path.display().to_string())
    }

    fn append_report(&mut self, id: &SnapshotId, report: &Value) -> Result<()> {
        write_json_pretty(&self.history_dir().join(format!("{id}.json")), report)
    }

    fn remove_history(&mut self, id: &SnapshotId) -> Result<()> {
        for ext in ["png", "json"] {
            let path = self.history_dir().join(format!("{id}.{ext}"));
            match fs::remove_file(&path) {
                Ok(()) => {}
                Err(err) if err.kind() == ErrorKind::NotFound => {}
                Err(err) => return Err(Error::storage(&path, err)),
            }
        }
        Ok(())
    }

    fn next_id(&mut self, now: DateTime<Utc>) -> SnapshotId {
        self.clock.next(now)
    }

    fn latest_ref(&self) -> String {
        self.latest_path().display().to_string()
    }

    fn lock_cycle(&self) -> Result<Option<CycleLock>> {
        self.lock().map(Some)
    }
}

/// Removes the lock file when dropped.
#[derive(Debug)]
pub struct CycleLock {
    path: PathBuf,
}

impl CycleLock {
    fn acquire(path: PathBuf) -> Result<Self> {
        match OpenOptions::new().write(true).create_new(true).open(&path) {
            Ok(mut file) => {
                if let Err(err) = writeln!(file, "{}", std::process::id()) {
                    log::warn!("failed to write pid into {}: {}", path.display(), err);
                }
                Ok(Self { path })
            }
            Err(err) if err.kind() == ErrorKind::AlreadyExists => Err(Error::CycleInProgress(path)),
            Err(err) => Err(Error::storage(&path, err)),
        }
    }
}

impl Drop for CycleLock {
    fn drop(&mut self) {
        if let Err(err) = fs::remove_file(&self.path) {
            log::warn!("failed to release {}: {}", self.path.display(), err);
        }
    }
}

/// Keeps everything in process; used for embedding and tests.
#[derive(Debug, Default)]
pub struct MemoryStorage {
    latest: Option<RasterImage>,
    history: Vec<(SnapshotId, Vec<u8>)>,
    reports: Vec<(SnapshotId, Value)>,
    clock: IdClock,
}

impl MemoryStorage {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn latest(&self) -> Option<&RasterImage> {
        self.latest.as_ref()
    }

    pub fn history(&self) -> &[(SnapshotId, Vec<u8>)] {
        &self.history
    }

    pub fn reports(&self) -> &[(SnapshotId, Value)] {
        &self.reports
    }
}

impl Storage for MemoryStorage {
    fn read_latest(&self) -> Result<Option<RasterImage>> {
        Ok(self.latest.clone())
    }

    fn write_latest(&mut self, image: &RasterImage) -> Result<()> {
        self.latest = Some(image.clone());
        Ok(())
    }

    fn append_history(&mut self, id: &SnapshotId, overlay_png: &[u8]) -> Result<String> {
        self.history.push((id.clone(), overlay_png.to_vec()));
        Ok(format!("memory://history/{id}"))
    }

    fn append_report(&mut self, id: &SnapshotId, report: &Value) -> Result<()> {
        self.reports.push((id.clone(), report.clone()));
        Ok(())
    }

    fn remove_history(&mut self, id: &SnapshotId) -> Result<()> {
        self.history.retain(|(entry, _)| entry != id);
        self.reports.retain(|(entry, _)| entry != id);
        Ok(())
    }

    fn next_id(&mut self, now: DateTime<Utc>) -> SnapshotId {
        self.clock.next(now)
    }

    fn latest_ref(&self) -> String {
        "memory://latest".to_string()
    }
}
