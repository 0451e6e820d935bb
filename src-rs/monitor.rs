//! One comparison cycle against the stored baseline.
//!
//! ```text
//! NoBaseline ──capture──▶ BaselineEstablished ──capture──▶ BaselineEstablished
//!                          (no change event)      (unchanged: latest replaced)
//!                                                 (changed: overlay recorded, latest replaced)
//! ```
//!
//! A cycle that fails to decode or validate never touches the baseline.

use chrono::{DateTime, Utc};
use serde::Serialize;
use serde_json::json;

use crate::codec::{self, RasterImage};
use crate::config::DiffConfig;
use crate::decision::{decide, ChangeSummary};
use crate::error::Result;
use crate::overlay;
use crate::storage::{SnapshotId, Storage};
use crate::tiles::{self, DiffResult};

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SnapshotRecord {
    pub id: String,
    pub created_at: DateTime<Utc>,
    /// Set only when a change was recorded.
    pub diff_ref: Option<String>,
    pub latest_ref: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CycleOutcome {
    BaselineEstablished {
        record: SnapshotRecord,
    },
    Unchanged {
        record: SnapshotRecord,
        summary: ChangeSummary,
    },
    Changed {
        record: SnapshotRecord,
        summary: ChangeSummary,
        overlay_png: Vec<u8>,
    },
}

impl CycleOutcome {
    pub fn is_changed(&self) -> bool {
        matches!(self, CycleOutcome::Changed { .. })
    }

    pub fn record(&self) -> &SnapshotRecord {
        match self {
            CycleOutcome::BaselineEstablished { record }
            | CycleOutcome::Unchanged { record, .. }
            | CycleOutcome::Changed { record, .. } => record,
        }
    }

    pub fn label(&self) -> &'static str {
        match self {
            CycleOutcome::BaselineEstablished { .. } => "baseline_established",
            CycleOutcome::Unchanged { .. } => "unchanged",
            CycleOutcome::Changed { .. } => "changed",
        }
    }

    pub fn to_json(&self) -> serde_json::Value {
        let summary = match self {
            CycleOutcome::BaselineEstablished { .. } => None,
            CycleOutcome::Unchanged { summary, .. } | CycleOutcome::Changed { summary, .. } => {
                Some(summary)
            }
        };
        json!({
            "outcome": self.label(),
            "record": self.record(),
            "summary": summary,
        })
    }
}

/// Owns the baseline slot. Callers must not run two cycles at once against one storage.
#[derive(Debug)]
pub struct Monitor<S: Storage> {
    config: DiffConfig,
    storage: S,
}

impl<S: Storage> Monitor<S> {
    pub fn new(config: DiffConfig, storage: S) -> Self {
        Self { config, storage }
    }

    pub fn config(&self) -> &DiffConfig {
        &self.config
    }

    pub fn storage(&self) -> &S {
        &self.storage
    }

    /// Decodes the raw capture and runs one cycle.
    pub fn run_cycle(&mut self, capture: &[u8]) -> Result<CycleOutcome> {
        let current = codec::decode(capture, "capture")?;
        self.process(current)
    }

    pub fn process(&mut self, current: RasterImage) -> Result<CycleOutcome> {
        let Some(previous) = self.storage.read_latest()? else {
            let id = self.storage.next_id(Utc::now());
            self.storage.write_latest(&current)?;
            log::info!(
                "baseline established ({}x{}) at {}",
                current.width(),
                current.height(),
                self.storage.latest_ref()
            );
            return Ok(CycleOutcome::BaselineEstablished {
                record: self.record(&id, None),
            });
        };

        let result = tiles::diff(&previous, &current, &self.config)?;
        let summary = decide(&result);

        if !summary.changed {
            let id = self.storage.next_id(Utc::now());
            self.storage.write_latest(&current)?;
            log::info!("no change across {} tiles", result.tiles.len());
            return Ok(CycleOutcome::Unchanged {
                record: self.record(&id, None),
                summary,
            });
        }

        let overlay_image = overlay::render(&current, &result, &self.config);
        let overlay_png = codec::encode(&overlay_image)?;

        let id = self.storage.next_id(Utc::now());
        let diff_ref = self.storage.append_history(&id, &overlay_png)?;
        let report = build_report(&id, &self.config, &result, &summary);
        let promoted = self
            .storage
            .append_report(&id, &report)
            .and_then(|()| self.storage.write_latest(&current));
        if let Err(err) = promoted {
            // the change is detected again next cycle against the old baseline
            if let Err(rollback) = self.storage.remove_history(&id) {
                log::warn!("failed to roll back history entry {}: {}", id, rollback);
            }
            return Err(err);
        }

        log::info!(
            "change detected: {} tiles, {} px, recorded as {}",
            summary.changed_tile_count,
            summary.changed_area,
            diff_ref
        );

        Ok(CycleOutcome::Changed {
            record: self.record(&id, Some(diff_ref)),
            summary,
            overlay_png,
        })
    }

    fn record(&self, id: &SnapshotId, diff_ref: Option<String>) -> SnapshotRecord {
        SnapshotRecord {
            id: id.to_string(),
            created_at: id.created_at(),
            diff_ref,
            latest_ref: self.storage.latest_ref(),
        }
    }
}

fn build_report(
    id: &SnapshotId,
    config: &DiffConfig,
    result: &DiffResult,
    summary: &ChangeSummary,
) -> serde_json::Value {
    let changed: Vec<_> = result.changed_tiles().collect();
    json!({
        "id": id.as_str(),
        "created_at": id.created_at().to_rfc3339(),
        "size": {"width": result.width, "height": result.height},
        "config": config,
        "grid": {"cols": result.grid.cols, "rows": result.grid.rows},
        "summary": summary,
        "changed_tiles": changed,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::Error;
    use crate::storage::{FsStorage, MemoryStorage};
    use serde_json::Value;
    use std::io;
    use crate::tiles::tests::{red_block_pair, solid, with_block, RED, WHITE};

    fn png(image: &RasterImage) -> Vec<u8> {
        codec::encode(image).unwrap()
    }

    fn monitor() -> Monitor<MemoryStorage> {
        Monitor::new(
            DiffConfig::new(30, 50, 100, 0.35).unwrap(),
            MemoryStorage::new(),
        )
    }

    #[test]
    fn first_cycle_only_establishes_baseline() {
        let (_, after) = red_block_pair();
        let mut monitor = monitor();
        let outcome = monitor.run_cycle(&png(&after)).unwrap();

        assert!(matches!(outcome, CycleOutcome::BaselineEstablished { .. }));
        assert!(!outcome.is_changed());
        assert_eq!(outcome.record().diff_ref, None);
        assert_eq!(monitor.storage().latest(), Some(&after));
        assert!(monitor.storage().history().is_empty());
    }

    #[test]
    fn unchanged_cycle_still_advances_baseline() {
        let base = solid(200, 200, WHITE);
        // below the 100-pixel tile gate: a 5x5 block
        let drift = with_block(&base, 10, 10, 5, 5, RED);

        let mut monitor = monitor();
        monitor.run_cycle(&png(&base)).unwrap();
        let outcome = monitor.run_cycle(&png(&drift)).unwrap();

        assert!(matches!(outcome, CycleOutcome::Unchanged { .. }));
        assert_eq!(monitor.storage().latest(), Some(&drift));
        assert!(monitor.storage().history().is_empty());
    }

    #[test]
    fn changed_cycle_records_overlay_and_promotes_capture() {
        let (before, after) = red_block_pair();
        let mut monitor = monitor();
        monitor.run_cycle(&png(&before)).unwrap();
        let outcome = monitor.run_cycle(&png(&after)).unwrap();

        let CycleOutcome::Changed {
            record,
            summary,
            overlay_png,
        } = &outcome
        else {
            panic!("expected a change, got {}", outcome.label());
        };
        assert_eq!(summary.changed_tile_count, 4);
        assert!(record.diff_ref.is_some());

        let storage = monitor.storage();
        assert_eq!(storage.latest(), Some(&after));
        assert_eq!(storage.history().len(), 1);
        assert_eq!(&storage.history()[0].1, overlay_png);
        assert_eq!(storage.history()[0].0.as_str(), record.id);
        assert_eq!(storage.reports()[0].1["summary"]["changed_tile_count"], 4);

        let overlay = codec::decode(overlay_png, "overlay").unwrap();
        assert_eq!(overlay.dimensions(), after.dimensions());
        assert_eq!(overlay.pixel(0, 0), WHITE);
        assert_ne!(overlay.pixel(55, 55), WHITE);
    }

    #[test]
    fn malformed_capture_leaves_baseline_untouched() {
        let base = solid(40, 40, WHITE);
        let mut monitor = monitor();
        monitor.run_cycle(&png(&base)).unwrap();

        let err = monitor.run_cycle(b"not an image").unwrap_err();
        assert!(matches!(err, Error::Decode { .. }));
        assert!(err.is_cycle_failure());
        assert_eq!(monitor.storage().latest(), Some(&base));
    }

    #[test]
    fn size_mismatch_leaves_baseline_untouched() {
        let base = solid(40, 40, WHITE);
        let mut monitor = monitor();
        monitor.run_cycle(&png(&base)).unwrap();

        let err = monitor.run_cycle(&png(&solid(40, 41, RED))).unwrap_err();
        assert!(matches!(err, Error::DimensionMismatch { .. }));
        assert_eq!(monitor.storage().latest(), Some(&base));
        assert!(monitor.storage().history().is_empty());

        // the next cycle compares against the last good baseline
        let outcome = monitor.run_cycle(&png(&base)).unwrap();
        assert!(matches!(outcome, CycleOutcome::Unchanged { .. }));
    }

    /// Memory storage whose baseline writes start failing once `fail_latest` is set.
    #[derive(Default)]
    struct FlakyLatest {
        inner: MemoryStorage,
        fail_latest: bool,
    }

    impl Storage for FlakyLatest {
        fn read_latest(&self) -> Result<Option<RasterImage>> {
            self.inner.read_latest()
        }

        fn write_latest(&mut self, image: &RasterImage) -> Result<()> {
            if self.fail_latest {
                return Err(Error::storage(
                    "latest.png",
                    io::Error::new(io::ErrorKind::Other, "disk full"),
                ));
            }
            self.inner.write_latest(image)
        }

        fn append_history(&mut self, id: &SnapshotId, overlay_png: &[u8]) -> Result<String> {
            self.inner.append_history(id, overlay_png)
        }

        fn append_report(&mut self, id: &SnapshotId, report: &Value) -> Result<()> {
            self.inner.append_report(id, report)
        }

        fn remove_history(&mut self, id: &SnapshotId) -> Result<()> {
            self.inner.remove_history(id)
        }

        fn next_id(&mut self, now: DateTime<Utc>) -> SnapshotId {
            self.inner.next_id(now)
        }

        fn latest_ref(&self) -> String {
            self.inner.latest_ref()
        }
    }

    #[test]
    fn failed_promotion_leaves_no_history_record() {
        let (before, after) = red_block_pair();
        let mut monitor = Monitor::new(
            DiffConfig::new(30, 50, 100, 0.35).unwrap(),
            FlakyLatest::default(),
        );
        monitor.process(before.clone()).unwrap();

        monitor.storage.fail_latest = true;
        let err = monitor.process(after.clone()).unwrap_err();
        assert!(matches!(err, Error::Storage { .. }));
        assert!(monitor.storage().inner.history().is_empty());
        assert!(monitor.storage().inner.reports().is_empty());
        assert_eq!(monitor.storage().inner.latest(), Some(&before));

        // once the disk recovers the same change is recorded exactly once
        monitor.storage.fail_latest = false;
        assert!(monitor.process(after.clone()).unwrap().is_changed());
        assert_eq!(monitor.storage().inner.history().len(), 1);
        assert_eq!(monitor.storage().inner.latest(), Some(&after));
    }

    #[test]
    fn history_ids_increase_across_cycles() {
        let a = solid(60, 60, WHITE);
        let b = solid(60, 60, RED);
        let mut monitor = monitor();
        monitor.run_cycle(&png(&a)).unwrap();
        for i in 0..4 {
            let next = if i % 2 == 0 { &b } else { &a };
            assert!(monitor.run_cycle(&png(next)).unwrap().is_changed());
        }
        let ids: Vec<_> = monitor
            .storage()
            .history()
            .iter()
            .map(|(id, _)| id.clone())
            .collect();
        assert_eq!(ids.len(), 4);
        assert!(ids.windows(2).all(|w| w[0] < w[1]));
    }

    #[test]
    fn fs_cycle_writes_history_files() {
        let dir = tempfile::tempdir().unwrap();
        let (before, after) = red_block_pair();
        let mut monitor = Monitor::new(
            DiffConfig::new(30, 50, 100, 0.35).unwrap(),
            FsStorage::open(dir.path()).unwrap(),
        );
        monitor.run_cycle(&png(&before)).unwrap();
        let outcome = monitor.run_cycle(&png(&after)).unwrap();

        let id = &outcome.record().id;
        let history = dir.path().join("history");
        assert!(history.join(format!("{id}.png")).exists());
        assert!(history.join(format!("{id}.json")).exists());
        assert_eq!(
            codec::decode_file(&dir.path().join("latest.png")).unwrap(),
            after
        );
        assert_eq!(outcome.to_json()["outcome"], "changed");
    }
}
