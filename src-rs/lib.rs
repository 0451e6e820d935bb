//! Tile-based visual change detection for periodically captured pages.
//!
//! A capture is compared against the stored baseline tile by tile. When enough
//! tiles change, a yellow-tinted overlay of the current capture is recorded in
//! history and handed to a notifier; the capture then becomes the new baseline.

pub mod capture;
pub mod codec;
pub mod config;
pub mod decision;
pub mod error;
pub mod logging;
pub mod monitor;
pub mod notify;
pub mod overlay;
pub mod schedule;
pub mod storage;
pub mod tiles;
pub mod util;

pub use capture::{Capture, CommandCapture, FileCapture};
pub use codec::RasterImage;
pub use config::{DiffConfig, WatchConfig};
pub use decision::{decide, ChangeSummary};
pub use error::{Error, Result};
pub use monitor::{CycleOutcome, Monitor, SnapshotRecord};
pub use notify::{Notifier, WebhookNotifier};
pub use schedule::{MonitoringWindow, RunStats, Tick, Watcher};
pub use storage::{FsStorage, MemoryStorage, SnapshotId, Storage};
pub use tiles::{diff, DiffResult, Tile, TileGrid, TileRect};
