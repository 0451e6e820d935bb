//! Periodic triggering. Cycles run strictly one after another; the storage lock
//! additionally keeps separate processes from interleaving on the same baseline.

use std::thread;
use std::time::{Duration, Instant};

use chrono::{DateTime, FixedOffset, Timelike, Utc};
use serde::Serialize;

use crate::capture::Capture;
use crate::config::WindowSettings;
use crate::error::{Error, Result};
use crate::monitor::{CycleOutcome, Monitor};
use crate::notify::{change_message, Notifier};
use crate::storage::Storage;

/// Hours (inclusive at both ends) during which cycles run, at a fixed UTC offset.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MonitoringWindow {
    start_hour: u32,
    end_hour: u32,
    offset: FixedOffset,
}

impl MonitoringWindow {
    pub fn from_settings(settings: &WindowSettings) -> Result<Self> {
        let offset = FixedOffset::east_opt(settings.utc_offset_hours * 3600).ok_or_else(|| {
            Error::ConfigValidation(format!(
                "invalid utc_offset_hours {}",
                settings.utc_offset_hours
            ))
        })?;
        Ok(Self {
            start_hour: settings.start_hour,
            end_hour: settings.end_hour,
            offset,
        })
    }

    pub fn local_time(&self, now: DateTime<Utc>) -> DateTime<FixedOffset> {
        now.with_timezone(&self.offset)
    }

    pub fn contains(&self, now: DateTime<Utc>) -> bool {
        let hour = self.local_time(now).hour();
        if self.start_hour <= self.end_hour {
            self.start_hour <= hour && hour <= self.end_hour
        } else {
            hour >= self.start_hour || hour <= self.end_hour
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Tick {
    OutsideWindow,
    Completed(CycleOutcome),
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct RunStats {
    pub cycles: u64,
    pub skipped: u64,
    pub baselines: u64,
    pub unchanged: u64,
    pub changed: u64,
    pub failed: u64,
}

pub struct Watcher<S: Storage, C: Capture, N: Notifier> {
    monitor: Monitor<S>,
    capture: C,
    notifier: Option<N>,
    window: MonitoringWindow,
    force: bool,
    interval: Duration,
    label: String,
}

impl<S: Storage, C: Capture, N: Notifier> Watcher<S, C, N> {
    pub fn new(
        monitor: Monitor<S>,
        capture: C,
        notifier: Option<N>,
        window: MonitoringWindow,
        interval: Duration,
        label: impl Into<String>,
    ) -> Self {
        Self {
            monitor,
            capture,
            notifier,
            window,
            force: false,
            interval,
            label: label.into(),
        }
    }

    /// Runs even outside the monitoring window.
    pub fn force(mut self, force: bool) -> Self {
        self.force = force;
        self
    }

    pub fn monitor(&self) -> &Monitor<S> {
        &self.monitor
    }

    pub fn notifier(&self) -> Option<&N> {
        self.notifier.as_ref()
    }

    /// One capture, one comparison, and a notification if the page changed.
    pub fn tick(&mut self, now: DateTime<Utc>) -> Result<Tick> {
        if !self.force && !self.window.contains(now) {
            log::info!(
                "outside monitoring window ({}:00-{}:59 local, now {}), skipping",
                self.window.start_hour,
                self.window.end_hour,
                self.window.local_time(now).format("%Y-%m-%d %H:%M:%S")
            );
            return Ok(Tick::OutsideWindow);
        }

        let _guard = self.monitor.storage().lock_cycle()?;
        let bytes = self.capture.capture()?;
        let outcome = self.monitor.run_cycle(&bytes)?;

        if let CycleOutcome::Changed {
            record,
            summary,
            overlay_png,
        } = &outcome
        {
            match &self.notifier {
                Some(notifier) => {
                    let message = change_message(&self.label, record, summary);
                    notifier.notify(&message, overlay_png, &format!("diff-{}.png", record.id))?;
                }
                None => log::warn!("change recorded as {} but no notifier is configured", record.id),
            }
        }

        Ok(Tick::Completed(outcome))
    }

    /// Ticks every `interval` until `max_cycles` ticks have run (0 = forever).
    /// Cycle failures are logged and retried on the next tick against the last good baseline.
    pub fn run(&mut self, max_cycles: u64) -> Result<RunStats> {
        let mut stats = RunStats::default();

        loop {
            let started = Instant::now();
            stats.cycles += 1;

            match self.tick(Utc::now()) {
                Ok(Tick::OutsideWindow) => stats.skipped += 1,
                Ok(Tick::Completed(outcome)) => match outcome {
                    CycleOutcome::BaselineEstablished { .. } => stats.baselines += 1,
                    CycleOutcome::Unchanged { .. } => stats.unchanged += 1,
                    CycleOutcome::Changed { .. } => stats.changed += 1,
                },
                Err(err @ (Error::ConfigValidation(_) | Error::ConfigParse { .. })) => {
                    return Err(err)
                }
                Err(err) => {
                    stats.failed += 1;
                    log::error!("cycle {} failed: {}", stats.cycles, err);
                }
            }

            if max_cycles > 0 && stats.cycles >= max_cycles {
                break;
            }

            let elapsed = started.elapsed();
            if let Some(remaining) = self.interval.checked_sub(elapsed) {
                log::debug!("sleeping for {:?}", remaining);
                thread::sleep(remaining);
            } else {
                log::warn!(
                    "cycle took longer than the interval: {:?}, will not sleep",
                    elapsed
                );
            }
        }

        log::info!(
            "watcher stopped after {} cycles ({} changed, {} failed)",
            stats.cycles,
            stats.changed,
            stats.failed
        );
        Ok(stats)
    }
}
