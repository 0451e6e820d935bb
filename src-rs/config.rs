use std::env;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};

pub const DEFAULT_DIFF_THRESHOLD_PIXEL: u8 = 30;
pub const DEFAULT_TILE_SIZE: u32 = 50;
pub const DEFAULT_TILE_PIXEL_THRESHOLD: u32 = 100;
pub const DEFAULT_YELLOW_ALPHA: f32 = 0.35;
pub const DEFAULT_NOTIFY_LABEL: &str = "Page change detected";

/// Validated comparison tunables. Only constructible through [`DiffConfig::new`].
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct DiffConfig {
    diff_threshold_pixel: u8,
    tile_size: u32,
    tile_pixel_threshold: u32,
    yellow_alpha: f32,
}

impl DiffConfig {
    pub fn new(
        diff_threshold_pixel: u8,
        tile_size: u32,
        tile_pixel_threshold: u32,
        yellow_alpha: f32,
    ) -> Result<Self> {
        if diff_threshold_pixel == 0 {
            return Err(Error::ConfigValidation(
                "diff_threshold_pixel must be positive".to_string(),
            ));
        }
        if tile_size == 0 {
            return Err(Error::ConfigValidation(
                "tile_size must be positive".to_string(),
            ));
        }
        let tile_pixels = u64::from(tile_size) * u64::from(tile_size);
        if tile_pixel_threshold == 0 || u64::from(tile_pixel_threshold) > tile_pixels {
            return Err(Error::ConfigValidation(format!(
                "tile_pixel_threshold must be in 1..={tile_pixels} for tile_size {tile_size}, got {tile_pixel_threshold}"
            )));
        }
        if !yellow_alpha.is_finite() || yellow_alpha <= 0.0 || yellow_alpha > 1.0 {
            return Err(Error::ConfigValidation(format!(
                "yellow_alpha must be in (0, 1], got {yellow_alpha}"
            )));
        }
        if yellow_alpha == 1.0 {
            log::warn!("yellow_alpha is 1.0: highlight is opaque, underlying content is lost");
        }

        Ok(Self {
            diff_threshold_pixel,
            tile_size,
            tile_pixel_threshold,
            yellow_alpha,
        })
    }

    pub fn diff_threshold_pixel(&self) -> u8 {
        self.diff_threshold_pixel
    }

    pub fn tile_size(&self) -> u32 {
        self.tile_size
    }

    pub fn tile_pixel_threshold(&self) -> u32 {
        self.tile_pixel_threshold
    }

    pub fn yellow_alpha(&self) -> f32 {
        self.yellow_alpha
    }
}

impl Default for DiffConfig {
    fn default() -> Self {
        Self {
            diff_threshold_pixel: DEFAULT_DIFF_THRESHOLD_PIXEL,
            tile_size: DEFAULT_TILE_SIZE,
            tile_pixel_threshold: DEFAULT_TILE_PIXEL_THRESHOLD,
            yellow_alpha: DEFAULT_YELLOW_ALPHA,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct CaptureSettings {
    /// Shell command that writes a PNG to `$TILE_WATCH_CAPTURE_OUT`.
    pub command: Option<String>,
    pub timeout_secs: u64,
}

impl Default for CaptureSettings {
    fn default() -> Self {
        Self {
            command: None,
            timeout_secs: 120,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct WindowSettings {
    pub start_hour: u32,
    pub end_hour: u32,
    pub utc_offset_hours: i32,
}

impl Default for WindowSettings {
    fn default() -> Self {
        Self {
            start_hour: 5,
            end_hour: 23,
            utc_offset_hours: 9,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct NotifySettings {
    pub url: Option<String>,
    pub thread_id: Option<String>,
    pub wait: bool,
    pub user_agent: Option<String>,
    pub timeout_secs: u64,
    pub max_attempts: u32,
    pub label: String,
}

impl Default for NotifySettings {
    fn default() -> Self {
        Self {
            url: None,
            thread_id: None,
            wait: true,
            user_agent: None,
            timeout_secs: 10,
            max_attempts: 3,
            label: DEFAULT_NOTIFY_LABEL.to_string(),
        }
    }
}

/// Everything the watcher reads at startup. Loaded once, then treated as read-only.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct WatchConfig {
    pub diff_threshold_pixel: u8,
    pub tile_size: u32,
    pub tile_pixel_threshold: u32,
    pub yellow_alpha: f32,
    pub out_dir: PathBuf,
    pub interval_secs: u64,
    pub force: bool,
    pub capture: CaptureSettings,
    pub window: WindowSettings,
    pub notify: NotifySettings,
}

impl Default for WatchConfig {
    fn default() -> Self {
        Self {
            diff_threshold_pixel: DEFAULT_DIFF_THRESHOLD_PIXEL,
            tile_size: DEFAULT_TILE_SIZE,
            tile_pixel_threshold: DEFAULT_TILE_PIXEL_THRESHOLD,
            yellow_alpha: DEFAULT_YELLOW_ALPHA,
            out_dir: PathBuf::from(".tile-watch"),
            interval_secs: 300,
            force: false,
            capture: CaptureSettings::default(),
            window: WindowSettings::default(),
            notify: NotifySettings::default(),
        }
    }
}

impl WatchConfig {
    /// Reads the JSON file (if given) and applies `TILE_WATCH_*` overrides.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let mut config = match path {
            Some(path) => {
                let raw = std::fs::read_to_string(path).map_err(|e| Error::storage(path, e))?;
                serde_json::from_str::<WatchConfig>(&raw).map_err(|source| Error::ConfigParse {
                    path: path.to_path_buf(),
                    source,
                })?
            }
            None => WatchConfig::default(),
        };
        config.apply_env(|key| env::var(key).ok());
        Ok(config)
    }

    pub fn apply_env<F>(&mut self, lookup: F)
    where
        F: Fn(&str) -> Option<String>,
    {
        let get = |key: &str| {
            lookup(&format!("TILE_WATCH_{key}"))
                .map(|v| v.trim().to_string())
                .filter(|v| !v.is_empty())
        };

        if let Some(dir) = get("OUT_DIR") {
            self.out_dir = PathBuf::from(dir);
        }
        if let Some(url) = get("WEBHOOK_URL") {
            self.notify.url = Some(url);
        }
        if let Some(thread) = get("THREAD_ID") {
            self.notify.thread_id = Some(thread);
        }
        if let Some(command) = get("CAPTURE_COMMAND") {
            self.capture.command = Some(command);
        }
        if get("FORCE").as_deref() == Some("1") {
            self.force = true;
        }
    }

    /// Range-checks every field and returns the comparison tunables.
    pub fn validate(&self) -> Result<DiffConfig> {
        let diff = DiffConfig::new(
            self.diff_threshold_pixel,
            self.tile_size,
            self.tile_pixel_threshold,
            self.yellow_alpha,
        )?;

        if self.window.start_hour > 23 || self.window.end_hour > 23 {
            return Err(Error::ConfigValidation(format!(
                "window hours must be in 0..=23, got {}..{}",
                self.window.start_hour, self.window.end_hour
            )));
        }
        if !(-12..=14).contains(&self.window.utc_offset_hours) {
            return Err(Error::ConfigValidation(format!(
                "utc_offset_hours must be in -12..=14, got {}",
                self.window.utc_offset_hours
            )));
        }
        if self.interval_secs == 0 {
            return Err(Error::ConfigValidation(
                "interval_secs must be positive".to_string(),
            ));
        }
        if self.capture.timeout_secs == 0 {
            return Err(Error::ConfigValidation(
                "capture.timeout_secs must be positive".to_string(),
            ));
        }
        if self.notify.label.trim().is_empty() || self.notify.label.contains('\n') {
            return Err(Error::ConfigValidation(
                "notify.label must be a single non-empty line".to_string(),
            ));
        }

        Ok(diff)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    #[test]
    fn defaults_validate() {
        let diff = WatchConfig::default().validate().unwrap();
        assert_eq!(diff, DiffConfig::default());
        assert_eq!(diff.tile_size(), 50);
    }

    #[test]
    fn rejects_out_of_range_tunables() {
        assert!(matches!(
            DiffConfig::new(0, 50, 100, 0.3),
            Err(Error::ConfigValidation(_))
        ));
        assert!(DiffConfig::new(30, 0, 1, 0.3).is_err());
        assert!(DiffConfig::new(30, 50, 0, 0.3).is_err());
        assert!(DiffConfig::new(30, 50, 2501, 0.3).is_err());
        assert!(DiffConfig::new(30, 50, 100, 0.0).is_err());
        assert!(DiffConfig::new(30, 50, 100, 1.5).is_err());
        assert!(DiffConfig::new(30, 50, 100, f32::NAN).is_err());
    }

    #[test]
    fn accepts_boundary_values() {
        assert!(DiffConfig::new(1, 1, 1, 1.0).is_ok());
        assert!(DiffConfig::new(255, 50, 2500, 0.01).is_ok());
    }

    #[test]
    fn parses_partial_json_with_defaults() {
        let raw = r#"{"tile_size": 32, "tile_pixel_threshold": 40, "notify": {"url": "https://example.invalid/hook"}}"#;
        let config: WatchConfig = serde_json::from_str(raw).unwrap();
        assert_eq!(config.tile_size, 32);
        assert_eq!(config.diff_threshold_pixel, DEFAULT_DIFF_THRESHOLD_PIXEL);
        assert_eq!(config.notify.max_attempts, 3);
        assert!(config.notify.wait);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn rejects_unknown_keys() {
        let raw = r#"{"tile_sise": 32}"#;
        assert!(serde_json::from_str::<WatchConfig>(raw).is_err());
    }

    #[test]
    fn env_overrides_file_values() {
        let vars: HashMap<&str, &str> = [
            ("TILE_WATCH_OUT_DIR", "/tmp/watch"),
            ("TILE_WATCH_WEBHOOK_URL", " https://example.invalid/hook "),
            ("TILE_WATCH_FORCE", "1"),
            ("TILE_WATCH_THREAD_ID", ""),
        ]
        .into_iter()
        .collect();

        let mut config = WatchConfig::default();
        config.apply_env(|key| vars.get(key).map(|v| v.to_string()));

        assert_eq!(config.out_dir, PathBuf::from("/tmp/watch"));
        assert_eq!(
            config.notify.url.as_deref(),
            Some("https://example.invalid/hook")
        );
        assert!(config.force);
        assert_eq!(config.notify.thread_id, None);
    }

    #[test]
    fn rejects_bad_window_and_interval() {
        let mut config = WatchConfig::default();
        config.window.end_hour = 24;
        assert!(config.validate().is_err());

        let mut config = WatchConfig::default();
        config.interval_secs = 0;
        assert!(config.validate().is_err());

        let mut config = WatchConfig::default();
        config.notify.label = "two\nlines".to_string();
        assert!(config.validate().is_err());
    }

    #[test]
    fn load_reports_parse_errors_with_path() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("watch.json");
        std::fs::write(&path, "{not json").unwrap();
        let err = WatchConfig::load(Some(&path)).unwrap_err();
        assert!(matches!(err, Error::ConfigParse { .. }));
    }
}
