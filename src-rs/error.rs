use std::path::PathBuf;

use thiserror::Error;

pub type Result<T> = std::result::Result<T, Error>;

#[derive(Debug, Error)]
pub enum Error {
    #[error("failed to decode {context}: {source}")]
    Decode {
        context: String,
        #[source]
        source: image::ImageError,
    },

    #[error("failed to encode image: {0}")]
    Encode(#[source] image::ImageError),

    #[error(
        "image sizes differ: previous {}x{}, current {}x{}",
        previous.0,
        previous.1,
        current.0,
        current.1
    )]
    DimensionMismatch {
        previous: (u32, u32),
        current: (u32, u32),
    },

    #[error("invalid configuration: {0}")]
    ConfigValidation(String),

    #[error("failed to parse config {}: {source}", path.display())]
    ConfigParse {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },

    #[error("storage failure at {}: {source}", path.display())]
    Storage {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("capture failed: {0}")]
    Capture(String),

    #[error("notification failed: {0}")]
    Notify(String),

    #[error("http request failed: {0}")]
    Http(#[from] reqwest::Error),

    #[error("another cycle holds the lock at {}", .0.display())]
    CycleInProgress(PathBuf),
}

impl Error {
    pub(crate) fn storage(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        Error::Storage {
            path: path.into(),
            source,
        }
    }

    /// Failures that abort a single cycle but leave the baseline usable for the next one.
    pub fn is_cycle_failure(&self) -> bool {
        matches!(
            self,
            Error::Decode { .. }
                | Error::DimensionMismatch { .. }
                | Error::Capture(_)
                | Error::CycleInProgress(_)
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn dimension_mismatch_message_names_both_sizes() {
        let err = Error::DimensionMismatch {
            previous: (200, 100),
            current: (200, 120),
        };
        assert_eq!(
            err.to_string(),
            "image sizes differ: previous 200x100, current 200x120"
        );
        assert!(err.is_cycle_failure());
    }

    #[test]
    fn config_errors_are_not_cycle_failures() {
        let err = Error::ConfigValidation("tile_size must be positive".to_string());
        assert!(!err.is_cycle_failure());
    }
}
