//! Sources of raw page captures. Navigation and rendering happen outside this crate;
//! a capture provider only has to hand back encoded image bytes.

use std::fs;
use std::io::Read;
use std::path::PathBuf;
use std::process::{Command, Stdio};
use std::thread;
use std::time::Duration;

use wait_timeout::ChildExt;

use crate::error::{Error, Result};
use crate::util::tail_text;

pub const CAPTURE_OUT_ENV: &str = "TILE_WATCH_CAPTURE_OUT";

pub trait Capture {
    fn capture(&self) -> Result<Vec<u8>>;
}

/// Reads a screenshot some other tool already wrote.
#[derive(Debug, Clone)]
pub struct FileCapture {
    path: PathBuf,
}

impl FileCapture {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }
}

impl Capture for FileCapture {
    fn capture(&self) -> Result<Vec<u8>> {
        if !self.path.exists() {
            return Err(Error::Capture(format!(
                "capture not found: {}",
                self.path.display()
            )));
        }
        fs::read(&self.path).map_err(|e| Error::storage(&self.path, e))
    }
}

/// Runs a shell command (e.g. a browser automation script) that writes a PNG
/// to the path in `$TILE_WATCH_CAPTURE_OUT`.
#[derive(Debug, Clone)]
pub struct CommandCapture {
    command: String,
    timeout: Duration,
}

impl CommandCapture {
    pub fn new(command: impl Into<String>, timeout: Duration) -> Self {
        Self {
            command: command.into(),
            timeout,
        }
    }
}

impl Capture for CommandCapture {
    fn capture(&self) -> Result<Vec<u8>> {
        let dir = tempfile::Builder::new()
            .prefix("tile-watch-capture")
            .tempdir()
            .map_err(|e| Error::storage(std::env::temp_dir(), e))?;
        let out_path = dir.path().join("capture.png");

        let mut child = Command::new("bash")
            .arg("-lc")
            .arg(&self.command)
            .env(CAPTURE_OUT_ENV, &out_path)
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::piped())
            .spawn()
            .map_err(|e| Error::Capture(format!("failed to spawn capture command: {e}")))?;

        // drain stderr while waiting, a full pipe stalls the child
        let stderr_reader = child.stderr.take().map(|mut pipe| {
            thread::spawn(move || {
                let mut buf = Vec::new();
                let _ = pipe.read_to_end(&mut buf);
                buf
            })
        });

        // on timeout the reader is left detached: grandchildren may still hold the pipe
        let status = match child.wait_timeout(self.timeout) {
            Ok(Some(status)) => status,
            Ok(None) => {
                let _ = child.kill();
                let _ = child.wait();
                return Err(Error::Capture(format!(
                    "capture command timed out after {}s",
                    self.timeout.as_secs_f64()
                )));
            }
            Err(err) => {
                let _ = child.kill();
                let _ = child.wait();
                return Err(Error::Capture(format!("failed to wait for capture command: {err}")));
            }
        };
        let stderr_bytes = stderr_reader
            .and_then(|handle| handle.join().ok())
            .unwrap_or_default();

        let stderr = String::from_utf8_lossy(&stderr_bytes);
        if !status.success() {
            return Err(Error::Capture(format!(
                "capture command exited with {}: {}",
                status.code().unwrap_or(-1),
                tail_text(stderr.trim(), 1200)
            )));
        }

        match fs::read(&out_path) {
            Ok(bytes) if !bytes.is_empty() => {
                log::debug!("captured {} bytes", bytes.len());
                Ok(bytes)
            }
            _ => Err(Error::Capture(format!(
                "capture command did not write {}",
                out_path.display()
            ))),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn file_capture_reads_bytes() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("shot.png");
        fs::write(&path, b"bytes").unwrap();
        assert_eq!(FileCapture::new(&path).capture().unwrap(), b"bytes");
    }

    #[test]
    fn missing_file_is_a_capture_error() {
        let err = FileCapture::new("/nonexistent/shot.png").capture().unwrap_err();
        assert!(matches!(err, Error::Capture(_)));
        assert!(err.is_cycle_failure());
    }

    #[test]
    fn command_capture_reads_written_file() {
        let capture = CommandCapture::new(
            format!("printf 'pixels' > \"${CAPTURE_OUT_ENV}\""),
            Duration::from_secs(10),
        );
        assert_eq!(capture.capture().unwrap(), b"pixels");
    }

    #[test]
    fn failing_command_reports_stderr() {
        let capture = CommandCapture::new("echo boom >&2; exit 3", Duration::from_secs(10));
        match capture.capture().unwrap_err() {
            Error::Capture(msg) => {
                assert!(msg.contains("exited with 3"));
                assert!(msg.contains("boom"));
            }
            other => panic!("unexpected error: {other}"),
        }
    }

    #[test]
    fn verbose_stderr_does_not_stall_the_command() {
        let capture = CommandCapture::new(
            format!(
                "head -c 204800 /dev/zero | tr '\\0' x >&2; printf 'pixels' > \"${CAPTURE_OUT_ENV}\""
            ),
            Duration::from_secs(10),
        );
        assert_eq!(capture.capture().unwrap(), b"pixels");
    }

    #[test]
    fn command_without_output_is_an_error() {
        let capture = CommandCapture::new("true", Duration::from_secs(10));
        assert!(matches!(capture.capture(), Err(Error::Capture(_))));
    }

    #[test]
    fn slow_command_times_out() {
        let capture = CommandCapture::new("sleep 5", Duration::from_millis(200));
        match capture.capture().unwrap_err() {
            Error::Capture(msg) => assert!(msg.contains("timed out")),
            other => panic!("unexpected error: {other}"),
        }
    }
}
