//! On-demand photo capture with bounded retries.

use crate::camera::{Camera, CameraError};
use crate::frame::{Frame, FrameError};
use std::path::{Path, PathBuf};
use std::time::Duration;
use thiserror::Error;

/// Anything that can produce a frame on request.
pub trait FrameSource {
    fn grab(&mut self) -> Result<Frame, CameraError>;
}

impl FrameSource for Camera {
    fn grab(&mut self) -> Result<Frame, CameraError> {
        self.capture_frame()
    }
}

/// Retry bound for transient capture failures.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    pub attempts: u32,
    /// Fixed pause between attempts.
    pub backoff: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            attempts: 3,
            backoff: Duration::from_millis(500),
        }
    }
}

#[derive(Error, Debug)]
pub enum CaptureError {
    #[error("capture failed after {attempts} attempts: {last_error}")]
    Exhausted { attempts: u32, last_error: String },
    #[error("failed to save photo {path}: {source}")]
    Save {
        path: PathBuf,
        #[source]
        source: FrameError,
    },
    #[error("capture directory {path}: {source}")]
    Directory {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

/// Takes a photo per trigger and stores it under a timestamped name.
pub struct CaptureService<S> {
    source: S,
    dir: PathBuf,
    retry: RetryPolicy,
}

impl<S: FrameSource> CaptureService<S> {
    /// Create the service, creating `dir` if needed.
    pub fn new(source: S, dir: impl Into<PathBuf>, retry: RetryPolicy) -> Result<Self, CaptureError> {
        let dir = dir.into();
        std::fs::create_dir_all(&dir).map_err(|source| CaptureError::Directory {
            path: dir.clone(),
            source,
        })?;
        Ok(Self { source, dir, retry })
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// Capture one photo and return where it was stored.
    ///
    /// Camera read errors and dark frames are retried; a failure to write the
    /// file is not.
    pub fn capture(&mut self) -> Result<PathBuf, CaptureError> {
        let attempts = self.retry.attempts.max(1);
        let mut last_error = String::new();

        for attempt in 1..=attempts {
            match self.source.grab() {
                Ok(frame) if !frame.is_dark => {
                    let path = self.next_path();
                    frame.save(&path).map_err(|source| CaptureError::Save {
                        path: path.clone(),
                        source,
                    })?;
                    tracing::info!(path = %path.display(), attempt, "photo captured");
                    return Ok(path);
                }
                Ok(frame) => last_error = format!("dark frame (seq {})", frame.sequence),
                Err(e) => last_error = e.to_string(),
            }

            tracing::warn!(attempt, attempts, error = %last_error, "photo capture failed");
            if attempt < attempts {
                std::thread::sleep(self.retry.backoff);
            }
        }

        Err(CaptureError::Exhausted {
            attempts,
            last_error,
        })
    }

    /// `face_<YYYYMMDD-HHMMSS-mmm>.jpg`, with a counter suffix on collision.
    fn next_path(&self) -> PathBuf {
        let stamp = chrono::Local::now().format("%Y%m%d-%H%M%S-%3f");
        let mut path = self.dir.join(format!("face_{stamp}.jpg"));
        let mut n = 1;
        while path.exists() {
            path = self.dir.join(format!("face_{stamp}-{n}.jpg"));
            n += 1;
        }
        path
    }
}
