// ABOUTME: The Stage trait a job runs in order, and the builtin stages (echo, sleep, write file, read file).
// ABOUTME: StageKind selects a stage per template step; Custom wraps a user-supplied StageFactory.

use std::fmt;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::Notify;

use crate::template::ResolvedParameters;

/// One unit of work within a job.
///
/// `start` runs the stage to completion and reports success. `pause` and
/// `resume` are advisory: the job only parks between stages, so a stage may
/// ignore them. `cancel` asks the stage to stop early and reports whether it
/// acknowledged.
#[async_trait]
pub trait Stage: Send + Sync {
    fn name(&self) -> &str;

    async fn start(&self) -> bool;

    fn pause(&self) {}

    fn resume(&self) {}

    fn cancel(&self) -> bool {
        false
    }
}

/// Builds a stage for one job from its resolved parameters.
pub trait StageFactory: Send + Sync {
    fn name(&self) -> &str;

    fn build(&self, params: &ResolvedParameters) -> Arc<dyn Stage>;
}

/// A step of a template.
#[derive(Clone)]
pub enum StageKind {
    /// Logs `message`; fails when `fail` is set.
    Echo,
    /// Waits `duration_ms`, returning early on cancel.
    Sleep,
    /// Writes `contents` to `path`.
    WriteFile,
    /// Reads `path` back and compares it with `contents`.
    ReadFile,
    Custom(Arc<dyn StageFactory>),
}

impl StageKind {
    pub fn name(&self) -> &str {
        match self {
            StageKind::Echo => "echo",
            StageKind::Sleep => "sleep",
            StageKind::WriteFile => "write-file",
            StageKind::ReadFile => "read-file",
            StageKind::Custom(factory) => factory.name(),
        }
    }

    pub fn build(&self, params: &ResolvedParameters) -> Arc<dyn Stage> {
        match self {
            StageKind::Echo => Arc::new(EchoStage {
                message: params.text("message").unwrap_or_default().to_string(),
                fail: params.boolean("fail").unwrap_or(false),
            }),
            StageKind::Sleep => Arc::new(SleepStage::new(Duration::from_millis(
                params.integer("duration_ms").unwrap_or(0).max(0) as u64,
            ))),
            StageKind::WriteFile => Arc::new(WriteFileStage {
                path: PathBuf::from(params.text("path").unwrap_or_default()),
                contents: params.text("contents").unwrap_or_default().to_string(),
            }),
            StageKind::ReadFile => Arc::new(ReadFileStage {
                path: PathBuf::from(params.text("path").unwrap_or_default()),
                expected: params.text("contents").unwrap_or_default().to_string(),
            }),
            StageKind::Custom(factory) => factory.build(params),
        }
    }
}

impl fmt::Debug for StageKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            StageKind::Custom(factory) => f.debug_tuple("Custom").field(&factory.name()).finish(),
            other => f.write_str(other.name()),
        }
    }
}

struct EchoStage {
    message: String,
    fail: bool,
}

#[async_trait]
impl Stage for EchoStage {
    fn name(&self) -> &str {
        "echo"
    }

    async fn start(&self) -> bool {
        tracing::info!(message = %self.message, "echo");
        !self.fail
    }
}

struct SleepStage {
    duration: Duration,
    cancelled: Notify,
}

impl SleepStage {
    fn new(duration: Duration) -> Self {
        Self {
            duration,
            cancelled: Notify::new(),
        }
    }
}

#[async_trait]
impl Stage for SleepStage {
    fn name(&self) -> &str {
        "sleep"
    }

    async fn start(&self) -> bool {
        tokio::select! {
            _ = tokio::time::sleep(self.duration) => true,
            _ = self.cancelled.notified() => false,
        }
    }

    fn cancel(&self) -> bool {
        self.cancelled.notify_one();
        true
    }
}

struct WriteFileStage {
    path: PathBuf,
    contents: String,
}

#[async_trait]
impl Stage for WriteFileStage {
    fn name(&self) -> &str {
        "write-file"
    }

    async fn start(&self) -> bool {
        match tokio::fs::write(&self.path, self.contents.as_bytes()).await {
            Ok(()) => true,
            Err(err) => {
                tracing::warn!(path = %self.path.display(), "write failed: {}", err);
                false
            }
        }
    }
}

struct ReadFileStage {
    path: PathBuf,
    expected: String,
}

#[async_trait]
impl Stage for ReadFileStage {
    fn name(&self) -> &str {
        "read-file"
    }

    async fn start(&self) -> bool {
        match tokio::fs::read_to_string(&self.path).await {
            Ok(contents) => {
                let matched = contents == self.expected;
                if !matched {
                    tracing::warn!(path = %self.path.display(), "file contents differ");
                }
                matched
            }
            Err(err) => {
                tracing::warn!(path = %self.path.display(), "read failed: {}", err);
                false
            }
        }
    }
}
