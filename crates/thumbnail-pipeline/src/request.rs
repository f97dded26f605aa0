//! Thumbnail requests and completion callbacks

use crate::error::Result;
use crate::scale::Bound;
use crate::source::Rotation;
use crate::thumbnail::Thumbnail;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::Arc;

/// Scheduling priority. `Highest` is served first.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Priority {
    Lowest,
    Low,
    #[default]
    Medium,
    High,
    Highest,
}

impl fmt::Display for Priority {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Priority::Lowest => "lowest",
            Priority::Low => "low",
            Priority::Medium => "medium",
            Priority::High => "high",
            Priority::Highest => "highest",
        };
        f.write_str(name)
    }
}

impl std::str::FromStr for Priority {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> anyhow::Result<Self> {
        match s.to_lowercase().as_str() {
            "lowest" => Ok(Priority::Lowest),
            "low" => Ok(Priority::Low),
            "medium" => Ok(Priority::Medium),
            "high" => Ok(Priority::High),
            "highest" => Ok(Priority::Highest),
            _ => anyhow::bail!(
                "Invalid priority: {}. Valid options: lowest, low, medium, high, highest",
                s
            ),
        }
    }
}

/// Identity of the logical display target a thumbnail is for.
///
/// At most one request per target is queued or in flight at a time.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct TargetId(String);

impl TargetId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for TargetId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for TargetId {
    fn from(id: &str) -> Self {
        Self::new(id)
    }
}

impl From<String> for TargetId {
    fn from(id: String) -> Self {
        Self(id)
    }
}

impl From<&Path> for TargetId {
    fn from(path: &Path) -> Self {
        Self(path.to_string_lossy().into_owned())
    }
}

/// Lifecycle of a request inside the scheduler.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum RequestState {
    Queued,
    InProgress,
    Done,
    Cancelled,
}

/// Outcome delivered to a request's callback.
#[derive(Debug)]
pub struct ThumbnailReady {
    pub target: TargetId,
    pub result: Result<Thumbnail>,
}

impl ThumbnailReady {
    /// The thumbnail, or the broken-image placeholder if the build failed.
    pub fn into_thumbnail_or_broken(self) -> (TargetId, Thumbnail) {
        let thumbnail = self.result.unwrap_or_else(|_| Thumbnail::broken());
        (self.target, thumbnail)
    }
}

/// Callback invoked once per completed, non-cancelled request, on a worker thread.
pub type ThumbnailCallback = Arc<dyn Fn(ThumbnailReady) + Send + Sync>;

/// "Build a thumbnail of `bound` for `target` from `source`."
#[derive(Clone)]
pub struct ThumbnailRequest {
    target: TargetId,
    source: PathBuf,
    rotation: Rotation,
    bound: Bound,
    priority: Priority,
    force_rebuild: bool,
    callback: ThumbnailCallback,
}

impl ThumbnailRequest {
    pub fn new(
        target: impl Into<TargetId>,
        source: impl Into<PathBuf>,
        bound: Bound,
        callback: ThumbnailCallback,
    ) -> Self {
        Self {
            target: target.into(),
            source: source.into(),
            rotation: Rotation::default(),
            bound: bound.or_fallback(),
            priority: Priority::default(),
            force_rebuild: false,
            callback,
        }
    }

    pub fn with_rotation(mut self, rotation: Rotation) -> Self {
        self.rotation = rotation;
        self
    }

    pub fn with_priority(mut self, priority: Priority) -> Self {
        self.priority = priority;
        self
    }

    /// Skip the cache read and always rebuild from the source.
    pub fn force_rebuild(mut self, force: bool) -> Self {
        self.force_rebuild = force;
        self
    }

    pub fn target(&self) -> &TargetId {
        &self.target
    }

    pub fn source(&self) -> &Path {
        &self.source
    }

    pub fn rotation(&self) -> Rotation {
        self.rotation
    }

    pub fn bound(&self) -> Bound {
        self.bound
    }

    pub fn priority(&self) -> Priority {
        self.priority
    }

    pub fn is_force_rebuild(&self) -> bool {
        self.force_rebuild
    }

    /// Raise the priority to `priority` if that is strictly higher.
    /// Returns whether anything changed.
    pub fn increase_priority_to(&mut self, priority: Priority) -> bool {
        if priority > self.priority {
            self.priority = priority;
            true
        } else {
            false
        }
    }

    /// Same source, rotation, bound and rebuild flag. Priority and callback
    /// are not compared.
    pub fn same_parameters(&self, other: &ThumbnailRequest) -> bool {
        self.source == other.source
            && self.rotation == other.rotation
            && self.bound == other.bound
            && self.force_rebuild == other.force_rebuild
    }

    pub(crate) fn deliver(&self, result: Result<Thumbnail>) {
        (self.callback)(ThumbnailReady {
            target: self.target.clone(),
            result,
        });
    }
}

impl fmt::Debug for ThumbnailRequest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ThumbnailRequest")
            .field("target", &self.target)
            .field("source", &self.source)
            .field("rotation", &self.rotation)
            .field("bound", &self.bound)
            .field("priority", &self.priority)
            .field("force_rebuild", &self.force_rebuild)
            .finish_non_exhaustive()
    }
}
