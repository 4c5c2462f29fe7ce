//! Per-tile lifecycle state

use std::fmt;

use pagetile_render::{DecodeError, Resolution, SharedPixels, UpscaleError};
use pagetile_scheduler::{CancellationToken, JobId};
use thiserror::Error;

/// Lifecycle of one tile
///
/// `Pending -> Decoding -> Ready | Failed`. A new decode generation may move
/// any state back to `Decoding`.
#[derive(Clone)]
pub enum TileState {
    /// Needed but no job issued yet
    Pending,

    /// A job is in flight for `target`
    Decoding {
        job: JobId,
        token: CancellationToken,
        target: Resolution,
    },

    /// Pixels at exactly `resolution`
    Ready {
        pixels: SharedPixels,
        resolution: Resolution,
    },

    /// The last decode failed; retried lazily by the next generation
    Failed { reason: TileFailure },
}

impl TileState {
    pub fn status(&self) -> TileStatus {
        match self {
            TileState::Pending => TileStatus::Pending,
            TileState::Decoding { .. } => TileStatus::Decoding,
            TileState::Ready { .. } => TileStatus::Ready,
            TileState::Failed { .. } => TileStatus::Failed,
        }
    }

    pub fn pixels(&self) -> Option<&SharedPixels> {
        match self {
            TileState::Ready { pixels, .. } => Some(pixels),
            _ => None,
        }
    }

    pub fn job(&self) -> Option<JobId> {
        match self {
            TileState::Decoding { job, .. } => Some(*job),
            _ => None,
        }
    }

    /// Resolution the tile has or is being decoded at
    pub fn resolution(&self) -> Option<Resolution> {
        match self {
            TileState::Decoding { target, .. } => Some(*target),
            TileState::Ready { resolution, .. } => Some(*resolution),
            _ => None,
        }
    }
}

impl fmt::Debug for TileState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TileState::Pending => f.write_str("Pending"),
            TileState::Decoding { job, target, .. } => f
                .debug_struct("Decoding")
                .field("job", job)
                .field("target", target)
                .finish_non_exhaustive(),
            TileState::Ready { resolution, .. } => f
                .debug_struct("Ready")
                .field("resolution", resolution)
                .finish_non_exhaustive(),
            TileState::Failed { reason } => f.debug_struct("Failed").field("reason", reason).finish(),
        }
    }
}

/// Discriminant of [`TileState`] without its payload
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TileStatus {
    Pending,
    Decoding,
    Ready,
    Failed,
}

/// Why a tile failed
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum FailureKind {
    UnsupportedFormat,
    CorruptData,
    OutOfBounds,
    NativeAllocationFailure,
    Io,
    Upscale,
    OverBudget,
}

/// A tile-local failure, kept in [`TileState::Failed`]
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TileFailure {
    pub kind: FailureKind,
    pub message: String,
}

impl TileFailure {
    pub fn new(kind: FailureKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
        }
    }
}

impl fmt::Display for TileFailure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:?}: {}", self.kind, self.message)
    }
}

impl From<&DecodeError> for TileFailure {
    fn from(error: &DecodeError) -> Self {
        let kind = match error {
            DecodeError::UnsupportedFormat(_) => FailureKind::UnsupportedFormat,
            DecodeError::CorruptData(_) => FailureKind::CorruptData,
            DecodeError::OutOfBounds { .. } => FailureKind::OutOfBounds,
            DecodeError::NativeAllocationFailure(_) => FailureKind::NativeAllocationFailure,
            DecodeError::Io(_) => FailureKind::Io,
            // Cancelled jobs never reach the cache; treat a stray one as corrupt output
            DecodeError::Cancelled => FailureKind::CorruptData,
        };
        Self::new(kind, error.to_string())
    }
}

impl From<&UpscaleError> for TileFailure {
    fn from(error: &UpscaleError) -> Self {
        Self::new(FailureKind::Upscale, error.to_string())
    }
}

impl From<&CacheError> for TileFailure {
    fn from(error: &CacheError) -> Self {
        let kind = match error {
            CacheError::OverBudget { .. } => FailureKind::OverBudget,
            CacheError::ResolutionMismatch { .. } => FailureKind::CorruptData,
        };
        Self::new(kind, error.to_string())
    }
}

/// Errors returned by cache writes
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum CacheError {
    #[error("tile needs {requested} bytes but only {available} fit in the memory budget")]
    OverBudget { requested: usize, available: usize },

    #[error("decoded buffer is {actual:?}, expected {expected:?}")]
    ResolutionMismatch {
        expected: Resolution,
        actual: Resolution,
    },
}

#[cfg(test)]
mod tests {
    use super::*;
    use pagetile_render::RgbaPixels;

    #[test]
    fn test_status_and_accessors() {
        let pixels = RgbaPixels::filled(4, 2, [0, 0, 0, 255]).into_shared();
        let ready = TileState::Ready {
            pixels,
            resolution: Resolution::new(4, 2),
        };
        assert_eq!(ready.status(), TileStatus::Ready);
        assert!(ready.pixels().is_some());
        assert_eq!(ready.resolution(), Some(Resolution::new(4, 2)));

        let decoding = TileState::Decoding {
            job: 7,
            token: CancellationToken::new(),
            target: Resolution::new(8, 8),
        };
        assert_eq!(decoding.job(), Some(7));
        assert!(decoding.pixels().is_none());
        assert!(format!("{:?}", decoding).starts_with("Decoding { job: 7"));
    }

    #[test]
    fn test_failure_from_decode_error() {
        let failure = TileFailure::from(&DecodeError::CorruptData("truncated".into()));
        assert_eq!(failure.kind, FailureKind::CorruptData);
        assert!(failure.message.contains("truncated"));

        let oob = TileFailure::from(&DecodeError::OutOfBounds {
            rect: pagetile_render::PixelRect::new(0, 0, 10, 10),
            width: 5,
            height: 5,
        });
        assert_eq!(oob.kind, FailureKind::OutOfBounds);
    }

    #[test]
    fn test_failure_from_cache_error() {
        let error = CacheError::OverBudget {
            requested: 100,
            available: 10,
        };
        let failure = TileFailure::from(&error);
        assert_eq!(failure.kind, FailureKind::OverBudget);
        assert_eq!(
            failure.to_string(),
            "OverBudget: tile needs 100 bytes but only 10 fit in the memory budget"
        );
    }
}
