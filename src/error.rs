//! Error types for the cardflat library.
//!
//! A single enum, [`CardflatError`], covers every failure the pipeline can
//! report. The variants map one-to-one onto the stages that produce them so
//! a caller (or [`crate::response::respond`]) can always name the specific
//! cause instead of a generic "processing failed":
//!
//! * [`CardflatError::Decode`]: the payload is not base64 or not an image.
//! * [`CardflatError::DetectionCount`]: the detector did not return exactly
//!   four corners. The user should reposition the document and retry.
//! * [`CardflatError::Rectification`]: the four corners are degenerate.
//! * [`CardflatError::Encode`]: the JPEG backend rejected the raster.
//! * [`CardflatError::Storage`]: the artifact could not be written.
//!
//! Deleting stale artifacts never produces an error value; those failures are
//! logged by [`crate::store::RetentionStore`] and retried on the next pass.

use std::path::PathBuf;
use thiserror::Error;

/// All errors returned by the cardflat library.
#[derive(Debug, Error)]
pub enum CardflatError {
    // ── Request errors ────────────────────────────────────────────────────
    /// Malformed base64 or an unrecognised/corrupt image container.
    #[error("Could not decode image: {reason}")]
    Decode { reason: String },

    /// The corner detector returned something other than four points.
    #[error("No card detected: found {count} corner points, expected 4")]
    DetectionCount { count: usize },

    /// The four corners do not define a usable projective transform.
    #[error("Perspective correction failed: {reason}")]
    Rectification { reason: String },

    /// The compression backend rejected the raster.
    #[error("Could not encode image: {reason}")]
    Encode { reason: String },

    // ── Storage errors ────────────────────────────────────────────────────
    /// Writing an artifact (or preparing the store directory) failed.
    #[error("Failed to write '{path}': {source}")]
    Storage {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    // ── Config errors ─────────────────────────────────────────────────────
    /// Builder validation failed.
    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    // ── Catch-all ─────────────────────────────────────────────────────────
    /// A blocking task panicked or was cancelled.
    #[error("Internal error: {0}")]
    Internal(String),
}

impl CardflatError {
    /// Observed corner count for [`CardflatError::DetectionCount`].
    pub fn poly_count(&self) -> Option<usize> {
        match self {
            CardflatError::DetectionCount { count } => Some(*count),
            _ => None,
        }
    }

    /// Whether the failure was caused by the submitted frame rather than by
    /// the server. Retrying the same frame will not help.
    pub fn is_request_error(&self) -> bool {
        matches!(
            self,
            CardflatError::Decode { .. }
                | CardflatError::DetectionCount { .. }
                | CardflatError::Rectification { .. }
        )
    }

    pub(crate) fn decode(reason: impl Into<String>) -> Self {
        CardflatError::Decode {
            reason: reason.into(),
        }
    }

    pub(crate) fn rectification(reason: impl Into<String>) -> Self {
        CardflatError::Rectification {
            reason: reason.into(),
        }
    }

    pub(crate) fn encode(reason: impl Into<String>) -> Self {
        CardflatError::Encode {
            reason: reason.into(),
        }
    }
}
