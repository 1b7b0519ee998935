//! Configuration types for the upload pipeline.
//!
//! All pipeline behaviour is controlled through [`PipelineConfig`], built via
//! its [`PipelineConfigBuilder`]. The defaults reproduce the card-scanning
//! profile: 860 × 540 output (ID-1 card aspect), JPEG quality 98 on disk,
//! 30 retained artifacts.

use crate::error::CardflatError;
use serde::{Deserialize, Serialize};

/// Configuration for an [`crate::upload::UploadPipeline`].
///
/// # Example
/// ```rust
/// use cardflat::{OutputSize, PipelineConfig};
///
/// let config = PipelineConfig::builder()
///     .output_size(OutputSize::AspectWidth { width: 1600 })
///     .capacity(50)
///     .build()
///     .unwrap();
/// assert_eq!(config.capacity, 50);
/// ```
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PipelineConfig {
    /// Maximum number of artifacts kept on disk. Default: 30. Minimum: 1.
    pub capacity: usize,

    /// JPEG quality for stored artifacts, 1–100. Default: 98.
    pub store_quality: u8,

    /// JPEG quality for inline previews, 1–100. Default: 95.
    pub inline_quality: u8,

    /// Size of the rectified image. Default: fixed 860 × 540.
    pub output_size: OutputSize,

    /// Whether the response carries the image inline or a stored reference.
    /// Default: [`ResponseMode::Stored`].
    pub response_mode: ResponseMode,

    /// RGB fill for destination pixels that map outside the source frame.
    /// Default: black.
    pub background: [u8; 3],

    /// URL prefix under which the store directory is served. Default: `/images`.
    pub public_prefix: String,

    /// How long a save waits for its file to become visible, in milliseconds.
    /// Default: 2000.
    ///
    /// Synced or network filesystems can lag behind the write call; the store
    /// polls for the file up to this bound and then proceeds with a warning.
    pub visibility_timeout_ms: u64,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            capacity: 30,
            store_quality: 98,
            inline_quality: 95,
            output_size: OutputSize::default(),
            response_mode: ResponseMode::default(),
            background: [0, 0, 0],
            public_prefix: "/images".to_string(),
            visibility_timeout_ms: 2000,
        }
    }
}

impl PipelineConfig {
    /// Create a new builder for `PipelineConfig`.
    pub fn builder() -> PipelineConfigBuilder {
        PipelineConfigBuilder {
            config: Self::default(),
        }
    }
}

/// Builder for [`PipelineConfig`].
#[derive(Debug)]
pub struct PipelineConfigBuilder {
    config: PipelineConfig,
}

impl PipelineConfigBuilder {
    pub fn capacity(mut self, n: usize) -> Self {
        self.config.capacity = n;
        self
    }

    pub fn store_quality(mut self, q: u8) -> Self {
        self.config.store_quality = q.clamp(1, 100);
        self
    }

    pub fn inline_quality(mut self, q: u8) -> Self {
        self.config.inline_quality = q.clamp(1, 100);
        self
    }

    pub fn output_size(mut self, size: OutputSize) -> Self {
        self.config.output_size = size;
        self
    }

    pub fn response_mode(mut self, mode: ResponseMode) -> Self {
        self.config.response_mode = mode;
        self
    }

    pub fn background(mut self, rgb: [u8; 3]) -> Self {
        self.config.background = rgb;
        self
    }

    pub fn public_prefix(mut self, prefix: impl Into<String>) -> Self {
        self.config.public_prefix = prefix.into();
        self
    }

    pub fn visibility_timeout_ms(mut self, ms: u64) -> Self {
        self.config.visibility_timeout_ms = ms;
        self
    }

    /// Build the configuration, validating constraints.
    pub fn build(self) -> Result<PipelineConfig, CardflatError> {
        let c = &self.config;
        if c.capacity == 0 {
            return Err(CardflatError::InvalidConfig(
                "Capacity must be ≥ 1".into(),
            ));
        }
        match c.output_size {
            OutputSize::Fixed { width, height } if width == 0 || height == 0 => {
                return Err(CardflatError::InvalidConfig(format!(
                    "Output size must be non-zero, got {width}x{height}"
                )));
            }
            OutputSize::AspectWidth { width: 0 } => {
                return Err(CardflatError::InvalidConfig(
                    "Output width must be non-zero".into(),
                ));
            }
            _ => {}
        }
        Ok(self.config)
    }
}

// ── Enums ────────────────────────────────────────────────────────────────

/// Target size of the rectified image.
///
/// | Profile | Use case |
/// |---------|----------|
/// | `Fixed { 860, 540 }` | ID cards, credit-card sized documents (default) |
/// | `AspectWidth { 1600 }` | Arbitrary documents; height follows the frame |
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum OutputSize {
    /// Exact width and height.
    Fixed { width: u32, height: u32 },
    /// Fixed width; height preserves the source frame's aspect ratio.
    AspectWidth { width: u32 },
}

impl Default for OutputSize {
    fn default() -> Self {
        OutputSize::Fixed {
            width: 860,
            height: 540,
        }
    }
}

impl OutputSize {
    /// Resolve the concrete `(width, height)` for a source frame.
    ///
    /// Returns `None` when either source dimension is zero.
    pub fn resolve(&self, source_width: u32, source_height: u32) -> Option<(u32, u32)> {
        if source_width == 0 || source_height == 0 {
            return None;
        }
        match *self {
            OutputSize::Fixed { width, height } => Some((width, height)),
            OutputSize::AspectWidth { width } => {
                let height = (width as f64 * source_height as f64 / source_width as f64).round();
                Some((width, (height as u32).max(1)))
            }
        }
    }
}

/// Shape of a successful response.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum ResponseMode {
    /// Data-URI JPEG in the response body. Suited to small previews.
    Inline,
    /// Saved to the retention store; the response carries a URL. (default)
    #[default]
    Stored,
}
