//! # cardflat
//!
//! Find a card or document in a camera frame, flatten its perspective, and
//! keep the most recent results on disk.
//!
//! ## Pipeline Overview
//!
//! ```text
//! base64 frame
//!  │
//!  ├─ 1. Decode   strip data-URI header, base64 → JPEG/PNG → RGB raster
//!  ├─ 2. Detect   injected CornerDetector (CPU-bound, spawn_blocking)
//!  ├─ 3. Validate exactly four corners, else DetectionCount { count }
//!  ├─ 4. Rectify  homography onto 860×540 (or width-only) + bilinear warp
//!  └─ 5. Deliver  inline data-URI, or JPEG in a capacity-bounded store
//! ```
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use cardflat::{FrameCorners, PipelineConfig, RetentionStore, UploadPipeline};
//! use std::sync::Arc;
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let config = PipelineConfig::default();
//!     let store = RetentionStore::from_config("images", &config)?;
//!     // Swap FrameCorners for a real document detector.
//!     let pipeline = UploadPipeline::new(config, Arc::new(FrameCorners), Some(store))?;
//!
//!     let body = r#"{"image":"data:image/jpeg;base64,..."}"#;
//!     let response = pipeline.handle_json(body).await;
//!     println!("{} {}", response.status_code(), response.to_json());
//!     Ok(())
//! }
//! ```
//!
//! ## Feature Flags
//!
//! | Feature | Default | Description |
//! |---------|---------|-------------|
//! | `cli`   | on      | Enables the `cardflat` binary (clap + anyhow + tracing-subscriber) |

// ── Modules ──────────────────────────────────────────────────────────────

pub mod config;
pub mod error;
pub mod pipeline;
pub mod response;
pub mod store;
pub mod upload;

// ── Re-exports ───────────────────────────────────────────────────────────

pub use config::{OutputSize, PipelineConfig, PipelineConfigBuilder, ResponseMode};
pub use error::CardflatError;
pub use pipeline::codec::{decode, encode, Frame};
pub use pipeline::detect::{
    CornerDetector, Detection, ExclusiveDetector, FixedCorners, FrameCorners, Point, Quadrangle,
    Serialized,
};
pub use pipeline::rectify::{rectify, Homography};
pub use response::{respond, UploadRequest, UploadResponse};
pub use store::{RetentionStore, StoredArtifact};
pub use upload::{ImageRef, UploadPipeline, UploadSuccess};
