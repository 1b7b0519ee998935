//! Upload pipeline: one captured frame in, one flat card image out.
//!
//! ```text
//! text ─▶ decode ─▶ [archive frame] ─▶ detect ─▶ 4 corners? ─▶ rectify ─▶ inline | store
//! ```
//!
//! Decoding, detection and rectification are CPU-bound and run on tokio's
//! blocking pool so a slow frame never stalls the runtime that accepts new
//! requests. Requests share nothing mutable except the store directories.
//! There is no cancellation: a caller that stops waiting leaves the blocking
//! work to finish on its own.

use crate::config::{PipelineConfig, ResponseMode};
use crate::error::CardflatError;
use crate::pipeline::codec::{self, Frame};
use crate::pipeline::detect::{CornerDetector, Detection, Quadrangle};
use crate::pipeline::rectify;
use crate::response::{UploadRequest, UploadResponse};
use crate::store::{RetentionStore, StoredArtifact};
use futures::stream::{self, StreamExt};
use image::{ImageFormat, RgbImage};
use std::sync::Arc;
use std::time::Instant;
use tracing::{debug, info, warn};

/// Where the rectified image ended up.
#[derive(Debug, Clone)]
pub enum ImageRef {
    /// `data:image/jpeg;base64,…`
    Inline(String),
    /// Saved in the retention store and reachable at `url`.
    Stored { url: String, artifact: StoredArtifact },
}

/// Result of a successful upload.
#[derive(Debug, Clone)]
pub struct UploadSuccess {
    pub image: ImageRef,
    /// Decoded frame size, `(width, height)`.
    pub input_size: (u32, u32),
    /// Rectified image size, `(width, height)`.
    pub output_size: (u32, u32),
    /// Corners the detector reported, in detector order.
    pub corners: Quadrangle,
    pub duration_ms: u64,
}

/// Decode → detect → rectify → store/encode.
///
/// The detector is injected once and shared by every request.
pub struct UploadPipeline {
    config: PipelineConfig,
    detector: Arc<dyn CornerDetector>,
    store: Option<RetentionStore>,
    frame_archive: Option<RetentionStore>,
}

impl UploadPipeline {
    /// Create a pipeline.
    ///
    /// `store` is required when `config.response_mode` is
    /// [`ResponseMode::Stored`].
    pub fn new(
        config: PipelineConfig,
        detector: Arc<dyn CornerDetector>,
        store: Option<RetentionStore>,
    ) -> Result<Self, CardflatError> {
        if config.response_mode == ResponseMode::Stored && store.is_none() {
            return Err(CardflatError::InvalidConfig(
                "Stored response mode needs a retention store".into(),
            ));
        }
        Ok(Self {
            config,
            detector,
            store,
            frame_archive: None,
        })
    }

    /// Also keep every incoming frame, as received, in `archive`.
    pub fn with_frame_archive(mut self, archive: RetentionStore) -> Self {
        self.frame_archive = Some(archive);
        self
    }

    pub fn config(&self) -> &PipelineConfig {
        &self.config
    }

    pub fn store(&self) -> Option<&RetentionStore> {
        self.store.as_ref()
    }

    /// Run one frame through the pipeline.
    ///
    /// # Errors
    /// - [`CardflatError::Decode`]: bad base64 or image data
    /// - [`CardflatError::DetectionCount`]: detector did not return 4 corners
    /// - [`CardflatError::Rectification`]: degenerate corners
    /// - [`CardflatError::Encode`] / [`CardflatError::Storage`]: output failed
    pub async fn process(&self, encoded: impl AsRef<str>) -> Result<UploadSuccess, CardflatError> {
        let start = Instant::now();
        let text = encoded.as_ref().to_owned();
        info!("Processing upload: {} chars", text.len());

        // ── Step 1: Decode ───────────────────────────────────────────────
        let (frame, raster) = blocking("Decode", move || {
            let frame = codec::decode_frame(&text)?;
            let raster = frame.to_raster()?;
            Ok((frame, raster))
        })
        .await?;
        let input_size = raster.dimensions();

        // ── Step 2: Archive the raw frame ────────────────────────────────
        if let Some(archive) = &self.frame_archive {
            archive_frame(archive, frame, &raster).await;
        }

        // ── Step 3: Detect + validate + rectify ──────────────────────────
        let detector = Arc::clone(&self.detector);
        let size = self.config.output_size;
        let background = self.config.background;
        let (corners, rectified) = blocking("Rectify", move || {
            let corners = match Detection::from_points(detector.detect(&raster)) {
                Detection::Quadrangle(q) => q,
                Detection::WrongCount(count) => {
                    info!("No card detected: {} corner points", count);
                    return Err(CardflatError::DetectionCount { count });
                }
            };
            info!("Card detected, correcting perspective");
            let out = rectify::rectify(&raster, &corners, size, background)?;
            Ok((corners, out))
        })
        .await?;
        let output_size = rectified.dimensions();

        // ── Step 4: Deliver ──────────────────────────────────────────────
        let image = match (self.config.response_mode, &self.store) {
            (ResponseMode::Stored, Some(store)) => {
                let artifact = store.save(&rectified).await?;
                ImageRef::Stored {
                    url: artifact.url(&self.config.public_prefix),
                    artifact,
                }
            }
            (ResponseMode::Stored, None) => {
                return Err(CardflatError::InvalidConfig(
                    "Stored response mode needs a retention store".into(),
                ));
            }
            (ResponseMode::Inline, _) => {
                let quality = self.config.inline_quality;
                ImageRef::Inline(blocking("Encode", move || codec::encode(&rectified, quality)).await?)
            }
        };

        let duration_ms = start.elapsed().as_millis() as u64;
        info!(
            "Upload complete: {}x{} → {}x{} in {}ms",
            input_size.0, input_size.1, output_size.0, output_size.1, duration_ms
        );

        Ok(UploadSuccess {
            image,
            input_size,
            output_size,
            corners,
            duration_ms,
        })
    }

    /// Process a wire request and shape the response. Never fails.
    pub async fn handle(&self, request: &UploadRequest) -> UploadResponse {
        UploadResponse::from_result(&self.process(&request.image).await)
    }

    /// Parse a JSON request body, process it, and shape the response.
    pub async fn handle_json(&self, body: &str) -> UploadResponse {
        match serde_json::from_str::<UploadRequest>(body) {
            Ok(request) => self.handle(&request).await,
            Err(e) => UploadResponse::from_error(&CardflatError::decode(format!(
                "invalid request body: {e}"
            ))),
        }
    }

    /// Process several frames with up to `concurrency` in flight.
    ///
    /// Results come back in input order.
    pub async fn process_batch<S: AsRef<str>>(
        &self,
        frames: &[S],
        concurrency: usize,
    ) -> Vec<Result<UploadSuccess, CardflatError>> {
        stream::iter(frames.iter().map(|f| self.process(f.as_ref())))
            .buffered(concurrency.max(1))
            .collect()
            .await
    }
}

/// Keep the incoming frame. JPEG bytes are stored untouched; other
/// containers are re-encoded. Failures never fail the upload.
async fn archive_frame(archive: &RetentionStore, frame: Frame, raster: &RgbImage) {
    let result = if frame.format == ImageFormat::Jpeg {
        archive.save_bytes(frame.bytes).await
    } else {
        archive.save(raster).await
    };
    match result {
        Ok(artifact) => debug!("Archived frame as {}", artifact.file_name),
        Err(e) => warn!("Failed to archive frame: {}", e),
    }
}

/// Run CPU-bound work on the blocking pool.
async fn blocking<T, F>(stage: &str, f: F) -> Result<T, CardflatError>
where
    F: FnOnce() -> Result<T, CardflatError> + Send + 'static,
    T: Send + 'static,
{
    tokio::task::spawn_blocking(f)
        .await
        .map_err(|e| CardflatError::Internal(format!("{} task panicked: {}", stage, e)))?
}
