//! Corner detection: the injected capability that finds the card outline.
//!
//! The pipeline does not know how corners are found. It calls
//! [`CornerDetector::detect`] and branches only on whether exactly four
//! points came back, via [`Detection::from_points`]. Anything from an ONNX
//! document aligner to a fixed point set in a test plugs in here.
//!
//! ## Sharing a model across requests
//!
//! The detector is constructed once and handed to the pipeline as an
//! `Arc<dyn CornerDetector>`. `detect` takes `&self` and the trait requires
//! `Send + Sync`, so requests call it concurrently. A model whose inference
//! entry point needs exclusive access implements [`ExclusiveDetector`]
//! instead and is wrapped in [`Serialized`], which funnels every call through
//! a mutex.

use image::RgbImage;
use serde::{Deserialize, Serialize};
use std::sync::Mutex;
use tracing::{debug, error};

/// A point in source-image pixel coordinates.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Point {
    pub x: f32,
    pub y: f32,
}

impl Point {
    pub const fn new(x: f32, y: f32) -> Self {
        Self { x, y }
    }
}

impl From<(f32, f32)> for Point {
    fn from((x, y): (f32, f32)) -> Self {
        Self { x, y }
    }
}

/// Four corners, expected as top-left, top-right, bottom-right, bottom-left.
///
/// The ordering is whatever the detector produced; it is not re-sorted.
pub type Quadrangle = [Point; 4];

/// Outcome of validating a detector's output.
#[derive(Debug, Clone, PartialEq)]
pub enum Detection {
    /// Exactly four corners: ready for rectification.
    Quadrangle(Quadrangle),
    /// Any other number of points. Carries the observed count.
    WrongCount(usize),
}

impl Detection {
    pub fn from_points(points: Vec<Point>) -> Self {
        match <[Point; 4]>::try_from(points) {
            Ok(quad) => Detection::Quadrangle(quad),
            Err(points) => Detection::WrongCount(points.len()),
        }
    }
}

/// Finds the boundary of a document in a frame.
pub trait CornerDetector: Send + Sync {
    /// Return zero or more points outlining the candidate document.
    fn detect(&self, frame: &RgbImage) -> Vec<Point>;
}

/// A detector whose inference needs `&mut self`.
pub trait ExclusiveDetector: Send {
    fn detect_mut(&mut self, frame: &RgbImage) -> Vec<Point>;
}

/// Serialises calls to an [`ExclusiveDetector`] behind a mutex.
pub struct Serialized<D> {
    inner: Mutex<D>,
}

impl<D: ExclusiveDetector> Serialized<D> {
    pub fn new(detector: D) -> Self {
        Self {
            inner: Mutex::new(detector),
        }
    }
}

impl<D: ExclusiveDetector> CornerDetector for Serialized<D> {
    fn detect(&self, frame: &RgbImage) -> Vec<Point> {
        match self.inner.lock() {
            Ok(mut detector) => detector.detect_mut(frame),
            Err(_) => {
                // A previous inference panicked mid-call; the model state is
                // unknown, so report "nothing found".
                error!("Corner detector lock poisoned; reporting no corners");
                Vec::new()
            }
        }
    }
}

/// Always returns the same points, whatever the frame.
///
/// Used for manually supplied corners and as a deterministic test stub.
#[derive(Debug, Clone, Default)]
pub struct FixedCorners {
    points: Vec<Point>,
}

impl FixedCorners {
    pub fn new(points: impl IntoIterator<Item = Point>) -> Self {
        Self {
            points: points.into_iter().collect(),
        }
    }
}

impl CornerDetector for FixedCorners {
    fn detect(&self, _frame: &RgbImage) -> Vec<Point> {
        self.points.clone()
    }
}

/// Treats the whole frame as the document: returns its extreme pixel corners.
#[derive(Debug, Clone, Copy, Default)]
pub struct FrameCorners;

impl CornerDetector for FrameCorners {
    fn detect(&self, frame: &RgbImage) -> Vec<Point> {
        let (w, h) = frame.dimensions();
        if w == 0 || h == 0 {
            return Vec::new();
        }
        let (r, b) = ((w - 1) as f32, (h - 1) as f32);
        debug!("Using frame corners for {}x{} frame", w, h);
        vec![
            Point::new(0.0, 0.0),
            Point::new(r, 0.0),
            Point::new(r, b),
            Point::new(0.0, b),
        ]
    }
}
