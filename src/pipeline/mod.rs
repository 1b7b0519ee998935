//! Pipeline stages for card rectification.
//!
//! Each submodule implements exactly one transformation step and is
//! independently testable. The orchestration lives in [`crate::upload`].
//!
//! ## Data Flow
//!
//! ```text
//! codec ──▶ detect ──▶ rectify ──▶ codec / store
//! (base64)  (corners)  (homography) (JPEG)
//! ```
//!
//! 1. [`codec`]: strip the data-URI header, base64-decode, decompress
//! 2. [`detect`]: the injected corner detector plus the four-corner check
//! 3. [`rectify`]: solve the homography, reject degenerate quads, resample
//!
//! Stages 1–3 are CPU-bound and run on tokio's blocking pool.

pub mod codec;
pub mod detect;
pub mod rectify;
