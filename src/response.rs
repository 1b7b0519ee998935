//! Wire types for the upload endpoint.
//!
//! The HTTP layer is external; it deserialises the body into
//! [`UploadRequest`], hands it to [`crate::UploadPipeline::handle`], and
//! writes back the JSON of the returned [`UploadResponse`] with
//! [`UploadResponse::status_code`].
//!
//! ```text
//! POST /api/upload_photo   { "image": "data:image/jpeg;base64,…" }
//!
//! 200 { "success": true,  "result_image_url": "/images/corrected_….jpg",
//!       "input_size": "1280x720", "output_size": "860x540" }
//! 200 { "success": true,  "img_url": "data:image/jpeg;base64,…", … }
//! 422 { "success": false, "error": "No card detected: …", "poly_count": 3 }
//! ```

use crate::error::CardflatError;
use crate::upload::{ImageRef, UploadSuccess};
use serde::{Deserialize, Serialize};

/// Request body: one frame as (optionally data-URI prefixed) base64.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UploadRequest {
    pub image: String,
}

/// Response body for both outcomes. Absent fields are omitted from JSON.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct UploadResponse {
    pub success: bool,

    /// Stored-artifact reference.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub result_image_url: Option<String>,

    /// Inline data-URI payload.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub img_url: Option<String>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub input_size: Option<String>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub output_size: Option<String>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,

    /// Observed corner count, only for the wrong-count failure.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub poly_count: Option<usize>,

    #[serde(skip)]
    status: u16,
}

impl UploadResponse {
    pub fn from_success(ok: &UploadSuccess) -> Self {
        let (result_image_url, img_url) = match &ok.image {
            ImageRef::Stored { url, .. } => (Some(url.clone()), None),
            ImageRef::Inline(data) => (None, Some(data.clone())),
        };
        Self {
            success: true,
            result_image_url,
            img_url,
            input_size: Some(size_str(ok.input_size)),
            output_size: Some(size_str(ok.output_size)),
            error: None,
            poly_count: None,
            status: 200,
        }
    }

    pub fn from_error(err: &CardflatError) -> Self {
        let status = match err {
            CardflatError::Decode { .. } | CardflatError::Rectification { .. } => 400,
            CardflatError::DetectionCount { .. } => 422,
            CardflatError::Encode { .. }
            | CardflatError::Storage { .. }
            | CardflatError::InvalidConfig(_)
            | CardflatError::Internal(_) => 500,
        };
        Self {
            success: false,
            result_image_url: None,
            img_url: None,
            input_size: None,
            output_size: None,
            error: Some(err.to_string()),
            poly_count: err.poly_count(),
            status,
        }
    }

    pub fn from_result(result: &Result<UploadSuccess, CardflatError>) -> Self {
        match result {
            Ok(ok) => Self::from_success(ok),
            Err(e) => Self::from_error(e),
        }
    }

    /// HTTP status the transport layer should use.
    pub fn status_code(&self) -> u16 {
        self.status
    }

    pub fn to_json(&self) -> String {
        // Only strings, numbers and bools: serialisation cannot fail.
        serde_json::to_string(self).unwrap_or_default()
    }
}

/// Shape an upload result for the wire.
pub fn respond(result: &Result<UploadSuccess, CardflatError>) -> UploadResponse {
    UploadResponse::from_result(result)
}

fn size_str((w, h): (u32, u32)) -> String {
    format!("{w}x{h}")
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pipeline::detect::Point;
    use crate::store::StoredArtifact;
    use serde_json::Value;
    use std::path::PathBuf;
    use std::time::UNIX_EPOCH;

    fn success(image: ImageRef) -> UploadSuccess {
        UploadSuccess {
            image,
            input_size: (1280, 720),
            output_size: (860, 540),
            corners: [Point::new(0.0, 0.0); 4],
            duration_ms: 12,
        }
    }

    #[test]
    fn stored_success_uses_result_image_url() {
        let ok = success(ImageRef::Stored {
            url: "/images/a.jpg".into(),
            artifact: StoredArtifact {
                path: PathBuf::from("/srv/a.jpg"),
                file_name: "a.jpg".into(),
                created: UNIX_EPOCH,
            },
        });
        let resp = respond(&Ok(ok));
        assert_eq!(resp.status_code(), 200);
        let v: Value = serde_json::from_str(&resp.to_json()).unwrap();
        assert_eq!(v["success"], true);
        assert_eq!(v["result_image_url"], "/images/a.jpg");
        assert_eq!(v["input_size"], "1280x720");
        assert_eq!(v["output_size"], "860x540");
        assert!(v.get("img_url").is_none());
        assert!(v.get("poly_count").is_none());
    }

    #[test]
    fn inline_success_uses_img_url() {
        let resp = respond(&Ok(success(ImageRef::Inline(
            "data:image/jpeg;base64,AAAA".into(),
        ))));
        let v: Value = serde_json::from_str(&resp.to_json()).unwrap();
        assert_eq!(v["img_url"], "data:image/jpeg;base64,AAAA");
        assert!(v.get("result_image_url").is_none());
    }

    #[test]
    fn wrong_count_carries_poly_count() {
        let resp = respond(&Err(CardflatError::DetectionCount { count: 3 }));
        assert_eq!(resp.status_code(), 422);
        let v: Value = serde_json::from_str(&resp.to_json()).unwrap();
        assert_eq!(v["success"], false);
        assert_eq!(v["poly_count"], 3);
        assert!(v["error"].as_str().unwrap().contains('3'));
    }

    #[test]
    fn other_failures_omit_poly_count() {
        let resp = respond(&Err(CardflatError::decode("invalid base64")));
        assert_eq!(resp.status_code(), 400);
        let v: Value = serde_json::from_str(&resp.to_json()).unwrap();
        assert!(v.get("poly_count").is_none());

        let resp = respond(&Err(CardflatError::rectification("corners are collinear")));
        assert_eq!(resp.status_code(), 400);
        let v: Value = serde_json::from_str(&resp.to_json()).unwrap();
        assert!(v.get("poly_count").is_none());

        let resp = respond(&Err(CardflatError::Internal("boom".into())));
        assert_eq!(resp.status_code(), 500);
    }

    #[test]
    fn request_round_trips_from_json() {
        let req: UploadRequest = serde_json::from_str(r#"{"image":"abc"}"#).unwrap();
        assert_eq!(req.image, "abc");
    }
}
