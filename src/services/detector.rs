use std::io::Cursor;
use std::time::Duration;

use base64::Engine;
use image::{DynamicImage, ImageFormat};
use reqwest::Client;
use serde::Deserialize;
use tokio::runtime::Handle;

use crate::services::stages::{FaceDetection, FaceDetector, Stage, StageError};

const REQUEST_TIMEOUT: Duration = Duration::from_secs(30);

/// Client for a remote face detection model served over HTTP.
///
/// The pipeline runs on blocking worker threads, so requests are driven
/// through the runtime handle captured at construction.
pub struct RemoteFaceDetector {
    http: Client,
    endpoint: String,
    api_token: Option<String>,
    runtime: Handle,
}

#[derive(Deserialize)]
struct DetectionResponse {
    result: FaceDetection,
}

impl RemoteFaceDetector {
    /// Must be called from within a tokio runtime.
    pub fn new(endpoint: String, api_token: Option<String>) -> Result<Self, DetectorError> {
        let http = Client::builder().timeout(REQUEST_TIMEOUT).build()?;
        let runtime = Handle::try_current().map_err(|_| DetectorError::NoRuntime)?;
        Ok(Self {
            http,
            endpoint,
            api_token,
            runtime,
        })
    }

    /// Send a PNG-encoded image to the detection endpoint.
    pub async fn detect_async(&self, image: &DynamicImage) -> Result<FaceDetection, DetectorError> {
        let mut png = Vec::new();
        image
            .write_to(&mut Cursor::new(&mut png), ImageFormat::Png)
            .map_err(|e| DetectorError::Encode(e.to_string()))?;

        let body = serde_json::json!({
            "image": base64::engine::general_purpose::STANDARD.encode(&png),
            "width": image.width(),
            "height": image.height(),
        });

        let mut request = self.http.post(&self.endpoint).json(&body);
        if let Some(token) = &self.api_token {
            request = request.bearer_auth(token);
        }

        let response = request.send().await?;
        let status = response.status();
        if status.is_server_error() {
            return Err(DetectorError::Unavailable(status.as_u16()));
        }
        if !status.is_success() {
            return Err(DetectorError::Rejected(status.as_u16()));
        }

        let parsed: DetectionResponse = response.json().await?;
        Ok(parsed.result)
    }
}

impl FaceDetector for RemoteFaceDetector {
    fn detect(&self, image: &DynamicImage) -> Result<FaceDetection, StageError> {
        self.runtime
            .block_on(self.detect_async(image))
            .map_err(StageError::from)
    }
}

#[derive(Debug, thiserror::Error)]
pub enum DetectorError {
    #[error("HTTP request failed: {0}")]
    Http(#[from] reqwest::Error),

    #[error("Failed to encode image for detection: {0}")]
    Encode(String),

    #[error("Detection service unavailable (status {0})")]
    Unavailable(u16),

    #[error("Detection service rejected the request (status {0})")]
    Rejected(u16),

    #[error("Face detector must be created inside a tokio runtime")]
    NoRuntime,
}

impl From<DetectorError> for StageError {
    fn from(err: DetectorError) -> Self {
        match err {
            // Transient: a later iteration may succeed.
            DetectorError::Http(_) | DetectorError::Unavailable(_) => {
                StageError::recoverable(Stage::Detection, err.to_string())
            }
            DetectorError::Encode(_) | DetectorError::Rejected(_) | DetectorError::NoRuntime => {
                StageError::fatal(Stage::Detection, err.to_string())
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_new_outside_runtime_fails() {
        let result = RemoteFaceDetector::new("http://localhost:1/detect".into(), None);
        assert!(matches!(result, Err(DetectorError::NoRuntime)));
    }

    #[test]
    fn test_error_recoverability() {
        assert!(StageError::from(DetectorError::Unavailable(503)).is_recoverable());
        assert!(!StageError::from(DetectorError::Rejected(400)).is_recoverable());
    }

    #[test]
    fn test_response_shape() {
        let json = r#"{"result":{"found":true,"confidence":0.93,
            "bbox":{"x":10.0,"y":12.0,"width":50.0,"height":64.0},
            "landmarks":{"left_eye":{"x":25.0,"y":30.0}},
            "metrics":{"overall_quality":0.9}}}"#;
        let parsed: DetectionResponse = serde_json::from_str(json).unwrap();
        assert!(parsed.result.found);
        assert_eq!(parsed.result.eye_line_y(), Some(30.0));
        assert_eq!(parsed.result.angle.max_abs(), 0.0);
    }
}
