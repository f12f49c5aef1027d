use std::path::Path;
use std::time::Duration;

use base64::Engine;
use base64::engine::general_purpose::STANDARD as BASE64;
use serde::Deserialize;

use fd_core::Payload;

use crate::error::AppError;

#[derive(Debug, Clone, Deserialize, PartialEq)]
pub struct GeneratedImage {
    pub url: String,
}

/// The slice of the service response this engine cares about. Extra fields
/// vary per model and are ignored.
#[derive(Debug, Clone, Deserialize)]
pub struct GenerateResponse {
    pub images: Vec<GeneratedImage>,
    #[serde(default)]
    pub seed: Option<i64>,
}

/// Opaque client for the hosted generation API. One blocking call per job,
/// always made from a background thread.
pub trait RemoteService: Send + Sync {
    fn generate(&self, endpoint: &str, payload: &Payload) -> Result<GenerateResponse, AppError>;
}

pub struct FalClient {
    http: reqwest::blocking::Client,
    base_url: String,
    api_key: String,
}

impl FalClient {
    pub fn new(api_key: impl Into<String>) -> Self {
        Self::with_base_url("https://fal.run", api_key)
    }

    pub fn with_base_url(base_url: impl Into<String>, api_key: impl Into<String>) -> Self {
        // No overall timeout: generation runs for minutes and the service
        // holds the request open. Connecting still fails fast.
        let http = reqwest::blocking::Client::builder()
            .timeout(None)
            .connect_timeout(Duration::from_secs(10))
            .build()
            .expect("failed to build http client");

        Self {
            http,
            base_url: base_url.into(),
            api_key: api_key.into(),
        }
    }
}

impl RemoteService for FalClient {
    fn generate(&self, endpoint: &str, payload: &Payload) -> Result<GenerateResponse, AppError> {
        let url = format!("{}/{}", self.base_url, endpoint);

        let response = self
            .http
            .post(url)
            .header("Authorization", format!("Key {}", self.api_key))
            .json(payload)
            .send()
            .map_err(|e| AppError::Remote(e.to_string()))?;

        if !response.status().is_success() {
            let status = response.status();
            let body = response.text().unwrap_or_default();
            return Err(AppError::Remote(format!("HTTP {}: {}", status, body)));
        }

        response
            .json()
            .map_err(|e| AppError::MalformedResponse(e.to_string()))
    }
}

/// Resolve a local image file into a data URL the service accepts as
/// `image_url`. The payload builder only ever sees resolved URLs, never
/// filesystem paths.
pub fn image_data_url(path: &Path) -> Result<String, AppError> {
    let bytes = std::fs::read(path)?;

    let ext = path
        .extension()
        .and_then(|e| e.to_str())
        .map(str::to_ascii_lowercase);
    let mime = match ext.as_deref() {
        Some("jpg") | Some("jpeg") => "jpeg",
        Some("gif") => "gif",
        Some("webp") => "webp",
        _ => "png",
    };

    Ok(format!("data:image/{};base64,{}", mime, BASE64.encode(bytes)))
}
