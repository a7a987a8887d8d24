//! JSON-over-HTTP detection service client
//!
//! `POST {endpoint}/labels` and `POST {endpoint}/text`, each with either a JSON
//! reference `{"collection": .., "item": ..}` or, when image upload is enabled,
//! the raw image bytes.

use crate::detector::Detector;
use crate::error::DetectError;
use crate::store::ObjectStore;
use async_trait::async_trait;
use reqwest::header::CONTENT_TYPE;
use reqwest::{Client, StatusCode};
use serde::de::DeserializeOwned;
use serde::Deserialize;
use serde_json::json;
use sifter_core::{ImageRef, LabelObservation, TextFragment};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tracing::debug;

const COLLECTION_HEADER: &str = "X-Sifter-Collection";
const ITEM_HEADER: &str = "X-Sifter-Item";

#[derive(Debug, Deserialize)]
struct LabelsResponse {
    #[serde(default)]
    labels: Vec<LabelObservation>,
}

#[derive(Debug, Deserialize)]
struct TextResponse {
    #[serde(default)]
    fragments: Vec<TextFragment>,
}

/// Client of a remote detection service
pub struct HttpDetector {
    client: Client,
    endpoint: String,
    api_key: Option<String>,
    upload_from: Option<Arc<dyn ObjectStore>>,
    closed: AtomicBool,
}

impl HttpDetector {
    pub fn new(endpoint: impl Into<String>) -> Result<Self, DetectError> {
        let endpoint = endpoint.into().trim_end_matches('/').to_string();
        if !(endpoint.starts_with("http://") || endpoint.starts_with("https://")) {
            return Err(DetectError::Unrecoverable(format!(
                "endpoint '{}' is not an http(s) URL",
                endpoint
            )));
        }

        Ok(Self {
            client: Client::builder().build()?,
            endpoint,
            api_key: None,
            upload_from: None,
            closed: AtomicBool::new(false),
        })
    }

    pub fn with_api_key(mut self, api_key: impl Into<String>) -> Self {
        self.api_key = Some(api_key.into());
        self
    }

    /// Bound every request; without this only the service decides when to give up
    pub fn with_timeout(mut self, timeout: Duration) -> Result<Self, DetectError> {
        self.client = Client::builder().timeout(timeout).build()?;
        Ok(self)
    }

    /// Send image bytes read from `store` instead of a reference
    pub fn with_image_upload(mut self, store: Arc<dyn ObjectStore>) -> Self {
        self.upload_from = Some(store);
        self
    }

    pub fn endpoint(&self) -> &str {
        &self.endpoint
    }

    async fn call<T: DeserializeOwned>(&self, route: &str, image: &ImageRef) -> Result<T, DetectError> {
        if self.closed.load(Ordering::Acquire) {
            return Err(DetectError::Closed(self.endpoint.clone()));
        }

        let url = format!("{}/{}", self.endpoint, route);
        let mut request = self.client.post(&url);
        if let Some(key) = &self.api_key {
            request = request.bearer_auth(key);
        }

        request = match &self.upload_from {
            Some(store) => {
                let bytes = store.fetch(image).await.map_err(|e| {
                    DetectError::Rejected(format!("cannot read {} for upload: {}", image, e))
                })?;
                request
                    .header(CONTENT_TYPE, "application/octet-stream")
                    .header(COLLECTION_HEADER, image.collection.as_str())
                    .header(ITEM_HEADER, image.item.as_str())
                    .body(bytes)
            }
            None => request.json(&json!({
                "collection": image.collection,
                "item": image.item.as_str(),
            })),
        };

        debug!("POST {} for {}", url, image);
        let response = request
            .send()
            .await
            .map_err(|e| DetectError::Transient(format!("{} unreachable: {}", url, e)))?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(classify_status(status, &body));
        }

        response
            .json::<T>()
            .await
            .map_err(|e| DetectError::Decode(format!("{}: {}", url, e)))
    }
}

/// Map a non-success status onto the pipeline's failure classes
pub(crate) fn classify_status(status: StatusCode, body: &str) -> DetectError {
    let detail: String = body.chars().take(200).collect();
    let message = if detail.is_empty() {
        status.to_string()
    } else {
        format!("{}: {}", status, detail)
    };

    match status {
        StatusCode::UNAUTHORIZED | StatusCode::FORBIDDEN => DetectError::Unrecoverable(message),
        StatusCode::REQUEST_TIMEOUT | StatusCode::TOO_MANY_REQUESTS => {
            DetectError::Transient(message)
        }
        s if s.is_server_error() => DetectError::Transient(message),
        s if s.is_client_error() => DetectError::Rejected(message),
        _ => DetectError::Decode(message),
    }
}

#[async_trait]
impl Detector for HttpDetector {
    fn name(&self) -> &str {
        "http"
    }

    async fn detect_labels(&self, image: &ImageRef) -> Result<Vec<LabelObservation>, DetectError> {
        let response: LabelsResponse = self.call("labels", image).await?;
        Ok(response.labels)
    }

    async fn detect_text(&self, image: &ImageRef) -> Result<Vec<TextFragment>, DetectError> {
        let response: TextResponse = self.call("text", image).await?;
        Ok(response.fragments)
    }

    async fn close(&self) -> Result<(), DetectError> {
        self.closed.store(true, Ordering::Release);
        Ok(())
    }
}
