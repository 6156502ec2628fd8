//! Guide directory over the listing service's HTTP API.

use guidepay_core::BoxFuture;
use guidepay_core::guide::{DirectoryError, GuideDirectory, GuideProfile};
use guidepay_core::types::GuideId;
use reqwest::{Client, StatusCode};
use std::time::Duration;

/// [`GuideDirectory`] reading `GET {base}/guides/{id}`.
#[derive(Clone, Debug)]
pub struct HttpGuideDirectory {
    base_url: String,
    http_client: Client,
}

impl HttpGuideDirectory {
    /// Create a directory client whose requests time out after `timeout`.
    #[must_use]
    pub fn new(base_url: impl Into<String>, timeout: Duration) -> Self {
        let http_client = Client::builder()
            .timeout(timeout)
            .build()
            .unwrap_or_else(|error| {
                tracing::warn!(error = %error, "Falling back to default HTTP client");
                Client::new()
            });
        Self {
            base_url: base_url.into().trim_end_matches('/').to_string(),
            http_client,
        }
    }
}

impl GuideDirectory for HttpGuideDirectory {
    fn find_guide(&self, id: GuideId) -> BoxFuture<'_, Result<Option<GuideProfile>, DirectoryError>> {
        Box::pin(async move {
            let response = self
                .http_client
                .get(format!("{}/guides/{id}", self.base_url))
                .send()
                .await
                .map_err(|e| DirectoryError(e.to_string()))?;

            if response.status() == StatusCode::NOT_FOUND {
                return Ok(None);
            }
            if !response.status().is_success() {
                let status = response.status();
                let body = response.text().await.unwrap_or_default();
                tracing::warn!(guide_id = %id, status = %status, "Guide lookup failed");
                return Err(DirectoryError(format!("{status}: {body}")));
            }

            response
                .json::<GuideProfile>()
                .await
                .map(Some)
                .map_err(|e| DirectoryError(e.to_string()))
        })
    }
}
