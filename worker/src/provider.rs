//! HTTP payment provider client.
//!
//! Speaks the Stripe-style intent API: form-encoded requests, bearer
//! authentication and an `Idempotency-Key` header on creation so that a
//! retried call returns the intent created by the first one.

use guidepay_core::BoxFuture;
use guidepay_core::provider::{
    CreateIntentRequest, PaymentProvider, ProviderError, ProviderIntent,
};
use reqwest::{Client, Response, StatusCode};
use std::time::Duration;

/// [`PaymentProvider`] over HTTPS.
///
/// # Example
///
/// ```no_run
/// use guidepay_worker::provider::HttpPaymentProvider;
/// use std::time::Duration;
///
/// let provider = HttpPaymentProvider::new(
///     "https://api.stripe.com",
///     std::env::var("PAYMENT_PROVIDER_SECRET_KEY").unwrap_or_default(),
///     Duration::from_secs(3),
/// );
/// ```
#[derive(Clone, Debug)]
pub struct HttpPaymentProvider {
    /// API base URL, without trailing slash.
    base_url: String,

    /// API secret key (keep confidential).
    secret_key: String,

    /// HTTP client for making requests.
    http_client: Client,
}

impl HttpPaymentProvider {
    /// Create a client whose requests time out after `timeout`.
    #[must_use]
    pub fn new(base_url: impl Into<String>, secret_key: impl Into<String>, timeout: Duration) -> Self {
        let http_client = Client::builder()
            .timeout(timeout)
            .build()
            .unwrap_or_else(|error| {
                tracing::warn!(error = %error, "Falling back to default HTTP client");
                Client::new()
            });
        Self {
            base_url: base_url.into().trim_end_matches('/').to_string(),
            secret_key: secret_key.into(),
            http_client,
        }
    }

    fn intents_url(&self) -> String {
        format!("{}/v1/payment_intents", self.base_url)
    }
}

/// Form fields of an intent creation request.
fn intent_form(request: &CreateIntentRequest) -> Vec<(String, String)> {
    let mut form = vec![
        ("amount".to_string(), request.amount.minor().to_string()),
        ("currency".to_string(), request.currency.clone()),
        (
            "automatic_payment_methods[enabled]".to_string(),
            "true".to_string(),
        ),
    ];
    form.extend(
        request
            .metadata
            .iter()
            .map(|(key, value)| (format!("metadata[{key}]"), value.clone())),
    );
    form
}

fn send_error(error: &reqwest::Error) -> ProviderError {
    if error.is_timeout() {
        ProviderError::Timeout
    } else {
        ProviderError::Unavailable(error.to_string())
    }
}

/// Map a non-success status to a provider error.
///
/// `409` is a concurrent request with the same idempotency key; repeating it
/// later is safe.
fn status_error(status: StatusCode, body: String) -> ProviderError {
    match status {
        StatusCode::NOT_FOUND => ProviderError::NotFound(body),
        StatusCode::CONFLICT | StatusCode::TOO_MANY_REQUESTS | StatusCode::REQUEST_TIMEOUT => {
            ProviderError::Unavailable(format!("{status}: {body}"))
        }
        status if status.is_server_error() => {
            ProviderError::Unavailable(format!("{status}: {body}"))
        }
        status => ProviderError::Rejected(format!("{status}: {body}")),
    }
}

async fn decode(response: Response) -> Result<ProviderIntent, ProviderError> {
    let status = response.status();
    if !status.is_success() {
        let body = response.text().await.unwrap_or_default();
        tracing::warn!(status = %status, body = %body, "Payment provider request failed");
        return Err(status_error(status, body));
    }
    response
        .json::<ProviderIntent>()
        .await
        .map_err(|e| ProviderError::Decode(e.to_string()))
}

impl PaymentProvider for HttpPaymentProvider {
    fn create_intent(
        &self,
        request: CreateIntentRequest,
    ) -> BoxFuture<'_, Result<ProviderIntent, ProviderError>> {
        Box::pin(async move {
            let response = self
                .http_client
                .post(self.intents_url())
                .bearer_auth(&self.secret_key)
                .header("Idempotency-Key", &request.idempotency_key)
                .form(&intent_form(&request))
                .send()
                .await
                .map_err(|e| send_error(&e))?;

            let intent = decode(response).await?;
            tracing::debug!(intent_id = %intent.id, "Payment intent created");
            Ok(intent)
        })
    }

    fn retrieve_intent<'a>(
        &'a self,
        intent_id: &'a str,
    ) -> BoxFuture<'a, Result<ProviderIntent, ProviderError>> {
        Box::pin(async move {
            let response = self
                .http_client
                .get(format!("{}/{intent_id}", self.intents_url()))
                .bearer_auth(&self.secret_key)
                .send()
                .await
                .map_err(|e| send_error(&e))?;

            decode(response).await
        })
    }
}
