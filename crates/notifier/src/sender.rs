//! Gateway transport: delivers one message to the outside world.

use std::time::Duration;

use async_trait::async_trait;
use reqwest::{Client, StatusCode};
use serde::Serialize;
use thiserror::Error;

use courier_common::error::AppError;

/// Why a delivery attempt did not reach the gateway.
#[derive(Debug, Error)]
pub enum SendError {
    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("Gateway rejected message with status {0}")]
    Rejected(StatusCode),

    #[error("Gateway unavailable: {0}")]
    Unavailable(String),
}

/// Delivery contract consumed by the dispatcher.
///
/// Implementations must bound every call with their own short timeout; the
/// dispatcher awaits `send` inline and does not guard against a sender that
/// never returns.
#[async_trait]
pub trait TransportSender: Send + Sync {
    /// `Ok(())` means the gateway accepted the message.
    async fn send(&self, recipient: &str, body: &str) -> Result<(), SendError>;
}

/// JSON body understood by maker-style webhook gateways.
#[derive(Debug, Serialize)]
struct WebhookPayload<'a> {
    value1: &'a str,
    value2: &'a str,
}

/// Sends each message as a JSON `POST` to a webhook gateway.
#[derive(Debug, Clone)]
pub struct WebhookSender {
    client: Client,
    url: String,
}

impl WebhookSender {
    /// Use an existing client so connections are pooled across sends.
    pub fn new(client: Client, url: impl Into<String>) -> Self {
        Self {
            client,
            url: url.into(),
        }
    }

    /// Build an HTTP client whose requests never outlive `timeout`.
    pub fn build_client(timeout: Duration) -> Result<Client, AppError> {
        Client::builder()
            .timeout(timeout)
            .connect_timeout(timeout)
            .build()
            .map_err(|e| AppError::Config(format!("failed to build HTTP client: {}", e)))
    }

    pub fn url(&self) -> &str {
        &self.url
    }
}

#[async_trait]
impl TransportSender for WebhookSender {
    async fn send(&self, recipient: &str, body: &str) -> Result<(), SendError> {
        let payload = WebhookPayload {
            value1: recipient,
            value2: body,
        };

        let response = self.client.post(&self.url).json(&payload).send().await?;

        let status = response.status();
        if !status.is_success() {
            return Err(SendError::Rejected(status));
        }

        tracing::debug!(status = %status, "Gateway accepted SMS");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_payload_shape() {
        let payload = WebhookPayload {
            value1: "+15550100",
            value2: "Your code is 1234",
        };
        assert_eq!(
            serde_json::to_value(&payload).unwrap(),
            serde_json::json!({"value1": "+15550100", "value2": "Your code is 1234"})
        );
    }

    #[test]
    fn test_build_client() {
        let client = WebhookSender::build_client(Duration::from_secs(5)).unwrap();
        let sender = WebhookSender::new(client, "https://gateway.example/trigger/sms");
        assert_eq!(sender.url(), "https://gateway.example/trigger/sms");
    }

    #[test]
    fn test_rejected_error_message() {
        let err = SendError::Rejected(StatusCode::TOO_MANY_REQUESTS);
        assert_eq!(
            err.to_string(),
            "Gateway rejected message with status 429 Too Many Requests"
        );
    }

    #[tokio::test]
    async fn test_unreachable_gateway_is_http_error() {
        let client = WebhookSender::build_client(Duration::from_millis(200)).unwrap();
        // Port 9 (discard) on localhost is not expected to accept HTTP.
        let sender = WebhookSender::new(client, "http://127.0.0.1:9/sms");
        let result = sender.send("+15550100", "hello").await;
        assert!(matches!(result, Err(SendError::Http(_))));
    }
}
