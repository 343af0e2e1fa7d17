//! Generic HTTP webhook channel.
//!
//! Posts the raw notification as JSON to a configured endpoint. The
//! specialised channels reuse this shape with their own payload formats.

use async_trait::async_trait;
use std::time::Duration;
use tracing::debug;

use crate::{message_id, Channel, ChangeNotification, ChannelOutcome};

pub(crate) const SEND_TIMEOUT: Duration = Duration::from_secs(30);

/// Channel posting notifications to an arbitrary webhook.
pub struct WebhookChannel {
    url: Option<String>,
    http: reqwest::Client,
}

impl WebhookChannel {
    /// Create a webhook channel. A `None` url disables the channel.
    #[must_use]
    pub fn new(url: Option<String>) -> Self {
        Self {
            url,
            http: http_client(),
        }
    }
}

#[async_trait]
impl Channel for WebhookChannel {
    fn name(&self) -> &'static str {
        "webhook"
    }

    fn enabled(&self) -> bool {
        self.url.is_some()
    }

    async fn send(&self, notification: &ChangeNotification) -> ChannelOutcome {
        let Some(url) = &self.url else {
            return ChannelOutcome::failed("webhook url not configured");
        };
        debug!(url, "Posting webhook notification");
        post_json(&self.http, url, notification, "webhook").await
    }
}

pub(crate) fn http_client() -> reqwest::Client {
    reqwest::Client::builder()
        .user_agent("protodist")
        .timeout(SEND_TIMEOUT)
        .build()
        .unwrap_or_default()
}

/// Shared POST-and-shape-outcome helper for all HTTP channels.
pub(crate) async fn post_json(
    http: &reqwest::Client,
    url: &str,
    payload: &impl serde::Serialize,
    id_prefix: &str,
) -> ChannelOutcome {
    match http.post(url).json(payload).send().await {
        Ok(response) if response.status().is_success() => {
            ChannelOutcome::delivered(message_id(id_prefix))
        }
        Ok(response) => ChannelOutcome::failed(format!("endpoint returned HTTP {}", response.status())),
        Err(e) => ChannelOutcome::failed(format!("send failed: {e}")),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::Priority;
    use wiremock::matchers::{body_partial_json, method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn notification() -> ChangeNotification {
        ChangeNotification {
            repository: "acme/schemas".to_string(),
            old_version: None,
            new_version: "v1.0.0".to_string(),
            bump: "minor".to_string(),
            changes: vec!["initial schema set".to_string()],
            priority: Priority::Normal,
        }
    }

    #[test]
    fn test_disabled_without_url() {
        assert!(!WebhookChannel::new(None).enabled());
        assert!(WebhookChannel::new(Some("https://hooks.example.org/x".into())).enabled());
    }

    #[tokio::test]
    async fn test_send_posts_notification_json() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/hook"))
            .and(body_partial_json(serde_json::json!({
                "repository": "acme/schemas",
                "new_version": "v1.0.0"
            })))
            .respond_with(ResponseTemplate::new(200))
            .expect(1)
            .mount(&server)
            .await;

        let channel = WebhookChannel::new(Some(format!("{}/hook", server.uri())));
        let outcome = channel.send(&notification()).await;
        assert!(outcome.ok);
        assert!(outcome.message_id.unwrap().starts_with("webhook_"));
    }

    #[tokio::test]
    async fn test_send_failure_is_outcome_not_panic() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(500))
            .mount(&server)
            .await;

        let channel = WebhookChannel::new(Some(format!("{}/hook", server.uri())));
        let outcome = channel.send(&notification()).await;
        assert!(!outcome.ok);
        assert!(outcome.error.unwrap().contains("500"));
    }
}
