//! Chat-bus channel.
//!
//! Formats the change record as a chat attachment (headline, colour by
//! priority, one field per change) and posts it to an incoming-webhook URL.

use async_trait::async_trait;
use serde_json::json;
use tracing::debug;

use crate::webhook::{http_client, post_json};
use crate::{Channel, ChangeNotification, ChannelOutcome, Priority};

/// Channel posting formatted messages to a chat webhook.
pub struct ChatChannel {
    webhook_url: Option<String>,
    http: reqwest::Client,
}

impl ChatChannel {
    /// Create a chat channel. A `None` url disables the channel.
    #[must_use]
    pub fn new(webhook_url: Option<String>) -> Self {
        Self {
            webhook_url,
            http: http_client(),
        }
    }

    fn payload(notification: &ChangeNotification) -> serde_json::Value {
        let fields: Vec<serde_json::Value> = notification
            .changes
            .iter()
            .map(|change| json!({ "value": change, "short": false }))
            .collect();
        json!({
            "text": notification.headline(),
            "attachments": [{
                "color": color_for(notification.priority),
                "fields": fields,
            }]
        })
    }
}

fn color_for(priority: Priority) -> &'static str {
    match priority {
        Priority::Low | Priority::Normal => "good",
        Priority::High => "warning",
        Priority::Critical => "danger",
    }
}

#[async_trait]
impl Channel for ChatChannel {
    fn name(&self) -> &'static str {
        "chat"
    }

    fn enabled(&self) -> bool {
        self.webhook_url.is_some()
    }

    async fn send(&self, notification: &ChangeNotification) -> ChannelOutcome {
        let Some(url) = &self.webhook_url else {
            return ChannelOutcome::failed("chat webhook url not configured");
        };
        debug!("Posting chat notification");
        post_json(&self.http, url, &Self::payload(notification), "chat").await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use wiremock::matchers::{body_partial_json, method};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn notification(priority: Priority) -> ChangeNotification {
        ChangeNotification {
            repository: "acme/schemas".to_string(),
            old_version: Some("v1.4.2".to_string()),
            new_version: "v2.0.0".to_string(),
            bump: "major".to_string(),
            changes: vec!["removed a.proto".to_string()],
            priority,
        }
    }

    #[test]
    fn test_colors() {
        assert_eq!(color_for(Priority::Normal), "good");
        assert_eq!(color_for(Priority::High), "warning");
        assert_eq!(color_for(Priority::Critical), "danger");
    }

    #[test]
    fn test_payload_shape() {
        let payload = ChatChannel::payload(&notification(Priority::Critical));
        assert_eq!(
            payload["text"],
            "acme/schemas: v1.4.2 -> v2.0.0 (major bump)"
        );
        assert_eq!(payload["attachments"][0]["color"], "danger");
        assert_eq!(
            payload["attachments"][0]["fields"][0]["value"],
            "removed a.proto"
        );
    }

    #[tokio::test]
    async fn test_send_posts_formatted_payload() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(body_partial_json(serde_json::json!({
                "text": "acme/schemas: v1.4.2 -> v2.0.0 (major bump)"
            })))
            .respond_with(ResponseTemplate::new(200))
            .expect(1)
            .mount(&server)
            .await;

        let channel = ChatChannel::new(Some(server.uri()));
        assert!(channel.send(&notification(Priority::High)).await.ok);
    }
}
