//! Email channel.
//!
//! Formats the change record as a subject and plain-text body and submits
//! it to an HTTP mail gateway. SMTP itself is the gateway's concern.

use async_trait::async_trait;
use serde_json::json;
use tracing::debug;

use crate::webhook::{http_client, post_json};
use crate::{Channel, ChangeNotification, ChannelOutcome};

/// Channel submitting formatted emails to a mail gateway.
pub struct EmailChannel {
    gateway_url: Option<String>,
    recipients: Vec<String>,
    http: reqwest::Client,
}

impl EmailChannel {
    /// Create an email channel. Missing gateway or empty recipients disable
    /// the channel.
    #[must_use]
    pub fn new(gateway_url: Option<String>, recipients: Vec<String>) -> Self {
        Self {
            gateway_url,
            recipients,
            http: http_client(),
        }
    }

    fn subject(notification: &ChangeNotification) -> String {
        format!(
            "[schema change] {} {}",
            notification.repository, notification.new_version
        )
    }

    fn body(notification: &ChangeNotification) -> String {
        let mut body = String::new();
        body.push_str(&notification.headline());
        body.push_str("\n\nChanges:\n");
        for change in &notification.changes {
            body.push_str("  - ");
            body.push_str(change);
            body.push('\n');
        }
        body
    }
}

#[async_trait]
impl Channel for EmailChannel {
    fn name(&self) -> &'static str {
        "email"
    }

    fn enabled(&self) -> bool {
        self.gateway_url.is_some() && !self.recipients.is_empty()
    }

    async fn send(&self, notification: &ChangeNotification) -> ChannelOutcome {
        let Some(url) = &self.gateway_url else {
            return ChannelOutcome::failed("mail gateway not configured");
        };
        if self.recipients.is_empty() {
            return ChannelOutcome::failed("no email recipients configured");
        }
        debug!(recipients = self.recipients.len(), "Submitting email notification");
        let payload = json!({
            "to": self.recipients,
            "subject": Self::subject(notification),
            "body": Self::body(notification),
        });
        post_json(&self.http, url, &payload, "email").await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::Priority;
    use wiremock::matchers::{body_partial_json, method};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn notification() -> ChangeNotification {
        ChangeNotification {
            repository: "acme/schemas".to_string(),
            old_version: Some("v1.4.2".to_string()),
            new_version: "v2.0.0".to_string(),
            bump: "major".to_string(),
            changes: vec!["removed a.proto".to_string(), "added b.proto".to_string()],
            priority: Priority::High,
        }
    }

    #[test]
    fn test_enabled_requires_gateway_and_recipients() {
        assert!(!EmailChannel::new(None, vec!["a@example.org".into()]).enabled());
        assert!(!EmailChannel::new(Some("https://mail.example.org".into()), vec![]).enabled());
        assert!(
            EmailChannel::new(
                Some("https://mail.example.org".into()),
                vec!["a@example.org".into()]
            )
            .enabled()
        );
    }

    #[test]
    fn test_subject_and_body() {
        let n = notification();
        assert_eq!(EmailChannel::subject(&n), "[schema change] acme/schemas v2.0.0");
        let body = EmailChannel::body(&n);
        assert!(body.contains("v1.4.2 -> v2.0.0"));
        assert!(body.contains("  - removed a.proto\n"));
        assert!(body.contains("  - added b.proto\n"));
    }

    #[tokio::test]
    async fn test_send_submits_to_gateway() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(body_partial_json(serde_json::json!({
                "to": ["platform-team@example.org"],
                "subject": "[schema change] acme/schemas v2.0.0"
            })))
            .respond_with(ResponseTemplate::new(202))
            .expect(1)
            .mount(&server)
            .await;

        let channel = EmailChannel::new(
            Some(server.uri()),
            vec!["platform-team@example.org".to_string()],
        );
        let outcome = channel.send(&notification()).await;
        assert!(outcome.ok);
        assert!(outcome.message_id.unwrap().starts_with("email_"));
    }
}
