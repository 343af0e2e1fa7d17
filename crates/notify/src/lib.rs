//! Schema change notification dispatch.
//!
//! A change record goes out across a configured set of channels. Channels
//! are independent: one failing never stops the others, and order is
//! preserved per channel by sequential sends. Every attempt lands in a
//! bounded delivery history.

mod chat;
mod email;
mod webhook;

pub use chat::ChatChannel;
pub use email::EmailChannel;
pub use webhook::WebhookChannel;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;
use std::sync::{Arc, Mutex};
use tracing::{debug, info, warn};

/// Most-recent delivery records kept in memory.
pub const HISTORY_CAP: usize = 1000;

/// Urgency of a change notification.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Priority {
    /// Routine change.
    Low,
    /// Default.
    Normal,
    /// Needs attention soon.
    High,
    /// Breaking change in a widely-used schema.
    Critical,
}

/// One schema change record to deliver.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChangeNotification {
    /// The repository the change happened in.
    pub repository: String,
    /// The previous version, if any.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub old_version: Option<String>,
    /// The new version.
    pub new_version: String,
    /// The bump kind (`major`, `minor`, `patch`).
    pub bump: String,
    /// Human-readable change summaries.
    pub changes: Vec<String>,
    /// Urgency.
    pub priority: Priority,
}

impl ChangeNotification {
    /// Short reference for logs and delivery records.
    #[must_use]
    pub fn reference(&self) -> String {
        format!("{}@{}", self.repository, self.new_version)
    }

    /// One-line headline shared by all channel formats.
    #[must_use]
    pub fn headline(&self) -> String {
        match &self.old_version {
            Some(old) => format!(
                "{}: {} -> {} ({} bump)",
                self.repository, old, self.new_version, self.bump
            ),
            None => format!("{}: initial release {}", self.repository, self.new_version),
        }
    }
}

/// Result of one channel send.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChannelOutcome {
    /// Whether delivery succeeded.
    pub ok: bool,
    /// Channel-assigned message id, when available.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub message_id: Option<String>,
    /// Failure detail, when delivery failed.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl ChannelOutcome {
    /// A successful outcome.
    #[must_use]
    pub fn delivered(message_id: impl Into<String>) -> Self {
        Self {
            ok: true,
            message_id: Some(message_id.into()),
            error: None,
        }
    }

    /// A failed outcome.
    #[must_use]
    pub fn failed(error: impl Into<String>) -> Self {
        Self {
            ok: false,
            message_id: None,
            error: Some(error.into()),
        }
    }
}

/// The capability set every notification channel implements.
#[async_trait]
pub trait Channel: Send + Sync {
    /// Channel name for records and logs.
    fn name(&self) -> &'static str;

    /// Whether this channel is configured and enabled.
    fn enabled(&self) -> bool;

    /// Deliver one notification. Failures are data, not panics.
    async fn send(&self, notification: &ChangeNotification) -> ChannelOutcome;
}

/// One recorded delivery attempt.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DeliveryRecord {
    /// When the attempt finished.
    pub timestamp: DateTime<Utc>,
    /// The channel attempted.
    pub channel: String,
    /// What happened.
    pub outcome: ChannelOutcome,
    /// Reference to the change record (`repository@version`).
    pub reference: String,
}

/// Fans one change record out across the configured channels.
pub struct Dispatcher {
    channels: Vec<Arc<dyn Channel>>,
    history: Mutex<VecDeque<DeliveryRecord>>,
}

impl Dispatcher {
    /// Create a dispatcher over a set of channels.
    #[must_use]
    pub fn new(channels: Vec<Arc<dyn Channel>>) -> Self {
        Self {
            channels,
            history: Mutex::new(VecDeque::new()),
        }
    }

    /// Deliver a notification to every enabled channel, sequentially per
    /// channel, recording each outcome.
    pub async fn dispatch(&self, notification: &ChangeNotification) -> Vec<DeliveryRecord> {
        let mut records = Vec::new();
        for channel in &self.channels {
            if !channel.enabled() {
                debug!(channel = channel.name(), "Channel disabled, skipping");
                continue;
            }
            let outcome = channel.send(notification).await;
            if outcome.ok {
                info!(
                    channel = channel.name(),
                    reference = %notification.reference(),
                    "Notification delivered"
                );
            } else {
                warn!(
                    channel = channel.name(),
                    reference = %notification.reference(),
                    error = outcome.error.as_deref().unwrap_or("unknown"),
                    "Notification failed"
                );
            }
            let record = DeliveryRecord {
                timestamp: Utc::now(),
                channel: channel.name().to_string(),
                outcome,
                reference: notification.reference(),
            };
            self.record(record.clone());
            records.push(record);
        }
        records
    }

    /// The most recent delivery records, oldest first.
    #[must_use]
    pub fn history(&self) -> Vec<DeliveryRecord> {
        let history = self
            .history
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner);
        history.iter().cloned().collect()
    }

    fn record(&self, record: DeliveryRecord) {
        let mut history = self
            .history
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner);
        if history.len() == HISTORY_CAP {
            history.pop_front();
        }
        history.push_back(record);
    }
}

/// Shared message-id stamp for HTTP channels.
pub(crate) fn message_id(prefix: &str) -> String {
    format!("{prefix}_{}", Utc::now().timestamp_millis())
}
