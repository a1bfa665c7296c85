//! Database entity and view models used by repositories.
//!
//! Keep these structs focused on the data returned by queries. Business logic
//! should live in higher layers.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{json, Map, Value};

use crate::model::Channel;

/// A notification source. Events own subscriptions and carry per-channel
/// formatting defaults applied at enqueue time.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Event {
    pub name: String,
    /// When set, the HTTP ingestion endpoint accepts posts for this event.
    pub external_token: Option<String>,
    pub chat_username: Option<String>,
    pub chat_icon: Option<String>,
    pub chat_unfurl_links: bool,
    pub mail_from: Option<String>,
    pub mail_reply_to: Option<String>,
}

impl Event {
    /// Per-event defaults for the chat API call. Block or caller options are
    /// layered on top of these.
    pub fn chat_api_options(&self) -> Map<String, Value> {
        let mut options = Map::new();
        if !self.chat_unfurl_links {
            options.insert("unfurl_links".into(), json!(0));
        }
        if let Some(username) = &self.chat_username {
            options.insert("username".into(), json!(username));
            options.insert("as_user".into(), json!(0));
        } else {
            options.insert("as_user".into(), json!(1));
        }
        if let Some(icon) = &self.chat_icon {
            options.insert("icon_emoji".into(), json!(icon));
        }
        options
    }
}

/// Binds an event to a channel and one raw target address per line.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Subscription {
    pub id: i64,
    pub event_name: Option<String>,
    pub channel: Channel,
    pub target: String,
    pub enabled: bool,
}

/// A fully materialized notification row.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Notification {
    pub id: i64,
    pub created_at: DateTime<Utc>,
    pub subscription_id: Option<i64>,
    pub message: String,
    pub status: i64,
    pub target: Option<String>,
    pub options: Option<String>,
}

/// Slice of a pending notification joined with its subscription's channel,
/// used by the dispatch loop. `channel` is the raw stored tag; it is `None`
/// when the owning subscription was deleted.
#[derive(Debug, Clone)]
pub struct PendingNotification {
    pub id: i64,
    pub subscription_id: Option<i64>,
    pub channel: Option<String>,
    pub message: String,
    pub target: Option<String>,
    pub options: Option<String>,
}
