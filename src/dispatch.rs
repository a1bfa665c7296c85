//! Dispatch loop: polls pending notification rows and delivers them through
//! the channel adapters.
//!
//! One tick walks every pending row in id order. Each row is handled
//! independently; a failing row is marked ERROR and the tick continues. The
//! only retryable condition is a chat rate limit, which sets a process-wide
//! throttle deadline and leaves the row pending for a later tick. A single
//! dispatcher instance is assumed; concurrent instances would double-send.

use anyhow::{anyhow, Result};
use chrono::{DateTime, Duration as ChronoDuration, Utc};
use serde_json::{json, Map, Value};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tracing::{error, instrument, warn};

use crate::chat::{ChatOutcome, ChatService};
use crate::db::{self, PendingNotification};
use crate::mail::{LoadedAttachment, MailService, OutgoingMail};
use crate::model::{Attachment, Channel, MailOptions};

/// Safety margin added to a server-provided retry delay.
const RATE_LIMIT_MARGIN_SECS: u64 = 5;
/// Throttle window applied when the server gave no usable retry delay.
const RATE_LIMIT_DEFAULT_SECS: u64 = 15;

pub struct Dispatcher {
    pool: db::Pool,
    chat: Arc<dyn ChatService>,
    mail: Arc<dyn MailService>,
    media_root: PathBuf,
    idle: Duration,
    /// Chat sends are skipped until this deadline passes. Process-wide state,
    /// owned by the loop.
    pub chat_limited_until: Option<DateTime<Utc>>,
}

impl Dispatcher {
    pub fn new(
        pool: db::Pool,
        chat: Arc<dyn ChatService>,
        mail: Arc<dyn MailService>,
        media_root: impl Into<PathBuf>,
        idle: Duration,
    ) -> Self {
        Self {
            pool,
            chat,
            mail,
            media_root: media_root.into(),
            idle,
            chat_limited_until: None,
        }
    }

    /// Run forever with an idle sleep between ticks, or exactly one tick when
    /// `run_once` is set.
    pub async fn run(&mut self, run_once: bool) {
        loop {
            if let Err(err) = self.run_tick().await {
                error!(?err, "dispatch tick failed");
            }
            if run_once {
                break;
            }
            tokio::time::sleep(self.idle).await;
        }
    }

    /// One pass over all pending rows. Per-row failures are contained: the
    /// row is marked ERROR and the loop moves on.
    #[instrument(skip_all)]
    pub async fn run_tick(&mut self) -> Result<()> {
        let pending = db::pending_notifications(&self.pool).await?;
        for notification in pending {
            if let Err(err) = self.handle_one(&notification).await {
                error!(id = notification.id, ?err, "notification failed");
                db::mark_error(&self.pool, notification.id).await?;
            }
        }
        Ok(())
    }

    async fn handle_one(&mut self, notification: &PendingNotification) -> Result<()> {
        let tag = notification
            .channel
            .as_deref()
            .ok_or_else(|| anyhow!("subscription is gone"))?;
        let channel =
            Channel::parse(tag).ok_or_else(|| anyhow!("bad channel tag '{tag}'"))?;
        match channel {
            Channel::Chat => {
                if let Some(deadline) = self.chat_limited_until {
                    if Utc::now() < deadline {
                        // Still throttled; leave the row pending for a later tick.
                        return Ok(());
                    }
                }
                self.send_chat(notification).await
            }
            Channel::Mail => self.send_mail(notification).await,
        }
    }

    async fn send_chat(&mut self, notification: &PendingNotification) -> Result<()> {
        let options = chat_options(notification)?;
        let target = notification.target.as_deref().unwrap_or_default();

        match self
            .chat
            .send(target, &notification.message, &options)
            .await?
        {
            ChatOutcome::Sent => {
                db::mark_sent(&self.pool, notification.id).await?;
            }
            ChatOutcome::RateLimited { retry_after } => {
                let secs = retry_after
                    .map(|s| s + RATE_LIMIT_MARGIN_SECS)
                    .unwrap_or(RATE_LIMIT_DEFAULT_SECS);
                self.chat_limited_until =
                    Some(Utc::now() + ChronoDuration::seconds(secs as i64));
                warn!(id = notification.id, secs, "rate limited; backing off");
            }
            ChatOutcome::Failed(reason) => {
                error!(id = notification.id, reason = %reason, "chat notify failed");
                db::mark_error(&self.pool, notification.id).await?;
            }
        }
        Ok(())
    }

    async fn send_mail(&self, notification: &PendingNotification) -> Result<()> {
        let target = notification
            .target
            .as_deref()
            .ok_or_else(|| anyhow!("mail notification has no target"))?;
        let recipients: Vec<String> = serde_json::from_str(target)?;
        let options: MailOptions = match &notification.options {
            Some(raw) => serde_json::from_str(raw)?,
            None => MailOptions::default(),
        };

        let mut attachments = Vec::new();
        if let Some(refs) = &options.attachments {
            for attachment in refs {
                match self.load_attachment(attachment).await {
                    Some(loaded) => attachments.push(loaded),
                    None => continue,
                }
            }
        }

        let mail = OutgoingMail {
            subject: options.subject.unwrap_or_default(),
            body: notification.message.clone(),
            html_body: options.html_message,
            from: options.from_email.unwrap_or_default(),
            to: recipients,
            reply_to: options
                .reply_to
                .and_then(|addresses| addresses.into_iter().next()),
            attachments,
        };

        self.mail.send(&mail).await?;
        db::mark_sent(&self.pool, notification.id).await?;
        Ok(())
    }

    /// Read an attachment from disk. Paths outside the media root, missing
    /// files, and directories are logged and skipped without failing the send.
    async fn load_attachment(&self, attachment: &Attachment) -> Option<LoadedAttachment> {
        let root = match std::fs::canonicalize(&self.media_root) {
            Ok(root) => root,
            Err(err) => {
                error!(?err, root = %self.media_root.display(), "media root unavailable");
                return None;
            }
        };
        let path = match std::fs::canonicalize(Path::new(&attachment.file_path)) {
            Ok(path) => path,
            Err(_) => {
                error!(path = %attachment.file_path, "could not open file from path");
                return None;
            }
        };
        if !path.starts_with(&root) {
            error!(path = %path.display(), "invalid path for attachment");
            return None;
        }
        if path.is_dir() {
            error!(path = %path.display(), "could not open file from path");
            return None;
        }
        match tokio::fs::read(&path).await {
            Ok(content) => Some(LoadedAttachment {
                file_name: attachment.file_name.clone(),
                content_type: attachment.file_type.clone(),
                content,
            }),
            Err(err) => {
                error!(?err, path = %path.display(), "could not open file from path");
                None
            }
        }
    }
}

/// Decode a chat notification's stored options, injecting a default section
/// block derived from the message when no structured blocks were stored.
fn chat_options(notification: &PendingNotification) -> Result<Map<String, Value>> {
    let mut options: Map<String, Value> = match &notification.options {
        Some(raw) => serde_json::from_str(raw)?,
        None => Map::new(),
    };
    if !options.contains_key("blocks") {
        options.insert(
            "blocks".into(),
            json!([{"type": "section", "text": {"type": "mrkdwn", "text": notification.message}}]),
        );
    }
    Ok(options)
}
