//! Enqueue API: resolve targets for an event and persist one pending
//! notification row per delivery unit.
//!
//! Chat gets one row per (subscription, target line). Mail gets one row per
//! subscription, all pointing at the shared deduplicated recipient superset.
//! A failure while assembling the mail batch is logged and swallowed so the
//! chat side of the same call still goes out; the returned count includes the
//! attempted mail batch size either way.

use anyhow::Result;
use serde_json::{json, Map, Value};
use tracing::{error, instrument};

use crate::blocks::{Block, RenderContext};
use crate::config::Config;
use crate::db::{self, Subscription};
use crate::model::{Attachment, Channel, MailOptions};
use crate::resolver::{self, Resolved, ResolveError};
use crate::template::TemplateEngine;

/// Parameters for [`notify`]. Start from [`NotifyRequest::new`] and set the
/// optional fields you need.
#[derive(Debug, Clone, Default)]
pub struct NotifyRequest {
    pub event: Option<String>,
    pub message: String,
    pub subject: Option<String>,
    pub html_message: Option<String>,
    pub template: Option<String>,
    pub template_context: Option<Map<String, Value>>,
    pub create_link: bool,
    pub additional_email_targets: Vec<String>,
    pub attachments: Vec<Attachment>,
    /// Explicit subscription set; overrides the event's own subscriptions.
    pub subscriptions: Option<Vec<Subscription>>,
}

impl NotifyRequest {
    pub fn new(event: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            event: Some(event.into()),
            message: message.into(),
            ..Default::default()
        }
    }
}

/// Enqueue notifications for every enabled subscription of the request's
/// event (or explicit set). Returns the number of rows counted as created.
/// Returns 0 silently when neither an event nor a non-empty set is supplied.
#[instrument(skip_all, fields(event = req.event.as_deref().unwrap_or("")))]
pub async fn notify(
    pool: &db::Pool,
    templates: &dyn TemplateEngine,
    cfg: &Config,
    req: NotifyRequest,
) -> Result<i64> {
    let resolved = match resolver::resolve(pool, req.event.as_deref(), req.subscriptions.clone())
        .await
    {
        Ok(resolved) => resolved,
        Err(ResolveError::EmptySubscriptionSet) => return Ok(0),
        Err(err) => return Err(err.into()),
    };

    let mut count = 0i64;

    // Chat: one row per (subscription, target line).
    let chat_text = match &req.subject {
        Some(subject) => format!("{subject}: {}", req.message),
        None => req.message.clone(),
    };
    let options_json = serde_json::to_string(&Value::Object(resolved.event.chat_api_options()))?;
    for (subscription_id, target) in resolved.chat_targets() {
        db::insert_notification(
            pool,
            Some(subscription_id),
            &chat_text,
            Some(&target),
            Some(&options_json),
        )
        .await?;
        count += 1;
    }

    // Mail: one batched row per subscription. Assembly failures are logged
    // and swallowed; the count still reflects the attempted batch size.
    if !resolved.mail.is_empty() {
        if let Err(err) = enqueue_mail(pool, templates, cfg, &req, &resolved).await {
            error!(event = %resolved.event.name, ?err, "error notifying");
        }
        count += resolved.mail.len() as i64;
    }

    Ok(count)
}

async fn enqueue_mail(
    pool: &db::Pool,
    templates: &dyn TemplateEngine,
    cfg: &Config,
    req: &NotifyRequest,
    resolved: &Resolved,
) -> Result<()> {
    let mut recipients = resolved.mail_recipients();
    recipients.extend(req.additional_email_targets.iter().cloned());
    let recipients: Vec<String> = recipients.into_iter().collect();

    let event = &resolved.event;
    let from_email = event
        .mail_from
        .clone()
        .unwrap_or_else(|| cfg.mail.default_from.clone());

    let mut options = MailOptions {
        subject: req.subject.clone(),
        from_email: Some(from_email),
        reply_to: event.mail_reply_to.as_ref().map(|r| vec![r.clone()]),
        html_message: req.html_message.clone(),
        attachments: if req.attachments.is_empty() {
            None
        } else {
            Some(req.attachments.clone())
        },
    };

    let mut body = req.message.clone();
    if let Some(template) = &req.template {
        let context = req.template_context.clone().unwrap_or_default();
        let rendered = templates.render(
            template,
            &context,
            options.from_email.as_deref(),
            &recipients,
            req.create_link,
        )?;
        options.subject = Some(rendered.subject);
        body = rendered.body;
        if let Some(html) = rendered.html {
            options.html_message = Some(html);
        }
    }

    let target_json = serde_json::to_string(&recipients)?;
    let options_json = serde_json::to_string(&options)?;
    for sub in &resolved.mail {
        db::insert_notification(
            pool,
            Some(sub.id),
            &body,
            Some(&target_json),
            Some(&options_json),
        )
        .await?;
    }
    Ok(())
}

/// Block-based enqueue: render the block once per channel group and persist
/// the combined rendering.
#[instrument(skip_all, fields(event = event_name.unwrap_or("")))]
pub async fn notify_block(
    pool: &db::Pool,
    templates: &dyn TemplateEngine,
    cfg: &Config,
    event_name: Option<&str>,
    block: &Block,
    subscriptions: Option<Vec<Subscription>>,
) -> Result<i64> {
    let resolved = match resolver::resolve(pool, event_name, subscriptions).await {
        Ok(resolved) => resolved,
        Err(ResolveError::EmptySubscriptionSet) => return Ok(0),
        Err(err) => return Err(err.into()),
    };

    let mut count = 0i64;

    if !resolved.chat.is_empty() {
        let ctx = RenderContext::new(templates);
        let (message, extra) = block.render(Channel::Chat, &ctx)?;
        // Block options override the event defaults key-wise.
        let mut api_options = resolved.event.chat_api_options();
        for (key, value) in extra {
            api_options.insert(key, value);
        }
        let options_json = serde_json::to_string(&Value::Object(api_options))?;
        for (subscription_id, target) in resolved.chat_targets() {
            db::insert_notification(
                pool,
                Some(subscription_id),
                &message,
                Some(&target),
                Some(&options_json),
            )
            .await?;
            count += 1;
        }
    }

    if !resolved.mail.is_empty() {
        if let Err(err) = enqueue_block_mail(pool, templates, cfg, block, &resolved).await {
            error!(event = %resolved.event.name, ?err, "error notifying");
        }
        count += resolved.mail.len() as i64;
    }

    Ok(count)
}

async fn enqueue_block_mail(
    pool: &db::Pool,
    templates: &dyn TemplateEngine,
    cfg: &Config,
    block: &Block,
    resolved: &Resolved,
) -> Result<()> {
    let event = &resolved.event;
    let from_email = event
        .mail_from
        .clone()
        .unwrap_or_else(|| cfg.mail.default_from.clone());

    let mut recipients = resolved.mail_recipients();
    let recipient_seed: Vec<String> = recipients.iter().cloned().collect();
    let ctx = RenderContext {
        templates,
        from_email: Some(&from_email),
        recipients: &recipient_seed,
        create_link: false,
    };
    let (body, mut options) = block.render(Channel::Mail, &ctx)?;

    // A block may contribute extra recipients of its own.
    if let Some(Value::Array(extra)) = options.get("recipient_list") {
        for value in extra {
            if let Value::String(email) = value {
                recipients.insert(email.clone());
            }
        }
    }
    let recipients: Vec<String> = recipients.into_iter().collect();

    options.insert(
        "reply_to".into(),
        match &event.mail_reply_to {
            Some(reply_to) => json!([reply_to]),
            None => Value::Null,
        },
    );

    let target_json = serde_json::to_string(&recipients)?;
    let options_json = serde_json::to_string(&Value::Object(options))?;
    for sub in &resolved.mail {
        db::insert_notification(
            pool,
            Some(sub.id),
            &body,
            Some(&target_json),
            Some(&options_json),
        )
        .await?;
    }
    Ok(())
}
