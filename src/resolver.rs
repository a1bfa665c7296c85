//! Subscription resolution: map an event name or an explicit subscription set
//! to enabled delivery targets grouped by channel.

use std::collections::BTreeSet;
use thiserror::Error;

use crate::db::{self, Event, Subscription};
use crate::model::Channel;

#[derive(Debug, Error)]
pub enum ResolveError {
    #[error("event not found: {0}")]
    EventNotFound(String),
    #[error("empty subscription set")]
    EmptySubscriptionSet,
    #[error(transparent)]
    Store(#[from] anyhow::Error),
}

/// Enabled subscriptions for one event, grouped by channel.
#[derive(Debug, Clone)]
pub struct Resolved {
    pub event: Event,
    pub chat: Vec<Subscription>,
    pub mail: Vec<Subscription>,
}

impl Resolved {
    /// Individual chat targets: one per line of each subscription's target
    /// field, paired with the owning subscription id.
    pub fn chat_targets(&self) -> Vec<(i64, String)> {
        self.chat
            .iter()
            .flat_map(|sub| {
                sub.target
                    .lines()
                    .map(move |line| (sub.id, line.trim().to_string()))
            })
            .collect()
    }

    /// Deduplicated recipient superset across all mail subscriptions.
    /// Case-sensitive, whitespace-trimmed; BTreeSet keeps the serialized
    /// order deterministic.
    pub fn mail_recipients(&self) -> BTreeSet<String> {
        self.mail
            .iter()
            .flat_map(|sub| sub.target.lines().map(|line| line.trim().to_string()))
            .filter(|line| !line.is_empty())
            .collect()
    }
}

/// Resolve targets for `event_name`, or for an explicit subscription set.
/// With an explicit set, the owning event is derived from the first element.
pub async fn resolve(
    pool: &db::Pool,
    event_name: Option<&str>,
    subscriptions: Option<Vec<Subscription>>,
) -> Result<Resolved, ResolveError> {
    let (event, subscriptions) = match event_name {
        Some(name) => {
            let event = db::event_by_name(pool, name)
                .await?
                .ok_or_else(|| ResolveError::EventNotFound(name.to_string()))?;
            let subs = match subscriptions {
                Some(subs) => subs,
                None => db::subscriptions_for_event(pool, name).await?,
            };
            (event, subs)
        }
        None => {
            let subs = subscriptions.unwrap_or_default();
            let first = subs.first().ok_or(ResolveError::EmptySubscriptionSet)?;
            let owner = first
                .event_name
                .clone()
                .ok_or(ResolveError::EmptySubscriptionSet)?;
            let event = db::event_by_name(pool, &owner)
                .await?
                .ok_or(ResolveError::EventNotFound(owner))?;
            (event, subs)
        }
    };

    let mut chat = Vec::new();
    let mut mail = Vec::new();
    for sub in subscriptions.into_iter().filter(|s| s.enabled) {
        match sub.channel {
            Channel::Chat => chat.push(sub),
            Channel::Mail => mail.push(sub),
        }
    }

    Ok(Resolved { event, chat, mail })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sub(id: i64, channel: Channel, target: &str, enabled: bool) -> Subscription {
        Subscription {
            id,
            event_name: Some("deploys".into()),
            channel,
            target: target.into(),
            enabled,
        }
    }

    fn resolved(subs: Vec<Subscription>) -> Resolved {
        let (chat, mail): (Vec<_>, Vec<_>) = subs
            .into_iter()
            .partition(|s| s.channel == Channel::Chat);
        Resolved {
            event: Event {
                name: "deploys".into(),
                external_token: None,
                chat_username: None,
                chat_icon: None,
                chat_unfurl_links: true,
                mail_from: None,
                mail_reply_to: None,
            },
            chat,
            mail,
        }
    }

    #[test]
    fn chat_targets_split_per_line() {
        let r = resolved(vec![sub(1, Channel::Chat, "@a\n@b", true)]);
        assert_eq!(
            r.chat_targets(),
            vec![(1, "@a".to_string()), (1, "@b".to_string())]
        );
    }

    #[test]
    fn mail_recipients_deduplicated_and_trimmed() {
        let r = resolved(vec![
            sub(1, Channel::Mail, "x@a.com\ny@a.com ", true),
            sub(2, Channel::Mail, "y@a.com", true),
        ]);
        let recipients: Vec<String> = r.mail_recipients().into_iter().collect();
        assert_eq!(recipients, vec!["x@a.com".to_string(), "y@a.com".to_string()]);
    }
}
