use super::model::{Event, Notification, PendingNotification, Subscription};
use crate::model::{Channel, Status};
use anyhow::{anyhow, Result};
use sqlx::sqlite::SqliteRow;
use sqlx::{Row, SqlitePool};
use tracing::instrument;

pub type Pool = SqlitePool;

pub async fn init_pool(database_url: &str) -> Result<Pool> {
    let normalized = prepare_sqlite_url(database_url);
    let pool = SqlitePool::connect(&normalized).await?;
    // Enable WAL and stricter durability.
    sqlx::query("PRAGMA journal_mode=WAL;")
        .execute(&pool)
        .await?;
    sqlx::query("PRAGMA synchronous=FULL;")
        .execute(&pool)
        .await?;
    Ok(pool)
}

/// If using a file-backed SQLite URL, expand a leading `~/` and ensure the parent
/// directory exists. Leaves in-memory URLs untouched. Returns possibly-updated URL.
fn prepare_sqlite_url(url: &str) -> String {
    // Pass through non-sqlite schemes
    if !url.starts_with("sqlite:") {
        return url.to_string();
    }

    // In-memory URLs like sqlite::memory: or sqlite::memory:?cache=shared
    if url.starts_with("sqlite::memory") {
        return url.to_string();
    }

    // Strip prefix and optional //
    let rest = &url["sqlite:".len()..];
    let path_with_query = rest.strip_prefix("//").unwrap_or(rest);

    // Separate query string if any
    let (path_part, query_part) = match path_with_query.split_once('?') {
        Some((p, q)) => (p, Some(q)),
        None => (path_with_query, None),
    };

    if path_part.is_empty() {
        // nothing to normalize
        return url.to_string();
    }

    // Expand leading ~/ to HOME
    let expanded_path = if let Some(rest) = path_part.strip_prefix("~/") {
        if let Ok(home) = std::env::var("HOME") {
            format!("{}/{}", home.trim_end_matches('/'), rest)
        } else {
            path_part.to_string()
        }
    } else {
        path_part.to_string()
    };

    // Ensure parent directory exists if any
    if let Some(parent) = std::path::Path::new(&expanded_path).parent() {
        if !parent.as_os_str().is_empty() {
            let _ = std::fs::create_dir_all(parent);
        }
    }

    // Rebuild URL, prefer sqlite:// form
    let mut rebuilt = String::from("sqlite://");
    rebuilt.push_str(&expanded_path);
    if let Some(q) = query_part {
        rebuilt.push('?');
        rebuilt.push_str(q);
    }
    rebuilt
}

pub async fn run_migrations(pool: &Pool) -> Result<()> {
    sqlx::migrate!("./migrations").run(pool).await?;
    Ok(())
}

fn event_from_row(row: &SqliteRow) -> Event {
    Event {
        name: row.get("name"),
        external_token: row.get("external_token"),
        chat_username: row.get("chat_username"),
        chat_icon: row.get("chat_icon"),
        chat_unfurl_links: row.get("chat_unfurl_links"),
        mail_from: row.get("mail_from"),
        mail_reply_to: row.get("mail_reply_to"),
    }
}

fn subscription_from_row(row: &SqliteRow) -> Result<Subscription> {
    let tag: String = row.get("channel");
    let channel = Channel::parse(&tag).ok_or_else(|| anyhow!("unknown channel tag '{tag}'"))?;
    Ok(Subscription {
        id: row.get("id"),
        event_name: row.get("event_name"),
        channel,
        target: row.get("target"),
        enabled: row.get("enabled"),
    })
}

#[instrument(skip_all)]
pub async fn upsert_event(pool: &Pool, event: &Event) -> Result<()> {
    sqlx::query(
        "INSERT INTO events (name, external_token, chat_username, chat_icon, chat_unfurl_links, mail_from, mail_reply_to)
         VALUES (?, ?, ?, ?, ?, ?, ?)
         ON CONFLICT(name) DO UPDATE SET
           external_token = excluded.external_token,
           chat_username = excluded.chat_username,
           chat_icon = excluded.chat_icon,
           chat_unfurl_links = excluded.chat_unfurl_links,
           mail_from = excluded.mail_from,
           mail_reply_to = excluded.mail_reply_to",
    )
    .bind(&event.name)
    .bind(&event.external_token)
    .bind(&event.chat_username)
    .bind(&event.chat_icon)
    .bind(event.chat_unfurl_links)
    .bind(&event.mail_from)
    .bind(&event.mail_reply_to)
    .execute(pool)
    .await?;
    Ok(())
}

#[instrument(skip_all)]
pub async fn event_by_name(pool: &Pool, name: &str) -> Result<Option<Event>> {
    let row = sqlx::query("SELECT * FROM events WHERE name = ?")
        .bind(name)
        .fetch_optional(pool)
        .await?;
    Ok(row.as_ref().map(event_from_row))
}

#[instrument(skip_all)]
pub async fn create_subscription(
    pool: &Pool,
    event_name: &str,
    channel: Channel,
    target: &str,
    enabled: bool,
) -> Result<i64> {
    let rec = sqlx::query(
        "INSERT INTO subscriptions (event_name, channel, target, enabled) VALUES (?, ?, ?, ?) RETURNING id",
    )
    .bind(event_name)
    .bind(channel.as_str())
    .bind(target)
    .bind(enabled)
    .fetch_one(pool)
    .await?;
    Ok(rec.get::<i64, _>("id"))
}

#[instrument(skip_all)]
pub async fn subscriptions_for_event(pool: &Pool, event_name: &str) -> Result<Vec<Subscription>> {
    let rows = sqlx::query("SELECT * FROM subscriptions WHERE event_name = ? ORDER BY id")
        .bind(event_name)
        .fetch_all(pool)
        .await?;
    rows.iter().map(subscription_from_row).collect()
}

#[instrument(skip_all)]
pub async fn delete_subscription(pool: &Pool, id: i64) -> Result<()> {
    sqlx::query("DELETE FROM subscriptions WHERE id = ?")
        .bind(id)
        .execute(pool)
        .await?;
    Ok(())
}

#[instrument(skip_all)]
pub async fn insert_notification(
    pool: &Pool,
    subscription_id: Option<i64>,
    message: &str,
    target: Option<&str>,
    options: Option<&str>,
) -> Result<i64> {
    let rec = sqlx::query(
        "INSERT INTO notifications (subscription_id, message, status, target, options)
         VALUES (?, ?, 0, ?, ?) RETURNING id",
    )
    .bind(subscription_id)
    .bind(message)
    .bind(target)
    .bind(options)
    .fetch_one(pool)
    .await?;
    Ok(rec.get::<i64, _>("id"))
}

/// All pending rows in FIFO order, joined with the owning subscription's
/// channel tag. Rows whose subscription is gone come back with `channel: None`.
#[instrument(skip_all)]
pub async fn pending_notifications(pool: &Pool) -> Result<Vec<PendingNotification>> {
    let rows = sqlx::query(
        "SELECT n.id, n.subscription_id, s.channel, n.message, n.target, n.options
         FROM notifications n
         LEFT JOIN subscriptions s ON s.id = n.subscription_id
         WHERE n.status = 0
         ORDER BY n.id ASC",
    )
    .fetch_all(pool)
    .await?;
    Ok(rows
        .iter()
        .map(|row| PendingNotification {
            id: row.get("id"),
            subscription_id: row.get("subscription_id"),
            channel: row.get("channel"),
            message: row.get("message"),
            target: row.get("target"),
            options: row.get("options"),
        })
        .collect())
}

/// Mark a pending notification as sent. Terminal rows are left untouched.
#[instrument(skip_all)]
pub async fn mark_sent(pool: &Pool, id: i64) -> Result<()> {
    sqlx::query("UPDATE notifications SET status = ? WHERE id = ? AND status = ?")
        .bind(Status::Sent.as_i64())
        .bind(id)
        .bind(Status::Pending.as_i64())
        .execute(pool)
        .await?;
    Ok(())
}

/// Mark a pending notification as failed. Terminal rows are left untouched.
#[instrument(skip_all)]
pub async fn mark_error(pool: &Pool, id: i64) -> Result<()> {
    sqlx::query("UPDATE notifications SET status = ? WHERE id = ? AND status = ?")
        .bind(Status::Error.as_i64())
        .bind(id)
        .bind(Status::Pending.as_i64())
        .execute(pool)
        .await?;
    Ok(())
}

#[instrument(skip_all)]
pub async fn notification(pool: &Pool, id: i64) -> Result<Option<Notification>> {
    let row = sqlx::query("SELECT * FROM notifications WHERE id = ?")
        .bind(id)
        .fetch_optional(pool)
        .await?;
    Ok(row.map(|row| Notification {
        id: row.get("id"),
        created_at: row.get("created_at"),
        subscription_id: row.get("subscription_id"),
        message: row.get("message"),
        status: row.get("status"),
        target: row.get("target"),
        options: row.get("options"),
    }))
}

#[cfg(test)]
mod tests {
    use super::*;

    async fn setup_pool() -> Pool {
        let pool = SqlitePool::connect("sqlite::memory:").await.unwrap();
        sqlx::migrate!("./migrations").run(&pool).await.unwrap();
        pool
    }

    fn event(name: &str) -> Event {
        Event {
            name: name.into(),
            external_token: None,
            chat_username: None,
            chat_icon: None,
            chat_unfurl_links: true,
            mail_from: None,
            mail_reply_to: None,
        }
    }

    #[tokio::test]
    async fn event_and_subscription_round_trip() {
        let pool = setup_pool().await;
        upsert_event(&pool, &event("deploys")).await.unwrap();

        let loaded = event_by_name(&pool, "deploys").await.unwrap().unwrap();
        assert_eq!(loaded.name, "deploys");
        assert!(loaded.chat_unfurl_links);
        assert!(event_by_name(&pool, "missing").await.unwrap().is_none());

        let sid = create_subscription(&pool, "deploys", Channel::Chat, "#ops", true)
            .await
            .unwrap();
        let subs = subscriptions_for_event(&pool, "deploys").await.unwrap();
        assert_eq!(subs.len(), 1);
        assert_eq!(subs[0].id, sid);
        assert_eq!(subs[0].channel, Channel::Chat);
    }

    #[tokio::test]
    async fn status_transitions_are_one_way() {
        let pool = setup_pool().await;
        upsert_event(&pool, &event("deploys")).await.unwrap();
        let sid = create_subscription(&pool, "deploys", Channel::Chat, "#ops", true)
            .await
            .unwrap();
        let nid = insert_notification(&pool, Some(sid), "hi", Some("#ops"), None)
            .await
            .unwrap();

        mark_sent(&pool, nid).await.unwrap();
        let n = notification(&pool, nid).await.unwrap().unwrap();
        assert_eq!(n.status, Status::Sent.as_i64());

        // A terminal row never flips to another status.
        mark_error(&pool, nid).await.unwrap();
        let n = notification(&pool, nid).await.unwrap().unwrap();
        assert_eq!(n.status, Status::Sent.as_i64());

        assert!(pending_notifications(&pool).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn deleted_subscription_nulls_reference() {
        let pool = setup_pool().await;
        upsert_event(&pool, &event("deploys")).await.unwrap();
        let sid = create_subscription(&pool, "deploys", Channel::Mail, "x@a.com", true)
            .await
            .unwrap();
        let nid = insert_notification(&pool, Some(sid), "hi", None, None)
            .await
            .unwrap();

        delete_subscription(&pool, sid).await.unwrap();

        let pending = pending_notifications(&pool).await.unwrap();
        assert_eq!(pending.len(), 1);
        assert_eq!(pending[0].id, nid);
        assert!(pending[0].channel.is_none());
        assert!(pending[0].subscription_id.is_none());
    }
}
