use notifyd::blocks::Block;
use notifyd::config::{self, Config};
use notifyd::db::{self, Event};
use notifyd::model::{Channel, MailOptions, Status};
use notifyd::notify::{notify, notify_block, NotifyRequest};
use notifyd::template::{MailTemplate, TemplateStore};

async fn setup_pool() -> sqlx::SqlitePool {
    let pool = sqlx::SqlitePool::connect("sqlite::memory:").await.unwrap();
    sqlx::migrate!("./migrations").run(&pool).await.unwrap();
    pool
}

fn test_config() -> Config {
    serde_yaml::from_str(config::example()).unwrap()
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

async fn row_count(pool: &sqlx::SqlitePool) -> i64 {
    sqlx::query_scalar("SELECT COUNT(*) FROM notifications")
        .fetch_one(pool)
        .await
        .unwrap()
}

#[tokio::test]
async fn chat_multiline_target_creates_one_row_per_line() {
    let pool = setup_pool().await;
    let cfg = test_config();
    let templates = TemplateStore::new();
    db::upsert_event(&pool, &event("deploys")).await.unwrap();
    db::create_subscription(&pool, "deploys", Channel::Chat, "@a\n@b", true)
        .await
        .unwrap();

    let count = notify(&pool, &templates, &cfg, NotifyRequest::new("deploys", "hi"))
        .await
        .unwrap();
    assert_eq!(count, 2);

    let pending = db::pending_notifications(&pool).await.unwrap();
    assert_eq!(pending.len(), 2);
    let targets: Vec<_> = pending.iter().map(|n| n.target.clone().unwrap()).collect();
    assert_eq!(targets, vec!["@a".to_string(), "@b".to_string()]);
    for n in &pending {
        assert_eq!(n.message, "hi");
        let status: i64 = sqlx::query_scalar("SELECT status FROM notifications WHERE id = ?")
            .bind(n.id)
            .fetch_one(&pool)
            .await
            .unwrap();
        assert_eq!(status, Status::Pending.as_i64());
    }
}

#[tokio::test]
async fn mail_subscriptions_share_deduplicated_recipient_list() {
    let pool = setup_pool().await;
    let cfg = test_config();
    let templates = TemplateStore::new();
    db::upsert_event(&pool, &event("deploys")).await.unwrap();
    db::create_subscription(&pool, "deploys", Channel::Mail, "x@a.com", true)
        .await
        .unwrap();
    db::create_subscription(&pool, "deploys", Channel::Mail, "y@a.com\nx@a.com", true)
        .await
        .unwrap();

    let count = notify(&pool, &templates, &cfg, NotifyRequest::new("deploys", "hi"))
        .await
        .unwrap();
    assert_eq!(count, 2);

    let pending = db::pending_notifications(&pool).await.unwrap();
    assert_eq!(pending.len(), 2);
    for n in &pending {
        let recipients: Vec<String> =
            serde_json::from_str(n.target.as_deref().unwrap()).unwrap();
        assert_eq!(recipients, vec!["x@a.com".to_string(), "y@a.com".to_string()]);
    }
}

#[tokio::test]
async fn disabled_subscription_is_excluded() {
    let pool = setup_pool().await;
    let cfg = test_config();
    let templates = TemplateStore::new();
    db::upsert_event(&pool, &event("deploys")).await.unwrap();
    db::create_subscription(&pool, "deploys", Channel::Chat, "@a", false)
        .await
        .unwrap();

    let count = notify(&pool, &templates, &cfg, NotifyRequest::new("deploys", "hi"))
        .await
        .unwrap();
    assert_eq!(count, 0);
    assert_eq!(row_count(&pool).await, 0);
}

#[tokio::test]
async fn missing_event_and_subscriptions_is_silent() {
    let pool = setup_pool().await;
    let cfg = test_config();
    let templates = TemplateStore::new();

    let count = notify(&pool, &templates, &cfg, NotifyRequest::default())
        .await
        .unwrap();
    assert_eq!(count, 0);
    assert_eq!(row_count(&pool).await, 0);
}

#[tokio::test]
async fn unknown_event_is_an_error() {
    let pool = setup_pool().await;
    let cfg = test_config();
    let templates = TemplateStore::new();

    let err = notify(&pool, &templates, &cfg, NotifyRequest::new("nope", "hi")).await;
    assert!(err.is_err());
}

#[tokio::test]
async fn subject_prefixes_chat_text_and_fills_mail_options() {
    let pool = setup_pool().await;
    let cfg = test_config();
    let templates = TemplateStore::new();
    let mut ev = event("deploys");
    ev.mail_from = Some("deploys@example.com".into());
    ev.mail_reply_to = Some("ops@example.com".into());
    db::upsert_event(&pool, &ev).await.unwrap();
    db::create_subscription(&pool, "deploys", Channel::Chat, "#ops", true)
        .await
        .unwrap();
    db::create_subscription(&pool, "deploys", Channel::Mail, "x@a.com", true)
        .await
        .unwrap();

    let mut req = NotifyRequest::new("deploys", "it worked");
    req.subject = Some("deploy".into());
    req.html_message = Some("<b>it worked</b>".into());
    let count = notify(&pool, &templates, &cfg, req).await.unwrap();
    assert_eq!(count, 2);

    let pending = db::pending_notifications(&pool).await.unwrap();
    let chat_row = pending
        .iter()
        .find(|n| n.channel.as_deref() == Some("S"))
        .unwrap();
    assert_eq!(chat_row.message, "deploy: it worked");

    let mail_row = pending
        .iter()
        .find(|n| n.channel.as_deref() == Some("M"))
        .unwrap();
    assert_eq!(mail_row.message, "it worked");
    let options: MailOptions =
        serde_json::from_str(mail_row.options.as_deref().unwrap()).unwrap();
    assert_eq!(options.subject.as_deref(), Some("deploy"));
    assert_eq!(options.from_email.as_deref(), Some("deploys@example.com"));
    assert_eq!(options.reply_to, Some(vec!["ops@example.com".to_string()]));
    assert_eq!(options.html_message.as_deref(), Some("<b>it worked</b>"));
}

#[tokio::test]
async fn template_overrides_subject_body_and_html() {
    let pool = setup_pool().await;
    let cfg = test_config();
    let templates = TemplateStore::new();
    templates
        .register(MailTemplate {
            id: "weekly".into(),
            subject: "Weekly {{week}}".into(),
            body: "Report for week {{week}}".into(),
            html: Some("<h1>{{week}}</h1>".into()),
        })
        .unwrap();
    db::upsert_event(&pool, &event("reports")).await.unwrap();
    db::create_subscription(&pool, "reports", Channel::Mail, "x@a.com", true)
        .await
        .unwrap();

    let mut req = NotifyRequest::new("reports", "ignored");
    req.subject = Some("also ignored".into());
    req.template = Some("weekly".into());
    req.template_context = serde_json::from_str(r#"{"week": "34"}"#).unwrap();
    let count = notify(&pool, &templates, &cfg, req).await.unwrap();
    assert_eq!(count, 1);

    let pending = db::pending_notifications(&pool).await.unwrap();
    assert_eq!(pending[0].message, "Report for week 34");
    let options: MailOptions =
        serde_json::from_str(pending[0].options.as_deref().unwrap()).unwrap();
    assert_eq!(options.subject.as_deref(), Some("Weekly 34"));
    assert_eq!(options.html_message.as_deref(), Some("<h1>34</h1>"));
}

#[tokio::test]
async fn mail_assembly_failure_still_counts_batch() {
    // Unknown template: the mail batch fails to assemble, the failure is
    // swallowed, no mail rows exist, but the count includes the batch.
    let pool = setup_pool().await;
    let cfg = test_config();
    let templates = TemplateStore::new();
    db::upsert_event(&pool, &event("reports")).await.unwrap();
    db::create_subscription(&pool, "reports", Channel::Chat, "#ops", true)
        .await
        .unwrap();
    db::create_subscription(&pool, "reports", Channel::Mail, "x@a.com", true)
        .await
        .unwrap();

    let mut req = NotifyRequest::new("reports", "hello");
    req.template = Some("not-registered".into());
    let count = notify(&pool, &templates, &cfg, req).await.unwrap();
    assert_eq!(count, 2);

    // Only the chat row was durably created.
    assert_eq!(row_count(&pool).await, 1);
    let pending = db::pending_notifications(&pool).await.unwrap();
    assert_eq!(pending[0].channel.as_deref(), Some("S"));
}

#[tokio::test]
async fn explicit_subscription_set_overrides_event_default() {
    let pool = setup_pool().await;
    let cfg = test_config();
    let templates = TemplateStore::new();
    db::upsert_event(&pool, &event("deploys")).await.unwrap();
    db::create_subscription(&pool, "deploys", Channel::Chat, "@a", true)
        .await
        .unwrap();
    db::create_subscription(&pool, "deploys", Channel::Chat, "@b", true)
        .await
        .unwrap();
    let subs = db::subscriptions_for_event(&pool, "deploys").await.unwrap();

    // Only hand over the first subscription; event is derived from it.
    let mut req = NotifyRequest {
        event: None,
        message: "hi".into(),
        ..Default::default()
    };
    req.subscriptions = Some(vec![subs[0].clone()]);
    let count = notify(&pool, &templates, &cfg, req).await.unwrap();
    assert_eq!(count, 1);

    let pending = db::pending_notifications(&pool).await.unwrap();
    assert_eq!(pending.len(), 1);
    assert_eq!(pending[0].target.as_deref(), Some("@a"));
}

#[tokio::test]
async fn block_notify_merges_structured_options() {
    let pool = setup_pool().await;
    let cfg = test_config();
    let templates = TemplateStore::new();
    db::upsert_event(&pool, &event("deploys")).await.unwrap();
    db::create_subscription(&pool, "deploys", Channel::Chat, "#ops", true)
        .await
        .unwrap();
    db::create_subscription(&pool, "deploys", Channel::Mail, "x@a.com", true)
        .await
        .unwrap();

    let block = Block::Message(vec![
        Block::Section("deploy finished".into()),
        Block::Context(vec!["build 421".into(), "3m12s".into()]),
        Block::ExtraRecipients(vec!["audit@example.com".into()]),
    ]);
    let count = notify_block(&pool, &templates, &cfg, Some("deploys"), &block, None)
        .await
        .unwrap();
    assert_eq!(count, 2);

    let pending = db::pending_notifications(&pool).await.unwrap();
    let chat_row = pending
        .iter()
        .find(|n| n.channel.as_deref() == Some("S"))
        .unwrap();
    assert_eq!(chat_row.message, "deploy finished\nbuild 421\n3m12s\n");
    let options: serde_json::Value =
        serde_json::from_str(chat_row.options.as_deref().unwrap()).unwrap();
    let blocks = options["blocks"].as_array().unwrap();
    assert_eq!(blocks.len(), 2);
    assert_eq!(blocks[0]["type"], "section");
    assert_eq!(blocks[1]["type"], "context");

    let mail_row = pending
        .iter()
        .find(|n| n.channel.as_deref() == Some("M"))
        .unwrap();
    let recipients: Vec<String> =
        serde_json::from_str(mail_row.target.as_deref().unwrap()).unwrap();
    assert_eq!(
        recipients,
        vec!["audit@example.com".to_string(), "x@a.com".to_string()]
    );
}
