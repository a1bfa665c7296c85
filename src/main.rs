use anyhow::Result;
use clap::Parser;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tracing::info;

use notifyd::chat::ChatClient;
use notifyd::dispatch::Dispatcher;
use notifyd::http::{self, AppState};
use notifyd::mail::SmtpMailer;
use notifyd::template::TemplateStore;
use notifyd::{config, db};

#[derive(Debug, Parser)]
#[command(author, version, about)]
struct Args {
    /// Path to YAML config file
    #[arg(long, default_value = "config.yaml")]
    config: PathBuf,
    /// Flush the queue with a single dispatch tick, then exit
    #[arg(short = '1', long, default_value_t = false)]
    run_once: bool,
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_target(false)
        .compact()
        .init();

    let args = Args::parse();
    let cfg = config::load(Some(&args.config))?;
    cfg.ensure_dirs()?;

    let database_url = std::env::var("DATABASE_URL")
        .unwrap_or_else(|_| format!("sqlite://{}/notifyd.db", cfg.app.data_dir));

    let pool = db::init_pool(&database_url).await?;
    db::run_migrations(&pool).await?;

    let chat = Arc::new(ChatClient::from_config(&cfg.chat)?);
    let mail = Arc::new(SmtpMailer::from_config(&cfg.mail)?);
    let mut dispatcher = Dispatcher::new(
        pool.clone(),
        chat,
        mail,
        cfg.storage.media_root.clone(),
        Duration::from_millis(cfg.app.poll_interval_ms),
    );

    if args.run_once {
        dispatcher.run(true).await;
        return Ok(());
    }

    tokio::spawn(async move {
        dispatcher.run(false).await;
    });

    let state = AppState {
        pool,
        templates: Arc::new(TemplateStore::new()),
        cfg: Arc::new(cfg.clone()),
    };
    let listener = tokio::net::TcpListener::bind(&cfg.app.http_bind).await?;
    info!(addr = %cfg.app.http_bind, "serving notification ingestion");
    axum::serve(listener, http::router(state)).await?;

    Ok(())
}
