use anyhow::Result;
use clap::Parser;
use dutysync::clock::SystemClock;
use dutysync::transport::RestTransport;
use dutysync::{config, db, SyncService};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tracing::info;

#[derive(Debug, Parser)]
#[command(author, version, about)]
struct Args {
    /// Path to YAML config file
    #[arg(long, default_value = "config.yaml")]
    config: PathBuf,
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
        .unwrap_or_else(|_| format!("sqlite://{}/dutysync.db", cfg.app.data_dir));

    let pool = db::init_pool(&database_url).await?;
    db::run_migrations(&pool).await?;

    let transport = Arc::new(RestTransport::from_config(&cfg)?);
    let service = SyncService::start(
        pool,
        transport,
        Arc::new(SystemClock),
        cfg.sync_options(),
    )
    .await?;

    // Log every snapshot change so the kiosk shell has something to tail.
    let mut rx = service.subscribe();
    tokio::spawn(async move {
        while rx.changed().await.is_ok() {
            let snap = rx.borrow().clone();
            info!(
                online = snap.is_online,
                phase = ?snap.sync_phase,
                pending = snap.pending_actions,
                progress = snap.sync_progress,
                errors = snap.sync_errors.len(),
                "engine state"
            );
        }
    });

    // Reachability probe drives the engine's online signal.
    let probe = reqwest::Client::builder()
        .user_agent("dutysync/0.1")
        .build()?;
    let health_url = reqwest::Url::parse(&cfg.api.base_url)?.join(&cfg.api.health_path)?;
    let interval = Duration::from_millis(cfg.app.probe_interval_ms);
    info!(%health_url, "starting connectivity probe");
    loop {
        let online = match probe.get(health_url.clone()).send().await {
            Ok(res) => res.status().is_success(),
            Err(_) => false,
        };
        service.report_connectivity(online);
        tokio::time::sleep(interval).await;
    }
}
