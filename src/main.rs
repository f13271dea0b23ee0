//! # Dripcast
//!
//! Drip-campaign engine for a subscriber bot: Telegram ingest, the delivery
//! dispatcher, the daily expiry sweep, and the admin API in one process.
//!
//! Usage:
//!   dripcast                          # config from $DATA_DIR/config.toml
//!   dripcast --config ~/drip.toml     # explicit config file
//!   dripcast --verbose --log-json     # debug level, JSON lines

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use async_trait::async_trait;
use clap::Parser;
use dripcast_channels::{ChatEvent, TelegramEvents, TelegramTransport};
use dripcast_core::config::{self, DripConfig};
use dripcast_core::error::DripError;
use dripcast_core::traits::{Clock, SystemClock, Transport};
use dripcast_core::types::LinkButton;
use dripcast_gateway::AppState;
use dripcast_scheduler::{Dispatcher, ExpiryController, LifecycleRegistry};
use dripcast_store::Store;
use futures::StreamExt;
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(
    name = "dripcast",
    version,
    about = "💧 Dripcast: drip-campaign scheduling and dispatch for a subscriber bot"
)]
struct Cli {
    /// Config file (defaults to $DATA_DIR/config.toml when present)
    #[arg(short, long)]
    config: Option<String>,

    /// Debug logging
    #[arg(short, long)]
    verbose: bool,

    /// Emit logs as JSON lines
    #[arg(long)]
    log_json: bool,
}

fn init_tracing(cli: &Cli) {
    let default = if cli.verbose {
        "dripcast=debug,tower_http=debug"
    } else {
        "dripcast=info"
    };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default));
    if cli.log_json {
        tracing_subscriber::fmt()
            .json()
            .with_env_filter(filter)
            .with_current_span(true)
            .init();
    } else {
        tracing_subscriber::fmt()
            .with_env_filter(filter)
            .with_target(false)
            .init();
    }
}

/// Stand-in when Telegram is disabled: every send fails as transient, so
/// nothing is marked delivered.
struct OfflineTransport;

#[async_trait]
impl Transport for OfflineTransport {
    fn name(&self) -> &str {
        "offline"
    }

    async fn send_text(&self, _user_id: i64, _body: &str, _buttons: &[LinkButton]) -> dripcast_core::Result<()> {
        Err(DripError::TransportTransient("telegram disabled".into()))
    }

    async fn send_photo(
        &self,
        _user_id: i64,
        _photo_ref: &str,
        _caption: &str,
        _buttons: &[LinkButton],
    ) -> dripcast_core::Result<()> {
        Err(DripError::TransportTransient("telegram disabled".into()))
    }
}

/// Feed chat events to the registry one at a time, so each user's events
/// apply in arrival order.
async fn ingest(events: TelegramEvents, registry: Arc<LifecycleRegistry>) {
    let mut stream = events.start();
    while let Some(event) = stream.next().await {
        let user_id = event.user_id();
        let result = match &event {
            ChatEvent::Joined { user_id, username, name } => registry
                .joined(*user_id, username.as_deref(), name.as_deref())
                .await
                .map(|_| ()),
            ChatEvent::Left { user_id } => registry.left(*user_id).await.map(|_| ()),
            ChatEvent::FirstContact { user_id, username, name } => registry
                .first_contact(*user_id, username.as_deref(), name.as_deref())
                .await
                .map(|_| ()),
            ChatEvent::MenuPressed { user_id, label } => {
                registry.menu_pressed(*user_id, label).await.map(|_| ())
            }
        };
        if let Err(e) = result {
            tracing::warn!(user_id, event = event.name(), kind = e.kind(), "event failed: {e}");
        }
    }
    tracing::info!("chat event stream ended");
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    init_tracing(&cli);

    // Data dir must be writable before anything opens the database.
    let data_dir = DripConfig::data_dir();
    config::check_writable(&data_dir)
        .with_context(|| format!("data dir {} is not writable", data_dir.display()))?;

    let cfg = match &cli.config {
        Some(path) => DripConfig::load_from(&PathBuf::from(shellexpand::tilde(path).as_ref()))?,
        None => DripConfig::load(&data_dir)?,
    };

    let db_path = DripConfig::database_path(&data_dir);
    let store = Arc::new(Store::open(&db_path, &cfg.store)?);
    let clock: Arc<dyn Clock> = Arc::new(SystemClock);

    let (transport, events): (Arc<dyn Transport>, Option<TelegramEvents>) = if cfg.telegram.enabled {
        let transport = TelegramTransport::new(&cfg.telegram)?;
        match transport.get_me().await {
            Ok(name) => tracing::info!("🤖 Telegram bot: @{name}"),
            Err(e) => tracing::warn!(kind = e.kind(), "Telegram getMe failed: {e}"),
        }
        (Arc::new(transport), Some(TelegramEvents::new(&cfg.telegram)?))
    } else {
        tracing::warn!("telegram disabled: no ingest, no dispatch");
        (Arc::new(OfflineTransport), None)
    };

    let registry = Arc::new(
        LifecycleRegistry::new(store.clone(), transport.clone(), clock.clone())
            .with_followup_pause(Duration::from_millis(cfg.welcome.followup_pause_ms)),
    );
    let dispatcher = Dispatcher::new(
        store.clone(),
        transport.clone(),
        clock.clone(),
        Duration::from_secs(cfg.dispatcher.tick_secs),
    );
    let expiry = ExpiryController::new(store.clone(), transport.clone(), clock.clone(), &cfg.expiry)?;

    let (shutdown_tx, mut shutdown_rx) = tokio::sync::watch::channel(false);
    let state = Arc::new(AppState::new(
        store.clone(),
        registry.clone(),
        clock.clone(),
        &cfg.gateway,
        cfg.expiry.utc_offset_minutes,
    ));
    let gateway_config = cfg.gateway.clone();
    let mut gateway = tokio::spawn(async move {
        dripcast_gateway::serve(state, &gateway_config, async move {
            let _ = shutdown_rx.changed().await;
        })
        .await
    });

    println!("💧 Dripcast v{}", env!("CARGO_PKG_VERSION"));
    println!("   🗄️  Database:  {}", db_path.display());
    println!("   ⏱️  Tick:      {}s", cfg.dispatcher.tick_secs);
    println!("   📅 Expiry:    {}", cfg.expiry.schedule);
    println!("   🌐 Admin API: http://{}:{}/api", cfg.gateway.host, cfg.gateway.port);
    println!();

    // One task per loop; store calls inside them run on the blocking pool.
    let mut tasks = tokio::task::JoinSet::new();
    if let Some(events) = events {
        let registry = registry.clone();
        tasks.spawn(async move {
            ingest(events, registry).await;
            "ingest"
        });
        tasks.spawn(async move {
            dispatcher.run().await;
            "dispatcher"
        });
    }
    tasks.spawn(async move {
        expiry.run().await;
        "expiry"
    });

    tokio::select! {
        ended = tasks.join_next() => match ended {
            Some(Ok(name)) => tracing::warn!(task = name, "task ended, shutting down"),
            Some(Err(e)) => tracing::error!("task failed: {e}"),
            None => {}
        },
        res = &mut gateway => {
            tasks.shutdown().await;
            res.context("admin API task panicked")??;
            return Ok(());
        }
        _ = tokio::signal::ctrl_c() => {
            tracing::info!("shutdown requested");
        }
    }

    tasks.shutdown().await;
    let _ = shutdown_tx.send(true);
    if let Err(e) = gateway.await {
        tracing::warn!("admin API task ended abnormally: {e}");
    }
    tracing::info!("👋 Dripcast stopped");
    Ok(())
}
