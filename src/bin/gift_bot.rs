use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::Parser;
use tracing::{info, warn};

use gift_auction_bot::auction::BidTracker;
use gift_auction_bot::auth::TokenProvider;
use gift_auction_bot::config::{AppConfig, CONFIG_PATH, Environment, Profile};
use gift_auction_bot::dispatch::EventDispatcher;
use gift_auction_bot::firebase::FirebaseStore;
use gift_auction_bot::recorder::EventRecorder;
use gift_auction_bot::reporter::{self, ExitSummary};
use gift_auction_bot::retry::TokioTimer;
use gift_auction_bot::session::{SessionManager, SessionSettings};
use gift_auction_bot::source::WsLiveSource;
use gift_auction_bot::store::{MemoryStore, Store};

#[derive(Parser)]
#[command(name = "gift-bot", about = "TikTok LIVE gift recorder and highest-bid tracker")]
struct Args {
    /// Path to the TOML config (optional; defaults apply when missing)
    #[arg(long, default_value = CONFIG_PATH)]
    config: PathBuf,

    /// Channel to subscribe to (overrides TIKTOK_USERNAME)
    #[arg(long)]
    channel: Option<String>,

    /// Deployment profile (overrides [bot] profile)
    #[arg(long, value_enum)]
    profile: Option<Profile>,

    /// Keep records in memory instead of writing to the database
    #[arg(long)]
    dry_run: bool,
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .with_writer(std::io::stderr)
        .init();

    let args = Args::parse();
    if let Err(e) = dotenvy::dotenv() {
        if !e.not_found() {
            anyhow::bail!("failed to load .env: {e}");
        }
    }

    // Everything below must succeed before the first connection attempt.
    let mut config = AppConfig::load_or_default(&args.config)?;
    if let Some(profile) = args.profile {
        config.bot.profile = profile;
    }
    let mut env = Environment::from_env(&config, !args.dry_run)?;
    if let Some(channel) = args.channel {
        env.channel = channel.trim_start_matches('@').to_string();
    }

    let memory = args.dry_run.then(|| Arc::new(MemoryStore::new()));
    let store: Arc<dyn Store> = match (&memory, &env.database) {
        (Some(memory), _) => {
            info!(
                "Loaded config ({:?} profile): channel=@{} store=memory",
                config.bot.profile, env.channel
            );
            warn!("Dry run: records are kept in memory only");
            memory.clone()
        }
        (None, Some(database)) => {
            info!(
                "Loaded config ({:?} profile): channel=@{} store={} credential={}",
                config.bot.profile,
                env.channel,
                database.url,
                database.credential.describe(),
            );
            let http = reqwest::Client::builder()
                .timeout(config.firebase.request_timeout())
                .build()
                .context("failed to build HTTP client")?;
            let tokens = TokenProvider::new(database.credential.clone(), http.clone());
            Arc::new(FirebaseStore::new(database.url.clone(), http, tokens))
        }
        (None, None) => anyhow::bail!("database settings were not loaded"),
    };

    let recorder = EventRecorder::new(store, config.bot.gift_path());
    let tracker = config.bot.auction_enabled().then(|| {
        BidTracker::new(
            recorder.clone(),
            config.auction.write_mode,
            config.auction.max_conflicts,
        )
    });
    let dispatcher = EventDispatcher::new(recorder, tracker);
    let source = WsLiveSource::new(
        env.live_source_url.clone(),
        config.bot.handshake_timeout(),
    );

    let manager = SessionManager::new(
        SessionSettings {
            channel: env.channel.clone(),
            offline_retry: config.retry.offline,
            reconnect: config.retry.reconnect,
            exit_on_initial_failure: config.bot.exit_on_initial_failure(),
            handler_grace: config.bot.handler_grace(),
        },
        Arc::new(source),
        dispatcher,
        Arc::new(TokioTimer),
    );

    info!("Listening for @{} events. Press Ctrl+C to stop.", env.channel);
    let outcome = tokio::select! {
        _ = tokio::signal::ctrl_c() => {
            info!("Shutdown signal received");
            Ok(())
        }
        res = manager.run() => res,
    };

    // --- Exit summary ---
    let auction = match (&memory, manager.dispatcher().tracker()) {
        (Some(_), Some(tracker)) => match tracker.current().await {
            Ok(state) => Some(state),
            Err(e) => {
                warn!("Failed to read final auction state: {e}");
                None
            }
        },
        _ => None,
    };
    let summary = ExitSummary::new(&env.channel, manager.dispatcher().stats(), auction);
    reporter::report_exit_summary(&summary);

    outcome
}
