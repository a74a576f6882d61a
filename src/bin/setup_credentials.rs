//! setup-credentials: first-time database setup for the gift bot.
//!
//! Validates a credential (a service-account key file, or a legacy database
//! secret entered interactively), authenticates against the Realtime Database,
//! prints the current auction record, and stores the credential file path in
//! `config.toml` (created with defaults if missing).
//!
//! By default the database secret is read with hidden input to avoid leaking
//! it into shell history. Use `--secret` only for scripted/CI use.

use std::path::{Path, PathBuf};

use anyhow::{Context, Result, bail};
use clap::Parser;
use serde_json::json;
use url::Url;

use gift_auction_bot::auction::AUCTION_PATH;
use gift_auction_bot::auth::{Credential, TokenProvider};
use gift_auction_bot::config::{AppConfig, CONFIG_PATH, ENV_DB_URL};
use gift_auction_bot::firebase::FirebaseStore;
use gift_auction_bot::store::Store;
use gift_auction_bot::types::AuctionState;

#[derive(Parser)]
#[command(
    name = "setup-credentials",
    about = "Validate database credentials and save their location to config.toml"
)]
struct Cli {
    /// Service-account key file. If omitted, a database secret is requested instead.
    #[arg(long)]
    credentials: Option<PathBuf>,

    /// Database secret (reads interactively with hidden input when omitted).
    #[arg(long, conflicts_with = "credentials")]
    secret: Option<String>,

    /// Where to write the secret credential file.
    #[arg(long, default_value = "databaseSecret.json")]
    output: PathBuf,

    /// Realtime Database URL (defaults to FIREBASE_DB_URL).
    #[arg(long)]
    db_url: Option<String>,
}

#[tokio::main]
async fn main() -> Result<()> {
    dotenvy::dotenv().ok();
    let cli = Cli::parse();
    let config_path = Path::new(CONFIG_PATH);
    let mut app_config = AppConfig::load_or_default(config_path)?;

    println!("=== Gift Bot: Database Setup ===\n");

    // ── Step 1: Database URL ───────────────────────────────────────
    let db_url = match cli.db_url.or_else(|| std::env::var(ENV_DB_URL).ok()) {
        Some(url) => url,
        None => bail!("pass --db-url or set {ENV_DB_URL}"),
    };
    let db_url = Url::parse(db_url.trim()).context("invalid database URL")?;
    println!("Database: {db_url}\n");

    // ── Step 2: Load or create the credential ──────────────────────
    let (credential, credential_path) = match cli.credentials {
        Some(path) => {
            println!("Validating {}...", path.display());
            (Credential::load(&path)?, path)
        }
        None => {
            let secret = match cli.secret {
                Some(secret) => secret,
                None => rpassword::prompt_password("Enter database secret: ")
                    .context("failed to read database secret")?,
            };
            if secret.trim().is_empty() {
                bail!("database secret cannot be empty");
            }
            let text = json!({ "database_secret": secret.trim() }).to_string();
            let credential = Credential::from_json(&text)?;
            std::fs::write(&cli.output, text)
                .with_context(|| format!("failed to write {}", cli.output.display()))?;
            println!("  Wrote {}", cli.output.display());
            (credential, cli.output)
        }
    };
    println!("  Credential: {}\n", credential.describe());

    // ── Step 3: Authenticate and read the auction record ───────────
    println!("Reading {AUCTION_PATH}...");
    let http = reqwest::Client::builder()
        .timeout(app_config.firebase.request_timeout())
        .build()
        .context("failed to build HTTP client")?;
    let tokens = TokenProvider::new(credential, http.clone());
    let store = FirebaseStore::new(db_url, http, tokens);
    let auction = match store
        .get(AUCTION_PATH)
        .await
        .context("database request failed, check the credential and URL")?
    {
        Some(value) => serde_json::from_value::<AuctionState>(value)
            .context("auction record exists but is malformed")?,
        None => AuctionState::default(),
    };
    println!("  Access OK");
    println!(
        "  Highest bid: {} by {}",
        auction.highest_bid,
        auction.highest_bidder.as_deref().unwrap_or("nobody")
    );
    println!();

    // ── Step 4: Save the credential path ───────────────────────────
    println!("Updating {}...", config_path.display());
    app_config.firebase.credentials_file = Some(credential_path.clone());
    app_config.save(config_path)?;
    println!("  Config updated successfully\n");

    // ── Summary ────────────────────────────────────────────────────
    println!("=== Setup Complete ===");
    println!();
    println!("Credential file: {}", credential_path.display());
    println!();
    println!("Next steps:");
    println!("  TIKTOK_USERNAME=<channel> cargo run --bin gift-bot -- --dry-run");
    println!("  TIKTOK_USERNAME=<channel> {ENV_DB_URL}=<database url> cargo run --bin gift-bot");

    Ok(())
}
