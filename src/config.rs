use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result, anyhow};
use clap::ValueEnum;
use serde::{Deserialize, Serialize};
use url::Url;

use crate::DEFAULT_LIVE_SOURCE_URL;
use crate::auction::WriteMode;
use crate::auth::Credential;
use crate::retry::RetryPolicy;

/// Default config file path.
pub const CONFIG_PATH: &str = "config.toml";

/// Credential file used when neither the environment nor the config names one.
pub const DEFAULT_CREDENTIALS_FILE: &str = "serviceAccountKey.json";

pub const ENV_CHANNEL: &str = "TIKTOK_USERNAME";
pub const ENV_DB_URL: &str = "FIREBASE_DB_URL";
pub const ENV_CREDENTIALS: &str = "FIREBASE_CREDENTIALS";
pub const ENV_CREDENTIALS_FILE: &str = "FIREBASE_CREDENTIALS_FILE";
pub const ENV_LIVE_SOURCE_URL: &str = "LIVE_SOURCE_URL";

/// Which of the two deployments to run.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize, ValueEnum)]
#[serde(rename_all = "snake_case")]
pub enum Profile {
    /// Gift records under `gifts/`, highest-bid tracking on, keep retrying.
    #[default]
    Auction,
    /// Gift records under `donations/`, no auction, exit if the first connect fails.
    Donations,
}

/// Top-level application config deserialized from `config.toml`.
///
/// Every field is optional; a missing file means all defaults.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct AppConfig {
    #[serde(default)]
    pub bot: BotConfig,
    #[serde(default)]
    pub retry: RetryConfig,
    #[serde(default)]
    pub auction: AuctionConfig,
    #[serde(default)]
    pub firebase: FirebaseConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BotConfig {
    #[serde(default)]
    pub profile: Profile,
    /// Overrides the profile's gift record path.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub gift_path: Option<String>,
    /// Overrides whether the profile tracks the highest bid.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub auction_enabled: Option<bool>,
    /// Overrides whether a failed first connection exits the process.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub exit_on_initial_failure: Option<bool>,
    #[serde(default = "default_handshake_timeout")]
    pub handshake_timeout_secs: u64,
    /// How long a finished session waits for in-flight event handlers.
    #[serde(default = "default_handler_grace")]
    pub handler_grace_secs: u64,
}

fn default_handshake_timeout() -> u64 {
    20
}

fn default_handler_grace() -> u64 {
    5
}

impl Default for BotConfig {
    fn default() -> Self {
        Self {
            profile: Profile::default(),
            gift_path: None,
            auction_enabled: None,
            exit_on_initial_failure: None,
            handshake_timeout_secs: default_handshake_timeout(),
            handler_grace_secs: default_handler_grace(),
        }
    }
}

impl BotConfig {
    pub fn gift_path(&self) -> &str {
        match (&self.gift_path, self.profile) {
            (Some(path), _) => path.as_str(),
            (None, Profile::Auction) => "gifts",
            (None, Profile::Donations) => "donations",
        }
    }

    pub fn auction_enabled(&self) -> bool {
        self.auction_enabled.unwrap_or(self.profile == Profile::Auction)
    }

    pub fn exit_on_initial_failure(&self) -> bool {
        self.exit_on_initial_failure.unwrap_or(self.profile == Profile::Donations)
    }

    pub fn handshake_timeout(&self) -> Duration {
        Duration::from_secs(self.handshake_timeout_secs)
    }

    pub fn handler_grace(&self) -> Duration {
        Duration::from_secs(self.handler_grace_secs)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RetryConfig {
    /// After a failed connection attempt.
    #[serde(default = "default_offline_retry")]
    pub offline: RetryPolicy,
    /// After an established session drops.
    #[serde(default = "default_reconnect")]
    pub reconnect: RetryPolicy,
}

fn default_offline_retry() -> RetryPolicy {
    RetryPolicy::fixed(30)
}

fn default_reconnect() -> RetryPolicy {
    RetryPolicy::fixed(15)
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            offline: default_offline_retry(),
            reconnect: default_reconnect(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AuctionConfig {
    #[serde(default)]
    pub write_mode: WriteMode,
    /// Conditional-write conflicts tolerated per gift before giving up.
    #[serde(default = "default_max_conflicts")]
    pub max_conflicts: u32,
}

fn default_max_conflicts() -> u32 {
    5
}

impl Default for AuctionConfig {
    fn default() -> Self {
        Self {
            write_mode: WriteMode::default(),
            max_conflicts: default_max_conflicts(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FirebaseConfig {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub credentials_file: Option<PathBuf>,
    /// Upper bound on any single database request, token exchange included.
    #[serde(default = "default_request_timeout")]
    pub request_timeout_secs: u64,
}

fn default_request_timeout() -> u64 {
    30
}

impl Default for FirebaseConfig {
    fn default() -> Self {
        Self {
            credentials_file: None,
            request_timeout_secs: default_request_timeout(),
        }
    }
}

impl FirebaseConfig {
    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.request_timeout_secs)
    }
}

impl AppConfig {
    /// Load config from the given TOML file path.
    pub fn load(path: &Path) -> Result<Self> {
        let contents = std::fs::read_to_string(path)
            .with_context(|| format!("failed to read {}", path.display()))?;
        let config: Self = toml::from_str(&contents)
            .with_context(|| format!("failed to parse {}", path.display()))?;
        Ok(config)
    }

    /// Like [`AppConfig::load`], but a missing file yields the defaults.
    pub fn load_or_default(path: &Path) -> Result<Self> {
        if path.exists() {
            Self::load(path)
        } else {
            Ok(Self::default())
        }
    }

    /// Write config to the given TOML file path.
    pub fn save(&self, path: &Path) -> Result<()> {
        let contents = toml::to_string_pretty(self).context("failed to serialize config")?;
        std::fs::write(path, contents)
            .with_context(|| format!("failed to write {}", path.display()))?;
        Ok(())
    }
}

/// Required process environment, validated before anything connects.
#[derive(Debug, Clone)]
pub struct Environment {
    pub channel: String,
    pub live_source_url: Url,
    /// `None` when the run never touches the database (`--dry-run`).
    pub database: Option<DatabaseEnv>,
}

/// Database location and the credential to reach it.
#[derive(Debug, Clone)]
pub struct DatabaseEnv {
    pub url: Url,
    pub credential: Credential,
}

impl Environment {
    /// Read from the process environment (after `.env` has been loaded).
    pub fn from_env(config: &AppConfig, needs_database: bool) -> Result<Self> {
        Self::from_lookup(|key| std::env::var(key).ok(), config, needs_database)
    }

    /// Read through `lookup`; blank values count as missing. Database
    /// settings are only read and validated when `needs_database` is set.
    pub fn from_lookup(
        lookup: impl Fn(&str) -> Option<String>,
        config: &AppConfig,
        needs_database: bool,
    ) -> Result<Self> {
        let get = |key: &str| {
            lookup(key)
                .map(|v| v.trim().to_string())
                .filter(|v| !v.is_empty())
        };
        let require = |key: &str| get(key).ok_or_else(|| anyhow!("missing {key} in environment"));

        let channel = require(ENV_CHANNEL)?;
        let channel = channel.trim_start_matches('@').to_string();

        let database = if needs_database {
            let url = require(ENV_DB_URL)?;
            let url =
                Url::parse(&url).with_context(|| format!("{ENV_DB_URL} is not a valid URL"))?;

            let credential = match get(ENV_CREDENTIALS) {
                Some(json) => Credential::from_json(&json)
                    .with_context(|| format!("invalid credential in {ENV_CREDENTIALS}"))?,
                None => {
                    let path = get(ENV_CREDENTIALS_FILE)
                        .map(PathBuf::from)
                        .or_else(|| config.firebase.credentials_file.clone())
                        .unwrap_or_else(|| PathBuf::from(DEFAULT_CREDENTIALS_FILE));
                    Credential::load(&path)?
                }
            };
            Some(DatabaseEnv { url, credential })
        } else {
            None
        };

        let live_source_url =
            get(ENV_LIVE_SOURCE_URL).unwrap_or_else(|| DEFAULT_LIVE_SOURCE_URL.to_string());
        let live_source_url = Url::parse(&live_source_url)
            .with_context(|| format!("{ENV_LIVE_SOURCE_URL} is not a valid URL"))?;

        Ok(Self {
            channel,
            live_source_url,
            database,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn lookup(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |key: &str| map.get(key).cloned()
    }

    fn full_env() -> Vec<(&'static str, &'static str)> {
        vec![
            (ENV_CHANNEL, "@streamer"),
            (ENV_DB_URL, "https://demo-default-rtdb.firebaseio.com"),
            (ENV_CREDENTIALS, r#"{ "database_secret": "abc" }"#),
        ]
    }

    fn load(pairs: &[(&str, &str)], needs_database: bool) -> Result<Environment> {
        Environment::from_lookup(lookup(pairs), &AppConfig::default(), needs_database)
    }

    #[test]
    fn valid_environment_loads() {
        let env = load(&full_env(), true).unwrap();
        assert_eq!(env.channel, "streamer");
        assert_eq!(env.live_source_url.as_str(), DEFAULT_LIVE_SOURCE_URL);
        let database = env.database.unwrap();
        assert_eq!(
            database.url.host_str(),
            Some("demo-default-rtdb.firebaseio.com")
        );
        assert!(matches!(database.credential, Credential::DatabaseSecret(_)));
    }

    #[test]
    fn missing_channel_is_fatal() {
        let mut pairs = full_env();
        pairs.retain(|(k, _)| *k != ENV_CHANNEL);
        let err = load(&pairs, true).unwrap_err();
        assert!(err.to_string().contains(ENV_CHANNEL));
    }

    #[test]
    fn blank_db_url_counts_as_missing() {
        let mut pairs = full_env();
        pairs.retain(|(k, _)| *k != ENV_DB_URL);
        pairs.push((ENV_DB_URL, "   "));
        let err = load(&pairs, true).unwrap_err();
        assert!(err.to_string().contains(ENV_DB_URL));
    }

    #[test]
    fn malformed_credential_json_is_fatal() {
        let mut pairs = full_env();
        pairs.retain(|(k, _)| *k != ENV_CREDENTIALS);
        pairs.push((ENV_CREDENTIALS, "{ \"type\": "));
        let err = load(&pairs, true).unwrap_err();
        assert!(format!("{err:#}").contains(ENV_CREDENTIALS));
    }

    #[test]
    fn missing_credential_file_is_fatal() {
        let mut pairs = full_env();
        pairs.retain(|(k, _)| *k != ENV_CREDENTIALS);
        pairs.push((ENV_CREDENTIALS_FILE, "/nonexistent/serviceAccountKey.json"));
        let err = load(&pairs, true).unwrap_err();
        assert!(format!("{err:#}").contains("failed to read"));
    }

    #[test]
    fn database_settings_skipped_when_not_needed() {
        let pairs = [
            (ENV_CHANNEL, "streamer"),
            (ENV_CREDENTIALS_FILE, "/nonexistent/serviceAccountKey.json"),
        ];
        let env = load(&pairs, false).unwrap();
        assert_eq!(env.channel, "streamer");
        assert!(env.database.is_none());

        let err = load(&pairs, true).unwrap_err();
        assert!(err.to_string().contains(ENV_DB_URL));
    }

    #[test]
    fn credential_file_is_read() {
        let path =
            std::env::temp_dir().join(format!("gift-bot-cred-{}.json", std::process::id()));
        std::fs::write(&path, r#"{ "database_secret": "from-file" }"#).unwrap();

        let mut pairs = full_env();
        pairs.retain(|(k, _)| *k != ENV_CREDENTIALS);
        let mut config = AppConfig::default();
        config.firebase.credentials_file = Some(path.clone());
        let env = Environment::from_lookup(lookup(&pairs), &config, true).unwrap();
        std::fs::remove_file(&path).ok();

        match env.database.map(|d| d.credential) {
            Some(Credential::DatabaseSecret(s)) => assert_eq!(s, "from-file"),
            other => panic!("unexpected credential {other:?}"),
        }
    }

    #[test]
    fn profiles_pick_defaults() {
        let auction = BotConfig::default();
        assert_eq!(auction.gift_path(), "gifts");
        assert!(auction.auction_enabled());
        assert!(!auction.exit_on_initial_failure());

        let donations = BotConfig {
            profile: Profile::Donations,
            ..BotConfig::default()
        };
        assert_eq!(donations.gift_path(), "donations");
        assert!(!donations.auction_enabled());
        assert!(donations.exit_on_initial_failure());
    }

    #[test]
    fn partial_toml_fills_defaults() {
        let config: AppConfig = toml::from_str(
            r#"
            [bot]
            profile = "donations"
            auction_enabled = true

            [retry.reconnect]
            delay_secs = 5
            max_attempts = 10

            [auction]
            write_mode = "overwrite"
            "#,
        )
        .unwrap();
        assert_eq!(config.bot.gift_path(), "donations");
        assert!(config.bot.auction_enabled());
        assert_eq!(config.bot.handshake_timeout(), Duration::from_secs(20));
        assert_eq!(config.bot.handler_grace(), Duration::from_secs(5));
        assert_eq!(config.firebase.request_timeout(), Duration::from_secs(30));
        assert_eq!(config.retry.offline, RetryPolicy::fixed(30));
        assert_eq!(config.retry.reconnect.delay_secs, 5);
        assert_eq!(config.retry.reconnect.max_attempts, Some(10));
        assert_eq!(config.auction.write_mode, WriteMode::Overwrite);
        assert_eq!(config.auction.max_conflicts, 5);
    }

    #[test]
    fn save_then_load_keeps_credentials_path() {
        let path =
            std::env::temp_dir().join(format!("gift-bot-config-{}.toml", std::process::id()));
        let mut config = AppConfig::default();
        config.firebase.credentials_file = Some(PathBuf::from("keys/bot.json"));
        config.save(&path).unwrap();

        let loaded = AppConfig::load(&path).unwrap();
        std::fs::remove_file(&path).ok();
        assert_eq!(
            loaded.firebase.credentials_file,
            Some(PathBuf::from("keys/bot.json"))
        );
    }
}
