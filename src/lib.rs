pub mod auction;
pub mod auth;
pub mod config;
pub mod dispatch;
pub mod firebase;
pub mod recorder;
pub mod reporter;
pub mod retry;
pub mod session;
pub mod source;
pub mod store;
pub mod types;

/// Default WebSocket relay for TikTok LIVE events (a local bridge process).
pub const DEFAULT_LIVE_SOURCE_URL: &str = "ws://127.0.0.1:8081/live";

/// Google OAuth2 token endpoint for service-account assertions.
pub const GOOGLE_TOKEN_URI: &str = "https://oauth2.googleapis.com/token";
