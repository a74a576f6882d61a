use std::path::Path;
use std::time::Duration;

use anyhow::{Context, Result, bail};
use chrono::{DateTime, Utc};
use jsonwebtoken::{Algorithm, EncodingKey, Header, encode};
use serde::{Deserialize, Serialize};
use tokio::sync::Mutex;
use tracing::debug;

use crate::GOOGLE_TOKEN_URI;
use crate::store::StoreError;

/// OAuth scopes required by the Realtime Database REST API.
const DATABASE_SCOPES: &str = concat!(
    "https://www.googleapis.com/auth/firebase.database ",
    "https://www.googleapis.com/auth/userinfo.email"
);

/// Lifetime requested for signed assertions (Google caps this at one hour).
const ASSERTION_LIFETIME: Duration = Duration::from_secs(3600);

/// Refresh cached tokens this long before they actually expire.
const EXPIRY_MARGIN: Duration = Duration::from_secs(60);

/// Google service-account key file (the `serviceAccountKey.json` download).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServiceAccount {
    #[serde(default)]
    pub project_id: Option<String>,
    pub client_email: String,
    pub private_key: String,
    #[serde(default = "default_token_uri")]
    pub token_uri: String,
}

fn default_token_uri() -> String {
    GOOGLE_TOKEN_URI.to_string()
}

/// Credential object used to authenticate against the database.
#[derive(Debug, Clone)]
pub enum Credential {
    ServiceAccount(ServiceAccount),
    /// Legacy database secret, passed as the `auth` query parameter.
    DatabaseSecret(String),
}

#[derive(Deserialize)]
struct RawCredential {
    #[serde(default, rename = "type")]
    kind: Option<String>,
    #[serde(default)]
    database_secret: Option<String>,
    #[serde(flatten)]
    rest: serde_json::Map<String, serde_json::Value>,
}

impl Credential {
    /// Parse credential JSON text and validate it far enough that later
    /// token requests cannot fail on malformed input.
    pub fn from_json(text: &str) -> Result<Self> {
        let raw: RawCredential =
            serde_json::from_str(text).context("credential is not valid JSON")?;

        if let Some(secret) = raw.database_secret {
            if secret.trim().is_empty() {
                bail!("database_secret is empty");
            }
            return Ok(Credential::DatabaseSecret(secret.trim().to_string()));
        }

        match raw.kind.as_deref() {
            Some("service_account") => {}
            Some(other) => bail!("unsupported credential type {other:?}"),
            None => bail!("credential has neither \"type\" nor \"database_secret\""),
        }

        let account: ServiceAccount = serde_json::from_value(serde_json::Value::Object(raw.rest))
            .context("service account is missing required fields")?;
        EncodingKey::from_rsa_pem(account.private_key.as_bytes())
            .context("service account private_key is not a valid RSA PEM key")?;
        Ok(Credential::ServiceAccount(account))
    }

    /// Load and validate a credential file.
    pub fn load(path: &Path) -> Result<Self> {
        let text = std::fs::read_to_string(path)
            .with_context(|| format!("failed to read {}", path.display()))?;
        Self::from_json(&text).with_context(|| format!("invalid credential in {}", path.display()))
    }

    /// Short human-readable identity, safe to log.
    pub fn describe(&self) -> String {
        match self {
            Credential::ServiceAccount(sa) => format!("service account {}", sa.client_email),
            Credential::DatabaseSecret(_) => "database secret".to_string(),
        }
    }
}

/// Query parameter that authenticates one REST request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AuthParam {
    AccessToken(String),
    Secret(String),
}

impl AuthParam {
    pub fn as_query(&self) -> (&'static str, &str) {
        match self {
            AuthParam::AccessToken(t) => ("access_token", t),
            AuthParam::Secret(s) => ("auth", s),
        }
    }
}

#[derive(Serialize)]
struct AssertionClaims<'a> {
    iss: &'a str,
    scope: &'a str,
    aud: &'a str,
    iat: i64,
    exp: i64,
}

#[derive(Deserialize)]
struct TokenResponse {
    access_token: String,
    #[serde(default = "default_expires_in")]
    expires_in: i64,
}

fn default_expires_in() -> i64 {
    3600
}

struct CachedToken {
    token: String,
    expires_at: DateTime<Utc>,
}

/// Hands out authentication parameters, exchanging service-account
/// assertions for access tokens and caching them until shortly before expiry.
pub struct TokenProvider {
    credential: Credential,
    http: reqwest::Client,
    cached: Mutex<Option<CachedToken>>,
}

impl TokenProvider {
    pub fn new(credential: Credential, http: reqwest::Client) -> Self {
        Self {
            credential,
            http,
            cached: Mutex::new(None),
        }
    }

    pub async fn auth_param(&self) -> Result<AuthParam, StoreError> {
        let account = match &self.credential {
            Credential::DatabaseSecret(secret) => return Ok(AuthParam::Secret(secret.clone())),
            Credential::ServiceAccount(account) => account,
        };

        let mut cached = self.cached.lock().await;
        let margin = chrono::Duration::seconds(EXPIRY_MARGIN.as_secs() as i64);
        if let Some(token) = &*cached {
            if Utc::now() + margin < token.expires_at {
                return Ok(AuthParam::AccessToken(token.token.clone()));
            }
        }

        let fresh = self.exchange(account).await?;
        let param = AuthParam::AccessToken(fresh.token.clone());
        *cached = Some(fresh);
        Ok(param)
    }

    /// Drop the cached token so the next request fetches a new one.
    pub async fn invalidate(&self) {
        *self.cached.lock().await = None;
    }

    async fn exchange(&self, account: &ServiceAccount) -> Result<CachedToken, StoreError> {
        let assertion = sign_assertion(account, Utc::now())?;
        debug!("Requesting access token for {}", account.client_email);

        let resp = self
            .http
            .post(&account.token_uri)
            .form(&[
                ("grant_type", "urn:ietf:params:oauth:grant-type:jwt-bearer"),
                ("assertion", assertion.as_str()),
            ])
            .send()
            .await?;
        let status = resp.status();
        if !status.is_success() {
            let body = resp.text().await.unwrap_or_default();
            return Err(StoreError::Auth(format!("token endpoint returned {status}: {body}")));
        }
        let token: TokenResponse = resp.json().await?;
        Ok(CachedToken {
            token: token.access_token,
            expires_at: Utc::now() + chrono::Duration::seconds(token.expires_in),
        })
    }
}

/// Build the RS256-signed JWT assertion for the OAuth2 JWT-bearer grant.
pub fn sign_assertion(account: &ServiceAccount, now: DateTime<Utc>) -> Result<String, StoreError> {
    let key = EncodingKey::from_rsa_pem(account.private_key.as_bytes())
        .map_err(|e| StoreError::Auth(format!("invalid private key: {e}")))?;
    let iat = now.timestamp();
    let claims = AssertionClaims {
        iss: &account.client_email,
        scope: DATABASE_SCOPES,
        aud: &account.token_uri,
        iat,
        exp: iat + ASSERTION_LIFETIME.as_secs() as i64,
    };
    encode(&Header::new(Algorithm::RS256), &claims, &key)
        .map_err(|e| StoreError::Auth(format!("failed to sign assertion: {e}")))
}
