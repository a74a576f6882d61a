use async_trait::async_trait;
use reqwest::{RequestBuilder, Response, StatusCode};
use serde::Deserialize;
use serde_json::Value;
use tracing::debug;
use url::Url;

use crate::auth::TokenProvider;
use crate::store::{Store, StoreError, Version, Versioned, WriteOutcome};

const ETAG_REQUEST_HEADER: &str = "X-Firebase-ETag";

/// Firebase Realtime Database over its REST API.
pub struct FirebaseStore {
    base: Url,
    http: reqwest::Client,
    tokens: TokenProvider,
}

#[derive(Deserialize)]
struct PushResponse {
    name: String,
}

impl FirebaseStore {
    pub fn new(base: Url, http: reqwest::Client, tokens: TokenProvider) -> Self {
        Self { base, http, tokens }
    }

    /// REST URL for a database path: `<base>/<path>.json`.
    pub fn endpoint(&self, path: &str) -> Result<Url, StoreError> {
        endpoint(&self.base, path)
    }

    async fn send(
        &self,
        path: &str,
        build: impl Fn(Url) -> RequestBuilder,
    ) -> Result<Response, StoreError> {
        let url = self.endpoint(path)?;
        let auth = self.tokens.auth_param().await?;
        let (key, value) = auth.as_query();
        let resp = build(url).query(&[(key, value)]).send().await?;

        if resp.status() == StatusCode::UNAUTHORIZED {
            // Token may have been revoked early; the next call fetches a fresh one.
            self.tokens.invalidate().await;
        }
        Ok(resp)
    }
}

pub fn endpoint(base: &Url, path: &str) -> Result<Url, StoreError> {
    let path = path.trim_matches('/');
    let joined = format!("{}/{path}.json", base.as_str().trim_end_matches('/'));
    Url::parse(&joined).map_err(|_| StoreError::InvalidPath(path.to_string()))
}

async fn check(resp: Response) -> Result<Response, StoreError> {
    let status = resp.status();
    if status.is_success() {
        return Ok(resp);
    }
    let body = resp.text().await.unwrap_or_default();
    Err(StoreError::Http {
        status: status.as_u16(),
        body,
    })
}

/// Firebase returns the literal `null` for absent paths.
fn non_null(value: Value) -> Option<Value> {
    (!value.is_null()).then_some(value)
}

#[async_trait]
impl Store for FirebaseStore {
    async fn push(&self, path: &str, value: &Value) -> Result<String, StoreError> {
        let resp = self.send(path, |url| self.http.post(url).json(value)).await?;
        let pushed: PushResponse = check(resp).await?.json().await?;
        debug!("Pushed {path}/{}", pushed.name);
        Ok(pushed.name)
    }

    async fn get(&self, path: &str) -> Result<Option<Value>, StoreError> {
        let resp = self.send(path, |url| self.http.get(url)).await?;
        let value: Value = check(resp).await?.json().await?;
        Ok(non_null(value))
    }

    async fn get_versioned(&self, path: &str) -> Result<Versioned, StoreError> {
        let resp = self
            .send(path, |url| self.http.get(url).header(ETAG_REQUEST_HEADER, "true"))
            .await?;
        let resp = check(resp).await?;
        let etag = resp
            .headers()
            .get(reqwest::header::ETAG)
            .and_then(|v| v.to_str().ok())
            .map(str::to_string)
            .ok_or(StoreError::MissingField("ETag header"))?;
        let value: Value = resp.json().await?;
        Ok(Versioned {
            value: non_null(value),
            version: Version(etag),
        })
    }

    async fn set(&self, path: &str, value: &Value) -> Result<(), StoreError> {
        let resp = self.send(path, |url| self.http.put(url).json(value)).await?;
        check(resp).await?;
        Ok(())
    }

    async fn set_if(
        &self,
        path: &str,
        value: &Value,
        expected: &Version,
    ) -> Result<WriteOutcome, StoreError> {
        let resp = self
            .send(path, |url| {
                self.http
                    .put(url)
                    .header(reqwest::header::IF_MATCH, expected.0.as_str())
                    .json(value)
            })
            .await?;
        if resp.status() == StatusCode::PRECONDITION_FAILED {
            return Ok(WriteOutcome::Conflict);
        }
        check(resp).await?;
        Ok(WriteOutcome::Written)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::auth::{Credential, ServiceAccount};
    use serde_json::json;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::net::{TcpListener, TcpStream};
    use tokio::task::JoinHandle;

    /// Throwaway RSA key; only ever signs assertions for the local token stub.
    const TEST_PRIVATE_KEY: &str = include_str!("../testdata/test_service_account_key.pem");

    struct Reply {
        status: u16,
        headers: &'static [(&'static str, &'static str)],
        body: &'static str,
    }

    fn reply(status: u16, body: &'static str) -> Reply {
        Reply {
            status,
            headers: &[],
            body,
        }
    }

    /// Local HTTP server answering each connection with the next canned
    /// reply. Resolves to the raw requests it received.
    async fn stub(replies: Vec<Reply>) -> (Url, JoinHandle<Vec<String>>) {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let url = Url::parse(&format!("http://{}/", listener.local_addr().unwrap())).unwrap();
        let handle = tokio::spawn(async move {
            let mut seen = Vec::new();
            for reply in replies {
                let (mut stream, _) = listener.accept().await.unwrap();
                seen.push(read_request(&mut stream).await);

                let mut head = format!(
                    "HTTP/1.1 {} Stub\r\ncontent-type: application/json\r\n\
                     content-length: {}\r\nconnection: close\r\n",
                    reply.status,
                    reply.body.len()
                );
                for (name, value) in reply.headers {
                    head.push_str(&format!("{name}: {value}\r\n"));
                }
                head.push_str("\r\n");
                stream.write_all(head.as_bytes()).await.unwrap();
                stream.write_all(reply.body.as_bytes()).await.unwrap();
                stream.shutdown().await.ok();
            }
            seen
        });
        (url, handle)
    }

    async fn read_request(stream: &mut TcpStream) -> String {
        let mut buf = Vec::new();
        let mut chunk = [0u8; 4096];
        loop {
            let n = stream.read(&mut chunk).await.unwrap();
            if n == 0 {
                break;
            }
            buf.extend_from_slice(&chunk[..n]);
            let text = String::from_utf8_lossy(&buf);
            if let Some(end) = text.find("\r\n\r\n") {
                let length = text[..end]
                    .lines()
                    .filter_map(|line| line.split_once(':'))
                    .find(|(name, _)| name.trim().eq_ignore_ascii_case("content-length"))
                    .and_then(|(_, value)| value.trim().parse::<usize>().ok())
                    .unwrap_or(0);
                if buf.len() >= end + 4 + length {
                    break;
                }
            }
        }
        String::from_utf8_lossy(&buf).into_owned()
    }

    fn http() -> reqwest::Client {
        reqwest::Client::builder().no_proxy().build().unwrap()
    }

    fn secret_store(base: Url) -> FirebaseStore {
        let http = http();
        let tokens = TokenProvider::new(Credential::DatabaseSecret("s3cret".into()), http.clone());
        FirebaseStore::new(base, http, tokens)
    }

    #[tokio::test]
    async fn push_returns_generated_name() {
        let (base, requests) = stub(vec![reply(200, r#"{"name":"-NxYz01"}"#)]).await;
        let store = secret_store(base);

        let key = store.push("logs", &json!({ "type": "CHAT" })).await.unwrap();
        assert_eq!(key, "-NxYz01");

        let requests = requests.await.unwrap();
        assert!(requests[0].starts_with("POST /logs.json?auth=s3cret HTTP/1.1"));
        assert!(requests[0].ends_with(r#"{"type":"CHAT"}"#));
    }

    #[tokio::test]
    async fn versioned_read_requests_etag() {
        let (base, requests) = stub(vec![
            Reply {
                status: 200,
                headers: &[("ETag", "\"v1\"")],
                body: r#"{"highestBid":10}"#,
            },
            reply(200, "null"),
        ])
        .await;
        let store = secret_store(base);

        let read = store.get_versioned(AUCTION).await.unwrap();
        assert_eq!(read.value, Some(json!({ "highestBid": 10 })));
        assert_eq!(read.version, Version("\"v1\"".into()));

        let err = store.get_versioned(AUCTION).await.unwrap_err();
        assert!(matches!(err, StoreError::MissingField(_)), "{err}");

        let requests = requests.await.unwrap();
        assert!(requests[0].starts_with("GET /auction/current.json?auth=s3cret"));
        assert!(requests[0].to_lowercase().contains("x-firebase-etag: true"));
    }

    const AUCTION: &str = "auction/current";

    #[tokio::test]
    async fn conditional_write_maps_precondition_failed_to_conflict() {
        let (base, requests) = stub(vec![
            Reply {
                status: 412,
                headers: &[("ETag", "\"v2\"")],
                body: r#"{"error":"ETag mismatch"}"#,
            },
            reply(200, r#"{"highestBid":12}"#),
        ])
        .await;
        let store = secret_store(base);
        let state = json!({ "highestBid": 12 });

        let stale = store
            .set_if(AUCTION, &state, &Version("\"v1\"".into()))
            .await
            .unwrap();
        assert_eq!(stale, WriteOutcome::Conflict);
        let fresh = store
            .set_if(AUCTION, &state, &Version("\"v2\"".into()))
            .await
            .unwrap();
        assert_eq!(fresh, WriteOutcome::Written);

        let requests = requests.await.unwrap();
        assert!(requests[0].starts_with("PUT /auction/current.json?auth=s3cret"));
        assert!(requests[0].to_lowercase().contains("if-match: \"v1\""));
        assert!(requests[1].to_lowercase().contains("if-match: \"v2\""));
    }

    #[tokio::test]
    async fn server_errors_surface_status() {
        let (base, _) = stub(vec![reply(503, "unavailable")]).await;
        let err = secret_store(base).set(AUCTION, &json!(1)).await.unwrap_err();
        match err {
            StoreError::Http { status, ref body } => {
                assert_eq!(status, 503);
                assert_eq!(body, "unavailable");
            }
            other => panic!("unexpected error {other}"),
        }
    }

    #[tokio::test]
    async fn unauthorized_response_drops_cached_token() {
        let (base, requests) = stub(vec![
            reply(200, r#"{"access_token":"tok-1","expires_in":3600}"#),
            reply(401, r#"{"error":"Permission denied"}"#),
            reply(200, r#"{"access_token":"tok-2","expires_in":3600}"#),
            reply(200, "null"),
            reply(200, "null"),
        ])
        .await;
        let account = ServiceAccount {
            project_id: Some("demo".into()),
            client_email: "bot@demo.iam.gserviceaccount.com".into(),
            private_key: TEST_PRIVATE_KEY.into(),
            token_uri: format!("{base}token"),
        };
        let http = http();
        let tokens = TokenProvider::new(Credential::ServiceAccount(account), http.clone());
        let store = FirebaseStore::new(base, http, tokens);

        let err = store.get("gifts").await.unwrap_err();
        assert!(matches!(err, StoreError::Http { status: 401, .. }), "{err}");
        assert_eq!(store.get("gifts").await.unwrap(), None);
        assert_eq!(store.get("gifts").await.unwrap(), None);

        let requests = requests.await.unwrap();
        assert_eq!(requests.len(), 5);
        assert!(requests[0].starts_with("POST /token"));
        assert!(requests[0].contains("assertion="));
        assert!(requests[1].starts_with("GET /gifts.json?access_token=tok-1"));
        assert!(requests[2].starts_with("POST /token"));
        assert!(requests[3].starts_with("GET /gifts.json?access_token=tok-2"));
        // Still valid, so no further exchange.
        assert!(requests[4].starts_with("GET /gifts.json?access_token=tok-2"));
    }

    #[test]
    fn endpoint_joins_paths() {
        let base = Url::parse("https://demo-default-rtdb.firebaseio.com/").unwrap();
        assert_eq!(
            endpoint(&base, "auction/current").unwrap().as_str(),
            "https://demo-default-rtdb.firebaseio.com/auction/current.json"
        );
        assert_eq!(
            endpoint(&base, "/logs/").unwrap().as_str(),
            "https://demo-default-rtdb.firebaseio.com/logs.json"
        );
    }

    #[test]
    fn endpoint_keeps_base_path_prefix() {
        let base = Url::parse("https://db.example.com/tenant").unwrap();
        assert_eq!(
            endpoint(&base, "gifts").unwrap().as_str(),
            "https://db.example.com/tenant/gifts.json"
        );
    }

    #[test]
    fn null_means_absent() {
        assert_eq!(non_null(Value::Null), None);
        assert_eq!(non_null(serde_json::json!(0)), Some(serde_json::json!(0)));
    }
}
