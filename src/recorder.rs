use std::sync::Arc;

use serde::Serialize;
use serde_json::Value;
use tracing::{error, warn};

use crate::store::{Store, StoreError};
use crate::types::{GiftEvent, GiftRecord, LogEntry, LogKind};

pub const LOGS_PATH: &str = "logs";

/// Result of one event handler, so callers can pick a retry or escalation
/// policy instead of only logging.
#[derive(Debug, Clone, PartialEq)]
pub enum HandlerOutcome {
    Done,
    /// Transient failure (network, 5xx, rate limit); the same write may succeed later.
    Retryable(String),
    /// Failure that will not go away by retrying (auth, malformed data).
    Fatal(String),
}

impl HandlerOutcome {
    pub fn is_done(&self) -> bool {
        matches!(self, HandlerOutcome::Done)
    }

    /// Log a failed outcome under `what`; returns `self` for chaining.
    pub fn report(self, what: &str) -> Self {
        match &self {
            HandlerOutcome::Done => {}
            HandlerOutcome::Retryable(msg) => warn!("{what} failed (transient): {msg}"),
            HandlerOutcome::Fatal(msg) => error!("{what} failed: {msg}"),
        }
        self
    }
}

impl From<StoreError> for HandlerOutcome {
    fn from(err: StoreError) -> Self {
        if err.is_retryable() {
            HandlerOutcome::Retryable(err.to_string())
        } else {
            HandlerOutcome::Fatal(err.to_string())
        }
    }
}

impl<E: Into<HandlerOutcome>> From<Result<(), E>> for HandlerOutcome {
    fn from(result: Result<(), E>) -> Self {
        match result {
            Ok(()) => HandlerOutcome::Done,
            Err(e) => e.into(),
        }
    }
}

/// Current wall-clock time in epoch milliseconds.
pub fn now_millis() -> i64 {
    chrono::Utc::now().timestamp_millis()
}

/// Appends log entries and gift records. One append per call, never retried.
#[derive(Clone)]
pub struct EventRecorder {
    store: Arc<dyn Store>,
    gift_path: String,
}

impl EventRecorder {
    pub fn new(store: Arc<dyn Store>, gift_path: impl Into<String>) -> Self {
        Self {
            store,
            gift_path: gift_path.into(),
        }
    }

    pub fn store(&self) -> &Arc<dyn Store> {
        &self.store
    }

    /// Append a `logs/<id>` entry. Failures are reported and returned, not retried.
    pub async fn log(&self, kind: LogKind, data: impl Serialize) -> HandlerOutcome {
        let outcome: HandlerOutcome = self.try_log(kind, data).await.into();
        outcome.report(&format!("writing {} log entry", kind.as_str()))
    }

    async fn try_log(&self, kind: LogKind, data: impl Serialize) -> Result<(), StoreError> {
        let entry = LogEntry {
            kind,
            data: serde_json::to_value(data)?,
            time: now_millis(),
        };
        self.store.push(LOGS_PATH, &serde_json::to_value(&entry)?).await?;
        Ok(())
    }

    /// Append a gift record under the configured gift path.
    pub async fn record_gift(&self, gift: &GiftEvent) -> HandlerOutcome {
        let outcome: HandlerOutcome = self.try_record_gift(gift).await.into();
        outcome.report("saving gift record")
    }

    async fn try_record_gift(&self, gift: &GiftEvent) -> Result<(), StoreError> {
        let record: Value = serde_json::to_value(GiftRecord::from_event(gift, now_millis()))?;
        self.store.push(&self.gift_path, &record).await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::MemoryStore;
    use crate::store::{Version, Versioned, WriteOutcome};
    use async_trait::async_trait;
    use serde_json::json;

    /// Store whose every call fails with the given HTTP status.
    struct FailingStore(u16);

    #[async_trait]
    impl Store for FailingStore {
        async fn push(&self, _: &str, _: &Value) -> Result<String, StoreError> {
            Err(self.err())
        }
        async fn get(&self, _: &str) -> Result<Option<Value>, StoreError> {
            Err(self.err())
        }
        async fn get_versioned(&self, _: &str) -> Result<Versioned, StoreError> {
            Err(self.err())
        }
        async fn set(&self, _: &str, _: &Value) -> Result<(), StoreError> {
            Err(self.err())
        }
        async fn set_if(
            &self,
            _: &str,
            _: &Value,
            _: &Version,
        ) -> Result<WriteOutcome, StoreError> {
            Err(self.err())
        }
    }

    impl FailingStore {
        fn err(&self) -> StoreError {
            StoreError::Http {
                status: self.0,
                body: "boom".into(),
            }
        }
    }

    #[tokio::test]
    async fn log_appends_typed_entry() {
        let store = Arc::new(MemoryStore::new());
        let recorder = EventRecorder::new(store.clone(), "gifts");

        let outcome = recorder.log(LogKind::Chat, json!({ "uniqueId": "carol" })).await;
        assert!(outcome.is_done());

        let logs = store.children(LOGS_PATH);
        assert_eq!(logs.len(), 1);
        assert_eq!(logs[0].1["type"], "CHAT");
        assert_eq!(logs[0].1["data"]["uniqueId"], "carol");
        assert!(logs[0].1["time"].as_i64().unwrap() > 0);
    }

    #[tokio::test]
    async fn gift_record_goes_to_configured_path() {
        let store = Arc::new(MemoryStore::new());
        let recorder = EventRecorder::new(store.clone(), "donations");
        let gift = GiftEvent {
            unique_id: Some("dave".into()),
            gift_name: Some("Galaxy".into()),
            repeat_count: Some(3),
            diamond_count: Some(1000),
            ..Default::default()
        };

        assert!(recorder.record_gift(&gift).await.is_done());
        assert!(store.children("gifts").is_empty());
        let donations = store.children("donations");
        assert_eq!(donations.len(), 1);
        assert_eq!(donations[0].1["totalDiamond"], 3000);
    }

    #[tokio::test]
    async fn store_failures_are_classified_not_raised() {
        let recorder = EventRecorder::new(Arc::new(FailingStore(503)), "gifts");
        let outcome = recorder.log(LogKind::MemberJoin, json!({})).await;
        assert!(matches!(outcome, HandlerOutcome::Retryable(_)));

        let recorder = EventRecorder::new(Arc::new(FailingStore(401)), "gifts");
        let outcome = recorder.record_gift(&GiftEvent::default()).await;
        assert!(matches!(outcome, HandlerOutcome::Fatal(_)));
    }
}
