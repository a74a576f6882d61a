use std::collections::BTreeMap;
use std::sync::Mutex;

use async_trait::async_trait;
use serde_json::Value;

/// Opaque version token of a stored value (an ETag for Firebase).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Version(pub String);

/// A value read together with the version it was read at.
#[derive(Debug, Clone, PartialEq)]
pub struct Versioned {
    pub value: Option<Value>,
    pub version: Version,
}

/// Result of a conditional write.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WriteOutcome {
    Written,
    /// The value changed since it was read; nothing was written.
    Conflict,
}

#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("store request failed: {0}")]
    Transport(#[from] reqwest::Error),

    #[error("store returned HTTP {status}: {body}")]
    Http { status: u16, body: String },

    #[error("store authentication failed: {0}")]
    Auth(String),

    #[error("malformed store payload: {0}")]
    Decode(#[from] serde_json::Error),

    #[error("store response missing {0}")]
    MissingField(&'static str),

    #[error("invalid store path {0:?}")]
    InvalidPath(String),
}

impl StoreError {
    /// Whether retrying the same request later could succeed.
    pub fn is_retryable(&self) -> bool {
        match self {
            StoreError::Transport(_) => true,
            StoreError::Http { status, .. } => *status == 429 || *status >= 500,
            StoreError::Auth(_)
            | StoreError::Decode(_)
            | StoreError::MissingField(_)
            | StoreError::InvalidPath(_) => false,
        }
    }
}

/// Remote key-value / document store with push-generated keys.
///
/// Paths are slash separated and never start with a slash (`logs`,
/// `auction/current`).
#[async_trait]
pub trait Store: Send + Sync {
    /// Append `value` under a freshly generated child key of `path` and
    /// return that key.
    async fn push(&self, path: &str, value: &Value) -> Result<String, StoreError>;

    /// Read the value at `path`, `None` when absent.
    async fn get(&self, path: &str) -> Result<Option<Value>, StoreError>;

    /// Read the value at `path` together with its current version.
    async fn get_versioned(&self, path: &str) -> Result<Versioned, StoreError>;

    /// Overwrite the value at `path`.
    async fn set(&self, path: &str, value: &Value) -> Result<(), StoreError>;

    /// Overwrite the value at `path` only if it is still at `expected`.
    async fn set_if(
        &self,
        path: &str,
        value: &Value,
        expected: &Version,
    ) -> Result<WriteOutcome, StoreError>;
}

#[derive(Default)]
struct MemoryInner {
    values: BTreeMap<String, (Value, u64)>,
    next_push: u64,
    next_version: u64,
}

/// In-process store used by `--dry-run` and tests.
///
/// Push keys are zero-padded counters so that iteration order equals
/// insertion order, like Firebase push ids.
#[derive(Default)]
pub struct MemoryStore {
    inner: Mutex<MemoryInner>,
}

const ABSENT_VERSION: &str = "absent";

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// All children of `path` in insertion order.
    pub fn children(&self, path: &str) -> Vec<(String, Value)> {
        let prefix = format!("{}/", path.trim_matches('/'));
        let inner = self.lock();
        inner
            .values
            .iter()
            .filter_map(|(key, (value, _))| {
                let child = key.strip_prefix(&prefix)?;
                (!child.contains('/')).then(|| (child.to_string(), value.clone()))
            })
            .collect()
    }

    /// Snapshot read without going through the async trait.
    pub fn value(&self, path: &str) -> Option<Value> {
        self.lock()
            .values
            .get(path.trim_matches('/'))
            .map(|(v, _)| v.clone())
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, MemoryInner> {
        // A poisoned lock only means a test panicked mid-write; the map is still usable.
        self.inner.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn write(inner: &mut MemoryInner, path: &str, value: &Value) {
        inner.next_version += 1;
        let version = inner.next_version;
        if value.is_null() {
            inner.values.remove(path);
        } else {
            inner.values.insert(path.to_string(), (value.clone(), version));
        }
    }

    fn version_of(inner: &MemoryInner, path: &str) -> Version {
        match inner.values.get(path) {
            Some((_, v)) => Version(v.to_string()),
            None => Version(ABSENT_VERSION.to_string()),
        }
    }
}

#[async_trait]
impl Store for MemoryStore {
    async fn push(&self, path: &str, value: &Value) -> Result<String, StoreError> {
        let mut inner = self.lock();
        inner.next_push += 1;
        let key = format!("-{:012}", inner.next_push);
        let full = format!("{}/{key}", path.trim_matches('/'));
        Self::write(&mut inner, &full, value);
        Ok(key)
    }

    async fn get(&self, path: &str) -> Result<Option<Value>, StoreError> {
        Ok(self.value(path))
    }

    async fn get_versioned(&self, path: &str) -> Result<Versioned, StoreError> {
        let path = path.trim_matches('/');
        let inner = self.lock();
        Ok(Versioned {
            value: inner.values.get(path).map(|(v, _)| v.clone()),
            version: Self::version_of(&inner, path),
        })
    }

    async fn set(&self, path: &str, value: &Value) -> Result<(), StoreError> {
        let mut inner = self.lock();
        Self::write(&mut inner, path.trim_matches('/'), value);
        Ok(())
    }

    async fn set_if(
        &self,
        path: &str,
        value: &Value,
        expected: &Version,
    ) -> Result<WriteOutcome, StoreError> {
        let path = path.trim_matches('/');
        let mut inner = self.lock();
        if Self::version_of(&inner, path) != *expected {
            return Ok(WriteOutcome::Conflict);
        }
        Self::write(&mut inner, path, value);
        Ok(WriteOutcome::Written)
    }
}
