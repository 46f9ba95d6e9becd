use std::{
    fmt,
    sync::{
        Arc,
        atomic::{AtomicU64, Ordering},
    },
    time::{SystemTime, UNIX_EPOCH},
};

use thiserror::Error;
use uuid::Uuid;

/// Source of wall-clock timestamps in milliseconds since Unix epoch.
pub trait Clock: Send + Sync {
    fn now_ms(&self) -> u64;
}

#[derive(Debug, Default, Clone, Copy)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now_ms(&self) -> u64 {
        SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|elapsed| u64::try_from(elapsed.as_millis()).unwrap_or(u64::MAX))
            .unwrap_or(0)
    }
}

/// Clock that only moves when told to. Clones share the same time.
#[derive(Debug, Default, Clone)]
pub struct ManualClock {
    now_ms: Arc<AtomicU64>,
}

impl ManualClock {
    pub fn new(start_ms: u64) -> Self {
        Self {
            now_ms: Arc::new(AtomicU64::new(start_ms)),
        }
    }

    pub fn set(&self, now_ms: u64) {
        self.now_ms.store(now_ms, Ordering::SeqCst);
    }

    pub fn advance(&self, delta_ms: u64) -> u64 {
        self.now_ms.fetch_add(delta_ms, Ordering::SeqCst) + delta_ms
    }
}

impl Clock for ManualClock {
    fn now_ms(&self) -> u64 {
        self.now_ms.load(Ordering::SeqCst)
    }
}

/// Issues unique request and identity IDs.
pub trait IdGenerator: Send + Sync {
    fn next_id(&self) -> String;
}

#[derive(Debug, Default, Clone, Copy)]
pub struct UuidIdGenerator;

impl IdGenerator for UuidIdGenerator {
    fn next_id(&self) -> String {
        Uuid::new_v4().to_string()
    }
}

/// Deterministic `prefix-N` IDs, numbered from 1.
#[derive(Debug, Clone)]
pub struct SequentialIdGenerator {
    prefix: String,
    next: Arc<AtomicU64>,
}

impl SequentialIdGenerator {
    pub fn new(prefix: impl Into<String>) -> Self {
        Self {
            prefix: prefix.into(),
            next: Arc::new(AtomicU64::new(1)),
        }
    }
}

impl IdGenerator for SequentialIdGenerator {
    fn next_id(&self) -> String {
        let n = self.next.fetch_add(1, Ordering::SeqCst);
        format!("{}-{n}", self.prefix)
    }
}

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum CredentialError {
    #[error("connection credential is empty")]
    Empty,
    #[error("invalid connection string: {0}")]
    InvalidConnectionString(String),
}

/// Opaque service credential. Never printed in full.
#[derive(Clone, PartialEq, Eq)]
pub struct ConnectionCredential {
    secret: String,
    endpoint: Option<String>,
}

impl ConnectionCredential {
    /// Accept either an opaque token or an `endpoint=...;accesskey=...`
    /// connection string. Keys are case-insensitive.
    pub fn parse(raw: &str) -> Result<Self, CredentialError> {
        let secret = raw.trim();
        if secret.is_empty() {
            return Err(CredentialError::Empty);
        }

        if !secret.contains('=') {
            return Ok(Self {
                secret: secret.to_owned(),
                endpoint: None,
            });
        }

        let mut endpoint = None;
        let mut access_key = None;
        for segment in secret.split(';').map(str::trim).filter(|s| !s.is_empty()) {
            let Some((key, value)) = segment.split_once('=') else {
                return Err(CredentialError::InvalidConnectionString(format!(
                    "segment without '=' near '{}'",
                    segment.chars().take(12).collect::<String>()
                )));
            };
            match key.trim().to_ascii_lowercase().as_str() {
                "endpoint" => endpoint = Some(value.trim().trim_end_matches('/').to_owned()),
                "accesskey" => access_key = Some(value.trim()),
                _ => {}
            }
        }

        let endpoint = endpoint
            .filter(|endpoint| !endpoint.is_empty())
            .ok_or_else(|| CredentialError::InvalidConnectionString("missing endpoint".into()))?;
        if access_key.is_none_or(str::is_empty) {
            return Err(CredentialError::InvalidConnectionString(
                "missing accesskey".into(),
            ));
        }

        Ok(Self {
            secret: secret.to_owned(),
            endpoint: Some(endpoint),
        })
    }

    /// Service endpoint, when the credential is a connection string.
    pub fn endpoint(&self) -> Option<&str> {
        self.endpoint.as_deref()
    }

    /// Full credential text for handing to the transport.
    pub fn expose(&self) -> &str {
        &self.secret
    }
}

impl fmt::Debug for ConnectionCredential {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ConnectionCredential")
            .field("endpoint", &self.endpoint)
            .field("secret", &"<redacted>")
            .finish()
    }
}
