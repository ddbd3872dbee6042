//! Credential records, presented credentials and the injected clock.
//!
//! A [`CredentialRecord`] is the stored association between an external
//! identity (a wallet address) and the bearer key issued to it. Records are
//! created and mutated by an external process; the gateway only reads them.

use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::Arc;

use serde::{Deserialize, Serialize};

/// Query parameter carrying a presented credential.
pub const QUERY_PARAM: &str = "api-key";

/// Header carrying a presented credential.
pub const HEADER_NAME: &str = "x-api-key";

/// One issued key as stored in the key directory.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CredentialRecord {
    /// External identifier, e.g. `0xabc...`
    pub identity: String,
    /// Opaque bearer token.
    pub key: String,
    /// Unix timestamp (seconds).
    pub expiry: i64,
}

impl CredentialRecord {
    pub fn new(identity: impl Into<String>, key: impl Into<String>, expiry: i64) -> Self {
        Self {
            identity: identity.into(),
            key: key.into(),
            expiry,
        }
    }

    /// Validity used when authenticating requests: a key whose expiry equals
    /// `now` is still accepted.
    pub fn is_valid_at(&self, now: i64) -> bool {
        self.expiry >= now
    }

    /// Expiry used by key lookup for an identity. The validity window
    /// excludes its end, so a key whose expiry equals `now` is already
    /// expired here while [`is_valid_at`](Self::is_valid_at) still accepts it.
    pub fn is_expired_at(&self, now: i64) -> bool {
        self.expiry <= now
    }
}

/// Transport channel a credential arrived on.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum CredentialChannel {
    Query,
    Header,
}

impl CredentialChannel {
    pub fn as_str(&self) -> &'static str {
        match self {
            CredentialChannel::Query => "query",
            CredentialChannel::Header => "header",
        }
    }
}

/// The raw values a caller supplied on a single request.
///
/// Both channels are optional at the transport level. Empty strings are
/// normalized to `None`.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PresentedCredential {
    pub query: Option<String>,
    pub header: Option<String>,
}

impl PresentedCredential {
    pub fn new(query: Option<String>, header: Option<String>) -> Self {
        Self {
            query: query.filter(|v| !v.is_empty()),
            header: header.filter(|v| !v.is_empty()),
        }
    }

    pub fn from_query(value: impl Into<String>) -> Self {
        Self::new(Some(value.into()), None)
    }

    pub fn from_header(value: impl Into<String>) -> Self {
        Self::new(None, Some(value.into()))
    }

    /// Present channels in precedence order: query first, then header.
    pub fn channels(&self) -> impl Iterator<Item = (CredentialChannel, &str)> {
        let query = self
            .query
            .as_deref()
            .map(|v| (CredentialChannel::Query, v));
        let header = self
            .header
            .as_deref()
            .map(|v| (CredentialChannel::Header, v));
        query.into_iter().chain(header)
    }

    pub fn is_empty(&self) -> bool {
        self.query.is_none() && self.header.is_none()
    }
}

/// A presented credential that passed verification.
///
/// Holds the caller's own value, echoed back from whichever channel matched.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ValidCredential {
    value: String,
    channel: CredentialChannel,
}

impl ValidCredential {
    pub(crate) fn new(value: &str, channel: CredentialChannel) -> Self {
        Self {
            value: value.to_string(),
            channel,
        }
    }

    pub fn value(&self) -> &str {
        &self.value
    }

    pub fn channel(&self) -> CredentialChannel {
        self.channel
    }
}

/// Source of the current instant, in Unix seconds.
pub trait Clock: Send + Sync {
    fn now_unix(&self) -> i64;
}

/// Shared clock handle.
pub type SharedClock = Arc<dyn Clock>;

/// Wall clock in UTC.
#[derive(Debug, Default, Clone, Copy)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now_unix(&self) -> i64 {
        chrono::Utc::now().timestamp()
    }
}

/// Manually driven clock for tests and offline tooling.
#[derive(Debug, Default)]
pub struct FixedClock {
    now: AtomicI64,
}

impl FixedClock {
    pub fn new(now: i64) -> Self {
        Self {
            now: AtomicI64::new(now),
        }
    }

    pub fn set(&self, now: i64) {
        self.now.store(now, Ordering::SeqCst);
    }
}

impl Clock for FixedClock {
    fn now_unix(&self) -> i64 {
        self.now.load(Ordering::SeqCst)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_validity_boundaries_differ() {
        let record = CredentialRecord::new("0xabc", "k1", 1_000);
        // Inclusive for request authentication
        assert!(record.is_valid_at(1_000));
        assert!(!record.is_valid_at(1_001));
        // Exclusive for identity lookup
        assert!(!record.is_expired_at(999));
        assert!(record.is_expired_at(1_000));
        assert!(record.is_expired_at(1_001));
        // The two checks disagree only at the boundary instant
        assert_eq!(record.is_valid_at(1_000), record.is_expired_at(1_000));
    }

    #[test]
    fn test_presented_credential_normalizes_empty() {
        let presented = PresentedCredential::new(Some(String::new()), Some("h".into()));
        assert_eq!(presented.query, None);
        assert_eq!(presented.header.as_deref(), Some("h"));
        assert!(PresentedCredential::new(Some(String::new()), None).is_empty());
    }

    #[test]
    fn test_channels_query_first() {
        let presented = PresentedCredential::new(Some("q".into()), Some("h".into()));
        let channels: Vec<_> = presented.channels().collect();
        assert_eq!(
            channels,
            vec![
                (CredentialChannel::Query, "q"),
                (CredentialChannel::Header, "h")
            ]
        );
    }

    #[test]
    fn test_fixed_clock() {
        let clock = FixedClock::new(10);
        assert_eq!(clock.now_unix(), 10);
        clock.set(42);
        assert_eq!(clock.now_unix(), 42);
    }
}
