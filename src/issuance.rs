//! Key lookup for an identity.
//!
//! Callers must already hold [`PrivilegedAccess`]: this tier authenticates the
//! front-end application, not ownership of the identity.

use std::time::{Duration, Instant};

use serde::Serialize;

use crate::credential::SharedClock;
use crate::directory::{select_authoritative, SharedDirectory};
use crate::error::{DirectoryError, GatewayError};
use crate::verifier::{PrivilegedAccess, DEFAULT_LOOKUP_TIMEOUT};

/// Key returned to the front-end for an identity.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct IssuedKey {
    pub api_key: String,
}

/// Looks up the active key for an identity in the key directory.
#[derive(Clone)]
pub struct KeyIssuer {
    directory: SharedDirectory,
    clock: SharedClock,
    lookup_timeout: Duration,
}

impl KeyIssuer {
    pub fn new(directory: SharedDirectory, clock: SharedClock) -> Self {
        Self {
            directory,
            clock,
            lookup_timeout: DEFAULT_LOOKUP_TIMEOUT,
        }
    }

    pub fn with_lookup_timeout(mut self, timeout: Duration) -> Self {
        self.lookup_timeout = timeout;
        self
    }

    /// Return the key issued to `identity`.
    ///
    /// Fails with `BadRequest` for an empty identity, `NotFound` when the
    /// directory has no record, and `Expired` once `now` reaches the expiry.
    /// Unlike request authentication, a key whose expiry equals `now` is
    /// reported as expired here.
    pub async fn find_key_for_identity(
        &self,
        _access: PrivilegedAccess,
        identity: &str,
    ) -> Result<IssuedKey, GatewayError> {
        if identity.is_empty() {
            return Err(GatewayError::BadRequest("address is required".into()));
        }

        let started = Instant::now();
        let lookup = tokio::time::timeout(
            self.lookup_timeout,
            self.directory.find_by_identity(identity),
        )
        .await
        .unwrap_or(Err(DirectoryError::Timeout));
        crate::metrics::record_directory_lookup(
            "by_identity",
            lookup.is_ok(),
            started.elapsed().as_millis() as u64,
        );

        let record = select_authoritative(lookup?).ok_or_else(|| {
            tracing::info!(%identity, "no key for identity");
            GatewayError::NotFound("No API Key found for this address".into())
        })?;

        if record.is_expired_at(self.clock.now_unix()) {
            tracing::info!(%identity, expiry = record.expiry, "key for identity expired");
            return Err(GatewayError::Expired);
        }

        tracing::info!(%identity, "returning key for identity");
        Ok(IssuedKey {
            api_key: record.key,
        })
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use super::*;
    use crate::credential::{CredentialRecord, FixedClock};
    use crate::directory::MemoryDirectory;

    const T: i64 = 1_700_000_000;

    fn access() -> PrivilegedAccess {
        PrivilegedAccess::operator()
    }

    fn issuer(clock: Arc<FixedClock>) -> KeyIssuer {
        let directory = MemoryDirectory::with_records(vec![
            CredentialRecord::new("0xABC", "k1", T),
            CredentialRecord::new("0xMANY", "old", T - 10),
            CredentialRecord::new("0xMANY", "new", T + 10),
        ]);
        KeyIssuer::new(Arc::new(directory), clock)
    }

    #[tokio::test]
    async fn test_active_key_returned() {
        let issuer = issuer(Arc::new(FixedClock::new(T - 1)));
        let key = issuer.find_key_for_identity(access(), "0xABC").await.unwrap();
        assert_eq!(key.api_key, "k1");
    }

    #[tokio::test]
    async fn test_expired_after_expiry() {
        let issuer = issuer(Arc::new(FixedClock::new(T + 1)));
        let result = issuer.find_key_for_identity(access(), "0xABC").await;
        assert!(matches!(result, Err(GatewayError::Expired)));
    }

    #[tokio::test]
    async fn test_expiry_equal_to_now_is_expired() {
        let issuer = issuer(Arc::new(FixedClock::new(T)));
        let result = issuer.find_key_for_identity(access(), "0xABC").await;
        assert!(matches!(result, Err(GatewayError::Expired)));
    }

    #[tokio::test]
    async fn test_unknown_identity_not_found() {
        let issuer = issuer(Arc::new(FixedClock::new(T)));
        let result = issuer.find_key_for_identity(access(), "0xZZZ").await;
        assert!(matches!(result, Err(GatewayError::NotFound(_))));
    }

    #[tokio::test]
    async fn test_empty_identity_bad_request() {
        let issuer = issuer(Arc::new(FixedClock::new(T)));
        let result = issuer.find_key_for_identity(access(), "").await;
        assert!(matches!(result, Err(GatewayError::BadRequest(_))));
    }

    #[tokio::test]
    async fn test_multiple_records_pick_latest() {
        let issuer = issuer(Arc::new(FixedClock::new(T)));
        let key = issuer.find_key_for_identity(access(), "0xMANY").await.unwrap();
        assert_eq!(key.api_key, "new");
    }
}
