//! Credential verification for the two trust tiers.
//!
//! - [`UserKeyVerifier`] authenticates per-user keys, either against the key
//!   directory or against a single shared secret.
//! - [`PrivilegedGate`] authenticates the front-end application secret that
//!   guards key lookup and preview. It never consults the directory.
//!
//! The tiers share no verification code path, so a per-user key can never be
//! accepted where the privileged secret is required, or the reverse.

use std::time::Duration;

use crate::credential::{CredentialChannel, PresentedCredential, SharedClock, ValidCredential};
use crate::directory::{select_authoritative, SharedDirectory};
use crate::error::{DirectoryError, GatewayError};

/// Default bound on a single directory read.
pub const DEFAULT_LOOKUP_TIMEOUT: Duration = Duration::from_secs(5);

/// How per-user keys are checked.
#[derive(Clone)]
pub enum VerifyStrategy {
    /// Look each presented value up as a key; valid while `expiry >= now`.
    Directory {
        directory: SharedDirectory,
        clock: SharedClock,
    },
    /// Compare each presented value against one configured secret.
    SharedSecret(String),
}

impl VerifyStrategy {
    pub fn name(&self) -> &'static str {
        match self {
            VerifyStrategy::Directory { .. } => "directory",
            VerifyStrategy::SharedSecret(_) => "shared_secret",
        }
    }
}

/// Verifier for per-user keys.
#[derive(Clone)]
pub struct UserKeyVerifier {
    strategy: VerifyStrategy,
    lookup_timeout: Duration,
}

impl UserKeyVerifier {
    pub fn new(strategy: VerifyStrategy) -> Self {
        Self {
            strategy,
            lookup_timeout: DEFAULT_LOOKUP_TIMEOUT,
        }
    }

    pub fn with_lookup_timeout(mut self, timeout: Duration) -> Self {
        self.lookup_timeout = timeout;
        self
    }

    pub fn strategy(&self) -> &VerifyStrategy {
        &self.strategy
    }

    /// Verify a presented credential.
    ///
    /// Channels are tried query first, then header, each on its own merits.
    /// Absent channels are skipped without a directory read. Returns the
    /// first channel's value that is valid; otherwise `Unauthorized`.
    pub async fn verify(
        &self,
        presented: &PresentedCredential,
    ) -> Result<ValidCredential, GatewayError> {
        for (channel, value) in presented.channels() {
            if self.check(value).await? {
                tracing::debug!(channel = channel.as_str(), "user key accepted");
                crate::metrics::record_auth("user", "accepted");
                return Ok(ValidCredential::new(value, channel));
            }
        }

        tracing::warn!(
            query_present = presented.query.is_some(),
            header_present = presented.header.is_some(),
            "rejected user key"
        );
        crate::metrics::record_auth("user", "rejected");
        Err(GatewayError::Unauthorized)
    }

    async fn check(&self, value: &str) -> Result<bool, GatewayError> {
        match &self.strategy {
            VerifyStrategy::SharedSecret(secret) => Ok(secrets_match(value, secret)),
            VerifyStrategy::Directory { directory, clock } => {
                let started = std::time::Instant::now();
                let lookup = tokio::time::timeout(self.lookup_timeout, directory.find_by_key(value))
                    .await
                    .unwrap_or(Err(DirectoryError::Timeout));
                crate::metrics::record_directory_lookup(
                    "by_key",
                    lookup.is_ok(),
                    started.elapsed().as_millis() as u64,
                );
                let now = clock.now_unix();
                Ok(select_authoritative(lookup?).is_some_and(|record| record.is_valid_at(now)))
            }
        }
    }
}

/// Proof that the privileged tier was authenticated.
///
/// Only [`PrivilegedGate::authorize`] and local operator tooling can
/// produce one.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PrivilegedAccess {
    channel: Option<CredentialChannel>,
}

impl PrivilegedAccess {
    /// Access for a local operator running the binary directly.
    pub fn operator() -> Self {
        Self { channel: None }
    }

    /// Channel the secret arrived on; `None` for operator access.
    pub fn channel(&self) -> Option<CredentialChannel> {
        self.channel
    }
}

/// Verifier for the privileged application secret.
#[derive(Clone)]
pub struct PrivilegedGate {
    secret: String,
}

impl PrivilegedGate {
    pub fn new(secret: impl Into<String>) -> Self {
        Self {
            secret: secret.into(),
        }
    }

    /// Accept if either channel carries exactly the configured secret.
    ///
    /// An empty configured secret accepts nothing.
    pub fn authorize(
        &self,
        presented: &PresentedCredential,
    ) -> Result<PrivilegedAccess, GatewayError> {
        if !self.secret.is_empty() {
            for (channel, value) in presented.channels() {
                if secrets_match(value, &self.secret) {
                    crate::metrics::record_auth("privileged", "accepted");
                    return Ok(PrivilegedAccess {
                        channel: Some(channel),
                    });
                }
            }
        }
        tracing::warn!("rejected privileged secret");
        crate::metrics::record_auth("privileged", "rejected");
        Err(GatewayError::Unauthorized)
    }
}

/// Exact, case-sensitive comparison that does not short-circuit on the
/// first differing byte.
fn secrets_match(presented: &str, secret: &str) -> bool {
    if presented.len() != secret.len() {
        return false;
    }
    presented
        .as_bytes()
        .iter()
        .zip(secret.as_bytes())
        .fold(0u8, |acc, (x, y)| acc | (x ^ y))
        == 0
}
