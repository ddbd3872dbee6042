//! mopsos-gateway: authenticated read gateway for analytical datasets.
//!
//! Callers present a credential through the `api-key` query parameter or the
//! `x-api-key` header. Two trust tiers are kept apart:
//!
//! - **Per-user keys** gate dataset reads. They are checked against the key
//!   directory (valid while `expiry >= now`) or against a shared secret.
//! - **The privileged secret** gates key lookup by address and the preview.
//!   It authenticates the front-end application, never a user.
//!
//! # Modules
//!
//! - [`credential`]: records, presented credentials, the injected clock
//! - [`directory`]: key directory trait and backends
//! - [`verifier`]: per-user and privileged verification
//! - [`issuance`]: key lookup for an identity
//! - [`tables`] / [`proxy`]: warehouse reads and the dataset catalog
//! - [`server`] / [`auth`]: the axum HTTP surface

pub mod auth;
pub mod cache;
pub mod config;
pub mod credential;
pub mod directory;
pub mod error;
pub mod issuance;
pub mod metrics;
pub mod proxy;
pub mod server;
pub mod tables;
pub mod verifier;

pub use credential::{
    Clock, CredentialChannel, CredentialRecord, FixedClock, PresentedCredential, SystemClock,
    ValidCredential,
};
pub use directory::{KeyDirectory, MemoryDirectory};
pub use error::GatewayError;
pub use issuance::{IssuedKey, KeyIssuer};
pub use proxy::{Dataset, DatasetCatalog, TableProxy};
pub use tables::{CellValue, MemoryTableReader, Row, TableQuery, TableReader};
pub use verifier::{PrivilegedAccess, PrivilegedGate, UserKeyVerifier, VerifyStrategy};
