//! Credential extraction and authentication middleware.
//!
//! Credentials are accepted from the `api-key` query parameter and the
//! `x-api-key` header. Per-user routes go through [`require_user_key`];
//! privileged routes through [`require_privileged_secret`].

use std::sync::Arc;

use axum::extract::{Query, Request, State};
use axum::http::{HeaderMap, Uri};
use axum::middleware::Next;
use axum::response::Response;
use serde::Deserialize;

use crate::credential::{PresentedCredential, HEADER_NAME};
use crate::error::GatewayError;
use crate::server::ServerState;

#[derive(Debug, Default, Deserialize)]
struct CredentialParams {
    #[serde(rename = "api-key")]
    api_key: Option<String>,
}

/// Collect the credential presented on a request.
///
/// A malformed query string or a non-UTF-8 header counts as absent.
pub fn presented_credential(uri: &Uri, headers: &HeaderMap) -> PresentedCredential {
    let query = Query::<CredentialParams>::try_from_uri(uri)
        .map(|Query(params)| params)
        .unwrap_or_default()
        .api_key;
    let header = headers
        .get(HEADER_NAME)
        .and_then(|v| v.to_str().ok())
        .map(str::to_string);
    PresentedCredential::new(query, header)
}

/// Axum middleware that requires a valid per-user key.
///
/// On success the [`ValidCredential`](crate::credential::ValidCredential) is
/// stored in the request extensions for the handler.
pub async fn require_user_key(
    State(state): State<Arc<ServerState>>,
    mut request: Request,
    next: Next,
) -> Result<Response, GatewayError> {
    let presented = presented_credential(request.uri(), request.headers());
    let valid = state.user_keys.verify(&presented).await?;
    request.extensions_mut().insert(valid);
    Ok(next.run(request).await)
}

/// Axum middleware that requires the privileged application secret.
pub async fn require_privileged_secret(
    State(state): State<Arc<ServerState>>,
    mut request: Request,
    next: Next,
) -> Result<Response, GatewayError> {
    let presented = presented_credential(request.uri(), request.headers());
    let access = state.privileged.authorize(&presented)?;
    request.extensions_mut().insert(access);
    Ok(next.run(request).await)
}

#[cfg(test)]
mod tests {
    use axum::http::HeaderValue;

    use super::*;

    #[test]
    fn test_presented_from_query_and_header() {
        let uri: Uri = "/numerai?api-key=abc&other=1".parse().unwrap();
        let mut headers = HeaderMap::new();
        headers.insert(HEADER_NAME, HeaderValue::from_static("def"));
        let presented = presented_credential(&uri, &headers);
        assert_eq!(presented.query.as_deref(), Some("abc"));
        assert_eq!(presented.header.as_deref(), Some("def"));
    }

    #[test]
    fn test_presented_absent() {
        let uri: Uri = "/numerai".parse().unwrap();
        let presented = presented_credential(&uri, &HeaderMap::new());
        assert!(presented.is_empty());
    }

    #[test]
    fn test_presented_query_is_percent_decoded() {
        let uri: Uri = "/numerai?api-key=a%2Bb%20c".parse().unwrap();
        let presented = presented_credential(&uri, &HeaderMap::new());
        assert_eq!(presented.query.as_deref(), Some("a+b c"));
    }

    #[test]
    fn test_underscore_param_is_not_accepted() {
        let uri: Uri = "/numerai?api_key=abc".parse().unwrap();
        assert!(presented_credential(&uri, &HeaderMap::new()).is_empty());
    }
}
