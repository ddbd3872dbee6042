//! HTTP server for the mopsos gateway.
//!
//! Serves dataset reads behind per-user keys, and key lookup plus preview
//! behind the privileged application secret.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::{Duration, Instant};

use axum::body::Bytes;
use axum::extract::{MatchedPath, Query, State};
use axum::http::{HeaderMap, Uri};
use axum::{Extension, Json};
use eyre::{bail, Result, WrapErr};
use serde::{Deserialize, Serialize};
use tower_http::cors::{Any, CorsLayer};

use crate::auth::presented_credential;
use crate::cache::TableCache;
use crate::config::{Config, UserAuthMode};
use crate::credential::{SharedClock, SystemClock, ValidCredential};
use crate::directory::{
    DocumentFields, FirestoreDirectory, MemoryDirectory, SharedDirectory, DEFAULT_FIRESTORE_URL,
};
use crate::error::GatewayError;
use crate::issuance::{IssuedKey, KeyIssuer};
use crate::proxy::{DatasetCatalog, TableProxy};
use crate::tables::{BigQueryReader, Row, TableReader, DEFAULT_BIGQUERY_URL};
use crate::verifier::{PrivilegedAccess, PrivilegedGate, UserKeyVerifier, VerifyStrategy};

/// Server configuration
#[derive(Debug, Clone)]
pub struct ServerConfig {
    /// Address to bind to
    pub bind_addr: SocketAddr,
    /// Allowed CORS origins (None/empty = allow any)
    pub allowed_origins: Option<Vec<String>>,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind_addr: SocketAddr::from(([127, 0, 0, 1], 8000)),
            allowed_origins: None,
        }
    }
}

/// Health check response
#[derive(Debug, Serialize)]
pub struct HealthResponse {
    pub status: String,
    pub version: String,
    pub uptime_seconds: u64,
    pub user_auth: String,
    pub datasets: usize,
    pub directory_connected: bool,
}

/// Body accepted by `POST /api_key`.
#[derive(Debug, Default, Deserialize)]
struct AddressParams {
    address: Option<String>,
}

/// Server state shared by every request. Read-only after construction.
pub struct ServerState {
    pub user_keys: UserKeyVerifier,
    pub privileged: PrivilegedGate,
    pub issuer: KeyIssuer,
    pub proxy: TableProxy,
    pub directory: SharedDirectory,
    pub start_time: Instant,
}

impl ServerState {
    pub fn new(
        user_keys: UserKeyVerifier,
        privileged: PrivilegedGate,
        issuer: KeyIssuer,
        proxy: TableProxy,
        directory: SharedDirectory,
    ) -> Self {
        Self {
            user_keys,
            privileged,
            issuer,
            proxy,
            directory,
            start_time: Instant::now(),
        }
    }

    /// Wire up verifiers, directory and warehouse from configuration.
    pub fn from_config(cfg: &Config) -> Result<Self> {
        let clock: SharedClock = Arc::new(SystemClock);
        let directory = directory_from_config(cfg)?;
        let lookup_timeout = Duration::from_millis(cfg.lookup_timeout_ms.unwrap_or(5_000));

        let strategy = match cfg.user_auth.unwrap_or_default() {
            UserAuthMode::Directory => VerifyStrategy::Directory {
                directory: directory.clone(),
                clock: clock.clone(),
            },
            UserAuthMode::SharedSecret => match cfg.user_secret.as_deref() {
                Some(secret) if !secret.is_empty() => VerifyStrategy::SharedSecret(secret.to_string()),
                _ => bail!("user_auth = \"shared_secret\" requires user_secret"),
            },
        };
        let user_keys = UserKeyVerifier::new(strategy).with_lookup_timeout(lookup_timeout);

        let privileged_secret = cfg.privileged_secret.clone().unwrap_or_default();
        if privileged_secret.is_empty() {
            tracing::warn!("no privileged secret configured, /api_key and /preview will reject all requests");
        }
        let privileged = PrivilegedGate::new(privileged_secret);

        let issuer =
            KeyIssuer::new(directory.clone(), clock.clone()).with_lookup_timeout(lookup_timeout);

        let catalog = match cfg.datasets.clone() {
            Some(datasets) => DatasetCatalog::new(datasets)?,
            None => DatasetCatalog::default(),
        };
        let reader = reader_from_config(cfg, &catalog)?;
        let mut proxy = TableProxy::new(reader, catalog, clock)
            .with_read_timeout(Duration::from_millis(cfg.read_timeout_ms.unwrap_or(60_000)))
            .with_preview_days_ago(cfg.preview_days_ago.unwrap_or(1));
        let ttl = cfg.cache_ttl_seconds.unwrap_or(60);
        if ttl > 0 {
            proxy = proxy.with_cache(TableCache::new(ttl, cfg.cache_max_entries.unwrap_or(100)));
        }

        Ok(Self::new(user_keys, privileged, issuer, proxy, directory))
    }
}

/// Build the key directory named by the configuration.
pub fn directory_from_config(cfg: &Config) -> Result<SharedDirectory> {
    let dir_cfg = cfg.directory.clone().unwrap_or_default();

    if let Some(ref path) = dir_cfg.file {
        return Ok(Arc::new(MemoryDirectory::load(path)?));
    }

    let Some(project) = dir_cfg.project.as_deref() else {
        bail!("no key directory configured: set directory.file or directory.project");
    };
    let defaults = DocumentFields::default();
    let fields = DocumentFields {
        identity: dir_cfg.identity_field.clone().unwrap_or(defaults.identity),
        key: dir_cfg.key_field.clone().unwrap_or(defaults.key),
        expiry: dir_cfg.expiry_field.clone().unwrap_or(defaults.expiry),
    };
    let directory = FirestoreDirectory::new(
        dir_cfg.base_url.as_deref().unwrap_or(DEFAULT_FIRESTORE_URL),
        project,
        dir_cfg.database.as_deref().unwrap_or("(default)"),
        dir_cfg.collection.as_deref().unwrap_or("collection api"),
    )
    .with_fields(fields)
    .with_access_token(cfg.access_token.clone());
    tracing::info!(%project, "using Firestore key directory");
    Ok(Arc::new(directory))
}

/// Build the warehouse reader. The query project defaults to the project
/// of the first dataset's table id.
pub fn reader_from_config(cfg: &Config, catalog: &DatasetCatalog) -> Result<Arc<dyn TableReader>> {
    let wh = cfg.warehouse.clone().unwrap_or_default();
    let project = match wh.project {
        Some(p) => p,
        None => catalog
            .iter()
            .next()
            .and_then(|ds| ds.table.split('.').next())
            .map(str::to_string)
            .ok_or_else(|| eyre::eyre!("no warehouse project configured"))?,
    };
    let reader = BigQueryReader::new(
        wh.base_url.as_deref().unwrap_or(DEFAULT_BIGQUERY_URL),
        &project,
    )
    .with_access_token(cfg.access_token.clone());
    Ok(Arc::new(reader))
}

/// Build the CORS layer.
pub fn cors_layer(allowed_origins: Option<&[String]>) -> CorsLayer {
    let methods = [axum::http::Method::GET, axum::http::Method::POST];
    match allowed_origins {
        Some(origins) if !origins.is_empty() => {
            let allowed: Vec<axum::http::HeaderValue> =
                origins.iter().filter_map(|o| o.parse().ok()).collect();
            CorsLayer::new()
                .allow_origin(allowed)
                .allow_methods(methods)
                .allow_headers([
                    axum::http::header::CONTENT_TYPE,
                    axum::http::HeaderName::from_static(crate::credential::HEADER_NAME),
                ])
        }
        _ => CorsLayer::new()
            .allow_origin(Any)
            .allow_methods(methods)
            .allow_headers(Any),
    }
}

/// Assemble all routes over the given state.
pub fn build_router(state: Arc<ServerState>) -> axum::Router {
    use axum::{
        middleware,
        routing::{get, post},
        Router,
    };

    // Per-user key routes, one per dataset
    let mut datasets = Router::new();
    for ds in state.proxy.catalog().iter() {
        datasets = datasets.route(&format!("/{}", ds.name), get(dataset_handler));
    }
    if !state.proxy.catalog().is_empty() {
        datasets = datasets.route_layer(middleware::from_fn_with_state(
            state.clone(),
            crate::auth::require_user_key,
        ));
    }
    let datasets = datasets.with_state(state.clone());

    // Privileged routes. /api_key checks the secret itself so that a
    // missing address is reported before authentication.
    let privileged = Router::new()
        .route("/preview", get(preview_handler))
        .route_layer(middleware::from_fn_with_state(
            state.clone(),
            crate::auth::require_privileged_secret,
        ))
        .route("/api_key", post(api_key_handler))
        .with_state(state.clone());

    // Open routes
    let open = Router::new()
        .route("/", get(index_handler))
        .route("/health", get(health_handler))
        .with_state(state);

    Router::new().merge(open).merge(datasets).merge(privileged)
}

/// Run the HTTP server
pub async fn run_server(config: ServerConfig, state: ServerState) -> Result<()> {
    use axum::routing::get;

    let prometheus_handle = crate::metrics::install_prometheus_recorder()?;
    let state = Arc::new(state);
    let datasets: Vec<String> = state
        .proxy
        .catalog()
        .iter()
        .map(|ds| format!("/{}", ds.name))
        .collect();
    let user_auth = state.user_keys.strategy().name();

    let app = build_router(state)
        .route(
            "/metrics",
            get(move || {
                let handle = prometheus_handle.clone();
                async move { handle.render() }
            }),
        )
        .layer(cors_layer(config.allowed_origins.as_deref()));

    let listener = tokio::net::TcpListener::bind(config.bind_addr)
        .await
        .wrap_err_with(|| format!("Failed to bind {}", config.bind_addr))?;
    tracing::info!("mopsos-gateway listening on {}", config.bind_addr);
    tracing::info!("Endpoints: GET /, GET /health, GET /metrics, GET /preview, POST /api_key");
    tracing::info!(datasets = %datasets.join(", "), user_auth, "dataset routes enabled");

    axum::serve(listener, app).await?;
    Ok(())
}

/// Liveness marker
async fn index_handler() -> Json<[&'static str; 1]> {
    Json(["/"])
}

/// Health check handler
async fn health_handler(State(state): State<Arc<ServerState>>) -> Json<HealthResponse> {
    // Probe the directory with a 3s timeout
    let directory_connected = tokio::time::timeout(
        Duration::from_secs(3),
        state.directory.find_by_key(""),
    )
    .await
    .map(|r| r.is_ok())
    .unwrap_or(false);

    let status = if directory_connected { "ok" } else { "degraded" };

    Json(HealthResponse {
        status: status.to_string(),
        version: env!("CARGO_PKG_VERSION").to_string(),
        uptime_seconds: state.start_time.elapsed().as_secs(),
        user_auth: state.user_keys.strategy().name().to_string(),
        datasets: state.proxy.catalog().len(),
        directory_connected,
    })
}

/// Dataset handler: every row of the dataset bound to this path.
async fn dataset_handler(
    State(state): State<Arc<ServerState>>,
    path: MatchedPath,
    Extension(key): Extension<ValidCredential>,
) -> Result<Json<Arc<Vec<Row>>>, GatewayError> {
    let name = path.as_str().trim_start_matches('/');
    tracing::info!(dataset = %name, channel = key.channel().as_str(), "reading dataset");
    let rows = state.proxy.dataset_rows(&key, name).await?;
    Ok(Json(rows))
}

/// Preview handler: social handles across all datasets for the preview date.
async fn preview_handler(
    State(state): State<Arc<ServerState>>,
    Extension(access): Extension<PrivilegedAccess>,
) -> Result<Json<Vec<Row>>, GatewayError> {
    let rows = state.proxy.preview_rows(access).await?;
    Ok(Json(rows))
}

/// Key lookup handler. `address` comes from the query string or a JSON body.
async fn api_key_handler(
    State(state): State<Arc<ServerState>>,
    uri: Uri,
    headers: HeaderMap,
    body: Bytes,
) -> Result<Json<IssuedKey>, GatewayError> {
    let address = request_address(&uri, &body)?;
    if address.is_empty() {
        return Err(GatewayError::BadRequest("address is required".into()));
    }

    let access = state.privileged.authorize(&presented_credential(&uri, &headers))?;
    let key = state.issuer.find_key_for_identity(access, &address).await?;
    Ok(Json(key))
}

/// Query string takes precedence over the body.
fn request_address(uri: &Uri, body: &Bytes) -> Result<String, GatewayError> {
    let from_query = Query::<AddressParams>::try_from_uri(uri)
        .map(|Query(p)| p)
        .unwrap_or_default()
        .address
        .filter(|a| !a.is_empty());
    if let Some(address) = from_query {
        return Ok(address);
    }
    if body.iter().all(u8::is_ascii_whitespace) {
        return Ok(String::new());
    }
    let params: AddressParams = serde_json::from_slice(body)
        .map_err(|_| GatewayError::BadRequest("request body must be JSON".into()))?;
    Ok(params.address.unwrap_or_default())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_health_response_serialization() {
        let response = HealthResponse {
            status: "ok".to_string(),
            version: "0.1.0".to_string(),
            uptime_seconds: 100,
            user_auth: "directory".to_string(),
            datasets: 5,
            directory_connected: true,
        };

        let json = serde_json::to_string(&response).unwrap();
        assert!(json.contains("\"status\":\"ok\""));
        assert!(json.contains("\"datasets\":5"));
        assert!(json.contains("\"directory_connected\":true"));
    }

    #[test]
    fn test_request_address_sources() {
        let uri: Uri = "/api_key?address=0xABC".parse().unwrap();
        let body = Bytes::from_static(br#"{"address":"0xDEF"}"#);
        assert_eq!(request_address(&uri, &body).unwrap(), "0xABC");

        let uri: Uri = "/api_key".parse().unwrap();
        assert_eq!(request_address(&uri, &body).unwrap(), "0xDEF");
        assert_eq!(request_address(&uri, &Bytes::new()).unwrap(), "");
        assert_eq!(
            request_address(&uri, &Bytes::from_static(b"{}")).unwrap(),
            ""
        );
        assert!(request_address(&uri, &Bytes::from_static(b"address=0x1")).is_err());
    }

    #[test]
    fn test_directory_from_config_requires_source() {
        let cfg = Config::default();
        assert!(directory_from_config(&cfg).is_err());
    }

    #[test]
    fn test_reader_project_defaults_to_first_table() {
        let cfg = Config::default();
        assert!(reader_from_config(&cfg, &DatasetCatalog::default()).is_ok());
        let empty = DatasetCatalog::new(Vec::new()).unwrap();
        assert!(reader_from_config(&cfg, &empty).is_err());
    }
}
