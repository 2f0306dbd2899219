use std::{net::SocketAddr, sync::Arc, time::Duration};

use anyhow::{anyhow, Context};
use axum::{
    body::Bytes,
    extract::{Query, State},
    http::{header, HeaderMap, HeaderValue, Method, StatusCode},
    middleware::{self, Next},
    response::{IntoResponse, Response},
    routing::get,
    Json,
};
use serde_json::Value;
use teloxide::types::Update;
use tower_http::cors::CorsLayer;
use utoipa::OpenApi;
use utoipa_swagger_ui::SwaggerUi;

use crate::{
    auth,
    bot::Telegram,
    conf::{self, Conf},
    data::{JsonFileStore, Ledger},
    dispatch::{Dispatcher, LookupError},
    docs::ApiDoc,
    lookup::Endpoints,
    sanitize::{attribute, sanitize},
    types::{ErrorBody, LookupQuery, UpiQuery},
    upi::{UpiEndpoint, UpiError},
};


pub const WEBHOOK_SECRET_HEADER: &str = "x-telegram-bot-api-secret-token";

#[derive(Debug)]
pub struct ApiError(StatusCode, Json<ErrorBody>);

impl ApiError {
    fn new(status: StatusCode, error: impl Into<String>, api_by: &str) -> Self {
        ApiError(
            status,
            Json(ErrorBody {
                error: error.into(),
                api_by: api_by.to_string(),
            }),
        )
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let ApiError(status, body) = self;
        (status, body).into_response()
    }
}

#[derive(Clone)]
pub struct AppState {
    pub conf: Arc<Conf>,
    pub dispatcher: Arc<Dispatcher>,
    pub telegram: Option<Arc<Telegram>>,
}

impl AppState {
    /// Opens the ledger and, when a bot token is configured, resolves the
    /// bot's identity.
    pub async fn from_conf(conf: Arc<Conf>) -> anyhow::Result<Self> {
        let endpoints = Endpoints::new(&conf.upstreams)?;
        let timeout = (conf.upstream_timeout > 0.0)
            .then(|| Duration::from_secs_f32(conf.upstream_timeout));
        let upi = UpiEndpoint::from_conf(&conf.upi)?;
        if upi.is_none() {
            tracing::warn!("No UPI auth token configured. UPI lookup disabled.");
        }
        let dispatcher = Arc::new(
            Dispatcher::new(endpoints, timeout)
                .context("Failed to build upstream HTTP client")?
                .with_upi(upi),
        );
        let telegram = if conf.telegram.is_enabled() {
            let store = JsonFileStore::open(&conf.data_file)
                .context("Failed to open ledger")?;
            let ledger = Arc::new(Ledger::new(store, conf.daily_limit));
            let telegram = Telegram::new(
                conf.telegram.clone(),
                dispatcher.clone(),
                ledger,
                conf.attribution.clone(),
            )?
            .resolve_username()
            .await;
            Some(Arc::new(telegram))
        } else {
            tracing::warn!("No bot token configured. Telegram webhook disabled.");
            None
        };
        Ok(Self {
            conf,
            dispatcher,
            telegram,
        })
    }
}

#[tracing::instrument(name = "server", skip_all)]
pub async fn run() -> anyhow::Result<()> {
    let conf = conf::global();
    let dir = std::env::current_dir()?;
    tracing::info!(?dir, ?conf, "Starting.");
    let addr = SocketAddr::from((conf.addr, conf.port));
    let state = AppState::from_conf(conf.clone()).await?;
    let service =
        router(state).into_make_service_with_connect_info::<SocketAddr>();

    match &conf.tls {
        None => {
            let listener = tokio::net::TcpListener::bind(addr).await?;
            tracing::warn!(?addr, "Listening unencrypted.");
            axum::serve(listener, service).await?;
        }
        Some(conf::Tls {
            cert_file,
            key_file,
        }) => {
            // XXX One MUST do this manual init of rustls provider when using
            //     more than a single dep which itself depends on rustls.
            //     Here we using 3:
            //     - axum_server
            //     - reqwest
            //     - teloxide
            rustls::crypto::aws_lc_rs::default_provider()
                .install_default()
                .map_err(|crypto_provider| {
                    anyhow!(
                        "Failed to install default crypto provider: \
                        {crypto_provider:?}"
                    )
                })?;

            let config =
                axum_server::tls_rustls::RustlsConfig::from_pem_file(
                    cert_file, key_file,
                )
                .await
                .context(format!(
                    "Failed to construct RustlsConfig. \
                    cert_file={cert_file:?}, key_file={key_file:?}"
                ))?;

            tracing::info!(
                ?addr,
                ?cert_file,
                ?key_file,
                "Listening with TLS."
            );
            axum_server::bind_rustls(addr, config)
                .serve(service)
                .await?;
        }
    }

    Ok(())
}

pub fn router(state: AppState) -> axum::Router {
    let cors = cors_layer(&state.conf);
    axum::Router::new()
        .route("/", get(handle_alive).post(handle_webhook))
        .route("/api", get(handle_lookup))
        .route("/api/upi", get(handle_upi))
        .route("/health", get(health_check))
        .merge(
            SwaggerUi::new("/swagger-ui")
                .url("/api-docs/openapi.json", ApiDoc::openapi()),
        )
        .layer(cors)
        .route_layer(middleware::from_fn({
            |req, next: Next| REQ_ID.scope(ReqId::new(), next.run(req))
        }))
        .with_state(state)
}

fn cors_layer(conf: &Conf) -> CorsLayer {
    let origins: Vec<HeaderValue> = conf
        .cors_origins
        .iter()
        .filter_map(|origin| {
            origin
                .parse::<HeaderValue>()
                .inspect_err(|error| {
                    tracing::warn!(?error, origin, "Ignoring bad CORS origin.");
                })
                .ok()
        })
        .collect();
    CorsLayer::new()
        .allow_origin(origins)
        .allow_methods([Method::GET, Method::OPTIONS])
        .allow_headers([
            header::CONTENT_TYPE,
            header::ACCEPT,
            header::ORIGIN,
            header::HeaderName::from_static(auth::API_KEY_HEADER),
        ])
        .expose_headers([header::CONTENT_TYPE, header::CONTENT_LENGTH])
}

#[tracing::instrument(skip_all, fields(req_id = req_id(), kind = ?query.kind))]
#[utoipa::path(
    get,
    path = "/api",
    params(LookupQuery),
    responses(
        (status = 200, description = "Sanitized upstream payload with `api_by` appended", content_type = "application/json"),
        (status = 400, description = "Missing type or term, or invalid type", body = ErrorBody),
        (status = 401, description = "Invalid API key", body = ErrorBody),
        (status = 500, description = "Upstream lookup failed", body = ErrorBody),
    ),
    security(
        ("api_key" = [])
    )
)]
pub async fn handle_lookup(
    State(state): State<AppState>,
    headers: HeaderMap,
    Query(query): Query<LookupQuery>,
) -> Result<Json<Value>, ApiError> {
    let api_by = state.conf.attribution.as_str();
    let presented = auth::presented_key(&headers, query.key.as_deref());
    if !auth::is_authorized(presented, &state.conf.api_key) {
        tracing::warn!(key_present = presented.is_some(), "Rejected API key.");
        return Err(ApiError::new(
            StatusCode::UNAUTHORIZED,
            "Invalid API Key",
            api_by,
        ));
    }

    let non_empty = |s: &Option<String>| s.clone().filter(|s| !s.is_empty());
    let (Some(kind), Some(term)) = (non_empty(&query.kind), non_empty(&query.term))
    else {
        return Err(ApiError::new(
            StatusCode::BAD_REQUEST,
            "Missing type or term",
            api_by,
        ));
    };

    match state.dispatcher.lookup(&kind, &term).await {
        Ok(value) => {
            tracing::info!("Lookup answered.");
            Ok(Json(attribute(sanitize(&value), api_by)))
        }
        Err(error @ LookupError::InvalidType(_)) => {
            tracing::debug!(%error, "Rejected lookup type.");
            Err(ApiError::new(StatusCode::BAD_REQUEST, "Invalid type", api_by))
        }
        Err(error) => {
            tracing::error!(?error, "Upstream lookup failed.");
            Err(ApiError::new(
                StatusCode::INTERNAL_SERVER_ERROR,
                error.to_string(),
                api_by,
            ))
        }
    }
}

#[tracing::instrument(skip_all, fields(req_id = req_id()))]
#[utoipa::path(
    get,
    path = "/api/upi",
    params(UpiQuery),
    responses(
        (status = 200, description = "VPA details, plus bank details when the VPA has an IFSC", content_type = "application/json"),
        (status = 400, description = "Missing upi_id", body = ErrorBody),
        (status = 401, description = "Invalid API key", body = ErrorBody),
        (status = 404, description = "No VPA data found", body = ErrorBody),
        (status = 500, description = "Verification failed", body = ErrorBody),
        (status = 503, description = "UPI lookup is not configured", body = ErrorBody),
    ),
    security(
        ("api_key" = [])
    )
)]
pub async fn handle_upi(
    State(state): State<AppState>,
    headers: HeaderMap,
    Query(query): Query<UpiQuery>,
) -> Result<Json<Value>, ApiError> {
    let api_by = state.conf.attribution.as_str();
    let presented = auth::presented_key(&headers, query.key.as_deref());
    if !auth::is_authorized(presented, &state.conf.api_key) {
        tracing::warn!(key_present = presented.is_some(), "Rejected API key.");
        return Err(ApiError::new(
            StatusCode::UNAUTHORIZED,
            "Invalid API Key",
            api_by,
        ));
    }
    let Some(upi_id) = query.upi_id.filter(|id| !id.is_empty()) else {
        return Err(ApiError::new(
            StatusCode::BAD_REQUEST,
            "Missing required parameter: upi_id",
            api_by,
        ));
    };

    match state.dispatcher.lookup_upi(&upi_id).await {
        Ok(value) => {
            tracing::info!("UPI lookup answered.");
            Ok(Json(attribute(value, api_by)))
        }
        Err(error) => {
            let status = match error {
                UpiError::Disabled => StatusCode::SERVICE_UNAVAILABLE,
                UpiError::NotFound => StatusCode::NOT_FOUND,
                UpiError::Fetch(_) | UpiError::Status(_) | UpiError::Decode(_) => {
                    tracing::error!(?error, "UPI lookup failed.");
                    StatusCode::INTERNAL_SERVER_ERROR
                }
            };
            Err(ApiError::new(status, error.to_string(), api_by))
        }
    }
}

#[tracing::instrument(skip_all, fields(req_id = req_id()))]
async fn handle_webhook(
    State(state): State<AppState>,
    headers: HeaderMap,
    body: Bytes,
) -> Result<&'static str, (StatusCode, &'static str)> {
    let Some(telegram) = state.telegram.as_ref() else {
        return Err((StatusCode::SERVICE_UNAVAILABLE, "Bot is not configured"));
    };
    if let Some(expected) = telegram.webhook_secret() {
        let presented = headers
            .get(WEBHOOK_SECRET_HEADER)
            .and_then(|v| v.to_str().ok());
        if !auth::is_authorized(presented, expected) {
            tracing::warn!("Webhook secret mismatch.");
            return Err((StatusCode::UNAUTHORIZED, "Invalid secret token"));
        }
    }
    let update: Update = serde_json::from_slice(&body).map_err(|error| {
        tracing::warn!(?error, "Undecodable update.");
        (StatusCode::BAD_REQUEST, "Invalid update")
    })?;
    telegram.handle_update(update).await.map_err(|error| {
        tracing::error!(?error, "Failed to handle update.");
        (StatusCode::INTERNAL_SERVER_ERROR, "Error handling update")
    })?;
    Ok("ok")
}

async fn handle_alive() -> &'static str {
    concat!(env!("CARGO_PKG_NAME"), " is running")
}

async fn health_check() -> &'static str {
    "OK"
}

#[derive(Debug, Clone)]
struct ReqId {
    pub req_id: String,
}

impl ReqId {
    fn new() -> Self {
        let req_id = cuid2::create_id();
        Self { req_id }
    }
}

tokio::task_local! {
    static REQ_ID: ReqId;
}

fn req_id() -> String {
    REQ_ID.try_with(|r| r.req_id.clone()).unwrap_or_default()
}
