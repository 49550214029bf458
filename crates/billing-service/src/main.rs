use std::any::Any;
use std::marker::PhantomData;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::time::Duration;

use anyhow::{bail, Result};
use axum::extract::rejection::JsonRejection;
use axum::extract::{FromRequestParts, Path, State};
use axum::http::header::{AUTHORIZATION, CONTENT_TYPE, VARY};
use axum::http::request::Parts;
use axum::http::{HeaderMap, HeaderValue, Method, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use billing_api::{
    ApiError, BillingApi, BillingConfig, ChangeTariffRequest, LoginRequest, LoginResult,
    API_CONTRACT_VERSION,
};
use billing_core::{AccountId, Capability, Identity, TariffLink, TariffLinkId};
use clap::{Parser, ValueEnum};
use serde::Serialize;
use tower::ServiceBuilder;
use tower_http::catch_panic::CatchPanicLayer;
use tower_http::cors::{Any as AnyOrigin, CorsLayer};
use tower_http::set_header::SetResponseHeaderLayer;
use tower_http::trace::TraceLayer;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::EnvFilter;

mod error;

use crate::error::ServiceError;

const SERVICE_CONTRACT_VERSION: &str = "service.v1";
const OPENAPI_YAML: &str = include_str!("../../../openapi/openapi.yaml");
const MIN_PRODUCTION_SECRET_LEN: usize = 32;

#[derive(Debug, Clone)]
struct ServiceState {
    api: BillingApi,
}

#[derive(Debug, Clone, Serialize)]
struct ServiceEnvelope<T>
where
    T: Serialize,
{
    service_contract_version: &'static str,
    api_contract_version: &'static str,
    data: T,
}

#[derive(Debug, Clone, Serialize)]
struct HealthResponse {
    status: &'static str,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
enum Environment {
    Development,
    Staging,
    Production,
}

#[derive(Parser)]
#[command(name = "billing-service")]
#[command(about = "HTTP service for tariff links with optimistic concurrency")]
struct Args {
    #[arg(long, env = "BILLING_BIND", default_value = "127.0.0.1:4000")]
    bind: SocketAddr,
    #[arg(long, env = "BILLING_DB", default_value = "./billing.sqlite3")]
    db: PathBuf,
    #[arg(long, env = "BILLING_JWT_SECRET", hide_env_values = true)]
    jwt_secret: String,
    #[arg(long, env = "BILLING_TOKEN_TTL_HOURS", default_value_t = 24)]
    token_ttl_hours: u64,
    #[arg(long, env = "BILLING_STORE_TIMEOUT_MS", default_value_t = 3000)]
    store_timeout_ms: u64,
    #[arg(long, env = "BILLING_ENV", value_enum, default_value_t = Environment::Development)]
    env: Environment,
}

impl Args {
    fn billing_config(&self) -> Result<BillingConfig> {
        if self.jwt_secret.is_empty() {
            bail!("--jwt-secret MUST NOT be empty");
        }
        if self.env == Environment::Production && self.jwt_secret.len() < MIN_PRODUCTION_SECRET_LEN {
            bail!("--jwt-secret must be at least {MIN_PRODUCTION_SECRET_LEN} bytes in production");
        }
        if self.store_timeout_ms == 0 || self.token_ttl_hours == 0 {
            bail!("--store-timeout-ms and --token-ttl-hours must be positive");
        }

        Ok(BillingConfig {
            db_path: self.db.clone(),
            store_timeout: Duration::from_millis(self.store_timeout_ms),
            jwt_secret: self.jwt_secret.clone(),
            token_ttl: Duration::from_secs(self.token_ttl_hours.saturating_mul(60 * 60)),
        })
    }
}

fn envelope<T>(data: T) -> ServiceEnvelope<T>
where
    T: Serialize,
{
    ServiceEnvelope {
        service_contract_version: SERVICE_CONTRACT_VERSION,
        api_contract_version: API_CONTRACT_VERSION,
        data,
    }
}

/// Run a store-bound call off the async runtime.
async fn run_blocking<T, F>(call: F) -> Result<T, ServiceError>
where
    F: FnOnce() -> Result<T, ApiError> + Send + 'static,
    T: Send + 'static,
{
    match tokio::task::spawn_blocking(call).await {
        Ok(result) => result.map_err(ServiceError::from),
        Err(err) => {
            tracing::error!(error = %err, "blocking store task failed");
            Err(ServiceError::internal())
        }
    }
}

trait RequiredCapability {
    const CAPABILITY: Capability;
}

struct ReadTariffs;

impl RequiredCapability for ReadTariffs {
    const CAPABILITY: Capability = Capability::TariffsRead;
}

struct UpdateTariffs;

impl RequiredCapability for UpdateTariffs {
    const CAPABILITY: Capability = Capability::TariffsUpdate;
}

/// Operator that passed the access gate for capability `C`.
struct Authorized<C> {
    operator: Identity,
    _capability: PhantomData<C>,
}

fn bearer_token(headers: &HeaderMap) -> Result<&str, ServiceError> {
    let Some(value) = headers.get(AUTHORIZATION) else {
        return Err(ServiceError::authentication_required());
    };
    let value = value.to_str().map_err(|_| ServiceError::invalid_token())?;
    match value.split_once(' ') {
        Some((scheme, token)) if scheme == "Bearer" && !token.trim().is_empty() => Ok(token.trim()),
        _ => Err(ServiceError::invalid_token()),
    }
}

#[axum::async_trait]
impl<C> FromRequestParts<ServiceState> for Authorized<C>
where
    C: RequiredCapability + Send + Sync,
{
    type Rejection = ServiceError;

    async fn from_request_parts(
        parts: &mut Parts,
        state: &ServiceState,
    ) -> Result<Self, Self::Rejection> {
        let token = bearer_token(&parts.headers)?.to_string();
        let capability = C::CAPABILITY;
        let api = state.api.clone();
        let operator = run_blocking(move || api.require_capability(&token, capability)).await?;
        Ok(Self { operator, _capability: PhantomData })
    }
}

/// Path ids that are not positive integers address nothing.
fn parse_id(raw: &str) -> Result<i64, ServiceError> {
    match raw.parse::<i64>() {
        Ok(id) if id > 0 => Ok(id),
        _ => Err(ServiceError::not_found()),
    }
}

fn json_body<T>(body: Result<Json<T>, JsonRejection>) -> Result<T, ServiceError> {
    body.map(|Json(value)| value).map_err(|rejection| ServiceError::bad_request(rejection.body_text()))
}

fn cors_layer() -> CorsLayer {
    CorsLayer::new()
        .allow_origin(AnyOrigin)
        .allow_methods([
            Method::GET,
            Method::POST,
            Method::PUT,
            Method::PATCH,
            Method::DELETE,
            Method::OPTIONS,
        ])
        .allow_headers([CONTENT_TYPE, AUTHORIZATION])
}

fn handle_panic(_panic: Box<dyn Any + Send + 'static>) -> Response {
    tracing::error!("request handler panicked");
    ServiceError::panicked().into_response()
}

fn app(state: ServiceState) -> Router {
    let protected = Router::new()
        .route("/v1/tariff-links/:id", get(tariff_link_show).patch(tariff_link_change))
        .route("/v1/accounts/:account_id/tariff-link", get(tariff_link_by_account))
        .layer(SetResponseHeaderLayer::appending(VARY, HeaderValue::from_static("Authorization")));

    Router::new()
        .route("/v1/health", get(health))
        .route("/v1/openapi", get(openapi))
        .route("/v1/auth/login", post(login))
        .merge(protected)
        .fallback(fallback)
        .with_state(state)
        .layer(
            ServiceBuilder::new()
                .layer(TraceLayer::new_for_http())
                .layer(CatchPanicLayer::custom(handle_panic))
                .layer(cors_layer()),
        )
}

fn init_tracing() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::registry().with(filter).with(tracing_subscriber::fmt::layer()).init();
}

async fn shutdown_signal() {
    if let Err(err) = tokio::signal::ctrl_c().await {
        tracing::error!(error = %err, "failed to listen for shutdown signal");
        return;
    }
    tracing::info!("shutdown signal received");
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();
    init_tracing();

    let api = BillingApi::new(args.billing_config()?)?;
    let schema = api.migrate()?;
    tracing::info!(
        db = %args.db.display(),
        schema_version = schema.current_version,
        "database ready"
    );

    let listener = tokio::net::TcpListener::bind(args.bind).await?;
    tracing::info!(bind = %args.bind, env = ?args.env, "billing service listening");
    axum::serve(listener, app(ServiceState { api }))
        .with_graceful_shutdown(shutdown_signal())
        .await?;
    Ok(())
}

async fn health() -> Json<ServiceEnvelope<HealthResponse>> {
    Json(envelope(HealthResponse { status: "ok" }))
}

async fn openapi() -> impl IntoResponse {
    (StatusCode::OK, [("content-type", "application/yaml; charset=utf-8")], OPENAPI_YAML)
}

async fn fallback() -> ServiceError {
    ServiceError::not_found()
}

async fn login(
    State(state): State<ServiceState>,
    body: Result<Json<LoginRequest>, JsonRejection>,
) -> Result<Json<ServiceEnvelope<LoginResult>>, ServiceError> {
    let request = json_body(body)?;
    let api = state.api.clone();
    let result = run_blocking(move || api.login(&request)).await?;
    Ok(Json(envelope(result)))
}

async fn tariff_link_show(
    State(state): State<ServiceState>,
    _operator: Authorized<ReadTariffs>,
    Path(id): Path<String>,
) -> Result<Json<ServiceEnvelope<TariffLink>>, ServiceError> {
    let id = TariffLinkId(parse_id(&id)?);
    let api = state.api.clone();
    let link = run_blocking(move || api.tariff_link(id)).await?;
    Ok(Json(envelope(link)))
}

async fn tariff_link_by_account(
    State(state): State<ServiceState>,
    _operator: Authorized<ReadTariffs>,
    Path(account_id): Path<String>,
) -> Result<Json<ServiceEnvelope<TariffLink>>, ServiceError> {
    let account_id = AccountId(parse_id(&account_id)?);
    let api = state.api.clone();
    let link = run_blocking(move || api.tariff_link_for_account(account_id)).await?;
    Ok(Json(envelope(link)))
}

async fn tariff_link_change(
    State(state): State<ServiceState>,
    authorized: Authorized<UpdateTariffs>,
    Path(id): Path<String>,
    body: Result<Json<ChangeTariffRequest>, JsonRejection>,
) -> Result<Json<ServiceEnvelope<TariffLink>>, ServiceError> {
    let id = TariffLinkId(parse_id(&id)?);
    let intent = json_body(body)?.into_intent(id, &authorized.operator);
    let api = state.api.clone();
    let link = run_blocking(move || api.change_tariff(&intent)).await?;
    Ok(Json(envelope(link)))
}
