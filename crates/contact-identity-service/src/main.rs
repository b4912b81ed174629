use std::net::SocketAddr;
use std::path::PathBuf;

use anyhow::Result;
use axum::extract::rejection::JsonRejection;
use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use clap::Parser;
use contact_identity_api::{IdentifyRequest, IdentifyResponse, IdentityApi, API_CONTRACT_VERSION};
use contact_identity_core::{ContactId, IdentityError, IdentityView};
use contact_identity_store_sqlite::{IntegrityReport, SchemaStatus, StoreOptions};
use serde::Serialize;
use tracing_subscriber::EnvFilter;

const SERVICE_CONTRACT_VERSION: &str = "service.v1";
const OPENAPI_YAML: &str = include_str!("../../../openapi/openapi.yaml");
const INTERNAL_ERROR_MESSAGE: &str = "Internal Server Error";

#[derive(Debug, Clone)]
struct ServiceState {
    api: IdentityApi,
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
struct ServiceError {
    #[serde(skip)]
    status: StatusCode,
    error: String,
}

#[derive(Debug, Clone, Serialize)]
struct HealthResponse {
    status: &'static str,
}

#[derive(Debug, Parser)]
#[command(name = "contact-identity-service")]
#[command(about = "HTTP service for contact identity reconciliation")]
struct Args {
    #[arg(long, env = "CONTACT_IDENTITY_DB", default_value = "./contact_identity.sqlite3")]
    db: PathBuf,
    #[arg(long, env = "CONTACT_IDENTITY_BIND", default_value = "127.0.0.1:4000")]
    bind: SocketAddr,
    #[arg(long, env = "CONTACT_IDENTITY_BUSY_TIMEOUT_MS", default_value_t = 5_000)]
    busy_timeout_ms: u64,
}

impl IntoResponse for ServiceError {
    fn into_response(self) -> Response {
        let status = self.status;
        (status, Json(self)).into_response()
    }
}

impl ServiceError {
    fn bad_request(message: impl Into<String>) -> Self {
        Self { status: StatusCode::BAD_REQUEST, error: message.into() }
    }

    fn not_found(message: impl Into<String>) -> Self {
        Self { status: StatusCode::NOT_FOUND, error: message.into() }
    }

    fn internal() -> Self {
        Self {
            status: StatusCode::INTERNAL_SERVER_ERROR,
            error: INTERNAL_ERROR_MESSAGE.to_string(),
        }
    }
}

impl From<anyhow::Error> for ServiceError {
    fn from(err: anyhow::Error) -> Self {
        if let Some(IdentityError::Validation(message)) = err.downcast_ref::<IdentityError>() {
            return Self::bad_request(message.clone());
        }
        tracing::error!(error = %format!("{err:#}"), "request failed");
        Self::internal()
    }
}

impl From<tokio::task::JoinError> for ServiceError {
    fn from(err: tokio::task::JoinError) -> Self {
        tracing::error!(error = %err, "blocking task failed");
        Self::internal()
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

/// Run a store call on the blocking pool so async workers never wait on `SQLite` locks.
async fn blocking<T, F>(state: ServiceState, work: F) -> Result<T, ServiceError>
where
    T: Send + 'static,
    F: FnOnce(&IdentityApi) -> Result<T> + Send + 'static,
{
    let value = tokio::task::spawn_blocking(move || work(&state.api)).await??;
    Ok(value)
}

fn app(state: ServiceState) -> Router {
    Router::new()
        .route("/health", get(health))
        .route("/identify", post(identify))
        .route("/v1/openapi", get(openapi))
        .route("/v1/contacts/:contact_id", get(contact_show))
        .route("/v1/db/schema-version", post(db_schema_version))
        .route("/v1/db/integrity", post(db_integrity))
        .with_state(state)
}

fn init_tracing() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::fmt().with_env_filter(filter).init();
}

#[tokio::main]
async fn main() -> Result<()> {
    init_tracing();
    let args = Args::parse();
    let api = IdentityApi::with_options(
        args.db.clone(),
        StoreOptions { busy_timeout_ms: args.busy_timeout_ms },
    );

    let migrate_api = api.clone();
    tokio::task::spawn_blocking(move || migrate_api.migrate(false)).await??;

    let state = ServiceState { api };
    let listener = tokio::net::TcpListener::bind(args.bind).await?;
    tracing::info!(bind = %args.bind, db = %args.db.display(), "contact identity service ready");
    axum::serve(listener, app(state)).await?;
    Ok(())
}

async fn health() -> Json<ServiceEnvelope<HealthResponse>> {
    Json(envelope(HealthResponse { status: "ok" }))
}

async fn openapi() -> impl IntoResponse {
    (StatusCode::OK, [("content-type", "application/yaml; charset=utf-8")], OPENAPI_YAML)
}

async fn identify(
    State(state): State<ServiceState>,
    payload: Result<Json<IdentifyRequest>, JsonRejection>,
) -> Result<Json<IdentifyResponse>, ServiceError> {
    let Json(request) =
        payload.map_err(|rejection| ServiceError::bad_request(rejection.body_text()))?;
    // Reject before any blocking work is scheduled.
    let query = request.clone().into_query().map_err(|err| match err {
        IdentityError::Validation(message) => ServiceError::bad_request(message),
        other => ServiceError::from(anyhow::Error::from(other)),
    })?;
    tracing::debug!(
        has_email = query.email().is_some(),
        has_phone_number = query.phone_number().is_some(),
        "identify request"
    );

    let response = blocking(state, move |api| api.identify(request)).await?;
    Ok(Json(response))
}

async fn contact_show(
    State(state): State<ServiceState>,
    Path(contact_id): Path<i64>,
) -> Result<Json<ServiceEnvelope<IdentityView>>, ServiceError> {
    let view = blocking(state, move |api| api.contact_cluster(ContactId(contact_id)))
        .await?
        .ok_or_else(|| ServiceError::not_found(format!("contact not found: {contact_id}")))?;
    Ok(Json(envelope(view)))
}

async fn db_schema_version(
    State(state): State<ServiceState>,
) -> Result<Json<ServiceEnvelope<SchemaStatus>>, ServiceError> {
    let status = blocking(state, IdentityApi::schema_status).await?;
    Ok(Json(envelope(status)))
}

async fn db_integrity(
    State(state): State<ServiceState>,
) -> Result<Json<ServiceEnvelope<IntegrityReport>>, ServiceError> {
    let report = blocking(state, IdentityApi::integrity_check).await?;
    Ok(Json(envelope(report)))
}
