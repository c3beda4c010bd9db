use std::net::SocketAddr;
use std::path::PathBuf;

use anyhow::Result;
use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::routing::{delete, get, post};
use axum::{Json, Router};
use clap::Parser;
use contact_kernel_api::{
    ContactKernelApi, IdentifyRequest, IdentifyResponse, API_CONTRACT_VERSION,
};
use contact_kernel_core::{ContactId, KernelError};
use serde::{Deserialize, Serialize};

const SERVICE_CONTRACT_VERSION: &str = "service.v1";

#[derive(Debug, Clone)]
struct ServiceState {
    api: ContactKernelApi,
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
    service_contract_version: &'static str,
    error: String,
    #[serde(skip)]
    status: StatusCode,
}

#[derive(Debug, Clone, Deserialize)]
struct MigrateRequest {
    dry_run: bool,
}

#[derive(Debug, Clone, Serialize)]
struct HealthResponse {
    status: &'static str,
}

#[derive(Debug, Clone, Serialize)]
struct ContactCountResponse {
    active_contacts: i64,
}

#[derive(Debug, Parser)]
#[command(name = "contact-kernel-service")]
#[command(about = "HTTP service for Contact Kernel identity reconciliation")]
struct Args {
    #[arg(long, default_value = "./contact_kernel.sqlite3")]
    db: PathBuf,
    #[arg(long, default_value = "127.0.0.1:4020")]
    bind: SocketAddr,
}

impl IntoResponse for ServiceError {
    fn into_response(self) -> Response {
        let status = self.status;
        (status, Json(self)).into_response()
    }
}

impl ServiceState {
    fn error(status: StatusCode, message: impl Into<String>) -> ServiceError {
        ServiceError {
            service_contract_version: SERVICE_CONTRACT_VERSION,
            error: message.into(),
            status,
        }
    }

    fn kernel_error(err: &KernelError) -> ServiceError {
        // Validation failures, retryable store failures, and internal
        // inconsistencies must stay distinguishable for callers.
        let status = match err {
            KernelError::Validation(_) => StatusCode::UNPROCESSABLE_ENTITY,
            KernelError::Store(_) => StatusCode::SERVICE_UNAVAILABLE,
            KernelError::Inconsistency(_) => StatusCode::INTERNAL_SERVER_ERROR,
        };
        Self::error(status, err.to_string())
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

fn app(state: ServiceState) -> Router {
    Router::new()
        .route("/v1/health", get(health))
        .route("/v1/db/schema-version", post(db_schema_version))
        .route("/v1/db/migrate", post(db_migrate))
        .route("/v1/identify", post(identify))
        .route("/v1/contacts/count", get(contacts_count))
        .route("/v1/contacts/:contact_id", delete(contacts_delete))
        .with_state(state)
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt::init();
    let args = Args::parse();
    let state = ServiceState { api: ContactKernelApi::new(args.db) };
    let listener = tokio::net::TcpListener::bind(args.bind).await?;
    tracing::info!(bind = %args.bind, "contact-kernel-service listening");
    axum::serve(listener, app(state)).await?;
    Ok(())
}

async fn health() -> Json<ServiceEnvelope<HealthResponse>> {
    Json(envelope(HealthResponse { status: "ok" }))
}

async fn db_schema_version(
    State(state): State<ServiceState>,
) -> Result<Json<ServiceEnvelope<contact_kernel_store_sqlite::SchemaStatus>>, ServiceError> {
    let status = state
        .api
        .schema_status()
        .map_err(|err| ServiceState::error(StatusCode::BAD_REQUEST, err.to_string()))?;
    Ok(Json(envelope(status)))
}

async fn db_migrate(
    State(state): State<ServiceState>,
    Json(request): Json<MigrateRequest>,
) -> Result<Json<ServiceEnvelope<contact_kernel_api::MigrateResult>>, ServiceError> {
    let result = state
        .api
        .migrate(request.dry_run)
        .map_err(|err| ServiceState::error(StatusCode::BAD_REQUEST, err.to_string()))?;
    Ok(Json(envelope(result)))
}

async fn identify(
    State(state): State<ServiceState>,
    Json(request): Json<IdentifyRequest>,
) -> Result<Json<ServiceEnvelope<IdentifyResponse>>, ServiceError> {
    let response = state.api.identify(request).map_err(|err| {
        tracing::warn!(error = %err, "identify request failed");
        ServiceState::kernel_error(&err)
    })?;
    tracing::info!(
        primary_contact_id = response.contact.primary_contact_id.0,
        secondaries = response.contact.secondary_contact_ids.len(),
        "identify request reconciled"
    );
    Ok(Json(envelope(response)))
}

async fn contacts_count(
    State(state): State<ServiceState>,
) -> Result<Json<ServiceEnvelope<ContactCountResponse>>, ServiceError> {
    let active_contacts = state
        .api
        .contact_count()
        .map_err(|err| ServiceState::error(StatusCode::BAD_REQUEST, err.to_string()))?;
    Ok(Json(envelope(ContactCountResponse { active_contacts })))
}

async fn contacts_delete(
    State(state): State<ServiceState>,
    Path(contact_id): Path<i64>,
) -> Result<Json<ServiceEnvelope<contact_kernel_api::DeleteContactResult>>, ServiceError> {
    let result = state
        .api
        .delete_contact(ContactId(contact_id))
        .map_err(|err| ServiceState::error(StatusCode::BAD_REQUEST, err.to_string()))?;
    Ok(Json(envelope(result)))
}
