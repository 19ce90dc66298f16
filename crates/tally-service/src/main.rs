use std::net::SocketAddr;
use std::path::PathBuf;

use anyhow::Result;
use axum::extract::{Path, Query, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::routing::{get, patch, post};
use axum::{Json, Router};
use clap::Parser;
use serde::{Deserialize, Serialize};
use tally_api::{
    AddBeerRequest, AddExerciseRequest, ArchiveRequest, SaveCheckRequest, SetPeriodModeRequest,
    TallyApi, UpdateLogRequest, API_CONTRACT_VERSION,
};
use tally_core::{EngineConfig, LedgerError, LogId};
use tracing_subscriber::EnvFilter;

const SERVICE_CONTRACT_VERSION: &str = "service.v1";

#[derive(Debug, Clone)]
struct ServiceState {
    api: TallyApi,
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
    service_contract_version: &'static str,
    error: String,
}

#[derive(Debug, Clone, Deserialize)]
struct MigrateRequest {
    dry_run: bool,
}

#[derive(Debug, Clone, Deserialize)]
struct RecalculateRequest {
    changed_ms: i64,
}

#[derive(Debug, Clone, Default, Deserialize)]
struct RangeQuery {
    from_ms: Option<i64>,
    to_ms: Option<i64>,
}

#[derive(Debug, Clone, Serialize)]
struct HealthResponse {
    status: &'static str,
}

#[derive(Debug, Parser)]
#[command(name = "tally-service")]
#[command(about = "Local HTTP service for the tally diary")]
struct Args {
    #[arg(long, default_value = "./tally.sqlite3")]
    db: PathBuf,
    #[arg(long, default_value = "127.0.0.1:4010")]
    bind: SocketAddr,
    #[arg(long)]
    config: Option<PathBuf>,
}

impl IntoResponse for ServiceError {
    fn into_response(self) -> Response {
        (self.status, Json(self)).into_response()
    }
}

impl ServiceError {
    fn new(status: StatusCode, message: impl Into<String>) -> Self {
        Self { status, service_contract_version: SERVICE_CONTRACT_VERSION, error: message.into() }
    }

    fn from_api(err: &anyhow::Error) -> Self {
        let status = match err.downcast_ref::<LedgerError>() {
            Some(LedgerError::NotFound { .. }) => StatusCode::NOT_FOUND,
            _ => StatusCode::BAD_REQUEST,
        };
        Self::new(status, format!("{err:#}"))
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

type ServiceResult<T> = Result<Json<ServiceEnvelope<T>>, ServiceError>;

/// Run a store-bound operation off the async runtime.
async fn blocking<T, F>(state: ServiceState, op: F) -> ServiceResult<T>
where
    T: Serialize + Send + 'static,
    F: FnOnce(&TallyApi) -> Result<T> + Send + 'static,
{
    let outcome = tokio::task::spawn_blocking(move || op(&state.api)).await.map_err(|err| {
        ServiceError::new(StatusCode::INTERNAL_SERVER_ERROR, format!("store task failed: {err}"))
    })?;
    outcome.map(|data| Json(envelope(data))).map_err(|err| {
        tracing::debug!(error = %format!("{err:#}"), "request failed");
        ServiceError::from_api(&err)
    })
}

fn app(state: ServiceState) -> Router {
    Router::new()
        .route("/v1/health", get(health))
        .route("/v1/db/schema-version", post(db_schema_version))
        .route("/v1/db/migrate", post(db_migrate))
        .route("/v1/logs", get(logs_list))
        .route("/v1/logs/beer", post(logs_add_beer))
        .route("/v1/logs/exercise", post(logs_add_exercise))
        .route("/v1/logs/:log_id", patch(logs_update).delete(logs_delete))
        .route("/v1/checks", get(checks_list).post(checks_save))
        .route("/v1/recalculate", post(recalculate))
        .route("/v1/period/rollover", post(period_rollover))
        .route("/v1/period/archive", post(period_archive))
        .route("/v1/period/mode", post(period_mode))
        .route("/v1/period/summary", get(period_summary))
        .route("/v1/archives", get(archives_list))
        .with_state(state)
}

#[tokio::main]
async fn main() -> Result<()> {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::fmt().with_env_filter(filter).with_writer(std::io::stderr).init();

    let args = Args::parse();
    let config = match &args.config {
        Some(path) => EngineConfig::load(path)?,
        None => EngineConfig::default(),
    };
    let state = ServiceState { api: TallyApi::new(args.db, config) };
    let listener = tokio::net::TcpListener::bind(args.bind).await?;
    tracing::info!(bind = %args.bind, "tally service listening");
    axum::serve(listener, app(state)).await?;
    Ok(())
}

async fn health() -> Json<ServiceEnvelope<HealthResponse>> {
    Json(envelope(HealthResponse { status: "ok" }))
}

async fn db_schema_version(
    State(state): State<ServiceState>,
) -> ServiceResult<tally_store_sqlite::SchemaStatus> {
    blocking(state, TallyApi::schema_status).await
}

async fn db_migrate(
    State(state): State<ServiceState>,
    Json(request): Json<MigrateRequest>,
) -> ServiceResult<tally_api::MigrateResult> {
    blocking(state, move |api| api.migrate(request.dry_run)).await
}

async fn logs_list(
    State(state): State<ServiceState>,
    Query(range): Query<RangeQuery>,
) -> ServiceResult<Vec<tally_core::LogEntry>> {
    blocking(state, move |api| api.list_logs(range.from_ms, range.to_ms)).await
}

async fn logs_add_beer(
    State(state): State<ServiceState>,
    Json(request): Json<AddBeerRequest>,
) -> ServiceResult<tally_api::LogMutation> {
    blocking(state, move |api| api.add_beer(request)).await
}

async fn logs_add_exercise(
    State(state): State<ServiceState>,
    Json(request): Json<AddExerciseRequest>,
) -> ServiceResult<tally_api::LogMutation> {
    blocking(state, move |api| api.add_exercise(request)).await
}

async fn logs_update(
    State(state): State<ServiceState>,
    Path(log_id): Path<String>,
    Json(request): Json<UpdateLogRequest>,
) -> ServiceResult<tally_api::LogMutation> {
    blocking(state, move |api| api.update_log(LogId::parse(&log_id)?, request)).await
}

async fn logs_delete(
    State(state): State<ServiceState>,
    Path(log_id): Path<String>,
) -> ServiceResult<tally_api::DeletedLog> {
    blocking(state, move |api| api.delete_log(LogId::parse(&log_id)?)).await
}

async fn checks_list(
    State(state): State<ServiceState>,
    Query(range): Query<RangeQuery>,
) -> ServiceResult<Vec<tally_core::CheckEntry>> {
    blocking(state, move |api| api.list_checks(range.from_ms, range.to_ms)).await
}

async fn checks_save(
    State(state): State<ServiceState>,
    Json(request): Json<SaveCheckRequest>,
) -> ServiceResult<tally_api::CheckMutation> {
    blocking(state, move |api| api.save_check(request)).await
}

async fn recalculate(
    State(state): State<ServiceState>,
    Json(request): Json<RecalculateRequest>,
) -> ServiceResult<tally_store_sqlite::RecalcReport> {
    blocking(state, move |api| api.recalculate(request.changed_ms)).await
}

async fn period_rollover(
    State(state): State<ServiceState>,
) -> ServiceResult<tally_store_sqlite::RolloverOutcome> {
    blocking(state, TallyApi::check_rollover).await
}

async fn period_archive(
    State(state): State<ServiceState>,
    Json(request): Json<ArchiveRequest>,
) -> ServiceResult<tally_store_sqlite::ArchiveOutcome> {
    blocking(state, move |api| api.archive_and_reset(&request)).await
}

async fn period_mode(
    State(state): State<ServiceState>,
    Json(request): Json<SetPeriodModeRequest>,
) -> ServiceResult<tally_api::PeriodModeResult> {
    blocking(state, move |api| api.set_period_mode(&request)).await
}

async fn period_summary(
    State(state): State<ServiceState>,
) -> ServiceResult<tally_api::PeriodSummary> {
    blocking(state, TallyApi::current_balance).await
}

async fn archives_list(
    State(state): State<ServiceState>,
) -> ServiceResult<Vec<tally_core::PeriodArchive>> {
    blocking(state, TallyApi::list_archives).await
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::body::to_bytes;
    use http::Request;
    use tower::ServiceExt;

    fn unique_temp_db_path() -> PathBuf {
        std::env::temp_dir().join(format!("tally-service-{}.sqlite3", ulid::Ulid::new()))
    }

    fn test_router(db_path: &std::path::Path) -> Router {
        app(ServiceState { api: TallyApi::new(db_path.to_path_buf(), EngineConfig::default()) })
    }

    async fn response_json(response: Response) -> serde_json::Value {
        let bytes = match to_bytes(response.into_body(), 1024 * 1024).await {
            Ok(bytes) => bytes,
            Err(err) => panic!("failed to read response body: {err}"),
        };
        let body = match String::from_utf8(bytes.to_vec()) {
            Ok(body) => body,
            Err(err) => panic!("response body is not UTF-8: {err}"),
        };
        match serde_json::from_str(&body) {
            Ok(value) => value,
            Err(err) => panic!("response body is not JSON: {err}; body={body}"),
        }
    }

    async fn send(router: &Router, method: &str, uri: &str, body: Option<serde_json::Value>) -> Response {
        let builder = Request::builder().uri(uri).method(method);
        let request = match body {
            Some(body) => builder
                .header("content-type", "application/json")
                .body(axum::body::Body::from(body.to_string())),
            None => builder.body(axum::body::Body::empty()),
        }
        .unwrap_or_else(|err| panic!("failed to build request: {err}"));

        match router.clone().oneshot(request).await {
            Ok(response) => response,
            Err(err) => panic!("router request failed: {err}"),
        }
    }

    #[tokio::test]
    async fn health_endpoint_reports_ok() {
        let router = test_router(&unique_temp_db_path());

        let response = send(&router, "GET", "/v1/health", None).await;
        assert_eq!(response.status(), StatusCode::OK);

        let value = response_json(response).await;
        assert_eq!(
            value.get("service_contract_version").and_then(serde_json::Value::as_str),
            Some(SERVICE_CONTRACT_VERSION)
        );
        assert_eq!(value.pointer("/data/status").and_then(serde_json::Value::as_str), Some("ok"));
    }

    #[tokio::test]
    async fn dry_check_in_rewrites_exercise_through_the_service() {
        let db_path = unique_temp_db_path();
        let router = test_router(&db_path);

        for (timestamp_ms, memo) in [(1_699_876_800_000_i64, "easy"), (1_699_963_200_000, "tempo")] {
            let response = send(
                &router,
                "POST",
                "/v1/logs/exercise",
                Some(serde_json::json!({
                    "timestamp_ms": timestamp_ms,
                    "exercise_key": "running",
                    "minutes": 30.0,
                    "memo": memo
                })),
            )
            .await;
            assert_eq!(response.status(), StatusCode::OK);
        }

        let saved = send(
            &router,
            "POST",
            "/v1/checks",
            Some(serde_json::json!({ "day": "2023-11-13", "is_dry_day": true })),
        )
        .await;
        assert_eq!(saved.status(), StatusCode::OK);
        let saved_value = response_json(saved).await;
        assert_eq!(
            saved_value.pointer("/data/recalc/rewritten_logs").and_then(serde_json::Value::as_i64),
            Some(1)
        );

        let listed = send(&router, "GET", "/v1/logs", None).await;
        let listed_value = response_json(listed).await;
        assert_eq!(
            listed_value.pointer("/data/1/detail/memo").and_then(serde_json::Value::as_str),
            Some("tempo [streak bonus x1.2]")
        );
        assert_eq!(
            listed_value.get("api_contract_version").and_then(serde_json::Value::as_str),
            Some(API_CONTRACT_VERSION)
        );

        let _ = std::fs::remove_file(&db_path);
    }

    #[tokio::test]
    async fn unknown_log_maps_to_not_found() {
        let db_path = unique_temp_db_path();
        let router = test_router(&db_path);

        let response =
            send(&router, "DELETE", &format!("/v1/logs/{}", ulid::Ulid::new()), None).await;
        assert_eq!(response.status(), StatusCode::NOT_FOUND);
        let value = response_json(response).await;
        assert!(value
            .get("error")
            .and_then(serde_json::Value::as_str)
            .is_some_and(|error| error.contains("log not found")));

        let _ = std::fs::remove_file(&db_path);
    }

    #[tokio::test]
    async fn validation_failures_map_to_bad_request() {
        let db_path = unique_temp_db_path();
        let router = test_router(&db_path);

        let malformed_id = send(&router, "DELETE", "/v1/logs/not-a-ulid", None).await;
        assert_eq!(malformed_id.status(), StatusCode::BAD_REQUEST);

        let incomplete_custom = send(
            &router,
            "POST",
            "/v1/period/mode",
            Some(serde_json::json!({ "mode": "custom", "custom_start_ms": 0 })),
        )
        .await;
        assert_eq!(incomplete_custom.status(), StatusCode::BAD_REQUEST);
        let value = response_json(incomplete_custom).await;
        assert_eq!(
            value.get("service_contract_version").and_then(serde_json::Value::as_str),
            Some(SERVICE_CONTRACT_VERSION)
        );

        let _ = std::fs::remove_file(&db_path);
    }

    #[tokio::test]
    async fn period_summary_and_rollover_on_fresh_ledger() {
        let db_path = unique_temp_db_path();
        let router = test_router(&db_path);

        let rollover = send(&router, "POST", "/v1/period/rollover", None).await;
        assert_eq!(rollover.status(), StatusCode::OK);
        let rollover_value = response_json(rollover).await;
        assert_eq!(
            rollover_value.pointer("/data/outcome").and_then(serde_json::Value::as_str),
            Some("unchanged")
        );

        let summary = send(&router, "GET", "/v1/period/summary", None).await;
        let summary_value = response_json(summary).await;
        assert_eq!(
            summary_value.pointer("/data/settings/mode").and_then(serde_json::Value::as_str),
            Some("permanent")
        );
        assert_eq!(
            summary_value.pointer("/data/log_count").and_then(serde_json::Value::as_i64),
            Some(0)
        );

        let archives = send(&router, "GET", "/v1/archives", None).await;
        let archives_value = response_json(archives).await;
        assert_eq!(archives_value.get("data"), Some(&serde_json::json!([])));

        let _ = std::fs::remove_file(&db_path);
    }
}
