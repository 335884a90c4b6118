//! HTTP API server.
//!
//! Exposes the pipeline (server registry, staging store, extractor,
//! transformer, warehouse loader, query engine and job tracker) as a JSON
//! HTTP API. Handlers are thin: they decode the request, call one
//! component operation on the shared [`AppContext`] and wrap the outcome.
//!
//! # Endpoints
//!
//! | Method | Path | Description |
//! |--------|------|-------------|
//! | `GET` | `/` | API index |
//! | `GET` | `/health` | Health check (returns version) |
//! | `GET`, `POST` | `/v1/config/database/servers` | List names / register a server |
//! | `GET`, `PUT`, `DELETE` | `/v1/config/database/servers/{name}` | Read / update / remove |
//! | `GET`, `POST` | `/v1/staging/s3/buckets` | List / create buckets |
//! | `GET`, `DELETE` | `/v1/staging/s3/buckets/{b}` | Contents / delete (`?region=&force=`) |
//! | `GET`, `POST` | `/v1/staging/s3/buckets/{b}/folders` | List / create folders |
//! | `GET`, `POST`, `DELETE` | `/v1/staging/s3/buckets/{b}/folders/{f}` | Objects / multipart upload / delete |
//! | `GET`, `POST`, `DELETE` | `/v1/staging/s3/buckets/{b}/folders/{f}/objects/{o}` | Download / raw upload / delete |
//! | `GET` | `/v1/staging/s3/buckets/{b}/folders/{f}/objects/{o}/versions` | Object versions |
//! | `GET` | `/v1/extract/db/servers/{s}/databases/{d}/tables` | Extract every table (`?on_error=`) |
//! | `GET` | `/v1/extract/db/servers/{s}/databases/{d}/tables/{t}` | Extract one table |
//! | `POST` | `/v1/extract/{kind}` | Multipart file extraction |
//! | `POST` | `/v1/transform/db/servers/{s}/databases/{d}` | Relational transform |
//! | `POST` | `/v1/transform/df/staging/buckets/{b}/folders/{f}` | Tabular transform |
//! | `GET`, `POST` | `/v1/load/dw/databases` | List / create warehouse databases |
//! | `GET`, `DELETE` | `/v1/load/dw/databases/{d}` | Read / delete (`?cascade=`) |
//! | `GET`, `POST` | `/v1/load/dw/databases/{d}/tables` | List / create tables |
//! | `GET`, `POST`, `DELETE` | `/v1/load/dw/databases/{d}/tables/{t}` | Read / load / delete |
//! | `POST` | `/v1/load/dw/databases/{d}/tables/{t}/loads/{job}/revert` | Undo a load |
//! | `POST` | `/v1/query/dw/databases/{d}` | Read-only SQL |
//! | `GET` | `/v1/jobs` | Recent jobs (`?status=&limit=`) |
//! | `GET` | `/v1/jobs/{id}` | One job |
//! | `POST` | `/v1/jobs/{id}/cancel` | Cancel a running job |
//!
//! # Error Contract
//!
//! Successful calls answer `{"result": …}`. Failures answer
//!
//! ```json
//! { "error": { "error_kind": "NotFound", "message": "not found: bucket 'raw'", "details": null } }
//! ```
//!
//! with the status code of the error kind (see [`status_for`]).
//! `PartialFailure` answers `207` and lists every item's outcome in
//! `details`.
//!
//! # CORS
//!
//! All origins, methods, and headers are permitted.

use axum::{
    body::Bytes,
    extract::{
        rejection::{JsonRejection, QueryRejection},
        DefaultBodyLimit, Multipart, Path, Query, State,
    },
    http::{header, HeaderMap, HeaderValue, StatusCode},
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use serde::{de::DeserializeOwned, Deserialize, Serialize};
use serde_json::{json, Value};
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;
use tracing::{error, info};

use etl_harness_core::error::{ErrorKind, EtlError};
use etl_harness_core::models::{ColumnDef, ObjectKey, ServerConfig, ServerUpdate};
use etl_harness_core::options::ExtractPolicy;

use crate::app::AppContext;
use crate::config::Config;
use crate::extraction::{FileKind, FileTarget};
use crate::jobs::JobStatus;

/// Starts the HTTP server.
///
/// Binds to `[server].bind` and serves until the process is terminated.
pub async fn run_server(config: &Config) -> anyhow::Result<()> {
    let ctx = AppContext::from_config(config).await?;
    let bind_addr = config.server.bind.clone();
    let app = router(ctx);

    info!(bind = %bind_addr, "ETL API listening");
    let listener = tokio::net::TcpListener::bind(&bind_addr).await?;
    axum::serve(listener, app).await?;
    Ok(())
}

/// The full API router over one application context.
pub fn router(ctx: AppContext) -> Router {
    let body_limit = ctx.config.server.max_body_bytes;
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);

    Router::new()
        .route("/", get(handle_index))
        .route("/health", get(handle_health))
        // Server registry
        .route(
            "/v1/config/database/servers",
            get(list_servers).post(create_server),
        )
        .route(
            "/v1/config/database/servers/{name}",
            get(get_server).put(update_server).delete(delete_server),
        )
        // Staging store
        .route("/v1/staging/s3/buckets", get(list_buckets).post(create_bucket))
        .route(
            "/v1/staging/s3/buckets/{bucket}",
            get(get_bucket).delete(delete_bucket),
        )
        .route(
            "/v1/staging/s3/buckets/{bucket}/folders",
            get(list_folders).post(create_folder),
        )
        .route(
            "/v1/staging/s3/buckets/{bucket}/folders/{folder}",
            get(list_objects).post(upload_multipart).delete(delete_folder),
        )
        .route(
            "/v1/staging/s3/buckets/{bucket}/folders/{folder}/objects/{object}",
            get(download_object).post(upload_raw).delete(delete_object),
        )
        .route(
            "/v1/staging/s3/buckets/{bucket}/folders/{folder}/objects/{object}/versions",
            get(list_versions),
        )
        // Extractor
        .route(
            "/v1/extract/db/servers/{server}/databases/{database}/tables",
            get(extract_database),
        )
        .route(
            "/v1/extract/db/servers/{server}/databases/{database}/tables/{table}",
            get(extract_table),
        )
        .route("/v1/extract/{kind}", post(extract_file))
        // Transformer
        .route(
            "/v1/transform/db/servers/{server}/databases/{database}",
            post(transform_relational),
        )
        .route(
            "/v1/transform/df/staging/buckets/{bucket}/folders/{folder}",
            post(transform_tabular),
        )
        // Warehouse
        .route(
            "/v1/load/dw/databases",
            get(list_databases).post(create_database),
        )
        .route(
            "/v1/load/dw/databases/{database}",
            get(get_database).delete(delete_database),
        )
        .route(
            "/v1/load/dw/databases/{database}/tables",
            get(list_tables).post(create_table),
        )
        .route(
            "/v1/load/dw/databases/{database}/tables/{table}",
            get(get_table).post(load_table).delete(delete_table),
        )
        .route(
            "/v1/load/dw/databases/{database}/tables/{table}/loads/{job}/revert",
            post(revert_load),
        )
        // Query engine
        .route("/v1/query/dw/databases/{database}", post(run_query))
        // Jobs
        .route("/v1/jobs", get(list_jobs))
        .route("/v1/jobs/{id}", get(get_job))
        .route("/v1/jobs/{id}/cancel", post(cancel_job))
        .layer(DefaultBodyLimit::max(body_limit))
        .layer(TraceLayer::new_for_http())
        .layer(cors)
        .with_state(ctx)
}

// ============ Error response ============

/// JSON error response body.
#[derive(Serialize)]
struct ErrorBody {
    error: ErrorDetail,
}

#[derive(Serialize)]
struct ErrorDetail {
    error_kind: ErrorKind,
    message: String,
    details: Option<Value>,
}

/// HTTP status for each error kind.
pub fn status_for(kind: ErrorKind) -> StatusCode {
    match kind {
        ErrorKind::NotFound => StatusCode::NOT_FOUND,
        ErrorKind::DuplicateKey | ErrorKind::Conflict | ErrorKind::Cancelled => StatusCode::CONFLICT,
        ErrorKind::MalformedInput | ErrorKind::SyntaxError | ErrorKind::UnsupportedOperation => {
            StatusCode::BAD_REQUEST
        }
        ErrorKind::InvalidParams => StatusCode::UNPROCESSABLE_ENTITY,
        ErrorKind::Forbidden => StatusCode::FORBIDDEN,
        ErrorKind::SourceUnavailable => StatusCode::BAD_GATEWAY,
        ErrorKind::PartialFailure => StatusCode::MULTI_STATUS,
        ErrorKind::Timeout => StatusCode::REQUEST_TIMEOUT,
        ErrorKind::LoadFailed | ErrorKind::Internal => StatusCode::INTERNAL_SERVER_ERROR,
    }
}

/// Error type that converts into an Axum HTTP response.
struct AppError(EtlError);

impl From<EtlError> for AppError {
    fn from(err: EtlError) -> Self {
        AppError(err)
    }
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let kind = self.0.kind();
        let status = status_for(kind);
        if status.is_server_error() {
            error!(kind = %kind, error = %self.0, "request failed");
        }
        let body = ErrorBody {
            error: ErrorDetail {
                error_kind: kind,
                message: self.0.to_string(),
                details: self.0.details(),
            },
        };
        (status, Json(body)).into_response()
    }
}

type ApiResult = Result<Json<Value>, AppError>;

fn ok<T: Serialize>(value: T) -> ApiResult {
    let result = serde_json::to_value(value).map_err(EtlError::internal)?;
    Ok(Json(json!({ "result": result })))
}

/// Unwrap a JSON body, mapping extractor rejections into the taxonomy.
fn body<T>(payload: Result<Json<T>, JsonRejection>) -> Result<T, AppError> {
    match payload {
        Ok(Json(value)) => Ok(value),
        Err(JsonRejection::JsonDataError(e)) => Err(EtlError::invalid(e.body_text()).into()),
        Err(e) => Err(EtlError::malformed(e.body_text()).into()),
    }
}

fn query<T>(params: Result<Query<T>, QueryRejection>) -> Result<T, AppError> {
    params
        .map(|Query(q)| q)
        .map_err(|e| EtlError::invalid(e.body_text()).into())
}

fn multipart_err(err: axum::extract::multipart::MultipartError) -> AppError {
    EtlError::malformed(format!("multipart body: {}", err.body_text())).into()
}

/// The `file` part of a multipart body: its file name and bytes.
async fn read_file_part(mut multipart: Multipart) -> Result<(String, Option<String>, Vec<u8>), AppError> {
    let mut found = None;
    let mut name_override = None;
    while let Some(field) = multipart.next_field().await.map_err(multipart_err)? {
        match field.name() {
            Some("file") => {
                let file_name = field.file_name().map(str::to_string);
                let content_type = field.content_type().map(str::to_string);
                let bytes = field.bytes().await.map_err(multipart_err)?;
                found = Some((file_name, content_type, bytes.to_vec()));
            }
            Some("object_name") => {
                name_override = Some(field.text().await.map_err(multipart_err)?);
            }
            _ => {}
        }
    }
    let (file_name, content_type, bytes) =
        found.ok_or_else(|| EtlError::invalid("multipart body has no 'file' part"))?;
    let name = name_override
        .or(file_name)
        .ok_or_else(|| EtlError::invalid("the 'file' part has no file name"))?;
    Ok((name, content_type, bytes))
}

fn parse<T: DeserializeOwned>(value: Value, what: &str) -> Result<T, AppError> {
    serde_json::from_value(value).map_err(|e| EtlError::invalid(format!("{}: {}", what, e)).into())
}

// ============ GET / and /health ============

async fn handle_index() -> Json<Value> {
    Json(json!({
        "name": "etl-harness",
        "version": env!("CARGO_PKG_VERSION"),
        "endpoints": {
            "config": "/v1/config/database/servers",
            "staging": "/v1/staging/s3/buckets",
            "extract": ["/v1/extract/db/servers/{server}/databases/{database}/tables", "/v1/extract/{kind}"],
            "transform": ["/v1/transform/db/servers/{server}/databases/{database}", "/v1/transform/df/staging/buckets/{bucket}/folders/{folder}"],
            "load": "/v1/load/dw/databases",
            "query": "/v1/query/dw/databases/{database}",
            "jobs": "/v1/jobs",
        }
    }))
}

#[derive(Serialize)]
struct HealthResponse {
    status: String,
    version: String,
}

async fn handle_health() -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "ok".to_string(),
        version: env!("CARGO_PKG_VERSION").to_string(),
    })
}

// ============ Server registry ============

async fn list_servers(State(ctx): State<AppContext>) -> ApiResult {
    let servers = ctx.registry.list().await?;
    ok(servers.into_iter().map(|s| s.server_name).collect::<Vec<_>>())
}

async fn create_server(
    State(ctx): State<AppContext>,
    payload: Result<Json<Value>, JsonRejection>,
) -> Result<(StatusCode, Json<Value>), AppError> {
    let config: ServerConfig = parse(body(payload)?, "server config")?;
    let info = ctx.registry.create(config).await?;
    Ok((StatusCode::CREATED, ok(info)?))
}

async fn get_server(State(ctx): State<AppContext>, Path(name): Path<String>) -> ApiResult {
    ok(ctx.registry.get(&name).await?)
}

async fn update_server(
    State(ctx): State<AppContext>,
    Path(name): Path<String>,
    payload: Result<Json<Value>, JsonRejection>,
) -> ApiResult {
    let update: ServerUpdate = parse(body(payload)?, "server update")?;
    ok(ctx.registry.update(&name, update).await?)
}

async fn delete_server(State(ctx): State<AppContext>, Path(name): Path<String>) -> ApiResult {
    ctx.registry.delete(&name).await?;
    ok(json!({ "deleted": name }))
}

// ============ Staging store ============

#[derive(Deserialize)]
struct CreateBucket {
    bucket_name: String,
    #[serde(default)]
    region: Option<String>,
}

#[derive(Deserialize, Default)]
struct BucketQuery {
    #[serde(default)]
    region: Option<String>,
    #[serde(default)]
    force: bool,
}

#[derive(Deserialize)]
struct CreateFolder {
    folder_name: String,
}

#[derive(Deserialize, Default)]
struct ForceQuery {
    #[serde(default)]
    force: bool,
}

#[derive(Deserialize, Default)]
struct VersionQuery {
    #[serde(default)]
    version: Option<i64>,
}

async fn list_buckets(State(ctx): State<AppContext>) -> ApiResult {
    ok(ctx.staging.list_buckets().await?)
}

async fn create_bucket(
    State(ctx): State<AppContext>,
    payload: Result<Json<CreateBucket>, JsonRejection>,
) -> Result<(StatusCode, Json<Value>), AppError> {
    let req = body(payload)?;
    let region = req.region.unwrap_or_else(|| ctx.config.extraction.region.clone());
    let bucket = ctx.staging.create_bucket(&req.bucket_name, &region).await?;
    Ok((StatusCode::CREATED, ok(bucket)?))
}

async fn get_bucket(
    State(ctx): State<AppContext>,
    Path(bucket): Path<String>,
    params: Result<Query<BucketQuery>, QueryRejection>,
) -> ApiResult {
    let q = query(params)?;
    ok(ctx.staging.get_bucket(&bucket, q.region.as_deref()).await?)
}

async fn delete_bucket(
    State(ctx): State<AppContext>,
    Path(bucket): Path<String>,
    params: Result<Query<BucketQuery>, QueryRejection>,
) -> ApiResult {
    let q = query(params)?;
    ctx.staging
        .delete_bucket(&bucket, q.region.as_deref(), q.force)
        .await?;
    ok(json!({ "deleted": bucket }))
}

async fn list_folders(State(ctx): State<AppContext>, Path(bucket): Path<String>) -> ApiResult {
    ok(ctx.staging.list_folders(&bucket).await?)
}

async fn create_folder(
    State(ctx): State<AppContext>,
    Path(bucket): Path<String>,
    payload: Result<Json<CreateFolder>, JsonRejection>,
) -> Result<(StatusCode, Json<Value>), AppError> {
    let req = body(payload)?;
    let folder = ctx.staging.create_folder(&bucket, &req.folder_name).await?;
    Ok((StatusCode::CREATED, ok(folder)?))
}

async fn list_objects(
    State(ctx): State<AppContext>,
    Path((bucket, folder)): Path<(String, String)>,
) -> ApiResult {
    ok(ctx.staging.list_objects(&bucket, &folder).await?)
}

async fn delete_folder(
    State(ctx): State<AppContext>,
    Path((bucket, folder)): Path<(String, String)>,
    params: Result<Query<ForceQuery>, QueryRejection>,
) -> ApiResult {
    let q = query(params)?;
    ctx.staging.delete_folder(&bucket, &folder, q.force).await?;
    ok(json!({ "deleted": format!("{}/{}", bucket, folder) }))
}

async fn upload_multipart(
    State(ctx): State<AppContext>,
    Path((bucket, folder)): Path<(String, String)>,
    multipart: Multipart,
) -> Result<(StatusCode, Json<Value>), AppError> {
    let (name, content_type, bytes) = read_file_part(multipart).await?;
    let key = ObjectKey::new(bucket, folder, name);
    let info = ctx.staging.upload(&key, bytes, content_type.as_deref()).await?;
    Ok((StatusCode::CREATED, ok(info)?))
}

async fn upload_raw(
    State(ctx): State<AppContext>,
    Path((bucket, folder, object)): Path<(String, String, String)>,
    headers: HeaderMap,
    bytes: Bytes,
) -> Result<(StatusCode, Json<Value>), AppError> {
    let content_type = headers
        .get(header::CONTENT_TYPE)
        .and_then(|v| v.to_str().ok());
    let key = ObjectKey::new(bucket, folder, object);
    let info = ctx.staging.upload(&key, bytes.to_vec(), content_type).await?;
    Ok((StatusCode::CREATED, ok(info)?))
}

async fn download_object(
    State(ctx): State<AppContext>,
    Path((bucket, folder, object)): Path<(String, String, String)>,
    params: Result<Query<VersionQuery>, QueryRejection>,
) -> Result<Response, AppError> {
    let q = query(params)?;
    let key = ObjectKey::new(bucket, folder, object);
    let (info, bytes) = ctx.staging.download(&key, q.version).await?;

    let mut headers = HeaderMap::new();
    headers.insert(
        header::CONTENT_TYPE,
        HeaderValue::from_str(&info.content_type)
            .unwrap_or_else(|_| HeaderValue::from_static("application/octet-stream")),
    );
    if let Ok(etag) = HeaderValue::from_str(&format!("\"{}\"", info.sha256)) {
        headers.insert(header::ETAG, etag);
    }
    headers.insert("x-object-version", HeaderValue::from(info.version));
    Ok((headers, bytes).into_response())
}

async fn delete_object(
    State(ctx): State<AppContext>,
    Path((bucket, folder, object)): Path<(String, String, String)>,
) -> ApiResult {
    let key = ObjectKey::new(bucket, folder, object);
    ctx.staging.delete_object(&key).await?;
    ok(json!({ "deleted": key.to_string() }))
}

async fn list_versions(
    State(ctx): State<AppContext>,
    Path((bucket, folder, object)): Path<(String, String, String)>,
) -> ApiResult {
    let key = ObjectKey::new(bucket, folder, object);
    ok(ctx.staging.list_versions(&key).await?)
}

// ============ Extractor ============

#[derive(Deserialize, Default)]
struct ExtractQuery {
    #[serde(default)]
    on_error: Option<String>,
}

#[derive(Deserialize, Default)]
struct FileQuery {
    #[serde(default)]
    bucket: Option<String>,
    #[serde(default)]
    folder: Option<String>,
    #[serde(default)]
    sheet: Option<usize>,
}

async fn extract_database(
    State(ctx): State<AppContext>,
    Path((server, database)): Path<(String, String)>,
    params: Result<Query<ExtractQuery>, QueryRejection>,
) -> ApiResult {
    let q = query(params)?;
    let policy = q.on_error.as_deref().map(ExtractPolicy::parse).transpose()?;
    ok(ctx.extractor.extract_database(&server, &database, policy).await?)
}

async fn extract_table(
    State(ctx): State<AppContext>,
    Path((server, database, table)): Path<(String, String, String)>,
) -> ApiResult {
    ok(ctx.extractor.extract_table(&server, &database, &table).await?)
}

async fn extract_file(
    State(ctx): State<AppContext>,
    Path(kind): Path<String>,
    params: Result<Query<FileQuery>, QueryRejection>,
    multipart: Multipart,
) -> Result<(StatusCode, Json<Value>), AppError> {
    let kind = FileKind::parse(&kind)?;
    let q = query(params)?;
    let (name, _, bytes) = read_file_part(multipart).await?;
    let target = FileTarget {
        bucket: q.bucket,
        folder: q.folder,
        sheet: q.sheet,
    };
    let report = ctx.extractor.extract_file(kind, &name, bytes, target).await?;
    Ok((StatusCode::CREATED, ok(report)?))
}

// ============ Transformer ============

#[derive(Deserialize)]
struct RelationalRequest {
    sql: String,
    #[serde(default)]
    options: Value,
}

#[derive(Deserialize)]
struct TabularRequest {
    df: String,
    op: String,
    #[serde(default)]
    params: Value,
}

async fn transform_relational(
    State(ctx): State<AppContext>,
    Path((server, database)): Path<(String, String)>,
    payload: Result<Json<RelationalRequest>, JsonRejection>,
) -> ApiResult {
    let req = body(payload)?;
    ok(ctx
        .transformer
        .transform_relational(&server, &database, &req.sql, &req.options)
        .await?)
}

async fn transform_tabular(
    State(ctx): State<AppContext>,
    Path((bucket, folder)): Path<(String, String)>,
    payload: Result<Json<TabularRequest>, JsonRejection>,
) -> ApiResult {
    let req = body(payload)?;
    ok(ctx
        .transformer
        .transform_tabular(&bucket, &folder, &req.df, &req.op, &req.params)
        .await?)
}

// ============ Warehouse ============

#[derive(Deserialize)]
struct CreateDatabase {
    database_name: String,
    #[serde(default)]
    storage_engine: Option<String>,
}

#[derive(Deserialize, Default)]
struct CascadeQuery {
    #[serde(default)]
    cascade: bool,
}

#[derive(Deserialize)]
struct CreateTable {
    table_name: String,
    #[serde(default)]
    columns: Option<Vec<ColumnDef>>,
}

#[derive(Deserialize)]
struct LoadRequest {
    load_file: String,
    #[serde(default)]
    flags: Value,
}

async fn list_databases(State(ctx): State<AppContext>) -> ApiResult {
    ok(ctx.warehouse.list_databases().await?)
}

async fn create_database(
    State(ctx): State<AppContext>,
    payload: Result<Json<CreateDatabase>, JsonRejection>,
) -> Result<(StatusCode, Json<Value>), AppError> {
    let req = body(payload)?;
    let db = ctx
        .warehouse
        .create_database(&req.database_name, req.storage_engine.as_deref())
        .await?;
    Ok((StatusCode::CREATED, ok(db)?))
}

async fn get_database(State(ctx): State<AppContext>, Path(database): Path<String>) -> ApiResult {
    ok(ctx.warehouse.get_database(&database).await?)
}

async fn delete_database(
    State(ctx): State<AppContext>,
    Path(database): Path<String>,
    params: Result<Query<CascadeQuery>, QueryRejection>,
) -> ApiResult {
    let q = query(params)?;
    ctx.warehouse.delete_database(&database, q.cascade).await?;
    ok(json!({ "deleted": database }))
}

async fn list_tables(State(ctx): State<AppContext>, Path(database): Path<String>) -> ApiResult {
    ok(ctx.warehouse.list_tables(&database).await?)
}

async fn create_table(
    State(ctx): State<AppContext>,
    Path(database): Path<String>,
    payload: Result<Json<CreateTable>, JsonRejection>,
) -> Result<(StatusCode, Json<Value>), AppError> {
    let req = body(payload)?;
    let table = ctx
        .warehouse
        .create_table(&database, &req.table_name, req.columns)
        .await?;
    Ok((StatusCode::CREATED, ok(table)?))
}

async fn get_table(
    State(ctx): State<AppContext>,
    Path((database, table)): Path<(String, String)>,
) -> ApiResult {
    ok(ctx.warehouse.get_table(&database, &table).await?)
}

async fn load_table(
    State(ctx): State<AppContext>,
    Path((database, table)): Path<(String, String)>,
    payload: Result<Json<LoadRequest>, JsonRejection>,
) -> ApiResult {
    let req = body(payload)?;
    ok(ctx
        .warehouse
        .load_table(&database, &table, &req.load_file, &req.flags)
        .await?)
}

async fn delete_table(
    State(ctx): State<AppContext>,
    Path((database, table)): Path<(String, String)>,
) -> ApiResult {
    ctx.warehouse.delete_table(&database, &table).await?;
    ok(json!({ "deleted": format!("{}.{}", database, table) }))
}

async fn revert_load(
    State(ctx): State<AppContext>,
    Path((database, table, job)): Path<(String, String, String)>,
) -> ApiResult {
    ok(ctx.warehouse.revert_load(&database, &table, &job).await?)
}

// ============ Query engine ============

#[derive(Deserialize)]
struct QueryRequest {
    sql: String,
    #[serde(default)]
    options: Value,
}

async fn run_query(
    State(ctx): State<AppContext>,
    Path(database): Path<String>,
    payload: Result<Json<QueryRequest>, JsonRejection>,
) -> ApiResult {
    let req = body(payload)?;
    ok(ctx.query.query(&database, &req.sql, &req.options).await?)
}

// ============ Jobs ============

#[derive(Deserialize, Default)]
struct JobsQuery {
    #[serde(default)]
    status: Option<String>,
    #[serde(default)]
    limit: Option<i64>,
}

async fn list_jobs(
    State(ctx): State<AppContext>,
    params: Result<Query<JobsQuery>, QueryRejection>,
) -> ApiResult {
    let q = query(params)?;
    let status = q.status.as_deref().map(JobStatus::parse).transpose()?;
    ok(ctx.jobs.list(status, q.limit.unwrap_or(50)).await?)
}

async fn get_job(State(ctx): State<AppContext>, Path(id): Path<String>) -> ApiResult {
    ok(ctx.jobs.get(&id).await?)
}

async fn cancel_job(
    State(ctx): State<AppContext>,
    Path(id): Path<String>,
) -> Result<(StatusCode, Json<Value>), AppError> {
    let job = ctx.jobs.cancel(&id).await?;
    Ok((StatusCode::ACCEPTED, ok(job)?))
}
