//! Router-level tests for the HTTP API.
//!
//! Each test builds a fresh [`AppContext`] over a temporary directory and
//! drives the router with `tower::ServiceExt::oneshot`.

use std::path::Path;
use std::sync::Arc;

use async_trait::async_trait;
use axum::body::Body;
use axum::http::{header, Request, StatusCode};
use axum::Router;
use serde_json::{json, Value};
use tempfile::TempDir;
use tokio::sync::Notify;
use tower::ServiceExt;

use etl_harness::app::AppContext;
use etl_harness::config::{self, Config};
use etl_harness::server::router;
use etl_harness::source::{SourceConnector, SourceDatabase, SqlxConnector};
use etl_harness_core::error::{EtlError, Result};
use etl_harness_core::frame::{Cell, Frame};
use etl_harness_core::models::ServerConfig;

fn test_config(root: &Path) -> Config {
    config::from_toml_str(&format!(
        r#"[db]
path = "{root}/etl.sqlite"

[staging]
root = "{root}/staging"

[warehouse]
root = "{root}/warehouse"

[embedding]
provider = "hashing"
dims = 32
"#,
        root = root.display()
    ))
    .unwrap()
}

async fn app_with(connector: Arc<dyn SourceConnector>) -> (TempDir, Router) {
    let tmp = TempDir::new().unwrap();
    let cfg = test_config(tmp.path());
    let ctx = AppContext::with_connector(&cfg, connector).await.unwrap();
    (tmp, router(ctx))
}

async fn app() -> (TempDir, Router) {
    app_with(Arc::new(SqlxConnector)).await
}

async fn call(app: &Router, req: Request<Body>) -> (StatusCode, Vec<u8>) {
    let resp = app.clone().oneshot(req).await.unwrap();
    let status = resp.status();
    let bytes = axum::body::to_bytes(resp.into_body(), usize::MAX).await.unwrap();
    (status, bytes.to_vec())
}

async fn send(app: &Router, method: &str, uri: &str, body: Option<Value>) -> (StatusCode, Value) {
    let builder = Request::builder().method(method).uri(uri);
    let req = match body {
        Some(b) => builder
            .header(header::CONTENT_TYPE, "application/json")
            .body(Body::from(b.to_string()))
            .unwrap(),
        None => builder.body(Body::empty()).unwrap(),
    };
    let (status, bytes) = call(app, req).await;
    let value = if bytes.is_empty() {
        Value::Null
    } else {
        serde_json::from_slice(&bytes).unwrap_or_else(|_| Value::String(String::from_utf8_lossy(&bytes).into()))
    };
    (status, value)
}

async fn put_object(app: &Router, bucket: &str, folder: &str, object: &str, bytes: &[u8]) {
    let req = Request::builder()
        .method("POST")
        .uri(format!("/v1/staging/s3/buckets/{}/folders/{}/objects/{}", bucket, folder, object))
        .header(header::CONTENT_TYPE, "text/csv")
        .body(Body::from(bytes.to_vec()))
        .unwrap();
    let (status, body) = call(app, req).await;
    assert_eq!(status, StatusCode::CREATED, "{}", String::from_utf8_lossy(&body));
}

async fn get_object(app: &Router, bucket: &str, folder: &str, object: &str) -> (StatusCode, Vec<u8>) {
    let req = Request::builder()
        .uri(format!("/v1/staging/s3/buckets/{}/folders/{}/objects/{}", bucket, folder, object))
        .body(Body::empty())
        .unwrap();
    call(app, req).await
}

async fn staging_folder(app: &Router, bucket: &str, folder: &str) {
    let (s, _) = send(app, "POST", "/v1/staging/s3/buckets", Some(json!({"bucket_name": bucket}))).await;
    assert!(s == StatusCode::CREATED || s == StatusCode::CONFLICT);
    let (s, _) = send(
        app,
        "POST",
        &format!("/v1/staging/s3/buckets/{}/folders", bucket),
        Some(json!({"folder_name": folder})),
    )
    .await;
    assert_eq!(s, StatusCode::CREATED);
}

fn error_kind(body: &Value) -> &str {
    body["error"]["error_kind"].as_str().unwrap_or("")
}

/// Wait until a job of `kind` shows up as running and return its id.
async fn running_job(app: &Router, kind: &str) -> String {
    loop {
        let (_, body) = send(app, "GET", "/v1/jobs?status=running", None).await;
        if let Some(job) = body["result"]
            .as_array()
            .unwrap()
            .iter()
            .find(|j| j["kind"] == kind)
        {
            return job["id"].as_str().unwrap().to_string();
        }
        tokio::task::yield_now().await;
    }
}

// ============ Server registry ============

#[tokio::test]
async fn server_read_never_returns_password() {
    let (_tmp, app) = app().await;
    let (status, body) = send(
        &app,
        "POST",
        "/v1/config/database/servers",
        Some(json!({
            "server_name": "erp",
            "host": "db.internal",
            "port": 3307,
            "user": "etl",
            "password": "hunter2"
        })),
    )
    .await;
    assert_eq!(status, StatusCode::CREATED);
    assert!(body["result"].get("password").is_none());

    let (status, body) = send(&app, "GET", "/v1/config/database/servers/erp", None).await;
    assert_eq!(status, StatusCode::OK);
    let server = &body["result"];
    assert_eq!(server["host"], "db.internal");
    assert_eq!(server["port"], 3307);
    assert_eq!(server["user"], "etl");
    assert!(server.get("password").is_none());
    assert!(!body.to_string().contains("hunter2"));

    let (_, body) = send(&app, "GET", "/v1/config/database/servers", None).await;
    assert_eq!(body["result"], json!(["erp"]));

    let (status, body) = send(
        &app,
        "POST",
        "/v1/config/database/servers",
        Some(json!({"server_name": "erp", "host": "h", "port": 1, "user": "u", "password": ""})),
    )
    .await;
    assert_eq!(status, StatusCode::CONFLICT);
    assert_eq!(error_kind(&body), "DuplicateKey");
}

#[tokio::test]
async fn deleted_server_is_not_found() {
    let (_tmp, app) = app().await;
    send(
        &app,
        "POST",
        "/v1/config/database/servers",
        Some(json!({"server_name": "erp", "host": "h", "port": 3306, "user": "u", "password": "p"})),
    )
    .await;
    let (status, _) = send(&app, "DELETE", "/v1/config/database/servers/erp", None).await;
    assert_eq!(status, StatusCode::OK);
    let (status, body) = send(&app, "GET", "/v1/config/database/servers/erp", None).await;
    assert_eq!(status, StatusCode::NOT_FOUND);
    assert_eq!(error_kind(&body), "NotFound");
    let (status, _) = send(&app, "DELETE", "/v1/config/database/servers/erp", None).await;
    assert_eq!(status, StatusCode::NOT_FOUND);
}

#[tokio::test]
async fn update_rejects_mismatched_name() {
    let (_tmp, app) = app().await;
    send(
        &app,
        "POST",
        "/v1/config/database/servers",
        Some(json!({"server_name": "erp", "host": "h", "port": 3306, "user": "u", "password": "p"})),
    )
    .await;
    let (status, body) = send(
        &app,
        "PUT",
        "/v1/config/database/servers/erp",
        Some(json!({"server_name": "other", "port": 3310})),
    )
    .await;
    assert_eq!(status, StatusCode::UNPROCESSABLE_ENTITY);
    assert_eq!(error_kind(&body), "InvalidParams");

    let (status, body) = send(&app, "PUT", "/v1/config/database/servers/erp", Some(json!({"port": 3310}))).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["result"]["port"], 3310);
}

// ============ Extraction ============

/// Source with tables t1, t2, t3 where reading t2 fails.
struct FlakySource;

struct FlakyDatabase;

#[async_trait]
impl SourceConnector for FlakySource {
    async fn open(&self, _server: &ServerConfig, _database: &str) -> Result<Box<dyn SourceDatabase>> {
        Ok(Box::new(FlakyDatabase))
    }
}

#[async_trait]
impl SourceDatabase for FlakyDatabase {
    async fn list_tables(&mut self) -> Result<Vec<String>> {
        Ok(vec!["t1".into(), "t2".into(), "t3".into()])
    }

    async fn table_exists(&mut self, table: &str) -> Result<bool> {
        Ok(["t1", "t2", "t3"].contains(&table))
    }

    async fn read_table(&mut self, table: &str) -> Result<Frame> {
        if table == "t2" {
            return Err(EtlError::SourceUnavailable("connection reset while reading t2".into()));
        }
        Frame::new(vec!["id".into()], vec![vec![Cell::Int(1)], vec![Cell::Int(2)]])
    }
}

/// Source whose `t2` read blocks until released, so a job can be
/// cancelled while it is mid-database.
struct GatedSource {
    reached: Arc<Notify>,
    release: Arc<Notify>,
}

struct GatedDatabase {
    reached: Arc<Notify>,
    release: Arc<Notify>,
}

#[async_trait]
impl SourceConnector for GatedSource {
    async fn open(&self, _server: &ServerConfig, _database: &str) -> Result<Box<dyn SourceDatabase>> {
        Ok(Box::new(GatedDatabase {
            reached: self.reached.clone(),
            release: self.release.clone(),
        }))
    }
}

#[async_trait]
impl SourceDatabase for GatedDatabase {
    async fn list_tables(&mut self) -> Result<Vec<String>> {
        Ok(vec!["t1".into(), "t2".into(), "t3".into()])
    }

    async fn table_exists(&mut self, table: &str) -> Result<bool> {
        Ok(["t1", "t2", "t3"].contains(&table))
    }

    async fn read_table(&mut self, table: &str) -> Result<Frame> {
        if table == "t2" {
            self.reached.notify_one();
            self.release.notified().await;
        }
        Frame::new(vec!["id".into()], vec![vec![Cell::Int(7)]])
    }
}

async fn register_shop(app: &Router) {
    let (status, _) = send(
        app,
        "POST",
        "/v1/config/database/servers",
        Some(json!({"server_name": "src", "host": "db.internal", "port": 3306, "user": "etl", "password": "p"})),
    )
    .await;
    assert_eq!(status, StatusCode::CREATED);
}

#[tokio::test]
async fn extract_database_stop_policy_reports_each_table() {
    let (_tmp, app) = app_with(Arc::new(FlakySource)).await;
    register_shop(&app).await;

    let (status, body) = send(
        &app,
        "GET",
        "/v1/extract/db/servers/src/databases/shop/tables?on_error=stop",
        None,
    )
    .await;
    assert_eq!(status, StatusCode::MULTI_STATUS);
    assert_eq!(error_kind(&body), "PartialFailure");
    let items = body["error"]["details"]["items"].as_array().unwrap();
    assert_eq!(items.len(), 3);
    assert_eq!(items[0]["name"], "t1");
    assert_eq!(items[0]["status"], "succeeded");
    assert_eq!(items[0]["artifact"], "etl-staging/src.shop/t1.csv");
    assert_eq!(items[1]["status"], "failed");
    assert_eq!(items[1]["error_kind"], "SourceUnavailable");
    assert_eq!(items[2]["status"], "not_attempted");

    let (status, bytes) = get_object(&app, "etl-staging", "src.shop", "t1.csv").await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(bytes, b"id\n1\n2\n");
    let (status, _) = get_object(&app, "etl-staging", "src.shop", "t3.csv").await;
    assert_eq!(status, StatusCode::NOT_FOUND);

    let job_id = body["error"]["details"]["job_id"].as_str().unwrap().to_string();
    let (_, job) = send(&app, "GET", &format!("/v1/jobs/{}", job_id), None).await;
    assert_eq!(job["result"]["status"], "partial");
}

#[tokio::test]
async fn extract_database_continues_by_default() {
    let (_tmp, app) = app_with(Arc::new(FlakySource)).await;
    register_shop(&app).await;

    let (status, body) = send(&app, "GET", "/v1/extract/db/servers/src/databases/shop/tables", None).await;
    assert_eq!(status, StatusCode::MULTI_STATUS);
    let items = body["error"]["details"]["items"].as_array().unwrap();
    let statuses: Vec<&str> = items.iter().map(|i| i["status"].as_str().unwrap()).collect();
    assert_eq!(statuses, vec!["succeeded", "failed", "succeeded"]);
    let (status, _) = get_object(&app, "etl-staging", "src.shop", "t3.csv").await;
    assert_eq!(status, StatusCode::OK);
}

#[tokio::test]
async fn cancelled_extraction_skips_remaining_tables() {
    let reached = Arc::new(Notify::new());
    let release = Arc::new(Notify::new());
    let (_tmp, app) = app_with(Arc::new(GatedSource {
        reached: reached.clone(),
        release: release.clone(),
    }))
    .await;
    register_shop(&app).await;

    let extraction = tokio::spawn({
        let app = app.clone();
        async move { send(&app, "GET", "/v1/extract/db/servers/src/databases/shop/tables", None).await }
    });
    reached.notified().await;
    let job_id = running_job(&app, "extract_database").await;
    let (status, _) = send(&app, "POST", &format!("/v1/jobs/{}/cancel", job_id), None).await;
    assert_eq!(status, StatusCode::ACCEPTED);
    release.notify_one();

    let (status, body) = extraction.await.unwrap();
    assert_eq!(status, StatusCode::MULTI_STATUS);
    let details = &body["error"]["details"];
    assert_eq!(details["cancelled"], true);
    let statuses: Vec<&str> = details["items"]
        .as_array()
        .unwrap()
        .iter()
        .map(|i| i["status"].as_str().unwrap())
        .collect();
    assert_eq!(statuses, vec!["succeeded", "succeeded", "not_attempted"]);
    let (status, _) = get_object(&app, "etl-staging", "src.shop", "t3.csv").await;
    assert_eq!(status, StatusCode::NOT_FOUND);

    let (_, job) = send(&app, "GET", &format!("/v1/jobs/{}", job_id), None).await;
    assert_eq!(job["result"]["status"], "cancelled");
}

#[tokio::test]
async fn extract_missing_table_writes_nothing() {
    let (_tmp, app) = app_with(Arc::new(FlakySource)).await;
    register_shop(&app).await;

    let (status, body) = send(&app, "GET", "/v1/extract/db/servers/src/databases/shop/tables/t9", None).await;
    assert_eq!(status, StatusCode::NOT_FOUND);
    assert_eq!(error_kind(&body), "NotFound");
    let (status, _) = get_object(&app, "etl-staging", "src.shop", "t9.csv").await;
    assert_eq!(status, StatusCode::NOT_FOUND);

    let (status, body) = send(&app, "GET", "/v1/extract/db/servers/src/databases/shop/tables/t1", None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["result"]["rows"], 2);
}

#[tokio::test]
async fn extract_from_unknown_server_is_not_found() {
    let (_tmp, app) = app().await;
    let (status, body) = send(&app, "GET", "/v1/extract/db/servers/nope/databases/shop/tables", None).await;
    assert_eq!(status, StatusCode::NOT_FOUND);
    assert_eq!(error_kind(&body), "NotFound");
}

#[tokio::test]
async fn extract_csv_file_via_multipart() {
    let (_tmp, app) = app().await;
    let boundary = "XBOUNDARYX";
    let body = format!(
        "--{b}\r\nContent-Disposition: form-data; name=\"file\"; filename=\"prices.csv\"\r\n\
         Content-Type: text/csv\r\n\r\nsku,price\nA1,2.5\nB2,4\n\r\n--{b}--\r\n",
        b = boundary
    );
    let req = Request::builder()
        .method("POST")
        .uri("/v1/extract/csv?folder=uploads")
        .header(header::CONTENT_TYPE, format!("multipart/form-data; boundary={}", boundary))
        .body(Body::from(body))
        .unwrap();
    let (status, bytes) = call(&app, req).await;
    assert_eq!(status, StatusCode::CREATED, "{}", String::from_utf8_lossy(&bytes));
    let value: Value = serde_json::from_slice(&bytes).unwrap();
    assert_eq!(value["result"]["rows"], 2);
    assert_eq!(value["result"]["columns"], json!(["sku", "price"]));

    let (status, bytes) = get_object(&app, "etl-staging", "uploads", "prices.csv").await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(bytes, b"sku,price\nA1,2.5\nB2,4\n");
}

#[tokio::test]
async fn unknown_file_kind_is_unsupported() {
    let (_tmp, app) = app().await;
    let req = Request::builder()
        .method("POST")
        .uri("/v1/extract/parquet")
        .header(header::CONTENT_TYPE, "multipart/form-data; boundary=B")
        .body(Body::from("--B--\r\n"))
        .unwrap();
    let (status, bytes) = call(&app, req).await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    let value: Value = serde_json::from_slice(&bytes).unwrap();
    assert_eq!(error_kind(&value), "UnsupportedOperation");
}

// ============ Staging ============

#[tokio::test]
async fn uploads_create_versions() {
    let (_tmp, app) = app().await;
    staging_folder(&app, "raw", "in").await;
    put_object(&app, "raw", "in", "a.csv", b"x\n1\n").await;
    put_object(&app, "raw", "in", "a.csv", b"x\n2\n").await;

    let (_, body) = send(&app, "GET", "/v1/staging/s3/buckets/raw/folders/in/objects/a.csv/versions", None).await;
    assert_eq!(body["result"].as_array().unwrap().len(), 2);
    let (_, latest) = get_object(&app, "raw", "in", "a.csv").await;
    assert_eq!(latest, b"x\n2\n");
    let req = Request::builder()
        .uri("/v1/staging/s3/buckets/raw/folders/in/objects/a.csv?version=1")
        .body(Body::empty())
        .unwrap();
    let (_, first) = call(&app, req).await;
    assert_eq!(first, b"x\n1\n");

    let (status, body) = send(&app, "DELETE", "/v1/staging/s3/buckets/raw", None).await;
    assert_eq!(status, StatusCode::CONFLICT);
    assert_eq!(error_kind(&body), "Conflict");
    let (status, _) = send(&app, "DELETE", "/v1/staging/s3/buckets/raw?force=true", None).await;
    assert_eq!(status, StatusCode::OK);
    let (status, _) = send(&app, "GET", "/v1/staging/s3/buckets/raw", None).await;
    assert_eq!(status, StatusCode::NOT_FOUND);
}

#[tokio::test]
async fn bad_bucket_name_is_invalid() {
    let (_tmp, app) = app().await;
    let (status, body) = send(&app, "POST", "/v1/staging/s3/buckets", Some(json!({"bucket_name": "Bad_Name"}))).await;
    assert_eq!(status, StatusCode::UNPROCESSABLE_ENTITY);
    assert_eq!(error_kind(&body), "InvalidParams");
}

// ============ Transformation ============

#[tokio::test]
async fn unknown_op_leaves_artifact_untouched() {
    let (_tmp, app) = app().await;
    staging_folder(&app, "raw", "in").await;
    let original = b"name,price\npen,2.5\nink,7\n";
    put_object(&app, "raw", "in", "items.csv", original).await;

    let (status, body) = send(
        &app,
        "POST",
        "/v1/transform/df/staging/buckets/raw/folders/in",
        Some(json!({"df": "items.csv", "op": "pivot", "params": "name"})),
    )
    .await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(error_kind(&body), "UnsupportedOperation");

    let (_, bytes) = get_object(&app, "raw", "in", "items.csv").await;
    assert_eq!(bytes, original);
    let (_, versions) = send(&app, "GET", "/v1/staging/s3/buckets/raw/folders/in/objects/items.csv/versions", None).await;
    assert_eq!(versions["result"].as_array().unwrap().len(), 1);
}

#[tokio::test]
async fn untouched_columns_keep_their_text() {
    let (_tmp, app) = app().await;
    staging_folder(&app, "raw", "in").await;
    put_object(&app, "raw", "in", "accounts.csv", b"account,price,delta,note\n12345678901234567890,2.50,+5,x\n007,1e3,-0,y\n").await;
    let (status, _) = send(
        &app,
        "POST",
        "/v1/transform/df/staging/buckets/raw/folders/in",
        Some(json!({"df": "accounts", "op": "drop", "params": {"columns": ["note"]}})),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    let (_, bytes) = get_object(&app, "raw", "in", "accounts.csv").await;
    assert_eq!(bytes, b"account,price,delta\n12345678901234567890,2.50,+5\n007,1e3,-0\n");
}

#[tokio::test]
async fn concurrent_tabular_transforms_are_serialized() {
    let (_tmp, app) = app().await;
    staging_folder(&app, "raw", "in").await;
    put_object(&app, "raw", "in", "wide.csv", b"a,b,c\n1,2,3\n4,5,6\n").await;

    let drop_a = send(
        &app,
        "POST",
        "/v1/transform/df/staging/buckets/raw/folders/in",
        Some(json!({"df": "wide", "op": "drop", "params": ["a"]})),
    );
    let drop_b = send(
        &app,
        "POST",
        "/v1/transform/df/staging/buckets/raw/folders/in",
        Some(json!({"df": "wide", "op": "drop", "params": ["b"]})),
    );
    let ((s1, _), (s2, _)) = tokio::join!(drop_a, drop_b);
    assert_eq!(s1, StatusCode::OK);
    assert_eq!(s2, StatusCode::OK);

    let (_, bytes) = get_object(&app, "raw", "in", "wide.csv").await;
    assert_eq!(bytes, b"c\n3\n6\n");
    let (_, versions) = send(&app, "GET", "/v1/staging/s3/buckets/raw/folders/in/objects/wide.csv/versions", None).await;
    assert_eq!(versions["result"].as_array().unwrap().len(), 3);
}

#[tokio::test]
async fn relational_transform_rejects_reads() {
    let (_tmp, app) = app_with(Arc::new(FlakySource)).await;
    register_shop(&app).await;
    send(&app, "GET", "/v1/extract/db/servers/src/databases/shop/tables/t1", None).await;

    let (status, body) = send(
        &app,
        "POST",
        "/v1/transform/db/servers/src/databases/shop",
        Some(json!({"sql": "SELECT * FROM t1"})),
    )
    .await;
    assert_eq!(status, StatusCode::FORBIDDEN);
    assert_eq!(error_kind(&body), "Forbidden");

    let (status, body) = send(
        &app,
        "POST",
        "/v1/transform/db/servers/src/databases/shop",
        Some(json!({"sql": "UPDATE t1 SET id = id * 10"})),
    )
    .await;
    assert_eq!(status, StatusCode::OK, "{}", body);
    let (_, bytes) = get_object(&app, "etl-staging", "src.shop", "t1.csv").await;
    assert_eq!(bytes, b"id\n10\n20\n");
}

// ============ Warehouse and queries ============

async fn warehouse_with_orders(app: &Router) {
    staging_folder(app, "raw", "in").await;
    put_object(app, "raw", "in", "orders.csv", b"id,item,qty\n1,pen,3\n2,ink,1\n3,pad,5\n").await;
    let (status, _) = send(app, "POST", "/v1/load/dw/databases", Some(json!({"database_name": "dw"}))).await;
    assert_eq!(status, StatusCode::CREATED);
    let (status, _) = send(
        app,
        "POST",
        "/v1/load/dw/databases/dw/tables",
        Some(json!({"table_name": "orders"})),
    )
    .await;
    assert_eq!(status, StatusCode::CREATED);
}

#[tokio::test]
async fn loading_twice_doubles_rows() {
    let (_tmp, app) = app().await;
    warehouse_with_orders(&app).await;

    for _ in 0..2 {
        let (status, body) = send(
            &app,
            "POST",
            "/v1/load/dw/databases/dw/tables/orders",
            Some(json!({"load_file": "s3://raw/in/orders.csv"})),
        )
        .await;
        assert_eq!(status, StatusCode::OK, "{}", body);
        assert_eq!(body["result"]["rows_loaded"], 3);
    }

    let (status, body) = send(
        &app,
        "POST",
        "/v1/query/dw/databases/dw",
        Some(json!({"sql": "SELECT COUNT(*) AS n FROM orders"})),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["result"]["rows"], json!([[6]]));

    let (_, table) = send(&app, "GET", "/v1/load/dw/databases/dw/tables/orders", None).await;
    assert_eq!(table["result"]["row_count"], 6);
    assert_eq!(table["result"]["loads"].as_array().unwrap().len(), 2);
}

#[tokio::test]
async fn revert_undoes_one_load() {
    let (_tmp, app) = app().await;
    warehouse_with_orders(&app).await;
    let (_, first) = send(
        &app,
        "POST",
        "/v1/load/dw/databases/dw/tables/orders",
        Some(json!({"load_file": "raw/in/orders.csv", "flags": "mode=bulk batch_size=2"})),
    )
    .await;
    let job = first["result"]["job_id"].as_str().unwrap().to_string();

    let uri = format!("/v1/load/dw/databases/dw/tables/orders/loads/{}/revert", job);
    let (status, body) = send(&app, "POST", &uri, None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["result"]["rows_deleted"], 3);
    let (status, body) = send(&app, "POST", &uri, None).await;
    assert_eq!(status, StatusCode::CONFLICT);
    assert_eq!(error_kind(&body), "Conflict");
}

#[tokio::test]
async fn cancelled_bulk_load_writes_nothing() {
    let (_tmp, app) = app().await;
    warehouse_with_orders(&app).await;
    let mut big = String::from("id,item,qty\n");
    for i in 0..20_000 {
        big.push_str(&format!("{},item{},1\n", i, i));
    }
    put_object(&app, "raw", "in", "big.csv", big.as_bytes()).await;

    let load = tokio::spawn({
        let app = app.clone();
        async move {
            send(
                &app,
                "POST",
                "/v1/load/dw/databases/dw/tables/orders",
                Some(json!({"load_file": "raw/in/big.csv", "flags": "mode=bulk batch_size=1"})),
            )
            .await
        }
    });
    let job_id = running_job(&app, "load_table").await;
    let (status, _) = send(&app, "POST", &format!("/v1/jobs/{}/cancel", job_id), None).await;
    assert_eq!(status, StatusCode::ACCEPTED);

    let (status, body) = load.await.unwrap();
    assert_eq!(status, StatusCode::CONFLICT);
    assert_eq!(error_kind(&body), "Cancelled");
    let (_, body) = send(
        &app,
        "POST",
        "/v1/query/dw/databases/dw",
        Some(json!({"sql": "SELECT COUNT(*) FROM orders"})),
    )
    .await;
    assert_eq!(body["result"]["rows"], json!([[0]]));
    let (_, job) = send(&app, "GET", &format!("/v1/jobs/{}", job_id), None).await;
    assert_eq!(job["result"]["status"], "cancelled");
}

#[tokio::test]
async fn headers_with_spaces_load_as_quoted_columns() {
    let (_tmp, app) = app().await;
    staging_folder(&app, "raw", "in").await;
    put_object(&app, "raw", "in", "prices.csv", b"sku,unit price\nA1,2.5\nB2,4\n").await;
    send(&app, "POST", "/v1/load/dw/databases", Some(json!({"database_name": "dw"}))).await;
    send(
        &app,
        "POST",
        "/v1/load/dw/databases/dw/tables",
        Some(json!({"table_name": "prices"})),
    )
    .await;

    let (status, body) = send(
        &app,
        "POST",
        "/v1/load/dw/databases/dw/tables/prices",
        Some(json!({"load_file": "raw/in/prices.csv"})),
    )
    .await;
    assert_eq!(status, StatusCode::OK, "{}", body);
    let (_, body) = send(
        &app,
        "POST",
        "/v1/query/dw/databases/dw",
        Some(json!({"sql": "SELECT SUM(\"unit price\") AS total FROM prices"})),
    )
    .await;
    assert_eq!(body["result"]["rows"], json!([[6.5]]));
}

#[tokio::test]
async fn query_rejects_writes_and_reads_current_state() {
    let (_tmp, app) = app().await;
    warehouse_with_orders(&app).await;
    send(
        &app,
        "POST",
        "/v1/load/dw/databases/dw/tables/orders",
        Some(json!({"load_file": "raw/in/orders.csv"})),
    )
    .await;

    let (status, body) = send(
        &app,
        "POST",
        "/v1/query/dw/databases/dw",
        Some(json!({"sql": "INSERT INTO orders VALUES (1, 'x', 1)"})),
    )
    .await;
    assert_eq!(status, StatusCode::FORBIDDEN);
    assert_eq!(error_kind(&body), "Forbidden");

    let (status, body) = send(
        &app,
        "POST",
        "/v1/query/dw/databases/dw",
        Some(json!({"sql": "SELECT * FROM orders ORDER BY id"})),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["result"]["columns"], json!(["id", "item", "qty"]));
    assert_eq!(
        body["result"]["rows"],
        json!([[1, "pen", 3], [2, "ink", 1], [3, "pad", 5]])
    );
    assert_eq!(body["result"]["truncated"], false);

    let (status, body) = send(
        &app,
        "POST",
        "/v1/query/dw/databases/dw",
        Some(json!({"sql": "SELEC oops"})),
    )
    .await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(error_kind(&body), "SyntaxError");
}

#[tokio::test]
async fn non_empty_database_needs_cascade() {
    let (_tmp, app) = app().await;
    warehouse_with_orders(&app).await;
    let (status, body) = send(&app, "DELETE", "/v1/load/dw/databases/dw", None).await;
    assert_eq!(status, StatusCode::CONFLICT);
    assert_eq!(error_kind(&body), "Conflict");
    let (status, _) = send(&app, "DELETE", "/v1/load/dw/databases/dw?cascade=true", None).await;
    assert_eq!(status, StatusCode::OK);
    let (status, _) = send(&app, "GET", "/v1/load/dw/databases/dw", None).await;
    assert_eq!(status, StatusCode::NOT_FOUND);
}

#[tokio::test]
async fn failed_atomic_load_reports_details() {
    let (_tmp, app) = app().await;
    staging_folder(&app, "raw", "in").await;
    put_object(&app, "raw", "in", "bad.csv", b"id,item\n1,pen\n2,\n").await;
    send(&app, "POST", "/v1/load/dw/databases", Some(json!({"database_name": "dw"}))).await;
    send(
        &app,
        "POST",
        "/v1/load/dw/databases/dw/tables",
        Some(json!({"table_name": "items", "columns": [
            {"name": "id", "type": "integer", "nullable": false},
            {"name": "item", "type": "text", "nullable": false}
        ]})),
    )
    .await;

    let (status, body) = send(
        &app,
        "POST",
        "/v1/load/dw/databases/dw/tables/items",
        Some(json!({"load_file": "raw/in/bad.csv"})),
    )
    .await;
    assert_eq!(status, StatusCode::INTERNAL_SERVER_ERROR);
    assert_eq!(error_kind(&body), "LoadFailed");
    let details = &body["error"]["details"];
    assert_eq!(details["rows_loaded"], 0);
    assert_eq!(details["rows_total"], 2);
    assert_eq!(details["retained"], false);
}

// ============ Misc ============

#[tokio::test]
async fn health_and_malformed_json() {
    let (_tmp, app) = app().await;
    let (status, body) = send(&app, "GET", "/health", None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["status"], "ok");

    let req = Request::builder()
        .method("POST")
        .uri("/v1/load/dw/databases")
        .header(header::CONTENT_TYPE, "application/json")
        .body(Body::from("{not json"))
        .unwrap();
    let (status, bytes) = call(&app, req).await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    let value: Value = serde_json::from_slice(&bytes).unwrap();
    assert_eq!(error_kind(&value), "MalformedInput");

    let (status, body) = send(&app, "GET", "/v1/jobs?status=bogus", None).await;
    assert_eq!(status, StatusCode::UNPROCESSABLE_ENTITY);
    assert_eq!(error_kind(&body), "InvalidParams");
}
