use std::fs;
use std::path::{Path, PathBuf};
use std::process::Command;

use serde_json::Value;
use sqlx::sqlite::{SqliteConnectOptions, SqliteConnection};
use sqlx::{Connection, Executor};
use tempfile::TempDir;

fn setup_test_env() -> (TempDir, PathBuf) {
    let tmp = TempDir::new().unwrap();
    let root = tmp.path().to_path_buf();

    let config_dir = root.join("config");
    fs::create_dir_all(&config_dir).unwrap();
    fs::create_dir_all(root.join("sources")).unwrap();

    let files_dir = root.join("files");
    fs::create_dir_all(&files_dir).unwrap();
    fs::write(
        files_dir.join("orders.csv"),
        "id,item,qty\n1,pen,3\n2,ink,1\n",
    )
    .unwrap();

    let config_content = format!(
        r#"[db]
path = "{root}/data/etl.sqlite"

[server]
bind = "127.0.0.1:7340"

[staging]
root = "{root}/staging"

[warehouse]
root = "{root}/warehouse"

[embedding]
provider = "disabled"
"#,
        root = root.display()
    );

    let config_path = config_dir.join("etl.toml");
    fs::write(&config_path, config_content).unwrap();

    (tmp, config_path)
}

fn run_etl(config_path: &Path, args: &[&str]) -> (String, String, bool) {
    let binary = env!("CARGO_BIN_EXE_etl");
    let output = Command::new(binary)
        .arg("--config")
        .arg(config_path.to_str().unwrap())
        .args(args)
        .output()
        .unwrap_or_else(|e| panic!("Failed to run etl binary at {:?}: {}", binary, e));

    let stdout = String::from_utf8_lossy(&output.stdout).to_string();
    let stderr = String::from_utf8_lossy(&output.stderr).to_string();
    (stdout, stderr, output.status.success())
}

fn run_json(config_path: &Path, args: &[&str]) -> Value {
    let (stdout, stderr, success) = run_etl(config_path, args);
    assert!(success, "etl {:?} failed: stdout={} stderr={}", args, stdout, stderr);
    serde_json::from_str(&stdout).unwrap_or_else(|e| panic!("not JSON ({}): {}", e, stdout))
}

/// Create `<dir>/shop.sqlite` with two small tables.
fn seed_source(dir: &Path) {
    let rt = tokio::runtime::Runtime::new().unwrap();
    rt.block_on(async {
        let options = SqliteConnectOptions::new()
            .filename(dir.join("shop.sqlite"))
            .create_if_missing(true);
        let mut conn = SqliteConnection::connect_with(&options).await.unwrap();
        conn.execute(
            "CREATE TABLE customers (id INTEGER, name TEXT);
             INSERT INTO customers VALUES (1, 'Ada'), (2, 'Grace');
             CREATE TABLE orders (id INTEGER, customer_id INTEGER, total REAL);
             INSERT INTO orders VALUES (10, 1, 9.5), (11, 2, 20.0), (12, 1, 3.25);",
        )
        .await
        .unwrap();
        conn.close().await.unwrap();
    });
}

#[test]
fn test_init() {
    let (_tmp, config_path) = setup_test_env();
    let (stdout, stderr, success) = run_etl(&config_path, &["init"]);
    assert!(success, "init failed: stdout={}, stderr={}", stdout, stderr);
    assert!(stdout.contains("Database initialized successfully"));
}

#[test]
fn test_init_idempotent() {
    let (_tmp, config_path) = setup_test_env();
    let (_, _, s1) = run_etl(&config_path, &["init"]);
    let (_, _, s2) = run_etl(&config_path, &["init"]);
    assert!(s1 && s2, "init should be idempotent");
}

#[test]
fn test_missing_config_fails() {
    let tmp = TempDir::new().unwrap();
    let (_, stderr, success) = run_etl(&tmp.path().join("absent.toml"), &["init"]);
    assert!(!success);
    assert!(stderr.contains("Failed to read config file"), "{}", stderr);
}

#[test]
fn test_servers_lifecycle() {
    let (_tmp, config_path) = setup_test_env();
    run_etl(&config_path, &["init"]);

    let added = run_json(
        &config_path,
        &[
            "servers", "add", "erp", "--host", "db.internal", "--user", "etl", "--password", "s3cret",
        ],
    );
    assert_eq!(added["server_name"], "erp");
    assert_eq!(added["port"], 3306);
    assert!(added.get("password").is_none());

    let (_, _, dup) = run_etl(
        &config_path,
        &["servers", "add", "erp", "--host", "h", "--user", "u"],
    );
    assert!(!dup, "duplicate server name must fail");

    let listed = run_json(&config_path, &["servers", "list"]);
    assert_eq!(listed.as_array().unwrap().len(), 1);
    assert!(!listed.to_string().contains("s3cret"));

    let (stdout, _, success) = run_etl(&config_path, &["servers", "remove", "erp"]);
    assert!(success);
    assert!(stdout.contains("Removed server 'erp'"));
    let (_, _, again) = run_etl(&config_path, &["servers", "remove", "erp"]);
    assert!(!again, "removing a missing server must fail");
}

#[test]
fn test_stage_load_query() {
    let (tmp, config_path) = setup_test_env();
    run_etl(&config_path, &["init"]);

    let csv = tmp.path().join("files").join("orders.csv");
    let staged = run_json(
        &config_path,
        &["stage", csv.to_str().unwrap(), "--bucket", "raw", "--folder", "in"],
    );
    assert_eq!(staged["version"], 1);

    run_json(&config_path, &["dw", "create", "dw"]);
    run_json(&config_path, &["dw", "table", "dw", "orders"]);
    for _ in 0..2 {
        let report = run_json(&config_path, &["load", "dw", "orders", "raw/in/orders.csv"]);
        assert_eq!(report["rows_loaded"], 2);
    }

    let result = run_json(
        &config_path,
        &["query", "dw", "SELECT COUNT(*) AS n, SUM(qty) AS q FROM orders"],
    );
    assert_eq!(result["columns"], serde_json::json!(["n", "q"]));
    assert_eq!(result["rows"], serde_json::json!([[4, 8]]));

    let (_, stderr, success) = run_etl(&config_path, &["query", "dw", "DELETE FROM orders"]);
    assert!(!success, "writes must be rejected");
    assert!(stderr.contains("forbidden"), "{}", stderr);
}

#[test]
fn test_bulk_load_with_flags() {
    let (tmp, config_path) = setup_test_env();
    run_etl(&config_path, &["init"]);

    let semi = tmp.path().join("files").join("semi.csv");
    fs::write(&semi, "a;b\n1;x\n2;y\n3;z\n").unwrap();
    run_json(
        &config_path,
        &["stage", semi.to_str().unwrap(), "--bucket", "raw", "--folder", "in"],
    );
    run_json(&config_path, &["dw", "create", "dw", "--engine", "innodb"]);
    run_json(&config_path, &["dw", "table", "dw", "semi"]);

    let report = run_json(
        &config_path,
        &[
            "load", "dw", "semi", "s3://raw/in/semi.csv", "--flags", "mode=bulk batch_size=2 -s ';'",
        ],
    );
    assert_eq!(report["mode"], "bulk");
    assert_eq!(report["rows_loaded"], 3);

    let result = run_json(&config_path, &["query", "dw", "SELECT b FROM semi ORDER BY a"]);
    assert_eq!(result["rows"], serde_json::json!([["x"], ["y"], ["z"]]));
}

#[test]
fn test_extract_sqlite_source() {
    let (tmp, config_path) = setup_test_env();
    run_etl(&config_path, &["init"]);
    let sources = tmp.path().join("sources");
    seed_source(&sources);

    run_json(
        &config_path,
        &[
            "servers",
            "add",
            "local",
            "--host",
            sources.to_str().unwrap(),
            "--user",
            "etl",
            "--driver",
            "sqlite",
        ],
    );

    let (stdout, stderr, success) = run_etl(&config_path, &["extract", "local", "shop"]);
    assert!(success, "extract failed: stdout={} stderr={}", stdout, stderr);
    assert!(stderr.contains("Staged 2 table(s) into etl-staging/local.shop"), "{}", stderr);
    let report: Value = serde_json::from_str(&stdout).unwrap();
    let tables: Vec<&str> = report["tables"]
        .as_array()
        .unwrap()
        .iter()
        .map(|t| t["table"].as_str().unwrap())
        .collect();
    assert_eq!(tables, vec!["customers", "orders"]);

    let single = run_json(&config_path, &["extract", "local", "shop", "--table", "orders"]);
    assert_eq!(single["rows"], 3);
    assert_eq!(single["artifact"]["version"], 2);

    let (_, _, missing) = run_etl(&config_path, &["extract", "local", "shop", "--table", "nope"]);
    assert!(!missing);

    run_json(&config_path, &["dw", "create", "dw"]);
    run_json(&config_path, &["dw", "table", "dw", "orders"]);
    run_json(
        &config_path,
        &["load", "dw", "orders", "etl-staging/local.shop/orders.csv"],
    );
    let result = run_json(
        &config_path,
        &["query", "dw", "SELECT customer_id, SUM(total) FROM orders GROUP BY customer_id ORDER BY customer_id"],
    );
    assert_eq!(result["rows"], serde_json::json!([[1, 12.75], [2, 20.0]]));

    let jobs = run_json(&config_path, &["jobs", "--status", "succeeded"]);
    assert!(jobs.as_array().unwrap().len() >= 3);
}
