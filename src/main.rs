//! # ETL Harness CLI (`etl`)
//!
//! The `etl` binary starts the HTTP API and drives the pipeline from the
//! command line.
//!
//! ## Usage
//!
//! ```bash
//! etl --config ./config/etl.toml <command>
//! ```
//!
//! ## Commands
//!
//! | Command | Description |
//! |---------|-------------|
//! | `etl init` | Create the catalog database and run schema migrations |
//! | `etl serve` | Start the HTTP API |
//! | `etl servers list\|add\|remove` | Manage source server profiles |
//! | `etl stage <file>` | Upload a local file into the staging store |
//! | `etl extract <server> <database>` | Stage tables of a source database |
//! | `etl dw create\|table` | Create warehouse databases and tables |
//! | `etl load <database> <table> <file>` | Load a staged CSV into a table |
//! | `etl query <database> "<sql>"` | Run a read-only query |
//! | `etl jobs` | List recent jobs |
//!
//! Results are printed to stdout as JSON; diagnostics go to stderr through
//! `tracing` (set `RUST_LOG` to adjust).

use clap::{Parser, Subcommand};
use serde::Serialize;
use serde_json::Value;
use std::path::PathBuf;
use tracing_subscriber::EnvFilter;

use etl_harness::app::AppContext;
use etl_harness::config;
use etl_harness::extraction::Extractor;
use etl_harness::jobs::JobStatus;
use etl_harness::migrate;
use etl_harness::server;
use etl_harness_core::models::{ObjectKey, ServerConfig, SourceDriver};
use etl_harness_core::options::ExtractPolicy;

/// ETL Harness CLI: staging, extraction, transformation, warehouse loads
/// and queries behind one HTTP API.
///
/// All commands accept a `--config` flag pointing to a TOML configuration
/// file. See `config/etl.example.toml` for a full example.
#[derive(Parser)]
#[command(name = "etl", about = "ETL Harness: extract, stage, transform, load and query", version)]
struct Cli {
    /// Path to configuration file (TOML).
    #[arg(long, global = true, default_value = "./config/etl.toml")]
    config: PathBuf,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Initialize the catalog schema. Idempotent.
    Init,

    /// Start the HTTP API on `[server].bind`.
    Serve,

    /// Manage source database server profiles.
    Servers {
        #[command(subcommand)]
        action: ServersAction,
    },

    /// Upload a local file into the staging store as a new version.
    Stage {
        /// Local file to upload.
        path: PathBuf,
        /// Target bucket (defaults to `[extraction].bucket`).
        #[arg(long)]
        bucket: Option<String>,
        /// Target folder (defaults to `[extraction].files_folder`).
        #[arg(long)]
        folder: Option<String>,
        /// Object name (defaults to the file name).
        #[arg(long)]
        name: Option<String>,
    },

    /// Stage the tables of a source database as CSV artifacts.
    Extract {
        server: String,
        database: String,
        /// Extract only this table.
        #[arg(long)]
        table: Option<String>,
        /// What to do after a table fails: `continue` or `stop`.
        #[arg(long)]
        on_error: Option<String>,
    },

    /// Manage warehouse databases and tables.
    Dw {
        #[command(subcommand)]
        action: DwAction,
    },

    /// Append a staged CSV (`bucket/folder/object`) to a warehouse table.
    Load {
        database: String,
        table: String,
        load_file: String,
        /// Load flags, e.g. `"mode=bulk batch_size=500 -s ';'"`.
        #[arg(long)]
        flags: Option<String>,
    },

    /// Run one read-only SQL statement against a warehouse database.
    Query {
        database: String,
        sql: String,
        /// Maximum rows to return.
        #[arg(long)]
        max_rows: Option<usize>,
    },

    /// List recent jobs.
    Jobs {
        /// Only jobs with this status.
        #[arg(long)]
        status: Option<String>,
        #[arg(long, default_value = "20")]
        limit: i64,
    },
}

#[derive(Subcommand)]
enum ServersAction {
    /// List registered servers.
    List,
    /// Register a server profile.
    Add {
        name: String,
        #[arg(long)]
        host: String,
        #[arg(long, default_value = "3306")]
        port: u16,
        #[arg(long)]
        user: String,
        #[arg(long, default_value = "")]
        password: String,
        /// `mysql` or `sqlite` (host is then a directory of database files).
        #[arg(long, default_value = "mysql")]
        driver: String,
    },
    /// Remove a server profile.
    Remove { name: String },
}

#[derive(Subcommand)]
enum DwAction {
    /// Create a warehouse database.
    Create {
        name: String,
        #[arg(long)]
        engine: Option<String>,
    },
    /// Create a table whose schema is adopted from its first load.
    Table { database: String, table: String },
}

fn print_json<T: Serialize>(value: &T) -> anyhow::Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("etl_harness=info")),
        )
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();
    let cfg = config::load_config(&cli.config)?;

    match cli.command {
        Commands::Init => {
            migrate::run_migrations(&cfg).await?;
            println!("Database initialized successfully.");
        }
        Commands::Serve => {
            server::run_server(&cfg).await?;
        }
        Commands::Servers { action } => {
            let ctx = AppContext::from_config(&cfg).await?;
            match action {
                ServersAction::List => print_json(&ctx.registry.list().await?)?,
                ServersAction::Add {
                    name,
                    host,
                    port,
                    user,
                    password,
                    driver,
                } => {
                    let info = ctx
                        .registry
                        .create(ServerConfig {
                            server_name: name,
                            host,
                            port,
                            user,
                            password,
                            driver: SourceDriver::parse(&driver)?,
                        })
                        .await?;
                    print_json(&info)?;
                }
                ServersAction::Remove { name } => {
                    ctx.registry.delete(&name).await?;
                    println!("Removed server '{}'.", name);
                }
            }
        }
        Commands::Stage {
            path,
            bucket,
            folder,
            name,
        } => {
            let ctx = AppContext::from_config(&cfg).await?;
            let bucket = bucket.unwrap_or_else(|| cfg.extraction.bucket.clone());
            let folder = folder.unwrap_or_else(|| cfg.extraction.files_folder.clone());
            let name = match name {
                Some(n) => n,
                None => path
                    .file_name()
                    .map(|n| n.to_string_lossy().into_owned())
                    .ok_or_else(|| anyhow::anyhow!("{} has no file name", path.display()))?,
            };
            let bytes = std::fs::read(&path)?;
            ctx.staging.ensure_bucket(&bucket, &cfg.extraction.region).await?;
            ctx.staging.ensure_folder(&bucket, &folder).await?;
            let info = ctx
                .staging
                .upload(&ObjectKey::new(bucket, folder, name), bytes, None)
                .await?;
            print_json(&info)?;
        }
        Commands::Extract {
            server,
            database,
            table,
            on_error,
        } => {
            let ctx = AppContext::from_config(&cfg).await?;
            match table {
                Some(table) => print_json(&ctx.extractor.extract_table(&server, &database, &table).await?)?,
                None => {
                    let policy = on_error.as_deref().map(ExtractPolicy::parse).transpose()?;
                    let report = ctx.extractor.extract_database(&server, &database, policy).await?;
                    eprintln!(
                        "Staged {} table(s) into {}/{}",
                        report.tables.len(),
                        ctx.extractor.bucket(),
                        Extractor::database_folder(&server, &database)
                    );
                    print_json(&report)?;
                }
            }
        }
        Commands::Dw { action } => {
            let ctx = AppContext::from_config(&cfg).await?;
            match action {
                DwAction::Create { name, engine } => {
                    print_json(&ctx.warehouse.create_database(&name, engine.as_deref()).await?)?
                }
                DwAction::Table { database, table } => {
                    print_json(&ctx.warehouse.create_table(&database, &table, None).await?)?
                }
            }
        }
        Commands::Load {
            database,
            table,
            load_file,
            flags,
        } => {
            let ctx = AppContext::from_config(&cfg).await?;
            let flags = flags.map(Value::String).unwrap_or(Value::Null);
            let report = ctx
                .warehouse
                .load_table(&database, &table, &load_file, &flags)
                .await?;
            print_json(&report)?;
        }
        Commands::Query {
            database,
            sql,
            max_rows,
        } => {
            let ctx = AppContext::from_config(&cfg).await?;
            let options = serde_json::json!({ "max_rows": max_rows });
            print_json(&ctx.query.query(&database, &sql, &options).await?)?;
        }
        Commands::Jobs { status, limit } => {
            let ctx = AppContext::from_config(&cfg).await?;
            let status = status.as_deref().map(JobStatus::parse).transpose()?;
            print_json(&ctx.jobs.list(status, limit).await?)?;
        }
    }

    Ok(())
}
