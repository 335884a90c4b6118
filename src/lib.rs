//! # ETL Harness
//!
//! An HTTP API for an extract-transform-load pipeline: register source
//! database servers, stage files in versioned object storage, extract
//! tables and documents into staged artifacts, transform them with SQL or
//! tabular operations, load them into a warehouse and query the result.
//!
//! ## Architecture
//!
//! ```text
//! ┌──────────┐   ┌───────────┐   ┌─────────────┐   ┌───────────┐   ┌─────────┐
//! │ Registry │──▶│ Extractor │──▶│   Staging   │──▶│ Warehouse │──▶│  Query  │
//! │ (servers)│   │ db / file │   │ blobs + cat │   │  (loads)  │   │ engine  │
//! └──────────┘   └───────────┘   └──────┬──────┘   └───────────┘   └─────────┘
//!                                       │  ▲
//!                                       ▼  │
//!                                 ┌─────────────┐
//!                                 │ Transformer │
//!                                 └─────────────┘
//! ```
//!
//! Every component shares one SQLite catalog pool, one [`locks::KeyedLocks`]
//! table and one [`jobs::JobTracker`]; [`app::AppContext`] wires them.
//!
//! ## Quick Start
//!
//! ```bash
//! etl init
//! etl servers add shop --host ./sources --driver sqlite --user etl
//! etl extract shop sales
//! etl dw create dw && etl dw table dw orders
//! etl load dw orders etl-staging/shop.sales/orders.csv
//! etl query dw "SELECT COUNT(*) FROM orders"
//! etl serve
//! ```
//!
//! ## Modules
//!
//! | Module | Purpose |
//! |--------|---------|
//! | [`config`] | TOML configuration parsing |
//! | [`db`] / [`migrate`] | Catalog connection and schema |
//! | [`registry`] | Source server profiles |
//! | [`staging`] | Versioned staging store over a [`BlobStore`](etl_harness_core::store::BlobStore) |
//! | [`blob_fs`] / [`blob_s3`] | Filesystem and S3 blob backends |
//! | [`source`] | Source database connectors |
//! | [`extract`] | File parsers (CSV, XLSX, DOCX, PDF, media sniffing) |
//! | [`extraction`] | The extractor |
//! | [`embedding`] | Document vectors |
//! | [`transform`] | Relational and tabular transforms |
//! | [`warehouse`] | Warehouse databases, tables and loads |
//! | [`query`] | Read-only queries |
//! | [`jobs`] / [`locks`] | Job records, cancellation and writer locks |
//! | [`server`] | HTTP API |

pub mod app;
pub mod blob_fs;
pub mod blob_s3;
pub mod config;
pub mod db;
pub mod embedding;
pub mod extract;
pub mod extraction;
pub mod jobs;
pub mod locks;
pub mod migrate;
pub mod query;
pub mod registry;
pub mod server;
pub mod source;
pub mod sqlite_frame;
pub mod staging;
pub mod transform;
pub mod warehouse;
