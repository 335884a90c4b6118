//! # ETL Harness Core
//!
//! Runtime-free logic for ETL Harness: the error taxonomy, data models,
//! tabular frames and their CSV codec, transformation descriptors, SQL
//! statement classification, the blob store trait, text chunking, and the
//! hashing document vectorizer.
//!
//! This crate contains no tokio, sqlx, filesystem I/O, or HTTP code. The
//! `etl-harness` application crate wires these pieces to real storage.

pub mod chunk;
pub mod embedding;
pub mod error;
pub mod frame;
pub mod models;
pub mod options;
pub mod sql;
pub mod store;
pub mod transform;

pub use error::{EtlError, ErrorKind, Result};
