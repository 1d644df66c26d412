//! SCD-2 symbol-master writer.
//!
//! Consumes externally produced diff tables (`diff_insert` / `diff_update` /
//! `diff_unchanged`) against a snapshot and maintains a slowly-changing
//! dimension of symbol versions, materialized as hive-partitioned Parquet.

pub mod duckdb;
pub mod error;
pub mod models;
pub mod writer;

pub use duckdb::{open_database, open_in_memory};
pub use error::ScdError;
pub use models::{DiffRow, ScdStats, SymbolVersion};
pub use writer::{ScdConfig, ScdWriter};
