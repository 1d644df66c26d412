use serde::Serialize;
use time::Date;

/// One version of one symbol in the master dimension.
///
/// Versions for a natural key partition the timeline: version N's `valid_to`
/// equals version N+1's `valid_from` minus one day, and at most one version
/// per key is open (`valid_to` is `None`).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SymbolVersion {
    /// Sequential across the whole dataset, immutable once assigned.
    pub id: i64,
    /// Stable business identifier, e.g. `AAPL-NASDAQ`.
    pub natural_key: String,
    pub company_name: String,
    pub exchange: String,
    pub sector: Option<String>,
    pub currency: String,
    pub valid_from: Date,
    /// `None` marks the current version.
    pub valid_to: Option<Date>,
    pub created_at: Date,
    /// Snapshot date that produced this version.
    pub as_of: Date,
}

impl SymbolVersion {
    pub fn is_open(&self) -> bool {
        self.valid_to.is_none()
    }
}

/// Descriptive attributes of one diff row. The diff step upstream labels rows
/// as insert/update/unchanged; this carries only the attributes themselves.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DiffRow {
    pub natural_key: String,
    pub company_name: String,
    pub exchange: String,
    pub sector: Option<String>,
    pub currency: String,
}

/// Outcome statistics of one writer run. `dry_run` yields the same numbers
/// while leaving the dataset untouched.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct ScdStats {
    pub rows_inserted: u64,
    pub rows_updated: u64,
    pub rows_closed: u64,
    pub files_written: u64,
}

impl ScdStats {
    pub fn is_noop(&self) -> bool {
        self.rows_inserted == 0 && self.rows_updated == 0 && self.rows_closed == 0
    }
}
