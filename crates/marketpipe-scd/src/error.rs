use thiserror::Error;

#[derive(Debug, Error)]
pub enum ScdError {
    #[error(transparent)]
    DuckDb(#[from] duckdb::Error),

    #[error(transparent)]
    Io(#[from] std::io::Error),

    /// The snapshot table is absent or carries no `as_of` dates, so there is
    /// no date to version against. Distinct from [`ScdError::DiffTableMissing`]
    /// so callers can tell "no new data" from "the diff step never ran".
    #[error("snapshot date cannot be determined from table '{table}'")]
    SnapshotDateUnknown { table: String },

    #[error("diff table '{table}' is missing or unreadable")]
    DiffTableMissing { table: String },

    /// Source data already carries a column the hive layout would shadow.
    #[error("diff column '{column}' collides with a partition column")]
    PartitionColumnCollision { column: String },

    #[error("no open version found for natural key '{natural_key}'")]
    MissingOpenVersion { natural_key: String },

    #[error("invalid date '{value}' in column '{column}'")]
    InvalidDate { column: String, value: String },
}
