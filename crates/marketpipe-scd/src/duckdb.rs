//! `DuckDB` connection helpers.
//!
//! Connections are opened by the caller and passed explicitly into the writer;
//! there is no process-global cached connection.

use std::path::Path;

use ::duckdb::Connection;

use crate::error::ScdError;

/// Open (or create) a database file and apply baseline settings.
pub fn open_database(path: &Path) -> Result<Connection, ScdError> {
    let connection = Connection::open(path)?;
    connection.execute_batch("PRAGMA disable_progress_bar;")?;
    Ok(connection)
}

/// Open an in-memory database, mainly for staging-only runs and tests.
pub fn open_in_memory() -> Result<Connection, ScdError> {
    let connection = Connection::open_in_memory()?;
    connection.execute_batch("PRAGMA disable_progress_bar;")?;
    Ok(connection)
}

/// Whether a table is visible to the connection's default catalog.
pub(crate) fn table_exists(connection: &Connection, table: &str) -> Result<bool, ScdError> {
    let count: i64 = connection.query_row(
        "SELECT COUNT(*) FROM information_schema.tables WHERE table_name = ?",
        [table],
        |row| row.get(0),
    )?;
    Ok(count > 0)
}

/// Column names of a table, lowercased for comparison.
pub(crate) fn table_columns(
    connection: &Connection,
    table: &str,
) -> Result<Vec<String>, ScdError> {
    let mut statement = connection.prepare(
        "SELECT column_name FROM information_schema.columns WHERE table_name = ? ORDER BY ordinal_position",
    )?;
    let columns = statement
        .query_map([table], |row| row.get::<_, String>(0))?
        .collect::<Result<Vec<_>, _>>()?;
    Ok(columns.into_iter().map(|c| c.to_ascii_lowercase()).collect())
}
