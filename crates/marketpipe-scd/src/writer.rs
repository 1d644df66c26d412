use std::collections::{BTreeMap, BTreeSet};
use std::fs;
use std::path::{Path, PathBuf};

use ::duckdb::{params, Connection};
use time::macros::format_description;
use time::Date;

use crate::duckdb::{table_columns, table_exists};
use crate::error::ScdError;
use crate::models::{DiffRow, ScdStats, SymbolVersion};

const DATE_FORMAT: &[time::format_description::FormatItem<'_>] =
    format_description!("[year]-[month]-[day]");

/// Columns the hive layout reserves for itself.
const PARTITION_COLUMNS: [&str; 2] = ["year", "month"];

const PART_FILE: &str = "part-0.parquet";
const STAGE_TABLE: &str = "scd_stage";

/// Table names and dataset location for one writer instance.
#[derive(Debug, Clone)]
pub struct ScdConfig {
    pub snapshot_table: String,
    pub diff_insert_table: String,
    pub diff_update_table: String,
    pub diff_unchanged_table: String,
    pub output_root: PathBuf,
}

impl ScdConfig {
    pub fn new(output_root: impl Into<PathBuf>) -> Self {
        Self {
            snapshot_table: String::from("symbol_snapshot"),
            diff_insert_table: String::from("diff_insert"),
            diff_update_table: String::from("diff_update"),
            diff_unchanged_table: String::from("diff_unchanged"),
            output_root: output_root.into(),
        }
    }
}

/// SCD-2 symbol-master writer.
///
/// Consumes the three diff tables produced by the upstream snapshot diff and
/// materializes the versioned master as hive-partitioned Parquet under
/// `output_root/year=YYYY/month=MM/`. Single-writer by contract: the caller
/// owns the connection and isolates concurrent runs.
pub struct ScdWriter {
    config: ScdConfig,
}

impl ScdWriter {
    pub fn new(config: ScdConfig) -> Self {
        Self { config }
    }

    /// Apply one snapshot's diffs to the persisted master.
    ///
    /// The Parquet write is the sole side effect and the transaction boundary:
    /// every partition is first written to a temp file, and renames happen only
    /// after all writes succeed. With `dry_run` the same statistics are
    /// computed but nothing touches the dataset.
    pub fn run_scd_update(
        &self,
        connection: &Connection,
        dry_run: bool,
    ) -> Result<ScdStats, ScdError> {
        let snapshot_date = self.snapshot_date(connection)?;

        let diff_tables = [
            &self.config.diff_insert_table,
            &self.config.diff_update_table,
            &self.config.diff_unchanged_table,
        ];
        for table in diff_tables {
            if !table_exists(connection, table)? {
                return Err(ScdError::DiffTableMissing {
                    table: table.clone(),
                });
            }
        }
        for table in diff_tables {
            for column in table_columns(connection, table)? {
                if PARTITION_COLUMNS.contains(&column.as_str()) {
                    return Err(ScdError::PartitionColumnCollision { column });
                }
            }
        }

        let inserts = read_diff_rows(connection, &self.config.diff_insert_table)?;
        let updates = read_diff_rows(connection, &self.config.diff_update_table)?;

        let mut stats = ScdStats::default();
        if inserts.is_empty() && updates.is_empty() {
            return Ok(stats);
        }

        let prior = self.read_master(connection)?;
        let mut next_id = prior.iter().map(|v| v.id).max().unwrap_or(0) + 1;

        let mut open_by_key: BTreeMap<&str, &SymbolVersion> = BTreeMap::new();
        for version in prior.iter().filter(|v| v.is_open()) {
            open_by_key.insert(version.natural_key.as_str(), version);
        }

        let closed_on = snapshot_date
            .previous_day()
            .ok_or_else(|| ScdError::InvalidDate {
                column: String::from("as_of"),
                value: snapshot_date.to_string(),
            })?;

        // Closed rows keep their original id; the new open version gets a
        // fresh one. Updates are id-assigned before inserts.
        let mut superseded: BTreeSet<i64> = BTreeSet::new();
        let mut replacements: Vec<SymbolVersion> = Vec::new();
        let mut fresh: Vec<SymbolVersion> = Vec::new();

        for row in &updates {
            let open = open_by_key.get(row.natural_key.as_str()).copied().ok_or(
                ScdError::MissingOpenVersion {
                    natural_key: row.natural_key.clone(),
                },
            )?;
            superseded.insert(open.id);
            let mut closed = open.clone();
            closed.valid_to = Some(closed_on);
            replacements.push(closed);

            fresh.push(open_version(next_id, row, snapshot_date));
            next_id += 1;
        }
        for row in &inserts {
            fresh.push(open_version(next_id, row, snapshot_date));
            next_id += 1;
        }

        stats.rows_updated = updates.len() as u64;
        stats.rows_closed = updates.len() as u64;
        stats.rows_inserted = inserts.len() as u64;

        let mut partitions: BTreeSet<(i32, u8)> = BTreeSet::new();
        for version in replacements.iter().chain(fresh.iter()) {
            partitions.insert(partition_of(version.valid_from));
        }
        stats.files_written = partitions.len() as u64;

        if dry_run {
            return Ok(stats);
        }

        // Affected partitions are rewritten wholesale: surviving prior rows
        // plus the replaced and new rows.
        let mut rows: Vec<&SymbolVersion> = prior
            .iter()
            .filter(|v| !superseded.contains(&v.id))
            .filter(|v| partitions.contains(&partition_of(v.valid_from)))
            .collect();
        rows.extend(replacements.iter());
        rows.extend(fresh.iter());

        self.write_partitions(connection, &partitions, &rows)?;
        Ok(stats)
    }

    fn snapshot_date(&self, connection: &Connection) -> Result<Date, ScdError> {
        let table = &self.config.snapshot_table;
        if !table_exists(connection, table)? {
            return Err(ScdError::SnapshotDateUnknown {
                table: table.clone(),
            });
        }
        let raw: Option<String> = connection.query_row(
            &format!("SELECT CAST(MAX(as_of) AS VARCHAR) FROM {table}"),
            [],
            |row| row.get(0),
        )?;
        match raw {
            Some(value) => parse_date("as_of", &value),
            None => Err(ScdError::SnapshotDateUnknown {
                table: table.clone(),
            }),
        }
    }

    /// Full persisted master, empty on first run.
    fn read_master(&self, connection: &Connection) -> Result<Vec<SymbolVersion>, ScdError> {
        if !dataset_has_files(&self.config.output_root) {
            return Ok(Vec::new());
        }

        let glob = sql_string(
            &self
                .config
                .output_root
                .join("*")
                .join("*")
                .join("*.parquet"),
        );
        let sql = format!(
            "SELECT id, natural_key, company_name, exchange, sector, currency, \
             CAST(valid_from AS VARCHAR), CAST(valid_to AS VARCHAR), \
             CAST(created_at AS VARCHAR), CAST(as_of AS VARCHAR) \
             FROM read_parquet('{glob}', hive_partitioning = 1)"
        );

        let mut statement = connection.prepare(&sql)?;
        let raw = statement
            .query_map([], |row| {
                Ok((
                    row.get::<_, i64>(0)?,
                    row.get::<_, String>(1)?,
                    row.get::<_, String>(2)?,
                    row.get::<_, String>(3)?,
                    row.get::<_, Option<String>>(4)?,
                    row.get::<_, String>(5)?,
                    row.get::<_, String>(6)?,
                    row.get::<_, Option<String>>(7)?,
                    row.get::<_, String>(8)?,
                    row.get::<_, String>(9)?,
                ))
            })?
            .collect::<Result<Vec<_>, _>>()?;

        let mut versions = Vec::with_capacity(raw.len());
        for (id, natural_key, company_name, exchange, sector, currency, from, to, created, as_of) in
            raw
        {
            versions.push(SymbolVersion {
                id,
                natural_key,
                company_name,
                exchange,
                sector,
                currency,
                valid_from: parse_date("valid_from", &from)?,
                valid_to: to.map(|v| parse_date("valid_to", &v)).transpose()?,
                created_at: parse_date("created_at", &created)?,
                as_of: parse_date("as_of", &as_of)?,
            });
        }
        Ok(versions)
    }

    fn write_partitions(
        &self,
        connection: &Connection,
        partitions: &BTreeSet<(i32, u8)>,
        rows: &[&SymbolVersion],
    ) -> Result<(), ScdError> {
        connection.execute_batch(&format!(
            "CREATE OR REPLACE TEMP TABLE {STAGE_TABLE} ( \
             id BIGINT, natural_key VARCHAR, company_name VARCHAR, exchange VARCHAR, \
             sector VARCHAR, currency VARCHAR, valid_from VARCHAR, valid_to VARCHAR, \
             created_at VARCHAR, as_of VARCHAR, part_year INTEGER, part_month INTEGER);"
        ))?;

        let mut insert = connection.prepare(&format!(
            "INSERT INTO {STAGE_TABLE} VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)"
        ))?;
        for version in rows {
            let (year, month) = partition_of(version.valid_from);
            insert.execute(params![
                version.id,
                version.natural_key,
                version.company_name,
                version.exchange,
                version.sector,
                version.currency,
                format_date(version.valid_from)?,
                version.valid_to.map(format_date).transpose()?,
                format_date(version.created_at)?,
                format_date(version.as_of)?,
                year,
                i32::from(month),
            ])?;
        }

        let result = self.copy_partitions(connection, partitions);
        let _ = connection.execute_batch(&format!("DROP TABLE IF EXISTS {STAGE_TABLE};"));
        result
    }

    /// Copy every affected partition to a temp file, then rename all at once
    /// so a failed copy leaves the prior dataset untouched.
    fn copy_partitions(
        &self,
        connection: &Connection,
        partitions: &BTreeSet<(i32, u8)>,
    ) -> Result<(), ScdError> {
        let mut renames: Vec<(PathBuf, PathBuf)> = Vec::with_capacity(partitions.len());

        let copy_all = (|| -> Result<(), ScdError> {
            for &(year, month) in partitions {
                let dir = self
                    .config
                    .output_root
                    .join(format!("year={year}"))
                    .join(format!("month={month:02}"));
                fs::create_dir_all(&dir)?;

                let tmp = dir.join(format!("{PART_FILE}.tmp"));
                let sql = format!(
                    "COPY (SELECT id, natural_key, company_name, exchange, sector, currency, \
                     CAST(valid_from AS DATE) AS valid_from, CAST(valid_to AS DATE) AS valid_to, \
                     CAST(created_at AS DATE) AS created_at, CAST(as_of AS DATE) AS as_of \
                     FROM {STAGE_TABLE} WHERE part_year = {year} AND part_month = {month} \
                     ORDER BY id) TO '{path}' (FORMAT PARQUET)",
                    path = sql_string(&tmp),
                );
                connection.execute_batch(&sql)?;
                renames.push((tmp, dir.join(PART_FILE)));
            }
            Ok(())
        })();

        if let Err(error) = copy_all {
            for (tmp, _) in &renames {
                let _ = fs::remove_file(tmp);
            }
            return Err(error);
        }

        for (tmp, dest) in renames {
            fs::rename(tmp, dest)?;
        }
        Ok(())
    }
}

fn open_version(id: i64, row: &DiffRow, snapshot_date: Date) -> SymbolVersion {
    SymbolVersion {
        id,
        natural_key: row.natural_key.clone(),
        company_name: row.company_name.clone(),
        exchange: row.exchange.clone(),
        sector: row.sector.clone(),
        currency: row.currency.clone(),
        valid_from: snapshot_date,
        valid_to: None,
        created_at: snapshot_date,
        as_of: snapshot_date,
    }
}

/// Deterministic id assignment relies on the ordered read.
fn read_diff_rows(connection: &Connection, table: &str) -> Result<Vec<DiffRow>, ScdError> {
    let sql = format!(
        "SELECT natural_key, company_name, exchange, sector, currency \
         FROM {table} ORDER BY natural_key"
    );
    let mut statement = connection.prepare(&sql)?;
    let rows = statement
        .query_map([], |row| {
            Ok(DiffRow {
                natural_key: row.get(0)?,
                company_name: row.get(1)?,
                exchange: row.get(2)?,
                sector: row.get(3)?,
                currency: row.get(4)?,
            })
        })?
        .collect::<Result<Vec<_>, _>>()?;
    Ok(rows)
}

fn partition_of(date: Date) -> (i32, u8) {
    (date.year(), u8::from(date.month()))
}

fn parse_date(column: &str, value: &str) -> Result<Date, ScdError> {
    Date::parse(value, DATE_FORMAT).map_err(|_| ScdError::InvalidDate {
        column: column.to_owned(),
        value: value.to_owned(),
    })
}

fn format_date(date: Date) -> Result<String, ScdError> {
    date.format(DATE_FORMAT).map_err(|_| ScdError::InvalidDate {
        column: String::from("date"),
        value: date.to_string(),
    })
}

fn sql_string(path: &Path) -> String {
    path.display().to_string().replace('\'', "''")
}

fn dataset_has_files(root: &Path) -> bool {
    let Ok(years) = fs::read_dir(root) else {
        return false;
    };
    for year in years.flatten() {
        let Ok(months) = fs::read_dir(year.path()) else {
            continue;
        };
        for month in months.flatten() {
            let Ok(files) = fs::read_dir(month.path()) else {
                continue;
            };
            for file in files.flatten() {
                if file.path().extension().is_some_and(|ext| ext == "parquet") {
                    return true;
                }
            }
        }
    }
    false
}
