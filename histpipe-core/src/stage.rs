//! Staging loader — bulk import of raw rows into one staging table.
//!
//! All inserts for a source category run inside a single transaction,
//! committed once after the last matching file; the statement is
//! prepared once from the schema-derived insert SQL. Values are staged
//! as text exactly as parsed; coercion is the merge engine's job, so
//! malformed values are handled uniformly in one place.

use rusqlite::{params_from_iter, Connection};
use serde::Serialize;
use thiserror::Error;
use tracing::{debug, warn};

use crate::reader::{matching_files, DetectedFile, ReadError};
use crate::schema::SourceSchema;

/// Errors that abort a staging load. Everything per-file and per-row is
/// absorbed into the [`LoadReport`] instead.
#[derive(Debug, Error)]
pub enum StageError {
    #[error(transparent)]
    Read(#[from] ReadError),

    #[error("staging statement failed for '{table}': {source}")]
    Statement {
        table: String,
        source: rusqlite::Error,
    },
}

/// What one staging load did, for progress logging and the audit trail.
#[derive(Debug, Default, Clone, PartialEq, Eq, Serialize)]
pub struct LoadReport {
    /// Files the glob matched.
    pub files_matched: usize,
    /// Files fully processed.
    pub files_loaded: usize,
    /// Files skipped: unopenable, or header missing a mapped column.
    pub files_skipped: usize,
    /// Rows inserted into the staging table.
    pub rows_staged: u64,
    /// Rows dropped for having fewer fields than required.
    pub rows_skipped: u64,
    /// Records the csv parser could not decode at all.
    pub bad_records: u64,
}

/// Load every file matching the source's pattern into its staging table.
///
/// `first_skip_logged` is run-global: the very first short-row skip of
/// the whole run emits a one-shot diagnostic naming the detected
/// delimiter, the parsed and expected column counts, and the raw fields.
pub fn load_source(
    conn: &mut Connection,
    schema: &SourceSchema,
    first_skip_logged: &mut bool,
) -> Result<LoadReport, StageError> {
    let statement_err = |source| StageError::Statement {
        table: schema.staging_table().to_string(),
        source,
    };

    let files = matching_files(schema.pattern())?;
    let mut report = LoadReport {
        files_matched: files.len(),
        ..LoadReport::default()
    };
    if files.is_empty() {
        warn!(
            pattern = schema.pattern(),
            table = schema.staging_table(),
            "no files matched"
        );
        return Ok(report);
    }

    let tx = conn.transaction().map_err(statement_err)?;
    {
        let mut insert = tx.prepare(&schema.insert_sql()).map_err(statement_err)?;

        for path in &files {
            let mut file = match DetectedFile::open(path) {
                Ok(file) => file,
                Err(err) => {
                    warn!(file = %path.display(), error = %err, "skipping unreadable file");
                    report.files_skipped += 1;
                    continue;
                }
            };

            let mapper = match schema.mapper(file.header()) {
                Ok(mapper) => mapper,
                Err(err) => {
                    warn!(file = %path.display(), error = %err, "skipping file: unresolvable header");
                    report.files_skipped += 1;
                    continue;
                }
            };

            let delimiter = file.delimiter();
            let min_columns = schema.min_columns();
            let mut file_rows = 0u64;

            for record in file.records() {
                let record = match record {
                    Ok(record) => record,
                    Err(_) => {
                        report.bad_records += 1;
                        continue;
                    }
                };

                let values = if record.len() < min_columns {
                    None
                } else {
                    mapper.map(&record)
                };
                let Some(values) = values else {
                    if !*first_skip_logged {
                        *first_skip_logged = true;
                        warn!(
                            file = %path.display(),
                            delimiter = %char::from(delimiter),
                            parsed_columns = record.len(),
                            expected_min = min_columns,
                            fields = ?record.iter().collect::<Vec<_>>(),
                            "first skipped row of the run"
                        );
                    }
                    report.rows_skipped += 1;
                    continue;
                };

                insert
                    .execute(params_from_iter(values))
                    .map_err(statement_err)?;
                file_rows += 1;
            }

            report.rows_staged += file_rows;
            report.files_loaded += 1;
            debug!(file = %path.display(), rows = file_rows, "file staged");
        }
    }
    tx.commit().map_err(statement_err)?;

    Ok(report)
}
