//! Merge engine — one set-oriented pass from staging to `stock_history`.
//!
//! The join runs in SQL over `(symbol, date)` indexes built just before;
//! every value crossing into the final table goes through the host-side
//! conversion functions in [`crate::convert`]. The whole build is one
//! transaction: commit, or no final rows at all. Deduplication rides on
//! the primary key (`INSERT OR IGNORE`; the join is ordered by staging
//! insertion order, so the first staged occurrence wins).

use std::time::{Duration, Instant};

use rusqlite::types::Value;
use rusqlite::{params_from_iter, Connection};
use serde::Serialize;
use thiserror::Error;
use tracing::{debug, info};

use crate::convert::{coerce_float, reformat_date8, Coercion};
use crate::db::{execute_batch, DbError};
use crate::schema::{history_insert_sql, join_sql, SourceSchema};

/// Errors that abort the merge. All structural.
#[derive(Debug, Error)]
pub enum MergeError {
    #[error(transparent)]
    Db(#[from] DbError),

    #[error("merge statement failed: {sql}: {source}")]
    Statement { sql: String, source: rusqlite::Error },
}

/// Attach the failing SQL to an engine error; allocates only on the
/// error path.
fn stmt_err(sql: &str) -> impl Fn(rusqlite::Error) -> MergeError + '_ {
    move |source| MergeError::Statement {
        sql: sql.to_string(),
        source,
    }
}

/// Outcome counters of one merge pass.
#[derive(Debug, Default, Clone, PartialEq, Eq, Serialize)]
pub struct MergeReport {
    /// Rows written to the final table.
    pub rows_merged: u64,
    /// Joined rows dropped by primary-key dedup.
    pub duplicates_ignored: u64,
    /// Joined rows dropped for a date that is not a valid YYYYMMDD.
    pub invalid_dates: u64,
    /// Individual values nulled because they were non-blank yet unparseable.
    pub malformed_values: u64,
    /// Wall time of the join-and-insert transaction.
    pub duration: Duration,
}

/// Join the staging tables and build the final table content.
pub fn merge(
    conn: &mut Connection,
    technical: &SourceSchema,
    fundamental: &SourceSchema,
) -> Result<MergeReport, MergeError> {
    execute_batch(conn, &technical.index_ddl())?;
    execute_batch(conn, &fundamental.index_ddl())?;
    debug!("staging indexes ready");

    let select_sql = join_sql(technical, fundamental);
    let insert_sql = history_insert_sql(technical, fundamental);

    let field_count = technical.columns().count() + fundamental.columns().count();
    let started = Instant::now();
    let mut report = MergeReport::default();

    let tx = conn.transaction().map_err(stmt_err("BEGIN"))?;
    {
        let mut select = tx.prepare(&select_sql).map_err(stmt_err(&select_sql))?;
        let mut insert = tx.prepare(&insert_sql).map_err(stmt_err(&insert_sql))?;

        let mut rows = select.query([]).map_err(stmt_err(&select_sql))?;
        while let Some(row) = rows.next().map_err(stmt_err(&select_sql))? {
            let symbol: String = row.get(0).map_err(stmt_err(&select_sql))?;
            let raw_date: String = row.get(1).map_err(stmt_err(&select_sql))?;

            let date = match reformat_date8(&raw_date) {
                Ok(date) => date,
                Err(_) => {
                    report.invalid_dates += 1;
                    continue;
                }
            };

            let mut values = Vec::with_capacity(2 + field_count);
            values.push(Value::Text(symbol));
            values.push(Value::Text(date.to_string()));
            for i in 0..field_count {
                let raw: String = row.get(2 + i).map_err(stmt_err(&select_sql))?;
                let coerced = coerce_float(&raw);
                if coerced == Coercion::Malformed {
                    report.malformed_values += 1;
                }
                values.push(match coerced.as_option() {
                    Some(v) => Value::Real(v),
                    None => Value::Null,
                });
            }

            let changed = insert
                .execute(params_from_iter(values))
                .map_err(stmt_err(&insert_sql))?;
            if changed == 0 {
                report.duplicates_ignored += 1;
            } else {
                report.rows_merged += 1;
            }
        }
    }
    tx.commit().map_err(stmt_err("COMMIT"))?;

    report.duration = started.elapsed();
    info!(
        rows = report.rows_merged,
        duplicates = report.duplicates_ignored,
        invalid_dates = report.invalid_dates,
        malformed_values = report.malformed_values,
        duration_ms = report.duration.as_millis() as u64,
        "merge committed"
    );
    Ok(report)
}

/// Drop the consumed staging tables and compact the file.
///
/// Runs after the audit so staging counts are still observable there.
pub fn cleanup(
    conn: &Connection,
    technical: &SourceSchema,
    fundamental: &SourceSchema,
) -> Result<(), MergeError> {
    for schema in [technical, fundamental] {
        execute_batch(conn, &format!("DROP TABLE {}", schema.staging_table()))?;
    }
    execute_batch(conn, "VACUUM")?;
    debug!("staging space reclaimed");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::PipelineConfig;
    use crate::db;
    use crate::schema::HISTORY_TABLE;

    fn setup() -> (Connection, SourceSchema, SourceSchema) {
        let config = PipelineConfig::default();
        let tech = SourceSchema::new("technical", &config.technical);
        let fund = SourceSchema::new("fundamental", &config.fundamental);
        let conn = db::open_in_memory(64).unwrap();
        db::reset_schema(&conn, &tech, &fund).unwrap();
        (conn, tech, fund)
    }

    fn stage_tech(conn: &Connection, symbol: &str, date: &str, close: &str) {
        conn.execute(
            "INSERT INTO staging_technical VALUES (?, ?, ?, '1', '1', '1', '1')",
            [symbol, date, close],
        )
        .unwrap();
    }

    fn stage_fund(conn: &Connection, symbol: &str, date: &str, pe: &str) {
        conn.execute(
            "INSERT INTO staging_fundamental VALUES (?, ?, ?)",
            [symbol, date, pe],
        )
        .unwrap();
    }

    fn final_rows(conn: &Connection) -> Vec<(String, String, Option<f64>)> {
        let mut stmt = conn
            .prepare(&format!(
                "SELECT symbol, date, pe FROM {HISTORY_TABLE} ORDER BY symbol, date"
            ))
            .unwrap();
        let rows = stmt
            .query_map([], |row| Ok((row.get(0)?, row.get(1)?, row.get(2)?)))
            .unwrap();
        rows.map(|r| r.unwrap()).collect()
    }

    #[test]
    fn inner_join_keeps_only_shared_keys() {
        let (mut conn, tech, fund) = setup();
        stage_tech(&conn, "AAA", "20230101", "10.0");
        stage_tech(&conn, "AAA", "20230102", "10.5"); // no fundamental match
        stage_fund(&conn, "AAA", "20230101", "15.2");
        stage_fund(&conn, "BBB", "20230101", "8.0"); // no technical match

        let report = merge(&mut conn, &tech, &fund).unwrap();

        assert_eq!(report.rows_merged, 1);
        let rows = final_rows(&conn);
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0], ("AAA".into(), "2023-01-01".into(), Some(15.2)));
    }

    #[test]
    fn dates_are_normalized_to_iso() {
        let (mut conn, tech, fund) = setup();
        stage_tech(&conn, "AAA", "19910404", "1.0");
        stage_fund(&conn, "AAA", "19910404", "2.0");

        merge(&mut conn, &tech, &fund).unwrap();
        assert_eq!(final_rows(&conn)[0].1, "1991-04-04");
    }

    #[test]
    fn duplicate_keys_collapse_to_one_row() {
        let (mut conn, tech, fund) = setup();
        stage_tech(&conn, "AAA", "20230101", "10.0");
        stage_tech(&conn, "AAA", "20230101", "99.0"); // overlapping export
        stage_fund(&conn, "AAA", "20230101", "15.2");

        let report = merge(&mut conn, &tech, &fund).unwrap();

        assert_eq!(report.rows_merged, 1);
        assert_eq!(report.duplicates_ignored, 1);
        let rows = final_rows(&conn);
        assert_eq!(rows.len(), 1);

        // First staged occurrence wins: close comes from the 10.0 row.
        let close: f64 = conn
            .query_row(
                &format!("SELECT close FROM {HISTORY_TABLE}"),
                [],
                |row| row.get(0),
            )
            .unwrap();
        assert_eq!(close, 10.0);
    }

    #[test]
    fn invalid_dates_are_excluded_and_counted() {
        let (mut conn, tech, fund) = setup();
        stage_tech(&conn, "AAA", "2023010", "1.0"); // 7 digits
        stage_fund(&conn, "AAA", "2023010", "2.0");
        stage_tech(&conn, "BBB", "20230230", "1.0"); // not a calendar date
        stage_fund(&conn, "BBB", "20230230", "2.0");
        stage_tech(&conn, "CCC", "20230101", "1.0");
        stage_fund(&conn, "CCC", "20230101", "2.0");

        let report = merge(&mut conn, &tech, &fund).unwrap();

        assert_eq!(report.invalid_dates, 2);
        assert_eq!(report.rows_merged, 1);
        assert_eq!(final_rows(&conn)[0].0, "CCC");
    }

    #[test]
    fn blank_values_become_null_not_zero() {
        let (mut conn, tech, fund) = setup();
        stage_tech(&conn, "AAA", "20230101", "10.0");
        stage_fund(&conn, "AAA", "20230101", "   ");

        let report = merge(&mut conn, &tech, &fund).unwrap();

        assert_eq!(report.rows_merged, 1);
        assert_eq!(report.malformed_values, 0);
        assert_eq!(final_rows(&conn)[0].2, None);
    }

    #[test]
    fn malformed_values_become_null_and_are_counted() {
        let (mut conn, tech, fund) = setup();
        stage_tech(&conn, "AAA", "20230101", "oops");
        stage_fund(&conn, "AAA", "20230101", "15.2");

        let report = merge(&mut conn, &tech, &fund).unwrap();

        assert_eq!(report.rows_merged, 1);
        assert_eq!(report.malformed_values, 1);
        let close: Option<f64> = conn
            .query_row(
                &format!("SELECT close FROM {HISTORY_TABLE}"),
                [],
                |row| row.get(0),
            )
            .unwrap();
        assert_eq!(close, None);
    }

    #[test]
    fn staging_indexes_exist_after_merge() {
        let (mut conn, tech, fund) = setup();
        merge(&mut conn, &tech, &fund).unwrap();

        let count: i64 = conn
            .query_row(
                "SELECT COUNT(*) FROM sqlite_master WHERE type = 'index' AND name IN \
                 ('idx_staging_technical_sd', 'idx_staging_fundamental_sd')",
                [],
                |row| row.get(0),
            )
            .unwrap();
        assert_eq!(count, 2);
    }

    #[test]
    fn cleanup_drops_staging_but_keeps_history() {
        let (mut conn, tech, fund) = setup();
        stage_tech(&conn, "AAA", "20230101", "10.0");
        stage_fund(&conn, "AAA", "20230101", "15.2");
        merge(&mut conn, &tech, &fund).unwrap();

        cleanup(&conn, &tech, &fund).unwrap();

        let staging: i64 = conn
            .query_row(
                "SELECT COUNT(*) FROM sqlite_master WHERE name LIKE 'staging_%'",
                [],
                |row| row.get(0),
            )
            .unwrap();
        assert_eq!(staging, 0);
        assert_eq!(final_rows(&conn).len(), 1);
    }
}
