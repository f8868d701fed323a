//! Audit reporter — post-merge data-quality accounting.
//!
//! Strictly read-only: counts both staging tables and the final table,
//! derives the match rate (final / smaller staging side), and probes one
//! configured nullable column as a completeness signal. A low match rate
//! or an empty source is a warning, never a failure; a count query that
//! errors IS a failure, because it means the merge left the database in
//! a state the pipeline cannot vouch for.

use rusqlite::Connection;
use serde::Serialize;
use thiserror::Error;
use tracing::{info, warn};

use crate::config::AuditConfig;
use crate::schema::{SourceSchema, HISTORY_TABLE};

/// Errors from audit queries. Fatal: the audit runs against tables the
/// merge just built, so a failing count indicates a broken merge.
#[derive(Debug, Error)]
pub enum AuditError {
    #[error("audit query failed: {sql}: {source}")]
    Query { sql: String, source: rusqlite::Error },
}

/// Everything the audit measured, plus the warnings it derived.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct AuditReport {
    pub technical_rows: u64,
    pub fundamental_rows: u64,
    pub final_rows: u64,
    /// `final / min(staging)`; `None` when either staging side is empty.
    pub match_rate: Option<f64>,
    /// Column probed for the completeness signal.
    pub completeness_field: String,
    /// Final rows where the probed column is NULL.
    pub null_count: u64,
    pub warnings: Vec<String>,
}

impl AuditReport {
    /// True when the audit raised no data-quality warnings.
    pub fn passed(&self) -> bool {
        self.warnings.is_empty()
    }
}

/// Run the audit over the staging and final tables.
///
/// Must run after the merge and before staging cleanup. Staging counts
/// are taken from the database, not from loader bookkeeping, so the
/// report reflects what is actually durable.
pub fn audit(
    conn: &Connection,
    config: &AuditConfig,
    technical: &SourceSchema,
    fundamental: &SourceSchema,
) -> Result<AuditReport, AuditError> {
    let technical_rows = count(conn, &format!("SELECT COUNT(*) FROM {}", technical.staging_table()))?;
    let fundamental_rows = count(
        conn,
        &format!("SELECT COUNT(*) FROM {}", fundamental.staging_table()),
    )?;
    let final_rows = count(conn, &format!("SELECT COUNT(*) FROM {HISTORY_TABLE}"))?;
    let null_count = count(
        conn,
        &format!(
            "SELECT COUNT(*) FROM {HISTORY_TABLE} WHERE {} IS NULL",
            config.completeness_field
        ),
    )?;

    let mut warnings = Vec::new();
    let smaller = technical_rows.min(fundamental_rows);
    let match_rate = if smaller == 0 {
        warnings.push(format!(
            "staging is empty ({} technical rows, {} fundamental rows); match rate skipped",
            technical_rows, fundamental_rows
        ));
        None
    } else {
        let rate = final_rows as f64 / smaller as f64;
        if rate < config.match_rate_threshold {
            warnings.push(format!(
                "match rate {:.1}% is below the {:.0}% threshold — keys may be misaligned \
                 (date format mismatch?) or the sources have genuine gaps",
                rate * 100.0,
                config.match_rate_threshold * 100.0
            ));
        }
        Some(rate)
    };

    for warning in &warnings {
        warn!("{warning}");
    }
    info!(
        technical_rows,
        fundamental_rows,
        final_rows,
        match_rate = match_rate.map(|r| r * 100.0),
        null_count,
        "audit complete"
    );

    Ok(AuditReport {
        technical_rows,
        fundamental_rows,
        final_rows,
        match_rate,
        completeness_field: config.completeness_field.clone(),
        null_count,
        warnings,
    })
}

fn count(conn: &Connection, sql: &str) -> Result<u64, AuditError> {
    let n: i64 = conn
        .query_row(sql, [], |row| row.get(0))
        .map_err(|source| AuditError::Query {
            sql: sql.to_string(),
            source,
        })?;
    Ok(n as u64)
}
