//! Pipeline orchestration — one full extract-load-transform run.
//!
//! Order matters: schema reset, then both staging loads, then the merge,
//! then the audit (staging must still exist for its counts), then
//! cleanup. Each step runs to completion before the next begins; the
//! first structural failure aborts the run.

use std::time::{Duration, Instant};

use rusqlite::Connection;
use serde::Serialize;
use thiserror::Error;
use tracing::info;

use crate::audit::{audit, AuditError, AuditReport};
use crate::config::PipelineConfig;
use crate::db::{reset_schema, DbError};
use crate::merge::{cleanup, merge, MergeError, MergeReport};
use crate::schema::SourceSchema;
use crate::stage::{load_source, LoadReport, StageError};

/// Any structural failure of a pipeline step.
#[derive(Debug, Error)]
pub enum PipelineError {
    #[error("database setup failed: {0}")]
    Db(#[from] DbError),

    #[error("staging load failed: {0}")]
    Stage(#[from] StageError),

    #[error("merge failed: {0}")]
    Merge(#[from] MergeError),

    #[error("audit failed: {0}")]
    Audit(#[from] AuditError),
}

/// Aggregate outcome of one run.
#[derive(Debug, Clone, Serialize)]
pub struct PipelineReport {
    pub technical: LoadReport,
    pub fundamental: LoadReport,
    pub merge: MergeReport,
    pub audit: AuditReport,
    /// Wall time of the whole run.
    pub duration: Duration,
}

/// Execute the full pipeline against an open connection.
///
/// The connection is injected so tests (and alternative frontends) can
/// run the same pipeline against an in-memory database.
pub fn run(conn: &mut Connection, config: &PipelineConfig) -> Result<PipelineReport, PipelineError> {
    let started = Instant::now();
    let technical = SourceSchema::new("technical", &config.technical);
    let fundamental = SourceSchema::new("fundamental", &config.fundamental);

    reset_schema(conn, &technical, &fundamental)?;

    let mut first_skip_logged = false;
    let technical_report = load_source(conn, &technical, &mut first_skip_logged)?;
    info!(
        files = technical_report.files_loaded,
        rows = technical_report.rows_staged,
        skipped = technical_report.rows_skipped,
        "technical factors staged"
    );
    let fundamental_report = load_source(conn, &fundamental, &mut first_skip_logged)?;
    info!(
        files = fundamental_report.files_loaded,
        rows = fundamental_report.rows_staged,
        skipped = fundamental_report.rows_skipped,
        "fundamental metrics staged"
    );

    let merge_report = merge(conn, &technical, &fundamental)?;

    let audit_report = audit(conn, &config.audit, &technical, &fundamental)?;

    cleanup(conn, &technical, &fundamental)?;

    let duration = started.elapsed();
    info!(duration_ms = duration.as_millis() as u64, "pipeline finished");
    Ok(PipelineReport {
        technical: technical_report,
        fundamental: fundamental_report,
        merge: merge_report,
        audit: audit_report,
        duration,
    })
}
