//! Database bootstrap: connection, pragmas, fresh-run schema reset.
//!
//! One `rusqlite::Connection` is opened here and injected into every
//! downstream component; nothing holds a global handle. The pipeline is
//! the only writer, so the pragmas trade durability for load throughput
//! (WAL, synchronous OFF, in-memory temp store) and the page cache is
//! capped from config.

use rusqlite::Connection;
use thiserror::Error;
use tracing::info;

use crate::config::DatabaseConfig;
use crate::schema::{history_ddl, SourceSchema, HISTORY_TABLE};

/// Errors from opening or preparing the database. All are structural
/// and fatal to the run.
#[derive(Debug, Error)]
pub enum DbError {
    #[error("cannot open database '{path}': {source}")]
    Open {
        path: String,
        source: rusqlite::Error,
    },

    #[error("statement failed: {sql}: {source}")]
    Statement { sql: String, source: rusqlite::Error },
}

/// Open the configured database file and apply the engine limits.
pub fn open(config: &DatabaseConfig) -> Result<Connection, DbError> {
    let conn = Connection::open(&config.path).map_err(|source| DbError::Open {
        path: config.path.display().to_string(),
        source,
    })?;
    apply_pragmas(&conn, config.memory_limit_mib)?;
    Ok(conn)
}

/// Open an in-memory database with the same pragma profile. Test seam.
pub fn open_in_memory(memory_limit_mib: u64) -> Result<Connection, DbError> {
    let conn = Connection::open_in_memory().map_err(|source| DbError::Open {
        path: ":memory:".to_string(),
        source,
    })?;
    apply_pragmas(&conn, memory_limit_mib)?;
    Ok(conn)
}

fn apply_pragmas(conn: &Connection, memory_limit_mib: u64) -> Result<(), DbError> {
    // Negative cache_size = ceiling in KiB rather than pages.
    let cache_kib = (memory_limit_mib as i64).saturating_mul(1024);
    execute_batch(
        conn,
        &format!(
            "PRAGMA journal_mode = WAL;\n\
             PRAGMA synchronous = OFF;\n\
             PRAGMA temp_store = MEMORY;\n\
             PRAGMA cache_size = -{cache_kib};"
        ),
    )
}

/// Drop any leftovers from a previous run and create the staging and
/// final tables fresh. Every invocation is a full rebuild.
pub fn reset_schema(
    conn: &Connection,
    technical: &SourceSchema,
    fundamental: &SourceSchema,
) -> Result<(), DbError> {
    for schema in [technical, fundamental] {
        execute_batch(
            conn,
            &format!("DROP TABLE IF EXISTS {}", schema.staging_table()),
        )?;
        execute_batch(conn, &schema.staging_ddl())?;
    }
    execute_batch(conn, &format!("DROP TABLE IF EXISTS {HISTORY_TABLE}"))?;
    execute_batch(conn, &history_ddl(technical, fundamental))?;
    info!(
        technical = technical.staging_table(),
        fundamental = fundamental.staging_table(),
        final_table = HISTORY_TABLE,
        "tables created"
    );
    Ok(())
}

/// Run a structural statement, carrying the SQL into any error.
pub fn execute_batch(conn: &Connection, sql: &str) -> Result<(), DbError> {
    conn.execute_batch(sql).map_err(|source| DbError::Statement {
        sql: sql.to_string(),
        source,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::PipelineConfig;

    fn schemas() -> (SourceSchema, SourceSchema) {
        let config = PipelineConfig::default();
        (
            SourceSchema::new("technical", &config.technical),
            SourceSchema::new("fundamental", &config.fundamental),
        )
    }

    #[test]
    fn reset_creates_all_three_tables() {
        let conn = open_in_memory(64).unwrap();
        let (tech, fund) = schemas();
        reset_schema(&conn, &tech, &fund).unwrap();

        let count: i64 = conn
            .query_row(
                "SELECT COUNT(*) FROM sqlite_master WHERE type = 'table' AND name IN \
                 ('staging_technical', 'staging_fundamental', 'stock_history')",
                [],
                |row| row.get(0),
            )
            .unwrap();
        assert_eq!(count, 3);
    }

    #[test]
    fn reset_is_idempotent() {
        let conn = open_in_memory(64).unwrap();
        let (tech, fund) = schemas();
        reset_schema(&conn, &tech, &fund).unwrap();
        conn.execute(
            "INSERT INTO staging_fundamental VALUES ('AAA', '20230101', '1.0')",
            [],
        )
        .unwrap();

        // Second reset drops and recreates: previous rows are gone.
        reset_schema(&conn, &tech, &fund).unwrap();
        let count: i64 = conn
            .query_row("SELECT COUNT(*) FROM staging_fundamental", [], |row| {
                row.get(0)
            })
            .unwrap();
        assert_eq!(count, 0);
    }

    #[test]
    fn history_table_enforces_primary_key() {
        let conn = open_in_memory(64).unwrap();
        let (tech, fund) = schemas();
        reset_schema(&conn, &tech, &fund).unwrap();

        conn.execute(
            "INSERT INTO stock_history VALUES ('AAA', '2023-01-01', 1, 1, 1, 1, 1, 15.2)",
            [],
        )
        .unwrap();
        let dup = conn.execute(
            "INSERT INTO stock_history VALUES ('AAA', '2023-01-01', 2, 2, 2, 2, 2, 8.0)",
            [],
        );
        assert!(dup.is_err());
    }

    #[test]
    fn open_error_names_the_path() {
        let config = DatabaseConfig {
            path: "/nonexistent-dir/x/y.db".into(),
            memory_limit_mib: 64,
        };
        let err = open(&config).unwrap_err();
        assert!(err.to_string().contains("/nonexistent-dir/x/y.db"));
    }
}
