//! HistPipe Core — batch ELT from stock-market CSV exports to SQLite.
//!
//! This crate contains the whole pipeline:
//! - Source reader: glob matching, per-file delimiter detection, row parsing
//! - Staging loader: schema-driven bulk insert of raw text rows
//! - Merge engine: indexed inner join on `(symbol, date)`, host-side
//!   date normalization and numeric coercion, primary-key dedup
//! - Audit reporter: match rate and completeness accounting
//! - Orchestration, configuration, and database bootstrap
//!
//! Every run is a full rebuild: staging tables are created fresh,
//! consumed once, and dropped; the final `stock_history` table is
//! replaced atomically.

pub mod audit;
pub mod config;
pub mod convert;
pub mod db;
pub mod merge;
pub mod pipeline;
pub mod reader;
pub mod schema;
pub mod stage;

pub use audit::{AuditError, AuditReport};
pub use config::{
    AuditConfig, ColumnRef, ConfigError, DatabaseConfig, FieldMapping, PipelineConfig,
    SourceConfig,
};
pub use convert::{coerce_float, reformat_date8, Coercion, DateError};
pub use db::DbError;
pub use merge::{MergeError, MergeReport};
pub use pipeline::{PipelineError, PipelineReport};
pub use reader::{detect_delimiter, matching_files, DetectedFile, ReadError};
pub use schema::{SourceSchema, HISTORY_TABLE};
pub use stage::{LoadReport, StageError};
