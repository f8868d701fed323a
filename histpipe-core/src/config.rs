//! Pipeline configuration, loaded from a TOML file.
//!
//! A config describes everything one run needs:
//! - where the database lives and how much cache memory SQLite may use
//! - one [`SourceConfig`] per source category (technical factors,
//!   fundamental metrics): glob pattern, minimum column count, and the
//!   column mappings that drive the staging schema
//! - audit settings (match-rate threshold, completeness field)
//!
//! Column references support both header names and zero-based positions,
//! so the same config format covers exports with stable headers and
//! exports where only the column order is known.

use std::collections::HashSet;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Errors from loading or validating a pipeline config.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("cannot read config file '{path}': {source}")]
    Io {
        path: PathBuf,
        source: std::io::Error,
    },

    #[error("config parse error: {0}")]
    Parse(#[from] toml::de::Error),

    #[error("source '{source_name}' declares no staged fields")]
    NoFields { source_name: String },

    #[error("duplicate output column '{column}' (columns must be unique across both sources)")]
    DuplicateColumn { column: String },

    #[error("invalid output column name '{column}' (letters, digits and '_' only)")]
    InvalidColumnName { column: String },

    #[error("match_rate_threshold must be within 0.0..=1.0, got {0}")]
    ThresholdOutOfRange(f64),

    #[error("completeness_field '{field}' is not a staged column of either source")]
    UnknownCompletenessField { field: String },
}

/// Reference to a column of a source file: by header name or by position.
///
/// Name references are resolved against each file's header row; position
/// references index into the raw record directly.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum ColumnRef {
    /// Zero-based position in the record.
    Index { index: usize },
    /// Header name, matched case-sensitively against the file's first row.
    Name { name: String },
}

/// One staged field: the output column it lands in, and where it comes from.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FieldMapping {
    /// Column name in the staging table (and, typed, in `stock_history`).
    pub column: String,
    #[serde(flatten)]
    pub from: ColumnRef,
}

/// One source category of CSV exports.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SourceConfig {
    /// Glob pattern matching this category's CSV files.
    pub pattern: String,

    /// Rows with fewer parsed fields than this are skipped.
    pub min_columns: usize,

    /// Where the symbol identifier lives in each record.
    #[serde(default = "default_symbol_ref")]
    pub symbol: ColumnRef,

    /// Where the 8-digit trading date lives in each record.
    #[serde(default = "default_date_ref")]
    pub date: ColumnRef,

    /// Measured fields staged from this source, in staging-table order.
    pub fields: Vec<FieldMapping>,
}

fn default_symbol_ref() -> ColumnRef {
    ColumnRef::Index { index: 0 }
}

fn default_date_ref() -> ColumnRef {
    ColumnRef::Index { index: 1 }
}

/// Database location and resource limits.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DatabaseConfig {
    /// Path of the SQLite database file, created if absent.
    pub path: PathBuf,

    /// Page-cache ceiling for the engine, in MiB.
    #[serde(default = "default_memory_limit_mib")]
    pub memory_limit_mib: u64,
}

fn default_memory_limit_mib() -> u64 {
    256
}

/// Audit thresholds and completeness probe.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AuditConfig {
    /// Warn when final-count / min(staging-counts) falls below this.
    #[serde(default = "default_match_rate_threshold")]
    pub match_rate_threshold: f64,

    /// Nullable final column whose NULL count is reported as a
    /// completeness signal.
    pub completeness_field: String,
}

fn default_match_rate_threshold() -> f64 {
    0.90
}

/// Complete configuration for one pipeline run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PipelineConfig {
    pub database: DatabaseConfig,

    /// Technical/price factor exports (OHLC, adjusted prices, indicators).
    pub technical: SourceConfig,

    /// Fundamental metric exports (valuation, liquidity).
    pub fundamental: SourceConfig,

    pub audit: AuditConfig,
}

impl PipelineConfig {
    /// Load and validate a config from a TOML file.
    pub fn from_file(path: &Path) -> Result<Self, ConfigError> {
        let text = std::fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        Self::from_toml(&text)
    }

    /// Parse and validate a config from TOML text.
    pub fn from_toml(text: &str) -> Result<Self, ConfigError> {
        let config: PipelineConfig = toml::from_str(text)?;
        config.validate()?;
        Ok(config)
    }

    /// Structural validation beyond what serde enforces.
    pub fn validate(&self) -> Result<(), ConfigError> {
        for (label, source) in [("technical", &self.technical), ("fundamental", &self.fundamental)]
        {
            if source.fields.is_empty() {
                return Err(ConfigError::NoFields {
                    source_name: label.to_string(),
                });
            }
        }

        let mut seen: HashSet<&str> = HashSet::new();
        // symbol/date are reserved by the merged table itself.
        seen.insert("symbol");
        seen.insert("date");
        for field in self
            .technical
            .fields
            .iter()
            .chain(self.fundamental.fields.iter())
        {
            if !is_valid_column_name(&field.column) {
                return Err(ConfigError::InvalidColumnName {
                    column: field.column.clone(),
                });
            }
            if !seen.insert(field.column.as_str()) {
                return Err(ConfigError::DuplicateColumn {
                    column: field.column.clone(),
                });
            }
        }

        if !(0.0..=1.0).contains(&self.audit.match_rate_threshold) {
            return Err(ConfigError::ThresholdOutOfRange(
                self.audit.match_rate_threshold,
            ));
        }

        if !seen.contains(self.audit.completeness_field.as_str())
            || self.audit.completeness_field == "symbol"
            || self.audit.completeness_field == "date"
        {
            return Err(ConfigError::UnknownCompletenessField {
                field: self.audit.completeness_field.clone(),
            });
        }

        Ok(())
    }
}

/// Column names become SQL identifiers verbatim, so restrict them hard.
fn is_valid_column_name(name: &str) -> bool {
    !name.is_empty()
        && !name.starts_with(|c: char| c.is_ascii_digit())
        && name
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '_')
}

impl Default for PipelineConfig {
    /// Mirrors the vendor export layout the pipeline was first built for:
    /// technical factors with raw + adjusted prices at fixed positions,
    /// fundamental metrics with the P/E ratio at position 14.
    fn default() -> Self {
        Self {
            database: DatabaseConfig {
                path: PathBuf::from("stock_data.db"),
                memory_limit_mib: default_memory_limit_mib(),
            },
            technical: SourceConfig {
                pattern: "data/technical/*.csv".to_string(),
                min_columns: 19,
                symbol: default_symbol_ref(),
                date: default_date_ref(),
                fields: vec![
                    FieldMapping {
                        column: "close".to_string(),
                        from: ColumnRef::Index { index: 2 },
                    },
                    FieldMapping {
                        column: "close_adj".to_string(),
                        from: ColumnRef::Index { index: 14 },
                    },
                    FieldMapping {
                        column: "open_adj".to_string(),
                        from: ColumnRef::Index { index: 12 },
                    },
                    FieldMapping {
                        column: "high_adj".to_string(),
                        from: ColumnRef::Index { index: 16 },
                    },
                    FieldMapping {
                        column: "low_adj".to_string(),
                        from: ColumnRef::Index { index: 18 },
                    },
                ],
            },
            fundamental: SourceConfig {
                pattern: "data/fundamental/*.csv".to_string(),
                min_columns: 15,
                symbol: default_symbol_ref(),
                date: default_date_ref(),
                fields: vec![FieldMapping {
                    column: "pe".to_string(),
                    from: ColumnRef::Index { index: 14 },
                }],
            },
            audit: AuditConfig {
                match_rate_threshold: default_match_rate_threshold(),
                completeness_field: "pe".to_string(),
            },
        }
    }
}
