//! Staging and final-table schemas, derived mechanically from config.
//!
//! A [`SourceSchema`] turns one [`SourceConfig`] into everything the
//! loader and merge engine need: staging DDL, a parameterized insert of
//! the right arity, the `(symbol, date)` index statement, and (together
//! with its sibling schema) the `stock_history` DDL and join query.
//! Nothing infers column counts from runtime tuples; the schema is the
//! single source of truth for statement shapes.

use csv::StringRecord;
use thiserror::Error;

use crate::config::{ColumnRef, SourceConfig};

/// Name of the merged output table.
pub const HISTORY_TABLE: &str = "stock_history";

/// Errors from schema resolution against a concrete file.
#[derive(Debug, Error)]
pub enum SchemaError {
    #[error("header has no column named '{0}'")]
    MissingHeaderColumn(String),
}

/// Schema of one staging table, derived from its source config.
#[derive(Debug, Clone)]
pub struct SourceSchema {
    staging_table: String,
    config: SourceConfig,
}

impl SourceSchema {
    /// Build the schema for a source category. `label` becomes part of
    /// the staging table name (`staging_<label>`).
    pub fn new(label: &str, config: &SourceConfig) -> Self {
        Self {
            staging_table: format!("staging_{label}"),
            config: config.clone(),
        }
    }

    pub fn staging_table(&self) -> &str {
        &self.staging_table
    }

    pub fn min_columns(&self) -> usize {
        self.config.min_columns
    }

    pub fn pattern(&self) -> &str {
        &self.config.pattern
    }

    /// Staged measured columns, in table order (symbol/date excluded).
    pub fn columns(&self) -> impl Iterator<Item = &str> {
        self.config.fields.iter().map(|f| f.column.as_str())
    }

    /// `CREATE TABLE` for the untyped staging table.
    pub fn staging_ddl(&self) -> String {
        let mut cols = vec!["symbol TEXT".to_string(), "date TEXT".to_string()];
        cols.extend(self.columns().map(|c| format!("{c} TEXT")));
        format!(
            "CREATE TABLE {} ({})",
            self.staging_table,
            cols.join(", ")
        )
    }

    /// Parameterized insert whose arity matches the staged tuple.
    pub fn insert_sql(&self) -> String {
        let placeholders = vec!["?"; 2 + self.config.fields.len()].join(", ");
        format!("INSERT INTO {} VALUES ({placeholders})", self.staging_table)
    }

    /// Secondary index on the join key, built before merging.
    pub fn index_ddl(&self) -> String {
        format!(
            "CREATE INDEX idx_{0}_sd ON {0} (symbol, date)",
            self.staging_table
        )
    }

    /// Resolve this schema's column references against a file header.
    pub fn mapper(&self, header: &StringRecord) -> Result<RowMapper, SchemaError> {
        let symbol = resolve(&self.config.symbol, header)?;
        let date = resolve(&self.config.date, header)?;
        let fields = self
            .config
            .fields
            .iter()
            .map(|f| resolve(&f.from, header))
            .collect::<Result<Vec<_>, _>>()?;
        Ok(RowMapper {
            symbol,
            date,
            fields,
        })
    }
}

fn resolve(column: &ColumnRef, header: &StringRecord) -> Result<usize, SchemaError> {
    match column {
        ColumnRef::Index { index } => Ok(*index),
        ColumnRef::Name { name } => header
            .iter()
            .position(|h| h.trim() == name)
            .ok_or_else(|| SchemaError::MissingHeaderColumn(name.clone())),
    }
}

/// Extracts the staged tuple from a raw record, all references resolved
/// to positions for the current file.
#[derive(Debug, Clone)]
pub struct RowMapper {
    symbol: usize,
    date: usize,
    fields: Vec<usize>,
}

impl RowMapper {
    /// Map a record to its staged tuple: symbol, date, then each field.
    ///
    /// Returns `None` when any referenced position is absent from the
    /// record; the loader skips such rows, it never errors on them.
    pub fn map<'r>(&self, record: &'r StringRecord) -> Option<Vec<&'r str>> {
        let mut values = Vec::with_capacity(2 + self.fields.len());
        values.push(record.get(self.symbol)?);
        values.push(record.get(self.date)?);
        for &index in &self.fields {
            values.push(record.get(index)?);
        }
        Some(values)
    }
}

/// `CREATE TABLE` for the merged output: typed, non-null key, primary
/// key `(symbol, date)`. `WITHOUT ROWID` makes the primary key the
/// clustered lookup index; `STRICT` enforces the declared types.
pub fn history_ddl(technical: &SourceSchema, fundamental: &SourceSchema) -> String {
    let mut cols = vec![
        "symbol TEXT NOT NULL".to_string(),
        "date TEXT NOT NULL".to_string(),
    ];
    cols.extend(
        technical
            .columns()
            .chain(fundamental.columns())
            .map(|c| format!("{c} REAL")),
    );
    cols.push("PRIMARY KEY (symbol, date)".to_string());
    format!(
        "CREATE TABLE {HISTORY_TABLE} ({}) WITHOUT ROWID, STRICT",
        cols.join(", ")
    )
}

/// Insert into the merged table; `OR IGNORE` deduplicates on the
/// primary key, first occurrence wins.
pub fn history_insert_sql(technical: &SourceSchema, fundamental: &SourceSchema) -> String {
    let arity = 2 + technical.columns().count() + fundamental.columns().count();
    let placeholders = vec!["?"; arity].join(", ");
    format!("INSERT OR IGNORE INTO {HISTORY_TABLE} VALUES ({placeholders})")
}

/// Inner join of the two staging tables on the raw `(symbol, date)` key.
///
/// Both sources carry the date in the same raw `YYYYMMDD` form, so the
/// join compares raw text; normalization happens host-side on the way
/// into the final table. Rowid ordering makes dedup deterministic:
/// the first staged occurrence wins.
pub fn join_sql(technical: &SourceSchema, fundamental: &SourceSchema) -> String {
    let mut select = vec!["t.symbol".to_string(), "t.date".to_string()];
    select.extend(technical.columns().map(|c| format!("t.{c}")));
    select.extend(fundamental.columns().map(|c| format!("f.{c}")));
    format!(
        "SELECT {} FROM {} t INNER JOIN {} f ON t.symbol = f.symbol AND t.date = f.date \
         ORDER BY t.rowid, f.rowid",
        select.join(", "),
        technical.staging_table(),
        fundamental.staging_table()
    )
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
    fn staging_ddl_is_all_text() {
        let (tech, _) = schemas();
        assert_eq!(
            tech.staging_ddl(),
            "CREATE TABLE staging_technical (symbol TEXT, date TEXT, close TEXT, \
             close_adj TEXT, open_adj TEXT, high_adj TEXT, low_adj TEXT)"
        );
    }

    #[test]
    fn insert_arity_tracks_field_count() {
        let (tech, fund) = schemas();
        assert_eq!(
            tech.insert_sql(),
            "INSERT INTO staging_technical VALUES (?, ?, ?, ?, ?, ?, ?)"
        );
        assert_eq!(
            fund.insert_sql(),
            "INSERT INTO staging_fundamental VALUES (?, ?, ?)"
        );
    }

    #[test]
    fn history_ddl_types_and_constrains() {
        let (tech, fund) = schemas();
        let ddl = history_ddl(&tech, &fund);
        assert!(ddl.contains("symbol TEXT NOT NULL"));
        assert!(ddl.contains("date TEXT NOT NULL"));
        assert!(ddl.contains("pe REAL"));
        assert!(ddl.contains("PRIMARY KEY (symbol, date)"));
        assert!(ddl.ends_with("WITHOUT ROWID, STRICT"));
    }

    #[test]
    fn join_selects_key_then_tech_then_fund() {
        let (tech, fund) = schemas();
        assert_eq!(
            join_sql(&tech, &fund),
            "SELECT t.symbol, t.date, t.close, t.close_adj, t.open_adj, t.high_adj, \
             t.low_adj, f.pe FROM staging_technical t INNER JOIN staging_fundamental f \
             ON t.symbol = f.symbol AND t.date = f.date ORDER BY t.rowid, f.rowid"
        );
    }

    #[test]
    fn mapper_resolves_names_against_header() {
        let mut config = PipelineConfig::default().fundamental;
        config.symbol = ColumnRef::Name {
            name: "ts_code".to_string(),
        };
        config.fields[0].from = ColumnRef::Name {
            name: "pe".to_string(),
        };
        let schema = SourceSchema::new("fundamental", &config);

        let header = StringRecord::from(vec!["ts_code", "trade_date", " pe "]);
        let mapper = schema.mapper(&header).unwrap();

        let record = StringRecord::from(vec!["AAA", "20230101", "15.2"]);
        assert_eq!(mapper.map(&record), Some(vec!["AAA", "20230101", "15.2"]));
    }

    #[test]
    fn mapper_fails_on_missing_header_name() {
        let mut config = PipelineConfig::default().fundamental;
        config.fields[0].from = ColumnRef::Name {
            name: "pe_ttm".to_string(),
        };
        let schema = SourceSchema::new("fundamental", &config);

        let header = StringRecord::from(vec!["ts_code", "trade_date", "pe"]);
        let err = schema.mapper(&header).unwrap_err();
        assert!(matches!(err, SchemaError::MissingHeaderColumn(ref name) if name == "pe_ttm"));
    }

    #[test]
    fn mapper_skips_short_records() {
        let (_, fund) = schemas();
        let header = StringRecord::from(vec![""; 15]);
        let mapper = fund.mapper(&header).unwrap();

        // Field 14 is out of range: mapper signals skip, not error.
        let record = StringRecord::from(vec!["AAA", "20230101", "1.0"]);
        assert_eq!(mapper.map(&record), None);
    }
}
