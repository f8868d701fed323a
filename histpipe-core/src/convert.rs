//! Host-side value conversion for the merge engine.
//!
//! The staging tables hold raw text; everything typed goes through these
//! two functions so the cleaning rules live in one place and are not tied
//! to any SQL dialect:
//! - [`reformat_date8`]: strict `YYYYMMDD` → [`NaiveDate`]. An input that
//!   is not exactly 8 ASCII digits, or not a real calendar date, is
//!   rejected — it must never produce a plausible-looking wrong date.
//! - [`coerce_float`]: text → nullable float. Blank after trimming is
//!   NULL (not zero, not an error); unparseable text is NULL too, but
//!   flagged so the merge can count it.

use chrono::NaiveDate;
use thiserror::Error;

/// A date value the merge refuses to normalize.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum DateError {
    #[error("date '{0}' is not an 8-digit YYYYMMDD string")]
    NotEightDigits(String),

    #[error("date '{0}' is not a valid calendar date")]
    NotACalendarDate(String),
}

/// Parse a strict 8-digit `YYYYMMDD` string into a calendar date.
///
/// Surrounding whitespace is tolerated (exports pad fields); anything
/// else is rejected: wrong length, signs, separators, non-digits.
pub fn reformat_date8(raw: &str) -> Result<NaiveDate, DateError> {
    let digits = raw.trim();
    if digits.len() != 8 || !digits.bytes().all(|b| b.is_ascii_digit()) {
        return Err(DateError::NotEightDigits(raw.to_string()));
    }

    // Unwraps are safe: all-ASCII-digit substrings of known length.
    let year: i32 = digits[0..4].parse().unwrap();
    let month: u32 = digits[4..6].parse().unwrap();
    let day: u32 = digits[6..8].parse().unwrap();

    NaiveDate::from_ymd_opt(year, month, day)
        .ok_or_else(|| DateError::NotACalendarDate(raw.to_string()))
}

/// Outcome of coercing one raw text field to a float.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Coercion {
    /// A parseable numeric value.
    Value(f64),
    /// Empty or whitespace-only input: NULL by design.
    Blank,
    /// Non-empty but unparseable input: NULL, counted as malformed.
    Malformed,
}

impl Coercion {
    /// The nullable value that lands in the final table.
    pub fn as_option(self) -> Option<f64> {
        match self {
            Coercion::Value(v) => Some(v),
            Coercion::Blank | Coercion::Malformed => None,
        }
    }
}

/// Coerce a raw text field to a nullable float.
pub fn coerce_float(raw: &str) -> Coercion {
    let trimmed = raw.trim();
    if trimmed.is_empty() {
        return Coercion::Blank;
    }
    match trimmed.parse::<f64>() {
        Ok(v) => Coercion::Value(v),
        Err(_) => Coercion::Malformed,
    }
}
