//! Source reader — file matching, delimiter detection, row parsing.
//!
//! Vendor exports are heterogeneous: some dumps are comma-separated,
//! some tab-separated, and the two can sit side by side in one
//! directory. Detection is per file and uses only the first line: tab
//! wins when it occurs strictly more often than comma. The probe reads
//! raw text and the parse stream is re-opened from offset zero, so the
//! header row is still available to the actual parse.

use std::fs::File;
use std::io::{BufRead, BufReader, Seek, SeekFrom};
use std::path::{Path, PathBuf};

use csv::StringRecord;
use thiserror::Error;

/// Errors from locating or opening source files.
#[derive(Debug, Error)]
pub enum ReadError {
    #[error("invalid glob pattern '{pattern}': {source}")]
    Pattern {
        pattern: String,
        source: glob::PatternError,
    },

    #[error("cannot open '{path}': {source}")]
    Open {
        path: PathBuf,
        source: std::io::Error,
    },
}

/// Expand a glob pattern into concrete paths, in glob order.
///
/// Entries the globber cannot stat are dropped; an empty result is not
/// an error (the caller reports zero files).
pub fn matching_files(pattern: &str) -> Result<Vec<PathBuf>, ReadError> {
    let paths = glob::glob(pattern).map_err(|source| ReadError::Pattern {
        pattern: pattern.to_string(),
        source,
    })?;
    Ok(paths.filter_map(Result::ok).collect())
}

/// Pick the field delimiter from a file's first line.
///
/// Tab only wins when strictly more frequent than comma; ties and
/// everything else fall back to comma.
pub fn detect_delimiter(first_line: &str) -> u8 {
    let tabs = first_line.matches('\t').count();
    let commas = first_line.matches(',').count();
    if tabs > commas {
        b'\t'
    } else {
        b','
    }
}

/// One source file with its delimiter detected and header consumed.
pub struct DetectedFile {
    path: PathBuf,
    delimiter: u8,
    header: StringRecord,
    reader: csv::Reader<BufReader<File>>,
}

impl std::fmt::Debug for DetectedFile {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DetectedFile")
            .field("path", &self.path)
            .field("delimiter", &self.delimiter)
            .field("header", &self.header)
            .finish_non_exhaustive()
    }
}

impl DetectedFile {
    /// Open a file, sniff its delimiter, and position the parse stream
    /// on the first data row.
    ///
    /// The reader is flexible: ragged rows come through as records (the
    /// loader decides whether they are wide enough) and minor quoting
    /// irregularities do not abort the file.
    pub fn open(path: &Path) -> Result<Self, ReadError> {
        let open_err = |source| ReadError::Open {
            path: path.to_path_buf(),
            source,
        };

        let file = File::open(path).map_err(open_err)?;
        let mut buffered = BufReader::new(file);

        let mut first_line = String::new();
        buffered.read_line(&mut first_line).map_err(open_err)?;
        let delimiter = detect_delimiter(&first_line);

        // The probe consumed the first line; rewind so the csv reader
        // parses the header itself (quoted headers may span lines).
        buffered.seek(SeekFrom::Start(0)).map_err(open_err)?;

        let mut reader = csv::ReaderBuilder::new()
            .delimiter(delimiter)
            .has_headers(false)
            .flexible(true)
            .from_reader(buffered);

        // First parsed row is the header; an empty file leaves it empty.
        let mut header = StringRecord::new();
        if !reader.read_record(&mut header).unwrap_or(false) {
            header = StringRecord::new();
        }

        Ok(Self {
            path: path.to_path_buf(),
            delimiter,
            header,
            reader,
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn delimiter(&self) -> u8 {
        self.delimiter
    }

    /// The discarded header row, kept for name-based column resolution.
    pub fn header(&self) -> &StringRecord {
        &self.header
    }

    /// Remaining data rows in file order. Individual record errors are
    /// yielded so the caller can skip them without losing the file.
    pub fn records(&mut self) -> impl Iterator<Item = csv::Result<StringRecord>> + '_ {
        self.reader.records()
    }
}
