//! Tabular dataset backed by CSV files.
//!
//! Rows are kept in file order for the whole job; the row index is the
//! identity of an entity.

use std::io::{Read, Write};
use std::path::Path;

use crate::config::ALL_ENTITIES;
use crate::types::{EnrichError, EnrichResult};

/// In-memory table of string cells.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Dataset {
    headers: Vec<String>,
    rows: Vec<Vec<String>>,
}

impl Dataset {
    /// Build a dataset, padding short rows with blank cells.
    pub fn new(headers: Vec<String>, rows: Vec<Vec<String>>) -> Self {
        let width = headers.len();
        let rows = rows
            .into_iter()
            .map(|mut row| {
                if row.len() < width {
                    row.resize(width, String::new());
                }
                row
            })
            .collect();
        Self { headers, rows }
    }

    /// Read a CSV document with a header row.
    pub fn from_reader<R: Read>(reader: R) -> EnrichResult<Self> {
        let mut reader = csv::ReaderBuilder::new()
            .flexible(true)
            .from_reader(reader);
        let headers = reader.headers()?.iter().map(String::from).collect();
        let mut rows = Vec::new();
        for record in reader.records() {
            let record = record?;
            rows.push(record.iter().map(String::from).collect());
        }
        Ok(Self::new(headers, rows))
    }

    pub fn load(path: &Path) -> EnrichResult<Self> {
        let file = std::fs::File::open(path)?;
        Self::from_reader(std::io::BufReader::new(file))
    }

    pub fn to_writer<W: Write>(&self, writer: W) -> EnrichResult<()> {
        let mut writer = csv::Writer::from_writer(writer);
        writer.write_record(&self.headers)?;
        for row in &self.rows {
            writer.write_record(row)?;
        }
        writer.flush()?;
        Ok(())
    }

    /// Write the dataset, creating parent directories as needed.
    pub fn save(&self, path: &Path) -> EnrichResult<()> {
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)?;
            }
        }
        let file = std::fs::File::create(path)?;
        self.to_writer(std::io::BufWriter::new(file))
    }

    pub fn len(&self) -> usize {
        self.rows.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }

    pub fn headers(&self) -> &[String] {
        &self.headers
    }

    pub fn rows(&self) -> &[Vec<String>] {
        &self.rows
    }

    /// Index of the named column.
    pub fn column(&self, name: &str) -> EnrichResult<usize> {
        self.headers
            .iter()
            .position(|h| h == name)
            .ok_or_else(|| EnrichError::MissingColumn(name.to_string()))
    }

    /// Index of the named column, appending a blank one if it does not exist.
    pub fn ensure_column(&mut self, name: &str) -> usize {
        if let Some(idx) = self.headers.iter().position(|h| h == name) {
            return idx;
        }
        self.headers.push(name.to_string());
        for row in &mut self.rows {
            row.push(String::new());
        }
        self.headers.len() - 1
    }

    pub fn get(&self, row: usize, col: usize) -> Option<&str> {
        self.rows.get(row)?.get(col).map(String::as_str)
    }

    /// Overwrite one cell. Out-of-range coordinates are ignored.
    pub fn set(&mut self, row: usize, col: usize, value: impl Into<String>) {
        if let Some(cell) = self.rows.get_mut(row).and_then(|r| r.get_mut(col)) {
            *cell = value.into();
        }
    }

    /// Keep only the first `limit` rows.
    ///
    /// `-1` keeps everything. Zero, anything below `-1`, or a limit larger
    /// than the dataset is rejected.
    pub fn apply_limit(&mut self, limit: i64) -> EnrichResult<()> {
        if limit == ALL_ENTITIES {
            return Ok(());
        }
        if limit <= 0 || limit as u64 > self.rows.len() as u64 {
            return Err(EnrichError::InvalidConfiguration(format!(
                "invalid number of entities: {limit} (dataset has {} rows)",
                self.rows.len()
            )));
        }
        self.rows.truncate(limit as usize);
        Ok(())
    }

    /// `(row index, key)` pairs in dataset order.
    pub fn entities(&self, key_col: usize) -> Vec<(usize, String)> {
        self.rows
            .iter()
            .enumerate()
            .map(|(idx, row)| {
                let key = row.get(key_col).map(|k| k.trim()).unwrap_or_default();
                (idx, key.to_string())
            })
            .collect()
    }
}
