//! Cell file I/O.
//!
//! A cell file holds one JSON-encoded [`FeatureRecord`] per line.

use std::fs::{self, OpenOptions};
use std::io::{ErrorKind, Write};
use std::path::{Path, PathBuf};

use super::CacheError;
use crate::backend::FeatureRecord;

/// File name of the cell at column `x`, row `y`.
pub fn cell_file_name(x: u32, y: u32) -> String {
    format!("{}.{}.data", x, y)
}

fn encode(records: &[FeatureRecord]) -> Result<Vec<u8>, CacheError> {
    let mut buf = Vec::new();
    for record in records {
        serde_json::to_writer(&mut buf, record).map_err(|e| CacheError::Encode(e.to_string()))?;
        buf.push(b'\n');
    }
    Ok(buf)
}

/// Reads a cell file; a missing file is an empty cell.
pub(crate) fn read(path: &Path) -> Result<Vec<FeatureRecord>, CacheError> {
    let contents = match fs::read_to_string(path) {
        Ok(c) => c,
        Err(e) if e.kind() == ErrorKind::NotFound => return Ok(Vec::new()),
        Err(e) => return Err(CacheError::io(path, e)),
    };
    contents
        .lines()
        .filter(|l| !l.trim().is_empty())
        .enumerate()
        .map(|(i, line)| {
            serde_json::from_str(line).map_err(|e| CacheError::MalformedCell {
                path: path.to_path_buf(),
                line: i + 1,
                reason: e.to_string(),
            })
        })
        .collect()
}

/// Replaces a cell file's contents.
pub(crate) fn write(path: &Path, records: &[FeatureRecord]) -> Result<(), CacheError> {
    let bytes = encode(records)?;
    fs::write(path, bytes).map_err(|e| CacheError::io(path, e))
}

/// Appends records to a cell file, creating it if needed.
pub(crate) fn append(path: &Path, records: &[FeatureRecord]) -> Result<(), CacheError> {
    let bytes = encode(records)?;
    let mut file = OpenOptions::new()
        .create(true)
        .append(true)
        .open(path)
        .map_err(|e| CacheError::io(path, e))?;
    file.write_all(&bytes).map_err(|e| CacheError::io(path, e))
}

/// Path of a cell inside a precision directory.
pub fn cell_path(dir: &Path, x: u32, y: u32) -> PathBuf {
    dir.join(cell_file_name(x, y))
}
