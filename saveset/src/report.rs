//! Decode results: what was found on the tape and what happened to it.

use std::path::PathBuf;

use serde::Serialize;

use crate::file::{FileErrors, FileMeta};
use crate::summary::SavesetSummary;

/// One file encountered in a saveset.
#[derive(Debug, Clone, Serialize)]
#[cfg_attr(feature = "jsonschema", derive(schemars::JsonSchema))]
pub struct FileEntry {
    /// Legacy filename as recorded in the saveset.
    pub name: String,
    /// Declared size in bytes.
    pub size: u64,
    /// Format tag, e.g. `VAR` or `VFC2`.
    pub format: String,
    /// Record attribute names, e.g. `["CR"]`.
    pub attributes: Vec<String>,
    pub record_size: u16,
    pub created: Option<i64>,
    pub modified: Option<i64>,
    pub directory: bool,
    /// Whether the file matched the caller's name patterns.
    pub selected: bool,
    /// Where the file landed, if it was extracted.
    pub extracted_to: Option<PathBuf>,
    /// Input bytes consumed while walking the file's data.
    pub bytes_in: u64,
    /// Bytes written to the primary output.
    pub bytes_out: u64,
    pub records: u64,
    pub errors: FileErrors,
}

impl FileEntry {
    pub fn from_meta(meta: &FileMeta, selected: bool) -> FileEntry {
        FileEntry {
            name: meta.name.clone(),
            size: meta.size,
            format: meta.format_tag(),
            attributes: meta.recattr.names().iter().map(|s| s.to_string()).collect(),
            record_size: meta.recsize,
            created: meta.ctime,
            modified: meta.mtime,
            directory: meta.directory,
            selected,
            extracted_to: None,
            bytes_in: 0,
            bytes_out: 0,
            records: 0,
            errors: FileErrors::default(),
        }
    }
}

/// One saveset's worth of results.
#[derive(Debug, Clone, Default, Serialize)]
#[cfg_attr(feature = "jsonschema", derive(schemars::JsonSchema))]
pub struct SavesetReport {
    /// Name from the HDR1 label.
    pub name: String,
    /// Sequence number from the HDR1 label.
    pub sequence: u32,
    /// Blocksize from the HDR2 label.
    pub blocksize: u32,
    pub summary: Option<SavesetSummary>,
    pub files: Vec<FileEntry>,
    /// Decode errors charged to this saveset.
    pub errors: u32,
}

/// Everything a decode run produced.
#[derive(Debug, Clone, Default, Serialize)]
#[cfg_attr(feature = "jsonschema", derive(schemars::JsonSchema))]
pub struct DecodeReport {
    pub savesets: Vec<SavesetReport>,
    pub total_errors: u32,
}
