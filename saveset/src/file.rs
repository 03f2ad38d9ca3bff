//! File header records: the per-file metadata that precedes a file's VBN
//! data in the saveset.

use serde::Serialize;

use crate::subrecord::{sub_records, SubRecordError};
use crate::time::vms_to_unix;

/// Longest legacy filename we accept; anything longer is clipped.
pub const MAX_FILENAME_LEN: usize = 128;

/// Mail files carry this bit in the record format byte and must never have
/// their VBN chain walked; the record data inside is not trustworthy.
pub const FORMAT_MAIL_BIT: u8 = 0x20;

/// File sub-record codes.
pub const FREC_END: u16 = 0x00;
pub const FREC_FNAME: u16 = 0x2A;
pub const FREC_UID: u16 = 0x2F;
pub const FREC_FORMAT: u16 = 0x34;
pub const FREC_CTIME: u16 = 0x36;
pub const FREC_MTIME: u16 = 0x37;
pub const FREC_ATIME: u16 = 0x38;
pub const FREC_BTIME: u16 = 0x39;
pub const FREC_DIRECTORY: u16 = 0x49;

/// Codes that appear in real savesets but whose meaning is unknown; they are
/// tolerated and skipped.
pub const FREC_TOLERATED: &[u16] = &[
    0x2B, 0x2C, 0x2D, 0x2E, 0x30, 0x31, 0x32, 0x33, 0x35, 0x47, 0x48, 0x4A, 0x4B, 0x4E, 0x4F,
    0x50, 0x57,
];

/// RMS record formats (FAB$C_ codes).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum RecordFormat {
    Raw,
    Fix,
    Var,
    Vfc,
    Stm,
    StmLf,
    StmCr,
    Fix11,
}

impl RecordFormat {
    pub fn from_code(code: u8) -> Option<RecordFormat> {
        match code {
            0 => Some(RecordFormat::Raw),
            1 => Some(RecordFormat::Fix),
            2 => Some(RecordFormat::Var),
            3 => Some(RecordFormat::Vfc),
            4 => Some(RecordFormat::Stm),
            5 => Some(RecordFormat::StmLf),
            6 => Some(RecordFormat::StmCr),
            11 => Some(RecordFormat::Fix11),
            _ => None,
        }
    }

    /// True for the formats that carry a little-endian u16 length before
    /// each record.
    pub fn has_length_prefix(self) -> bool {
        matches!(self, RecordFormat::Var | RecordFormat::Vfc)
    }

    pub fn name(self) -> &'static str {
        match self {
            RecordFormat::Raw => "RAW",
            RecordFormat::Fix => "FIX",
            RecordFormat::Var => "VAR",
            RecordFormat::Vfc => "VFC",
            RecordFormat::Stm => "STM",
            RecordFormat::StmLf => "STMLF",
            RecordFormat::StmCr => "STMCR",
            RecordFormat::Fix11 => "FIX11",
        }
    }
}

/// RMS record attribute bits (FAB$V_ flags), kept raw.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
#[cfg_attr(feature = "jsonschema", derive(schemars::JsonSchema))]
pub struct RecordAttributes(pub u8);

impl RecordAttributes {
    /// Bit 0: FORTRAN carriage control.
    pub fn fortran(self) -> bool {
        self.0 & 0x01 != 0
    }

    /// Bit 1: implied LF/CR around each record.
    pub fn implied_cr(self) -> bool {
        self.0 & 0x02 != 0
    }

    /// Bit 2: print-file carriage control.
    pub fn print_file(self) -> bool {
        self.0 & 0x04 != 0
    }

    /// Bit 3: records do not cross block boundaries.
    pub fn block_bound(self) -> bool {
        self.0 & 0x08 != 0
    }

    pub fn any(self) -> bool {
        self.0 & 0x0F != 0
    }

    /// True when records should be followed by a newline on extraction.
    pub fn wants_newline(self) -> bool {
        self.fortran() || self.implied_cr() || self.print_file()
    }

    /// Attribute names for filename suffixes and listings; "NONE" when no
    /// bit is set.
    pub fn names(self) -> Vec<&'static str> {
        let mut out = Vec::new();
        if self.fortran() {
            out.push("FTN");
        }
        if self.implied_cr() {
            out.push("CR");
        }
        if self.print_file() {
            out.push("PRN");
        }
        if self.block_bound() {
            out.push("BLK");
        }
        if out.is_empty() {
            out.push("NONE");
        }
        out
    }
}

/// Error flags accumulated while a file's data is reassembled. The offset
/// of the first error is preserved for the close-time rename.
#[derive(Debug, Clone, Default, Serialize)]
#[cfg_attr(feature = "jsonschema", derive(schemars::JsonSchema))]
pub struct FileErrors {
    /// A record length field was corrupt or a record overran its block.
    pub record_error: bool,
    /// A block in this file's span was missing, duplicated or out of order.
    pub block_error: bool,
    /// The bytes delivered disagree with the declared file size.
    pub size_error: bool,
    /// The record format code is outside the known set.
    pub format_error: bool,
    pub first_error_offset: Option<u64>,
}

impl FileErrors {
    pub fn any(&self) -> bool {
        self.record_error || self.block_error || self.size_error || self.format_error
    }

    pub fn count(&self) -> u32 {
        self.record_error as u32
            + self.block_error as u32
            + self.size_error as u32
            + self.format_error as u32
    }

    /// Record the input offset of the first error only.
    pub fn note(&mut self, offset: u64) {
        if self.first_error_offset.is_none() {
            self.first_error_offset = Some(offset);
        }
    }
}

/// Everything a file record tells us about the file whose data follows.
#[derive(Debug, Clone, Default, Serialize)]
#[cfg_attr(feature = "jsonschema", derive(schemars::JsonSchema))]
pub struct FileMeta {
    /// Legacy filename: `[DIR.SUBDIR]NAME.TYPE;VERSION`.
    pub name: String,
    pub usr: u16,
    pub grp: u16,
    /// Raw record format code; may hold values outside the known set.
    pub recfmt: u8,
    pub recattr: RecordAttributes,
    /// Maximum (VAR/VFC) or exact (FIX) record length.
    pub recsize: u16,
    /// Leading control bytes per VFC record; the format encodes 0 as 2.
    pub vfcsize: u8,
    /// Allocation in 512-byte blocks, and bytes used in the last block.
    pub nblk: u32,
    pub lnch: u16,
    /// Declared file size in bytes: `(nblk-1)*512 + lnch`, or 0 when no
    /// blocks are allocated.
    pub size: u64,
    pub ctime: Option<i64>,
    pub mtime: Option<i64>,
    pub atime: Option<i64>,
    pub btime: Option<i64>,
    pub directory: bool,
    /// Set by the mail bit in the format byte or a `.MAI` filetype.
    pub mail: bool,
    /// Count of sub-record codes outside both the known and tolerated sets.
    pub undefined_fields: u32,
}

impl FileMeta {
    /// Decode a file record's sub-record vector.
    pub fn parse(payload: &[u8]) -> Result<FileMeta, SubRecordError> {
        let mut meta = FileMeta::default();

        for rec in sub_records(payload)? {
            let rec = rec?;
            let data = rec.data;
            match rec.code {
                FREC_FNAME => {
                    let clip = data.len().min(MAX_FILENAME_LEN);
                    meta.name = data[..clip]
                        .iter()
                        .map(|&b| if b.is_ascii_graphic() { b as char } else { '_' })
                        .collect();
                    log::debug!("file record FNAME: \"{}\"", meta.name);
                }
                FREC_UID => {
                    if data.len() >= 4 {
                        meta.usr = u16::from_le_bytes([data[0], data[1]]);
                        meta.grp = u16::from_le_bytes([data[2], data[3]]);
                    }
                }
                FREC_FORMAT => {
                    if data.len() >= 16 {
                        meta.recfmt = data[0];
                        meta.recattr = RecordAttributes(data[1]);
                        meta.recsize = u16::from_le_bytes([data[2], data[3]]);
                        // Allocation is split into a high and low word.
                        let hi = u16::from_le_bytes([data[8], data[9]]) as u32;
                        let lo = u16::from_le_bytes([data[10], data[11]]) as u32;
                        meta.nblk = lo + (hi << 16);
                        meta.lnch = u16::from_le_bytes([data[12], data[13]]);
                        meta.vfcsize = if data[15] == 0 { 2 } else { data[15] };
                        meta.size = if meta.nblk == 0 {
                            0
                        } else {
                            (meta.nblk as u64 - 1) * 512 + meta.lnch as u64
                        };
                        log::debug!(
                            "file record FORMAT: fmt {} att {:#04x} rsiz {} nblk {} lnch {} size {}",
                            meta.recfmt,
                            meta.recattr.0,
                            meta.recsize,
                            meta.nblk,
                            meta.lnch,
                            meta.size
                        );
                    } else {
                        log::warn!("file record FORMAT too short: {} bytes", data.len());
                    }
                }
                FREC_CTIME => meta.ctime = vms_to_unix(data),
                FREC_MTIME => meta.mtime = vms_to_unix(data),
                FREC_ATIME => meta.atime = vms_to_unix(data),
                FREC_BTIME => meta.btime = vms_to_unix(data),
                FREC_DIRECTORY => {
                    meta.directory = data.first().copied().unwrap_or(0) != 0;
                }
                code if FREC_TOLERATED.contains(&code) => {
                    log::trace!("file record field 0x{:02X} ({} bytes) skipped", code, data.len());
                }
                code => {
                    log::warn!(
                        "file record field 0x{:02X} ({} bytes) undefined",
                        code,
                        data.len()
                    );
                    meta.undefined_fields += 1;
                }
            }
        }

        if meta.recfmt & FORMAT_MAIL_BIT != 0 || meta.name.contains(".MAI") {
            meta.mail = true;
        }
        Ok(meta)
    }

    /// The record format with the mail bit masked off; `None` for codes
    /// outside the known set.
    pub fn format(&self) -> Option<RecordFormat> {
        RecordFormat::from_code(self.recfmt & 0x1F)
    }

    /// Format tag for listings and filename suffixes, e.g. `VFC2`.
    pub fn format_tag(&self) -> String {
        match self.format() {
            Some(RecordFormat::Vfc) => format!("VFC{}", self.vfcsize),
            Some(f) => f.name().to_string(),
            None => format!("FMT{}", self.recfmt & 0x1F),
        }
    }
}

#[cfg(test)]
pub(crate) mod test_support {
    use super::*;

    /// Assemble a file record payload from metadata, in the canonical field
    /// order a real producer uses.
    pub fn build_file_record(
        name: &str,
        size: u64,
        recfmt: u8,
        recattr: u8,
        recsize: u16,
        vfcsize: u8,
        mtime_ticks: u64,
    ) -> Vec<u8> {
        let mut payload = vec![1u8, 1u8];
        let mut push = |code: u16, data: &[u8]| {
            payload.extend_from_slice(&(data.len() as u16).to_le_bytes());
            payload.extend_from_slice(&code.to_le_bytes());
            payload.extend_from_slice(data);
        };

        push(FREC_FNAME, name.as_bytes());
        push(FREC_UID, &[0x40, 0x00, 0x10, 0x00]);

        let nblk = if size == 0 { 0 } else { (size - 1) / 512 + 1 };
        let lnch = if size == 0 {
            0
        } else {
            (size - (nblk - 1) * 512) as u16
        };
        let mut fmt = [0u8; 32];
        fmt[0] = recfmt;
        fmt[1] = recattr;
        fmt[2..4].copy_from_slice(&recsize.to_le_bytes());
        fmt[8..10].copy_from_slice(&((nblk >> 16) as u16).to_le_bytes());
        fmt[10..12].copy_from_slice(&(nblk as u16).to_le_bytes());
        fmt[12..14].copy_from_slice(&lnch.to_le_bytes());
        fmt[15] = vfcsize;
        push(FREC_FORMAT, &fmt);

        let mut time = [0u8; 8];
        time[0..4].copy_from_slice(&((mtime_ticks & 0xFFFF_FFFF) as u32).to_le_bytes());
        time[4..8].copy_from_slice(&((mtime_ticks >> 32) as u32).to_le_bytes());
        push(FREC_MTIME, &time);
        push(FREC_DIRECTORY, &[0]);
        push(FREC_END, &[]);
        payload
    }
}
