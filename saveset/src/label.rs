//! ANSI-style 80-byte tape labels.
//!
//! A saveset is bracketed by VOL1/HDR1/HDR2 labels at the front and
//! EOF1/EOF2 at the back, each an 80-byte record with fixed-position ASCII
//! fields. Anything else of any length between labels is data.

/// Every label record is exactly this long.
pub const LABEL_SIZE: usize = 80;

/// Width of the name fields in VOL1/HDR1 labels.
pub const LABEL_NAME_LEN: usize = 14;

/// A recognised tape label.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Label {
    /// `VOL1`: volume name (informational).
    Volume { name: String },
    /// `HDR1`: saveset file name and zero-padded decimal sequence number.
    Header1 { name: String, sequence: u32 },
    /// `HDR2`: zero-padded decimal blocksize.
    Header2 { blocksize: u32 },
    EndOfFile1,
    EndOfFile2,
}

/// Which saveset(s) on the tape to decode.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub enum SavesetSelector {
    /// Decode every saveset on the tape.
    #[default]
    All,
    /// The saveset whose HDR1 name matches (14 characters, space padded).
    Name(String),
    /// The saveset with this HDR1 sequence number.
    Number(u32),
    /// The nth HDR1 label encountered on the tape, counting from 1.
    Ordinal(u32),
}

impl SavesetSelector {
    /// Pad a user-supplied name to the 14-character field width used for
    /// HDR1 comparison.
    pub fn padded_name(name: &str) -> String {
        format!("{:<width$}", name, width = LABEL_NAME_LEN)
    }
}

/// Parse one 80-byte record as a label. Returns `None` for records of the
/// wrong length or without a known label sentinel.
pub fn parse_label(rec: &[u8]) -> Option<Label> {
    if rec.len() != LABEL_SIZE {
        return None;
    }
    match &rec[0..4] {
        b"VOL1" => Some(Label::Volume {
            name: field_string(&rec[4..18]),
        }),
        b"HDR1" => Some(Label::Header1 {
            name: field_string(&rec[4..18]),
            sequence: field_number(&rec[31..35]),
        }),
        b"HDR2" => Some(Label::Header2 {
            blocksize: field_number(&rec[5..10]),
        }),
        b"EOF1" => Some(Label::EndOfFile1),
        b"EOF2" => Some(Label::EndOfFile2),
        _ => None,
    }
}

/// Extract a fixed-width ASCII field, trimming trailing blanks and NULs.
fn field_string(field: &[u8]) -> String {
    let s: String = field
        .iter()
        .map(|&b| if b.is_ascii() && b != 0 { b as char } else { ' ' })
        .collect();
    s.trim_end().to_string()
}

/// Parse a zero-padded decimal field; non-digits terminate the scan.
fn field_number(field: &[u8]) -> u32 {
    let mut n = 0u32;
    for &b in field {
        if b == b' ' && n == 0 {
            continue;
        }
        if !b.is_ascii_digit() {
            break;
        }
        n = n.saturating_mul(10).saturating_add((b - b'0') as u32);
    }
    n
}
