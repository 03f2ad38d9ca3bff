//! Saveset block framing.
//!
//! Every saveset block starts with a 256-byte header followed by a stream of
//! typed records, each introduced by a 20-byte record header. All integers
//! are little-endian.

use thiserror::Error;

/// Fixed size of the block header; the header's own size field must agree.
pub const BLOCK_HEADER_SIZE: usize = 256;

/// Size of the per-record header inside a block.
pub const RECORD_HEADER_SIZE: usize = 20;

/// Parsed saveset block header.
///
/// The CRC field is carried but not validated; the checksum algorithm has
/// not been determined.
#[derive(Debug, Clone)]
pub struct BlockHeader {
    pub header_size: u16,
    pub opsys: u16,
    pub subsys: u16,
    pub applic: u16,
    /// 1-origin block number, monotonically increasing within a saveset.
    pub number: u32,
    pub struclev: u16,
    pub volnum: u16,
    pub crc: u32,
    /// Declared blocksize: either 0 or the saveset's blocksize.
    pub blocksize: u32,
    pub flags: u32,
    pub saveset_name: String,
    /// Informational only.
    pub filename: String,
}

impl BlockHeader {
    /// Parse the leading 256 bytes of a block. Returns `None` only when the
    /// buffer is too short to hold a header; field validation is the
    /// caller's business.
    pub fn parse(buf: &[u8]) -> Option<BlockHeader> {
        if buf.len() < BLOCK_HEADER_SIZE {
            return None;
        }
        Some(BlockHeader {
            header_size: get_u16(buf, 0),
            opsys: get_u16(buf, 2),
            subsys: get_u16(buf, 4),
            applic: get_u16(buf, 6),
            number: get_u32(buf, 8),
            struclev: get_u16(buf, 32),
            volnum: get_u16(buf, 34),
            crc: get_u32(buf, 36),
            blocksize: get_u32(buf, 40),
            flags: get_u32(buf, 44),
            saveset_name: counted_string(&buf[48..80]),
            filename: counted_string(&buf[92..220]),
        })
    }
}

/// Extract and sanity-check the block number of a raw block.
///
/// Returns `None` (after logging) if the declared header size is wrong, the
/// declared blocksize disagrees with the saveset's, or the number itself is
/// zero.
pub fn block_number(buf: &[u8], saveset_blocksize: u32) -> Option<u32> {
    let header = BlockHeader::parse(buf)?;
    if header.header_size as usize != BLOCK_HEADER_SIZE {
        log::warn!(
            "invalid block header size: expected {}, found {}",
            BLOCK_HEADER_SIZE,
            header.header_size
        );
        return None;
    }
    if header.blocksize != 0 && header.blocksize != saveset_blocksize {
        log::warn!(
            "invalid blocksize: expected {}, found {}",
            saveset_blocksize,
            header.blocksize
        );
        return None;
    }
    if header.number == 0 {
        return None;
    }
    Some(header.number)
}

/// Record types carried inside a block.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RecordKind {
    Null,
    Summary,
    Volume,
    File,
    Vbn,
    PhysVol,
    Lbn,
    Fid,
    Unknown(u16),
}

impl RecordKind {
    pub fn from_code(code: u16) -> RecordKind {
        match code {
            0 => RecordKind::Null,
            1 => RecordKind::Summary,
            2 => RecordKind::Volume,
            3 => RecordKind::File,
            4 => RecordKind::Vbn,
            5 => RecordKind::PhysVol,
            6 => RecordKind::Lbn,
            7 => RecordKind::Fid,
            other => RecordKind::Unknown(other),
        }
    }
}

/// The 20-byte header introducing each typed record.
#[derive(Debug, Clone, Copy)]
pub struct RecordHeader {
    pub size: u16,
    pub kind: RecordKind,
    pub flags: u32,
    pub address: u32,
}

#[derive(Error, Debug, Clone, Copy, PartialEq, Eq)]
#[error("record at block offset {offset} declares {rsize} bytes but only {remaining} remain")]
pub struct RecordOverrun {
    pub offset: usize,
    pub rsize: u16,
    pub remaining: usize,
}

/// Walks the typed records of one block, yielding each record header and its
/// payload slice. A record whose size overruns the block yields an error and
/// ends the walk.
pub struct RecordWalk<'a> {
    buf: &'a [u8],
    bsize: usize,
    pos: usize,
    failed: bool,
}

impl<'a> RecordWalk<'a> {
    /// `bsize` is the saveset blocksize; the walk covers
    /// `buf[BLOCK_HEADER_SIZE..bsize]`.
    pub fn new(buf: &'a [u8], bsize: usize) -> RecordWalk<'a> {
        RecordWalk {
            buf,
            bsize: bsize.min(buf.len()),
            pos: BLOCK_HEADER_SIZE,
            failed: false,
        }
    }
}

impl<'a> Iterator for RecordWalk<'a> {
    type Item = Result<(RecordHeader, &'a [u8]), RecordOverrun>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.failed || self.pos + RECORD_HEADER_SIZE > self.bsize {
            return None;
        }
        let at = self.pos;
        let header = RecordHeader {
            size: get_u16(self.buf, at),
            kind: RecordKind::from_code(get_u16(self.buf, at + 2)),
            flags: get_u32(self.buf, at + 4),
            address: get_u32(self.buf, at + 8),
        };
        let start = at + RECORD_HEADER_SIZE;
        let end = start + header.size as usize;
        if end > self.bsize {
            self.failed = true;
            return Some(Err(RecordOverrun {
                offset: at,
                rsize: header.size,
                remaining: self.bsize - start,
            }));
        }
        self.pos = end;
        Some(Ok((header, &self.buf[start..end])))
    }
}

fn get_u16(buf: &[u8], at: usize) -> u16 {
    u16::from_le_bytes([buf[at], buf[at + 1]])
}

fn get_u32(buf: &[u8], at: usize) -> u32 {
    u32::from_le_bytes([buf[at], buf[at + 1], buf[at + 2], buf[at + 3]])
}

/// Fixed-width text field: printable ASCII up to the first NUL, trailing
/// blanks trimmed.
fn counted_string(field: &[u8]) -> String {
    let end = field.iter().position(|&b| b == 0).unwrap_or(field.len());
    field[..end]
        .iter()
        .map(|&b| if b.is_ascii_graphic() || b == b' ' { b as char } else { '.' })
        .collect::<String>()
        .trim_end()
        .to_string()
}

#[cfg(test)]
pub(crate) mod test_support {
    use super::*;

    /// Build a raw block: header fields plus `(kind, payload)` records,
    /// zero-padded to `bsize`.
    pub fn build_block(number: u32, bsize: usize, records: &[(u16, Vec<u8>)]) -> Vec<u8> {
        let mut buf = vec![0u8; bsize];
        buf[0..2].copy_from_slice(&(BLOCK_HEADER_SIZE as u16).to_le_bytes());
        buf[6..8].copy_from_slice(&1u16.to_le_bytes()); // applic
        buf[8..12].copy_from_slice(&number.to_le_bytes());
        buf[40..44].copy_from_slice(&(bsize as u32).to_le_bytes());

        let mut pos = BLOCK_HEADER_SIZE;
        for (kind, payload) in records {
            buf[pos..pos + 2].copy_from_slice(&(payload.len() as u16).to_le_bytes());
            buf[pos + 2..pos + 4].copy_from_slice(&kind.to_le_bytes());
            pos += RECORD_HEADER_SIZE;
            buf[pos..pos + payload.len()].copy_from_slice(payload);
            pos += payload.len();
        }
        buf
    }
}

#[cfg(test)]
mod tests {
    use super::test_support::build_block;
    use super::*;

    #[test]
    fn test_header_roundtrip() {
        let block = build_block(7, 2048, &[]);
        let header = BlockHeader::parse(&block).unwrap();
        assert_eq!(header.header_size, 256);
        assert_eq!(header.number, 7);
        assert_eq!(header.blocksize, 2048);
        assert_eq!(header.applic, 1);
    }

    #[test]
    fn test_block_number_validation() {
        let block = build_block(3, 2048, &[]);
        assert_eq!(block_number(&block, 2048), Some(3));

        // Declared blocksize 0 is acceptable.
        let mut zero_bs = block.clone();
        zero_bs[40..44].copy_from_slice(&0u32.to_le_bytes());
        assert_eq!(block_number(&zero_bs, 2048), Some(3));

        // Mismatched blocksize is not.
        assert_eq!(block_number(&block, 8192), None);

        // Wrong header size field.
        let mut bad_hs = block.clone();
        bad_hs[0..2].copy_from_slice(&512u16.to_le_bytes());
        assert_eq!(block_number(&bad_hs, 2048), None);

        // Block number zero is invalid.
        let zero_num = build_block(0, 2048, &[]);
        assert_eq!(block_number(&zero_num, 2048), None);
    }

    #[test]
    fn test_record_walk() {
        let block = build_block(
            1,
            2048,
            &[(1, vec![0xAA; 10]), (4, vec![0xBB; 6]), (0, vec![])],
        );
        let records: Vec<_> = RecordWalk::new(&block, 2048)
            .collect::<Result<_, _>>()
            .unwrap();
        // The zero padding after the last real record reads as null records.
        assert!(records.len() >= 3);
        assert_eq!(records[0].0.kind, RecordKind::Summary);
        assert_eq!(records[0].1, &[0xAA; 10]);
        assert_eq!(records[1].0.kind, RecordKind::Vbn);
        assert_eq!(records[1].1, &[0xBB; 6]);
        assert_eq!(records[2].0.kind, RecordKind::Null);
        assert!(records[3..].iter().all(|(h, _)| h.kind == RecordKind::Null));
    }

    #[test]
    fn test_record_overrun() {
        let mut block = build_block(1, 512, &[]);
        // Record claiming more bytes than the block holds.
        block[256..258].copy_from_slice(&5000u16.to_le_bytes());
        block[258..260].copy_from_slice(&4u16.to_le_bytes());

        let mut walk = RecordWalk::new(&block, 512);
        match walk.next().unwrap() {
            Err(RecordOverrun { rsize, offset, .. }) => {
                assert_eq!(rsize, 5000);
                assert_eq!(offset, 256);
            }
            other => panic!("expected overrun, got {:?}", other),
        }
        assert!(walk.next().is_none());
    }

    #[test]
    fn test_unknown_record_kind() {
        assert_eq!(RecordKind::from_code(9), RecordKind::Unknown(9));
        assert_eq!(RecordKind::from_code(2), RecordKind::Volume);
    }
}
