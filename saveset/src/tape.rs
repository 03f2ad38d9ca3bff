use std::fs::File;
use std::io::{BufReader, Cursor, Read, Seek, SeekFrom};
use std::path::Path;

use flate2::read::GzDecoder;

use crate::error::{Result, SavesetError};

/// Largest physical record a tape can carry. Anything longer is a framing
/// error on the producer's side; we deliver the first `MAX_RECORD` bytes and
/// skip the rest.
pub const MAX_RECORD: usize = 65536;

/// SIMH length sentinel for end-of-medium (-1 interpreted signed).
pub const SIMH_END_OF_MEDIUM: u32 = 0xFFFF_FFFF;

/// How physical records are framed in the input.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TapeFlavor {
    /// A real tape device in variable-block mode: one `read(2)` returns one
    /// record, a zero-length read is a tape mark.
    Device,
    /// Disk image: `<u32 len LE><len bytes>`, len 0 = tape mark, EOF = end
    /// of tape.
    Simple,
    /// SIMH `.tap` image: like `Simple` but each record is also suffixed by
    /// the same length field, and 0xFFFFFFFF means end-of-medium.
    Simh,
}

/// A reader that transparently handles plain and gzip-compressed tape images,
/// plus raw device access.
pub enum TapeSource {
    File(BufReader<File>),
    Memory(Cursor<Vec<u8>>),
    /// Unbuffered: on a tape device each read() must map to one record.
    Device(File),
}

impl Read for TapeSource {
    fn read(&mut self, buf: &mut [u8]) -> std::io::Result<usize> {
        match self {
            TapeSource::File(r) => r.read(buf),
            TapeSource::Memory(r) => r.read(buf),
            TapeSource::Device(r) => r.read(buf),
        }
    }
}

impl TapeSource {
    fn skip(&mut self, n: u64) -> std::io::Result<()> {
        match self {
            TapeSource::File(r) => {
                r.seek_relative(n as i64)?;
            }
            TapeSource::Memory(r) => {
                r.seek(SeekFrom::Current(n as i64))?;
            }
            TapeSource::Device(r) => {
                r.seek(SeekFrom::Current(n as i64))?;
            }
        }
        Ok(())
    }
}

/// Outcome of reading one physical record.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RecordOutcome {
    /// A record of this many bytes was read into the caller's buffer.
    Record(usize),
    TapeMark,
    /// Terminal: SIMH end-of-medium sentinel, or the reader was already
    /// exhausted.
    EndOfTape,
}

/// Yields physical records one at a time, with the two-tape-marks stop rule.
///
/// After two successive tape marks the reader is terminal and yields only
/// `TapeMark`; after a SIMH end-of-medium sentinel it yields only
/// `EndOfTape`.
pub struct TapeReader {
    src: TapeSource,
    flavor: TapeFlavor,
    /// Running bit mask of tape marks: bit 0 is the most recent read.
    marks: u8,
    end_of_medium: bool,
    offset: u64,
}

/// Open a tape image or device and return a record reader.
///
/// Image paths ending in `.gz` are fully decompressed into memory. This is
/// intentional: compressed images are primarily unit-test fixtures, and a
/// memory cursor keeps the framing reader trivially seekable.
pub fn open_tape(path: &Path, flavor: TapeFlavor) -> std::io::Result<TapeReader> {
    let is_gz = path.to_str().map(|s| s.ends_with(".gz")).unwrap_or(false);

    let src = if flavor == TapeFlavor::Device {
        TapeSource::Device(File::open(path)?)
    } else if is_gz {
        let file = File::open(path)?;
        let mut decoder = GzDecoder::new(file);
        let mut buf = Vec::new();
        decoder.read_to_end(&mut buf)?;
        TapeSource::Memory(Cursor::new(buf))
    } else {
        TapeSource::File(BufReader::new(File::open(path)?))
    };

    Ok(TapeReader::new(src, flavor))
}

impl TapeReader {
    pub fn new(src: TapeSource, flavor: TapeFlavor) -> Self {
        TapeReader {
            src,
            flavor,
            marks: 0,
            end_of_medium: false,
            offset: 0,
        }
    }

    /// Byte offset of the next unread framing byte (diagnostics only;
    /// meaningless for the device flavor).
    pub fn offset(&self) -> u64 {
        self.offset
    }

    /// True once two successive tape marks (or end-of-medium) have been seen.
    pub fn at_end(&self) -> bool {
        self.end_of_medium || (self.marks & 3) == 3
    }

    /// Read the next physical record into `buf`.
    ///
    /// Records longer than `buf` are not truncated silently: `buf.len()`
    /// bytes are delivered, the excess is skipped, and the caller is expected
    /// to notice the size mismatch.
    pub fn next_record(&mut self, buf: &mut [u8]) -> Result<RecordOutcome> {
        if self.end_of_medium {
            return Ok(RecordOutcome::EndOfTape);
        }
        if (self.marks & 3) == 3 {
            log::debug!("tape reader exhausted: two tape marks in a row");
            return Ok(RecordOutcome::TapeMark);
        }
        self.marks <<= 1;

        match self.flavor {
            TapeFlavor::Device => self.next_device_record(buf),
            TapeFlavor::Simple | TapeFlavor::Simh => self.next_image_record(buf),
        }
    }

    fn next_device_record(&mut self, buf: &mut [u8]) -> Result<RecordOutcome> {
        match self.src.read(buf) {
            Ok(0) => {
                self.marks |= 1;
                Ok(RecordOutcome::TapeMark)
            }
            Ok(n) => {
                self.offset += n as u64;
                Ok(RecordOutcome::Record(n))
            }
            Err(e) => {
                // Mark progress so a persistently failing drive still reaches
                // the two-mark stop instead of looping forever.
                self.marks |= 1;
                Err(e.into())
            }
        }
    }

    fn next_image_record(&mut self, buf: &mut [u8]) -> Result<RecordOutcome> {
        let len = match self.read_length()? {
            Some(len) => len,
            None => {
                // End of the image file doubles as end of tape.
                self.marks |= 1;
                return Ok(RecordOutcome::TapeMark);
            }
        };

        if len == 0 {
            self.marks |= 1;
            return Ok(RecordOutcome::TapeMark);
        }
        if self.flavor == TapeFlavor::Simh && len == SIMH_END_OF_MEDIUM {
            self.end_of_medium = true;
            return Ok(RecordOutcome::EndOfTape);
        }

        let len = len as usize;
        let take = len.min(buf.len());
        if take < len {
            log::warn!(
                "record of {} bytes too long for {} byte buffer, excess skipped",
                len,
                buf.len()
            );
        }

        let start = self.offset;
        let got = self.read_fully(&mut buf[..take])?;
        if got < take {
            return Err(SavesetError::TruncatedRecord {
                offset: start,
                expected: len,
                got,
            });
        }
        if take < len {
            self.src.skip((len - take) as u64)?;
            self.offset += (len - take) as u64;
        }

        if self.flavor == TapeFlavor::Simh {
            let trailer = match self.read_length()? {
                Some(t) => t,
                None => {
                    return Err(SavesetError::TruncatedRecord {
                        offset: self.offset,
                        expected: 4,
                        got: 0,
                    });
                }
            };
            if trailer as usize != len {
                return Err(SavesetError::FramingMismatch {
                    offset: start,
                    leading: len as u32,
                    trailing: trailer,
                });
            }
        }

        Ok(RecordOutcome::Record(take))
    }

    /// Read one little-endian u32 length field; `None` at end of file.
    fn read_length(&mut self) -> Result<Option<u32>> {
        let mut lenbuf = [0u8; 4];
        let got = self.read_fully(&mut lenbuf)?;
        if got == 0 {
            return Ok(None);
        }
        if got < 4 {
            return Err(SavesetError::TruncatedRecord {
                offset: self.offset - got as u64,
                expected: 4,
                got,
            });
        }
        Ok(Some(u32::from_le_bytes(lenbuf)))
    }

    fn read_fully(&mut self, buf: &mut [u8]) -> Result<usize> {
        let mut done = 0;
        while done < buf.len() {
            let n = self.src.read(&mut buf[done..])?;
            if n == 0 {
                break;
            }
            done += n;
        }
        self.offset += done as u64;
        Ok(done)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn image(bytes: Vec<u8>, flavor: TapeFlavor) -> TapeReader {
        TapeReader::new(TapeSource::Memory(Cursor::new(bytes)), flavor)
    }

    fn simple_record(data: &[u8]) -> Vec<u8> {
        let mut v = (data.len() as u32).to_le_bytes().to_vec();
        v.extend_from_slice(data);
        v
    }

    fn simh_record(data: &[u8]) -> Vec<u8> {
        let mut v = simple_record(data);
        v.extend_from_slice(&(data.len() as u32).to_le_bytes());
        v
    }

    #[test]
    fn test_simple_records_and_tape_marks() {
        let mut bytes = simple_record(b"hello");
        bytes.extend_from_slice(&0u32.to_le_bytes()); // tape mark
        bytes.extend(simple_record(b"world!"));

        let mut r = image(bytes, TapeFlavor::Simple);
        let mut buf = [0u8; 64];

        assert_eq!(r.next_record(&mut buf).unwrap(), RecordOutcome::Record(5));
        assert_eq!(&buf[..5], b"hello");
        assert_eq!(r.next_record(&mut buf).unwrap(), RecordOutcome::TapeMark);
        assert_eq!(r.next_record(&mut buf).unwrap(), RecordOutcome::Record(6));
        assert_eq!(&buf[..6], b"world!");
    }

    #[test]
    fn test_two_tape_marks_are_terminal() {
        let mut bytes = Vec::new();
        bytes.extend_from_slice(&0u32.to_le_bytes());
        bytes.extend_from_slice(&0u32.to_le_bytes());
        bytes.extend(simple_record(b"unreachable"));

        let mut r = image(bytes, TapeFlavor::Simple);
        let mut buf = [0u8; 64];

        assert_eq!(r.next_record(&mut buf).unwrap(), RecordOutcome::TapeMark);
        assert_eq!(r.next_record(&mut buf).unwrap(), RecordOutcome::TapeMark);
        assert!(r.at_end());
        // Terminal: further reads keep yielding tape marks.
        assert_eq!(r.next_record(&mut buf).unwrap(), RecordOutcome::TapeMark);
        assert_eq!(r.next_record(&mut buf).unwrap(), RecordOutcome::TapeMark);
    }

    #[test]
    fn test_eof_counts_as_tape_mark() {
        let bytes = simple_record(b"only");
        let mut r = image(bytes, TapeFlavor::Simple);
        let mut buf = [0u8; 64];

        assert_eq!(r.next_record(&mut buf).unwrap(), RecordOutcome::Record(4));
        assert_eq!(r.next_record(&mut buf).unwrap(), RecordOutcome::TapeMark);
        assert_eq!(r.next_record(&mut buf).unwrap(), RecordOutcome::TapeMark);
        assert!(r.at_end());
    }

    #[test]
    fn test_simh_trailer_verified() {
        let mut bytes = simh_record(b"abcd");
        // Corrupt the trailing length of a second record.
        bytes.extend_from_slice(&4u32.to_le_bytes());
        bytes.extend_from_slice(b"wxyz");
        bytes.extend_from_slice(&5u32.to_le_bytes());

        let mut r = image(bytes, TapeFlavor::Simh);
        let mut buf = [0u8; 64];

        assert_eq!(r.next_record(&mut buf).unwrap(), RecordOutcome::Record(4));
        match r.next_record(&mut buf) {
            Err(SavesetError::FramingMismatch {
                leading, trailing, ..
            }) => {
                assert_eq!(leading, 4);
                assert_eq!(trailing, 5);
            }
            other => panic!("expected framing mismatch, got {:?}", other),
        }
    }

    #[test]
    fn test_simh_end_of_medium() {
        let mut bytes = simh_record(b"data");
        bytes.extend_from_slice(&SIMH_END_OF_MEDIUM.to_le_bytes());

        let mut r = image(bytes, TapeFlavor::Simh);
        let mut buf = [0u8; 64];

        assert_eq!(r.next_record(&mut buf).unwrap(), RecordOutcome::Record(4));
        assert_eq!(r.next_record(&mut buf).unwrap(), RecordOutcome::EndOfTape);
        assert!(r.at_end());
        assert_eq!(r.next_record(&mut buf).unwrap(), RecordOutcome::EndOfTape);
    }

    #[test]
    fn test_oversize_record_delivered_and_skipped() {
        let mut bytes = simple_record(&[0xAA; 32]);
        bytes.extend(simple_record(b"next"));

        let mut r = image(bytes, TapeFlavor::Simple);
        let mut buf = [0u8; 16];

        assert_eq!(r.next_record(&mut buf).unwrap(), RecordOutcome::Record(16));
        assert_eq!(buf, [0xAA; 16]);
        // The excess was skipped, so the stream stays in sync.
        assert_eq!(r.next_record(&mut buf).unwrap(), RecordOutcome::Record(4));
        assert_eq!(&buf[..4], b"next");
    }

    #[test]
    fn test_simh_oversize_record_keeps_trailer_sync() {
        let mut bytes = simh_record(&[0x55; 40]);
        bytes.extend(simh_record(b"ok"));

        let mut r = image(bytes, TapeFlavor::Simh);
        let mut buf = [0u8; 8];

        assert_eq!(r.next_record(&mut buf).unwrap(), RecordOutcome::Record(8));
        assert_eq!(r.next_record(&mut buf).unwrap(), RecordOutcome::Record(2));
        assert_eq!(&buf[..2], b"ok");
    }

    #[test]
    fn test_truncated_image_is_an_error() {
        let mut bytes = (100u32).to_le_bytes().to_vec();
        bytes.extend_from_slice(&[1, 2, 3]); // 3 of 100 promised bytes

        let mut r = image(bytes, TapeFlavor::Simple);
        let mut buf = [0u8; 256];
        assert!(matches!(
            r.next_record(&mut buf),
            Err(SavesetError::TruncatedRecord { .. })
        ));
    }
}
