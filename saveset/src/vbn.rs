//! Per-file record reassembly.
//!
//! A file's bytes arrive as a train of VBN records spread across saveset
//! blocks. For FIX/STM/RAW formats the payload passes straight through; for
//! VAR/VFC each logical record is prefixed by a little-endian u16 length
//! (0xFFFF marks end of file) and padded to even alignment, with VFC records
//! additionally carrying leading carriage-control bytes. Record boundaries
//! routinely straddle block boundaries, so all parse state lives on the
//! current file and survives between calls.

use serde::Serialize;

use crate::error::{Result, SavesetError};
use crate::file::{FileErrors, FileMeta, RecordFormat};
use crate::output::OutputFiles;

/// What to do with the two control bytes of each VFC record.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum VfcPolicy {
    /// Drop them; records come out bare.
    Discard,
    /// Translate them to newlines/form-feeds/overprint carriage controls.
    #[default]
    Decode,
    /// Leave them in-line as record data.
    Keep,
}

/// Reassembly automaton phase.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize)]
pub enum FileState {
    #[default]
    Idle,
    GetRecordCount,
    GetVfc,
    GetData,
}

/// Result of feeding one VBN record to the automaton.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VbnOutcome {
    Continue,
    /// The file is complete (or unrecoverable); skip its remaining records.
    SkipFile,
}

/// Decode state for the file currently being reassembled.
pub struct CurrentFile {
    pub meta: FileMeta,
    /// Effective record format; degrades to `Raw` on a corrupt length field.
    pub format: RecordFormat,
    pub state: FileState,
    /// Whether this file matched the caller's name patterns.
    pub selected: bool,
    /// Binary preservation: the primary output receives the undecoded byte
    /// stream. Used for VAR/VFC files without carriage-control attributes.
    pub binary: bool,
    /// Bytes still owed to the current VAR/VFC record.
    pub reclen: u32,
    /// VFC control bytes still to consume for the current record.
    vfc_pending: u8,
    /// The captured control pair of the current VFC record.
    vfc: [u8; 2],
    /// Low byte of a record length split across a block boundary.
    carry: Option<u8>,
    /// Input bytes consumed, including length prefixes, VFC bytes and pads.
    pub inbound: u64,
    /// Bytes written to the primary output.
    pub outbound: u64,
    pub rec_count: u64,
    /// Even-alignment pad bytes consumed; they count here, not as data.
    pub rec_padding: u64,
    last_written: u8,
    pub errors: FileErrors,
    pub output: Option<OutputFiles>,
}

impl CurrentFile {
    pub fn new(meta: FileMeta, format: RecordFormat, selected: bool) -> CurrentFile {
        let binary = format.has_length_prefix() && !meta.recattr.any();
        CurrentFile {
            meta,
            format,
            state: FileState::Idle,
            selected,
            binary,
            reclen: 0,
            vfc_pending: 0,
            vfc: [0; 2],
            carry: None,
            inbound: 0,
            outbound: 0,
            rec_count: 0,
            rec_padding: 0,
            last_written: 0,
            errors: FileErrors::default(),
            output: None,
        }
    }

    /// Write translated output; suppressed in binary-preservation mode,
    /// where the primary receives the raw stream instead.
    fn emit_text(&mut self, bytes: &[u8]) -> Result<()> {
        if self.binary {
            return Ok(());
        }
        if let Some(out) = self.output.as_mut() {
            out.write_primary(bytes).map_err(SavesetError::Io)?;
        }
        self.outbound += bytes.len() as u64;
        if let Some(&last) = bytes.last() {
            self.last_written = last;
        }
        Ok(())
    }

    /// Byte-faithful copy of consumed input to the alternate stream, and to
    /// the primary as well in binary-preservation mode.
    fn emit_raw(&mut self, bytes: &[u8]) -> Result<()> {
        if bytes.is_empty() {
            return Ok(());
        }
        if let Some(out) = self.output.as_mut() {
            out.write_alternate(bytes).map_err(SavesetError::Io)?;
            if self.binary {
                out.write_primary(bytes).map_err(SavesetError::Io)?;
            }
        }
        if self.binary {
            self.outbound += bytes.len() as u64;
        }
        Ok(())
    }
}

/// Leading carriage control for a VFC record (decode policy).
pub fn vfc_leading(vfc0: u8) -> &'static [u8] {
    match vfc0 {
        // No prefix; '+' means overstrike the previous line.
        0x00 | b'+' => b"",
        b'0' => b"\n\n",
        b'1' => b"\x0c",
        // ' ', '$', and anything unrecognised advance one line.
        _ => b"\n",
    }
}

/// Trailing carriage control for a VFC record (decode policy).
pub fn vfc_trailing(vfc1: u8) -> Vec<u8> {
    if vfc1 == 0 {
        return Vec::new();
    }
    match vfc1 >> 5 {
        // Bit 7 clear: a count of newlines, then return to column one.
        0..=3 => {
            let mut out = vec![b'\n'; vfc1 as usize];
            out.push(b'\r');
            out
        }
        // 100: the literal control character in the low five bits.
        4 => vec![vfc1 & 0x1F],
        // 101..111: carriage return only.
        _ => vec![b'\r'],
    }
}

/// Feed one VBN record payload through the automaton.
///
/// Translated data goes to the file's primary output; every consumed input
/// byte additionally goes to the alternate stream verbatim. I/O errors
/// propagate so the caller can close both streams and skip the file.
pub fn process_vbn(
    file: &mut CurrentFile,
    payload: &[u8],
    policy: VfcPolicy,
) -> Result<VbnOutcome> {
    let rsize = payload.len();
    let size = file.meta.size;

    log::trace!(
        "vbn: {} bytes, fmt {:?}, reclen {}, inbound {}/{}",
        rsize,
        file.format,
        file.reclen,
        file.inbound,
        size
    );

    if file.inbound >= size {
        if file.meta.name.is_empty() {
            return Ok(VbnOutcome::SkipFile);
        }
        log::warn!(
            "'{}': more data than the declared size of {} bytes",
            file.meta.name,
            size
        );
    }

    let mut ii: usize = 0;

    'records: while file.inbound + (ii as u64) < size && ii < rsize {
        match file.format {
            RecordFormat::Stm
            | RecordFormat::StmLf
            | RecordFormat::Fix
            | RecordFormat::Fix11
            | RecordFormat::Raw => {
                file.state = FileState::GetData;
                let tlen = (rsize - ii).min((size - file.inbound) as usize - ii);
                file.emit_text(&payload[ii..ii + tlen])?;
                ii += tlen;
                file.reclen = 0;
            }

            RecordFormat::StmCr => {
                // Stream records delimited by bare carriage returns; emit
                // them as newlines.
                file.state = FileState::GetData;
                let tlen = (rsize - ii).min((size - file.inbound) as usize - ii);
                let translated: Vec<u8> = payload[ii..ii + tlen]
                    .iter()
                    .map(|&b| if b == b'\r' { b'\n' } else { b })
                    .collect();
                file.emit_text(&translated)?;
                ii += tlen;
                file.reclen = 0;
            }

            RecordFormat::Var | RecordFormat::Vfc => {
                if file.vfc_pending == 0 && file.reclen == 0 {
                    match read_record_length(file, payload, &mut ii, policy)? {
                        LengthStep::Have => {}
                        LengthStep::NeedMore => break 'records,
                        LengthStep::EndOfFile => {
                            file.inbound += ii as u64;
                            file.emit_raw(&payload[..ii])?;
                            if file.inbound > size {
                                log::warn!(
                                    "'{}': consumed {} bytes, {} more than the declared size",
                                    file.meta.name,
                                    file.inbound,
                                    file.inbound - size
                                );
                            }
                            file.inbound = size;
                            file.state = FileState::Idle;
                            return Ok(VbnOutcome::SkipFile);
                        }
                    }
                    // A blank record (or a degraded format) finishes here.
                    if file.reclen == 0 && file.vfc_pending == 0 {
                        continue 'records;
                    }
                }
                if file.vfc_pending > 0 {
                    consume_vfc(file, payload, &mut ii, policy)?;
                    if file.vfc_pending > 0 {
                        // Control bytes continue in the next block.
                        break 'records;
                    }
                }

                file.state = FileState::GetData;
                let mut tlen = (file.reclen as usize).min(rsize - ii);
                let budget = size - (file.inbound + ii as u64);
                if tlen as u64 > budget {
                    log::warn!(
                        "'{}': record data exceeds the declared file size, trimming {} bytes",
                        file.meta.name,
                        tlen as u64 - budget
                    );
                    tlen = budget as usize;
                    file.reclen = tlen as u32;
                }
                file.emit_text(&payload[ii..ii + tlen])?;
                file.reclen -= tlen as u32;
                ii += tlen;

                if file.reclen == 0 {
                    finish_record(file, policy)?;
                    // Records are padded to even alignment; the pad byte is
                    // charged to rec_padding, not file data.
                    if ii & 1 == 1 && ii < rsize {
                        ii += 1;
                        file.rec_padding += 1;
                    }
                    file.state = FileState::GetRecordCount;
                }
            }
        }
    }

    if file.inbound + ii as u64 > size {
        log::warn!(
            "'{}': consumed past the declared size (format {:?}, inbound {}, size {})",
            file.meta.name,
            file.format,
            file.inbound + ii as u64,
            size
        );
    }
    file.inbound += ii as u64;
    if file.format.has_length_prefix() || file.errors.record_error {
        file.emit_raw(&payload[..ii])?;
    }

    if file.reclen != 0 {
        log::trace!(
            "'{}': record straddles block, {} bytes outstanding",
            file.meta.name,
            file.reclen
        );
    }
    if file.inbound >= size {
        log::debug!("'{}': reached end of file data", file.meta.name);
        file.state = FileState::Idle;
        return Ok(VbnOutcome::SkipFile);
    }
    Ok(VbnOutcome::Continue)
}

enum LengthStep {
    /// A record length is in hand; proceed with the record.
    Have,
    /// The length field straddles the block; wait for the next record.
    NeedMore,
    /// 0xFFFF end-of-file marker.
    EndOfFile,
}

/// Read the u16 record length, handling block-straddling, blank records,
/// the end-of-file marker, and corrupt lengths.
fn read_record_length(
    file: &mut CurrentFile,
    payload: &[u8],
    ii: &mut usize,
    policy: VfcPolicy,
) -> Result<LengthStep> {
    file.state = FileState::GetRecordCount;
    let rsize = payload.len();

    let carried = file.carry.is_some();
    let reclen = if let Some(lo) = file.carry.take() {
        let hi = payload[*ii];
        *ii += 1;
        u16::from_le_bytes([lo, hi])
    } else if rsize - *ii >= 2 {
        let v = u16::from_le_bytes([payload[*ii], payload[*ii + 1]]);
        *ii += 2;
        v
    } else {
        file.carry = Some(payload[*ii]);
        *ii += 1;
        return Ok(LengthStep::NeedMore);
    };

    file.rec_count += 1;
    file.vfc = [0; 2];
    log::trace!("new record mark: reclen {}, at {} of {}", reclen, *ii, rsize);

    if reclen == 0xFFFF {
        log::debug!("'{}': end-of-file record marker", file.meta.name);
        return Ok(LengthStep::EndOfFile);
    }

    if reclen == 0 {
        // A blank line is a record of zero length.
        file.emit_text(b"\n")?;
        return Ok(LengthStep::Have);
    }

    let limit = file.meta.recsize as u32 + file.meta.vfcsize as u32;
    if reclen as u32 > limit {
        let at = file.inbound + *ii as u64 - if carried { 1 } else { 2 };
        log::warn!(
            "'{}': record length {} (0x{:04X}) at offset 0x{:X} is invalid, must be <= {}; \
             converting to RAW to preserve the remaining bytes",
            file.meta.name,
            reclen,
            reclen,
            at,
            limit
        );
        file.errors.record_error = true;
        file.errors.note(at);
        file.format = RecordFormat::Raw;
        // The length bytes themselves become data again. When the low byte
        // came from the previous block it has already been consumed, so it
        // can only be replayed to the primary directly.
        if carried {
            file.emit_text(&[(reclen & 0xFF) as u8])?;
            *ii -= 1;
        } else {
            *ii -= 2;
        }
        file.reclen = 0;
        return Ok(LengthStep::Have);
    }

    file.reclen = reclen as u32;
    if file.format == RecordFormat::Vfc
        && !file.binary
        && policy != VfcPolicy::Keep
        && file.reclen >= file.meta.vfcsize as u32
    {
        file.vfc_pending = file.meta.vfcsize;
        file.state = FileState::GetVfc;
    }
    Ok(LengthStep::Have)
}

/// Consume VFC control bytes (possibly resuming across a block boundary);
/// under the decode policy the first byte produces leading carriage control.
fn consume_vfc(
    file: &mut CurrentFile,
    payload: &[u8],
    ii: &mut usize,
    policy: VfcPolicy,
) -> Result<()> {
    file.state = FileState::GetVfc;
    while file.vfc_pending > 0 && *ii < payload.len() {
        let got = file.meta.vfcsize - file.vfc_pending;
        if (got as usize) < file.vfc.len() {
            file.vfc[got as usize] = payload[*ii];
        }
        *ii += 1;
        file.vfc_pending -= 1;
        file.reclen -= 1;
    }
    if file.vfc_pending == 0 && policy == VfcPolicy::Decode {
        let lead = vfc_leading(file.vfc[0]);
        if !lead.is_empty() {
            file.emit_text(lead)?;
        }
    }
    Ok(())
}

/// Emit the carriage control that closes a completed record.
fn finish_record(file: &mut CurrentFile, policy: VfcPolicy) -> Result<()> {
    if file.binary {
        return Ok(());
    }
    if file.format == RecordFormat::Vfc && policy == VfcPolicy::Decode {
        let tail = vfc_trailing(file.vfc[1]);
        if !tail.is_empty() {
            file.emit_text(&tail)?;
        }
    } else if file.meta.recattr.wants_newline() && file.last_written != b'\x0c' {
        file.emit_text(b"\n")?;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::file::RecordAttributes;
    use std::fs;

    fn meta(format: RecordFormat, recattr: u8, recsize: u16, size: u64) -> FileMeta {
        FileMeta {
            name: "TEST.DAT;1".to_string(),
            recfmt: match format {
                RecordFormat::Raw => 0,
                RecordFormat::Fix => 1,
                RecordFormat::Var => 2,
                RecordFormat::Vfc => 3,
                RecordFormat::Stm => 4,
                RecordFormat::StmLf => 5,
                RecordFormat::StmCr => 6,
                RecordFormat::Fix11 => 11,
            },
            recattr: RecordAttributes(recattr),
            recsize,
            vfcsize: 2,
            size,
            ..FileMeta::default()
        }
    }

    fn walk_only(m: FileMeta) -> CurrentFile {
        let format = m.format().unwrap();
        CurrentFile::new(m, format, true)
    }

    /// A current file writing into a temp directory; returns the file and
    /// the paths of the primary and alternate outputs.
    fn writing(
        m: FileMeta,
        dir: &tempfile::TempDir,
        with_alternate: bool,
    ) -> (CurrentFile, std::path::PathBuf, std::path::PathBuf) {
        let primary = dir.path().join("out");
        let alternate = dir.path().join(".out");
        let format = m.format().unwrap();
        let mut file = CurrentFile::new(m, format, true);
        file.output = Some(
            OutputFiles::create(
                primary.clone(),
                with_alternate.then(|| alternate.clone()),
            )
            .unwrap(),
        );
        (file, primary, alternate)
    }

    fn finish(mut file: CurrentFile) {
        // Drop the writers so the files flush.
        file.output.take();
    }

    /// Build a VAR stream: length-prefixed records with even-byte padding.
    fn var_stream(records: &[&[u8]]) -> Vec<u8> {
        let mut out = Vec::new();
        for rec in records {
            out.extend_from_slice(&(rec.len() as u16).to_le_bytes());
            out.extend_from_slice(rec);
            if out.len() & 1 == 1 {
                out.push(0);
            }
        }
        out
    }

    #[test]
    fn test_fix_passthrough() {
        let dir = tempfile::tempdir().unwrap();
        let (mut file, primary, _) = writing(meta(RecordFormat::Fix, 0, 512, 1536), &dir, false);

        let mut stripe = vec![0u8; 512];
        for n in 0u8..3 {
            stripe.fill(n);
            let outcome = process_vbn(&mut file, &stripe, VfcPolicy::Decode).unwrap();
            if n < 2 {
                assert_eq!(outcome, VbnOutcome::Continue);
            } else {
                assert_eq!(outcome, VbnOutcome::SkipFile);
            }
        }
        assert_eq!(file.inbound, 1536);
        assert_eq!(file.outbound, 1536);
        finish(file);

        let written = fs::read(&primary).unwrap();
        assert_eq!(written.len(), 1536);
        assert_eq!(&written[..512], &[0u8; 512][..]);
        assert_eq!(&written[512..1024], &[1u8; 512][..]);
        assert_eq!(&written[1024..], &[2u8; 512][..]);
    }

    #[test]
    fn test_fix_trims_to_declared_size() {
        let dir = tempfile::tempdir().unwrap();
        let (mut file, primary, _) = writing(meta(RecordFormat::Fix, 0, 512, 700), &dir, false);

        assert_eq!(
            process_vbn(&mut file, &[0xAB; 512], VfcPolicy::Decode).unwrap(),
            VbnOutcome::Continue
        );
        assert_eq!(
            process_vbn(&mut file, &[0xCD; 512], VfcPolicy::Decode).unwrap(),
            VbnOutcome::SkipFile
        );
        assert_eq!(file.inbound, 700);
        finish(file);
        assert_eq!(fs::read(&primary).unwrap().len(), 700);
    }

    #[test]
    fn test_var_records_with_newlines() {
        let dir = tempfile::tempdir().unwrap();
        let stream = var_stream(&[b"hello", b"hi!"]);
        let size = stream.len() as u64;
        let (mut file, primary, alternate) =
            writing(meta(RecordFormat::Var, 0x02, 255, size), &dir, true);

        assert_eq!(
            process_vbn(&mut file, &stream, VfcPolicy::Decode).unwrap(),
            VbnOutcome::SkipFile
        );
        assert_eq!(file.rec_count, 2);
        assert_eq!(file.rec_padding, 2); // "hello" and "hi!" are both odd
        assert_eq!(file.inbound, size);
        finish(file);

        assert_eq!(fs::read(&primary).unwrap(), b"hello\nhi!\n");
        // The alternate holds the raw stream, pads included.
        assert_eq!(fs::read(&alternate).unwrap(), stream);
    }

    #[test]
    fn test_var_blank_record() {
        let dir = tempfile::tempdir().unwrap();
        let stream = var_stream(&[b"a", b"", b"b"]);
        let size = stream.len() as u64;
        let (mut file, primary, _) =
            writing(meta(RecordFormat::Var, 0x02, 255, size), &dir, false);

        process_vbn(&mut file, &stream, VfcPolicy::Decode).unwrap();
        assert_eq!(file.rec_count, 3);
        finish(file);
        assert_eq!(fs::read(&primary).unwrap(), b"a\n\nb\n");
    }

    #[test]
    fn test_var_record_straddles_blocks() {
        let dir = tempfile::tempdir().unwrap();
        // One 6-byte record split 2+4 across two VBN payloads.
        let mut stream = var_stream(&[b"abcdef"]);
        let second = stream.split_off(4);
        let size = 8u64;
        let (mut file, primary, _) =
            writing(meta(RecordFormat::Var, 0x02, 255, size), &dir, false);

        assert_eq!(
            process_vbn(&mut file, &stream, VfcPolicy::Decode).unwrap(),
            VbnOutcome::Continue
        );
        assert_eq!(file.reclen, 4);
        assert_eq!(
            process_vbn(&mut file, &second, VfcPolicy::Decode).unwrap(),
            VbnOutcome::SkipFile
        );
        finish(file);
        assert_eq!(fs::read(&primary).unwrap(), b"abcdef\n");
    }

    #[test]
    fn test_var_length_field_straddles_blocks() {
        let dir = tempfile::tempdir().unwrap();
        // First payload ends with only the low length byte.
        let mut stream = var_stream(&[b"ab", b"cd"]);
        assert_eq!(stream.len(), 8);
        let second = stream.split_off(5);
        let size = 8u64;
        let (mut file, primary, _) =
            writing(meta(RecordFormat::Var, 0x02, 255, size), &dir, false);

        assert_eq!(
            process_vbn(&mut file, &stream, VfcPolicy::Decode).unwrap(),
            VbnOutcome::Continue
        );
        assert_eq!(
            process_vbn(&mut file, &second, VfcPolicy::Decode).unwrap(),
            VbnOutcome::SkipFile
        );
        assert_eq!(file.rec_count, 2);
        finish(file);
        assert_eq!(fs::read(&primary).unwrap(), b"ab\ncd\n");
    }

    #[test]
    fn test_var_end_of_file_marker() {
        let dir = tempfile::tempdir().unwrap();
        let mut stream = var_stream(&[b"xy"]);
        stream.extend_from_slice(&0xFFFFu16.to_le_bytes());
        stream.extend_from_slice(b"junk after eof");
        // Declared size larger than what arrives before the marker.
        let (mut file, primary, _) =
            writing(meta(RecordFormat::Var, 0x02, 255, 100), &dir, false);

        assert_eq!(
            process_vbn(&mut file, &stream, VfcPolicy::Decode).unwrap(),
            VbnOutcome::SkipFile
        );
        // Clamped to the declared size, state reset.
        assert_eq!(file.inbound, 100);
        assert_eq!(file.state, FileState::Idle);
        finish(file);
        assert_eq!(fs::read(&primary).unwrap(), b"xy\n");
    }

    #[test]
    fn test_corrupt_reclen_degrades_to_raw() {
        let dir = tempfile::tempdir().unwrap();
        let mut stream = var_stream(&[b"ok"]);
        let good_len = stream.len();
        // A length far beyond recsize+vfcsize.
        stream.extend_from_slice(&0x4242u16.to_le_bytes());
        stream.extend_from_slice(b"rest of the block");
        let size = stream.len() as u64;
        let (mut file, primary, alternate) =
            writing(meta(RecordFormat::Var, 0x02, 80, size), &dir, true);

        assert_eq!(
            process_vbn(&mut file, &stream, VfcPolicy::Decode).unwrap(),
            VbnOutcome::SkipFile
        );
        assert!(file.errors.record_error);
        assert_eq!(file.errors.first_error_offset, Some(good_len as u64));
        assert_eq!(file.format, RecordFormat::Raw);
        assert_eq!(file.inbound, size);
        finish(file);

        // After the good record everything is preserved verbatim, including
        // the bogus length bytes.
        let mut expect = b"ok\n".to_vec();
        expect.extend_from_slice(&0x4242u16.to_le_bytes());
        expect.extend_from_slice(b"rest of the block");
        assert_eq!(fs::read(&primary).unwrap(), expect);
        // The alternate has the entire input stream.
        assert_eq!(fs::read(&alternate).unwrap(), stream);
    }

    #[test]
    fn test_vfc_decode() {
        let dir = tempfile::tempdir().unwrap();
        // Two VFC records: vfc0='1' (form feed), vfc1=0x01 (1 LF + CR),
        // then vfc0=' ' (newline), vfc1=0x8D (101..: CR only).
        let mut stream = Vec::new();
        stream.extend_from_slice(&8u16.to_le_bytes());
        stream.extend_from_slice(b"1\x01PAGE1!");
        stream.extend_from_slice(&7u16.to_le_bytes());
        stream.extend_from_slice(b" \x8dLINE2");
        stream.push(0); // pad
        let size = stream.len() as u64;
        let (mut file, primary, _) =
            writing(meta(RecordFormat::Vfc, 0x04, 80, size), &dir, false);

        assert_eq!(
            process_vbn(&mut file, &stream, VfcPolicy::Decode).unwrap(),
            VbnOutcome::SkipFile
        );
        finish(file);
        assert_eq!(fs::read(&primary).unwrap(), b"\x0cPAGE1!\n\r\nLINE2\r");
    }

    #[test]
    fn test_vfc_discard() {
        let dir = tempfile::tempdir().unwrap();
        let mut stream = Vec::new();
        stream.extend_from_slice(&7u16.to_le_bytes());
        stream.extend_from_slice(b"1\x01HELLO");
        stream.push(0);
        let size = stream.len() as u64;
        let (mut file, primary, _) =
            writing(meta(RecordFormat::Vfc, 0x04, 80, size), &dir, false);

        process_vbn(&mut file, &stream, VfcPolicy::Discard).unwrap();
        finish(file);
        // Control bytes dropped, print-file attribute adds the newline.
        assert_eq!(fs::read(&primary).unwrap(), b"HELLO\n");
    }

    #[test]
    fn test_vfc_keep() {
        let dir = tempfile::tempdir().unwrap();
        let mut stream = Vec::new();
        stream.extend_from_slice(&7u16.to_le_bytes());
        stream.extend_from_slice(b"1\x01HELLO");
        stream.push(0);
        let size = stream.len() as u64;
        let (mut file, primary, _) =
            writing(meta(RecordFormat::Vfc, 0x04, 80, size), &dir, false);

        process_vbn(&mut file, &stream, VfcPolicy::Keep).unwrap();
        finish(file);
        assert_eq!(fs::read(&primary).unwrap(), b"1\x01HELLO\n");
    }

    #[test]
    fn test_forced_binary_var_without_attributes() {
        let dir = tempfile::tempdir().unwrap();
        let stream = var_stream(&[b"hello", b"hi!"]);
        let size = stream.len() as u64;
        let (mut file, primary, _) =
            writing(meta(RecordFormat::Var, 0x00, 255, size), &dir, false);
        assert!(file.binary);

        process_vbn(&mut file, &stream, VfcPolicy::Decode).unwrap();
        finish(file);
        // The primary holds the undecoded stream, prefixes and pads intact.
        assert_eq!(fs::read(&primary).unwrap(), stream);
    }

    #[test]
    fn test_stmcr_translates_carriage_returns() {
        let dir = tempfile::tempdir().unwrap();
        let stream = b"line one\rline two\r".to_vec();
        let (mut file, primary, _) = writing(
            meta(RecordFormat::StmCr, 0, 0, stream.len() as u64),
            &dir,
            false,
        );

        process_vbn(&mut file, &stream, VfcPolicy::Decode).unwrap();
        finish(file);
        assert_eq!(fs::read(&primary).unwrap(), b"line one\nline two\n");
    }

    #[test]
    fn test_walk_without_output() {
        // Listing mode still walks the chain and keeps the accounting.
        let stream = var_stream(&[b"hello", b"hi!"]);
        let size = stream.len() as u64;
        let mut file = walk_only(meta(RecordFormat::Var, 0x02, 255, size));

        assert_eq!(
            process_vbn(&mut file, &stream, VfcPolicy::Decode).unwrap(),
            VbnOutcome::SkipFile
        );
        assert_eq!(file.inbound, size);
        assert_eq!(file.rec_count, 2);
    }

    #[test]
    fn test_vfc_tables() {
        assert_eq!(vfc_leading(0x00), b"");
        assert_eq!(vfc_leading(b'+'), b"");
        assert_eq!(vfc_leading(b' '), b"\n");
        assert_eq!(vfc_leading(b'$'), b"\n");
        assert_eq!(vfc_leading(b'0'), b"\n\n");
        assert_eq!(vfc_leading(b'1'), b"\x0c");
        assert_eq!(vfc_leading(b'Q'), b"\n");

        assert_eq!(vfc_trailing(0x00), b"");
        assert_eq!(vfc_trailing(0x01), b"\n\r");
        assert_eq!(vfc_trailing(0x03), b"\n\n\n\r");
        assert_eq!(vfc_trailing(0x8D), b"\x0d");
        assert_eq!(vfc_trailing(0xA0), b"\r");
        assert_eq!(vfc_trailing(0xFF), b"\r");
    }
}
