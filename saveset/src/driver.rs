//! The saveset decode loop: find a saveset by its labels, pull blocks
//! through the pool in order, dispatch their records, and read the trailing
//! labels, repeating until the tape runs out.
//!
//! Data errors never abort the run. Components request recovery by setting
//! skip bits on the decoder, and the loop advances to the next file, block,
//! or saveset accordingly.

use crate::block::{self, BlockHeader, RecordKind, RecordWalk};
use crate::error::Result;
use crate::file::{FileMeta, RecordFormat};
use crate::label::{parse_label, Label, SavesetSelector, LABEL_SIZE};
use crate::output::{Extractor, OutputOptions};
use crate::pool::{BlockFetch, BlockPool};
use crate::report::{DecodeReport, FileEntry, SavesetReport};
use crate::summary::SavesetSummary;
use crate::tape::{RecordOutcome, TapeReader, MAX_RECORD};
use crate::vbn::{process_vbn, CurrentFile, VbnOutcome, VfcPolicy};

/// Decides which files are listed/extracted; names are legacy-style
/// (`[DIR]NAME.TYPE;VER`).
pub type NameFilter = Box<dyn Fn(&str) -> bool>;

/// What to do with the files found on the tape.
pub enum DecodeMode {
    /// Walk everything and report, writing nothing.
    List,
    /// Extract selected files to the host filesystem.
    Extract(OutputOptions),
}

pub struct DecodeOptions {
    pub mode: DecodeMode,
    pub select: SavesetSelector,
    pub vfc: VfcPolicy,
    /// `None` selects every file.
    pub filter: Option<NameFilter>,
}

impl Default for DecodeOptions {
    fn default() -> Self {
        DecodeOptions {
            mode: DecodeMode::List,
            select: SavesetSelector::All,
            vfc: VfcPolicy::default(),
            filter: None,
        }
    }
}

/// Pending recovery requests, set by any decode stage and observed by the
/// driver loop.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SkipState(u8);

impl SkipState {
    const FILE: u8 = 1;
    const BLOCK: u8 = 2;
    const SAVESET: u8 = 4;

    pub fn file(self) -> bool {
        self.0 & Self::FILE != 0
    }

    pub fn block(self) -> bool {
        self.0 & Self::BLOCK != 0
    }

    pub fn saveset(self) -> bool {
        self.0 & Self::SAVESET != 0
    }

    pub fn set_file(&mut self) {
        self.0 |= Self::FILE;
    }

    pub fn set_block(&mut self) {
        self.0 |= Self::BLOCK;
    }

    pub fn set_saveset(&mut self) {
        self.0 |= Self::SAVESET;
    }

    pub fn clear_file(&mut self) {
        self.0 &= !Self::FILE;
    }

    pub fn clear_block(&mut self) {
        self.0 &= !Self::BLOCK;
    }
}

/// A saveset located by the label scanner.
struct SavesetHead {
    name: String,
    sequence: u32,
    blocksize: u32,
}

/// Drives the whole decode: owns the tape, the pool, the current file, and
/// the accumulated report.
pub struct Decoder {
    tape: TapeReader,
    opts: DecodeOptions,
    pool: BlockPool,
    extractor: Option<Extractor>,
    /// Scratch buffer for label scanning and skip-to-mark reads.
    scratch: Vec<u8>,
    blocksize: u32,
    last_block: u32,
    skip: SkipState,
    current: Option<CurrentFile>,
    ss_errors: u32,
    total_errors: u32,
    /// HDR1 labels seen so far, for ordinal selection.
    num_headers: u32,
    report: DecodeReport,
    current_ss: Option<SavesetReport>,
}

impl Decoder {
    pub fn new(tape: TapeReader, opts: DecodeOptions) -> Decoder {
        let extractor = match &opts.mode {
            DecodeMode::Extract(out) => Some(Extractor::new(out.clone())),
            DecodeMode::List => None,
        };
        Decoder {
            tape,
            opts,
            pool: BlockPool::new(),
            extractor,
            scratch: vec![0u8; MAX_RECORD],
            blocksize: 0,
            last_block: 0,
            skip: SkipState::default(),
            current: None,
            ss_errors: 0,
            total_errors: 0,
            num_headers: 0,
            report: DecodeReport::default(),
            current_ss: None,
        }
    }

    /// Decode every selected saveset on the tape.
    pub fn run(mut self) -> Result<DecodeReport> {
        loop {
            let head = match self.read_header()? {
                Some(head) => head,
                None => break,
            };
            self.begin_saveset(head);

            loop {
                match self.pool.read_next_block(&mut self.tape, self.blocksize) {
                    Ok(BlockFetch::Block(idx)) => {
                        let blknum = self.pool.block_num(idx);
                        if blknum != self.last_block + 1 {
                            log::warn!(
                                "block {} out of sequence, expected {}",
                                blknum,
                                self.last_block + 1
                            );
                            self.ss_errors += 1;
                            if let Some(cur) = self.current.as_mut() {
                                cur.errors.block_error = true;
                                cur.errors.note(cur.inbound);
                            }
                            self.close_current_file();
                            self.skip.set_file();
                        }
                        let data = self.pool.take_data(idx);
                        self.process_block(&data);
                        self.pool.restore(idx, data);
                        self.pool.release(idx);
                    }
                    Ok(BlockFetch::TapeMark) => {
                        self.read_trailer();
                        self.pool.free_all();
                        self.skip = SkipState::default();
                        break;
                    }
                    Ok(BlockFetch::NoLeadingBlock) => {
                        self.ss_errors += 1;
                        self.skip.set_saveset();
                        self.skip_to_tape_mark();
                        self.pool.free_all();
                        break;
                    }
                    Err(e) => {
                        log::warn!("read error, skipping the rest of the saveset: {}", e);
                        self.ss_errors += 1;
                        self.skip.set_saveset();
                        self.skip_to_tape_mark();
                        self.pool.free_all();
                        break;
                    }
                }
            }
            self.finish_saveset();
        }

        self.finish_saveset();
        log::info!("end of tape");
        if self.total_errors > 0 {
            log::warn!("a total of {} errors detected", self.total_errors);
        }
        self.report.total_errors = self.total_errors;
        Ok(self.report)
    }

    fn begin_saveset(&mut self, head: SavesetHead) {
        log::info!(
            "saveset \"{}\" number {}, blocksize {}",
            head.name,
            head.sequence,
            head.blocksize
        );
        self.pool.resize(head.blocksize);
        self.pool.free_all();
        self.blocksize = head.blocksize;
        self.last_block = 0;
        self.skip = SkipState::default();
        self.current_ss = Some(SavesetReport {
            name: head.name,
            sequence: head.sequence,
            blocksize: head.blocksize,
            ..SavesetReport::default()
        });
    }

    fn finish_saveset(&mut self) {
        self.close_current_file();
        if let Some(mut ss) = self.current_ss.take() {
            if self.ss_errors > 0 {
                log::warn!("found {} errors in saveset \"{}\"", self.ss_errors, ss.name);
            }
            log::info!("end of saveset \"{}\"", ss.name);
            ss.errors = self.ss_errors;
            self.total_errors += self.ss_errors;
            self.ss_errors = 0;
            self.report.savesets.push(ss);
        }
    }

    /// Scan labels until the next selected saveset's HDR2 (and its closing
    /// tape mark) has been consumed. `None` means no more savesets.
    fn read_header(&mut self) -> Result<Option<SavesetHead>> {
        let mut marks: u8 = 0;
        // Two tape marks end the search; once a saveset is selected a single
        // mark ends the label group.
        let mut mark_stop: u8 = 3;
        // When a saveset is rejected, skip this many tape marks forward
        // (data, then trailer labels).
        let mut skip_marks = 0u32;
        let mut bad_records = 0u32;
        let mut name = String::new();
        let mut sequence = 0u32;
        let mut found: Option<u32> = None;

        loop {
            marks <<= 1;
            let outcome = match self.tape.next_record(&mut self.scratch) {
                Ok(o) => o,
                Err(e) => {
                    log::warn!("read error while scanning labels: {}", e);
                    self.ss_errors += 1;
                    if self.tape.at_end() {
                        return Ok(None);
                    }
                    continue;
                }
            };
            let len = match outcome {
                RecordOutcome::EndOfTape => return Ok(None),
                RecordOutcome::TapeMark => {
                    marks |= 1;
                    if marks & mark_stop == mark_stop {
                        break;
                    }
                    skip_marks = skip_marks.saturating_sub(1);
                    continue;
                }
                RecordOutcome::Record(len) => len,
            };
            if skip_marks > 0 {
                continue;
            }
            if len != LABEL_SIZE {
                if bad_records == 0 {
                    log::warn!(
                        "bad header record: expected {} bytes, got {}",
                        LABEL_SIZE,
                        len
                    );
                }
                bad_records += 1;
                continue;
            }
            match parse_label(&self.scratch[..LABEL_SIZE]) {
                Some(Label::Volume { name }) => {
                    log::info!("volume: {}", name);
                }
                Some(Label::Header1 {
                    name: hdr_name,
                    sequence: hdr_seq,
                }) => {
                    self.num_headers += 1;
                    log::debug!("HDR1 {}: \"{}\"", self.num_headers, hdr_name);
                    name = hdr_name;
                    sequence = hdr_seq;
                }
                Some(Label::Header2 { blocksize }) => {
                    log::debug!("HDR2: blocksize {}", blocksize);
                    match &self.opts.select {
                        SavesetSelector::All => {}
                        SavesetSelector::Name(want) => {
                            if want.trim_end() != name {
                                log::info!("skipping \"{}\": looking for \"{}\"", name, want);
                                skip_marks = 2;
                                continue;
                            }
                        }
                        SavesetSelector::Number(want) => {
                            if sequence < *want {
                                log::info!("skipping saveset number {}", sequence);
                                skip_marks = 2;
                                continue;
                            }
                            if sequence > *want {
                                log::info!(
                                    "saveset number {} is past {}, done",
                                    sequence,
                                    want
                                );
                                return Ok(None);
                            }
                        }
                        SavesetSelector::Ordinal(want) => {
                            if self.num_headers < *want {
                                log::info!("skipping header {} of {}", self.num_headers, want);
                                skip_marks = 2;
                                continue;
                            }
                            if self.num_headers > *want {
                                return Ok(None);
                            }
                        }
                    }
                    found = Some(blocksize);
                    mark_stop = 1;
                }
                Some(Label::EndOfFile1) | Some(Label::EndOfFile2) | None => {}
            }
        }

        if bad_records > 1 {
            log::warn!("skipped {} bad records looking for a HDR2", bad_records);
        }
        match found {
            Some(blocksize) => Ok(Some(SavesetHead {
                name,
                sequence,
                blocksize,
            })),
            None => Ok(None),
        }
    }

    /// Close the current file and consume the EOF label group after a
    /// saveset's data.
    fn read_trailer(&mut self) {
        self.close_current_file();
        loop {
            match self.tape.next_record(&mut self.scratch) {
                Ok(RecordOutcome::TapeMark) | Ok(RecordOutcome::EndOfTape) => break,
                Ok(RecordOutcome::Record(len)) => {
                    if len != LABEL_SIZE {
                        log::warn!(
                            "bad EOF label record: expected {} bytes, got {}",
                            LABEL_SIZE,
                            len
                        );
                        self.skip.set_saveset();
                        break;
                    }
                    if let Some(Label::EndOfFile1) = parse_label(&self.scratch[..LABEL_SIZE]) {
                        log::debug!("EOF labels read");
                    }
                }
                Err(e) => {
                    log::warn!("read error in EOF labels: {}", e);
                    self.ss_errors += 1;
                    if self.tape.at_end() {
                        break;
                    }
                }
            }
        }
    }

    /// Read and discard records until the next tape mark.
    fn skip_to_tape_mark(&mut self) {
        loop {
            match self.tape.next_record(&mut self.scratch) {
                Ok(RecordOutcome::TapeMark) | Ok(RecordOutcome::EndOfTape) => break,
                Ok(RecordOutcome::Record(_)) => {}
                Err(e) => {
                    log::debug!("read error while skipping to tape mark: {}", e);
                    if self.tape.at_end() {
                        break;
                    }
                }
            }
        }
    }

    /// Decode one in-order block: validate the header, then walk and
    /// dispatch its typed records.
    fn process_block(&mut self, data: &[u8]) {
        self.skip.clear_block();

        let numb = match block::block_number(data, self.blocksize) {
            Some(numb) => numb,
            None => {
                self.skip.set_block();
                self.ss_errors += 1;
                if let Some(cur) = self.current.as_mut() {
                    cur.errors.block_error = true;
                    cur.errors.note(cur.inbound);
                }
                return;
            }
        };
        if numb != self.last_block + 1 {
            if numb == self.last_block {
                log::warn!("block {} duplicated", numb);
            } else {
                log::warn!("block {} out of sequence, expected {}", numb, self.last_block + 1);
            }
        }
        self.last_block = numb;

        let Some(header) = BlockHeader::parse(data) else {
            self.skip.set_block();
            return;
        };
        log::trace!(
            "block {}: opsys {}, subsys {}, applic {}, ss \"{}\"",
            numb,
            header.opsys,
            header.subsys,
            header.applic,
            header.saveset_name
        );
        if header.blocksize == 0 || header.applic > 1 {
            log::debug!(
                "skipping block {}: blocksize {}, applic {}",
                numb,
                header.blocksize,
                header.applic
            );
            self.skip.set_block();
            return;
        }

        for item in RecordWalk::new(data, self.blocksize as usize) {
            let (rec, payload) = match item {
                Ok(pair) => pair,
                Err(overrun) => {
                    log::warn!("{}", overrun);
                    self.skip.set_block();
                    self.ss_errors += 1;
                    if let Some(cur) = self.current.as_mut() {
                        cur.errors.record_error = true;
                        cur.errors.note(cur.inbound);
                    }
                    break;
                }
            };
            match rec.kind {
                RecordKind::Null => {}
                RecordKind::Summary => self.handle_summary(payload),
                RecordKind::File => self.handle_file(payload),
                RecordKind::Vbn => {
                    if !self.skip.file() {
                        self.handle_vbn(payload);
                    }
                }
                RecordKind::Volume
                | RecordKind::PhysVol
                | RecordKind::Lbn
                | RecordKind::Fid => {
                    log::trace!("record type {:?} skipped", rec.kind);
                }
                RecordKind::Unknown(code) => {
                    log::warn!("{} is an invalid record type", code);
                    self.ss_errors += 1;
                    if let Some(cur) = self.current.as_mut() {
                        if cur.output.is_some() {
                            log::warn!("skipping the rest of '{}'", cur.meta.name);
                        }
                        cur.errors.record_error = true;
                        cur.errors.note(cur.inbound);
                    }
                    self.skip.set_block();
                    self.skip.set_file();
                    break;
                }
            }
        }
    }

    fn handle_summary(&mut self, payload: &[u8]) {
        match SavesetSummary::parse(payload) {
            Ok(summary) => {
                if let Some(name) = &summary.saveset_name {
                    log::info!("saveset name: \"{}\"", name);
                }
                if let Some(cmd) = &summary.command_line {
                    log::info!("command: \"{}\"", cmd);
                }
                if let (Some(os), Some(ver)) = (summary.os_name(), &summary.os_version) {
                    log::info!("written by {} {}", os, ver);
                }
                if let Some(ss) = self.current_ss.as_mut() {
                    ss.summary = Some(summary);
                }
            }
            Err(e) => {
                log::warn!("invalid summary record: {}", e);
                self.ss_errors += 1;
                self.skip.set_block();
            }
        }
    }

    /// A file record supersedes the current file: close it, parse the new
    /// header, decide whether to walk/extract, open outputs.
    fn handle_file(&mut self, payload: &[u8]) {
        self.close_current_file();

        let meta = match FileMeta::parse(payload) {
            Ok(meta) => meta,
            Err(e) => {
                log::warn!("invalid file record: {}", e);
                self.ss_errors += 1;
                self.skip.set_file();
                return;
            }
        };
        self.ss_errors += meta.undefined_fields;

        let selected = match &self.opts.filter {
            Some(filter) => filter(&meta.name),
            None => true,
        };
        let format = meta.format();
        log::debug!(
            "file \"{}\": {} bytes, {}{}",
            meta.name,
            meta.size,
            meta.format_tag(),
            if selected { "" } else { " (not selected)" }
        );

        let mut current =
            CurrentFile::new(meta, format.unwrap_or(RecordFormat::Raw), selected);

        // The producer's size fields are 32-bit; anything wider is garbage.
        if current.meta.size > u32::MAX as u64 {
            log::warn!(
                "\"{}\" not extracted: implausible size {}",
                current.meta.name,
                current.meta.size
            );
            current.errors.size_error = true;
            self.ss_errors += 1;
            self.skip.set_file();
            self.current = Some(current);
            return;
        }

        if current.meta.directory
            || current.meta.mail
            || (current.meta.recsize == 0
                && format.map(|f| f.has_length_prefix()).unwrap_or(false))
        {
            log::debug!(
                "skipping \"{}\": directory, mail file, or zero record size",
                current.meta.name
            );
            self.skip.set_file();
            self.current = Some(current);
            return;
        }

        if format.is_none() {
            log::warn!(
                "\"{}\": invalid record format {}",
                current.meta.name,
                current.meta.recfmt
            );
            current.errors.format_error = true;
            self.ss_errors += 1;
            self.skip.set_file();
            self.current = Some(current);
            return;
        }

        if selected {
            if let Some(extractor) = self.extractor.as_mut() {
                match extractor.open(&current.meta) {
                    Ok(files) => current.output = files,
                    Err(e) => {
                        log::warn!("cannot open output for \"{}\": {}", current.meta.name, e);
                        self.ss_errors += 1;
                    }
                }
            }
        }
        self.current = Some(current);
    }

    fn handle_vbn(&mut self, payload: &[u8]) {
        let Some(current) = self.current.as_mut() else {
            self.skip.set_file();
            return;
        };
        match process_vbn(current, payload, self.opts.vfc) {
            Ok(VbnOutcome::Continue) => {}
            Ok(VbnOutcome::SkipFile) => self.skip.set_file(),
            Err(e) => {
                log::warn!("write error on \"{}\": {}", current.meta.name, e);
                let at = current.inbound;
                current.errors.note(at);
                // Both streams are abandoned; the close below must not try
                // to flush half-written buffers again.
                current.output = None;
                self.ss_errors += 1;
                self.skip.set_file();
            }
        }
    }

    /// Close the file in progress: settle the size accounting, close and
    /// possibly rename the outputs, and append the report entry.
    fn close_current_file(&mut self) {
        self.skip.clear_file();
        let Some(mut current) = self.current.take() else {
            return;
        };

        if !current.meta.directory && !current.meta.mail {
            let walked = current.inbound > 0 || current.output.is_some();
            // The pad bytes consumed for even alignment may or may not be
            // charged to the declared size, depending on the producer.
            let size_ok = current.inbound == current.meta.size
                || current.inbound.saturating_sub(current.rec_padding) == current.meta.size;
            if walked && !size_ok {
                log::warn!(
                    "'{}' file size is not correct: is {}, should be {}; may be corrupt",
                    current.meta.name,
                    current.inbound,
                    current.meta.size
                );
                current.errors.size_error = true;
                self.ss_errors += 1;
            }
            log::debug!(
                "'{}': size {}, consumed {}, padding {}, records {}",
                current.meta.name,
                current.meta.size,
                current.inbound,
                current.rec_padding,
                current.rec_count
            );
        }

        let mut entry = FileEntry::from_meta(&current.meta, current.selected);
        entry.bytes_in = current.inbound;
        entry.bytes_out = current.outbound;
        entry.records = current.rec_count;

        if let Some(files) = current.output.take() {
            if let Some(extractor) = self.extractor.as_mut() {
                match extractor.close(files, &current.meta, &current.errors) {
                    Ok(closed) => entry.extracted_to = Some(closed.path),
                    Err(e) => {
                        log::warn!("error closing \"{}\": {}", current.meta.name, e);
                        self.ss_errors += 1;
                    }
                }
            }
        }

        entry.errors = current.errors;
        if let Some(ss) = self.current_ss.as_mut() {
            ss.files.push(entry);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_skip_state() {
        let mut skip = SkipState::default();
        assert!(!skip.file() && !skip.block() && !skip.saveset());

        skip.set_file();
        skip.set_block();
        assert!(skip.file() && skip.block());

        skip.clear_block();
        assert!(skip.file() && !skip.block());

        skip.set_saveset();
        skip.clear_file();
        assert!(!skip.file() && skip.saveset());
    }
}
