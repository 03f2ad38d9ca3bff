//! Look-ahead block buffer pool.
//!
//! BACKUP writes redundancy groups: blocks can arrive duplicated, missing,
//! or out of order. The pool keeps up to `MAX_BUFFCOUNT` blocks in flight,
//! resolves duplicates (the later copy wins), and hands blocks to the framer
//! in ascending block-number order.
//!
//! Buffers live in a single preallocated arena; the free and busy lists are
//! intrusive chains of arena indices, with index 0 reserved as the list
//! terminator. A buffer with `amt == 0` on the busy list is a tape-mark
//! sentinel and always sorts to the tail.

use crate::block::block_number;
use crate::error::{Result, SavesetError};
use crate::tape::{RecordOutcome, TapeReader};

/// Number of look-ahead buffers. The saveset summary reports the producer's
/// /BUFFER_COUNT but the pool ignores it and always uses this many.
pub const MAX_BUFFCOUNT: usize = 10;

struct BuffCtl {
    data: Vec<u8>,
    /// Index of the next buffer on whichever list this one is on; 0 ends
    /// the chain.
    next: usize,
    /// Bytes of data in this buffer; 0 marks a tape-mark sentinel.
    amt: usize,
    blknum: u32,
}

/// What the pool hands back for each fetch.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BlockFetch {
    /// Arena index of the oldest in-order block. The caller must `release`
    /// it when done.
    Block(usize),
    TapeMark,
    /// The first block of the saveset was not block number 1.
    NoLeadingBlock,
}

pub struct BlockPool {
    buffers: Vec<BuffCtl>,
    free_head: usize,
    busy_head: usize,
    num_busy: usize,
    /// Bytes allocated per buffer; a little larger than the blocksize.
    capacity: usize,
}

impl Default for BlockPool {
    fn default() -> Self {
        Self::new()
    }
}

impl BlockPool {
    pub fn new() -> BlockPool {
        let mut buffers = Vec::with_capacity(MAX_BUFFCOUNT + 1);
        for _ in 0..=MAX_BUFFCOUNT {
            buffers.push(BuffCtl {
                data: Vec::new(),
                next: 0,
                amt: 0,
                blknum: 0,
            });
        }
        let mut pool = BlockPool {
            buffers,
            free_head: 0,
            busy_head: 0,
            num_busy: 0,
            capacity: 0,
        };
        pool.free_all();
        pool
    }

    /// Grow every buffer to hold `blocksize` bytes. Called whenever a HDR2
    /// label announces a larger blocksize.
    pub fn resize(&mut self, blocksize: u32) {
        let wanted = blocksize as usize + 16;
        if wanted > self.capacity {
            self.capacity = wanted;
        }
        for buff in &mut self.buffers[1..] {
            if buff.data.len() < self.capacity {
                buff.data.resize(self.capacity, 0);
            }
        }
    }

    /// Put every buffer back on the free list.
    pub fn free_all(&mut self) {
        for ii in 1..self.buffers.len() {
            self.buffers[ii].next = if ii < MAX_BUFFCOUNT { ii + 1 } else { 0 };
            self.buffers[ii].amt = 0;
            self.buffers[ii].blknum = 0;
        }
        self.free_head = 1;
        self.busy_head = 0;
        self.num_busy = 0;
    }

    fn get_free(&mut self) -> Option<usize> {
        if self.free_head == 0 {
            return None;
        }
        let idx = self.free_head;
        self.free_head = self.buffers[idx].next;
        self.buffers[idx].next = 0;
        self.buffers[idx].amt = 0;
        self.buffers[idx].blknum = 0;
        Some(idx)
    }

    /// Return a buffer to the free list.
    pub fn release(&mut self, idx: usize) {
        self.buffers[idx].next = self.free_head;
        self.free_head = idx;
    }

    fn add_busy_tail(&mut self, idx: usize) {
        self.buffers[idx].next = 0;
        if self.busy_head == 0 {
            self.busy_head = idx;
        } else {
            let mut tail = self.busy_head;
            while self.buffers[tail].next != 0 {
                tail = self.buffers[tail].next;
            }
            self.buffers[tail].next = idx;
        }
        self.num_busy += 1;
    }

    fn pop_busy(&mut self) -> Option<usize> {
        if self.busy_head == 0 {
            return None;
        }
        let idx = self.busy_head;
        self.busy_head = self.buffers[idx].next;
        self.buffers[idx].next = 0;
        self.num_busy -= 1;
        Some(idx)
    }

    /// Block number a busy buffer carries.
    pub fn block_num(&self, idx: usize) -> u32 {
        self.buffers[idx].blknum
    }

    /// Move a buffer's data out for processing; pair with `restore`.
    pub fn take_data(&mut self, idx: usize) -> Vec<u8> {
        std::mem::take(&mut self.buffers[idx].data)
    }

    pub fn restore(&mut self, idx: usize, data: Vec<u8>) {
        self.buffers[idx].data = data;
    }

    /// Fetch the next in-order block, filling the look-ahead as needed.
    ///
    /// The first fetch of a saveset must find block number 1; anything else
    /// is `NoLeadingBlock`. A tape mark seen during look-ahead queues a
    /// sentinel so the remaining buffered blocks drain before `TapeMark` is
    /// reported.
    pub fn read_next_block(
        &mut self,
        tape: &mut TapeReader,
        blocksize: u32,
    ) -> Result<BlockFetch> {
        if self.busy_head == 0 {
            match self.fetch_leading_block(tape, blocksize)? {
                Some(fetch) => return Ok(fetch),
                None => {}
            }
        }

        if self.buffers[self.busy_head].amt == 0 {
            let idx = self.pop_busy().expect("busy head checked above");
            self.release(idx);
            return Ok(BlockFetch::TapeMark);
        }

        // If the tail is already a tape-mark sentinel there is nothing left
        // to read; just drain the queue.
        let mut tail = self.busy_head;
        while self.buffers[tail].next != 0 {
            tail = self.buffers[tail].next;
        }
        let mut hit_tm = self.buffers[tail].amt == 0;

        while !hit_tm && self.num_busy < MAX_BUFFCOUNT {
            while !hit_tm && self.num_busy < MAX_BUFFCOUNT {
                let idx = self
                    .get_free()
                    .ok_or(SavesetError::PoolExhausted { busy: self.num_busy })?;
                let filled = self.fill_buffer(tape, blocksize, idx, &mut hit_tm)?;
                if filled {
                    self.add_busy_tail(idx);
                } else {
                    self.release(idx);
                }
            }
            self.remove_dups()?;
        }

        if hit_tm {
            let idx = self
                .get_free()
                .ok_or(SavesetError::PoolExhausted { busy: self.num_busy })?;
            // amt == 0 marks the sentinel.
            self.add_busy_tail(idx);
        }

        let idx = self.pop_busy().expect("busy list cannot be empty here");
        Ok(BlockFetch::Block(idx))
    }

    /// First read of a saveset: skip invalid records until block 1 shows up.
    /// `Some` short-circuits the fetch; `None` means block 1 is queued.
    fn fetch_leading_block(
        &mut self,
        tape: &mut TapeReader,
        blocksize: u32,
    ) -> Result<Option<BlockFetch>> {
        let idx = self
            .get_free()
            .ok_or(SavesetError::PoolExhausted { busy: self.num_busy })?;
        loop {
            let cap = self.capacity;
            let amt = match tape.next_record(&mut self.buffers[idx].data[..cap])? {
                RecordOutcome::TapeMark | RecordOutcome::EndOfTape => {
                    self.release(idx);
                    return Ok(Some(BlockFetch::TapeMark));
                }
                RecordOutcome::Record(n) => n,
            };
            if amt != blocksize as usize {
                log::warn!(
                    "record size incorrect: read {} bytes, expected {}",
                    amt,
                    blocksize
                );
                continue;
            }
            match block_number(&self.buffers[idx].data, blocksize) {
                None => continue,
                Some(1) => {
                    self.buffers[idx].amt = amt;
                    self.buffers[idx].blknum = 1;
                    break;
                }
                Some(numb) => {
                    log::warn!("saveset does not start with block 1 (found {})", numb);
                    self.release(idx);
                    return Ok(Some(BlockFetch::NoLeadingBlock));
                }
            }
        }
        self.add_busy_tail(idx);
        Ok(None)
    }

    /// Read records into buffer `idx` until a valid block arrives or a tape
    /// mark stops the look-ahead. Returns whether the buffer was filled.
    fn fill_buffer(
        &mut self,
        tape: &mut TapeReader,
        blocksize: u32,
        idx: usize,
        hit_tm: &mut bool,
    ) -> Result<bool> {
        loop {
            let cap = self.capacity;
            let amt = match tape.next_record(&mut self.buffers[idx].data[..cap])? {
                RecordOutcome::TapeMark | RecordOutcome::EndOfTape => {
                    *hit_tm = true;
                    return Ok(false);
                }
                RecordOutcome::Record(n) => n,
            };
            if amt != blocksize as usize {
                log::warn!(
                    "record size on readahead incorrect: read {} bytes, expected {}",
                    amt,
                    blocksize
                );
                continue;
            }
            match block_number(&self.buffers[idx].data, blocksize) {
                None => continue,
                Some(numb) => {
                    self.buffers[idx].amt = amt;
                    self.buffers[idx].blknum = numb;
                    return Ok(true);
                }
            }
        }
    }

    /// Resolve duplicate block numbers (the later copy wins) and order the
    /// busy list by ascending block number, sentinels last.
    fn remove_dups(&mut self) -> Result<()> {
        if self.num_busy <= 1 {
            return Ok(());
        }

        let mut list = Vec::with_capacity(self.num_busy);
        let mut idx = self.busy_head;
        while idx != 0 {
            list.push(idx);
            idx = self.buffers[idx].next;
        }
        if list.len() != self.num_busy {
            log::error!(
                "busy list count ({}) does not match num_busy ({})",
                list.len(),
                self.num_busy
            );
            return Err(SavesetError::PoolExhausted { busy: self.num_busy });
        }

        // Later duplicates replace earlier originals in place.
        let mut ii = 0;
        while ii < list.len() {
            let blknum = self.buffers[list[ii]].blknum;
            let dup = (ii + 1..list.len())
                .find(|&jj| self.buffers[list[jj]].amt != 0 && self.buffers[list[jj]].blknum == blknum);
            match dup {
                Some(jj) => {
                    log::info!("found duplicate block {}, discarded the earlier copy", blknum);
                    let original = list[ii];
                    list[ii] = list[jj];
                    list.remove(jj);
                    self.release(original);
                    self.num_busy -= 1;
                    // Re-examine this slot; a triple duplicate is possible.
                }
                None => ii += 1,
            }
        }

        // Missing blocks are not filled in; the framer notices the gap.
        list.sort_by_key(|&idx| {
            if self.buffers[idx].amt == 0 {
                u32::MAX
            } else {
                self.buffers[idx].blknum
            }
        });

        for pair in list.windows(2) {
            self.buffers[pair[0]].next = pair[1];
        }
        if let Some(&last) = list.last() {
            self.buffers[last].next = 0;
        }
        self.busy_head = list[0];
        Ok(())
    }
}
