use log::{debug, trace, warn};

use crate::{
    protocol::{
        addr::{ContextTable, LinkAddr},
        datagram::{Datagram, IPV6_HDR_LEN},
        iphc::{self, Decompressed},
    },
    utils::{AckBitmap, AcquireError, BufferArena, BufferHandle},
};

const UNIT: usize = 8;
const UNIT_WORDS: usize = 8;

/// Identity of a datagram being reassembled.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ReassemblyKey {
    pub src: LinkAddr,
    pub tag: u16,
    /// Uncompressed datagram size
    pub size: u16,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReassemblyError {
    TableFull,
    OutOfMemory,
    OutOfHandles,
    UnknownFragment,
    Malformed,
    Overlap,
}

impl From<AcquireError> for ReassemblyError {
    fn from(e: AcquireError) -> Self {
        match e {
            AcquireError::OutOfMemory => ReassemblyError::OutOfMemory,
            AcquireError::OutOfHandles => ReassemblyError::OutOfHandles,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FragmentStatus {
    Accepted,
    Duplicate,
}

/// A datagram whose every byte arrived.
#[derive(Debug)]
pub struct CompletedDatagram {
    pub key: ReassemblyKey,
    pub dst_link: LinkAddr,
    pub datagram: Datagram,
    pub payload: Vec<u8>,
    pub received: AckBitmap,
}

#[derive(Debug)]
struct Record {
    key: ReassemblyKey,
    dst_link: LinkAddr,
    buf: BufferHandle,
    // 8-byte units of the uncompressed datagram
    filled: [u32; UNIT_WORDS],
    contiguous: usize,
    received: AckBitmap,
    last_seq: Option<u8>,
    skeleton: Option<Decompressed>,
    ttl: u32,
}

impl Record {
    #[inline]
    fn size(&self) -> usize {
        self.key.size as usize
    }

    #[inline]
    fn unit_filled(&self, unit: usize) -> bool {
        self.filled[unit / 32] & (1 << (unit % 32)) != 0
    }

    #[inline]
    fn fill_unit(&mut self, unit: usize) {
        self.filled[unit / 32] |= 1 << (unit % 32);
    }

    fn fill(&mut self, start: usize, end: usize) {
        let mut unit = start / UNIT;
        while unit * UNIT < end {
            self.fill_unit(unit);
            unit += 1;
        }
        self.advance();
    }

    fn advance(&mut self) {
        let size = self.size();
        while self.contiguous < size && self.unit_filled(self.contiguous / UNIT) {
            self.contiguous = usize::min(self.contiguous + UNIT, size);
        }
    }

    fn covered_len(&self) -> Option<usize> {
        self.skeleton.as_ref().map(|s| s.covered_len())
    }

    fn is_done(&self) -> bool {
        self.skeleton.is_some() && self.contiguous >= self.size()
    }

    fn is_done_by_bitmap(&self) -> bool {
        match self.last_seq {
            Some(last) => self.received.all_set_through(last),
            None => false,
        }
    }

    /// Compares the incoming bytes with those already stored.
    fn classify(
        &self,
        arena: &BufferArena,
        start: usize,
        bytes: &[u8],
    ) -> Result<FragmentStatus, ReassemblyError> {
        let end = start + bytes.len();
        let stored = arena.data(&self.buf);
        let mut all_filled = true;
        let mut unit = start / UNIT;
        while unit * UNIT < end {
            if self.unit_filled(unit) {
                let from = usize::max(unit * UNIT, start);
                let to = usize::min(unit * UNIT + UNIT, end);
                if from >= IPV6_HDR_LEN
                    && stored[from - IPV6_HDR_LEN..to - IPV6_HDR_LEN] != bytes[from - start..to - start]
                {
                    return Err(ReassemblyError::Overlap);
                }
            } else {
                all_filled = false;
            }
            unit += 1;
        }
        if all_filled {
            Ok(FragmentStatus::Duplicate)
        } else {
            Ok(FragmentStatus::Accepted)
        }
    }
}

/// Fixed table of datagrams under reassembly.
pub struct ReassemblyTable {
    records: Vec<Option<Record>>,
    ticks: u32,
}

impl ReassemblyTable {
    #[must_use]
    pub fn new(entries: usize, ticks: u32) -> Self {
        let mut records = Vec::with_capacity(entries);
        records.resize_with(entries, || None);
        let this = Self { records, ticks };
        this.check_rep();
        this
    }

    #[inline]
    fn check_rep(&self) {
        for record in self.records.iter().flatten() {
            assert!(record.contiguous <= record.size());
            assert!(record.ttl <= self.ticks);
        }
    }

    fn find(&self, key: &ReassemblyKey) -> Option<usize> {
        self.records
            .iter()
            .position(|r| r.as_ref().map(|r| &r.key) == Some(key))
    }

    fn remove(&mut self, arena: &mut BufferArena, index: usize) {
        if let Some(record) = self.records[index].take() {
            arena.release(record.buf);
        }
    }

    /// Finds the record of `key`, creating an empty one if there is none.
    pub fn ensure_record(
        &mut self,
        arena: &mut BufferArena,
        key: ReassemblyKey,
        dst_link: LinkAddr,
    ) -> Result<(), ReassemblyError> {
        self.ensure(arena, key, dst_link).map(|_| ())
    }

    fn ensure(
        &mut self,
        arena: &mut BufferArena,
        key: ReassemblyKey,
        dst_link: LinkAddr,
    ) -> Result<usize, ReassemblyError> {
        if let Some(index) = self.find(&key) {
            return Ok(index);
        }
        let size = key.size as usize;
        if size < IPV6_HDR_LEN {
            return Err(ReassemblyError::Malformed);
        }
        let index = self
            .records
            .iter()
            .position(|r| r.is_none())
            .ok_or(ReassemblyError::TableFull)?;
        let buf = arena.acquire(size - IPV6_HDR_LEN)?;
        self.records[index] = Some(Record {
            key,
            dst_link,
            buf,
            filled: [0; UNIT_WORDS],
            contiguous: 0,
            received: AckBitmap::new(),
            last_seq: None,
            skeleton: None,
            ttl: self.ticks,
        });
        debug!(
            "reassembly record; src: {:x}, tag: {}, size: {}",
            key.src.to_u64(),
            key.tag,
            key.size
        );
        self.check_rep();
        Ok(index)
    }

    /// Takes the fragment that starts with the compressed header.
    ///
    /// `bytes` follows the fragment header. A first fragment that fails to
    /// decompress drops the whole record.
    #[allow(clippy::too_many_arguments)]
    pub fn add_first_fragment(
        &mut self,
        arena: &mut BufferArena,
        key: ReassemblyKey,
        dst_link: LinkAddr,
        seq: u8,
        bytes: &[u8],
        src_contexts: &ContextTable,
        dst_contexts: &ContextTable,
    ) -> Result<FragmentStatus, ReassemblyError> {
        let index = self.ensure(arena, key, dst_link)?;
        let ticks = self.ticks;
        let record = self.records[index]
            .as_mut()
            .ok_or(ReassemblyError::UnknownFragment)?;
        if record.skeleton.is_some() {
            record.received.set(seq);
            record.ttl = ticks;
            trace!("duplicate first fragment; tag: {}", key.tag);
            return Ok(FragmentStatus::Duplicate);
        }

        let skeleton = match iphc::decompress(bytes, &key.src, &dst_link, src_contexts, dst_contexts)
        {
            Ok(x) => x,
            Err(e) => {
                warn!("first fragment not decompressed; tag: {}, {:?}", key.tag, e);
                self.remove(arena, index);
                return Err(ReassemblyError::Malformed);
            }
        };
        let covered = skeleton.covered_len();
        let raw = &bytes[skeleton.consumed()..];
        let start = covered;
        let end = start + raw.len();
        let size = record.size();
        if covered < IPV6_HDR_LEN || end > size || (end % UNIT != 0 && end != size) {
            self.remove(arena, index);
            return Err(ReassemblyError::Malformed);
        }
        // nothing else may have landed inside the compressed part
        if (IPV6_HDR_LEN / UNIT..covered / UNIT).any(|u| record.unit_filled(u)) {
            self.remove(arena, index);
            return Err(ReassemblyError::Malformed);
        }
        record.classify(arena, start, raw)?;
        arena
            .copy_in(&record.buf, start - IPV6_HDR_LEN, raw)
            .map_err(|_e| ReassemblyError::Malformed)?;
        record.fill(0, end);
        record.received.set(seq);
        if end == size {
            record.last_seq = Some(seq);
        }
        record.skeleton = Some(skeleton);
        record.ttl = ticks;
        trace!(
            "first fragment; tag: {}, covered: {}, raw: {}",
            key.tag,
            covered,
            raw.len()
        );
        self.check_rep();
        Ok(FragmentStatus::Accepted)
    }

    /// Takes a fragment at `offset` 8-byte units into the uncompressed datagram.
    pub fn add_fragment(
        &mut self,
        arena: &mut BufferArena,
        key: ReassemblyKey,
        seq: u8,
        offset: u8,
        bytes: &[u8],
    ) -> Result<FragmentStatus, ReassemblyError> {
        let index = self.find(&key).ok_or(ReassemblyError::UnknownFragment)?;
        let ticks = self.ticks;
        let record = self.records[index]
            .as_mut()
            .ok_or(ReassemblyError::UnknownFragment)?;
        let start = offset as usize * UNIT;
        let end = start + bytes.len();
        let size = record.size();
        if start < IPV6_HDR_LEN || end > size || (end % UNIT != 0 && end != size) {
            return Err(ReassemblyError::Malformed);
        }
        if let Some(covered) = record.covered_len() {
            if start < covered {
                return Err(ReassemblyError::Malformed);
            }
        }
        let status = record.classify(arena, start, bytes)?;
        if status == FragmentStatus::Accepted {
            arena
                .copy_in(&record.buf, start - IPV6_HDR_LEN, bytes)
                .map_err(|_e| ReassemblyError::Malformed)?;
            record.fill(start, end);
        }
        record.received.set(seq);
        if end == size {
            record.last_seq = Some(seq);
        }
        record.ttl = ticks;
        trace!(
            "fragment; tag: {}, seq: {}, offset: {}, len: {}",
            key.tag,
            seq,
            offset,
            bytes.len()
        );
        self.check_rep();
        Ok(status)
    }

    /// Every byte arrived, judged by the contiguous byte count.
    #[must_use]
    pub fn is_done(&self, key: &ReassemblyKey) -> bool {
        self.find(key)
            .and_then(|i| self.records[i].as_ref())
            .map(|r| r.is_done())
            .unwrap_or(false)
    }

    /// Every fragment through the last arrived, judged by sequence numbers.
    ///
    /// Only meaningful for fragments that carry sequence numbers.
    #[must_use]
    pub fn is_done_by_bitmap(&self, key: &ReassemblyKey) -> bool {
        self.find(key)
            .and_then(|i| self.records[i].as_ref())
            .map(|r| r.is_done_by_bitmap())
            .unwrap_or(false)
    }

    #[must_use]
    pub fn received(&self, key: &ReassemblyKey) -> Option<AckBitmap> {
        self.find(key)
            .and_then(|i| self.records[i].as_ref())
            .map(|r| r.received)
    }

    #[must_use]
    pub fn contiguous(&self, key: &ReassemblyKey) -> Option<usize> {
        self.find(key)
            .and_then(|i| self.records[i].as_ref())
            .map(|r| r.contiguous)
    }

    /// Removes and returns the datagram of `key` if it is complete.
    pub fn take_completed(
        &mut self,
        arena: &mut BufferArena,
        key: &ReassemblyKey,
    ) -> Result<Option<CompletedDatagram>, ReassemblyError> {
        let index = match self.find(key) {
            Some(x) => x,
            None => return Ok(None),
        };
        match self.records[index].as_ref() {
            Some(record) if record.is_done() => (),
            _ => return Ok(None),
        }
        let record = match self.records[index].take() {
            Some(x) => x,
            None => return Ok(None),
        };
        let skeleton = match record.skeleton {
            Some(x) => x,
            None => {
                arena.release(record.buf);
                return Err(ReassemblyError::Malformed);
            }
        };
        let header_room = skeleton.covered_len() - IPV6_HDR_LEN;
        let result = skeleton.finish(&arena.data(&record.buf)[header_room..]);
        let (datagram, inline_len) = match result {
            Ok(x) => x,
            Err(e) => {
                warn!("inline headers not parsed; tag: {}, {:?}", key.tag, e);
                arena.release(record.buf);
                return Err(ReassemblyError::Malformed);
            }
        };
        if arena.shrink_front(&record.buf, header_room + inline_len).is_err() {
            arena.release(record.buf);
            return Err(ReassemblyError::Malformed);
        }
        let payload = arena.data(&record.buf).to_vec();
        arena.release(record.buf);
        debug!(
            "reassembled; tag: {}, size: {}, payload: {}",
            key.tag,
            key.size,
            payload.len()
        );
        self.check_rep();
        Ok(Some(CompletedDatagram {
            key: record.key,
            dst_link: record.dst_link,
            datagram,
            payload,
            received: record.received,
        }))
    }

    /// Ages every record; returns how many expired.
    pub fn tick(&mut self, arena: &mut BufferArena) -> usize {
        let mut freed = 0;
        for index in 0..self.records.len() {
            let expired = match self.records[index].as_mut() {
                Some(record) => {
                    record.ttl = record.ttl.saturating_sub(1);
                    record.ttl == 0
                }
                None => false,
            };
            if expired {
                if let Some(record) = &self.records[index] {
                    debug!("reassembly expired; tag: {}", record.key.tag);
                }
                self.remove(arena, index);
                freed += 1;
            }
        }
        self.check_rep();
        freed
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.records.iter().flatten().count()
    }

    #[must_use]
    #[inline]
    pub fn capacity(&self) -> usize {
        self.records.len()
    }

    /// Liveness a record gets on every accepted fragment.
    #[must_use]
    #[inline]
    pub fn ticks(&self) -> u32 {
        self.ticks
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
