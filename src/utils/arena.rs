use log::warn;

/// Fixed-capacity byte pool handing out exclusive ranges through a bounded
/// table of handles.
///
/// There is no compaction: a request succeeds only if a single gap between
/// live ranges is large enough.
#[derive(Debug)]
pub struct BufferArena {
    buf: Vec<u8>,
    slots: Vec<Slot>,
}

#[derive(Debug, Clone, Copy)]
struct Slot {
    offset: usize,
    len: usize,
    in_use: bool,
    generation: u32,
}

/// Single-owner view into a [`BufferArena`].
///
/// Not `Clone`: giving it back through [`BufferArena::release`] consumes it.
#[derive(Debug, PartialEq, Eq)]
pub struct BufferHandle {
    slot: usize,
    generation: u32,
}

/// Non-owning name of a handle, as returned by [`BufferArena::find_owner`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct HandleId {
    slot: usize,
    generation: u32,
}

impl BufferHandle {
    #[must_use]
    #[inline]
    pub fn id(&self) -> HandleId {
        HandleId {
            slot: self.slot,
            generation: self.generation,
        }
    }
}

pub struct ArenaBuilder {
    pub len: usize,
    pub handles: usize,
}

impl ArenaBuilder {
    #[must_use]
    pub fn build(self) -> BufferArena {
        let this = BufferArena {
            buf: vec![0; self.len],
            slots: vec![
                Slot {
                    offset: 0,
                    len: 0,
                    in_use: false,
                    generation: 0,
                };
                self.handles
            ],
        };
        this.check_rep();
        this
    }

    #[must_use]
    pub fn default() -> Self {
        Self {
            len: 2000,
            handles: 23,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AcquireError {
    OutOfMemory,
    OutOfHandles,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AccessError {
    OutOfBounds,
}

impl BufferArena {
    fn check_rep(&self) {
        let mut live: Vec<(usize, usize)> = self
            .slots
            .iter()
            .filter(|s| s.in_use && s.len > 0)
            .map(|s| (s.offset, s.offset + s.len))
            .collect();
        live.sort_unstable();
        for (start, end) in &live {
            assert!(start <= end);
            assert!(*end <= self.buf.len());
        }
        for pair in live.windows(2) {
            assert!(pair[0].1 <= pair[1].0);
        }
    }

    #[inline]
    fn slot(&self, handle: &BufferHandle) -> &Slot {
        let slot = &self.slots[handle.slot];
        assert!(slot.in_use);
        assert_eq!(slot.generation, handle.generation);
        slot
    }

    #[inline]
    fn slot_mut(&mut self, handle: &BufferHandle) -> &mut Slot {
        let slot = &mut self.slots[handle.slot];
        assert!(slot.in_use);
        assert_eq!(slot.generation, handle.generation);
        slot
    }

    /// Reserves `size` contiguous bytes.
    ///
    /// Walks the live ranges looking for the gap in front of the nearest one;
    /// whenever that gap turns out too small, the scan restarts right behind
    /// the blocking range.
    pub fn acquire(&mut self, size: usize) -> Result<BufferHandle, AcquireError> {
        let capacity = self.buf.len();
        if size > capacity {
            return Err(AcquireError::OutOfMemory);
        }

        let mut start = 0;
        let mut free = capacity - start;
        let mut j = 0;
        while j < self.slots.len() {
            let slot = self.slots[j];
            if slot.in_use && slot.len > 0 && slot.offset >= start {
                let gap = slot.offset - start;
                if gap < free {
                    free = gap;
                    if free < size {
                        start = slot.offset + slot.len;
                        free = capacity - start;
                        j = 0;
                        continue;
                    }
                }
            }
            j += 1;
        }
        if free < size {
            warn!("arena: no gap for {} bytes ({} in use)", size, self.used_len());
            return Err(AcquireError::OutOfMemory);
        }

        let index = match self.slots.iter().position(|s| !s.in_use) {
            Some(x) => x,
            None => {
                warn!("arena: all {} handles in use", self.slots.len());
                return Err(AcquireError::OutOfHandles);
            }
        };
        let slot = &mut self.slots[index];
        slot.offset = start;
        slot.len = size;
        slot.in_use = true;
        let handle = BufferHandle {
            slot: index,
            generation: slot.generation,
        };
        self.check_rep();
        Ok(handle)
    }

    pub fn release(&mut self, handle: BufferHandle) {
        let slot = self.slot_mut(&handle);
        slot.in_use = false;
        slot.len = 0;
        slot.generation = slot.generation.wrapping_add(1);
        self.check_rep();
    }

    /// Frees every range. Outstanding handles become stale.
    pub fn clear_all(&mut self) {
        for slot in self.slots.iter_mut() {
            if slot.in_use {
                slot.generation = slot.generation.wrapping_add(1);
            }
            slot.in_use = false;
            slot.len = 0;
        }
        self.check_rep();
    }

    pub fn shrink_front(&mut self, handle: &BufferHandle, n: usize) -> Result<(), AccessError> {
        let slot = self.slot_mut(handle);
        if slot.len < n {
            return Err(AccessError::OutOfBounds);
        }
        slot.offset += n;
        slot.len -= n;
        self.check_rep();
        Ok(())
    }

    pub fn shrink_back(&mut self, handle: &BufferHandle, n: usize) -> Result<(), AccessError> {
        let slot = self.slot_mut(handle);
        if slot.len < n {
            return Err(AccessError::OutOfBounds);
        }
        slot.len -= n;
        self.check_rep();
        Ok(())
    }

    pub fn copy_in(
        &mut self,
        handle: &BufferHandle,
        pos: usize,
        bytes: &[u8],
    ) -> Result<(), AccessError> {
        let slot = *self.slot(handle);
        if slot.len < pos + bytes.len() {
            return Err(AccessError::OutOfBounds);
        }
        let start = slot.offset + pos;
        self.buf[start..start + bytes.len()].copy_from_slice(bytes);
        Ok(())
    }

    /// Takes the first byte off the range.
    pub fn pop_front(&mut self, handle: &BufferHandle) -> Option<u8> {
        let slot = *self.slot(handle);
        if slot.len == 0 {
            return None;
        }
        let byte = self.buf[slot.offset];
        self.shrink_front(handle, 1).ok()?;
        Some(byte)
    }

    /// Maps a raw arena position back to the range covering it.
    #[must_use]
    pub fn find_owner(&self, position: usize) -> Option<HandleId> {
        self.slots
            .iter()
            .enumerate()
            .find(|(_, s)| s.in_use && s.offset <= position && position < s.offset + s.len)
            .map(|(i, s)| HandleId {
                slot: i,
                generation: s.generation,
            })
    }

    /// Arena position where the range currently starts.
    #[must_use]
    #[inline]
    pub fn position(&self, handle: &BufferHandle) -> usize {
        self.slot(handle).offset
    }

    #[must_use]
    #[inline]
    pub fn data(&self, handle: &BufferHandle) -> &[u8] {
        let slot = self.slot(handle);
        &self.buf[slot.offset..slot.offset + slot.len]
    }

    #[must_use]
    #[inline]
    pub fn len_of(&self, handle: &BufferHandle) -> usize {
        self.slot(handle).len
    }

    #[must_use]
    #[inline]
    pub fn capacity(&self) -> usize {
        self.buf.len()
    }

    #[must_use]
    pub fn used_len(&self) -> usize {
        self.slots.iter().filter(|s| s.in_use).map(|s| s.len).sum()
    }

    #[must_use]
    pub fn handles_in_use(&self) -> usize {
        self.slots.iter().filter(|s| s.in_use).count()
    }
}
