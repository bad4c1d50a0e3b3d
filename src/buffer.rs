//! Endpoint memory buffers

use crate::ral::dpram;

/// Slot offsets are aligned to this many bytes
///
/// The endpoint control register ignores the low six bits of a buffer
/// address.
pub const ALIGNMENT: usize = 64;

/// Smallest and largest slot sizes
const MIN_SLOT: usize = 8;
const MAX_SLOT: usize = 1024;

/// A slice of DPRAM assigned to one endpoint direction
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Buffer {
    /// Offset from the start of DPRAM
    pub offset: u16,
    /// Usable length, always a supported slot size
    pub len: u16,
}

impl Buffer {
    /// The fixed EP0 buffer, shared by EP0 IN and EP0 OUT
    pub const EP0: Buffer = Buffer {
        offset: dpram::EP0_BUFFER_OFFSET as u16,
        len: dpram::EP0_BUFFER_LEN as u16,
    };
}

/// Round `size` up to the next supported slot size
///
/// Returns `None` if `size` is larger than the largest slot.
pub fn slot_size(size: usize) -> Option<usize> {
    if size > MAX_SLOT {
        None
    } else {
        Some(size.max(MIN_SLOT).next_power_of_two())
    }
}

/// Endpoint memory buffer allocator
///
/// Hands out slots from the DPRAM arena with a cursor that only moves
/// forward. Memory is reclaimed all at once with [`reset()`](Allocator::reset).
pub struct Allocator {
    start: usize,
    end: usize,
    next: usize,
}

impl Allocator {
    /// Allocator over the arena between `start` and `end`
    pub const fn new(start: usize, end: usize) -> Self {
        Allocator {
            start,
            end,
            next: start,
        }
    }

    /// Allocator over the DPRAM arena, after the descriptors and the EP0
    /// buffers
    pub const fn arena() -> Self {
        Self::new(dpram::ARENA_OFFSET, dpram::SIZE)
    }

    /// Allocates a buffer of at least `size` bytes
    ///
    /// Returns `None` if the request is larger than the largest slot, or if
    /// the arena doesn't have room for it. A failed allocation doesn't move
    /// the cursor.
    pub fn allocate(&mut self, size: usize) -> Option<Buffer> {
        let len = slot_size(size)?;
        let offset = align_up(self.next, ALIGNMENT);
        let next = offset.checked_add(len)?;
        if next > self.end {
            None
        } else {
            self.next = next;
            Some(Buffer {
                offset: offset as u16,
                len: len as u16,
            })
        }
    }

    /// Release every allocation
    pub fn reset(&mut self) {
        self.next = self.start;
    }

    /// The offset of the next free byte
    pub fn cursor(&self) -> usize {
        self.next
    }
}

const fn align_up(value: usize, alignment: usize) -> usize {
    (value + alignment - 1) & !(alignment - 1)
}
