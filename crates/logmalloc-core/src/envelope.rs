//! Allocation envelope: the header placed in front of every tracked block.
//!
//! Layout of a tracked block, from the real allocator's base pointer:
//!
//! ```text
//! base                         user - 32              user
//!  |<------ padding ------>|<------ Envelope ------>|<--- caller bytes --->|
//!                          [usable|offset|integrity|size]
//! ```
//!
//! `offset` is the distance from `base` to `user`. Plain allocations use
//! `offset == HEADER_SIZE` and carry no padding; aligned allocations use the
//! requested alignment so `user` keeps it exactly. The integrity pair sits
//! last so classification first touches only the 16 bytes adjacent to the
//! pointer, which for a foreign block are inside the same allocator chunk.
//!
//! A block is *tracked* when `integrity == !size` and `offset` is a power of
//! two no smaller than the header. Anything else is *foreign*.

#![allow(unsafe_code)]

use std::ffi::c_void;
use std::mem::{align_of, offset_of, size_of};
use std::ptr;

/// Metadata header stored immediately before the user pointer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(C, align(16))]
pub struct Envelope {
    /// True block size reported by the real allocator for `base`.
    pub usable: usize,
    /// Distance from the real base pointer to the user pointer.
    pub offset: usize,
    /// Bitwise complement of `size`.
    pub integrity: usize,
    /// Size requested by the caller.
    pub size: usize,
}

/// Bytes occupied by an [`Envelope`].
pub const HEADER_SIZE: usize = size_of::<Envelope>();

/// Minimum alignment glibc guarantees for `malloc` on 64-bit targets.
pub const MIN_ALIGN: usize = 16;

const _: () = assert!(HEADER_SIZE % MIN_ALIGN == 0);
const _: () = assert!(align_of::<Envelope>() == MIN_ALIGN);
const _: () = assert!(HEADER_SIZE.is_power_of_two());

/// Distance of the integrity pair back from the user pointer.
const SIZE_BACK: usize = HEADER_SIZE - offset_of!(Envelope, size);
const INTEGRITY_BACK: usize = HEADER_SIZE - offset_of!(Envelope, integrity);

/// Result of classifying a user pointer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Block {
    /// Created by this engine; `base` is what the real allocator returned.
    Tracked { base: *mut c_void, envelope: Envelope },
    /// Not ours. Must be forwarded unshifted.
    Foreign,
}

impl Envelope {
    /// Build an envelope for a block of `size` requested bytes.
    #[must_use]
    pub const fn new(size: usize, usable: usize, offset: usize) -> Self {
        Self {
            usable,
            offset,
            integrity: !size,
            size,
        }
    }

    /// Whether this header satisfies the integrity invariant.
    #[must_use]
    pub const fn is_intact(&self) -> bool {
        self.integrity == !self.size && valid_offset(self.offset)
    }
}

/// Offsets the engine ever writes: the header size, an alignment, or the page size.
#[must_use]
pub const fn valid_offset(offset: usize) -> bool {
    offset >= HEADER_SIZE && offset.is_power_of_two()
}

/// Write `envelope` in front of the user region and return the user pointer.
///
/// # Safety
///
/// `base` must be a live block of at least `envelope.offset` bytes, with
/// `envelope.offset` a multiple of [`MIN_ALIGN`] and `base` aligned to
/// [`MIN_ALIGN`].
pub unsafe fn stamp(base: *mut c_void, envelope: Envelope) -> *mut c_void {
    debug_assert!(envelope.is_intact());
    // SAFETY: caller guarantees `base..base + offset` is writable, so the
    // header slot `user - HEADER_SIZE..user` lies inside the block.
    unsafe {
        let user = base.cast::<u8>().add(envelope.offset);
        ptr::write(user.sub(HEADER_SIZE).cast::<Envelope>(), envelope);
        user.cast()
    }
}

/// Classify `user` as tracked or foreign.
///
/// # Safety
///
/// `user` must be non-null and point just past at least 16 readable bytes.
/// Every pointer returned by a mainstream allocator satisfies this because
/// the allocator's own chunk header precedes it.
pub unsafe fn classify(user: *mut c_void) -> Block {
    let user = user.cast::<u8>();
    // SAFETY: caller guarantees the 16 bytes before `user` are readable.
    let (size, integrity) = unsafe {
        (
            ptr::read_unaligned(user.sub(SIZE_BACK).cast::<usize>()),
            ptr::read_unaligned(user.sub(INTEGRITY_BACK).cast::<usize>()),
        )
    };
    if integrity != !size {
        return Block::Foreign;
    }
    // The pair matches, so this is one of our headers and all of it is readable.
    // SAFETY: see above.
    let envelope = unsafe { ptr::read_unaligned(user.sub(HEADER_SIZE).cast::<Envelope>()) };
    if !envelope.is_intact() {
        return Block::Foreign;
    }
    // SAFETY: `offset` is the distance this engine stepped forward from base.
    let base = unsafe { user.sub(envelope.offset) };
    Block::Tracked {
        base: base.cast(),
        envelope,
    }
}

/// Break the integrity invariant of a tracked header before its block is released.
///
/// # Safety
///
/// `user` must have been classified [`Block::Tracked`] and not yet released.
pub unsafe fn retire(user: *mut c_void) {
    // SAFETY: the header of a tracked block is writable until it is freed.
    unsafe {
        let slot = user.cast::<u8>().sub(INTEGRITY_BACK).cast::<usize>();
        let size = ptr::read_unaligned(user.cast::<u8>().sub(SIZE_BACK).cast::<usize>());
        ptr::write_unaligned(slot, size);
    }
}
