//! Component A: the executable memory arena.
//!
//! Owns one contiguous, page-aligned host memory region and bump-allocates
//! host code out of it (`spec.md` §4.A). On hosts that enforce W^X the
//! region starts out `RW` and callers bracket emission with
//! [`Arena::unprotect`]/[`Arena::protect`]; on hosts that allow simultaneous
//! `RWX` mappings the region is left executable at all times and those calls
//! are no-ops.

use std::sync::atomic::{AtomicUsize, Ordering};

use region::{Allocation, Protection};

use crate::error::{Error, Result};

/// Host-address handle into the arena. Comparable and orderable, per
/// `spec.md` §3, so the Block Index can use it as a `BTreeMap` key for
/// reverse lookups.
pub type CodePtr = *const u8;

/// Owns the arena's host mapping and bump cursor.
pub struct Arena {
    alloc: Allocation,
    capacity: usize,
    /// Bump allocation cursor, relative to the start of the mapping.
    cursor: AtomicUsize,
    /// Whether the current mapping was obtained as simultaneous RWX (no W^X
    /// enforcement observed on this host).
    rwx: bool,
}

// SAFETY: the mapping is only ever bump-allocated into (never reallocated)
// and protection changes are bracketed by the caller around emission, which
// per `spec.md` §5 only ever happens on the arena's owning thread while the
// guest is not executing. `CodePtr`s handed out remain valid for the
// lifetime of the `Arena`.
unsafe impl Send for Arena {}
unsafe impl Sync for Arena {}

impl Arena {
    /// Reserve a `capacity`-byte region. Tries for a simultaneous `RWX`
    /// mapping first (the common case on hosts without W^X enforcement);
    /// falls back to `RW` plus explicit protection flips otherwise.
    pub fn new(capacity: usize) -> Result<Self> {
        let (alloc, rwx) = match region::alloc(capacity, Protection::READ_WRITE_EXECUTE) {
            Ok(alloc) => (alloc, true),
            Err(_) => (
                region::alloc(capacity, Protection::READ_WRITE).map_err(Error::ArenaAllocation)?,
                false,
            ),
        };
        Ok(Arena {
            capacity: alloc.len(),
            alloc,
            cursor: AtomicUsize::new(0),
            rwx,
        })
    }

    /// Total capacity of the arena in bytes.
    #[must_use]
    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Current bump cursor, relative to the start of the mapping.
    #[must_use]
    pub fn cursor(&self) -> usize {
        self.cursor.load(Ordering::Acquire)
    }

    /// Bytes remaining before the cursor reaches `capacity`.
    #[must_use]
    pub fn remaining(&self) -> usize {
        self.capacity - self.cursor()
    }

    /// Base address of the mapping.
    #[must_use]
    pub fn base(&self) -> CodePtr {
        self.alloc.as_ptr::<u8>()
    }

    /// Reserve `n` bytes at the cursor and return a pointer to them. Returns
    /// `None` if `n` exceeds `remaining()`; callers are expected to have
    /// already checked against [`crate::config::SAFETY_MARGIN`] before
    /// calling (`spec.md` §4.F step 1) — this is the hard backstop.
    pub fn allocate(&self, n: usize) -> Option<CodePtr> {
        let cursor = self.cursor.load(Ordering::Acquire);
        if n > self.capacity - cursor {
            return None;
        }
        self.cursor.store(cursor + n, Ordering::Release);
        // SAFETY: `cursor + n <= capacity`, verified above.
        Some(unsafe { self.base().add(cursor) })
    }

    /// Reset the bump cursor to `offset`, typically `end_of_prelude`
    /// (`spec.md` §4.A `reset`).
    pub fn reset(&self, offset: usize) {
        debug_assert!(offset <= self.capacity);
        self.cursor.store(offset, Ordering::Release);
    }

    /// Make the arena writable for emission. No-op on a simultaneous-RWX
    /// mapping.
    pub fn unprotect(&self) -> Result<()> {
        if self.rwx {
            return Ok(());
        }
        // SAFETY: the mapping is owned by this `Arena` and spans
        // `[base, base + capacity)`.
        unsafe { region::protect(self.base(), self.capacity, Protection::READ_WRITE) }
            .map_err(Error::Protection)
    }

    /// Restore the arena to executable-only-where-written state after
    /// emission. No-op on a simultaneous-RWX mapping.
    pub fn protect(&self) -> Result<()> {
        if self.rwx {
            return Ok(());
        }
        // SAFETY: see `unprotect`.
        unsafe { region::protect(self.base(), self.capacity, Protection::READ_EXECUTE) }
            .map_err(Error::Protection)
    }

    /// Invalidate the host instruction cache over `[ptr, ptr + len)`. A
    /// no-op on hosts with a unified I/D cache (`spec.md` §4.A).
    pub fn invalidate_icache(&self, ptr: CodePtr, len: usize) {
        invalidate_icache_range(ptr, len);
    }

    /// Write `bytes` at the start of a fresh allocation of `bytes.len()`
    /// size and return the `CodePtr` it was written at. A thin convenience
    /// over `allocate` + a raw copy used by the prelude emitter and by the
    /// [`crate::backend::stub`] test backend.
    ///
    /// # Safety
    /// The caller must have already called [`Arena::unprotect`].
    pub unsafe fn emit_bytes(&self, bytes: &[u8]) -> Option<CodePtr> {
        let ptr = self.allocate(bytes.len())?;
        // SAFETY: `ptr..ptr+bytes.len()` was just reserved via `allocate`
        // and the caller has unprotected the arena.
        unsafe {
            std::ptr::copy_nonoverlapping(bytes.as_ptr(), ptr.cast_mut(), bytes.len());
        }
        Some(ptr)
    }

    /// Read back `len` bytes at `ptr` for diagnostics/tests. There is no
    /// disassembler in scope; this is the only introspection available.
    #[cfg(test)]
    pub fn bytes(&self, ptr: CodePtr, len: usize) -> &[u8] {
        // SAFETY: test-only; callers pass ranges they just emitted.
        unsafe { std::slice::from_raw_parts(ptr, len) }
    }
}

#[cfg(target_arch = "aarch64")]
fn invalidate_icache_range(ptr: CodePtr, len: usize) {
    // AArch64 hosts have non-coherent split I/D caches: clean each dirtied
    // D-cache line back to the point of unification, then invalidate the
    // matching I-cache line, the same per-line sequence `__clear_cache`
    // uses (`spec.md` §4.A).
    const CACHE_LINE: usize = 64;
    let start = (ptr as usize) & !(CACHE_LINE - 1);
    let end = ptr as usize + len;

    // SAFETY: `[ptr, ptr + len)` lies within the arena's own mapping, which
    // the caller (`Arena::invalidate_icache`) has just finished writing.
    unsafe {
        let mut addr = start;
        while addr < end {
            std::arch::asm!("dc cvau, {addr}", addr = in(reg) addr, options(nostack, preserves_flags));
            addr += CACHE_LINE;
        }
        std::arch::asm!("dsb ish", options(nostack, preserves_flags));

        let mut addr = start;
        while addr < end {
            std::arch::asm!("ic ivau, {addr}", addr = in(reg) addr, options(nostack, preserves_flags));
            addr += CACHE_LINE;
        }
        std::arch::asm!("dsb ish", options(nostack, preserves_flags));
        std::arch::asm!("isb", options(nostack, preserves_flags));
    }
}

#[cfg(not(target_arch = "aarch64"))]
fn invalidate_icache_range(ptr: CodePtr, len: usize) {
    // x86 has a coherent I/D cache; nothing to do (`spec.md` §4.A).
    let _ = (ptr, len);
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fresh_arena_has_full_capacity() {
        let arena = Arena::new(64 * 1024).unwrap();
        assert_eq!(arena.cursor(), 0);
        assert_eq!(arena.remaining(), arena.capacity());
    }

    #[test]
    fn allocate_advances_cursor() {
        let arena = Arena::new(4096).unwrap();
        let p0 = arena.allocate(64).unwrap();
        let p1 = arena.allocate(64).unwrap();
        assert_eq!(arena.cursor(), 128);
        // SAFETY: both pointers are within the 4096-byte mapping.
        assert_eq!(unsafe { p1.offset_from(p0) }, 64);
    }

    #[test]
    fn allocate_past_capacity_fails() {
        let arena = Arena::new(4096).unwrap();
        assert!(arena.allocate(4096).is_some());
        assert!(arena.allocate(1).is_none());
    }

    #[test]
    fn reset_rewinds_cursor() {
        let arena = Arena::new(4096).unwrap();
        arena.allocate(1024).unwrap();
        arena.reset(256);
        assert_eq!(arena.cursor(), 256);
        assert_eq!(arena.remaining(), 4096 - 256);
    }

    #[test]
    fn emit_bytes_round_trips() {
        let arena = Arena::new(4096).unwrap();
        arena.unprotect().unwrap();
        let ptr = unsafe { arena.emit_bytes(&[0xDE, 0xAD, 0xBE, 0xEF]) }.unwrap();
        arena.protect().unwrap();
        assert_eq!(arena.bytes(ptr, 4), &[0xDE, 0xAD, 0xBE, 0xEF]);
    }
}
