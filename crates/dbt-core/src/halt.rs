//! The halt-reason bitmask (`spec.md` §3 `JitState.halt_reason`, §5 "Halt
//! protocol").
//!
//! A 32-bit word written with sequentially-consistent OR/AND and read with
//! acquire loads. Any non-zero value causes the next block terminal to take
//! the return-from-run-code path.

use std::sync::atomic::{AtomicU32, Ordering};

/// Recognized bits, per `spec.md` §5. Eight user-defined bits are reserved
/// for the façade's caller.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct HaltReason(u32);

impl HaltReason {
    pub const NONE: HaltReason = HaltReason(0);
    pub const STEP: HaltReason = HaltReason(1 << 0);
    pub const CACHE_INVALIDATION: HaltReason = HaltReason(1 << 1);
    pub const MEMORY_ABORT: HaltReason = HaltReason(1 << 2);
    /// The decoder could not decode the instruction at the current
    /// LocationDescriptor (`spec.md` §7 "decode fault"). Distinct from
    /// `MEMORY_ABORT`: the PC itself is readable, its contents just don't
    /// decode under the current ISA mode.
    pub const DECODE_FAULT: HaltReason = HaltReason(1 << 3);

    const USER_DEFINED_BASE: u32 = 1 << 8;

    /// One of the eight user-defined halt bits, `0..8`.
    ///
    /// # Panics
    /// Panics if `n >= 8`.
    #[must_use]
    pub fn user_defined(n: u32) -> HaltReason {
        assert!(n < 8, "only 8 user-defined halt bits are available");
        HaltReason(Self::USER_DEFINED_BASE << n)
    }

    #[must_use]
    pub fn bits(self) -> u32 {
        self.0
    }

    #[must_use]
    pub fn from_bits(bits: u32) -> HaltReason {
        HaltReason(bits)
    }

    #[must_use]
    pub fn contains(self, other: HaltReason) -> bool {
        self.0 & other.0 == other.0 && other.0 != 0
    }

    #[must_use]
    pub fn is_empty(self) -> bool {
        self.0 == 0
    }
}

impl std::ops::BitOr for HaltReason {
    type Output = HaltReason;
    fn bitor(self, rhs: HaltReason) -> HaltReason {
        HaltReason(self.0 | rhs.0)
    }
}

impl std::ops::BitAnd for HaltReason {
    type Output = HaltReason;
    fn bitand(self, rhs: HaltReason) -> HaltReason {
        HaltReason(self.0 & rhs.0)
    }
}

impl std::ops::Not for HaltReason {
    type Output = HaltReason;
    fn not(self) -> HaltReason {
        HaltReason(!self.0)
    }
}

/// Atomic storage for `halt_reason`, shared between the façade's owning
/// thread and any thread calling `HaltExecution`/`ClearCache`/
/// `InvalidateCacheRange` (`spec.md` §5).
#[derive(Debug, Default)]
pub struct HaltWord(AtomicU32);

impl HaltWord {
    #[must_use]
    pub fn new() -> Self {
        HaltWord(AtomicU32::new(0))
    }

    /// Acquire load, per `spec.md` §4.E ("Loads halt_reason with acquire
    /// semantics").
    #[must_use]
    pub fn load(&self) -> HaltReason {
        HaltReason(self.0.load(Ordering::Acquire))
    }

    /// Set (OR in) `reason` with sequentially-consistent ordering
    /// (`spec.md` §5).
    pub fn set(&self, reason: HaltReason) {
        self.0.fetch_or(reason.0, Ordering::SeqCst);
    }

    /// Clear `reason`'s bits with sequentially-consistent ordering. Racing
    /// with a concurrent `set` "at worst causes one extra block of
    /// execution" (`spec.md` §5).
    pub fn clear(&self, reason: HaltReason) {
        self.0.fetch_and(!reason.0, Ordering::SeqCst);
    }

    /// Atomically clear every bit and return the prior value
    /// (`spec.md` §4.E `return_from_run_code`: "atomically clears
    /// halt_reason returning its prior value").
    pub fn take(&self) -> HaltReason {
        HaltReason(self.0.swap(0, Ordering::SeqCst))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn set_then_load_is_visible() {
        let word = HaltWord::new();
        word.set(HaltReason::CACHE_INVALIDATION);
        assert!(word.load().contains(HaltReason::CACHE_INVALIDATION));
    }

    #[test]
    fn clear_removes_only_named_bits() {
        let word = HaltWord::new();
        word.set(HaltReason::STEP | HaltReason::CACHE_INVALIDATION);
        word.clear(HaltReason::CACHE_INVALIDATION);
        assert!(word.load().contains(HaltReason::STEP));
        assert!(!word.load().contains(HaltReason::CACHE_INVALIDATION));
    }

    #[test]
    fn take_clears_everything_and_returns_prior() {
        let word = HaltWord::new();
        word.set(HaltReason::STEP | HaltReason::user_defined(1));
        let prior = word.take();
        assert!(prior.contains(HaltReason::STEP));
        assert!(word.load().is_empty());
    }

    #[test]
    fn user_defined_bits_are_distinct() {
        assert_ne!(HaltReason::user_defined(0), HaltReason::user_defined(1));
    }
}
