//! Component I: the Invalidation Coordinator.
//!
//! Any thread can request a cache clear or a targeted range invalidation at
//! any time, including from inside a memory-access callback running on the
//! façade's own executing thread (`spec.md` §4.I, §5). The request only
//! records intent and raises the shared halt bit; the actual mutation of
//! the Arena/Block Index/Range Map/Linker happens later, on the façade's
//! thread, at the next safepoint — built the way the teacher's
//! `SafepointCoordinator` turns a cross-thread "please pause" request into
//! a flag the owning thread polls, generalized here from GC pauses to
//! cache invalidation.

use parking_lot::Mutex;
use rustc_hash::FxHashSet;

use crate::arena::Arena;
use crate::block_index::BlockIndex;
use crate::halt::{HaltReason, HaltWord};
use crate::linker::Linker;
use crate::location::{GuestPc, LocationDescriptor};
use crate::prelude::PreludeInfo;
use crate::range_map::RangeMap;

#[derive(Default)]
struct PendingState {
    entire: bool,
    ranges: Vec<(GuestPc, GuestPc)>,
    /// `spec.md` §3/§4.H: markers recorded by a fastmem fault whose patch
    /// had `recompile` set, consulted by the Translator on re-emission to
    /// suppress the inline fast path at that site. Unlike `entire`/`ranges`
    /// this is never drained by [`InvalidationCoordinator::service`] — it is
    /// a standing per-site record, not a one-shot request.
    do_not_fastmem: FxHashSet<(LocationDescriptor, usize)>,
}

/// Component I: collects pending invalidation requests and services them at
/// a safepoint.
pub struct InvalidationCoordinator {
    pending: Mutex<PendingState>,
}

impl InvalidationCoordinator {
    #[must_use]
    pub fn new() -> Self {
        InvalidationCoordinator {
            pending: Mutex::new(PendingState::default()),
        }
    }

    /// `spec.md` §4.I `clear_cache` / the `ClearCache` operation: request a
    /// full wipe, superseding any pending targeted ranges. Callable from any
    /// thread, including a running memory-access callback (`spec.md` §5
    /// Open Question, resolved: supported).
    pub fn request_clear_cache(&self, halt: &HaltWord) {
        let mut pending = self.pending.lock();
        pending.entire = true;
        pending.ranges.clear();
        halt.set(HaltReason::CACHE_INVALIDATION);
    }

    /// `spec.md` §4.I `invalidate_range` / the `InvalidateCacheRange`
    /// operation. A zero-length range is a no-op (`spec.md` Open Question,
    /// resolved).
    pub fn request_invalidate_range(&self, halt: &HaltWord, start: GuestPc, end: GuestPc) {
        if start >= end {
            return;
        }
        let mut pending = self.pending.lock();
        if pending.entire {
            // A full clear is already pending and subsumes this range.
            return;
        }
        pending.ranges.push((start, end));
        halt.set(HaltReason::CACHE_INVALIDATION);
    }

    /// Whether a request is currently pending, without consuming it.
    #[must_use]
    pub fn has_pending(&self) -> bool {
        let pending = self.pending.lock();
        pending.entire || !pending.ranges.is_empty()
    }

    /// `spec.md` §4.H step 4: called from the arena fault callback when a
    /// fastmem miss's patch info has `recompile` set. Records `marker` in
    /// the do-not-fastmem set and schedules invalidation of `guest_range`,
    /// under a single lock acquisition — the fault callback this backs is
    /// only permitted "a single fast spin lock" (`spec.md` §4.B).
    pub fn report_fastmem_failure(
        &self,
        halt: &HaltWord,
        marker: (LocationDescriptor, usize),
        guest_range: (GuestPc, GuestPc),
    ) {
        let (start, end) = guest_range;
        let mut pending = self.pending.lock();
        pending.do_not_fastmem.insert(marker);
        if start >= end {
            return;
        }
        if !pending.entire {
            pending.ranges.push((start, end));
        }
        halt.set(HaltReason::CACHE_INVALIDATION);
    }

    /// Snapshot of the current do-not-fastmem set, for the Translator to
    /// pass into `Backend::emit` (`spec.md` §3/§4.H "a per-manager set used
    /// by the emitter to suppress the inline path next time").
    #[must_use]
    pub fn do_not_fastmem_snapshot(&self) -> FxHashSet<(LocationDescriptor, usize)> {
        self.pending.lock().do_not_fastmem.clone()
    }

    /// Run at the safepoint (`spec.md` §4.I, §5: serviced before the guest
    /// resumes, and before a simultaneous `Step` is armed — see Open
    /// Question on `Step | CacheInvalidation`). Applies every pending
    /// request to the Arena, Block Index, Range Map and Linker, then clears
    /// `HaltReason::CACHE_INVALIDATION` (leaving any other concurrently-set
    /// bit, such as `STEP`, untouched).
    #[allow(clippy::too_many_arguments)]
    pub fn service(
        &self,
        halt: &HaltWord,
        arena: &Arena,
        index: &mut BlockIndex,
        range_map: &mut RangeMap,
        linker: &Linker,
        prelude: &PreludeInfo,
    ) {
        let (entire, ranges) = {
            let mut pending = self.pending.lock();
            let entire = std::mem::take(&mut pending.entire);
            let ranges = std::mem::take(&mut pending.ranges);
            (entire, ranges)
        };

        if entire {
            arena.reset(prelude.end_of_prelude);
            index.clear();
            range_map.clear();
            linker.clear_fast_dispatch();
        } else if !ranges.is_empty() {
            let erased: FxHashSet<LocationDescriptor> = range_map.invalidate_ranges(&ranges);
            // Unlink referrers before erasing block_references, per
            // BlockIndex::invalidate's contract.
            for &ld in &erased {
                linker.unlink_referrers_to_dispatcher(arena, index, prelude, ld);
            }
            index.invalidate(&erased);
            linker.evict_fast_dispatch(erased);
        }

        halt.clear(HaltReason::CACHE_INVALIDATION);
    }
}

impl Default for InvalidationCoordinator {
    fn default() -> Self {
        Self::new()
    }
}
