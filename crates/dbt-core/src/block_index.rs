//! Component C: the Block Index.
//!
//! Bidirectional map between guest [`LocationDescriptor`]s and host
//! [`CodePtr`]s, plus the per-block metadata and inbound-reference edges
//! needed by the Linker (`spec.md` §3, §4.C).

use std::collections::BTreeMap;
use std::sync::Arc;

use parking_lot::RwLock;
use rustc_hash::{FxHashMap, FxHashSet};

use crate::arena::CodePtr;
use crate::location::{GuestPc, LocationDescriptor};

/// Where a relocation inside a block should be patched to point, for
/// relocations that target a fixed prelude slot rather than a sibling
/// block (`spec.md` §3).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum LinkTarget {
    ReturnToDispatcher,
    ReturnFromRunCode,
    ReadMemory(MemWidth),
    WrappedReadMemory(MemWidth),
    ExclusiveReadMemory(MemWidth),
    WriteMemory(MemWidth),
    WrappedWriteMemory(MemWidth),
    ExclusiveWriteMemory(MemWidth),
    CallSvc,
    ExceptionRaised,
    InstructionSynchronizationBarrierRaised,
    InstructionCacheOperationRaised,
    DataCacheOperationRaised,
    GetCntpct,
    AddTicks,
    GetTicksRemaining,
}

/// Guest memory access width, used by [`LinkTarget`]'s memory variants.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum MemWidth {
    W8,
    W16,
    W32,
    W64,
    W128,
}

/// A fixed relocation site within a block (`spec.md` §3 `relocations`).
#[derive(Debug, Clone, Copy)]
pub struct Relocation {
    pub offset_within_block: usize,
    pub target: LinkTarget,
}

/// How a relocation site that targets a *sibling block* should be patched
/// (`spec.md` §3 `block_relocations`, §4.G).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BlockRelocationKind {
    /// Patch an unconditional jump to the sibling's entry.
    Branch,
    /// Patch an immediate-load of the sibling's entry into a scratch
    /// register.
    MoveToScratch1,
}

/// One inter-block relocation site targeting `target`, at `offset` within
/// the owning block, to be patched per `kind`.
#[derive(Debug, Clone, Copy)]
pub struct BlockRelocation {
    pub offset: usize,
    pub kind: BlockRelocationKind,
}

/// Architecture-specific description of how to resume execution after a
/// fastmem fault redirect (`spec.md` §3 `FastmemPatchInfo`). Opaque to this
/// crate — populated and consumed by the host backend / exception handler.
#[derive(Debug, Clone)]
pub struct FakeCall {
    /// Host PC to resume at (typically a small out-of-line fixup stub).
    pub resume_pc: usize,
    /// Backend-defined payload (e.g. which registers to save/restore).
    pub payload: Vec<u8>,
}

/// Per-memory-op-site fastmem metadata (`spec.md` §3, §4.H).
#[derive(Debug, Clone)]
pub struct FastmemPatchInfo {
    /// Identifies this site for the "do-not-fastmem" set.
    pub marker: (LocationDescriptor, usize),
    pub fake_call: FakeCall,
    /// Whether a fault at this site should also schedule recompilation of
    /// the containing block without the inline fast path.
    pub recompile: bool,
}

/// Metadata produced by the emitter for one translated block
/// (`spec.md` §3 `EmittedBlockInfo`).
#[derive(Debug, Clone)]
pub struct EmittedBlockInfo {
    pub entry_point: CodePtr,
    pub size: usize,
    pub relocations: Vec<Relocation>,
    pub block_relocations: FxHashMap<LocationDescriptor, Vec<BlockRelocation>>,
    pub fastmem_patch_info: FxHashMap<usize, FastmemPatchInfo>,
    /// `[start_pc, end_pc)` guest-PC range this block covers, added to the
    /// Range Map (`spec.md` §4.F step 11).
    pub guest_range: (GuestPc, GuestPc),
}

// SAFETY: `entry_point`/any pointers inside `relocations` point into the
// arena's executable mapping, which outlives every `EmittedBlockInfo`
// derived from it and is never reallocated.
unsafe impl Send for EmittedBlockInfo {}
unsafe impl Sync for EmittedBlockInfo {}

/// Component C: the bidirectional guest-location ⇄ host-pointer index.
///
/// Four associative structures whose invariants are maintained jointly, per
/// `spec.md` §3:
/// - `block_entries`: the *current* resident entry for each LD.
/// - `reverse_block_entries`: ordered by `CodePtr`, supports "greatest key ≤
///   host_pc" for the fault handler.
/// - `block_infos`: metadata for every block ever emitted (including
///   unlinked ones — their bytes remain in the arena until a full clear).
/// - `block_references`: inbound edges used to re-link a target when it
///   becomes resident or is invalidated.
#[derive(Default)]
pub struct BlockIndex {
    block_entries: FxHashMap<LocationDescriptor, CodePtr>,
    reverse_block_entries: BTreeMap<CodePtr, LocationDescriptor>,
    block_infos: BTreeMap<CodePtr, EmittedBlockInfo>,
    block_references: FxHashMap<LocationDescriptor, FxHashSet<CodePtr>>,
}

// SAFETY: every `CodePtr` held here points into an `Arena`'s executable
// mapping, which outlives the `BlockIndex` and is never reallocated; nothing
// here is ever dereferenced, only compared and used as a map key. This lets
// a `BlockIndex` live behind a `SharedBlockIndex` consulted from the
// faulting thread's signal handler (`spec.md` §4.H).
unsafe impl Send for BlockIndex {}
unsafe impl Sync for BlockIndex {}

/// `Arc<RwLock<BlockIndex>>`, shared between a façade and the
/// [`crate::fastmem::FastmemFaultHandler`] it installs with the Exception
/// Handler. The `RwLock` gives the fault callback a short, bounded read
/// critical section instead of a raw pointer into the façade's own storage,
/// so the registration stays sound even if the owning `Cpu` is moved after
/// construction (`spec.md` §9 "Signal-handler global state").
pub type SharedBlockIndex = Arc<RwLock<BlockIndex>>;

impl BlockIndex {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Construct a [`SharedBlockIndex`] for a façade that installs a
    /// [`crate::fastmem::FastmemFaultHandler`].
    #[must_use]
    pub fn new_shared() -> SharedBlockIndex {
        Arc::new(RwLock::new(Self::new()))
    }

    /// `spec.md` §4.C `get`.
    #[must_use]
    pub fn get(&self, ld: LocationDescriptor) -> Option<CodePtr> {
        self.block_entries.get(&ld).copied()
    }

    /// `spec.md` §4.C `reverse_get_location`: the LD of the block covering
    /// `host_pc`, found via "largest entry ≤ host_pc".
    #[must_use]
    pub fn reverse_get_location(&self, host_pc: CodePtr) -> Option<LocationDescriptor> {
        self.reverse_block_entries
            .range(..=host_pc)
            .next_back()
            .map(|(_, ld)| *ld)
    }

    /// `spec.md` §4.C `reverse_get_entry_point`.
    #[must_use]
    pub fn reverse_get_entry_point(&self, host_pc: CodePtr) -> Option<CodePtr> {
        self.reverse_block_entries
            .range(..=host_pc)
            .next_back()
            .map(|(&ptr, _)| ptr)
    }

    /// Metadata for the block whose entry point is exactly `entry_point`.
    #[must_use]
    pub fn info(&self, entry_point: CodePtr) -> Option<&EmittedBlockInfo> {
        self.block_infos.get(&entry_point)
    }

    /// Metadata for the block covering `host_pc` (`spec.md` §4.H step 1-2:
    /// "resolve host_pc → entry_point via reverse lookup" then "resolve
    /// (entry_point, offset) → FastmemPatchInfo").
    #[must_use]
    pub fn info_covering(&self, host_pc: CodePtr) -> Option<(CodePtr, &EmittedBlockInfo)> {
        let entry_point = self.reverse_get_entry_point(host_pc)?;
        self.info(entry_point).map(|info| (entry_point, info))
    }

    /// Record a newly emitted block (`spec.md` §4.F step 6). Does not run
    /// the linker — callers invoke that separately (step 7).
    pub fn register(&mut self, ld: LocationDescriptor, info: EmittedBlockInfo) {
        let entry_point = info.entry_point;
        self.block_entries.insert(ld, entry_point);
        self.reverse_block_entries.insert(entry_point, ld);
        for target in info.block_relocations.keys() {
            self.block_references
                .entry(*target)
                .or_default()
                .insert(entry_point);
        }
        self.block_infos.insert(entry_point, info);
    }

    /// Referrers of `target`: blocks with a `block_relocation` naming it
    /// (`spec.md` §3 `block_references`).
    #[must_use]
    pub fn referrers(&self, target: LocationDescriptor) -> Vec<CodePtr> {
        self.block_references
            .get(&target)
            .map(|set| set.iter().copied().collect())
            .unwrap_or_default()
    }

    /// `spec.md` §4.C `invalidate`: drop `block_entries` for each LD present
    /// (inbound-reference unlinking is the caller's responsibility via the
    /// Linker, performed *before* this per the self-reference note in
    /// `spec.md` §4.G / §9). The entry remains in `reverse_block_entries`
    /// and `block_infos` until a full [`BlockIndex::clear`].
    pub fn invalidate(&mut self, lds: &FxHashSet<LocationDescriptor>) {
        for ld in lds {
            self.block_entries.remove(ld);
            self.block_references.remove(ld);
        }
    }

    /// `spec.md` §4.C `clear`: drop all four structures.
    pub fn clear(&mut self) {
        self.block_entries.clear();
        self.reverse_block_entries.clear();
        self.block_infos.clear();
        self.block_references.clear();
    }

    /// Number of resident (non-stale) blocks, for diagnostics/tests.
    #[must_use]
    pub fn resident_count(&self) -> usize {
        self.block_entries.len()
    }

    /// Total number of blocks ever emitted and not yet wiped by a full
    /// clear, including unlinked-but-still-in-arena ones.
    #[must_use]
    pub fn total_emitted_count(&self) -> usize {
        self.block_infos.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::location::IsaMode;
    use std::ptr;

    fn ptr_at(offset: usize) -> CodePtr {
        // Never dereferenced; only used as an ordered, comparable key.
        ptr::null::<u8>().wrapping_add(offset)
    }

    fn dummy_info(entry_point: CodePtr, size: usize) -> EmittedBlockInfo {
        EmittedBlockInfo {
            entry_point,
            size,
            relocations: vec![],
            block_relocations: FxHashMap::default(),
            fastmem_patch_info: FxHashMap::default(),
            guest_range: (0, 0),
        }
    }

    #[test]
    fn bijection_holds_after_register() {
        let mut idx = BlockIndex::new();
        let ld = LocationDescriptor::new(0x1000, IsaMode::default());
        let p = ptr_at(0x1000);
        idx.register(ld, dummy_info(p, 16));

        assert_eq!(idx.get(ld), Some(p));
        assert_eq!(idx.reverse_get_location(p), Some(ld));
        assert_eq!(idx.reverse_get_entry_point(p), Some(p));
        assert!(idx.info(p).is_some());
    }

    #[test]
    fn reverse_lookup_covers_interior_pc() {
        let mut idx = BlockIndex::new();
        let ld = LocationDescriptor::new(0x1000, IsaMode::default());
        let p = ptr_at(0x2000);
        idx.register(ld, dummy_info(p, 32));

        let interior = ptr_at(0x2010);
        assert_eq!(idx.reverse_get_entry_point(interior), Some(p));
        assert_eq!(idx.reverse_get_location(interior), Some(ld));
    }

    #[test]
    fn reverse_lookup_none_before_every_block() {
        let mut idx = BlockIndex::new();
        let ld = LocationDescriptor::new(0x1000, IsaMode::default());
        let p = ptr_at(0x2000);
        idx.register(ld, dummy_info(p, 32));

        assert_eq!(idx.reverse_get_entry_point(ptr_at(0x1000)), None);
    }

    #[test]
    fn invalidate_removes_forward_lookup_but_keeps_reverse_and_info() {
        let mut idx = BlockIndex::new();
        let ld = LocationDescriptor::new(0x1000, IsaMode::default());
        let p = ptr_at(0x2000);
        idx.register(ld, dummy_info(p, 32));

        let mut set = FxHashSet::default();
        set.insert(ld);
        idx.invalidate(&set);

        assert_eq!(idx.get(ld), None);
        assert_eq!(idx.reverse_get_location(p), Some(ld));
        assert!(idx.info(p).is_some());
    }

    #[test]
    fn clear_drops_everything() {
        let mut idx = BlockIndex::new();
        let ld = LocationDescriptor::new(0x1000, IsaMode::default());
        let p = ptr_at(0x2000);
        idx.register(ld, dummy_info(p, 32));
        idx.clear();

        assert_eq!(idx.get(ld), None);
        assert_eq!(idx.reverse_get_location(p), None);
        assert!(idx.info(p).is_none());
        assert_eq!(idx.resident_count(), 0);
        assert_eq!(idx.total_emitted_count(), 0);
    }

    #[test]
    fn inbound_closure_tracks_block_relocations() {
        let mut idx = BlockIndex::new();
        let caller_ld = LocationDescriptor::new(0x1000, IsaMode::default());
        let callee_ld = LocationDescriptor::new(0x2000, IsaMode::default());
        let caller_ptr = ptr_at(0x5000);

        let mut info = dummy_info(caller_ptr, 16);
        info.block_relocations.insert(
            callee_ld,
            vec![BlockRelocation {
                offset: 4,
                kind: BlockRelocationKind::Branch,
            }],
        );
        idx.register(caller_ld, info);

        assert_eq!(idx.referrers(callee_ld), vec![caller_ptr]);
    }

    #[test]
    fn self_referential_relocation_is_its_own_referrer() {
        let mut idx = BlockIndex::new();
        let ld = LocationDescriptor::new(0x1000, IsaMode::default());
        let p = ptr_at(0x4000);

        let mut info = dummy_info(p, 16);
        info.block_relocations.insert(
            ld,
            vec![BlockRelocation {
                offset: 8,
                kind: BlockRelocationKind::Branch,
            }],
        );
        idx.register(ld, info);

        assert_eq!(idx.referrers(ld), vec![p]);

        let mut set = FxHashSet::default();
        set.insert(ld);
        idx.invalidate(&set);
        // The self-edge must be gone so a future `register` of a different
        // LD doesn't see a stale referrer entry for this one.
        assert!(idx.referrers(ld).is_empty());
    }
}
