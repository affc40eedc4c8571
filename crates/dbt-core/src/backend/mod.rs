//! External interfaces (`spec.md` §6): the decoder, optimizer, and host
//! code generator this crate never ships an implementation of. The
//! Translator (component F) drives these three traits; everything upstream
//! of "bytes in the arena" is someone else's concern.
//!
//! [`stub`] is the one concrete implementation in this crate, used only by
//! its own tests to exercise the Translator/Linker/Block Index pipeline
//! without a real target ISA.

pub mod stub;

use rustc_hash::FxHashSet;

use crate::arena::Arena;
use crate::block_index::EmittedBlockInfo;
use crate::config::Optimizations;
use crate::location::{GuestPc, LocationDescriptor};
use crate::prelude::PreludeInfo;

/// The intermediate representation of one translated guest block, as
/// produced by a [`Decoder`] and refined by an [`Optimizer`]. Opaque to
/// this crate beyond the fields the Translator itself needs to thread
/// through the pipeline (`spec.md` §4.F).
#[derive(Debug, Clone)]
pub struct IrBlock {
    pub ld: LocationDescriptor,
    /// `[start, end)` guest-PC range this block's instructions span,
    /// recorded on the emitted block for the Range Map (`spec.md` §4.F
    /// step 11).
    pub guest_range: (GuestPc, GuestPc),
    /// Number of guest instructions decoded into this block. Carried only
    /// for diagnostics; the Translator doesn't interpret it.
    pub instruction_count: usize,
}

/// Decodes guest instructions starting at an LD into an [`IrBlock`]
/// (`spec.md` §4.F step 3, §6).
pub trait Decoder: Send + Sync {
    /// Decode starting at `ld`, stopping at a block boundary (branch,
    /// single-step limit, or a host-defined maximum). Returns `None` if the
    /// guest PC cannot be decoded at all (`spec.md` §7 "decode fault").
    fn decode(&self, ld: LocationDescriptor) -> Option<IrBlock>;
}

/// Transforms an [`IrBlock`] under a set of enabled optimizations
/// (`spec.md` §4.F step 4, §6).
pub trait Optimizer: Send + Sync {
    fn optimize(&self, block: IrBlock, enabled: Optimizations) -> IrBlock;
}

/// Emits host code for an [`IrBlock`], and emits the one-time prelude
/// (`spec.md` §4.F step 5, §4.E, §6).
///
/// Generalizes the teacher's `compile_function`/`finalize` split into a
/// single `emit` call: the translation cache never needs an unrelocated
/// intermediate form, since relocations are resolved by the Linker
/// (component G) rather than by the backend — the backend only records
/// relocation sites in the returned [`EmittedBlockInfo`].
pub trait Backend: Send + Sync {
    /// Emit `block`'s host code into `arena` (already unprotected by the
    /// caller) and return its metadata. Panics (`spec.md` §7 "emitter
    /// assertion") if `block` violates an invariant the backend relies on;
    /// returns `None` only for the ordinary "ran out of room" case the
    /// Translator checks for via `arena.remaining()` before ever calling
    /// this.
    ///
    /// `do_not_fastmem` names every `(LD, site index)` a previous fastmem
    /// fault has marked recompile-without-inline-fast-path (`spec.md` §3/
    /// §4.H step 4); a backend that emits an inline fastmem load/store must
    /// consult it and fall back to the out-of-line helper call for any site
    /// this block's own LD appears under.
    fn emit(
        &self,
        arena: &Arena,
        block: &IrBlock,
        do_not_fastmem: &FxHashSet<(LocationDescriptor, usize)>,
    ) -> EmittedBlockInfo;

    /// Emit the one-time prelude at the start of `arena` (`spec.md` §4.E).
    /// Called exactly once, before any block emission.
    fn emit_prelude(&self, arena: &Arena) -> PreludeInfo;
}
