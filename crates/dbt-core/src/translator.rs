//! Component F: the Block Translator.
//!
//! Orchestrates a [`Decoder`]/[`Optimizer`]/[`Backend`] triple together
//! with the Arena, Block Index, Range Map, and Linker to turn one
//! [`LocationDescriptor`] into resident host code, following the eleven
//! steps `spec.md` §4.F lays out.

use crate::arena::Arena;
use crate::backend::{Backend, Decoder, Optimizer};
use crate::block_index::BlockIndex;
use crate::config::{Config, Optimizations, SAFETY_MARGIN};
use crate::invalidation::InvalidationCoordinator;
use crate::linker::Linker;
use crate::location::LocationDescriptor;
use crate::prelude::PreludeInfo;
use crate::range_map::RangeMap;

/// Result of attempting to translate and link one [`LocationDescriptor`]
/// (`spec.md` §4.F, §7).
#[derive(Debug)]
pub enum EmitOutcome {
    /// The block is now resident; host execution may jump to the contained
    /// entry point.
    Emitted(crate::arena::CodePtr),
    /// The arena does not have [`SAFETY_MARGIN`] bytes free. Per `spec.md`
    /// §4.F step 1 this is reported to the caller rather than attempted;
    /// the caller is expected to run a full `ClearCache` and retry.
    OutOfSpace,
    /// The decoder could not decode starting at this LD (`spec.md` §7
    /// "decode fault"). Guest-visible; the caller raises this as the
    /// `ExceptionRaised` condition rather than treating it as a host error.
    DecodeFault,
}

/// Component F: translates guest locations into resident host code.
pub struct Translator<D, O, B> {
    decoder: D,
    optimizer: O,
    backend: B,
}

impl<D: Decoder, O: Optimizer, B: Backend> Translator<D, O, B> {
    pub fn new(decoder: D, optimizer: O, backend: B) -> Self {
        Translator {
            decoder,
            optimizer,
            backend,
        }
    }

    #[must_use]
    pub fn backend(&self) -> &B {
        &self.backend
    }

    /// Emit the one-time prelude (`spec.md` §4.E). Callers invoke this
    /// exactly once per arena, before any call to [`Translator::emit`].
    pub fn emit_prelude(&self, arena: &Arena) -> PreludeInfo {
        arena.unprotect().expect("arena protection flip must succeed");
        let prelude = self.backend.emit_prelude(arena);
        arena.protect().expect("arena protection flip must succeed");
        prelude
    }

    /// `spec.md` §4.F: translate and link `ld`, registering it in `index`
    /// and `range_map` and relinking any existing referrers to point at it.
    #[allow(clippy::too_many_arguments)]
    pub fn emit(
        &self,
        arena: &Arena,
        index: &mut BlockIndex,
        range_map: &mut RangeMap,
        linker: &Linker,
        prelude: &PreludeInfo,
        invalidation: &InvalidationCoordinator,
        config: &Config,
        ld: LocationDescriptor,
    ) -> EmitOutcome {
        // Step 1: the hard backstop — refuse to even attempt emission
        // without SAFETY_MARGIN headroom, so a block that almost fits never
        // leaves the arena in a state where a retry after ClearCache still
        // can't make progress.
        if arena.remaining() < SAFETY_MARGIN {
            return EmitOutcome::OutOfSpace;
        }

        // Step 2: unprotect for the duration of decode+optimize+emit+link.
        arena
            .unprotect()
            .expect("arena protection flip must succeed");

        // Step 3: decode.
        let Some(ir) = self.decoder.decode(ld) else {
            arena.protect().expect("arena protection flip must succeed");
            return EmitOutcome::DecodeFault;
        };

        // Step 4: optimize under the façade's effective optimization set.
        let ir = self.optimizer.optimize(ir, config.effective_optimizations());

        // Step 5: emit host code. A `Backend` impl panics on an internal
        // invariant violation (`spec.md` §7 "emitter assertion") rather
        // than returning an error; that is a host-fatal condition this
        // layer does not attempt to recover from. The do-not-fastmem
        // snapshot lets the backend suppress an inline fastmem fast path at
        // any site a previous fault marked recompile-without-it
        // (`spec.md` §3/§4.H step 4).
        let do_not_fastmem = invalidation.do_not_fastmem_snapshot();
        let info = self.backend.emit(arena, &ir, &do_not_fastmem);
        let entry_point = info.entry_point;
        let guest_range = info.guest_range;
        let size = info.size;

        // Step 6: register in the Block Index.
        index.register(ld, info);

        // Step 7: link this block's own relocation sites.
        if let Some(info) = index.info(entry_point) {
            linker.link_block(arena, index, prelude, entry_point, info);
        }

        // Step 8: publish to the fast-dispatch table. Only meaningful when
        // the optional optimization is enabled (`spec.md` §6
        // `FAST_DISPATCH`); otherwise the dispatcher never consults it and
        // populating it would just be dead state.
        if config.effective_optimizations().contains(Optimizations::FAST_DISPATCH) {
            linker.note_resident(ld, entry_point);
        }

        // Step 9: relink any block that already referenced this LD before
        // it became resident.
        linker.relink_for_descriptor(arena, index, prelude, ld);

        // This block's own bytes are now final; invalidate the host i-cache
        // over them before restoring W^X so a split I/D cache host never
        // fetches stale instructions for the range just written
        // (`spec.md` §4.F step 9).
        arena.invalidate_icache(entry_point, size);

        // Step 10: restore W^X.
        arena.protect().expect("arena protection flip must succeed");

        // Step 11: record the guest-PC range this block covers.
        range_map.add_range(guest_range.0, guest_range.1, ld);

        EmitOutcome::Emitted(entry_point)
    }
}
