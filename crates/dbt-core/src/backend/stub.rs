//! A `Decoder`/`Optimizer`/`Backend` triple that never touches a real ISA.
//!
//! Exists only so this crate's own tests can drive the Translator, Linker,
//! and Block Index end to end. Every "instruction" is a fixed 4-byte guest
//! unit and every emitted block is an opaque fixed-size stub of host bytes
//! ending in a relocation to `return_to_dispatcher` — nothing here is ever
//! actually executed, the same contract the teacher documents on its own
//! stub backend's single trap byte.

use rustc_hash::{FxHashMap, FxHashSet};

use super::{Backend, Decoder, IrBlock, Optimizer};
use crate::arena::Arena;
use crate::block_index::{EmittedBlockInfo, LinkTarget, Relocation};
use crate::config::Optimizations;
use crate::location::LocationDescriptor;
use crate::prelude::PreludeInfo;

/// Guest units are 4 bytes wide regardless of guest ISA — close enough to
/// an AArch32/AArch64 fixed-width instruction for exercising range and
/// block-index arithmetic without a real decoder.
pub const STUB_INSTRUCTION_WIDTH: u64 = 4;

/// Fixed size of every block this backend emits, in host bytes. Large
/// enough to hold the one `ReturnToDispatcher` relocation slot at offset 0.
pub const STUB_BLOCK_SIZE: usize = 32;

/// Size of each prelude trampoline slot this backend emits.
pub const STUB_PRELUDE_SLOT_SIZE: usize = 16;

/// Decodes exactly one fixed-width guest unit per block — single-step and
/// ordinary dispatch look identical to this decoder, since there is no real
/// branch recognition to do.
#[derive(Default)]
pub struct StubDecoder;

impl Decoder for StubDecoder {
    fn decode(&self, ld: LocationDescriptor) -> Option<IrBlock> {
        Some(IrBlock {
            ld,
            guest_range: (ld.pc(), ld.pc() + STUB_INSTRUCTION_WIDTH),
            instruction_count: 1,
        })
    }
}

/// Passes the block through unchanged; there is nothing in an [`IrBlock`]
/// this stub recognizes to optimize.
#[derive(Default)]
pub struct StubOptimizer;

impl Optimizer for StubOptimizer {
    fn optimize(&self, block: IrBlock, _enabled: Optimizations) -> IrBlock {
        block
    }
}

/// Emits opaque, never-executed host bytes for each block and prelude
/// trampoline.
#[derive(Default)]
pub struct StubBackend;

impl Backend for StubBackend {
    fn emit(
        &self,
        arena: &Arena,
        block: &IrBlock,
        do_not_fastmem: &FxHashSet<(LocationDescriptor, usize)>,
    ) -> EmittedBlockInfo {
        // This stub never emits an inline fastmem fast path to suppress;
        // the set exists only to be threaded through correctly.
        let _ = do_not_fastmem;

        // SAFETY: the Translator contract requires `arena` be unprotected
        // for the duration of an emission (`spec.md` §4.F steps 2/10).
        let entry_point = unsafe { arena.emit_bytes(&[0u8; STUB_BLOCK_SIZE]) }
            .expect("Translator must check arena.remaining() before calling emit");

        EmittedBlockInfo {
            entry_point,
            size: STUB_BLOCK_SIZE,
            relocations: vec![Relocation {
                offset_within_block: 0,
                target: LinkTarget::ReturnToDispatcher,
            }],
            block_relocations: FxHashMap::default(),
            fastmem_patch_info: FxHashMap::default(),
            guest_range: block.guest_range,
        }
    }

    fn emit_prelude(&self, arena: &Arena) -> PreludeInfo {
        // SAFETY: prelude emission happens once, before any guest code has
        // run, with the arena already unprotected by the caller.
        let run_code = unsafe { arena.emit_bytes(&[0u8; STUB_PRELUDE_SLOT_SIZE]) }.unwrap();
        let step_code = unsafe { arena.emit_bytes(&[0u8; STUB_PRELUDE_SLOT_SIZE]) }.unwrap();
        let return_to_dispatcher =
            unsafe { arena.emit_bytes(&[0u8; STUB_PRELUDE_SLOT_SIZE]) }.unwrap();
        let return_from_run_code =
            unsafe { arena.emit_bytes(&[0u8; STUB_PRELUDE_SLOT_SIZE]) }.unwrap();

        PreludeInfo {
            run_code,
            step_code,
            return_to_dispatcher,
            return_from_run_code,
            helpers: FxHashMap::default(),
            end_of_prelude: arena.cursor(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::location::IsaMode;

    #[test]
    fn prelude_then_block_emission_does_not_overlap() {
        let arena = Arena::new(64 * 1024).unwrap();
        arena.unprotect().unwrap();
        let backend = StubBackend;
        let prelude = backend.emit_prelude(&arena);
        assert_eq!(prelude.end_of_prelude, arena.cursor());

        let decoder = StubDecoder;
        let ld = LocationDescriptor::new(0x1000, IsaMode::default());
        let ir = decoder.decode(ld).unwrap();
        let info = backend.emit(&arena, &ir, &FxHashSet::default());
        assert!(info.entry_point >= prelude.return_from_run_code);
        arena.protect().unwrap();
    }

    #[test]
    fn decode_produces_one_stub_instruction_span() {
        let decoder = StubDecoder;
        let ld = LocationDescriptor::new(0x2000, IsaMode::default());
        let ir = decoder.decode(ld).unwrap();
        assert_eq!(ir.guest_range, (0x2000, 0x2004));
    }
}
