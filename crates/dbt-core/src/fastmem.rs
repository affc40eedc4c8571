//! Component H: the Fastmem Protocol.
//!
//! [`FastmemFaultHandler`] is the concrete [`FaultHandler`] a façade installs
//! with the process-wide Exception Handler (component B) when
//! [`Config::fastmem`](crate::config::Config::fastmem) is set (`spec.md`
//! §4.H, §6 `fastmem_pointer`). It implements the five steps `spec.md` §4.H
//! lays out: resolve the faulting host PC to a resident block, resolve the
//! per-site [`FastmemPatchInfo`](crate::block_index::FastmemPatchInfo),
//! optionally schedule recompilation without the inline fast path, and hand
//! back the resume address the platform handler rewrites the faulting
//! thread's PC to.
//!
//! Holds `Arc`-shared handles into the façade's own [`BlockIndex`] and
//! [`InvalidationCoordinator`] rather than owning them, since the process-wide
//! Exception Handler registry keeps this alive independently of the `Cpu`
//! that installed it (`spec.md` §9 "Signal-handler global state").

use std::sync::Arc;

use crate::arena::CodePtr;
use crate::block_index::SharedBlockIndex;
use crate::exception::FaultHandler;
use crate::halt::HaltWord;
use crate::invalidation::InvalidationCoordinator;

/// Component H, wired up for one façade's arena.
pub struct FastmemFaultHandler {
    index: SharedBlockIndex,
    halt: Arc<HaltWord>,
    invalidation: Arc<InvalidationCoordinator>,
}

impl FastmemFaultHandler {
    #[must_use]
    pub fn new(
        index: SharedBlockIndex,
        halt: Arc<HaltWord>,
        invalidation: Arc<InvalidationCoordinator>,
    ) -> Self {
        FastmemFaultHandler {
            index,
            halt,
            invalidation,
        }
    }
}

impl FaultHandler for FastmemFaultHandler {
    /// `spec.md` §4.H:
    /// 1. Resolve `host_pc → entry_point` via reverse lookup.
    /// 2. Resolve `(entry_point, host_pc - entry_point) → FastmemPatchInfo`;
    ///    on failure the fault is not an ordinary fastmem miss.
    /// 3. `fc = patch.fake_call`.
    /// 4. If `patch.recompile`, mark the site do-not-fastmem and schedule
    ///    invalidation of the containing block.
    /// 5. Return `fc` for the platform handler to redirect to.
    fn handle(&self, fault_host_pc: usize) -> Option<usize> {
        let index = self.index.read();
        let (entry_point, info) = index.info_covering(fault_host_pc as CodePtr)?;
        let offset = fault_host_pc - entry_point as usize;

        let Some(patch) = info.fastmem_patch_info.get(&offset) else {
            // `spec.md` §4.H step 2 / §7: a fault landing inside a resident
            // block at a site with no recorded patch is not an ordinary
            // fastmem miss — a buggy emitter or a wild guest pointer outside
            // the fastmem path reached here instead. This is host-fatal.
            drop(index);
            panic!(
                "fault at {fault_host_pc:#x} inside block {entry_point:?}+{offset:#x} has no fastmem patch info"
            );
        };

        if patch.recompile {
            self.invalidation
                .report_fastmem_failure(&self.halt, patch.marker, info.guest_range);
        }

        Some(patch.fake_call.resume_pc)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::block_index::{BlockIndex, EmittedBlockInfo, FakeCall, FastmemPatchInfo};
    use crate::location::{IsaMode, LocationDescriptor};
    use rustc_hash::FxHashMap;
    use std::ptr;

    fn ptr_at(offset: usize) -> CodePtr {
        ptr::null::<u8>().wrapping_add(offset)
    }

    fn handler_with_block(
        entry_point: CodePtr,
        ld: LocationDescriptor,
        patch_offset: usize,
        patch: FastmemPatchInfo,
    ) -> (FastmemFaultHandler, Arc<HaltWord>, Arc<InvalidationCoordinator>) {
        let index = BlockIndex::new_shared();
        let mut fastmem_patch_info = FxHashMap::default();
        fastmem_patch_info.insert(patch_offset, patch);
        index.write().register(
            ld,
            EmittedBlockInfo {
                entry_point,
                size: 64,
                relocations: vec![],
                block_relocations: FxHashMap::default(),
                fastmem_patch_info,
                guest_range: (ld.pc(), ld.pc() + 4),
            },
        );
        let halt = Arc::new(HaltWord::new());
        let invalidation = Arc::new(InvalidationCoordinator::new());
        let fault_handler =
            FastmemFaultHandler::new(index, Arc::clone(&halt), Arc::clone(&invalidation));
        (fault_handler, halt, invalidation)
    }

    #[test]
    fn redirects_to_fake_call_resume_pc() {
        let ld = LocationDescriptor::new(0x1000, IsaMode::default());
        let entry_point = ptr_at(0x9000);
        let patch = FastmemPatchInfo {
            marker: (ld, 0),
            fake_call: FakeCall {
                resume_pc: 0xFEED,
                payload: vec![],
            },
            recompile: false,
        };
        let (handler, halt, invalidation) = handler_with_block(entry_point, ld, 8, patch);

        let resume = handler.handle(entry_point as usize + 8);
        assert_eq!(resume, Some(0xFEED));
        // recompile wasn't set: no standing do-not-fastmem marker, no halt.
        assert!(invalidation.do_not_fastmem_snapshot().is_empty());
        assert!(halt.load().is_empty());
    }

    #[test]
    fn recompile_marks_site_and_requests_invalidation() {
        let ld = LocationDescriptor::new(0x2000, IsaMode::default());
        let entry_point = ptr_at(0xA000);
        let marker = (ld, 0);
        let patch = FastmemPatchInfo {
            marker,
            fake_call: FakeCall {
                resume_pc: 0xBEEF,
                payload: vec![],
            },
            recompile: true,
        };
        let (handler, halt, invalidation) = handler_with_block(entry_point, ld, 16, patch);

        let resume = handler.handle(entry_point as usize + 16);
        assert_eq!(resume, Some(0xBEEF));
        assert!(invalidation.do_not_fastmem_snapshot().contains(&marker));
        assert!(halt.load().contains(crate::halt::HaltReason::CACHE_INVALIDATION));
    }

    #[test]
    fn fault_outside_any_block_is_not_ours() {
        let ld = LocationDescriptor::new(0x1000, IsaMode::default());
        let entry_point = ptr_at(0x9000);
        let patch = FastmemPatchInfo {
            marker: (ld, 0),
            fake_call: FakeCall {
                resume_pc: 0xFEED,
                payload: vec![],
            },
            recompile: false,
        };
        let (handler, ..) = handler_with_block(entry_point, ld, 8, patch);

        assert_eq!(handler.handle(0x100), None);
    }

    #[test]
    #[should_panic(expected = "has no fastmem patch info")]
    fn fault_inside_block_at_unrecorded_site_is_fatal() {
        let ld = LocationDescriptor::new(0x1000, IsaMode::default());
        let entry_point = ptr_at(0x9000);
        let patch = FastmemPatchInfo {
            marker: (ld, 0),
            fake_call: FakeCall {
                resume_pc: 0xFEED,
                payload: vec![],
            },
            recompile: false,
        };
        let (handler, ..) = handler_with_block(entry_point, ld, 8, patch);

        // Offset 4 has no recorded patch, unlike offset 8.
        let _ = handler.handle(entry_point as usize + 4);
    }
}
