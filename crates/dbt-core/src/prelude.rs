//! Component E: the Prelude / Dispatcher.
//!
//! The prelude is a fixed block of host code emitted once, at the start of
//! the arena, ahead of any translated guest block (`spec.md` §4.E). It is
//! never itself the target of an invalidation and is never emitted again
//! for the lifetime of the façade; [`crate::arena::Arena::reset`] rewinds
//! the bump cursor back to just past it, never through it.
//!
//! This crate does not carry a concrete host code generator (`spec.md` §6):
//! the trampoline addresses below are whatever a [`crate::backend::Backend`]
//! impl's `emit_prelude` chose to place them at. [`crate::backend::stub`]
//! returns synthetic addresses that are recorded but never executed, the
//! same contract `StubBackend::compile_function` documents for its callers.

use rustc_hash::FxHashMap;

use crate::arena::CodePtr;
use crate::block_index::LinkTarget;

/// Addresses of the fixed trampolines a `Backend` emits once at startup
/// (`spec.md` §4.E).
#[derive(Debug, Clone)]
pub struct PreludeInfo {
    /// Entry point for the `Run` operation: sets up the dispatch loop and
    /// jumps to the current PC's block (or to the dispatcher if unresident).
    pub run_code: CodePtr,
    /// Entry point for the `Step` operation: as `run_code`, but arms exactly
    /// one block's `CheckHalt` to unconditionally halt on exit.
    pub step_code: CodePtr,
    /// Landing pad every unlinked/invalidated block terminal jumps to:
    /// resolves the current LD via the Block Index and either jumps to a
    /// resident block or falls through to `return_from_run_code`.
    pub return_to_dispatcher: CodePtr,
    /// Landing pad that restores the host call stack/registers and returns
    /// control to the façade's caller, after atomically taking
    /// `halt_reason` (`spec.md` §4.E "atomically clears halt_reason
    /// returning its prior value").
    pub return_from_run_code: CodePtr,
    /// Per-`LinkTarget` helper thunks (`spec.md` §3 `relocations`): memory
    /// accessors, SVC/exception raises, barrier/cache-op hooks, and the
    /// cycle-counter helpers. Populated from whatever subset of
    /// [`LinkTarget`] the backend actually wired up; a relocation naming a
    /// target absent here is a backend bug, not a runtime condition this
    /// crate handles.
    pub helpers: FxHashMap<LinkTarget, CodePtr>,
    /// Arena offset immediately past the last prelude byte. `Arena::reset`
    /// is always called with this value, never a smaller one, so the
    /// prelude is never overwritten by a subsequent block emission
    /// (`spec.md` §4.A `reset`).
    pub end_of_prelude: usize,
}

impl PreludeInfo {
    /// Look up the trampoline for `target`, if the backend emitted one.
    #[must_use]
    pub fn helper(&self, target: LinkTarget) -> Option<CodePtr> {
        self.helpers.get(&target).copied()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::block_index::MemWidth;
    use std::ptr;

    fn ptr_at(offset: usize) -> CodePtr {
        ptr::null::<u8>().wrapping_add(offset)
    }

    fn sample() -> PreludeInfo {
        let mut helpers = FxHashMap::default();
        helpers.insert(LinkTarget::ReadMemory(MemWidth::W32), ptr_at(0x100));
        PreludeInfo {
            run_code: ptr_at(0x10),
            step_code: ptr_at(0x20),
            return_to_dispatcher: ptr_at(0x30),
            return_from_run_code: ptr_at(0x40),
            helpers,
            end_of_prelude: 0x200,
        }
    }

    #[test]
    fn known_helper_resolves() {
        let prelude = sample();
        assert_eq!(
            prelude.helper(LinkTarget::ReadMemory(MemWidth::W32)),
            Some(ptr_at(0x100))
        );
    }

    #[test]
    fn unknown_helper_is_none() {
        let prelude = sample();
        assert_eq!(prelude.helper(LinkTarget::CallSvc), None);
    }
}
