//! The public CPU façade (`spec.md` §5).
//!
//! One [`Cpu`] wraps one translation-cache address space: its own Arena,
//! Block Index, Range Map, Linker, and Translator, plus the guest register
//! state a `Backend`'s emitted code reads and writes directly. Per
//! `spec.md` §5, a façade assumes single-threaded ownership of `Run`/`Step`
//! (enforced by `is_executing`), while `HaltExecution`,
//! `InvalidateCacheRange`, and `ClearCache` are safe to call from any
//! thread at any time, including from inside a memory-access callback
//! running on the façade's own thread.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use crate::arena::{Arena, CodePtr};
use crate::backend::{Backend, Decoder, Optimizer};
use crate::block_index::{BlockIndex, SharedBlockIndex};
use crate::config::Config;
use crate::error::Result;
use crate::exception::{ExceptionHandler, FaultHandler};
use crate::exclusive_monitor::ExclusiveMonitor;
use crate::fastmem::FastmemFaultHandler;
use crate::halt::{HaltReason, HaltWord};
use crate::invalidation::InvalidationCoordinator;
use crate::linker::{Linker, RETURN_STACK_BUFFER_DEPTH};
use crate::location::{GuestPc, IsaMode, LocationDescriptor};
use crate::prelude::PreludeInfo;
use crate::range_map::RangeMap;
use crate::translator::{EmitOutcome, Translator};

/// Guest register file and the flags `Run`/`Step` read and write
/// (`spec.md` §3 `JitState`, §5).
#[derive(Debug, Clone)]
pub struct CpuState {
    /// General-purpose registers. Indices beyond what the current guest
    /// ISA/mode define are simply unused.
    pub gprs: [u64; 32],
    /// SIMD/FP register file, 128 bits each (covers AArch64 `Vn`/AArch32
    /// `Dn`/`Qn` aliasing at the byte level; interpreting the aliasing is
    /// the frontend's concern).
    pub simd: [[u8; 16]; 32],
    /// Condition flags (NZCV and any guest-ISA-specific bits the frontend
    /// defines).
    pub flags: u32,
    pub sp: u64,
    pub pc: GuestPc,
    pub fpcr: u32,
    /// ISA-mode bits persisted across blocks. `single_step` here is always
    /// `false`; `Step` constructs a transient [`IsaMode`] with it set only
    /// for the one [`LocationDescriptor`] being stepped.
    pub mode: IsaMode,
    /// Return-stack-buffer slots a linked block's call/return sequence
    /// maintains (`spec.md` §6 `RETURN_STACK_BUFFER`).
    pub rsb: [GuestPc; RETURN_STACK_BUFFER_DEPTH],
    pub rsb_top: usize,
}

impl Default for CpuState {
    fn default() -> Self {
        CpuState {
            gprs: [0; 32],
            simd: [[0; 16]; 32],
            flags: 0,
            sp: 0,
            pc: 0,
            fpcr: 0,
            mode: IsaMode::default(),
            rsb: [0; RETURN_STACK_BUFFER_DEPTH],
            rsb_top: 0,
        }
    }
}

impl CpuState {
    /// The [`LocationDescriptor`] `Run` would resolve next.
    #[must_use]
    pub fn current_location(&self) -> LocationDescriptor {
        LocationDescriptor::new(self.pc, self.mode)
    }

    /// The stepping [`LocationDescriptor`] `Step` resolves, independent of
    /// whether ordinary `Run` has ever visited this PC.
    #[must_use]
    pub fn stepping_location(&self) -> LocationDescriptor {
        LocationDescriptor::new(
            self.pc,
            IsaMode {
                single_step: true,
                ..self.mode
            },
        )
    }
}

/// What a [`Dispatch::enter`] call did.
///
/// A concrete implementation's dispatcher trampoline either runs to a halt
/// (possibly chaining through many linked blocks without ever returning to
/// Rust in between) or reaches a terminal whose target isn't resident,
/// updates `state.pc`/`state.mode` to name it, and returns control so the
/// façade can translate it (`spec.md` §4.E `return_to_dispatcher`).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EnterResult {
    Halted(HaltReason),
    NeedsBlock,
}

/// Transfers control from Rust into resident host code and back
/// (`spec.md` §4.E). This is the one seam in the crate that a concrete
/// `Backend` must pair with a compatible dispatcher implementation; the
/// crate ships no default beyond [`FnPtrDispatch`], which assumes the
/// backend's `run_code`/`step_code` trampolines follow the
/// [`RunEntryFn`] calling convention.
pub trait Dispatch: Send + Sync {
    /// # Safety
    /// `entry` must be a resident entry point previously returned by
    /// [`Translator::emit`] or named on a [`PreludeInfo`], and `state` must
    /// be the same [`CpuState`] the entry point's generating `Backend`
    /// expects.
    unsafe fn enter(&self, entry: CodePtr, state: &mut CpuState) -> EnterResult;
}

/// FFI shape a `run_code`/`step_code` trampoline must follow to be driven
/// by [`FnPtrDispatch`], mirroring the context-pointer calling convention
/// the teacher's own JIT-to-runtime trampolines use.
#[repr(C)]
#[derive(Debug, Clone, Copy)]
pub struct RawDispatchOutcome {
    pub halted: bool,
    pub halt_reason_bits: u32,
}

pub type RunEntryFn = unsafe extern "C" fn(state: *mut CpuState) -> RawDispatchOutcome;

/// [`Dispatch`] that calls a [`CodePtr`] as a [`RunEntryFn`]. The only
/// implementation of [`Dispatch`] that actually transfers control to
/// generated machine code; anything driving this crate's own test suite
/// uses a non-executing mock instead, since the bundled [`stub`
/// backend](crate::backend::stub) never emits real instructions.
pub struct FnPtrDispatch;

impl Dispatch for FnPtrDispatch {
    unsafe fn enter(&self, entry: CodePtr, state: &mut CpuState) -> EnterResult {
        // SAFETY: forwarded from the caller's contract on `Dispatch::enter`.
        let f: RunEntryFn = unsafe { std::mem::transmute::<CodePtr, RunEntryFn>(entry) };
        // SAFETY: `f` was produced by a `Backend` that emitted code
        // conforming to `RunEntryFn`'s calling convention, per the same
        // contract.
        let outcome = unsafe { f(state as *mut CpuState) };
        if outcome.halted {
            EnterResult::Halted(HaltReason::from_bits(outcome.halt_reason_bits))
        } else {
            EnterResult::NeedsBlock
        }
    }
}

/// One translation-cache address space plus the guest state it executes
/// (`spec.md` §5).
pub struct Cpu<D, O, B, X> {
    arena: Arena,
    index: SharedBlockIndex,
    range_map: RangeMap,
    linker: Linker,
    prelude: PreludeInfo,
    translator: Translator<D, O, B>,
    dispatch: X,
    invalidation: Arc<InvalidationCoordinator>,
    config: Config,
    halt: Arc<HaltWord>,
    state: CpuState,
    is_executing: AtomicBool,
    /// Keeps this façade's arena registered with the Exception Handler for
    /// as long as the `Cpu` lives (`spec.md` §4.H). `None` when
    /// [`Config::fastmem`] is unset.
    _fastmem_registration: Option<ExceptionHandler>,
}

impl<D: Decoder, O: Optimizer, B: Backend, X: Dispatch> Cpu<D, O, B, X> {
    pub fn new(config: Config, decoder: D, optimizer: O, backend: B, dispatch: X) -> Result<Self> {
        config.validate()?;
        let arena = Arena::new(config.code_cache_size)?;
        let translator = Translator::new(decoder, optimizer, backend);
        let prelude = translator.emit_prelude(&arena);

        let index = BlockIndex::new_shared();
        let halt = Arc::new(HaltWord::new());
        let invalidation = Arc::new(InvalidationCoordinator::new());

        // `spec.md` §4.H: only a façade configured for fastmem registers its
        // arena with the Exception Handler — callers that never set
        // `fastmem_pointer` never take a guest memory access through a raw
        // host load/store in the first place, so there is nothing for this
        // handler to ever be consulted about.
        let fastmem_registration = if config.fastmem.is_some() {
            let handler: Arc<dyn FaultHandler> = Arc::new(FastmemFaultHandler::new(
                Arc::clone(&index),
                Arc::clone(&halt),
                Arc::clone(&invalidation),
            ));
            let code_begin = arena.base() as usize;
            let code_end = code_begin + arena.capacity();
            Some(ExceptionHandler::install(code_begin, code_end, handler)?)
        } else {
            None
        };

        Ok(Cpu {
            arena,
            index,
            range_map: RangeMap::new(),
            linker: Linker::new(),
            prelude,
            translator,
            dispatch,
            invalidation,
            config,
            halt,
            state: CpuState::default(),
            is_executing: AtomicBool::new(false),
            _fastmem_registration: fastmem_registration,
        })
    }

    #[must_use]
    pub fn state(&self) -> &CpuState {
        &self.state
    }

    #[must_use]
    pub fn state_mut(&mut self) -> &mut CpuState {
        &mut self.state
    }

    /// `spec.md` §5 `Reset`: clear the entire cache and reinitialize guest
    /// state. The prelude is not re-emitted (`spec.md` §4.A `reset`).
    pub fn reset(&mut self) {
        self.invalidation.request_clear_cache(&self.halt);
        {
            let mut index = self.index.write();
            self.invalidation.service(
                &self.halt,
                &self.arena,
                &mut index,
                &mut self.range_map,
                &self.linker,
                &self.prelude,
            );
        }
        self.state = CpuState::default();
        self.halt.take();
    }

    /// `spec.md` §5 `ClearCache`. Callable from any thread.
    pub fn clear_cache(&self) {
        self.invalidation.request_clear_cache(&self.halt);
    }

    /// `spec.md` §5 `InvalidateCacheRange`. Callable from any thread.
    pub fn invalidate_cache_range(&self, start: GuestPc, end: GuestPc) {
        self.invalidation.request_invalidate_range(&self.halt, start, end);
    }

    /// `spec.md` §5 `HaltExecution`: request that the currently (or next)
    /// running block return control after the current block instead of
    /// continuing to chain into the next one. `reason` should be one of the
    /// eight user-defined bits ([`HaltReason::user_defined`]).
    pub fn halt_execution(&self, reason: HaltReason) {
        self.halt.set(reason);
    }

    /// `spec.md` §5 `ClearHalt`: clear previously-requested user-defined
    /// halt bits without waiting for a `Run`/`Step` to consume them.
    pub fn clear_halt(&self, reason: HaltReason) {
        self.halt.clear(reason);
    }

    fn service_pending_invalidation(&mut self) {
        if self.invalidation.has_pending() {
            let mut index = self.index.write();
            self.invalidation.service(
                &self.halt,
                &self.arena,
                &mut index,
                &mut self.range_map,
                &self.linker,
                &self.prelude,
            );
        }
    }

    /// Resolve `ld` to a resident entry point, translating it if
    /// necessary. On `OutOfSpace`, runs a full clear and retries exactly
    /// once; a cache too small to hold even the prelude plus one block is a
    /// configuration error.
    fn resolve_or_translate(&mut self, ld: LocationDescriptor) -> CodePtr {
        if let Some(ptr) = self
            .linker
            .fast_dispatch_lookup(ld)
            .or_else(|| self.index.read().get(ld))
        {
            return ptr;
        }

        let mut index = self.index.write();
        let outcome = self.translator.emit(
            &self.arena,
            &mut index,
            &mut self.range_map,
            &self.linker,
            &self.prelude,
            &self.invalidation,
            &self.config,
            ld,
        );
        drop(index);

        match outcome {
            EmitOutcome::Emitted(ptr) => ptr,
            EmitOutcome::DecodeFault => {
                self.halt.set(HaltReason::DECODE_FAULT);
                self.prelude.return_from_run_code
            }
            EmitOutcome::OutOfSpace => {
                self.invalidation.request_clear_cache(&self.halt);
                self.service_pending_invalidation();
                let mut index = self.index.write();
                match self.translator.emit(
                    &self.arena,
                    &mut index,
                    &mut self.range_map,
                    &self.linker,
                    &self.prelude,
                    &self.invalidation,
                    &self.config,
                    ld,
                ) {
                    EmitOutcome::Emitted(ptr) => ptr,
                    _ => panic!(
                        "code_cache_size is too small to ever hold the prelude plus one block"
                    ),
                }
            }
        }
    }

    fn enter_guarded(&mut self, mut step_once: bool, first_ld: LocationDescriptor) -> HaltReason {
        struct ReentrancyGuard<'a>(&'a AtomicBool);
        impl Drop for ReentrancyGuard<'_> {
            fn drop(&mut self) {
                self.0.store(false, Ordering::Release);
            }
        }
        assert!(
            !self.is_executing.swap(true, Ordering::AcqRel),
            "Run/Step called reentrantly on the same Cpu"
        );
        let _guard = ReentrancyGuard(&self.is_executing);

        let mut ld = first_ld;
        loop {
            self.service_pending_invalidation();
            let entry = self.resolve_or_translate(ld);
            if self.halt.load().contains(HaltReason::DECODE_FAULT) {
                return self.halt.take();
            }

            // SAFETY: `entry` was just resolved as resident by
            // `resolve_or_translate`, and `self.state` is the `CpuState`
            // the emitting `Backend` expects.
            let outcome = unsafe { self.dispatch.enter(entry, &mut self.state) };
            match outcome {
                EnterResult::Halted(reason) => return reason,
                EnterResult::NeedsBlock => {
                    ld = if step_once {
                        step_once = false;
                        self.state.stepping_location()
                    } else {
                        self.state.current_location()
                    };
                }
            }
        }
    }

    /// `spec.md` §5 `Run`: execute until `halt_reason` becomes non-zero,
    /// then return it.
    pub fn run(&mut self) -> HaltReason {
        let ld = self.state.current_location();
        self.enter_guarded(false, ld)
    }

    /// `spec.md` §5 `Step`: execute exactly one guest instruction, then
    /// return.
    pub fn step(&mut self) -> HaltReason {
        let ld = self.state.stepping_location();
        self.enter_guarded(true, ld)
    }
}

/// The only object shared across façades that target the same guest
/// coherency domain (`spec.md` §5). Not owned by [`Cpu`] itself since
/// several façades typically share one.
pub type SharedExclusiveMonitor = std::sync::Arc<ExclusiveMonitor>;
