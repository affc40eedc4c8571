//! Translation-cache address space for a dynamic ARM-to-host binary
//! translator.
//!
//! This crate owns everything between "the guest wants to run code at PC
//! `X`" and "here is a host pointer to jump to": an executable memory
//! arena, the bidirectional guest-location/host-pointer index, a guest-PC
//! range map for invalidation, the one-time prelude/dispatcher, the block
//! translator pipeline, the relocation linker, the fastmem fault protocol,
//! and the cross-thread invalidation coordinator.
//!
//! It does not ship a decoder, optimizer, or host code generator for any
//! real ISA — those are external collaborators reached through the
//! [`backend::Decoder`]/[`backend::Optimizer`]/[`backend::Backend`] traits.
//! [`backend::stub`] is a non-executing triple used only by this crate's
//! own tests.
//!
//! # Example
//!
//! ```rust,ignore
//! use dbt_core::{Config, Cpu, FnPtrDispatch};
//! use dbt_core::backend::stub::{StubBackend, StubDecoder, StubOptimizer};
//!
//! let mut cpu = Cpu::new(
//!     Config::default(),
//!     StubDecoder,
//!     StubOptimizer,
//!     StubBackend,
//!     FnPtrDispatch,
//! )?;
//! cpu.state_mut().pc = 0x1000;
//! let halt_reason = cpu.run();
//! ```

#![warn(missing_docs)]
#![allow(clippy::module_name_repetitions)]

/// Component A: the executable memory arena.
pub mod arena;

/// External interfaces this crate drives but never implements for a real
/// ISA: `Decoder`, `Optimizer`, `Backend`.
pub mod backend;

/// Component C: the bidirectional guest-location / host-pointer index.
pub mod block_index;

/// User-facing configuration.
pub mod config;

/// Recoverable setup-time error type.
pub mod error;

/// Component B: the process-wide fault handler.
pub mod exception;

/// The cross-façade exclusive-access monitor.
pub mod exclusive_monitor;

/// The public CPU façade: `Run`, `Step`, `ClearCache`, `InvalidateCacheRange`,
/// `HaltExecution`, `ClearHalt`, `Reset`.
pub mod facade;

/// Component H: the fastmem fault protocol glue between the Exception
/// Handler and the Block Index / Invalidation Coordinator.
pub mod fastmem;

/// The halt-reason bitmask and its atomic storage.
pub mod halt;

/// Component I: the invalidation coordinator.
pub mod invalidation;

/// Component G: the relocation linker and fast-dispatch table.
pub mod linker;

/// Guest program-location identity.
pub mod location;

/// Component E: the prelude / dispatcher trampoline addresses.
pub mod prelude;

/// Component D: the guest-PC range map.
pub mod range_map;

/// Component F: the block translator pipeline.
pub mod translator;

pub use arena::{Arena, CodePtr};
pub use backend::{Backend, Decoder, IrBlock, Optimizer};
pub use block_index::{BlockIndex, EmittedBlockInfo, LinkTarget, MemWidth, SharedBlockIndex};
pub use config::{Config, FastmemConfig, Optimizations, PageTableConfig, SystemRegisters};
pub use error::{Error, Result};
pub use exception::{ExceptionHandler, FaultHandler};
pub use exclusive_monitor::ExclusiveMonitor;
pub use facade::{Cpu, CpuState, Dispatch, EnterResult, FnPtrDispatch, RunEntryFn};
pub use fastmem::FastmemFaultHandler;
pub use halt::{HaltReason, HaltWord};
pub use invalidation::InvalidationCoordinator;
pub use linker::Linker;
pub use location::{GuestPc, GuestPc32, GuestPc64, IsaMode, LocationDescriptor};
pub use range_map::RangeMap;
pub use translator::{EmitOutcome, Translator};
