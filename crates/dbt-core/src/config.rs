//! User-facing configuration, enumerating every knob in `spec.md` §6.

use crate::error::{Error, Result};

/// Maximum code cache size supported on an AArch64 host (`spec.md` §4.A).
pub const MAX_CODE_CACHE_SIZE: usize = 128 * 1024 * 1024;

/// Safety margin kept free before a translator is allowed to emit
/// (`spec.md` §4.F step 1).
pub const SAFETY_MARGIN: usize = 1024 * 1024;

/// A minimal hand-rolled bitflags macro.
///
/// The corpus doesn't pull in the `bitflags` crate anywhere in this domain,
/// and a handful of flag sets don't justify adding one; this mirrors the
/// shape `bitflags!` generates closely enough that call sites read the same.
macro_rules! bitflags_like {
    (
        $(#[$meta:meta])*
        pub struct $name:ident: $ty:ty {
            $(const $flag:ident = $value:expr;)*
        }
    ) => {
        $(#[$meta])*
        #[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
        pub struct $name($ty);

        impl $name {
            $(pub const $flag: $name = $name($value);)*

            /// No bits set.
            pub const NONE: $name = $name(0);

            #[must_use]
            pub fn contains(self, other: $name) -> bool {
                self.0 & other.0 == other.0
            }

            #[must_use]
            pub fn bits(self) -> $ty {
                self.0
            }
        }

        impl std::ops::BitOr for $name {
            type Output = $name;
            fn bitor(self, rhs: $name) -> $name {
                $name(self.0 | rhs.0)
            }
        }

        impl std::ops::BitAnd for $name {
            type Output = $name;
            fn bitand(self, rhs: $name) -> $name {
                $name(self.0 & rhs.0)
            }
        }

        impl std::ops::Not for $name {
            type Output = $name;
            fn not(self) -> $name {
                $name(!self.0)
            }
        }
    };
}

bitflags_like! {
    /// `optimizations` bitfield (`spec.md` §6).
    pub struct Optimizations: u32 {
        const BLOCK_LINKING = 1 << 0;
        const RETURN_STACK_BUFFER = 1 << 1;
        const FAST_DISPATCH = 1 << 2;
        const GET_SET_ELIMINATION = 1 << 3;
        const CONST_PROP = 1 << 4;
        const MISC_IR_OPT = 1 << 5;
        const UNSAFE_IGNORE_GLOBAL_MONITOR = 1 << 6;
        const UNSAFE_REDUCED_ERROR_FP = 1 << 7;
        const UNSAFE_UNFUSE_FMA = 1 << 8;
    }
}

/// Optional page-table fast path for memory access (`spec.md` §6).
#[derive(Debug, Clone, Default)]
pub struct PageTableConfig {
    /// Pointer to the guest page table.
    pub page_table: Option<usize>,
    pub address_space_bits: u32,
    pub pointer_mask_bits: u32,
    pub silently_mirror_page_table: bool,
    pub absolute_offset_page_table: bool,
    pub detect_misaligned_access_via_page_table: Option<u32>,
    pub only_detect_misalignment_on_page_boundary: bool,
}

/// Optional host-MMU-mediated fast path for memory access (`spec.md` §6).
#[derive(Debug, Clone, Default)]
pub struct FastmemConfig {
    /// Base of the (typically sparse) host mapping backing the guest
    /// address space.
    pub fastmem_pointer: Option<usize>,
    pub address_space_bits: u32,
    pub silently_mirror_fastmem: bool,
    pub fastmem_exclusive_access: bool,
    pub recompile_on_fastmem_failure: bool,
    pub recompile_on_exclusive_fastmem_failure: bool,
}

/// ARM system register values that affect guest-visible behavior
/// (`spec.md` §6).
#[derive(Debug, Clone, Copy, Default)]
pub struct SystemRegisters {
    pub cntfrq_el0: u32,
    pub ctr_el0: u32,
    pub dczid_el0: u32,
    pub tpidrro_el0: u64,
    pub tpidr_el0: u64,
}

/// Top-level configuration for one translation-cache address space
/// (one per façade, `spec.md` §5).
#[derive(Debug, Clone)]
pub struct Config {
    /// Size in bytes of the executable memory arena. Capped at
    /// [`MAX_CODE_CACHE_SIZE`] on an AArch64 host.
    pub code_cache_size: usize,
    /// This façade's id within its `ExclusiveMonitor`.
    pub processor_id: usize,
    /// ARM architecture version selecting semantic variants (32-bit guest
    /// only).
    pub arch_version: Option<u32>,
    pub page_table: Option<PageTableConfig>,
    pub fastmem: Option<FastmemConfig>,
    pub optimizations: Optimizations,
    /// `unsafe_optimizations` gate: without this, `UNSAFE_*` bits in
    /// `optimizations` are ignored even if set.
    pub unsafe_optimizations: bool,
    pub hook_isb: bool,
    pub hook_hint_instructions: bool,
    pub define_unpredictable_behaviour: bool,
    pub always_little_endian: bool,
    pub check_halt_on_memory_access: bool,
    pub enable_cycle_counting: bool,
    pub wall_clock_cntpct: bool,
    pub system_registers: SystemRegisters,
}

impl Default for Config {
    fn default() -> Self {
        Config {
            code_cache_size: 32 * 1024 * 1024,
            processor_id: 0,
            arch_version: None,
            page_table: None,
            fastmem: None,
            optimizations: Optimizations::BLOCK_LINKING
                | Optimizations::RETURN_STACK_BUFFER
                | Optimizations::CONST_PROP
                | Optimizations::MISC_IR_OPT,
            unsafe_optimizations: false,
            hook_isb: false,
            hook_hint_instructions: false,
            define_unpredictable_behaviour: false,
            always_little_endian: false,
            check_halt_on_memory_access: false,
            enable_cycle_counting: false,
            wall_clock_cntpct: false,
            system_registers: SystemRegisters::default(),
        }
    }
}

impl Config {
    /// Validate this configuration, surfacing the documented error cases.
    pub fn validate(&self) -> Result<()> {
        if self.code_cache_size > MAX_CODE_CACHE_SIZE {
            return Err(Error::CodeCacheSizeTooLarge {
                requested: self.code_cache_size,
                max: MAX_CODE_CACHE_SIZE,
            });
        }
        if self.code_cache_size < SAFETY_MARGIN {
            return Err(Error::CodeCacheSizeTooSmall {
                requested: self.code_cache_size,
            });
        }
        Ok(())
    }

    /// Effective optimization bits: `UNSAFE_*` bits are masked out unless
    /// `unsafe_optimizations` is set.
    #[must_use]
    pub fn effective_optimizations(&self) -> Optimizations {
        if self.unsafe_optimizations {
            self.optimizations
        } else {
            self.optimizations
                & !(Optimizations::UNSAFE_IGNORE_GLOBAL_MONITOR
                    | Optimizations::UNSAFE_REDUCED_ERROR_FP
                    | Optimizations::UNSAFE_UNFUSE_FMA)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_config_validates() {
        assert!(Config::default().validate().is_ok());
    }

    #[test]
    fn oversized_cache_rejected() {
        let cfg = Config {
            code_cache_size: MAX_CODE_CACHE_SIZE + 1,
            ..Config::default()
        };
        assert!(matches!(
            cfg.validate(),
            Err(Error::CodeCacheSizeTooLarge { .. })
        ));
    }

    #[test]
    fn undersized_cache_rejected() {
        let cfg = Config {
            code_cache_size: 16,
            ..Config::default()
        };
        assert!(matches!(
            cfg.validate(),
            Err(Error::CodeCacheSizeTooSmall { .. })
        ));
    }

    #[test]
    fn unsafe_bits_masked_without_gate() {
        let cfg = Config {
            optimizations: Optimizations::UNSAFE_UNFUSE_FMA | Optimizations::CONST_PROP,
            unsafe_optimizations: false,
            ..Config::default()
        };
        let eff = cfg.effective_optimizations();
        assert!(!eff.contains(Optimizations::UNSAFE_UNFUSE_FMA));
        assert!(eff.contains(Optimizations::CONST_PROP));
    }

    #[test]
    fn unsafe_bits_kept_with_gate() {
        let cfg = Config {
            optimizations: Optimizations::UNSAFE_UNFUSE_FMA,
            unsafe_optimizations: true,
            ..Config::default()
        };
        assert!(cfg
            .effective_optimizations()
            .contains(Optimizations::UNSAFE_UNFUSE_FMA));
    }
}
