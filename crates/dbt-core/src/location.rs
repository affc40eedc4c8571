//! Guest program-location identity.
//!
//! A [`LocationDescriptor`] is the key the rest of the crate translates,
//! indexes, and invalidates by. It packs a guest PC together with the
//! ISA-mode bits that affect code generation so that two states which would
//! decode to different host code never collide in the block index.

use std::fmt;

/// 32-bit guest PC (AArch32 guest).
pub type GuestPc32 = u32;
/// 64-bit guest PC (AArch64 guest).
pub type GuestPc64 = u64;

/// Guest program counter, widened to the largest representation either guest
/// uses. Range arithmetic throughout the crate operates on this type so that
/// the Range Map and Block Translator don't need to be generic over guest
/// width.
pub type GuestPc = u64;

/// ISA-mode bits that participate in a [`LocationDescriptor`]'s identity.
///
/// These are exactly the bits listed in `spec.md` §3: Thumb vs ARM,
/// endianness, the FPCR/FPSCR subset that affects code generation, and the
/// single-step flag. Two descriptors differing only in `single_step`
/// translate to different blocks (`spec.md` §3).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub struct IsaMode {
    /// AArch32 Thumb vs ARM encoding; ignored for AArch64 guests.
    pub thumb: bool,
    /// Guest is configured big-endian for data accesses.
    pub big_endian: bool,
    /// The subset of FPCR/FPSCR that is baked into generated code (e.g.
    /// rounding mode, flush-to-zero). Opaque to this crate; the frontend
    /// defines what bits matter.
    pub fpcr_bits: u32,
    /// This location is to be single-stepped: translate exactly one guest
    /// instruction and terminate.
    pub single_step: bool,
}

/// Opaque 64-bit key uniquely identifying a translatable guest state.
///
/// Equality-comparable and hashable (`spec.md` §3). The encoding packs
/// [`IsaMode`] into the high bits and the guest PC into the low bits so that
/// `LocationDescriptor` remains a plain `Copy` value usable as a hash map key
/// without an auxiliary allocation.
#[derive(Clone, Copy, PartialEq, Eq, Hash)]
pub struct LocationDescriptor(u64, u64);

impl LocationDescriptor {
    /// Construct a descriptor for `pc` under the given `mode`.
    #[must_use]
    pub fn new(pc: GuestPc, mode: IsaMode) -> Self {
        let packed_mode = (u64::from(mode.thumb) << 63)
            | (u64::from(mode.big_endian) << 62)
            | (u64::from(mode.single_step) << 61)
            | u64::from(mode.fpcr_bits);
        LocationDescriptor(pc, packed_mode)
    }

    /// The guest program counter this descriptor points at.
    #[must_use]
    pub fn pc(&self) -> GuestPc {
        self.0
    }

    /// Whether this location single-steps (`spec.md` §3: "Two LDs that
    /// differ only in single-step flag translate to different blocks").
    #[must_use]
    pub fn is_single_step(&self) -> bool {
        self.1 & (1 << 61) != 0
    }

    /// Whether this location decodes as Thumb.
    #[must_use]
    pub fn is_thumb(&self) -> bool {
        self.1 & (1 << 63) != 0
    }

    /// Whether this location is big-endian.
    #[must_use]
    pub fn is_big_endian(&self) -> bool {
        self.1 & (1 << 62) != 0
    }

    /// A new descriptor at `pc` with this descriptor's mode bits, but with
    /// `single_step` cleared — used when the step-once epilogue falls
    /// through to ordinary dispatch of the successor.
    #[must_use]
    pub fn without_single_step(&self, pc: GuestPc) -> Self {
        LocationDescriptor(pc, self.1 & !(1 << 61))
    }

    /// Raw hash-friendly bit pattern, used by the fast-dispatch table.
    #[must_use]
    pub fn raw(&self) -> (u64, u64) {
        (self.0, self.1)
    }
}

impl fmt::Debug for LocationDescriptor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("LocationDescriptor")
            .field("pc", &format_args!("{:#x}", self.0))
            .field("thumb", &self.is_thumb())
            .field("big_endian", &self.is_big_endian())
            .field("single_step", &self.is_single_step())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn distinct_pc_distinct_descriptor() {
        let a = LocationDescriptor::new(0x1000, IsaMode::default());
        let b = LocationDescriptor::new(0x1004, IsaMode::default());
        assert_ne!(a, b);
    }

    #[test]
    fn single_step_distinguishes_descriptor() {
        let normal = LocationDescriptor::new(0x1000, IsaMode::default());
        let stepping = LocationDescriptor::new(
            0x1000,
            IsaMode {
                single_step: true,
                ..IsaMode::default()
            },
        );
        assert_ne!(normal, stepping);
        assert!(stepping.is_single_step());
        assert!(!normal.is_single_step());
    }

    #[test]
    fn same_inputs_same_descriptor() {
        let mode = IsaMode {
            thumb: true,
            big_endian: false,
            fpcr_bits: 0x42,
            single_step: false,
        };
        let a = LocationDescriptor::new(0x2000, mode);
        let b = LocationDescriptor::new(0x2000, mode);
        assert_eq!(a, b);
        assert_eq!(a.pc(), 0x2000);
        assert!(a.is_thumb());
    }

    #[test]
    fn without_single_step_clears_only_that_bit() {
        let stepping = LocationDescriptor::new(
            0x3000,
            IsaMode {
                thumb: true,
                single_step: true,
                ..IsaMode::default()
            },
        );
        let resumed = stepping.without_single_step(0x3004);
        assert!(!resumed.is_single_step());
        assert!(resumed.is_thumb());
        assert_eq!(resumed.pc(), 0x3004);
    }
}
