//! # Local APIC registers (xAPIC, memory mapped)
//!
//! The kernel talks to the local APIC through its MMIO window. Offsets are
//! relative to the APIC base (`0xFEE0_0000` by default).

use bitfield_struct::bitfield;

/// Local APIC ID register offset.
pub const LAPIC_ID: usize = 0x020;
/// End-Of-Interrupt register offset.
pub const LAPIC_EOI: usize = 0x0B0;
/// Spurious interrupt vector register offset.
pub const LAPIC_SVR: usize = 0x0F0;
/// Interrupt Command Register, low dword.
pub const LAPIC_ICR_LOW: usize = 0x300;
/// Interrupt Command Register, high dword.
pub const LAPIC_ICR_HIGH: usize = 0x310;

/// Local APIC ID register.
#[bitfield(u32)]
pub struct LapicId {
    #[bits(24)]
    __: u32,
    /// Bits 24–31: the APIC ID of this core.
    pub id: u8,
}

/// Destination shorthand of an IPI (ICR bits 18–19).
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
#[repr(u8)]
pub enum DestinationShorthand {
    /// Use the destination field of [`IcrHigh`].
    None = 0b00,
    /// Deliver to the issuing core only.
    SelfOnly = 0b01,
    /// Deliver to every core, including the issuer.
    AllIncludingSelf = 0b10,
    /// Deliver to every core but the issuer.
    AllExcludingSelf = 0b11,
}

impl DestinationShorthand {
    const fn into_bits(self) -> u8 {
        self as u8
    }

    const fn from_bits(value: u8) -> Self {
        match value & 0b11 {
            0b00 => Self::None,
            0b01 => Self::SelfOnly,
            0b10 => Self::AllIncludingSelf,
            _ => Self::AllExcludingSelf,
        }
    }
}

/// Interrupt Command Register, low dword.
///
/// Writing this half sends the IPI.
#[bitfield(u32)]
pub struct IcrLow {
    /// Bits 0–7: interrupt vector.
    pub vector: u8,

    /// Bits 8–10: delivery mode; `0b000` is fixed delivery.
    #[bits(3)]
    pub delivery_mode: u8,

    /// Bit 11: logical (`true`) or physical (`false`) destination mode.
    pub logical_destination: bool,

    /// Bit 12: set while the previous IPI is still being sent.
    #[bits(1, access = RO)]
    pub delivery_pending: bool,

    #[bits(1)]
    __: u8,

    /// Bit 14: level; must be 1 for everything except INIT de-assert.
    pub assert: bool,

    /// Bit 15: level-triggered (`true`) or edge-triggered.
    pub level_triggered: bool,

    #[bits(2)]
    __: u8,

    /// Bits 18–19: destination shorthand.
    #[bits(2)]
    pub shorthand: DestinationShorthand,

    #[bits(12)]
    __: u16,
}

/// Interrupt Command Register, high dword.
#[bitfield(u32)]
pub struct IcrHigh {
    #[bits(24)]
    __: u32,
    /// Bits 24–31: destination APIC ID (physical mode).
    pub destination: u8,
}

impl IcrLow {
    /// A fixed, edge-triggered, asserted IPI for `vector`.
    #[must_use]
    pub const fn fixed(vector: u8, shorthand: DestinationShorthand) -> Self {
        Self::new()
            .with_vector(vector)
            .with_assert(true)
            .with_shorthand(shorthand)
    }
}
