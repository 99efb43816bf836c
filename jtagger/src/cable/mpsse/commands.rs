//! MPSSE opcode bytes, per FTDI AN108.
//!
//! The shift opcodes themselves are emitted by the template compiler; this
//! module covers the setup and GPIO commands the adapter issues directly.

/// Drive the low GPIO byte: `[SET_BITS_LOW, value, direction]`.
pub(crate) const SET_BITS_LOW: u8 = 0x80;
/// Read the low GPIO byte; one response byte.
pub(crate) const GET_BITS_LOW: u8 = 0x81;
/// Drive the high GPIO byte: `[SET_BITS_HIGH, value, direction]`.
pub(crate) const SET_BITS_HIGH: u8 = 0x82;
/// Read the high GPIO byte; one response byte.
pub(crate) const GET_BITS_HIGH: u8 = 0x83;

pub(crate) const LOOPBACK_ENABLE: u8 = 0x84;
pub(crate) const LOOPBACK_DISABLE: u8 = 0x85;

/// `[SET_DIVISOR, low, high]`; TCK = base / (divisor + 1).
pub(crate) const SET_DIVISOR: u8 = 0x86;

/// Flush the chip's response buffer back to the host immediately.
pub(crate) const SEND_IMMEDIATE: u8 = 0x87;

/// H-series parts: leave FT2232D compatibility mode (60 MHz base clock).
pub(crate) const DISABLE_CLK_DIVIDE_BY_5: u8 = 0x8A;
pub(crate) const ENABLE_CLK_DIVIDE_BY_5: u8 = 0x8B;

/// H-series parts: ordinary two-phase clocking.
pub(crate) const DISABLE_THREE_PHASE: u8 = 0x8D;

pub(crate) const ENABLE_ADAPTIVE_CLOCKING: u8 = 0x96;
pub(crate) const DISABLE_ADAPTIVE_CLOCKING: u8 = 0x97;

/// Deliberately invalid opcode used for synchronisation: the chip answers
/// `[BAD_COMMAND_ECHO, BOGUS_COMMAND]`.
pub(crate) const BOGUS_COMMAND: u8 = 0xAA;
pub(crate) const BAD_COMMAND_ECHO: u8 = 0xFA;
