//! The buffer control word
//!
//! Every endpoint direction has one buffer control word in DPRAM. Firmware
//! writes it to hand a buffer to the SIE, and the SIE writes it back when the
//! transaction completes. Only buffer 0 is used; the upper half of the word
//! belongs to the second buffer of a double-buffered endpoint.

use usb_device::UsbDirection;

/// The largest transaction length that fits in a buffer control word
pub const MAX_LENGTH: usize = 0x3FF;

const LENGTH_MASK: u32 = MAX_LENGTH as u32;

bitflags::bitflags! {
    /// Buffer 0 bits of a buffer control word
    ///
    /// The low ten bits hold the transaction length. They are not named
    /// flags; use [`length()`](Handshake::length) to read them.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct Handshake: u32 {
        /// The buffer holds data. Set by firmware for IN, by the SIE for OUT.
        const FULL = 1 << 15;
        /// Last buffer of the transfer
        const LAST = 1 << 14;
        /// Use the DATA1 PID
        const DATA1 = 1 << 13;
        /// Reset the buffer selector to buffer 0
        const RESET = 1 << 12;
        /// Respond to the next token with a STALL
        const STALL = 1 << 11;
        /// The SIE owns the buffer
        const AVAILABLE = 1 << 10;
    }
}

impl Handshake {
    /// Build the word that arms one transaction of `len` bytes
    ///
    /// The returned word includes `AVAILABLE`. `len` is truncated to ten bits;
    /// callers limit it to the endpoint's max packet length.
    pub fn transaction(direction: UsbDirection, len: usize, data1: bool) -> Self {
        let mut word = Handshake::from_bits_retain(len as u32 & LENGTH_MASK);
        if data1 {
            word |= Handshake::DATA1;
        }
        if direction == UsbDirection::In {
            word |= Handshake::FULL;
        }
        word | Handshake::AVAILABLE
    }

    /// The transaction length
    ///
    /// After an OUT transaction completes, this is the number of bytes the
    /// SIE received.
    pub fn length(self) -> usize {
        (self.bits() & LENGTH_MASK) as usize
    }
}
