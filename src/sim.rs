//! Registers and DPRAM in host memory, for tests
//!
//! Status registers are plain memory here. The tests set and clear them to
//! play the role of the SIE. Interrupts land in `INTR`, and `INTS` follows the
//! hardware rule, `INTR & INTE`.

extern crate std;

use crate::{
    driver::{Driver, Events},
    handshake::Handshake,
    ral::{self, regs::Interrupts},
    Peripherals,
};
use std::boxed::Box;

pub const ARENA: u16 = ral::dpram::ARENA_OFFSET as u16;

pub struct Sim {
    pub regs: ral::regs::RegisterBlock,
    pub dpram: ral::dpram::Dpram,
}

impl Sim {
    pub fn buffer_control(&self, idx: usize) -> Handshake {
        Handshake::from_bits_retain(self.dpram.buffer_control(idx).BUFFER_CONTROL.read())
    }

    fn update_ints(&self) {
        self.regs
            .INTS
            .write(self.regs.INTR.read() & self.regs.INTE.read());
    }

    /// Assert raw interrupt sources
    pub fn raise(&self, interrupts: Interrupts) {
        self.regs
            .INTR
            .write(self.regs.INTR.read() | interrupts.bits());
        self.update_ints();
    }

    /// The masked status that would reach the NVIC
    pub fn ints(&self) -> Interrupts {
        self.update_ints();
        Interrupts::from_bits_retain(self.regs.INTS.read())
    }

    /// The host took the packet armed on IN endpoint `idx`
    pub fn complete_in(&self, idx: usize) {
        let bufctrl = self.dpram.buffer_control(idx).BUFFER_CONTROL;
        bufctrl.write(bufctrl.read() & !(Handshake::AVAILABLE | Handshake::FULL).bits());
        self.mark_buffer(idx);
    }

    /// The host sent `data` to the OUT endpoint `idx`, with its buffer at `offset`
    pub fn complete_out(&self, idx: usize, offset: u16, data: &[u8]) {
        for (dst, src) in self.dpram.bytes(offset as usize, data.len()).iter().zip(data) {
            dst.write(*src);
        }
        let bufctrl = self.dpram.buffer_control(idx).BUFFER_CONTROL;
        let word = bufctrl.read();
        bufctrl.write((word & Handshake::DATA1.bits()) | Handshake::FULL.bits() | data.len() as u32);
        self.mark_buffer(idx);
    }

    /// Flag `idx` in BUFF_STATUS without touching its buffer control word
    pub fn mark_buffer(&self, idx: usize) {
        self.regs
            .BUFF_STATUS
            .write(self.regs.BUFF_STATUS.read() | 1 << idx);
        self.raise(Interrupts::BUFF_STATUS);
    }

    pub fn setup(&self, packet: [u8; 8]) {
        for (dst, src) in self.dpram.bytes(0, 8).iter().zip(packet) {
            dst.write(src);
        }
        self.raise(Interrupts::SETUP_REQ);
    }

    /// Clear status, as if every write-to-clear took effect
    pub fn settle(&self) {
        self.regs.INTR.write(0);
        self.regs.INTS.write(0);
        self.regs.BUFF_STATUS.write(0);
        self.regs.SIE_STATUS.write(0);
    }
}

pub struct SimPeripherals(pub &'static Sim);

unsafe impl Peripherals for SimPeripherals {
    fn regs(&self) -> *const () {
        &self.0.regs as *const _ as _
    }
    fn dpram(&self) -> *const () {
        &self.0.dpram as *const _ as _
    }
}

/// A fresh simulation that lives for the rest of the test
pub fn sim() -> &'static Sim {
    Box::leak(Box::new(Sim {
        regs: ral::regs::RegisterBlock::new(),
        dpram: ral::dpram::Dpram::new(),
    }))
}

/// An initialized driver, and its simulated hardware
pub fn driver() -> (Driver, &'static Sim) {
    let sim = sim();
    let mut driver = Driver::new(SimPeripherals(sim));
    driver.initialize();
    (driver, sim)
}

/// Poll, then clear the status the driver acknowledged
pub fn poll(driver: &mut Driver, sim: &Sim) -> Events {
    let events = driver.poll();
    sim.settle();
    events
}
