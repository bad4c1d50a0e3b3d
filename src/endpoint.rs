use crate::{buffer::Buffer, driver::Driver, handshake::Handshake, ral};
use usb_device::{
    endpoint::{EndpointAddress, EndpointType},
    UsbDirection,
};

/// Invoked when a transaction completes on an endpoint
pub type EndpointCallback = fn(&mut Driver, EndpointAddress);

/// Position of an endpoint in the buffer control and buffer status layouts
///
/// IN endpoints are even, OUT endpoints are odd.
pub fn index(address: EndpointAddress) -> usize {
    2 * address.index() + (address.direction() == UsbDirection::Out) as usize
}

/// The endpoint address for an [`index`]
pub fn address(index: usize) -> EndpointAddress {
    let direction = if index % 2 == 1 {
        UsbDirection::Out
    } else {
        UsbDirection::In
    };
    EndpointAddress::from_parts(index / 2, direction)
}

#[derive(Clone, Copy, PartialEq, Eq)]
#[repr(u32)]
enum Kind {
    Control = 0,
    Isochronous = 1,
    Bulk = 2,
    Interrupt = 3,
}

impl From<EndpointType> for Kind {
    fn from(ep_type: EndpointType) -> Self {
        match ep_type {
            EndpointType::Control => Kind::Control,
            EndpointType::Isochronous { .. } => Kind::Isochronous,
            EndpointType::Bulk => Kind::Bulk,
            EndpointType::Interrupt => Kind::Interrupt,
        }
    }
}

/// Wait for the buffer control word to settle before handing it to the SIE
///
/// The SIE runs on the 48 MHz USB clock, which may be slower than the CPU.
#[inline(always)]
fn settle() {
    #[cfg(target_arch = "arm")]
    cortex_m::asm::delay(12);
}

/// A USB endpoint
///
/// One record describes one direction of one endpoint number.
pub struct Endpoint {
    address: EndpointAddress,
    kind: Kind,
    max_packet_len: u16,
    buffer: Buffer,
    /// Toggle for the next armed transaction
    data1: bool,
    /// Length of a completed OUT transaction that hasn't been read
    received: Option<usize>,
    nak: bool,
    callback: Option<EndpointCallback>,
}

impl Endpoint {
    pub fn new(
        address: EndpointAddress,
        ep_type: EndpointType,
        max_packet_len: u16,
        buffer: Buffer,
        callback: Option<EndpointCallback>,
    ) -> Self {
        Endpoint {
            address,
            kind: ep_type.into(),
            max_packet_len,
            buffer,
            data1: false,
            received: None,
            nak: false,
            callback,
        }
    }

    /// The endpoint 0 record for `direction`, using the fixed EP0 buffer
    pub fn control(direction: UsbDirection) -> Self {
        Self::new(
            EndpointAddress::from_parts(0, direction),
            EndpointType::Control,
            Buffer::EP0.len,
            Buffer::EP0,
            None,
        )
    }

    pub fn address(&self) -> EndpointAddress {
        self.address
    }

    fn index(&self) -> usize {
        index(self.address)
    }

    /// Returns the maximum packet length supported by this endpoint
    pub fn max_packet_len(&self) -> usize {
        self.max_packet_len as usize
    }

    pub fn buffer(&self) -> Buffer {
        self.buffer
    }

    pub fn callback(&self) -> Option<EndpointCallback> {
        self.callback
    }

    /// Set the toggle for the next armed transaction
    pub fn set_data1(&mut self, data1: bool) {
        self.data1 = data1;
    }

    pub fn is_nak(&self) -> bool {
        self.nak
    }

    pub fn set_nak(&mut self, nak: bool) {
        self.nak = nak;
    }

    /// Enable the endpoint, pointing the SIE at its buffer
    ///
    /// Endpoint 0 has no control register. It's always enabled.
    pub fn configure(&mut self, dpram: &ral::dpram::Dpram) {
        dpram.buffer_control(self.index()).BUFFER_CONTROL.write(0);
        if let Some(epctrl) = dpram.endpoint_control(self.index()) {
            ral::write_reg!(
                ral::dpram,
                &epctrl,
                EP_CONTROL,
                ENABLE: 1,
                INTERRUPT_PER_BUFF: 1,
                ENDPOINT_TYPE: self.kind as u32,
                BUFFER_ADDRESS: self.buffer.offset as u32
            );
        }
    }

    /// Disable the endpoint, and drop any armed transaction
    pub fn disable(&mut self, dpram: &ral::dpram::Dpram) {
        if let Some(epctrl) = dpram.endpoint_control(self.index()) {
            epctrl.EP_CONTROL.write(0);
        }
        dpram.buffer_control(self.index()).BUFFER_CONTROL.write(0);
        self.received = None;
        self.data1 = false;
    }

    /// Hand the buffer to the SIE for one transaction of `len` bytes
    ///
    /// Caller should make sure that the endpoint isn't already armed. For IN,
    /// the data must already be in the buffer.
    pub fn arm(&mut self, dpram: &ral::dpram::Dpram, len: usize) {
        let len = len.min(self.max_packet_len());
        let word = Handshake::transaction(self.address.direction(), len, self.data1);
        let bufctrl = dpram.buffer_control(self.index());

        bufctrl
            .BUFFER_CONTROL
            .write(word.difference(Handshake::AVAILABLE).bits());
        settle();
        bufctrl.BUFFER_CONTROL.write(word.bits());

        self.data1 = !self.data1;
        trace!(
            "ARM {:?} LEN={} DATA1={}",
            self.address,
            len,
            word.contains(Handshake::DATA1)
        );
    }

    /// Indicates if the SIE owns the buffer
    pub fn is_armed(&self, dpram: &ral::dpram::Dpram) -> bool {
        let bufctrl = dpram.buffer_control(self.index());
        ral::read_reg!(ral::dpram, &bufctrl, BUFFER_CONTROL, AVAILABLE == 1)
    }

    /// Record the length of a completed OUT transaction
    ///
    /// The data stays in the buffer until it's read.
    pub fn latch_received(&mut self, dpram: &ral::dpram::Dpram) {
        let bufctrl = dpram.buffer_control(self.index());
        let word = Handshake::from_bits_retain(bufctrl.BUFFER_CONTROL.read());
        self.received = Some(word.length());
    }

    /// Length of the completed OUT transaction, if any
    pub fn received(&self) -> Option<usize> {
        self.received
    }

    /// Forget the completed OUT transaction
    pub fn clear_received(&mut self) {
        self.received = None;
    }

    /// Read data from the endpoint into `buffer`
    ///
    /// Returns the number of bytes read into `buffer`, which is constrained by the
    /// max packet length, and the number of bytes received in the last transaction.
    pub fn read(&mut self, dpram: &ral::dpram::Dpram, buffer: &mut [u8]) -> usize {
        let size = self
            .received
            .unwrap_or(0)
            .min(self.max_packet_len())
            .min(buffer.len());
        let src = dpram.bytes(self.buffer.offset as usize, size);
        for (dst, src) in buffer.iter_mut().zip(src) {
            *dst = src.read();
        }
        size
    }

    /// Write `buffer` to the endpoint buffer
    ///
    /// Returns the number of bytes written from `buffer`, which is constrained
    /// by the max packet length.
    pub fn write(&mut self, dpram: &ral::dpram::Dpram, buffer: &[u8]) -> usize {
        let size = self.max_packet_len().min(buffer.len());
        let dst = dpram.bytes(self.buffer.offset as usize, size);
        for (dst, src) in dst.iter().zip(buffer) {
            dst.write(*src);
        }
        size
    }

    /// Stall, or clear a stall
    ///
    /// Stalling drops an armed transaction. Clearing the stall restarts the
    /// data toggle at DATA0.
    pub fn set_stalled(
        &mut self,
        dpram: &ral::dpram::Dpram,
        regs: &ral::regs::RegisterBlock,
        stall: bool,
    ) {
        let bufctrl = dpram.buffer_control(self.index());
        let is_ep0 = self.address.index() == 0;

        if stall {
            if is_ep0 {
                match self.address.direction() {
                    UsbDirection::In => ral::modify_reg!(ral::regs, regs, EP_STALL_ARM, EP0_IN: 1),
                    UsbDirection::Out => ral::modify_reg!(ral::regs, regs, EP_STALL_ARM, EP0_OUT: 1),
                }
            }
            bufctrl.BUFFER_CONTROL.write(Handshake::STALL.bits());
        } else {
            if is_ep0 {
                match self.address.direction() {
                    UsbDirection::In => ral::modify_reg!(ral::regs, regs, EP_STALL_ARM, EP0_IN: 0),
                    UsbDirection::Out => ral::modify_reg!(ral::regs, regs, EP_STALL_ARM, EP0_OUT: 0),
                }
            }
            ral::modify_reg!(ral::dpram, &bufctrl, BUFFER_CONTROL, STALL: 0);
            self.data1 = false;
        }
    }

    pub fn is_stalled(&self, dpram: &ral::dpram::Dpram) -> bool {
        let bufctrl = dpram.buffer_control(self.index());
        ral::read_reg!(ral::dpram, &bufctrl, BUFFER_CONTROL, STALL == 1)
    }
}
