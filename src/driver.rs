//! USB transfer engine
//!
//! The `Driver` owns the controller registers, the DPRAM, and a record for
//! every endpoint direction. It's usable on its own, with callbacks invoked from
//! [`poll()`](Driver::poll), or through the `usb-device` [`BusAdapter`](crate::BusAdapter).

use crate::{
    buffer::{Allocator, Buffer},
    endpoint::{self, Endpoint, EndpointCallback},
    handshake,
    ral::{self, regs::Interrupts},
    setup::SetupPacket,
};
use usb_device::{
    endpoint::{EndpointAddress, EndpointType},
    UsbDirection, UsbError,
};

/// Sixteen endpoints, two directions
pub const MAX_ENDPOINTS: usize = 16 * 2;

/// Invoked for bus-level events
pub type BusCallback = fn(&mut Driver);

/// Events that `poll()` always handles. SOF is added when there's a SOF callback.
const DEFAULT_INTERRUPTS: Interrupts = Interrupts::BUFF_STATUS
    .union(Interrupts::BUS_RESET)
    .union(Interrupts::SETUP_REQ)
    .union(Interrupts::DEV_SUSPEND)
    .union(Interrupts::DEV_RESUME_FROM_HOST);

fn ctrl_ep0_out() -> EndpointAddress {
    EndpointAddress::from_parts(0, UsbDirection::Out)
}

fn ctrl_ep0_in() -> EndpointAddress {
    EndpointAddress::from_parts(0, UsbDirection::In)
}

/// What happened during one call to [`poll()`](Driver::poll)
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct Events {
    pub reset: bool,
    pub suspend: bool,
    pub resume: bool,
    pub setup: bool,
    pub sof: bool,
    /// Bit `n` is set if an EP`n` IN transaction completed
    pub in_complete: u16,
    /// Bit `n` is set if an EP`n` OUT transaction completed
    pub out_complete: u16,
}

/// A USB driver
///
/// After you create a `Driver` with [`new()`](Driver::new), you must call
/// [`initialize()`](Driver::initialize) once, then connect to the host with
/// [`disconnect(false)`](Driver::disconnect).
///
/// `poll()` is not reentrant. Callbacks receive the driver, and may use any
/// method except `poll()`.
pub struct Driver {
    regs: ral::Instance<ral::regs::RegisterBlock>,
    dpram: ral::Instance<ral::dpram::Dpram>,
    allocator: Allocator,
    /// Indexed by [`endpoint::index`]. `None` if the endpoint isn't configured.
    endpoints: [Option<Endpoint>; MAX_ENDPOINTS],
    setup: SetupPacket,
    address: u8,
    interrupts: bool,
    on_setup: Option<EndpointCallback>,
    on_suspend: Option<BusCallback>,
    on_resume: Option<BusCallback>,
    on_sof: Option<BusCallback>,
    polling: bool,
}

// Safety: the driver owns the register blocks. It's safe to move it into
// another execution context.
unsafe impl Send for Driver {}

impl Driver {
    /// Create a new `Driver`
    ///
    /// Creation does nothing except take ownership of the peripherals. After
    /// creating the driver, call [`initialize()`](Driver::initialize).
    pub fn new<P: crate::Peripherals>(peripherals: P) -> Self {
        let ral::Instances { regs, dpram } = ral::instances(peripherals);
        let mut endpoints: [Option<Endpoint>; MAX_ENDPOINTS] = core::array::from_fn(|_| None);
        endpoints[endpoint::index(ctrl_ep0_in())] = Some(Endpoint::control(UsbDirection::In));
        endpoints[endpoint::index(ctrl_ep0_out())] = Some(Endpoint::control(UsbDirection::Out));
        Driver {
            regs,
            dpram,
            allocator: Allocator::arena(),
            endpoints,
            setup: SetupPacket::default(),
            address: 0,
            interrupts: false,
            on_setup: None,
            on_suspend: None,
            on_resume: None,
            on_sof: None,
            polling: false,
        }
    }

    /// Initialize the USB controller in device mode
    ///
    /// Assumes that the USB controller is out of reset, and the USB clock is
    /// running at 48MHz. When this returns, USB interrupts are enabled but
    /// the device is still disconnected from the host.
    pub fn initialize(&mut self) {
        for byte in self.dpram.bytes(0, ral::dpram::SIZE) {
            byte.write(0);
        }

        ral::write_reg!(ral::regs, self.regs, USB_MUXING, TO_PHY: 1, SOFTCON: 1);
        // No VBUS sense pin; always act as if the host is there
        ral::write_reg!(ral::regs, self.regs, USB_PWR, VBUS_DETECT: 1, VBUS_DETECT_OVERRIDE_EN: 1);
        ral::write_reg!(ral::regs, self.regs, MAIN_CTRL, CONTROLLER_EN: 1, HOST_NDEVICE: 0);
        ral::write_reg!(ral::regs, self.regs, SIE_CTRL, EP0_INT_1BUF: 1);

        self.ep_reset();
        self.set_interrupts(true);
        debug!("INITIALIZED");
    }

    /// The interrupt sources that `poll()` handles
    fn event_sources(&self) -> Interrupts {
        if self.on_sof.is_some() {
            DEFAULT_INTERRUPTS | Interrupts::DEV_SOF
        } else {
            DEFAULT_INTERRUPTS
        }
    }

    fn enabled_interrupts(&self) -> Interrupts {
        if self.interrupts {
            self.event_sources()
        } else {
            Interrupts::empty()
        }
    }

    /// Enable (`true`) or disable (`false`) USB interrupts
    ///
    /// This only affects the interrupt line. `poll()` sees the same events
    /// either way.
    pub fn set_interrupts(&mut self, interrupts: bool) {
        self.interrupts = interrupts;
        ral::write_reg!(ral::regs, self.regs, INTE, self.enabled_interrupts().bits());
    }

    /// Connect (`false`) or disconnect (`true`) the device pull-up
    pub fn disconnect(&mut self, disconnected: bool) {
        ral::modify_reg!(ral::regs, self.regs, SIE_CTRL, PULLUP_EN: !disconnected as u32);
        debug!("PULLUP {}", !disconnected);
    }

    /// Set the device address
    ///
    /// Call this after the status stage of SET_ADDRESS.
    pub fn set_address(&mut self, address: u8) {
        ral::write_reg!(ral::regs, self.regs, ADDR_ENDP, ADDRESS: address as u32);
        self.address = address;
        debug!("ADDRESS {}", address);
    }

    pub fn address(&self) -> u8 {
        self.address
    }

    fn endpoint(&self, addr: EndpointAddress) -> Option<&Endpoint> {
        self.endpoints.get(endpoint::index(addr))?.as_ref()
    }

    /// Configure an endpoint
    ///
    /// Returns the DPRAM offset of the endpoint's buffer. Endpoint 0 always
    /// uses the fixed EP0 buffer, limited to 64 bytes; this call only records
    /// its callback and max packet length. OUT endpoints are immediately armed
    /// to receive a packet.
    ///
    /// Fails with `EndpointMemoryOverflow` if there isn't enough DPRAM for the
    /// endpoint, with `Unsupported` if `max_packet_len` doesn't fit in the
    /// buffer control word, and with `InvalidEndpoint` if the endpoint is
    /// already configured or doesn't exist. In every case, the endpoint's
    /// prior state is untouched.
    pub fn ep_setup(
        &mut self,
        addr: EndpointAddress,
        ep_type: EndpointType,
        max_packet_len: u16,
        callback: Option<EndpointCallback>,
    ) -> Result<u16, UsbError> {
        let idx = endpoint::index(addr);
        if idx >= MAX_ENDPOINTS {
            return Err(UsbError::InvalidEndpoint);
        }

        if addr.index() == 0 {
            let ep = Endpoint::new(
                addr,
                EndpointType::Control,
                max_packet_len.min(ral::dpram::EP0_BUFFER_LEN as u16),
                Buffer::EP0,
                callback,
            );
            let offset = ep.buffer().offset;
            self.endpoints[idx] = Some(ep);
            return Ok(offset);
        }

        if self.endpoints[idx].is_some() {
            return Err(UsbError::InvalidEndpoint);
        }
        if max_packet_len as usize > handshake::MAX_LENGTH {
            warn!(
                "EP{} {:?} MAX PACKET {} TOO LARGE",
                addr.index(),
                addr.direction(),
                max_packet_len
            );
            return Err(UsbError::Unsupported);
        }

        let Some(buffer) = self.allocator.allocate(max_packet_len as usize) else {
            warn!(
                "EP{} {:?} NO MEMORY FOR {}",
                addr.index(),
                addr.direction(),
                max_packet_len
            );
            return Err(UsbError::EndpointMemoryOverflow);
        };

        let mut ep = Endpoint::new(addr, ep_type, max_packet_len, buffer, callback);
        ep.configure(&self.dpram);
        if addr.direction() == UsbDirection::Out {
            ep.arm(&self.dpram, max_packet_len as usize);
        }
        self.endpoints[idx] = Some(ep);

        debug!(
            "EP{} {:?} SETUP {:?} {} AT {}",
            addr.index(),
            addr.direction(),
            ep_type,
            max_packet_len,
            buffer.offset
        );
        Ok(buffer.offset)
    }

    /// Disable every non-zero endpoint, and release all endpoint memory
    ///
    /// Endpoint 0 stays configured, but any armed EP0 transaction is dropped.
    pub fn ep_reset(&mut self) {
        for (idx, slot) in self.endpoints.iter_mut().enumerate() {
            if let Some(ep) = slot {
                ep.disable(&self.dpram);
                ep.set_nak(false);
            }
            // EP0 IN and EP0 OUT stay configured
            if idx >= 2 {
                *slot = None;
            }
        }
        self.allocator.reset();
        debug!("EP RESET");
    }

    /// Stall, or clear the stall on, an endpoint
    ///
    /// Unstalling an OUT endpoint re-arms it, unless it's holding data or
    /// it's NAKing. Does nothing if the endpoint isn't configured.
    pub fn ep_stall_set(&mut self, addr: EndpointAddress, stalled: bool) {
        let Some(ep) = self
            .endpoints
            .get_mut(endpoint::index(addr))
            .and_then(Option::as_mut)
        else {
            warn!("EP{} {:?} STALL UNCONFIGURED", addr.index(), addr.direction());
            return;
        };
        ep.set_stalled(&self.dpram, &self.regs, stalled);

        if !stalled
            && addr.index() != 0
            && addr.direction() == UsbDirection::Out
            && !ep.is_nak()
            && ep.received().is_none()
        {
            let max_packet_len = ep.max_packet_len();
            ep.arm(&self.dpram, max_packet_len);
        }
        debug!("EP{} {:?} STALL {}", addr.index(), addr.direction(), stalled);
    }

    /// Returns `true` if the endpoint is stalled
    ///
    /// Unconfigured endpoints are never stalled.
    pub fn ep_stall_get(&self, addr: EndpointAddress) -> bool {
        self.endpoint(addr)
            .map_or(false, |ep| ep.is_stalled(&self.dpram))
    }

    /// NAK (`true`) or accept (`false`) OUT traffic on an endpoint
    ///
    /// The hardware NAKs on its own whenever nothing is armed. A NAKing
    /// endpoint isn't re-armed after it's read. Clearing the NAK arms the
    /// endpoint if it's idle: a zero-length transaction on endpoint 0, for
    /// the status stage, or a max packet length transaction otherwise.
    pub fn ep_nak_set(&mut self, addr: EndpointAddress, nak: bool) {
        let Some(ep) = self
            .endpoints
            .get_mut(endpoint::index(addr))
            .and_then(Option::as_mut)
        else {
            return;
        };
        ep.set_nak(nak);

        if !nak
            && addr.direction() == UsbDirection::Out
            && ep.received().is_none()
            && !ep.is_armed(&self.dpram)
            && !ep.is_stalled(&self.dpram)
        {
            let len = if addr.index() == 0 {
                0
            } else {
                ep.max_packet_len()
            };
            ep.arm(&self.dpram, len);
        }
    }

    /// Write one packet to an IN endpoint, and hand it to the host
    ///
    /// Returns the number of bytes written, which is always `data.len()`.
    pub fn ep_write_packet(
        &mut self,
        addr: EndpointAddress,
        data: &[u8],
    ) -> Result<usize, UsbError> {
        if addr.direction() != UsbDirection::In {
            return Err(UsbError::InvalidEndpoint);
        }
        let ep = self
            .endpoints
            .get_mut(endpoint::index(addr))
            .and_then(Option::as_mut)
            .ok_or(UsbError::InvalidEndpoint)?;

        if data.len() > ep.max_packet_len() {
            return Err(UsbError::BufferOverflow);
        }
        if ep.is_armed(&self.dpram) || ep.is_stalled(&self.dpram) {
            return Err(UsbError::WouldBlock);
        }

        let written = ep.write(&self.dpram, data);
        ep.arm(&self.dpram, written);
        trace!("EP{} IN WRITE {}", addr.index(), written);
        Ok(written)
    }

    /// Read the last packet received on an OUT endpoint
    ///
    /// With a buffer, copies at most `max_len` bytes of the packet into
    /// `buffer`, and re-arms the endpoint unless it's NAKing. Returns
    /// `WouldBlock` if no packet has arrived. A short packet isn't an error;
    /// the return is the number of bytes copied.
    ///
    /// Without a buffer, discards any received packet, and arms the endpoint
    /// for up to `max_len` bytes if it's idle. Returns 0.
    pub fn ep_read_packet(
        &mut self,
        addr: EndpointAddress,
        buffer: Option<&mut [u8]>,
        max_len: usize,
    ) -> Result<usize, UsbError> {
        if addr.direction() != UsbDirection::Out {
            return Err(UsbError::InvalidEndpoint);
        }
        let ep = self
            .endpoints
            .get_mut(endpoint::index(addr))
            .and_then(Option::as_mut)
            .ok_or(UsbError::InvalidEndpoint)?;

        match buffer {
            Some(buffer) => {
                if ep.received().is_none() {
                    return Err(UsbError::WouldBlock);
                }
                let len = max_len.min(buffer.len());
                let read = ep.read(&self.dpram, &mut buffer[..len]);
                ep.clear_received();

                if !ep.is_nak() && !ep.is_stalled(&self.dpram) {
                    let max_packet_len = ep.max_packet_len();
                    ep.arm(&self.dpram, max_packet_len);
                }
                trace!("EP{} OUT READ {}", addr.index(), read);
                Ok(read)
            }
            None => {
                ep.clear_received();
                if !ep.is_armed(&self.dpram) && !ep.is_stalled(&self.dpram) {
                    ep.arm(&self.dpram, max_len);
                }
                Ok(0)
            }
        }
    }

    /// Register the callback for SETUP packets
    ///
    /// The callback receives the EP0 OUT address. Read the request with
    /// [`setup_packet()`](Driver::setup_packet).
    pub fn set_setup_callback(&mut self, callback: Option<EndpointCallback>) {
        self.on_setup = callback;
    }

    pub fn set_suspend_callback(&mut self, callback: Option<BusCallback>) {
        self.on_suspend = callback;
    }

    pub fn set_resume_callback(&mut self, callback: Option<BusCallback>) {
        self.on_resume = callback;
    }

    /// Register the start-of-frame callback
    ///
    /// SOF interrupts are only enabled while there's a callback.
    pub fn set_sof_callback(&mut self, callback: Option<BusCallback>) {
        self.on_sof = callback;
        ral::write_reg!(ral::regs, self.regs, INTE, self.enabled_interrupts().bits());
    }

    /// The last SETUP packet
    pub fn setup_packet(&self) -> SetupPacket {
        self.setup
    }

    /// The frame number from the last SOF
    pub fn frame_number(&self) -> u16 {
        let count = ral::read_reg!(ral::regs, self.regs, SOF_RD, COUNT);
        count as u16
    }

    /// Indicates if the endpoint is configured
    pub fn is_configured(&self, addr: EndpointAddress) -> bool {
        self.endpoint(addr).is_some()
    }

    /// Indicates if the hardware owns the endpoint's buffer
    pub fn is_armed(&self, addr: EndpointAddress) -> bool {
        self.endpoint(addr)
            .map_or(false, |ep| ep.is_armed(&self.dpram))
    }

    /// Returns the DPRAM offset of the endpoint's buffer
    pub fn buffer_offset(&self, addr: EndpointAddress) -> Option<u16> {
        self.endpoint(addr).map(|ep| ep.buffer().offset)
    }

    /// The offset of the next free DPRAM byte for endpoint buffers
    pub fn arena_cursor(&self) -> usize {
        self.allocator.cursor()
    }

    /// Handle all pending USB events
    ///
    /// Reads the interrupt status once, and handles each asserted event
    /// in order: suspend, resume, SETUP, bus reset, SOF, then completed
    /// buffers. Events that are asserted while `poll()` runs are handled
    /// by the next call.
    ///
    /// # Panics
    ///
    /// Calling `poll()` from a callback is a bug. It panics in debug builds,
    /// and does nothing in release builds.
    pub fn poll(&mut self) -> Events {
        debug_assert!(!self.polling, "poll() called from a USB callback");
        if self.polling {
            return Events::default();
        }

        self.polling = true;
        let events = self.dispatch();
        self.polling = false;
        events
    }

    fn dispatch(&mut self) -> Events {
        // INTS is masked by INTE. Use the raw status so that polling works
        // with interrupts disabled.
        let raw = Interrupts::from_bits_truncate(ral::read_reg!(ral::regs, self.regs, INTR));
        let status = raw & self.event_sources();
        let mut events = Events::default();

        if status.contains(Interrupts::DEV_SUSPEND) {
            events.suspend = true;
            if let Some(callback) = self.on_suspend {
                callback(self);
            }
            ral::write_reg!(ral::regs, self.regs, SIE_STATUS, SUSPENDED: 1);
            debug!("SUSPEND");
        }

        if status.contains(Interrupts::DEV_RESUME_FROM_HOST) {
            events.resume = true;
            if let Some(callback) = self.on_resume {
                callback(self);
            }
            ral::write_reg!(ral::regs, self.regs, SIE_STATUS, RESUME: 1);
            debug!("RESUME");
        }

        if status.contains(Interrupts::SETUP_REQ) {
            events.setup = true;
            self.setup_received();
            if let Some(callback) = self.on_setup {
                callback(self, ctrl_ep0_out());
            }
            ral::write_reg!(ral::regs, self.regs, SIE_STATUS, SETUP_REC: 1);
        }

        if status.contains(Interrupts::BUS_RESET) {
            events.reset = true;
            self.ep_reset();
            self.set_address(0);
            ral::write_reg!(ral::regs, self.regs, SIE_STATUS, BUS_RESET: 1);
            debug!("BUS RESET");
        }

        if status.contains(Interrupts::DEV_SOF) {
            events.sof = true;
            // Reading the frame number clears the interrupt
            let _frame = self.frame_number();
            if let Some(callback) = self.on_sof {
                callback(self);
            }
        }

        if status.contains(Interrupts::BUFF_STATUS) {
            let ready = ral::read_reg!(ral::regs, self.regs, BUFF_STATUS);
            trace!("BUFF_STATUS {}", ready);
            // A SETUP or a bus reset supersedes any EP0 transaction seen in
            // the same pass.
            let first = if events.setup || events.reset { 2 } else { 0 };
            for idx in first..MAX_ENDPOINTS {
                if ready & (1 << idx) != 0 {
                    self.buffer_complete(idx, &mut events);
                }
            }
            ral::write_reg!(ral::regs, self.regs, BUFF_STATUS, ready);
        }

        events
    }

    /// Reset EP0 for a new control transfer, and capture the SETUP packet
    fn setup_received(&mut self) {
        for addr in [ctrl_ep0_in(), ctrl_ep0_out()] {
            let idx = endpoint::index(addr);
            self.dpram.buffer_control(idx).BUFFER_CONTROL.write(0);
            if let Some(ep) = self.endpoints[idx].as_mut() {
                ep.set_data1(true);
                ep.clear_received();
            }
        }
        ral::write_reg!(ral::regs, self.regs, EP_STALL_ARM, 0);

        self.setup = SetupPacket::from_bytes(self.dpram.setup_packet());
        debug!(
            "SETUP {} {} {} {} {}",
            self.setup.request_type,
            self.setup.request,
            self.setup.value,
            self.setup.index,
            self.setup.length
        );
    }

    /// Handle a completed transaction on the endpoint at `idx`
    ///
    /// Completions for unconfigured endpoints are dropped.
    fn buffer_complete(&mut self, idx: usize, events: &mut Events) {
        let Some(ep) = self.endpoints[idx].as_mut() else {
            return;
        };
        let addr = ep.address();

        match addr.direction() {
            UsbDirection::In => {
                events.in_complete |= 1 << addr.index();
            }
            UsbDirection::Out => {
                // Re-armed before we saw the completion; nothing to read
                if ep.is_armed(&self.dpram) {
                    return;
                }
                ep.latch_received(&self.dpram);
                events.out_complete |= 1 << addr.index();
            }
        }
        trace!("EP{} {:?} COMPLETE", addr.index(), addr.direction());

        if let Some(callback) = ep.callback() {
            callback(self, addr);
        }
    }
}
