//! USB bus implementation

use crate::{
    driver::{Driver, MAX_ENDPOINTS},
    endpoint,
};
use core::cell::RefCell;
use cortex_m::interrupt::{self, Mutex};
use usb_device::{
    bus::{PollResult, UsbBus},
    endpoint::{EndpointAddress, EndpointType},
    UsbDirection, UsbError,
};

fn ctrl_ep0_out() -> EndpointAddress {
    EndpointAddress::from_parts(0, UsbDirection::Out)
}

/// The driver, and the state that `usb-device` expects the bus to keep
struct Adapter {
    driver: Driver,
    /// Endpoint configurations, replayed after every bus reset
    configs: [Option<(EndpointType, u16)>; MAX_ENDPOINTS],
    /// A SETUP packet that `usb-device` hasn't read yet
    setup_pending: bool,
}

impl Adapter {
    fn new(driver: Driver) -> Self {
        Adapter {
            driver,
            configs: [None; MAX_ENDPOINTS],
            setup_pending: false,
        }
    }

    fn alloc_ep(
        &mut self,
        ep_dir: UsbDirection,
        ep_addr: Option<EndpointAddress>,
        ep_type: EndpointType,
        max_packet_size: u16,
    ) -> usb_device::Result<EndpointAddress> {
        let addr = match ep_addr {
            Some(addr) => match self.configs.get(endpoint::index(addr)) {
                Some(None) => addr,
                _ => return Err(UsbError::InvalidEndpoint),
            },
            None => (1..16)
                .map(|idx| EndpointAddress::from_parts(idx, ep_dir))
                .find(|addr| self.configs[endpoint::index(*addr)].is_none())
                .ok_or(UsbError::EndpointOverflow)?,
        };

        self.driver.ep_setup(addr, ep_type, max_packet_size, None)?;
        self.configs[endpoint::index(addr)] = Some((ep_type, max_packet_size));

        debug!(
            "ALLOC EP{} {:?} {:?} {}",
            addr.index(),
            addr.direction(),
            ep_type,
            max_packet_size
        );
        Ok(addr)
    }

    /// Release all endpoint memory, then configure every allocated endpoint again
    fn reset(&mut self) {
        self.driver.ep_reset();
        self.setup_pending = false;
        for (idx, config) in self.configs.iter().enumerate() {
            let Some((ep_type, max_packet_size)) = *config else {
                continue;
            };
            let addr = endpoint::address(idx);
            if let Err(_status) = self.driver.ep_setup(addr, ep_type, max_packet_size, None) {
                warn!(
                    "EP{} {:?} RESET STATUS {:?}",
                    addr.index(),
                    addr.direction(),
                    _status
                );
            }
        }
        debug!("RESET");
    }

    fn write(&mut self, ep_addr: EndpointAddress, buf: &[u8]) -> usb_device::Result<usize> {
        debug!(
            "EP{} {:?} WRITE {}",
            ep_addr.index(),
            ep_addr.direction(),
            buf.len()
        );

        let written = self.driver.ep_write_packet(ep_addr, buf).map_err(|status| {
            warn!(
                "EP{} {:?} STATUS {:?}",
                ep_addr.index(),
                ep_addr.direction(),
                status
            );
            status
        })?;

        // Might need an OUT for the status stage...
        if ep_addr.index() == 0 && !self.driver.is_armed(ctrl_ep0_out()) {
            self.driver.ep_read_packet(ctrl_ep0_out(), None, 0)?;
        }

        Ok(written)
    }

    fn read(&mut self, ep_addr: EndpointAddress, buf: &mut [u8]) -> usb_device::Result<usize> {
        debug!(
            "EP{} {:?} READ {}",
            ep_addr.index(),
            ep_addr.direction(),
            buf.len()
        );

        if ep_addr == ctrl_ep0_out() && self.setup_pending {
            if buf.len() < 8 {
                return Err(UsbError::BufferOverflow);
            }
            let setup = self.driver.setup_packet();
            buf[..8].copy_from_slice(&setup.to_bytes());
            self.setup_pending = false;

            if setup.has_out_data() {
                self.driver
                    .ep_read_packet(ep_addr, None, setup.length as usize)?;
            }
            return Ok(8);
        }

        let max_len = buf.len();
        self.driver
            .ep_read_packet(ep_addr, Some(buf), max_len)
            .map_err(|status| {
                if status != UsbError::WouldBlock {
                    warn!(
                        "EP{} {:?} STATUS {:?}",
                        ep_addr.index(),
                        ep_addr.direction(),
                        status
                    );
                }
                status
            })
    }

    /// Handle pending events, and report them the way `usb-device` expects
    ///
    /// A SETUP packet is reported on every poll until it's read.
    fn poll(&mut self) -> PollResult {
        let events = self.driver.poll();

        if events.reset {
            self.setup_pending = false;
            return PollResult::Reset;
        }
        if events.setup {
            self.setup_pending = true;
        }

        if self.setup_pending || events.in_complete != 0 || events.out_complete != 0 {
            PollResult::Data {
                ep_out: events.out_complete,
                ep_in_complete: events.in_complete,
                ep_setup: self.setup_pending as u16,
            }
        } else if events.resume {
            PollResult::Resume
        } else if events.suspend {
            PollResult::Suspend
        } else {
            PollResult::None
        }
    }
}

/// A `UsbBus` implementation
///
/// The `BusAdapter` wraps a [`Driver`], and exposes a `UsbBus` implementation.
///
/// # Requirements
///
/// The driver assumes that the USB controller is out of reset, and that the USB
/// clock is running at 48MHz. Configure the resets and clocks before creating
/// the adapter.
///
/// Interrupts are disabled when `new()` returns. If you're polling from the
/// USB interrupt handler, enable them with [`set_interrupts()`](BusAdapter::set_interrupts).
///
/// # Example
///
/// This example shows you how to create a `BusAdapter`, and build a simple USB device.
/// It skips the clock and reset configuration, and USB class allocation.
///
/// ```no_run
/// use rp2040_usbd::{BusAdapter, Peripherals};
///
/// struct Usb;
///
/// unsafe impl Peripherals for Usb {
///     fn regs(&self) -> *const () {
///         0x5011_0000 as *const ()
///     }
///     fn dpram(&self) -> *const () {
///         0x5010_0000 as *const ()
///     }
/// }
///
/// let bus_adapter = BusAdapter::new(Usb);
///
/// use usb_device::prelude::*;
/// let bus_allocator = usb_device::bus::UsbBusAllocator::new(bus_adapter);
/// let mut device = UsbDeviceBuilder::new(&bus_allocator, UsbVidPid(0x2e8a, 0x000a))
///     .max_packet_size_0(64)
///     .unwrap()
///     .build();
///
/// loop {
///     device.poll(&mut []);
/// }
/// ```
pub struct BusAdapter {
    usb: Mutex<RefCell<Adapter>>,
}

impl BusAdapter {
    /// Create a USB bus adapter
    ///
    /// When this function returns, the USB controller is initialized, but
    /// the device isn't visible to the host. `usb-device` connects it once
    /// the device is built.
    pub fn new<P: crate::Peripherals>(peripherals: P) -> Self {
        let mut driver = Driver::new(peripherals);
        driver.initialize();
        driver.set_interrupts(false);

        BusAdapter {
            usb: Mutex::new(RefCell::new(Adapter::new(driver))),
        }
    }

    /// Enable (`true`) or disable (`false`) interrupts for this USB peripheral
    ///
    /// `poll()` works either way.
    pub fn set_interrupts(&self, interrupts: bool) {
        self.with_usb_mut(|usb| usb.driver.set_interrupts(interrupts));
    }

    /// Interrupt-safe, immutable access to the USB driver
    fn with_usb<R>(&self, func: impl FnOnce(&Adapter) -> R) -> R {
        interrupt::free(|cs| {
            let usb = self.usb.borrow(cs);
            let usb = usb.borrow();
            func(&usb)
        })
    }

    /// Interrupt-safe, mutable access to the USB driver
    fn with_usb_mut<R>(&self, func: impl FnOnce(&mut Adapter) -> R) -> R {
        interrupt::free(|cs| {
            let usb = self.usb.borrow(cs);
            let mut usb = usb.borrow_mut();
            func(&mut usb)
        })
    }
}

impl UsbBus for BusAdapter {
    /// The address takes effect as soon as it's written, so `usb-device` must
    /// wait for the status stage before setting it.
    const QUIRK_SET_ADDRESS_BEFORE_STATUS: bool = false;

    fn alloc_ep(
        &mut self,
        ep_dir: UsbDirection,
        ep_addr: Option<EndpointAddress>,
        ep_type: EndpointType,
        max_packet_size: u16,
        _interval: u8,
    ) -> usb_device::Result<EndpointAddress> {
        self.with_usb_mut(|usb| usb.alloc_ep(ep_dir, ep_addr, ep_type, max_packet_size))
    }

    fn enable(&mut self) {
        self.with_usb_mut(|usb| usb.driver.disconnect(false));
    }

    fn reset(&self) {
        self.with_usb_mut(|usb| usb.reset());
    }

    fn set_device_address(&self, addr: u8) {
        self.with_usb_mut(|usb| usb.driver.set_address(addr));
    }

    fn write(&self, ep_addr: EndpointAddress, buf: &[u8]) -> usb_device::Result<usize> {
        self.with_usb_mut(|usb| usb.write(ep_addr, buf))
    }

    fn read(&self, ep_addr: EndpointAddress, buf: &mut [u8]) -> usb_device::Result<usize> {
        self.with_usb_mut(|usb| usb.read(ep_addr, buf))
    }

    fn set_stalled(&self, ep_addr: EndpointAddress, stalled: bool) {
        self.with_usb_mut(|usb| usb.driver.ep_stall_set(ep_addr, stalled));
    }

    fn is_stalled(&self, ep_addr: EndpointAddress) -> bool {
        self.with_usb(|usb| usb.driver.ep_stall_get(ep_addr))
    }

    fn suspend(&self) {
        // Nothing to do; the SIE stops on its own, and resumes when the host
        // drives the bus.
    }

    fn resume(&self) {}

    fn poll(&self) -> PollResult {
        self.with_usb_mut(|usb| usb.poll())
    }
}
