//! A USB device driver for the RP2040
//!
//! `rp2040-usbd` drives the RP2040's full-speed USB controller in device mode.
//! It offers two layers:
//!
//! - [`Driver`], a transfer engine that configures endpoints, moves packets
//!   through the controller's dual-port RAM, and dispatches hardware events
//!   to callbacks from [`Driver::poll()`].
//! - [`BusAdapter`], a [`usb-device`] USB bus implementation built on the
//!   driver.
//!
//! To interface the library, you must define a safe implementation of [`Peripherals`].
//! See the peripherals documentation for more information.
//!
//! # Debugging features
//!
//! Enable the `defmt-03` feature to activate internal logging using defmt
//! (version 0.3).
//!
//! [`usb-device`]: https://crates.io/crates/usb-device

#![no_std]

#[cfg(feature = "defmt-03")]
extern crate defmt_03 as defmt;

#[macro_use]
mod log;

mod buffer;
mod bus;
mod driver;
mod endpoint;
mod handshake;
mod ral;
mod setup;
#[cfg(test)]
mod sim;
mod vcell;

pub use bus::BusAdapter;
pub use driver::{BusCallback, Driver, Events, MAX_ENDPOINTS};
pub use endpoint::EndpointCallback;
pub use setup::SetupPacket;

/// A type that owns the USB register blocks
///
/// An implementation of `Peripherals` is expected to own
///
/// - the USB controller registers, `USBCTRL_REGS`
/// - the USB dual-port RAM, `USBCTRL_DPRAM`
///
/// # Safety
///
/// `Peripherals` should only be implemented on a type that
/// owns the register blocks required for all USB operation.
/// The pointers returned by the methods are assumed to be
/// valid, and will be cast to register definitions.
///
/// # Example
///
/// A safe implementation of `Peripherals`, using a singleton
/// to guarantee ownership.
///
/// ```no_run
/// use core::sync::atomic::{AtomicBool, Ordering};
/// use rp2040_usbd::Peripherals;
///
/// pub struct Usb(());
///
/// impl Usb {
///     /// Returns `None` if the instance is already taken
///     pub fn take() -> Option<Self> {
///         static TAKEN: AtomicBool = AtomicBool::new(false);
///         (!TAKEN.swap(true, Ordering::SeqCst)).then(|| Usb(()))
///     }
/// }
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
/// let usb = Usb::take().unwrap();
/// assert_eq!(usb.regs(), 0x5011_0000 as *const ());
/// ```
pub unsafe trait Peripherals {
    /// Returns the address of the USB controller registers
    fn regs(&self) -> *const ();
    /// Returns the address of the USB dual-port RAM
    fn dpram(&self) -> *const ();
}
