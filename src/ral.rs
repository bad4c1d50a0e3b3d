//! Register access for the USB controller and its dual-port RAM
//!
//! The register blocks match the RP2040 memory map bit-for-bit. Fields are
//! described with RAL-style modules, so the `ral-registers` macros work on
//! these blocks the same way they work on a generated RAL.
//!
//! Endpoint control and buffer control registers are arrays in hardware. The
//! RAL macros need a named field, so we hand out small accessor structs for a
//! single endpoint's register.

#![allow(non_snake_case, non_upper_case_globals)]

pub use ral_registers::{modify_reg, read_reg, write_reg};

use core::ops::Deref;

/// A pointer to a register block, owned by the driver
pub struct Instance<RB> {
    ptr: *const RB,
}

impl<RB> Instance<RB> {
    /// # Safety
    ///
    /// `ptr` must point to a valid register block for as long as the instance
    /// exists, and nothing else may access that block in the meantime.
    pub const unsafe fn new(ptr: *const RB) -> Self {
        Instance { ptr }
    }
}

impl<RB> Deref for Instance<RB> {
    type Target = RB;
    fn deref(&self) -> &RB {
        // Safety: valid for the lifetime of the instance, see new().
        unsafe { &*self.ptr }
    }
}

/// The register blocks required by the driver
pub struct Instances {
    pub regs: Instance<regs::RegisterBlock>,
    pub dpram: Instance<dpram::Dpram>,
}

/// Converts the user's peripherals into register block instances
pub fn instances<P: crate::Peripherals>(peripherals: P) -> Instances {
    // Safety: the Peripherals implementation guarantees that the addresses
    // are valid, and that it owns the memory behind them.
    unsafe {
        Instances {
            regs: Instance::new(peripherals.regs().cast()),
            dpram: Instance::new(peripherals.dpram().cast()),
        }
    }
}

macro_rules! field {
    ($name:ident, $offset:expr, $width:expr) => {
        #[allow(dead_code)]
        pub mod $name {
            pub const offset: u32 = $offset;
            pub const mask: u32 = ((1 << $width) - 1) << offset;
            pub mod R {}
            pub mod W {}
            pub mod RW {}
        }
    };
}

/// `USBCTRL_REGS`, the controller register block
pub mod regs {
    use crate::vcell::VCell;

    #[repr(C)]
    #[allow(dead_code)]
    pub struct RegisterBlock {
        pub ADDR_ENDP: VCell<u32>,
        /// Host-mode interrupt endpoint addresses
        _addr_endp_host: [VCell<u32>; 15],
        pub MAIN_CTRL: VCell<u32>,
        pub SOF_WR: VCell<u32>,
        pub SOF_RD: VCell<u32>,
        pub SIE_CTRL: VCell<u32>,
        pub SIE_STATUS: VCell<u32>,
        pub INT_EP_CTRL: VCell<u32>,
        pub BUFF_STATUS: VCell<u32>,
        pub BUFF_CPU_SHOULD_HANDLE: VCell<u32>,
        pub EP_ABORT: VCell<u32>,
        pub EP_ABORT_DONE: VCell<u32>,
        pub EP_STALL_ARM: VCell<u32>,
        pub NAK_POLL: VCell<u32>,
        pub EP_STATUS_STALL_NAK: VCell<u32>,
        pub USB_MUXING: VCell<u32>,
        pub USB_PWR: VCell<u32>,
        pub USBPHY_DIRECT: VCell<u32>,
        pub USBPHY_DIRECT_OVERRIDE: VCell<u32>,
        pub USBPHY_TRIM: VCell<u32>,
        _reserved: VCell<u32>,
        pub INTR: VCell<u32>,
        pub INTE: VCell<u32>,
        pub INTF: VCell<u32>,
        pub INTS: VCell<u32>,
    }

    #[cfg(test)]
    impl RegisterBlock {
        /// A register block with every register cleared
        pub const fn new() -> Self {
            const ZERO: VCell<u32> = VCell::new(0);
            RegisterBlock {
                ADDR_ENDP: ZERO,
                _addr_endp_host: [ZERO; 15],
                MAIN_CTRL: ZERO,
                SOF_WR: ZERO,
                SOF_RD: ZERO,
                SIE_CTRL: ZERO,
                SIE_STATUS: ZERO,
                INT_EP_CTRL: ZERO,
                BUFF_STATUS: ZERO,
                BUFF_CPU_SHOULD_HANDLE: ZERO,
                EP_ABORT: ZERO,
                EP_ABORT_DONE: ZERO,
                EP_STALL_ARM: ZERO,
                NAK_POLL: ZERO,
                EP_STATUS_STALL_NAK: ZERO,
                USB_MUXING: ZERO,
                USB_PWR: ZERO,
                USBPHY_DIRECT: ZERO,
                USBPHY_DIRECT_OVERRIDE: ZERO,
                USBPHY_TRIM: ZERO,
                _reserved: ZERO,
                INTR: ZERO,
                INTE: ZERO,
                INTF: ZERO,
                INTS: ZERO,
            }
        }
    }

    const _: [(); 1] = [(); (core::mem::size_of::<RegisterBlock>() == 0x9C) as usize];

    pub mod ADDR_ENDP {
        field!(ADDRESS, 0, 7);
    }

    pub mod MAIN_CTRL {
        field!(CONTROLLER_EN, 0, 1);
        field!(HOST_NDEVICE, 1, 1);
    }

    pub mod SOF_RD {
        field!(COUNT, 0, 11);
    }

    pub mod SIE_CTRL {
        field!(PULLUP_EN, 16, 1);
        field!(EP0_INT_1BUF, 29, 1);
    }

    /// Status bits are write-one-to-clear
    pub mod SIE_STATUS {
        field!(VBUS_DETECTED, 0, 1);
        field!(SUSPENDED, 4, 1);
        field!(RESUME, 11, 1);
        field!(CONNECTED, 16, 1);
        field!(SETUP_REC, 17, 1);
        field!(BUS_RESET, 19, 1);
    }

    pub mod EP_STALL_ARM {
        field!(EP0_IN, 0, 1);
        field!(EP0_OUT, 1, 1);
    }

    pub mod USB_MUXING {
        field!(TO_PHY, 0, 1);
        field!(SOFTCON, 3, 1);
    }

    pub mod USB_PWR {
        field!(VBUS_DETECT, 2, 1);
        field!(VBUS_DETECT_OVERRIDE_EN, 3, 1);
    }

    bitflags::bitflags! {
        /// Interrupt sources, shared by `INTR`, `INTE`, `INTF`, and `INTS`
        ///
        /// Only the device-mode sources are named.
        #[derive(Debug, Clone, Copy, PartialEq, Eq)]
        pub struct Interrupts: u32 {
            const BUFF_STATUS = 1 << 4;
            const BUS_RESET = 1 << 12;
            const DEV_CONN_DIS = 1 << 13;
            const DEV_SUSPEND = 1 << 14;
            const DEV_RESUME_FROM_HOST = 1 << 15;
            const SETUP_REQ = 1 << 16;
            const DEV_SOF = 1 << 17;
        }
    }
}

/// `USBCTRL_DPRAM`, the memory shared with the SIE
pub mod dpram {
    use crate::vcell::VCell;

    /// Total size of the DPRAM
    pub const SIZE: usize = 0x1000;
    /// Start of the EP0 buffer, shared by EP0 IN and EP0 OUT
    pub const EP0_BUFFER_OFFSET: usize = 0x100;
    /// Size of the EP0 buffer
    pub const EP0_BUFFER_LEN: usize = 64;
    /// Start of the memory available for non-zero endpoint buffers
    pub const ARENA_OFFSET: usize = 0x180;

    /// Endpoint buffers are reached through [`bytes()`](Dpram::bytes)
    #[repr(C)]
    #[allow(dead_code)]
    pub struct Dpram {
        setup_packet: [VCell<u8>; 8],
        /// EP1 IN, EP1 OUT, ..., EP15 OUT. EP0 has no control register.
        ep_control: [VCell<u32>; 30],
        /// EP0 IN, EP0 OUT, ..., EP15 OUT
        buffer_control: [VCell<u32>; 32],
        ep0_buffer: [VCell<u8>; EP0_BUFFER_LEN],
        /// Second EP0 buffer, only used when EP0 is double buffered
        _ep0_buffer_opt: [VCell<u8>; EP0_BUFFER_LEN],
        arena: [VCell<u8>; SIZE - ARENA_OFFSET],
    }

    const _: [(); 1] = [(); (core::mem::size_of::<Dpram>() == SIZE) as usize];

    /// A single endpoint control register
    pub struct EndpointControl<'a> {
        pub EP_CONTROL: &'a VCell<u32>,
    }

    /// A single buffer control register
    pub struct BufferControl<'a> {
        pub BUFFER_CONTROL: &'a VCell<u32>,
    }

    impl Dpram {
        /// DPRAM with every byte cleared
        #[cfg(test)]
        pub const fn new() -> Self {
            const BYTE: VCell<u8> = VCell::new(0);
            const WORD: VCell<u32> = VCell::new(0);
            Dpram {
                setup_packet: [BYTE; 8],
                ep_control: [WORD; 30],
                buffer_control: [WORD; 32],
                ep0_buffer: [BYTE; EP0_BUFFER_LEN],
                _ep0_buffer_opt: [BYTE; EP0_BUFFER_LEN],
                arena: [BYTE; SIZE - ARENA_OFFSET],
            }
        }

        /// Returns the endpoint control register for the endpoint at `index`
        ///
        /// `index` is `2 * number` for IN and `2 * number + 1` for OUT. Returns
        /// `None` for EP0, since it's always enabled.
        pub fn endpoint_control(&self, index: usize) -> Option<EndpointControl<'_>> {
            let register = self.ep_control.get(index.checked_sub(2)?)?;
            Some(EndpointControl {
                EP_CONTROL: register,
            })
        }

        /// Returns the buffer control register for the endpoint at `index`
        ///
        /// # Panics
        ///
        /// Panics if `index` is 32 or larger.
        pub fn buffer_control(&self, index: usize) -> BufferControl<'_> {
            BufferControl {
                BUFFER_CONTROL: &self.buffer_control[index],
            }
        }

        /// Copy out the last setup packet
        pub fn setup_packet(&self) -> [u8; 8] {
            let mut setup = [0; 8];
            for (dst, src) in setup.iter_mut().zip(self.setup_packet.iter()) {
                *dst = src.read();
            }
            setup
        }

        /// Returns `len` bytes of DPRAM, starting at `offset`
        ///
        /// # Panics
        ///
        /// Panics if the range exceeds the DPRAM.
        pub fn bytes(&self, offset: usize, len: usize) -> &[VCell<u8>] {
            // Safety: Dpram is repr(C) and made of nothing but VCells, and it's
            // exactly SIZE bytes large. Every byte may be viewed as a VCell<u8>.
            let all = unsafe { &*(self as *const Self).cast::<[VCell<u8>; SIZE]>() };
            &all[offset..offset + len]
        }
    }

    pub mod EP_CONTROL {
        field!(ENABLE, 31, 1);
        field!(DOUBLE_BUFFERED, 30, 1);
        field!(INTERRUPT_PER_BUFF, 29, 1);
        field!(ENDPOINT_TYPE, 26, 2);
        field!(BUFFER_ADDRESS, 0, 16);
    }

    /// Buffer 0 fields. Buffer 1 is only used in double-buffered mode.
    pub mod BUFFER_CONTROL {
        field!(FULL, 15, 1);
        field!(LAST, 14, 1);
        field!(DATA1, 13, 1);
        field!(STALL, 11, 1);
        field!(AVAILABLE, 10, 1);
        field!(LENGTH, 0, 10);
    }
}
