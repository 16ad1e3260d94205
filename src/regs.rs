// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! UDPHS register map and the seam through which we touch it.
//!
//! Offsets and bit positions are from the SAMA5D3 datasheet, chapter "USB
//! High Speed Device Port". Only the parts the driver uses are named.

/// Access to the controller's register file and FIFO window.
///
/// Implementations use interior mutability (it's MMIO, after all), so
/// everything takes `&self`.
pub trait Registers {
    /// Reads the 32-bit register at byte `offset` from the register base.
    fn read(&self, offset: usize) -> u32;
    /// Writes the 32-bit register at byte `offset` from the register base.
    fn write(&self, offset: usize, value: u32);
    /// Copies `data` into endpoint `epno`'s FIFO window.
    fn fifo_write(&self, epno: usize, data: &[u8]);
    /// Fills `data` from endpoint `epno`'s FIFO window.
    fn fifo_read(&self, epno: usize, data: &mut [u8]);
}

/// Volatile access to a real UDPHS.
#[derive(Debug)]
pub struct Mmio {
    base: usize,
    fifo_base: usize,
}

impl Mmio {
    /// Size of each endpoint's slice of the FIFO window.
    const FIFO_STRIDE: usize = 0x1_0000;

    /// # Safety
    ///
    /// `base` must be the virtual address of the UDPHS register file and
    /// `fifo_base` the virtual address of its FIFO window, both mapped
    /// device memory for as long as the returned value exists, and nothing
    /// else may be driving the controller.
    pub unsafe fn new(base: usize, fifo_base: usize) -> Self {
        Self { base, fifo_base }
    }

    fn fifo(&self, epno: usize) -> *mut u8 {
        (self.fifo_base + epno * Self::FIFO_STRIDE) as *mut u8
    }
}

impl Registers for Mmio {
    fn read(&self, offset: usize) -> u32 {
        // Safety: the constructor's contract makes every offset in this
        // module a valid, aligned register.
        unsafe { core::ptr::read_volatile((self.base + offset) as *const u32) }
    }

    fn write(&self, offset: usize, value: u32) {
        // Safety: see `read`.
        unsafe { core::ptr::write_volatile((self.base + offset) as *mut u32, value) }
    }

    fn fifo_write(&self, epno: usize, data: &[u8]) {
        // The FIFO window is byte addressable and auto-increments on the
        // hardware side; every byte goes to the start of the window.
        let fifo = self.fifo(epno);
        for (i, &b) in data.iter().enumerate() {
            // Safety: endpoint windows are FIFO_STRIDE bytes, larger than any
            // packet we write.
            unsafe { core::ptr::write_volatile(fifo.add(i), b) }
        }
    }

    fn fifo_read(&self, epno: usize, data: &mut [u8]) {
        let fifo = self.fifo(epno) as *const u8;
        for (i, b) in data.iter_mut().enumerate() {
            // Safety: see `fifo_write`.
            *b = unsafe { core::ptr::read_volatile(fifo.add(i)) };
        }
    }
}

////////////////////////////////////////////////////////////////////////////
// Global registers.

pub const CTRL: usize = 0x00;
pub const FNUM: usize = 0x04;
pub const IEN: usize = 0x10;
pub const INTSTA: usize = 0x14;
pub const CLRINT: usize = 0x18;
pub const EPTRST: usize = 0x1c;
pub const TST: usize = 0xe0;

pub const CTRL_DEVADDR_MASK: u32 = 0x7f;
pub const CTRL_FADDREN: u32 = 1 << 7;
pub const CTRL_ENUDPHS: u32 = 1 << 8;
pub const CTRL_DETACH: u32 = 1 << 9;
pub const CTRL_REWAKEUP: u32 = 1 << 10;
pub const CTRL_PULLDDIS: u32 = 1 << 11;

pub const FNUM_FRAMENUM_SHIFT: u32 = 3;
pub const FNUM_FRAMENUM_MASK: u32 = 0x7ff << FNUM_FRAMENUM_SHIFT;

/// INTSTA only: set when the bus came up at high speed.
pub const INTSTA_SPEED: u32 = 1 << 0;

// Bits shared by IEN, INTSTA and CLRINT.
pub const INT_DETSUSPD: u32 = 1 << 1;
pub const INT_MICROSOF: u32 = 1 << 2;
pub const INT_SOF: u32 = 1 << 3;
pub const INT_ENDRESET: u32 = 1 << 4;
pub const INT_WAKEUP: u32 = 1 << 5;
pub const INT_ENDOFRSM: u32 = 1 << 6;
pub const INT_UPSTRRES: u32 = 1 << 7;

/// Everything CLRINT can clear.
pub const INT_CLEARABLE: u32 = INT_DETSUSPD
    | INT_MICROSOF
    | INT_SOF
    | INT_ENDRESET
    | INT_WAKEUP
    | INT_ENDOFRSM
    | INT_UPSTRRES;

pub const fn int_ept(epno: usize) -> u32 {
    1 << (8 + epno)
}

/// DMA channels are numbered from 1, matching the endpoint they serve.
pub const fn int_dma(ch: usize) -> u32 {
    1 << (24 + ch)
}

////////////////////////////////////////////////////////////////////////////
// Per-endpoint registers, 0x20 bytes apart starting at 0x100.

const fn ept(epno: usize, reg: usize) -> usize {
    0x100 + 0x20 * epno + reg
}

pub const fn eptcfg(epno: usize) -> usize {
    ept(epno, 0x00)
}
pub const fn eptctlenb(epno: usize) -> usize {
    ept(epno, 0x04)
}
pub const fn eptctldis(epno: usize) -> usize {
    ept(epno, 0x08)
}
pub const fn eptctl(epno: usize) -> usize {
    ept(epno, 0x0c)
}
pub const fn eptsetsta(epno: usize) -> usize {
    ept(epno, 0x14)
}
pub const fn eptclrsta(epno: usize) -> usize {
    ept(epno, 0x18)
}
pub const fn eptsta(epno: usize) -> usize {
    ept(epno, 0x1c)
}

pub const EPTCFG_SIZE_SHIFT: u32 = 0;
pub const EPTCFG_DIR_IN: u32 = 1 << 3;
pub const EPTCFG_TYPE_SHIFT: u32 = 4;
pub const EPTCFG_BK_SHIFT: u32 = 6;
pub const EPTCFG_NBTRANS_SHIFT: u32 = 8;
pub const EPTCFG_MAPD: u32 = 1 << 31;

// EPTCTLENB/EPTCTLDIS/EPTCTL. Most of these are interrupt enables.
pub const EPTCTL_EPTENABL: u32 = 1 << 0;
pub const EPTCTL_AUTOVALID: u32 = 1 << 1;
pub const EPTCTL_INTDISDMA: u32 = 1 << 3;
pub const EPTCTL_NYETDIS: u32 = 1 << 4;
pub const EPTCTL_DATAXRX: u32 = 1 << 6;
pub const EPTCTL_MDATARX: u32 = 1 << 7;
pub const EPTCTL_ERROVFLW: u32 = 1 << 8;
pub const EPTCTL_RXRDYTXKL: u32 = 1 << 9;
pub const EPTCTL_TXCOMPLT: u32 = 1 << 10;
pub const EPTCTL_TXRDY: u32 = 1 << 11;
pub const EPTCTL_RXSETUP: u32 = 1 << 12;
pub const EPTCTL_STALLSNT: u32 = 1 << 13;
pub const EPTCTL_NAKIN: u32 = 1 << 14;
pub const EPTCTL_NAKOUT: u32 = 1 << 15;
pub const EPTCTL_BUSYBANK: u32 = 1 << 18;
pub const EPTCTL_SHRTPCKT: u32 = 1 << 31;

pub const EPTCTL_ALL: u32 = EPTCTL_EPTENABL
    | EPTCTL_AUTOVALID
    | EPTCTL_INTDISDMA
    | EPTCTL_NYETDIS
    | EPTCTL_DATAXRX
    | EPTCTL_MDATARX
    | EPTCTL_ERROVFLW
    | EPTCTL_RXRDYTXKL
    | EPTCTL_TXCOMPLT
    | EPTCTL_TXRDY
    | EPTCTL_RXSETUP
    | EPTCTL_STALLSNT
    | EPTCTL_NAKIN
    | EPTCTL_NAKOUT
    | EPTCTL_BUSYBANK
    | EPTCTL_SHRTPCKT;

// EPTSETSTA/EPTCLRSTA/EPTSTA.
pub const EPTSTA_FRCESTALL: u32 = 1 << 5;
pub const EPTSTA_TOGGLESQ: u32 = 1 << 6;
pub const EPTSTA_RXRDYTXKL: u32 = 1 << 9;
pub const EPTSTA_TXCOMPLT: u32 = 1 << 10;
pub const EPTSTA_TXRDY: u32 = 1 << 11;
pub const EPTSTA_RXSETUP: u32 = 1 << 12;
pub const EPTSTA_STALLSNT: u32 = 1 << 13;
pub const EPTSTA_BYTECNT_SHIFT: u32 = 20;
pub const EPTSTA_BYTECNT_MASK: u32 = 0x7ff << EPTSTA_BYTECNT_SHIFT;

pub const fn eptsta_bytecnt(sta: u32) -> usize {
    ((sta & EPTSTA_BYTECNT_MASK) >> EPTSTA_BYTECNT_SHIFT) as usize
}

////////////////////////////////////////////////////////////////////////////
// DMA channel registers, 0x10 bytes apart starting at 0x300. Channel 0 has
// no hardware behind it.

const fn dma(ch: usize, reg: usize) -> usize {
    0x300 + 0x10 * ch + reg
}

pub const fn dmanxtdsc(ch: usize) -> usize {
    dma(ch, 0x0)
}
pub const fn dmaaddress(ch: usize) -> usize {
    dma(ch, 0x4)
}
pub const fn dmacontrol(ch: usize) -> usize {
    dma(ch, 0x8)
}
pub const fn dmastatus(ch: usize) -> usize {
    dma(ch, 0xc)
}

pub const DMACONTROL_CHANNENB: u32 = 1 << 0;
pub const DMACONTROL_ENDTREN: u32 = 1 << 2;
pub const DMACONTROL_ENDBEN: u32 = 1 << 3;
pub const DMACONTROL_ENDTRIT: u32 = 1 << 4;
pub const DMACONTROL_ENDBUFFIT: u32 = 1 << 5;
pub const DMACONTROL_BUFLEN_SHIFT: u32 = 16;

/// A zero length field means 64KiB to the hardware, which is what the
/// truncation here produces for a full-size slice.
pub const fn dmacontrol_buflen(len: usize) -> u32 {
    ((len as u32) & 0xffff) << DMACONTROL_BUFLEN_SHIFT
}

pub const DMASTATUS_CHANNENB: u32 = 1 << 0;
pub const DMASTATUS_CHANNACT: u32 = 1 << 1;
pub const DMASTATUS_ENDTRST: u32 = 1 << 4;
pub const DMASTATUS_ENDBFST: u32 = 1 << 5;
pub const DMASTATUS_BUFCNT_SHIFT: u32 = 16;

pub const fn dmastatus_bufcnt(status: u32) -> usize {
    (status >> DMASTATUS_BUFCNT_SHIFT) as usize
}
