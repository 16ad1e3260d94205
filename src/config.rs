// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

use crate::error::{Error, Result};

/// Hardware endpoints on the SAMA5 UDPHS.
pub const NENDPOINTS: usize = 16;
/// DMA channels, serving endpoints 1 through 7.
pub const NDMACHANNELS: usize = 7;
/// The control endpoint.
pub const EP0: usize = 0;

/// Largest EP0 packet the hardware supports.
pub(crate) const EP0_MAXPACKET: u16 = 64;
/// Largest packet on any other endpoint.
pub(crate) const EPT_MAXPACKET: u16 = 1024;

pub(crate) const fn ep_bit(epno: usize) -> u16 {
    1 << epno
}

pub(crate) const EPSET_ALL: u16 = 0xffff;
pub(crate) const EPSET_NOTEP0: u16 = EPSET_ALL & !ep_bit(EP0);

// Which endpoints move data through a DMA channel.
cfg_if::cfg_if! {
    if #[cfg(feature = "dma")] {
        pub(crate) const EPSET_DMA: u16 = 0x00fe;
    } else {
        pub(crate) const EPSET_DMA: u16 = 0;
    }
}

/// Number of FIFO banks wired to each endpoint.
pub(crate) const fn nbanks(epno: usize) -> u32 {
    match epno {
        0 => 1,
        1 | 2 => 3,
        _ => 2,
    }
}

/// Runtime knobs. `Config::default()` is right for real hardware.
#[derive(Clone, Debug)]
pub struct Config {
    /// EP0 max packet size advertised to the host. 8, 16, 32 or 64.
    pub ep0_maxpacket: u16,
    /// Largest slice handed to a DMA channel in one go. The hardware length
    /// field tops out at 64KiB.
    pub dma_max_fifo: usize,
    /// Number of DMA transfer descriptors in the pool.
    pub ndtds: usize,
    /// How many times `wakeup` polls for the hardware to finish signalling
    /// remote wakeup before giving up.
    pub wakeup_spin_limit: u32,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            ep0_maxpacket: EP0_MAXPACKET,
            dma_max_fifo: 0x1_0000,
            ndtds: 8,
            wakeup_spin_limit: 1_000_000,
        }
    }
}

impl Config {
    pub(crate) fn validate(&self) -> Result<()> {
        if !matches!(self.ep0_maxpacket, 8 | 16 | 32 | 64) {
            return Err(Error::ConfigError);
        }
        if self.dma_max_fifo == 0 || self.dma_max_fifo > 0x1_0000 {
            return Err(Error::ConfigError);
        }
        if EPSET_DMA != 0 && self.ndtds == 0 {
            return Err(Error::ConfigError);
        }
        Ok(())
    }
}
