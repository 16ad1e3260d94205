// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! DMA transfer descriptors and what a channel's status word means.
//!
//! The UDPHS can walk a chain of descriptors on its own, but we only ever
//! program a channel one contiguous slice at a time, straight through its
//! registers. A descriptor is still taken from the pool for each DMA
//! operation: it is the record of what the channel was told to do, and
//! holding one is what marks an endpoint as owning a channel.

use alloc::vec::Vec;

use crate::regs;

/// Hardware layout of a UDPHS DMA transfer descriptor.
#[repr(C, align(16))]
#[derive(Copy, Clone, Debug, Default)]
pub(crate) struct Dtd {
    /// Bus address of the next descriptor; unused for single slices.
    pub next: u32,
    /// Bus address of the buffer slice.
    pub addr: u32,
    /// DMACONTROL value, including the slice length.
    pub ctrl: u32,
    reserved: u32,
}

const _: () = assert!(core::mem::size_of::<Dtd>() == 16);

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub(crate) struct DtdId(u16);

/// Fixed pool of descriptors. The free list is linked through `link`, by
/// index.
#[derive(Debug)]
pub(crate) struct DtdPool {
    dtds: Vec<Dtd>,
    link: Vec<Option<u16>>,
    head: Option<u16>,
}

impl DtdPool {
    pub fn new(count: usize) -> Self {
        let count = count.min(usize::from(u16::MAX));
        let link = (0..count)
            .map(|i| if i + 1 < count { Some((i + 1) as u16) } else { None })
            .collect();
        Self {
            dtds: alloc::vec![Dtd::default(); count],
            link,
            head: if count > 0 { Some(0) } else { None },
        }
    }

    pub fn alloc(&mut self) -> Option<DtdId> {
        let index = self.head?;
        self.head = self.link[usize::from(index)].take();
        self.dtds[usize::from(index)] = Dtd::default();
        Some(DtdId(index))
    }

    pub fn free(&mut self, id: DtdId) {
        self.link[usize::from(id.0)] = self.head;
        self.head = Some(id.0);
    }

    pub fn get(&self, id: DtdId) -> &Dtd {
        &self.dtds[usize::from(id.0)]
    }

    pub fn get_mut(&mut self, id: DtdId) -> &mut Dtd {
        &mut self.dtds[usize::from(id.0)]
    }

    pub fn available(&self) -> usize {
        let mut n = 0;
        let mut cur = self.head;
        while let Some(i) = cur {
            n += 1;
            cur = self.link[usize::from(i)];
        }
        n
    }
}

/// Why a channel interrupted, decoded from DMASTATUS.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub(crate) enum DmaEvent {
    /// The programmed byte count ran out. `unmoved` is what the channel
    /// reports as left over, normally zero.
    EndOfBuffer { unmoved: usize },
    /// The bus ended the transfer early, typically a short OUT packet.
    EndOfTransfer { unmoved: usize },
    /// Anything else.
    Fault(u32),
}

impl DmaEvent {
    pub fn decode(status: u32) -> Self {
        let unmoved = regs::dmastatus_bufcnt(status);
        if status & regs::DMASTATUS_ENDBFST != 0 {
            DmaEvent::EndOfBuffer { unmoved }
        } else if status & regs::DMASTATUS_ENDTRST != 0 {
            DmaEvent::EndOfTransfer { unmoved }
        } else {
            DmaEvent::Fault(status)
        }
    }
}

/// Control word for the first slice of a transfer.
pub(crate) fn first_slice_control(dir_in: bool) -> u32 {
    let base = regs::DMACONTROL_ENDBEN | regs::DMACONTROL_ENDBUFFIT | regs::DMACONTROL_CHANNENB;
    if dir_in {
        base
    } else {
        // OUT transfers may also end on a short packet.
        base | regs::DMACONTROL_ENDTREN | regs::DMACONTROL_ENDTRIT
    }
}

/// Control word for slices chained after an end-of-buffer.
pub(crate) const CHAINED_SLICE_CONTROL: u32 = regs::DMACONTROL_ENDTREN
    | regs::DMACONTROL_ENDTRIT
    | regs::DMACONTROL_ENDBEN
    | regs::DMACONTROL_ENDBUFFIT
    | regs::DMACONTROL_CHANNENB;
