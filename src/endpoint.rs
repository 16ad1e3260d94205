// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Per-endpoint state and the EPTCFG arithmetic.

use crate::config::{self, NENDPOINTS};
use crate::dma::DtdId;
use crate::error::{Error, Result};
use crate::regs;
use crate::request::RequestQueue;
use crate::usb::{EndpointDescriptor, TransferType, UsbDir};

/// Names one of the controller's hardware endpoints.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct EndpointId(u8);

impl EndpointId {
    pub const EP0: Self = Self(0);

    /// `None` if the controller has no endpoint `epno`.
    pub fn new(epno: u8) -> Option<Self> {
        (usize::from(epno) < NENDPOINTS).then_some(Self(epno))
    }

    pub fn number(self) -> u8 {
        self.0
    }

    pub(crate) fn index(self) -> usize {
        usize::from(self.0)
    }

    /// For indices already known to be in range.
    pub(crate) fn from_index(epno: usize) -> Self {
        debug_assert!(epno < NENDPOINTS);
        Self(epno as u8)
    }
}

/// Where an endpoint is in its life.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum EndpointState {
    /// Not configured. The starting point, and where reset and disable leave
    /// it.
    Disabled,
    /// Halted by a class driver or a SET_FEATURE(ENDPOINT_HALT).
    Stalled,
    /// Configured and not moving data.
    Idle,
    /// The head request is going out.
    Sending,
    /// The head request is coming in.
    Receiving,
    /// EP0 only: waiting for the OUT data stage of a control write.
    Ep0DataOut,
    /// EP0 only: a locally generated response is going out.
    Ep0StatusIn,
    /// EP0 only: the SET_ADDRESS status packet is going out. The address
    /// changes once it's gone.
    Ep0Address,
}

/// What a TX-ready event means in a given state.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub(crate) enum TxReady {
    /// A data or status packet went out; keep writing.
    ContinueWrite,
    /// The SET_ADDRESS status packet went out; switch addresses now.
    ApplyAddress,
    /// We weren't sending anything.
    Unexpected,
}

/// What an RX-ready event means in a given state.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub(crate) enum RxReady {
    /// Feed the packet to the head request.
    ContinueRead,
    /// It's the OUT data stage of a control write.
    Ep0Data,
    /// Nobody asked for it: a control status stage, or early data.
    Unsolicited,
}

impl EndpointState {
    pub(crate) fn on_tx_ready(self) -> TxReady {
        match self {
            EndpointState::Sending | EndpointState::Ep0StatusIn => TxReady::ContinueWrite,
            EndpointState::Ep0Address => TxReady::ApplyAddress,
            EndpointState::Disabled
            | EndpointState::Stalled
            | EndpointState::Idle
            | EndpointState::Receiving
            | EndpointState::Ep0DataOut => TxReady::Unexpected,
        }
    }

    pub(crate) fn on_rx_ready(self) -> RxReady {
        match self {
            EndpointState::Receiving => RxReady::ContinueRead,
            EndpointState::Ep0DataOut => RxReady::Ep0Data,
            EndpointState::Disabled
            | EndpointState::Stalled
            | EndpointState::Idle
            | EndpointState::Sending
            | EndpointState::Ep0StatusIn
            | EndpointState::Ep0Address => RxReady::Unsolicited,
        }
    }

    /// Target of a stall, or `None` where stalling is a no-op.
    pub(crate) fn stalled(self) -> Option<EndpointState> {
        match self {
            EndpointState::Disabled | EndpointState::Stalled => None,
            EndpointState::Idle
            | EndpointState::Sending
            | EndpointState::Receiving
            | EndpointState::Ep0DataOut
            | EndpointState::Ep0StatusIn
            | EndpointState::Ep0Address => Some(EndpointState::Stalled),
        }
    }

    /// Target of clearing a stall, or `None` if there was no stall.
    pub(crate) fn resumed(self) -> Option<EndpointState> {
        match self {
            EndpointState::Stalled => Some(EndpointState::Idle),
            _ => None,
        }
    }

    /// True while the head request has bytes handed to hardware.
    pub(crate) fn is_transferring(self) -> bool {
        matches!(self, EndpointState::Sending | EndpointState::Receiving)
    }
}

#[derive(Debug)]
pub(crate) struct Endpoint {
    pub epno: u8,
    pub dir: UsbDir,
    pub ttype: TransferType,
    pub maxpacket: u16,
    pub state: EndpointState,
    /// Stalled, either by us or by request.
    pub stalled: bool,
    /// The host halted it with SET_FEATURE(ENDPOINT_HALT).
    pub halted: bool,
    /// A zero-length packet is owed before the head request completes.
    pub txnullpkt: bool,
    /// FIFO banks assigned to the endpoint.
    pub bank: u32,
    pub queue: RequestQueue,
    /// Descriptor held while a DMA operation is in flight.
    pub dtd: Option<DtdId>,
}

impl Endpoint {
    pub fn new(epno: u8) -> Self {
        Self {
            epno,
            dir: UsbDir::Out,
            ttype: if epno == 0 { TransferType::Control } else { TransferType::Bulk },
            maxpacket: 0,
            state: EndpointState::Disabled,
            stalled: false,
            halted: false,
            txnullpkt: false,
            bank: 0,
            queue: RequestQueue::default(),
            dtd: None,
        }
    }

    pub fn index(&self) -> usize {
        usize::from(self.epno)
    }

    pub fn is_control(&self) -> bool {
        self.ttype == TransferType::Control
    }

    pub fn is_iso(&self) -> bool {
        self.ttype == TransferType::Isochronous
    }

    /// EP0 is written to like an IN endpoint: the class driver only submits
    /// data stage responses there.
    pub fn is_in(&self) -> bool {
        self.epno == 0 || self.dir == UsbDir::In
    }

    pub fn uses_dma(&self) -> bool {
        config::EPSET_DMA & config::ep_bit(self.index()) != 0
    }

    pub fn clear_flags(&mut self) {
        self.stalled = false;
        self.halted = false;
        self.txnullpkt = false;
    }
}

/// The decoded result of fitting a descriptor onto a hardware endpoint.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub(crate) struct Geometry {
    pub maxpacket: u16,
    pub nbtrans: u32,
    pub banks: u32,
    /// EPTCFG value, minus the MAPD bit the hardware fills in.
    pub eptcfg: u32,
}

impl Geometry {
    pub fn for_descriptor(desc: &EndpointDescriptor, highspeed: bool) -> Result<Self> {
        let epno = usize::from(desc.number());
        let mut maxpacket = desc.max_packet_size();
        let mut nbtrans = 1;
        if highspeed {
            // Bits 12:11 are additional transactions per microframe. The
            // reserved value 3 falls back to one.
            nbtrans = match (maxpacket >> 11) & 0b11 {
                3 => 1,
                n => u32::from(n) + 1,
            };
            maxpacket &= 0x7ff;
        }

        let limit = if epno == 0 { config::EP0_MAXPACKET } else { config::EPT_MAXPACKET };
        if maxpacket == 0 || maxpacket > limit {
            return Err(Error::ConfigError);
        }
        let size = size_code(maxpacket).ok_or(Error::ConfigError)?;
        let banks = config::nbanks(epno);
        let dir_in = desc.direction() == UsbDir::In;

        let eptcfg = size << regs::EPTCFG_SIZE_SHIFT
            | if dir_in { regs::EPTCFG_DIR_IN } else { 0 }
            | (desc.transfer_type() as u32) << regs::EPTCFG_TYPE_SHIFT
            | banks << regs::EPTCFG_BK_SHIFT
            | nbtrans << regs::EPTCFG_NBTRANS_SHIFT;

        Ok(Self { maxpacket, nbtrans, banks, eptcfg })
    }
}

/// EPT_SIZE field: 8 bytes is 0, doubling up to 1024 at 7.
fn size_code(maxpacket: u16) -> Option<u32> {
    (0..8).find(|code| maxpacket <= 8 << code)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn size_codes_round_up() {
        assert_eq!(size_code(1), Some(0));
        assert_eq!(size_code(8), Some(0));
        assert_eq!(size_code(9), Some(1));
        assert_eq!(size_code(64), Some(3));
        assert_eq!(size_code(512), Some(6));
        assert_eq!(size_code(1024), Some(7));
        assert_eq!(size_code(1025), None);
    }

    #[test]
    fn full_speed_bulk_in_geometry() {
        let desc = EndpointDescriptor::new(UsbDir::In.endpoint(1), TransferType::Bulk, 64);
        let geom = Geometry::for_descriptor(&desc, false).unwrap();
        assert_eq!(geom.maxpacket, 64);
        assert_eq!(geom.nbtrans, 1);
        assert_eq!(geom.banks, 3);
        assert_eq!(geom.eptcfg, 3 | regs::EPTCFG_DIR_IN | 2 << 4 | 3 << 6 | 1 << 8);
    }

    #[test]
    fn high_bandwidth_iso_geometry() {
        // 2 extra transactions per microframe, 1024 bytes each.
        let mps = (2 << 11) | 1024;
        let desc = EndpointDescriptor::new(UsbDir::In.endpoint(4), TransferType::Isochronous, mps);
        let geom = Geometry::for_descriptor(&desc, true).unwrap();
        assert_eq!(geom.maxpacket, 1024);
        assert_eq!(geom.nbtrans, 3);
        assert_eq!(geom.banks, 2);
    }

    #[test]
    fn oversize_packets_are_rejected() {
        let desc = EndpointDescriptor::new(UsbDir::Out.endpoint(5), TransferType::Bulk, 2048);
        assert_eq!(Geometry::for_descriptor(&desc, false), Err(Error::ConfigError));
        let ep0 = EndpointDescriptor::new(0, TransferType::Control, 128);
        assert_eq!(Geometry::for_descriptor(&ep0, false), Err(Error::ConfigError));
    }

    #[test]
    fn stall_and_resume_transitions() {
        assert_eq!(EndpointState::Sending.stalled(), Some(EndpointState::Stalled));
        assert_eq!(EndpointState::Disabled.stalled(), None);
        assert_eq!(EndpointState::Stalled.stalled(), None);
        assert_eq!(EndpointState::Stalled.resumed(), Some(EndpointState::Idle));
        assert_eq!(EndpointState::Idle.resumed(), None);
    }

    #[test]
    fn tx_ready_meaning() {
        assert_eq!(EndpointState::Sending.on_tx_ready(), TxReady::ContinueWrite);
        assert_eq!(EndpointState::Ep0StatusIn.on_tx_ready(), TxReady::ContinueWrite);
        assert_eq!(EndpointState::Ep0Address.on_tx_ready(), TxReady::ApplyAddress);
        assert_eq!(EndpointState::Idle.on_tx_ready(), TxReady::Unexpected);
    }

    #[test]
    fn endpoint_ids_are_bounded() {
        assert!(EndpointId::new(15).is_some());
        assert!(EndpointId::new(16).is_none());
    }
}
