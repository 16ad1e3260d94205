// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! EP0 control transfers: SETUP packets, the OUT data stage of control
//! writes, and acting on what `ep0::decide` says.

use log::{debug, trace, warn};

use super::Udphs;
use crate::config::{EP0, EP0_MAXPACKET};
use crate::driver::{Notification, OutData};
use crate::endpoint::EndpointState;
use crate::ep0::{self, Ep0Action, Ep0Context, Ep0Outcome};
use crate::error::Error;
use crate::platform::Platform;
use crate::regs::{self, Registers};
use crate::usb::{SetupPacket, UsbDir};

impl<R: Registers, P: Platform> Udphs<R, P> {
    /// RXSETUP on a control endpoint. On isochronous endpoints the same bit
    /// flags a flow error, which is only acknowledged.
    pub(super) fn ep0_rx_setup(&mut self, epno: usize, sta: u32) {
        if self.eps[epno].is_iso() {
            warn!("ep{}: isochronous flow error", epno);
            self.putreg(regs::eptclrsta(epno), regs::EPTSTA_RXSETUP);
            return;
        }
        if epno != EP0 {
            warn!("ep{}: SETUP on a secondary control endpoint ignored", epno);
            self.putreg(regs::eptclrsta(epno), regs::EPTSTA_RXSETUP);
            return;
        }

        if self.eps[EP0].state.is_transferring() {
            // The host moved on; whatever was going out is as done as it
            // gets.
            self.req_complete(EP0, Ok(()));
        }

        let pktsize = regs::eptsta_bytecnt(sta);
        if pktsize != SetupPacket::SIZE {
            warn!("SETUP packet of {} bytes", pktsize);
        }
        let mut raw = [0u8; SetupPacket::SIZE];
        self.regs.fifo_read(EP0, &mut raw);
        self.putreg(regs::eptclrsta(EP0), regs::EPTSTA_RXSETUP);
        let Some(ctrl) = SetupPacket::parse(&raw) else {
            return;
        };
        self.ctrl = ctrl;
        trace!("SETUP {:?}", ctrl);

        if self.eps[EP0].stalled {
            // A protocol stall ends at the next SETUP.
            self.putreg(regs::eptclrsta(EP0), regs::EPTSTA_FRCESTALL);
            self.putreg(regs::eptctldis(EP0), regs::EPTCTL_STALLSNT);
            self.eps[EP0].stalled = false;
        }

        if ctrl.direction() == UsbDir::Out && ctrl.length() > 0 {
            self.eps[EP0].state = EndpointState::Ep0DataOut;
        } else {
            self.eps[EP0].state = EndpointState::Idle;
            self.ep0_setup(None);
        }
    }

    /// The OUT data stage of a control write arrived.
    pub(super) fn ep0_data_out(&mut self, pktsize: usize) {
        let want = usize::from(self.ctrl.length()).min(self.ep0out.len());
        let n = pktsize.min(want);
        self.regs.fifo_read(EP0, &mut self.ep0out[..n]);
        self.putreg(regs::eptclrsta(EP0), regs::EPTSTA_RXRDYTXKL);
        if pktsize > n {
            warn!("EP0 data stage: {} of {} bytes kept", n, pktsize);
        }
        self.eps[EP0].state = EndpointState::Idle;
        self.ep0_setup(Some(n));
    }

    /// Resolves `self.ctrl`, with `out_len` bytes of data stage in
    /// `self.ep0out` for control writes.
    fn ep0_setup(&mut self, out_len: Option<usize>) -> Ep0Outcome {
        // Anything still queued belongs to a control transfer the host has
        // abandoned.
        while let Some(id) = self.eps[EP0].queue.peek() {
            let finished = self.requests.get(id).map_or(false, |r| r.remaining() == 0 && r.started);
            self.req_complete(EP0, if finished { Ok(()) } else { Err(Error::Protocol) });
        }
        let ep0 = &mut self.eps[EP0];
        ep0.state = EndpointState::Idle;
        ep0.stalled = false;
        ep0.txnullpkt = false;

        let mut stalled = 0u16;
        for (epno, ep) in self.eps.iter().enumerate() {
            if ep.stalled {
                stalled |= 1 << epno;
            }
        }
        let ctx = Ep0Context { self_powered: self.selfpowered, stalled };

        let outcome = match ep0::decide(&self.ctrl, &ctx) {
            Ep0Action::Reply(response) => {
                self.eps[EP0].state = EndpointState::Ep0StatusIn;
                self.ep0_write(response.as_bytes());
                Ep0Outcome::Success
            }
            Ep0Action::SetAddress(addr) => {
                debug!("SET_ADDRESS {}", addr);
                self.devaddr = addr;
                self.eps[EP0].state = EndpointState::Ep0Address;
                self.ep0_write(&[]);
                Ep0Outcome::Address
            }
            Ep0Action::Halt { epno, halt } => {
                let epno = usize::from(epno);
                debug!("ep{} {}", epno, if halt { "halt" } else { "unhalt" });
                // `stall_locked` is a no-op on disabled endpoints.
                self.stall_locked(epno, !halt);
                self.eps[epno].halted = halt && self.eps[epno].stalled;
                self.eps[EP0].state = EndpointState::Ep0StatusIn;
                self.ep0_write(&[]);
                Ep0Outcome::Success
            }
            Ep0Action::Dispatch => {
                let out = out_len.map(|len| {
                    let mut data = OutData { bytes: [0; EP0_MAXPACKET as usize], len };
                    data.bytes[..len].copy_from_slice(&self.ep0out[..len]);
                    data
                });
                self.pending.push_back(Notification::Setup { ctrl: self.ctrl, out });
                Ep0Outcome::Dispatched
            }
            Ep0Action::Stall => {
                self.stall_locked(EP0, false);
                Ep0Outcome::Stall
            }
        };
        trace!("SETUP resolved: {:?}", outcome);
        self.lastsetup = Some(outcome);
        outcome
    }

    /// Sends a locally generated response (or a bare status packet) on EP0.
    fn ep0_write(&mut self, bytes: &[u8]) {
        if !bytes.is_empty() {
            self.regs.fifo_write(EP0, bytes);
        }
        self.putreg(regs::eptsetsta(EP0), regs::EPTSTA_TXRDY);
        self.putreg(regs::eptctlenb(EP0), regs::EPTCTL_TXRDY);
    }
}
