// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Interrupt dispatch and bus-level events.

use log::{debug, trace, warn};

use super::{DeviceState, Udphs};
use crate::config::{EPSET_ALL, EP0, NDMACHANNELS, NENDPOINTS};
use crate::driver::Notification;
use crate::endpoint::{EndpointState, RxReady, TxReady};
use crate::error::Error;
use crate::platform::Platform;
use crate::regs::{self, Registers};
use crate::usb::{EndpointDescriptor, TransferType};

impl<R: Registers, P: Platform> Udphs<R, P> {
    /// Services the controller. Call this from the UDPHS interrupt handler.
    ///
    /// Keeps going until nothing enabled is pending, delivering callbacks
    /// between passes.
    pub fn handle_interrupt(&mut self) {
        while self.critical(|dev| dev.service_pending()) {
            self.deliver();
        }
        self.deliver();
    }

    /// One pass over INTSTA. Returns false if there was nothing to do.
    fn service_pending(&mut self) -> bool {
        let pending = self.getreg(regs::INTSTA) & self.getreg(regs::IEN);
        if pending == 0 {
            return false;
        }
        trace!("INTSTA & IEN = {:#010x}", pending);

        if pending & regs::INT_DETSUSPD != 0 {
            // Listen for the way back out instead.
            self.modifyreg(regs::IEN, regs::INT_DETSUSPD, regs::INT_WAKEUP | regs::INT_ENDOFRSM);
            self.putreg(regs::CLRINT, regs::INT_DETSUSPD | regs::INT_WAKEUP);
            self.suspend();
        } else if pending & regs::INT_SOF != 0 {
            self.putreg(regs::CLRINT, regs::INT_SOF);
        } else if pending & (regs::INT_WAKEUP | regs::INT_ENDOFRSM) != 0 {
            self.resume();
            self.putreg(
                regs::CLRINT,
                regs::INT_WAKEUP | regs::INT_ENDOFRSM | regs::INT_DETSUSPD,
            );
            self.modifyreg(regs::IEN, regs::INT_WAKEUP, regs::INT_ENDOFRSM | regs::INT_DETSUSPD);
        }

        if pending & regs::INT_ENDRESET != 0 {
            self.putreg(regs::CLRINT, regs::INT_WAKEUP | regs::INT_DETSUSPD);
            self.ien_enable(regs::INT_DETSUSPD);
            self.bus_reset();
            self.putreg(regs::CLRINT, regs::INT_ENDRESET);
        } else if pending & regs::INT_UPSTRRES != 0 {
            self.putreg(regs::CLRINT, regs::INT_UPSTRRES);
        }

        for ch in 1..=NDMACHANNELS {
            if pending & regs::int_dma(ch) != 0 {
                self.dma_interrupt(ch);
            }
        }
        for epno in 0..NENDPOINTS {
            if pending & regs::int_ept(epno) != 0 {
                self.ep_interrupt(epno);
            }
        }
        true
    }

    fn ep_interrupt(&mut self, epno: usize) {
        let sta = self.getreg(regs::eptsta(epno));
        let ctl = self.getreg(regs::eptctl(epno));

        // Bank free again: the last packet went out.
        if sta & regs::EPTSTA_TXRDY == 0 && ctl & regs::EPTCTL_TXRDY != 0 {
            match self.eps[epno].state.on_tx_ready() {
                TxReady::ContinueWrite => {
                    self.eps[epno].state = EndpointState::Idle;
                    self.req_write(epno);
                }
                TxReady::ApplyAddress => {
                    self.eps[epno].state = EndpointState::Idle;
                    self.putreg(regs::eptctldis(epno), regs::EPTCTL_TXRDY);
                    let addr = self.devaddr;
                    self.set_devaddr(addr);
                }
                TxReady::Unexpected => {
                    warn!("ep{}: TX ready in {:?}", epno, self.eps[epno].state);
                    self.putreg(regs::eptctldis(epno), regs::EPTCTL_TXRDY);
                }
            }
        }

        if sta & regs::EPTSTA_RXRDYTXKL != 0 && ctl & regs::EPTCTL_RXRDYTXKL != 0 {
            let pktsize = regs::eptsta_bytecnt(sta);
            match self.eps[epno].state.on_rx_ready() {
                RxReady::ContinueRead => self.req_read(epno, pktsize),
                RxReady::Ep0Data => self.ep0_data_out(pktsize),
                RxReady::Unsolicited => self.rx_unsolicited(epno, sta, pktsize),
            }
        }

        if sta & regs::EPTSTA_STALLSNT != 0 && ctl & regs::EPTCTL_STALLSNT != 0 {
            self.putreg(regs::eptclrsta(epno), regs::EPTSTA_STALLSNT);
            if self.eps[epno].is_iso() {
                warn!("ep{}: isochronous CRC error", epno);
                if self.eps[epno].state.is_transferring() {
                    let is_in = self.eps[epno].is_in();
                    self.req_complete(epno, Err(Error::IoError));
                    if is_in {
                        self.req_write(epno);
                    } else {
                        self.start_read(epno);
                    }
                }
            } else if self.eps[epno].state != EndpointState::Stalled {
                // A protocol stall only lasts one handshake.
                self.putreg(regs::eptclrsta(epno), regs::EPTSTA_FRCESTALL);
                self.putreg(regs::eptctldis(epno), regs::EPTCTL_STALLSNT);
            }
        }

        if sta & regs::EPTSTA_RXSETUP != 0 && ctl & regs::EPTCTL_RXSETUP != 0 {
            self.ep0_rx_setup(epno, sta);
        }
    }

    /// OUT data (or a zero-length packet) nobody was waiting for.
    fn rx_unsolicited(&mut self, epno: usize, sta: u32, pktsize: usize) {
        let ep = &self.eps[epno];
        if ep.is_control() {
            if pktsize == 0 {
                // Status stage of a control read.
                trace!("ep{}: status OUT", epno);
            } else {
                warn!("ep{}: dropping {} unexpected bytes", epno, pktsize);
            }
            self.putreg(regs::eptclrsta(epno), regs::EPTSTA_RXRDYTXKL);
        } else if sta & regs::EPTSTA_FRCESTALL != 0 {
            self.putreg(regs::eptclrsta(epno), regs::EPTSTA_RXRDYTXKL);
        } else if ep.state == EndpointState::Idle && !ep.queue.is_empty() {
            self.start_read(epno);
        } else {
            self.note_rx_pending(epno);
        }
    }

    ////////////////////////////////////////////////////////////////////////
    // Bus events.

    pub(super) fn suspend(&mut self) {
        if self.devstate == DeviceState::Suspended {
            return;
        }
        debug!("suspend from {:?}", self.devstate);
        self.prevstate = self.devstate;
        self.devstate = DeviceState::Suspended;
        self.platform.disable_clock();
        self.platform.board_suspend(false);
        self.pending.push_back(Notification::Suspend);
    }

    pub(super) fn resume(&mut self) {
        if self.devstate != DeviceState::Suspended {
            return;
        }
        self.platform.enable_clock();
        self.platform.board_suspend(true);
        self.devstate = self.prevstate;
        debug!("resume to {:?}", self.devstate);
        self.pending.push_back(Notification::Resume);
    }

    /// Back to the default state: address zero, every endpoint down, EP0 up.
    pub(super) fn bus_reset(&mut self) {
        debug!("bus reset");
        self.platform.enable_clock();
        self.pending.push_back(Notification::Disconnect);

        self.devaddr = 0;
        self.set_devaddr(0);
        self.rxpending = 0;
        self.epset_reset(EPSET_ALL);

        let ep0 = EndpointDescriptor::new(0, TransferType::Control, self.config.ep0_maxpacket);
        if let Err(e) = self.ep_configure_internal(EP0, &ep0) {
            warn!("EP0 configuration failed: {}", e);
        }
        for ep in &mut self.eps {
            ep.clear_flags();
        }
        trace!("EP0 ready, {} byte packets", self.eps[EP0].maxpacket);
    }
}
