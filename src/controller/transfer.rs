// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Endpoint configuration and the request engine.
//!
//! Each endpoint works its queue strictly from the head. IN requests go out
//! either a packet at a time through the FIFO window (`req_write`) or in
//! DMA slices of up to `Config::dma_max_fifo` bytes (`dma_start`). OUT
//! requests fill the same two ways (`req_read`, `start_read`). A request
//! leaves its queue in exactly one place, `req_complete`, which queues the
//! completion callback for `deliver`.

use log::{debug, trace, warn};

use super::{DeviceState, Udphs};
use crate::config::{self, EP0};
use crate::dma::{self, DmaEvent};
use crate::driver::Notification;
use crate::endpoint::{EndpointId, EndpointState, Geometry};
use crate::error::{Error, Result};
use crate::platform::Platform;
use crate::regs::{self, Registers};
use crate::request::{RequestFlags, RequestId};
use crate::usb::{EndpointDescriptor, TransferType, UsbDir};

impl<R: Registers, P: Platform> Udphs<R, P> {
    ////////////////////////////////////////////////////////////////////////
    // Class driver operations.

    /// Sets up a non-control endpoint from its descriptor and marks the
    /// device configured.
    pub fn configure_endpoint(&mut self, ep: EndpointId, desc: &EndpointDescriptor) -> Result<()> {
        if ep == EndpointId::EP0 || desc.number() != ep.number() {
            warn!("descriptor {:#04x} doesn't fit ep{}", desc.endpoint_address, ep.number());
            return Err(Error::InvalidArgs);
        }
        let result = self.critical(|dev| {
            dev.ep_configure_internal(ep.index(), desc)?;
            if dev.devstate == DeviceState::Suspended {
                dev.prevstate = DeviceState::Configured;
            } else {
                dev.devstate = DeviceState::Configured;
            }
            Ok(())
        });
        self.deliver();
        result
    }

    /// Shuts an endpoint down, failing everything queued on it with
    /// `Shutdown`.
    pub fn disable_endpoint(&mut self, ep: EndpointId) -> Result<()> {
        if ep == EndpointId::EP0 {
            // EP0 only goes down with a bus reset.
            return Err(Error::InvalidArgs);
        }
        self.critical(|dev| {
            dev.ep_reset(ep.index());
            if dev.devstate > DeviceState::Address {
                dev.devstate = DeviceState::Address;
            }
            debug!("ep{} disabled", ep.number());
        });
        self.deliver();
        Ok(())
    }

    /// Queues a request on an endpoint. The engine owns it until its
    /// completion callback.
    pub fn submit(&mut self, ep: EndpointId, req: RequestId) -> Result<()> {
        let result = self.critical(|dev| dev.submit_locked(ep.index(), req));
        self.deliver();
        result
    }

    /// Aborts every request queued on `ep`, `req` included, completing them
    /// with `Shutdown`.
    pub fn cancel(&mut self, ep: EndpointId, req: RequestId) -> Result<()> {
        let result = self.critical(|dev| {
            if dev.requests.get(req).is_none() {
                return Err(Error::InvalidArgs);
            }
            dev.cancel_all(ep.index());
            Ok(())
        });
        self.deliver();
        result
    }

    /// Stalls an endpoint (`resume == false`) or clears a stall.
    pub fn stall(&mut self, ep: EndpointId, resume: bool) -> Result<()> {
        self.critical(|dev| dev.stall_locked(ep.index(), resume));
        self.deliver();
        Ok(())
    }

    ////////////////////////////////////////////////////////////////////////
    // Locked internals.

    fn submit_locked(&mut self, epno: usize, id: RequestId) -> Result<()> {
        // The driver is checked out of `self.driver` while its callbacks
        // run, and callbacks may submit.
        if self.driver.is_none() && !self.delivering {
            warn!("ep{}: submit with no class driver", epno);
            return Err(Error::Shutdown);
        }
        let ep = &self.eps[epno];
        match ep.state {
            EndpointState::Disabled => {
                warn!("ep{}: submit while disabled", epno);
                return Err(Error::Shutdown);
            }
            EndpointState::Stalled => {
                warn!("ep{}: submit while stalled", epno);
                return Err(Error::Busy);
            }
            _ => {}
        }
        let is_in = ep.is_in();

        let req = self.requests.get_mut(id).ok_or(Error::InvalidArgs)?;
        if req.is_queued() {
            return Err(Error::Busy);
        }
        if req.len() > req.buffer().len() {
            return Err(Error::InvalidArgs);
        }
        req.arm(epno as u8);
        trace!("ep{}: submit {:?}, {} bytes", epno, id, req.len());

        self.eps[epno].queue.enqueue(id);
        if self.eps[epno].state == EndpointState::Idle {
            if is_in {
                self.req_write(epno);
            } else {
                self.start_read(epno);
            }
        }
        Ok(())
    }

    /// Stalling a stalled endpoint, or resuming one that isn't, does nothing.
    pub(crate) fn stall_locked(&mut self, epno: usize, resume: bool) {
        let ep = &self.eps[epno];
        if resume {
            let Some(next) = ep.state.resumed() else {
                return;
            };
            debug!("ep{} resume", epno);
            let is_in = ep.is_in();
            let ep = &mut self.eps[epno];
            ep.state = next;
            ep.stalled = false;
            self.putreg(regs::eptclrsta(epno), regs::EPTSTA_TOGGLESQ | regs::EPTSTA_FRCESTALL);
            self.putreg(regs::EPTRST, u32::from(config::ep_bit(epno)));
            if is_in {
                self.req_write(epno);
            } else {
                self.start_read(epno);
            }
            return;
        }

        let Some(next) = ep.state.stalled() else {
            return;
        };
        debug!("ep{} stall", epno);
        let (control, dma) = (ep.is_control(), ep.uses_dma());
        if dma && ep.dtd.is_some() {
            self.putreg(regs::dmacontrol(epno), 0);
            self.ien_disable(regs::int_dma(epno));
        }
        if !self.eps[epno].queue.is_empty() && self.eps[epno].state.is_transferring() {
            self.req_complete(epno, Err(Error::IoError));
        }

        let ep = &mut self.eps[epno];
        ep.state = next;
        ep.stalled = true;
        ep.txnullpkt = false;
        self.putreg(regs::eptsetsta(epno), regs::EPTSTA_FRCESTALL);
        self.putreg(regs::eptctldis(epno), regs::EPTCTL_TXRDY);
        if control {
            // Hear about the STALL going out; it lasts until the next SETUP.
            self.putreg(regs::eptctlenb(epno), regs::EPTCTL_STALLSNT);
        } else {
            self.ien_disable(regs::int_ept(epno));
        }
    }

    /// Maps `epno` onto the hardware according to `desc` and leaves it Idle.
    pub(super) fn ep_configure_internal(
        &mut self,
        epno: usize,
        desc: &EndpointDescriptor,
    ) -> Result<()> {
        let highspeed = self.getreg(regs::INTSTA) & regs::INTSTA_SPEED != 0;
        let geom = Geometry::for_descriptor(desc, highspeed).map_err(|e| {
            warn!("ep{}: bad max packet size {:#x}", epno, desc.max_packet_size());
            e
        })?;

        self.cancel_all(epno);
        let bit = u32::from(config::ep_bit(epno));
        {
            let ep = &mut self.eps[epno];
            ep.dir = if epno == EP0 { UsbDir::Out } else { desc.direction() };
            ep.ttype = desc.transfer_type();
            ep.maxpacket = geom.maxpacket;
            ep.bank = geom.banks;
            ep.state = EndpointState::Disabled;
            ep.clear_flags();
        }
        self.rxpending &= !config::ep_bit(epno);

        self.putreg(regs::eptctldis(epno), regs::EPTCTL_ALL);
        self.putreg(regs::eptclrsta(epno), regs::EPTSTA_TOGGLESQ | regs::EPTSTA_FRCESTALL);
        self.putreg(regs::EPTRST, bit);
        self.ien_disable(regs::int_ept(epno));

        self.putreg(regs::eptcfg(epno), geom.eptcfg);
        if self.getreg(regs::eptcfg(epno)) & regs::EPTCFG_MAPD == 0 {
            warn!("ep{}: controller refused EPTCFG {:#010x}", epno, geom.eptcfg);
            return Err(Error::ConfigError);
        }

        let ep = &self.eps[epno];
        let (ttype, is_in, dma) = (ep.ttype, ep.is_in(), ep.uses_dma());
        match ttype {
            TransferType::Control => {
                self.putreg(
                    regs::eptctlenb(epno),
                    regs::EPTCTL_RXRDYTXKL | regs::EPTCTL_RXSETUP | regs::EPTCTL_EPTENABL,
                );
                self.ien_enable(regs::int_ept(epno));
            }
            _ => {
                let mut ctl = regs::EPTCTL_EPTENABL;
                if dma {
                    // DMA slices validate their own packets.
                    ctl |= regs::EPTCTL_AUTOVALID;
                }
                if ttype == TransferType::Isochronous {
                    // STALLSNT doubles as the isochronous CRC error flag.
                    ctl |= regs::EPTCTL_STALLSNT;
                }
                self.putreg(regs::eptctlenb(epno), ctl);
                if !is_in && !dma {
                    self.arm_out(epno);
                }
            }
        }

        self.eps[epno].state = EndpointState::Idle;
        debug!(
            "ep{} configured: {:?} {:?}, {} bytes x{} in {} banks",
            epno,
            ttype,
            self.eps[epno].dir,
            geom.maxpacket,
            geom.nbtrans,
            geom.banks,
        );
        Ok(())
    }

    /// Returns an endpoint to `Disabled`, cancelling whatever it held.
    pub(super) fn ep_reset(&mut self, epno: usize) {
        self.ien_disable(regs::int_ept(epno));
        if self.eps[epno].uses_dma() {
            self.ien_disable(regs::int_dma(epno));
        }
        self.cancel_all(epno);

        self.putreg(regs::eptctldis(epno), regs::EPTCTL_ALL);
        self.putreg(regs::EPTRST, u32::from(config::ep_bit(epno)));
        let ep = &mut self.eps[epno];
        ep.state = EndpointState::Disabled;
        ep.clear_flags();
        ep.bank = 0;
        if let Some(dtd) = ep.dtd.take() {
            self.dtds.free(dtd);
        }
        self.rxpending &= !config::ep_bit(epno);
    }

    pub(super) fn epset_reset(&mut self, set: u16) {
        for epno in 0..config::NENDPOINTS {
            if set & config::ep_bit(epno) != 0 {
                self.ep_reset(epno);
            }
        }
    }

    /// Takes the head request off `epno`'s queue and queues its callback.
    pub(super) fn req_complete(&mut self, epno: usize, result: Result<()>) {
        let ep = &mut self.eps[epno];
        let Some(id) = ep.queue.dequeue() else {
            return;
        };
        if ep.state.is_transferring() {
            ep.state = EndpointState::Idle;
        }
        if let Some(dtd) = ep.dtd.take() {
            self.dtds.free(dtd);
        }
        if let Some(req) = self.requests.get_mut(id) {
            req.finish(result);
            trace!("ep{}: {:?} done, {} bytes, {:?}", epno, id, req.transferred(), result);
        }
        self.pending.push_back(Notification::Complete {
            ep: EndpointId::from_index(epno),
            req: id,
            result,
        });
    }

    /// Fails everything on `epno`'s queue with `Shutdown`.
    pub(super) fn cancel_all(&mut self, epno: usize) {
        let ep = &self.eps[epno];
        if ep.uses_dma() {
            self.ien_disable(regs::int_dma(epno));
            if ep.dtd.is_some() {
                self.putreg(regs::dmacontrol(epno), 0);
            }
        }
        if ep.is_in() {
            self.putreg(regs::eptctldis(epno), regs::EPTCTL_TXRDY);
            if !ep.is_control() {
                self.ien_disable(regs::int_ept(epno));
            }
        }

        let mut n = 0;
        while !self.eps[epno].queue.is_empty() {
            self.req_complete(epno, Err(Error::Shutdown));
            n += 1;
        }
        if n > 0 {
            debug!("ep{}: cancelled {} requests", epno, n);
        }
        let ep = &mut self.eps[epno];
        ep.txnullpkt = false;
        if ep.state.is_transferring() {
            ep.state = EndpointState::Idle;
        }
    }

    ////////////////////////////////////////////////////////////////////////
    // IN.

    /// Moves the head of an Idle IN endpoint's queue along: next packet,
    /// next DMA slice, the trailing zero-length packet, or completion.
    pub(super) fn req_write(&mut self, epno: usize) {
        while self.eps[epno].state == EndpointState::Idle {
            let Some(id) = self.eps[epno].queue.peek() else {
                self.putreg(regs::eptctldis(epno), regs::EPTCTL_TXRDY);
                return;
            };
            let Some(req) = self.requests.get_mut(id) else {
                warn!("ep{}: queued request {:?} vanished", epno, id);
                self.eps[epno].queue.dequeue();
                continue;
            };

            req.xfrd += req.inflight;
            req.inflight = 0;
            if !req.started {
                req.started = true;
                if req.is_empty() {
                    // A zero-length write is one zero-length packet.
                    self.eps[epno].txnullpkt = true;
                }
            }

            if req.remaining() > 0 {
                if self.eps[epno].uses_dma() {
                    if let Err(e) = self.dma_start(epno, id) {
                        warn!("ep{}: can't start DMA: {}", epno, e);
                        self.req_complete(epno, Err(Error::IoError));
                        continue;
                    }
                } else {
                    self.write_packet(epno, id);
                }
                return;
            }

            if self.eps[epno].txnullpkt {
                self.eps[epno].txnullpkt = false;
                self.send_zlp(epno);
                return;
            }

            self.putreg(regs::eptctldis(epno), regs::EPTCTL_TXRDY);
            self.req_complete(epno, Ok(()));
        }
    }

    /// Copies one packet of the head request into the FIFO and validates it.
    fn write_packet(&mut self, epno: usize, id: RequestId) {
        let maxpacket = usize::from(self.eps[epno].maxpacket);
        let Some(req) = self.requests.get_mut(id) else {
            return;
        };
        let remaining = req.remaining();
        let nbytes = remaining.min(maxpacket);
        let start = req.xfrd;
        req.inflight = nbytes;
        // A last packet that exactly fills the endpoint doesn't end the
        // transfer as far as the host can tell.
        self.eps[epno].txnullpkt = req.flags().contains(RequestFlags::NULLPKT)
            && nbytes == maxpacket
            && remaining == nbytes;

        self.regs.fifo_write(epno, &req.buffer()[start..start + nbytes]);
        trace!("ep{}: tx {} bytes", epno, nbytes);
        self.eps[epno].state = EndpointState::Sending;
        self.putreg(regs::eptsetsta(epno), regs::EPTSTA_TXRDY);
        self.putreg(regs::eptctlenb(epno), regs::EPTCTL_TXRDY);
        self.ien_enable(regs::int_ept(epno));
    }

    fn send_zlp(&mut self, epno: usize) {
        trace!("ep{}: tx zero-length packet", epno);
        self.eps[epno].state = EndpointState::Sending;
        self.putreg(regs::eptsetsta(epno), regs::EPTSTA_TXRDY);
        self.putreg(regs::eptctlenb(epno), regs::EPTCTL_TXRDY);
        self.ien_enable(regs::int_ept(epno));
    }

    ////////////////////////////////////////////////////////////////////////
    // OUT.

    /// Lets RX-ready interrupts through for a FIFO-driven OUT endpoint.
    fn arm_out(&mut self, epno: usize) {
        self.putreg(regs::eptctlenb(epno), regs::EPTCTL_RXRDYTXKL);
        self.ien_enable(regs::int_ept(epno));
    }

    /// Data arrived with nothing to put it in. It stays in the bank, so the
    /// host is NAKed, until a request turns up.
    pub(super) fn note_rx_pending(&mut self, epno: usize) {
        trace!("ep{}: rx data pending", epno);
        self.rxpending |= config::ep_bit(epno);
        self.putreg(regs::eptctldis(epno), regs::EPTCTL_RXRDYTXKL);
    }

    /// Starts receiving into the head of an Idle OUT endpoint's queue.
    /// Zero-length reads complete as soon as they reach the head.
    pub(super) fn start_read(&mut self, epno: usize) {
        let id = loop {
            let ep = &self.eps[epno];
            if ep.state != EndpointState::Idle {
                return;
            }
            let Some(id) = ep.queue.peek() else {
                return;
            };
            if self.requests.get(id).map_or(false, |r| r.is_empty()) {
                self.req_complete(epno, Ok(()));
                continue;
            }
            break id;
        };

        if self.eps[epno].uses_dma() {
            if let Err(e) = self.dma_start(epno, id) {
                warn!("ep{}: can't start DMA: {}", epno, e);
                self.req_complete(epno, Err(Error::IoError));
            }
            return;
        }

        self.eps[epno].state = EndpointState::Receiving;
        self.arm_out(epno);
        let bit = config::ep_bit(epno);
        if self.rxpending & bit != 0 {
            self.rxpending &= !bit;
            let sta = self.getreg(regs::eptsta(epno));
            if sta & regs::EPTSTA_RXRDYTXKL != 0 {
                self.req_read(epno, regs::eptsta_bytecnt(sta));
            }
        }
    }

    /// Takes a `pktsize` byte packet out of the FIFO into the head request.
    pub(super) fn req_read(&mut self, epno: usize, pktsize: usize) {
        let maxpacket = usize::from(self.eps[epno].maxpacket);
        let Some(id) = self.eps[epno].queue.peek() else {
            self.eps[epno].state = EndpointState::Idle;
            self.note_rx_pending(epno);
            return;
        };
        let Some(req) = self.requests.get_mut(id) else {
            return;
        };

        let readlen = pktsize.min(req.remaining());
        let start = req.xfrd;
        self.regs.fifo_read(epno, &mut req.buffer_mut()[start..start + readlen]);
        req.xfrd += readlen;
        if readlen < pktsize {
            warn!("ep{}: {} bytes didn't fit and were dropped", epno, pktsize - readlen);
        }
        let done = pktsize < maxpacket || req.remaining() == 0;
        self.putreg(regs::eptclrsta(epno), regs::EPTSTA_RXRDYTXKL);
        trace!("ep{}: rx {} bytes", epno, readlen);

        if done {
            self.req_complete(epno, Ok(()));
            self.start_read(epno);
        }
    }

    ////////////////////////////////////////////////////////////////////////
    // DMA.

    /// Hands the first slice of the head request to the endpoint's channel.
    fn dma_start(&mut self, epno: usize, id: RequestId) -> Result<()> {
        if self.eps[epno].state != EndpointState::Idle {
            return Err(Error::Busy);
        }
        if self.eps[epno].dtd.is_none() {
            let dtd = self.dtds.alloc().ok_or(Error::Busy)?;
            self.eps[epno].dtd = Some(dtd);
        }

        let ep = &self.eps[epno];
        let (is_in, maxpacket) = (ep.is_in(), usize::from(ep.maxpacket));
        let Some(req) = self.requests.get_mut(id) else {
            return Err(Error::InvalidArgs);
        };
        let remaining = req.remaining();
        req.inflight = remaining.min(self.config.dma_max_fifo);
        if is_in {
            self.eps[epno].txnullpkt =
                req.flags().contains(RequestFlags::NULLPKT) && remaining % maxpacket == 0;
        }

        self.eps[epno].state =
            if is_in { EndpointState::Sending } else { EndpointState::Receiving };
        self.dma_single(epno, id, dma::first_slice_control(is_in));
        Ok(())
    }

    /// Programs one slice: the head request's in-flight range.
    fn dma_single(&mut self, epno: usize, id: RequestId, control: u32) {
        let Some(req) = self.requests.get(id) else {
            return;
        };
        let Some(dtd) = self.eps[epno].dtd else {
            return;
        };
        let (start, end) = req.inflight_range();
        if self.eps[epno].is_in() {
            self.platform.clean_dcache(start, end);
        }

        let desc = self.dtds.get_mut(dtd);
        desc.next = 0;
        desc.addr = self.platform.phys_addr(start);
        desc.ctrl = control | regs::dmacontrol_buflen(end - start);
        let desc = *desc;

        self.putreg(regs::dmaaddress(epno), desc.addr);
        // Reading the status clears anything stale.
        let _ = self.getreg(regs::dmastatus(epno));
        self.ien_enable(regs::int_dma(epno));
        self.putreg(regs::dmacontrol(epno), 0);
        self.putreg(regs::dmacontrol(epno), desc.ctrl);
        trace!("ep{}: DMA {} bytes at {:#010x}", epno, end - start, desc.addr);
    }

    /// A DMA channel finished a slice, or failed.
    pub(super) fn dma_interrupt(&mut self, ch: usize) {
        let epno = ch;
        let status = self.getreg(regs::dmastatus(ch));
        self.modifyreg(regs::dmacontrol(ch), regs::DMACONTROL_ENDTREN | regs::DMACONTROL_ENDBEN, 0);

        let ep = &self.eps[epno];
        let Some(id) = ep.queue.peek().filter(|_| ep.state.is_transferring()) else {
            warn!("ep{}: DMA interrupt with nothing in flight, status {:#010x}", epno, status);
            self.ien_disable(regs::int_dma(ch));
            return;
        };
        let is_in = ep.is_in();

        let event = DmaEvent::decode(status);
        trace!("ep{}: DMA {:?}", epno, event);
        let unmoved = match event {
            DmaEvent::EndOfBuffer { unmoved } | DmaEvent::EndOfTransfer { unmoved } => unmoved,
            DmaEvent::Fault(status) => {
                warn!("ep{}: DMA fault, status {:#010x}", epno, status);
                self.putreg(regs::dmacontrol(ch), 0);
                self.ien_disable(regs::int_dma(ch));
                self.req_complete(epno, Err(Error::IoError));
                self.continue_queue(epno, is_in);
                return;
            }
        };

        let Some(req) = self.requests.get_mut(id) else {
            return;
        };
        let (start, _) = req.inflight_range();
        let moved = req.inflight - unmoved.min(req.inflight);
        req.xfrd += moved;
        req.inflight = 0;
        if !is_in && moved > 0 {
            self.platform.invalidate_dcache(start, start + moved);
        }

        let short = matches!(event, DmaEvent::EndOfTransfer { .. });
        if !short && req.remaining() > 0 {
            req.inflight = req.remaining().min(self.config.dma_max_fifo);
            self.dma_single(epno, id, dma::CHAINED_SLICE_CONTROL);
            return;
        }

        self.ien_disable(regs::int_dma(ch));
        if is_in && self.eps[epno].txnullpkt {
            // Data's all out; the zero-length packet still owed goes through
            // the FIFO path.
            self.eps[epno].state = EndpointState::Idle;
            self.req_write(epno);
            return;
        }
        self.req_complete(epno, Ok(()));
        self.continue_queue(epno, is_in);
    }

    fn continue_queue(&mut self, epno: usize, is_in: bool) {
        if is_in {
            self.req_write(epno);
        } else {
            self.start_read(epno);
        }
    }
}
