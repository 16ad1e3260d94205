// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Stand-ins for the hardware and for a class driver.
//!
//! `MockRegs` models the slice of UDPHS behaviour the engine depends on:
//! set/clear register pairs, FIFO banks that fill and drain as the "host"
//! moves packets, interrupt status derived from endpoint state, and DMA
//! channels that finish when a test says so.

use std::cell::{Cell, RefCell};
use std::collections::VecDeque;
use std::rc::Rc;
use std::vec::Vec;

use crate::config::{NDMACHANNELS, NENDPOINTS};
use crate::controller::Udphs;
use crate::driver::ClassDriver;
use crate::endpoint::EndpointId;
use crate::error::Result;
use crate::platform::Platform;
use crate::regs::{self, Registers};
use crate::request::{RequestFlags, RequestId};
use crate::usb::SetupPacket;
use crate::Config;

#[derive(Debug)]
struct RxPacket {
    setup: bool,
    data: Vec<u8>,
}

#[derive(Debug, Default)]
struct Ept {
    cfg: u32,
    ctl: u32,
    /// Stored status bits. RXRDY, RXSETUP and BYTECNT are derived from `rx`.
    sta: u32,
    /// Bytes written to the FIFO window since the last validation.
    tx: Vec<u8>,
    /// Validated packets the host hasn't collected.
    sent: VecDeque<Vec<u8>>,
    rx: VecDeque<RxPacket>,
    read_pos: usize,
    reject_mapping: bool,
}

#[derive(Debug, Default)]
struct Dma {
    nxtdsc: u32,
    address: u32,
    control: u32,
    status: u32,
    pending: bool,
}

#[derive(Debug, Default)]
struct State {
    ctrl: u32,
    fnum: u32,
    ien: u32,
    /// INTSTA global bits, SPEED included.
    intsta: u32,
    tst: u32,
    eptrst: Vec<u32>,
    ept: [Ept; NENDPOINTS],
    dma: [Dma; NDMACHANNELS + 1],
    rewakeup_sticks: bool,
    /// CTRL reads that saw REWAKEUP still set while the interrupt was masked.
    masked_rewakeup_polls: usize,
}

#[derive(Debug, Default)]
pub struct MockRegs {
    s: RefCell<State>,
    /// The platform's mask depth, once `watch_mask` links them.
    mask: RefCell<Option<Rc<Cell<u32>>>>,
}

impl State {
    fn eptsta(&self, n: usize) -> u32 {
        let e = &self.ept[n];
        let derived = regs::EPTSTA_RXRDYTXKL | regs::EPTSTA_RXSETUP | regs::EPTSTA_BYTECNT_MASK;
        let mut sta = e.sta & !derived;
        if let Some(p) = e.rx.front() {
            sta |= if p.setup { regs::EPTSTA_RXSETUP } else { regs::EPTSTA_RXRDYTXKL };
            sta |= (p.data.len() as u32) << regs::EPTSTA_BYTECNT_SHIFT;
        }
        sta
    }

    fn ept_pending(&self, n: usize) -> bool {
        let ctl = self.ept[n].ctl;
        let sta = self.eptsta(n);
        (ctl & regs::EPTCTL_TXRDY != 0 && sta & regs::EPTSTA_TXRDY == 0)
            || (ctl & regs::EPTCTL_RXRDYTXKL != 0 && sta & regs::EPTSTA_RXRDYTXKL != 0)
            || (ctl & regs::EPTCTL_RXSETUP != 0 && sta & regs::EPTSTA_RXSETUP != 0)
            || (ctl & regs::EPTCTL_STALLSNT != 0 && sta & regs::EPTSTA_STALLSNT != 0)
    }

    fn intsta(&self) -> u32 {
        let mut v = self.intsta;
        for n in 0..NENDPOINTS {
            if self.ept_pending(n) {
                v |= regs::int_ept(n);
            }
        }
        for ch in 1..=NDMACHANNELS {
            if self.dma[ch].pending {
                v |= regs::int_dma(ch);
            }
        }
        v
    }

    fn pop_rx(&mut self, n: usize, setup: bool) {
        let e = &mut self.ept[n];
        if e.rx.front().map_or(false, |p| p.setup == setup) {
            e.rx.pop_front();
            e.read_pos = 0;
        }
    }
}

/// Which register an offset names, for the endpoint and DMA banks.
fn decode(offset: usize) -> Option<(usize, usize, usize)> {
    match offset {
        0x100..=0x2ff => Some((0, (offset - 0x100) / 0x20, (offset - 0x100) % 0x20)),
        0x300..=0x37f => Some((1, (offset - 0x300) / 0x10, (offset - 0x300) % 0x10)),
        _ => None,
    }
}

impl Registers for MockRegs {
    fn read(&self, offset: usize) -> u32 {
        let mut s = self.s.borrow_mut();
        match offset {
            regs::CTRL => {
                let v = s.ctrl;
                let masked = self.mask.borrow().as_ref().map_or(false, |d| d.get() > 0);
                if masked && v & regs::CTRL_REWAKEUP != 0 {
                    s.masked_rewakeup_polls += 1;
                }
                if !s.rewakeup_sticks {
                    s.ctrl &= !regs::CTRL_REWAKEUP;
                }
                v
            }
            regs::FNUM => s.fnum,
            regs::IEN => s.ien,
            regs::INTSTA => s.intsta(),
            regs::TST => s.tst,
            _ => match decode(offset) {
                Some((0, n, 0x00)) => {
                    let e = &s.ept[n];
                    if e.reject_mapping {
                        e.cfg & !regs::EPTCFG_MAPD
                    } else {
                        e.cfg | regs::EPTCFG_MAPD
                    }
                }
                Some((0, n, 0x0c)) => s.ept[n].ctl,
                Some((0, n, 0x1c)) => s.eptsta(n),
                Some((1, ch, 0x0)) => s.dma[ch].nxtdsc,
                Some((1, ch, 0x4)) => s.dma[ch].address,
                Some((1, ch, 0x8)) => s.dma[ch].control,
                Some((1, ch, 0xc)) => {
                    let d = &mut s.dma[ch];
                    d.pending = false;
                    core::mem::take(&mut d.status)
                }
                _ => 0,
            },
        }
    }

    fn write(&self, offset: usize, value: u32) {
        let mut s = self.s.borrow_mut();
        match offset {
            regs::CTRL => s.ctrl = value,
            regs::IEN => s.ien = value,
            regs::CLRINT => s.intsta &= !(value & regs::INT_CLEARABLE),
            regs::EPTRST => {
                s.eptrst.push(value);
                for n in (0..NENDPOINTS).filter(|n| value & (1 << n) != 0) {
                    let e = &mut s.ept[n];
                    e.tx.clear();
                    e.sent.clear();
                    e.rx.clear();
                    e.read_pos = 0;
                    e.sta &= !regs::EPTSTA_TXRDY;
                }
            }
            regs::TST => s.tst = value,
            _ => match decode(offset) {
                Some((0, n, 0x00)) => s.ept[n].cfg = value & !regs::EPTCFG_MAPD,
                Some((0, n, 0x04)) => s.ept[n].ctl |= value,
                Some((0, n, 0x08)) => s.ept[n].ctl &= !value,
                Some((0, n, 0x14)) => {
                    let e = &mut s.ept[n];
                    if value & regs::EPTSTA_TXRDY != 0 {
                        let pkt = core::mem::take(&mut e.tx);
                        e.sent.push_back(pkt);
                        e.sta |= regs::EPTSTA_TXRDY;
                    }
                    e.sta |= value & regs::EPTSTA_FRCESTALL;
                }
                Some((0, n, 0x18)) => {
                    if value & regs::EPTSTA_RXRDYTXKL != 0 {
                        s.pop_rx(n, false);
                    }
                    if value & regs::EPTSTA_RXSETUP != 0 {
                        s.pop_rx(n, true);
                    }
                    s.ept[n].sta &= !(value
                        & (regs::EPTSTA_FRCESTALL
                            | regs::EPTSTA_TOGGLESQ
                            | regs::EPTSTA_STALLSNT
                            | regs::EPTSTA_TXCOMPLT));
                }
                Some((1, ch, 0x0)) => s.dma[ch].nxtdsc = value,
                Some((1, ch, 0x4)) => s.dma[ch].address = value,
                Some((1, ch, 0x8)) => s.dma[ch].control = value,
                _ => {}
            },
        }
    }

    fn fifo_write(&self, epno: usize, data: &[u8]) {
        self.s.borrow_mut().ept[epno].tx.extend_from_slice(data);
    }

    fn fifo_read(&self, epno: usize, data: &mut [u8]) {
        let mut s = self.s.borrow_mut();
        let e = &mut s.ept[epno];
        let Some(p) = e.rx.front() else {
            data.fill(0);
            return;
        };
        for (i, b) in data.iter_mut().enumerate() {
            *b = p.data.get(e.read_pos + i).copied().unwrap_or(0);
        }
        e.read_pos += data.len();
    }
}

impl MockRegs {
    /// The host sends a SETUP packet to `epno`.
    pub fn host_setup(&self, epno: usize, setup: &SetupPacket) {
        let data = zerocopy::AsBytes::as_bytes(setup).to_vec();
        self.s.borrow_mut().ept[epno].rx.push_back(RxPacket { setup: true, data });
    }

    /// The host sends an OUT data packet to `epno`.
    pub fn host_out(&self, epno: usize, data: &[u8]) {
        self.s.borrow_mut().ept[epno].rx.push_back(RxPacket { setup: false, data: data.to_vec() });
    }

    /// The host collects the validated IN packet on `epno`, if there is one.
    pub fn host_in(&self, epno: usize) -> Option<Vec<u8>> {
        let mut s = self.s.borrow_mut();
        let e = &mut s.ept[epno];
        if e.sta & regs::EPTSTA_FRCESTALL != 0 {
            e.sta |= regs::EPTSTA_STALLSNT;
            return None;
        }
        let pkt = e.sent.pop_front()?;
        if e.sent.is_empty() {
            e.sta &= !regs::EPTSTA_TXRDY;
        }
        Some(pkt)
    }

    /// Packets sitting in `epno`'s OUT banks.
    pub fn rx_waiting(&self, epno: usize) -> usize {
        self.s.borrow().ept[epno].rx.len()
    }

    /// Raises global interrupt bits (DETSUSPD, ENDRESET and friends).
    pub fn raise(&self, bits: u32) {
        self.s.borrow_mut().intsta |= bits;
    }

    /// DMA channel `ch` finishes with `status`.
    pub fn finish_dma(&self, ch: usize, status: u32) {
        let mut s = self.s.borrow_mut();
        let d = &mut s.dma[ch];
        d.status = status;
        d.pending = true;
        d.control &= !regs::DMACONTROL_CHANNENB;
    }

    pub fn dma_control(&self, ch: usize) -> u32 {
        self.s.borrow().dma[ch].control
    }

    pub fn dma_address(&self, ch: usize) -> u32 {
        self.s.borrow().dma[ch].address
    }

    pub fn set_high_speed(&self, high: bool) {
        let mut s = self.s.borrow_mut();
        if high {
            s.intsta |= regs::INTSTA_SPEED;
        } else {
            s.intsta &= !regs::INTSTA_SPEED;
        }
    }

    pub fn set_frame(&self, fnum: u32) {
        self.s.borrow_mut().fnum = fnum;
    }

    /// EPTCFG writes for `epno` won't map.
    pub fn reject_mapping(&self, epno: usize) {
        self.s.borrow_mut().ept[epno].reject_mapping = true;
    }

    /// REWAKEUP never clears, as if the hardware hung.
    pub fn stick_rewakeup(&self) {
        self.s.borrow_mut().rewakeup_sticks = true;
    }

    /// Lets the register file see whether `platform` has the interrupt
    /// masked.
    pub fn watch_mask(&self, platform: &MockPlatform) {
        *self.mask.borrow_mut() = Some(platform.depth.clone());
    }

    pub fn masked_rewakeup_polls(&self) -> usize {
        self.s.borrow().masked_rewakeup_polls
    }

    /// How many EPTRST writes have hit `epno`.
    pub fn resets(&self, epno: usize) -> usize {
        self.s.borrow().eptrst.iter().filter(|&&v| v & (1 << epno) != 0).count()
    }

    pub fn ctrl(&self) -> u32 {
        self.s.borrow().ctrl
    }

    pub fn ien(&self) -> u32 {
        self.s.borrow().ien
    }

    pub fn eptcfg(&self, epno: usize) -> u32 {
        self.s.borrow().ept[epno].cfg
    }

    pub fn eptctl(&self, epno: usize) -> u32 {
        self.s.borrow().ept[epno].ctl
    }

    pub fn eptsta(&self, epno: usize) -> u32 {
        self.s.borrow().eptsta(epno)
    }
}

////////////////////////////////////////////////////////////////////////////
// Platform.

#[derive(Debug, Default)]
pub struct MockPlatform {
    depth: Rc<Cell<u32>>,
    pub irq_enabled: Cell<bool>,
    pub clock: Cell<bool>,
    pub cleaned: RefCell<Vec<(usize, usize)>>,
    pub invalidated: RefCell<Vec<(usize, usize)>>,
    pub board_suspends: RefCell<Vec<bool>>,
}

impl MockPlatform {
    pub fn is_masked(&self) -> bool {
        self.depth.get() > 0
    }
}

impl Platform for MockPlatform {
    fn mask_irq(&self) -> bool {
        let was_unmasked = self.depth.get() == 0;
        self.depth.set(self.depth.get() + 1);
        was_unmasked
    }

    fn restore_irq(&self, _was_enabled: bool) {
        self.depth.set(self.depth.get() - 1);
    }

    fn enable_irq(&self) {
        self.irq_enabled.set(true);
    }

    fn disable_irq(&self) {
        self.irq_enabled.set(false);
    }

    fn enable_clock(&self) {
        self.clock.set(true);
    }

    fn disable_clock(&self) {
        self.clock.set(false);
    }

    fn clean_dcache(&self, start: usize, end: usize) {
        self.cleaned.borrow_mut().push((start, end));
    }

    fn invalidate_dcache(&self, start: usize, end: usize) {
        self.invalidated.borrow_mut().push((start, end));
    }

    fn board_suspend(&self, resume: bool) {
        self.board_suspends.borrow_mut().push(resume);
    }
}

////////////////////////////////////////////////////////////////////////////
// Class driver.

pub type Dev = Udphs<MockRegs, MockPlatform>;

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Event {
    Bind,
    Unbind,
    Setup { request: u8, out: Option<Vec<u8>> },
    Disconnect,
    Suspend,
    Resume,
    Complete { ep: u8, req: RequestId, result: Result<()>, transferred: usize },
}

/// Records everything it's told, and answers SETUPs the way it was set up
/// to.
pub struct RecordingDriver {
    pub log: Rc<RefCell<Vec<Event>>>,
    /// What `on_setup` returns.
    pub setup_result: Result<()>,
    /// If set, `on_setup` submits these bytes on EP0 as the data stage.
    pub reply: Option<Vec<u8>>,
    /// Flags for the reply request.
    pub reply_flags: RequestFlags,
    /// If set, completed requests go straight back on their endpoint.
    pub resubmit: bool,
    /// Set if a callback ever ran with the interrupt masked.
    pub saw_mask: Rc<Cell<bool>>,
}

impl Default for RecordingDriver {
    fn default() -> Self {
        Self {
            log: Rc::default(),
            setup_result: Ok(()),
            reply: None,
            reply_flags: RequestFlags::NONE,
            resubmit: false,
            saw_mask: Rc::default(),
        }
    }
}

impl RecordingDriver {
    fn note(&self, dev: &Dev, event: Event) {
        if dev.platform().is_masked() {
            self.saw_mask.set(true);
        }
        self.log.borrow_mut().push(event);
    }
}

impl ClassDriver<MockRegs, MockPlatform> for RecordingDriver {
    fn bind(&mut self, dev: &mut Dev) -> Result<()> {
        self.note(dev, Event::Bind);
        Ok(())
    }

    fn unbind(&mut self, dev: &mut Dev) {
        self.note(dev, Event::Unbind);
    }

    fn on_setup(&mut self, dev: &mut Dev, ctrl: &SetupPacket, out: Option<&[u8]>) -> Result<()> {
        self.note(dev, Event::Setup { request: ctrl.request, out: out.map(|o| o.to_vec()) });
        if let Some(reply) = &self.reply {
            let id = dev.allocate_request()?;
            let req = dev.request_mut(id)?;
            req.set_buffer(reply.clone());
            req.set_flags(self.reply_flags);
            dev.submit(EndpointId::EP0, id)?;
        }
        self.setup_result
    }

    fn on_disconnect(&mut self, dev: &mut Dev) {
        self.note(dev, Event::Disconnect);
    }

    fn on_suspend(&mut self, dev: &mut Dev) {
        self.note(dev, Event::Suspend);
    }

    fn on_resume(&mut self, dev: &mut Dev) {
        self.note(dev, Event::Resume);
    }

    fn on_complete(&mut self, dev: &mut Dev, ep: EndpointId, req: RequestId, result: Result<()>) {
        let transferred = dev.request(req).map_or(0, |r| r.transferred());
        self.note(dev, Event::Complete { ep: ep.number(), req, result, transferred });
        if self.resubmit && result.is_ok() {
            let _ = dev.submit(ep, req);
        }
    }
}

/// A controller with a `RecordingDriver` bound and the bus reset, plus the
/// driver's event log.
pub fn bound(config: Config, driver: RecordingDriver) -> (Dev, Rc<RefCell<Vec<Event>>>) {
    let log = driver.log.clone();
    let (regs, platform) = (MockRegs::default(), MockPlatform::default());
    regs.watch_mask(&platform);
    let mut dev = Udphs::new(regs, platform, config).unwrap();
    dev.register(std::boxed::Box::new(driver)).unwrap();
    (dev, log)
}

/// Takes the events logged so far.
pub fn drain(log: &Rc<RefCell<Vec<Event>>>) -> Vec<Event> {
    core::mem::take(&mut *log.borrow_mut())
}
