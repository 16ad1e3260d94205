// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! The controller context and the device-level operations.
//!
//! The work is split across a few files by who starts it:
//!
//! - here: construction, driver binding, device-wide knobs, and the two
//!   pieces of plumbing everything else leans on (`critical` and `deliver`);
//! - `transfer`: endpoint configuration and moving request data, both by the
//!   FIFO and by DMA;
//! - `interrupt`: the top-level interrupt dispatcher and bus events;
//! - `setup`: EP0 control transfers.

mod interrupt;
mod setup;
mod transfer;


use alloc::boxed::Box;
use alloc::collections::VecDeque;
use core::fmt;

use log::{debug, info, trace, warn};

use crate::config::{self, Config, EPSET_ALL, EPSET_NOTEP0, NDMACHANNELS, NENDPOINTS};
use crate::dma::DtdPool;
use crate::driver::{ClassDriver, Notification};
use crate::endpoint::{Endpoint, EndpointId, EndpointState};
use crate::ep0::Ep0Outcome;
use crate::error::{Error, Result};
use crate::platform::Platform;
use crate::regs::{self, Registers};
use crate::request::{Request, RequestId, RequestPool};
use crate::usb::{SetupPacket, TransferType, UsbDir, ENDPOINT_NUMBER_MASK};

/// Where the device is on the bus, per USB 2.0 chapter 9.
///
/// Ordered, so "at least `Powered`" is a comparison.
#[derive(Copy, Clone, Debug, PartialEq, Eq, PartialOrd, Ord)]
pub enum DeviceState {
    Suspended,
    Attached,
    Powered,
    Default,
    Address,
    Configured,
}

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum Speed {
    Full,
    High,
}

/// One UDPHS controller and everything the driver knows about it.
pub struct Udphs<R: Registers, P: Platform> {
    regs: R,
    platform: P,
    config: Config,

    devstate: DeviceState,
    /// What to go back to when a suspend ends.
    prevstate: DeviceState,
    /// Address from SET_ADDRESS. Not in effect until its status stage is out.
    devaddr: u8,
    selfpowered: bool,
    /// Bit n set if OUT data arrived on endpoint n with nothing queued.
    rxpending: u16,
    /// Bit n set if endpoint n can be handed out by `allocate_endpoint`.
    epavail: u16,

    /// The SETUP packet being worked on.
    ctrl: SetupPacket,
    /// EP0 OUT data stage of a control write.
    ep0out: [u8; config::EP0_MAXPACKET as usize],
    /// How the most recent SETUP packet was resolved.
    lastsetup: Option<Ep0Outcome>,

    eps: [Endpoint; NENDPOINTS],
    requests: RequestPool,
    dtds: DtdPool,

    /// Callbacks owed to the class driver, oldest first.
    pending: VecDeque<Notification>,
    /// Set while `deliver` is running, so re-entrant calls leave the queue
    /// to the outer loop.
    delivering: bool,
    driver: Option<Box<dyn ClassDriver<R, P>>>,
}

impl<R: Registers, P: Platform> fmt::Debug for Udphs<R, P> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Udphs")
            .field("devstate", &self.devstate)
            .field("prevstate", &self.prevstate)
            .field("devaddr", &self.devaddr)
            .field("selfpowered", &self.selfpowered)
            .field("rxpending", &format_args!("{:#06x}", self.rxpending))
            .field("epavail", &format_args!("{:#06x}", self.epavail))
            .field("eps", &self.eps)
            .field("pending", &self.pending.len())
            .field("driver", &self.driver.is_some())
            .finish()
    }
}

impl<R: Registers, P: Platform> Udphs<R, P> {
    /// Takes the controller from whatever state the boot loader left it in to
    /// enabled, detached from the bus, and waiting for a class driver.
    pub fn new(regs: R, platform: P, config: Config) -> Result<Self> {
        config.validate()?;
        let dtds = DtdPool::new(config.ndtds);
        let mut dev = Self {
            regs,
            platform,
            config,
            devstate: DeviceState::Suspended,
            prevstate: DeviceState::Powered,
            devaddr: 0,
            selfpowered: false,
            rxpending: 0,
            epavail: EPSET_NOTEP0,
            ctrl: SetupPacket::new(0, 0, 0, 0, 0),
            ep0out: [0; config::EP0_MAXPACKET as usize],
            lastsetup: None,
            eps: core::array::from_fn(|i| Endpoint::new(i as u8)),
            requests: RequestPool::default(),
            dtds,
            pending: VecDeque::new(),
            delivering: false,
            driver: None,
        };
        dev.critical(|dev| dev.hw_setup());
        debug!("UDPHS initialized");
        Ok(dev)
    }

    pub fn registers(&self) -> &R {
        &self.regs
    }

    pub fn platform(&self) -> &P {
        &self.platform
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    ////////////////////////////////////////////////////////////////////////
    // Plumbing.

    /// Runs `f` with the controller interrupt masked. This is the one lock.
    pub(crate) fn critical<T>(&mut self, f: impl FnOnce(&mut Self) -> T) -> T {
        let saved = self.platform.mask_irq();
        let out = f(self);
        self.platform.restore_irq(saved);
        out
    }

    /// Hands queued notifications to the class driver. Must be called with
    /// the interrupt unmasked; everything that queues notifications calls
    /// this on its way out.
    pub(crate) fn deliver(&mut self) {
        if self.delivering {
            return;
        }
        self.delivering = true;
        while let Some(note) = self.pending.pop_front() {
            let Some(mut driver) = self.driver.take() else {
                trace!("no class driver for {:?}", note);
                continue;
            };
            let mut setup_failed = false;
            match note {
                Notification::Complete { ep, req, result } => {
                    trace!("ep{} request {:?} complete: {:?}", ep.number(), req, result);
                    driver.on_complete(self, ep, req, result);
                }
                Notification::Setup { ctrl, out } => {
                    let data = out.as_ref().map(|o| o.as_slice());
                    if let Err(e) = driver.on_setup(self, &ctrl, data) {
                        warn!("class driver refused SETUP {:?}: {}", ctrl, e);
                        setup_failed = true;
                    }
                }
                Notification::Disconnect => driver.on_disconnect(self),
                Notification::Suspend => driver.on_suspend(self),
                Notification::Resume => driver.on_resume(self),
            }
            if self.driver.is_none() {
                self.driver = Some(driver);
            }
            if setup_failed {
                self.critical(|dev| dev.stall_locked(config::EP0, false));
            }
        }
        self.delivering = false;
    }

    pub(crate) fn getreg(&self, offset: usize) -> u32 {
        self.regs.read(offset)
    }

    pub(crate) fn putreg(&self, offset: usize, value: u32) {
        self.regs.write(offset, value);
    }

    pub(crate) fn modifyreg(&self, offset: usize, clear: u32, set: u32) {
        let v = self.regs.read(offset);
        self.regs.write(offset, (v & !clear) | set);
    }

    pub(crate) fn ien_enable(&self, bits: u32) {
        self.modifyreg(regs::IEN, 0, bits);
    }

    pub(crate) fn ien_disable(&self, bits: u32) {
        self.modifyreg(regs::IEN, bits, 0);
    }

    ////////////////////////////////////////////////////////////////////////
    // Class driver binding.

    /// Binds a class driver and connects to the bus.
    pub fn register(&mut self, mut driver: Box<dyn ClassDriver<R, P>>) -> Result<()> {
        if self.driver.is_some() {
            warn!("class driver already registered");
            return Err(Error::Busy);
        }
        driver.bind(self).map_err(|e| {
            warn!("class driver bind failed: {}", e);
            e
        })?;
        self.driver = Some(driver);
        info!("class driver bound");

        self.critical(|dev| dev.bus_reset());
        self.platform.enable_irq();
        self.set_pullup(true);
        self.deliver();
        Ok(())
    }

    /// Disconnects from the bus and hands the class driver back. The
    /// controller is left ready for the next `register`.
    pub fn unregister(&mut self) -> Result<Box<dyn ClassDriver<R, P>>> {
        if self.delivering {
            // The driver is on loan to its own callback.
            return Err(Error::Busy);
        }
        if self.driver.is_none() {
            return Err(Error::InvalidArgs);
        }

        self.critical(|dev| dev.bus_reset());
        self.deliver();

        let mut driver = self.driver.take().ok_or(Error::InvalidArgs)?;
        driver.unbind(self);
        self.platform.disable_irq();
        self.critical(|dev| {
            dev.hw_shutdown();
            dev.hw_setup();
        });
        // Nobody is left to hear about anything the unbind kicked off.
        self.deliver();
        info!("class driver unbound");
        Ok(driver)
    }

    ////////////////////////////////////////////////////////////////////////
    // Device-wide operations.

    pub fn device_state(&self) -> DeviceState {
        self.devstate
    }

    /// How the core resolved the last SETUP packet, if there has been one.
    pub fn last_setup(&self) -> Option<Ep0Outcome> {
        self.lastsetup
    }

    /// The address the host gave us, once it's in effect.
    pub fn address(&self) -> u8 {
        (self.getreg(regs::CTRL) & regs::CTRL_DEVADDR_MASK) as u8
    }

    pub fn speed(&self) -> Speed {
        if self.getreg(regs::INTSTA) & regs::INTSTA_SPEED != 0 {
            Speed::High
        } else {
            Speed::Full
        }
    }

    /// Current USB frame number.
    pub fn frame_number(&self) -> u16 {
        ((self.getreg(regs::FNUM) & regs::FNUM_FRAMENUM_MASK) >> regs::FNUM_FRAMENUM_SHIFT) as u16
    }

    /// Whether GET_STATUS reports us as self-powered.
    pub fn set_self_powered(&mut self, selfpowered: bool) {
        self.critical(|dev| dev.selfpowered = selfpowered);
    }

    /// Connects to (`true`) or detaches from the bus.
    pub fn set_pullup(&mut self, enable: bool) {
        debug!("pullup {}", if enable { "on" } else { "off" });
        self.critical(|dev| dev.pullup(enable));
    }

    pub(crate) fn pullup(&mut self, enable: bool) {
        if enable {
            self.modifyreg(regs::CTRL, 0, regs::CTRL_PULLDDIS);
            self.modifyreg(regs::CTRL, regs::CTRL_DETACH, 0);
        } else {
            self.modifyreg(regs::CTRL, 0, regs::CTRL_DETACH);
            self.modifyreg(regs::CTRL, regs::CTRL_PULLDDIS, 0);
            if self.devstate > DeviceState::Powered {
                self.devstate = DeviceState::Powered;
            }
        }
    }

    /// Signals remote wakeup to the host.
    pub fn wakeup(&mut self) -> Result<()> {
        self.critical(|dev| {
            dev.resume();
            dev.modifyreg(regs::CTRL, 0, regs::CTRL_REWAKEUP);
        });
        self.deliver();

        // The bit clears itself once resume signalling is done.
        for _ in 0..self.config.wakeup_spin_limit {
            if self.getreg(regs::CTRL) & regs::CTRL_REWAKEUP == 0 {
                return Ok(());
            }
            core::hint::spin_loop();
        }
        warn!("remote wakeup never finished");
        Err(Error::IoError)
    }

    ////////////////////////////////////////////////////////////////////////
    // Endpoint reservation.

    /// Reserves an endpoint. `logical_addr` 0 takes the lowest free one;
    /// anything else asks for that endpoint number specifically.
    pub fn allocate_endpoint(
        &mut self,
        logical_addr: u8,
        dir: UsbDir,
        ttype: TransferType,
    ) -> Option<EndpointId> {
        let epno = usize::from(logical_addr & ENDPOINT_NUMBER_MASK);
        let wanted = if epno == 0 { EPSET_NOTEP0 } else { config::ep_bit(epno) };
        self.critical(|dev| {
            let avail = wanted & dev.epavail;
            if avail == 0 {
                warn!("no endpoint available for {:#04x}", logical_addr);
                return None;
            }
            let epno = avail.trailing_zeros() as usize;
            dev.epavail &= !config::ep_bit(epno);
            let ep = &mut dev.eps[epno];
            ep.dir = dir;
            ep.ttype = ttype;
            debug!("allocated ep{} {:?} {:?}", epno, dir, ttype);
            EndpointId::new(epno as u8)
        })
    }

    /// Returns an endpoint to the pool.
    pub fn free_endpoint(&mut self, ep: EndpointId) {
        if ep == EndpointId::EP0 {
            warn!("EP0 is never allocated");
            return;
        }
        self.critical(|dev| dev.epavail |= config::ep_bit(ep.index()));
    }

    ////////////////////////////////////////////////////////////////////////
    // Request arena.

    pub fn allocate_request(&mut self) -> Result<RequestId> {
        self.critical(|dev| dev.requests.alloc())
    }

    /// Destroys a request the class driver owns, handing back its contents.
    pub fn free_request(&mut self, id: RequestId) -> Result<Request> {
        self.critical(|dev| dev.requests.free(id))
    }

    pub fn request(&self, id: RequestId) -> Option<&Request> {
        self.requests.get(id)
    }

    /// Only requests the class driver owns are writable.
    pub fn request_mut(&mut self, id: RequestId) -> Result<&mut Request> {
        let req = self.requests.get_mut(id).ok_or(Error::InvalidArgs)?;
        if req.is_queued() {
            return Err(Error::Busy);
        }
        Ok(req)
    }

    ////////////////////////////////////////////////////////////////////////
    // Observers.

    pub fn endpoint_state(&self, ep: EndpointId) -> EndpointState {
        self.eps[ep.index()].state
    }

    pub fn is_stalled(&self, ep: EndpointId) -> bool {
        self.eps[ep.index()].stalled
    }

    pub fn is_halted(&self, ep: EndpointId) -> bool {
        self.eps[ep.index()].halted
    }

    pub fn max_packet(&self, ep: EndpointId) -> u16 {
        self.eps[ep.index()].maxpacket
    }

    /// Requests waiting on `ep`, the in-flight one included.
    pub fn queued(&self, ep: EndpointId) -> usize {
        self.eps[ep.index()].queue.len()
    }

    ////////////////////////////////////////////////////////////////////////
    // Hardware bring-up and teardown.

    fn hw_setup(&mut self) {
        self.platform.enable_clock();

        self.putreg(regs::EPTRST, u32::from(EPSET_ALL));
        self.modifyreg(regs::CTRL, 0, regs::CTRL_DETACH);

        // Cycling EN_UDPHS resets the controller's internal state.
        self.modifyreg(regs::CTRL, regs::CTRL_ENUDPHS, 0);
        self.modifyreg(regs::CTRL, 0, regs::CTRL_ENUDPHS);

        for ch in 1..=NDMACHANNELS {
            self.putreg(regs::dmacontrol(ch), 0);
            self.putreg(regs::dmanxtdsc(ch), 0);
            self.putreg(regs::dmaaddress(ch), 0);
            // Reading the status clears anything left pending.
            let _ = self.getreg(regs::dmastatus(ch));
        }

        for epno in 0..NENDPOINTS {
            self.putreg(regs::eptctldis(epno), regs::EPTCTL_ALL);
            self.putreg(
                regs::eptclrsta(epno),
                regs::EPTSTA_TOGGLESQ
                    | regs::EPTSTA_FRCESTALL
                    | regs::EPTSTA_RXRDYTXKL
                    | regs::EPTSTA_TXCOMPLT
                    | regs::EPTSTA_RXSETUP
                    | regs::EPTSTA_STALLSNT,
            );
        }

        // Normal mode, full speed not forced.
        self.putreg(regs::TST, 0);

        self.putreg(regs::IEN, 0);
        self.putreg(regs::CLRINT, regs::INT_CLEARABLE);
        self.putreg(
            regs::IEN,
            regs::INT_ENDRESET | regs::INT_ENDOFRSM | regs::INT_WAKEUP | regs::INT_DETSUSPD,
        );
    }

    fn hw_shutdown(&mut self) {
        self.putreg(regs::IEN, 0);
        self.putreg(regs::CLRINT, regs::INT_CLEARABLE);
        self.pullup(false);
        self.platform.disable_clock();
    }

    /// Programs the bus address. Zero means back to `Default`.
    pub(crate) fn set_devaddr(&mut self, addr: u8) {
        if addr != 0 {
            self.modifyreg(
                regs::CTRL,
                regs::CTRL_DEVADDR_MASK,
                (u32::from(addr) & regs::CTRL_DEVADDR_MASK) | regs::CTRL_FADDREN,
            );
            self.devstate = DeviceState::Address;
        } else {
            self.modifyreg(regs::CTRL, regs::CTRL_DEVADDR_MASK | regs::CTRL_FADDREN, 0);
            self.devstate = DeviceState::Default;
        }
        debug!("address {} -> {:?}", addr, self.devstate);
    }
}
