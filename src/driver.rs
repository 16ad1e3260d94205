// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

use crate::controller::Udphs;
use crate::endpoint::EndpointId;
use crate::error::Result;
use crate::platform::Platform;
use crate::regs::Registers;
use crate::request::RequestId;
use crate::usb::SetupPacket;

/// The upper half of the USB stack: a mass storage gadget, a serial port, a
/// composite of several, whatever.
///
/// Every method gets the controller back so it can act on the event --
/// submit the next request, configure endpoints, stall something. None of
/// them are called with the controller interrupt masked.
pub trait ClassDriver<R: Registers, P: Platform> {
    /// Called once from `Udphs::register`, before the bus comes up. An error
    /// aborts the registration.
    fn bind(&mut self, dev: &mut Udphs<R, P>) -> Result<()> {
        let _ = dev;
        Ok(())
    }

    /// Called from `Udphs::unregister`.
    fn unbind(&mut self, dev: &mut Udphs<R, P>) {
        let _ = dev;
    }

    /// A SETUP request the core didn't answer itself. For control writes,
    /// `out` holds the data stage. Returning an error stalls EP0.
    ///
    /// To answer, submit a request on `EndpointId::EP0`; a zero-length one
    /// produces a bare status stage.
    fn on_setup(
        &mut self,
        dev: &mut Udphs<R, P>,
        ctrl: &SetupPacket,
        out: Option<&[u8]>,
    ) -> Result<()>;

    /// Bus reset. Every queued request is about to come back with `Shutdown`.
    fn on_disconnect(&mut self, dev: &mut Udphs<R, P>) {
        let _ = dev;
    }

    fn on_suspend(&mut self, dev: &mut Udphs<R, P>) {
        let _ = dev;
    }

    fn on_resume(&mut self, dev: &mut Udphs<R, P>) {
        let _ = dev;
    }

    /// A submitted request is finished and belongs to the class driver again.
    fn on_complete(
        &mut self,
        dev: &mut Udphs<R, P>,
        ep: EndpointId,
        req: RequestId,
        result: Result<()>,
    );
}

/// A callback waiting for the interrupt mask to drop.
#[derive(Debug)]
pub(crate) enum Notification {
    Complete { ep: EndpointId, req: RequestId, result: Result<()> },
    Setup { ctrl: SetupPacket, out: Option<OutData> },
    Disconnect,
    Suspend,
    Resume,
}

/// Copy of an EP0 OUT data stage, so it survives until delivery.
#[derive(Copy, Clone, Debug)]
pub(crate) struct OutData {
    pub bytes: [u8; crate::config::EP0_MAXPACKET as usize],
    pub len: usize,
}

impl OutData {
    pub fn as_slice(&self) -> &[u8] {
        &self.bytes[..self.len]
    }
}
