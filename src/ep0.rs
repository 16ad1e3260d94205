// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Deciding what to do about a SETUP packet.
//!
//! The core answers a handful of standard requests by itself: the ones
//! that are about the bus and the endpoints rather than about what the device
//! _is_. Everything else (descriptors, configurations, interfaces, and every
//! class or vendor request) goes to the class driver.
//!
//! `decide` is pure: it looks at the packet and a snapshot of device state
//! and says what should happen. The controller then does it.

use crate::config::NENDPOINTS;
use crate::usb::{
    Recipient, RequestKind, SetupPacket, StandardRequest, UsbDir, FEATURE_ENDPOINT_HALT,
    FEATURE_TEST_MODE,
};

/// How a SETUP packet was resolved.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum Ep0Outcome {
    /// Answered locally; the response (maybe empty) is going out.
    Success,
    /// Handed to the class driver.
    Dispatched,
    /// SET_ADDRESS accepted; the address applies after the status stage.
    Address,
    /// Refused; EP0 is stalled.
    Stall,
}

/// Up to two bytes of locally generated response.
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq)]
pub(crate) struct Response {
    bytes: [u8; 2],
    len: usize,
}

impl Response {
    pub const EMPTY: Self = Self { bytes: [0; 2], len: 0 };

    fn status(word: u16) -> Self {
        Self { bytes: word.to_le_bytes(), len: 2 }
    }

    /// The host never gets more than it asked for.
    fn clipped(mut self, length: u16) -> Self {
        self.len = self.len.min(usize::from(length));
        self
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.bytes[..self.len]
    }
}

/// What the controller needs to know about itself to answer requests.
#[derive(Copy, Clone, Debug)]
pub(crate) struct Ep0Context {
    pub self_powered: bool,
    /// Bit n set if endpoint n is stalled.
    pub stalled: u16,
}

/// The decision for one SETUP packet.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub(crate) enum Ep0Action {
    /// Send this back and finish with a status stage.
    Reply(Response),
    /// Record the address, send an empty status packet, apply afterwards.
    SetAddress(u8),
    /// Halt (`true`) or un-halt endpoint `epno`, then reply with nothing.
    Halt { epno: u8, halt: bool },
    /// The class driver's problem.
    Dispatch,
    /// Protocol stall.
    Stall,
}

pub(crate) fn decide(setup: &SetupPacket, ctx: &Ep0Context) -> Ep0Action {
    if setup.kind() != RequestKind::Standard {
        return Ep0Action::Dispatch;
    }

    let value = setup.value();
    let index = setup.index();
    let length = setup.length();
    let recipient = setup.recipient();

    let Some(request) = setup.standard_request() else {
        log::warn!("unsupported standard request {:#04x}", setup.request);
        return Ep0Action::Stall;
    };

    match request {
        StandardRequest::GetStatus => {
            if length != 2 || setup.direction() != UsbDir::In || index & 0xff00 != 0 || value != 0 {
                log::warn!("malformed GET_STATUS {:?}", setup);
                return Ep0Action::Stall;
            }
            match recipient {
                Some(Recipient::Device) if index == 0 => {
                    // Remote wakeup is always reported as available.
                    let word = u16::from(ctx.self_powered) | 1 << 1;
                    Ep0Action::Reply(Response::status(word).clipped(length))
                }
                Some(Recipient::Endpoint) => {
                    let epno = endpoint_from_index(index);
                    if usize::from(epno) >= NENDPOINTS {
                        log::warn!("GET_STATUS for bad endpoint {:#x}", index);
                        return Ep0Action::Stall;
                    }
                    let halted = ctx.stalled & (1 << epno) != 0;
                    Ep0Action::Reply(Response::status(u16::from(halted)).clipped(length))
                }
                Some(Recipient::Interface) => Ep0Action::Reply(Response::status(0).clipped(length)),
                _ => {
                    log::warn!("GET_STATUS for bad recipient {:?}", setup);
                    Ep0Action::Stall
                }
            }
        }

        StandardRequest::ClearFeature | StandardRequest::SetFeature => {
            let halt = request == StandardRequest::SetFeature;
            match recipient {
                Some(Recipient::Endpoint) => {
                    let epno = endpoint_from_index(index);
                    if value != FEATURE_ENDPOINT_HALT
                        || length != 0
                        || index & 0xff00 != 0
                        || usize::from(epno) >= NENDPOINTS
                    {
                        log::warn!("malformed endpoint feature request {:?}", setup);
                        return Ep0Action::Stall;
                    }
                    if epno == 0 {
                        // Halting EP0 is just a protocol stall, and it
                        // clears itself at the next SETUP.
                        return if halt {
                            Ep0Action::Stall
                        } else {
                            Ep0Action::Reply(Response::EMPTY)
                        };
                    }
                    Ep0Action::Halt { epno, halt }
                }
                Some(Recipient::Device) if halt && value == FEATURE_TEST_MODE => {
                    // Accepted so compliance tooling moves on, but the
                    // controller isn't put into test mode.
                    log::info!("TEST_MODE selector {:#x} requested", index >> 8);
                    Ep0Action::Reply(Response::EMPTY)
                }
                _ => Ep0Action::Dispatch,
            }
        }

        StandardRequest::SetAddress => {
            if recipient != Some(Recipient::Device) || index != 0 || length != 0 || value > 127 {
                log::warn!("malformed SET_ADDRESS {:?}", setup);
                return Ep0Action::Stall;
            }
            Ep0Action::SetAddress(value as u8)
        }

        StandardRequest::GetDescriptor | StandardRequest::SetDescriptor => {
            if recipient != Some(Recipient::Device) {
                log::warn!("descriptor request for bad recipient {:?}", setup);
                return Ep0Action::Stall;
            }
            Ep0Action::Dispatch
        }

        StandardRequest::GetConfiguration => {
            if recipient == Some(Recipient::Device) && value == 0 && index == 0 && length == 1 {
                Ep0Action::Dispatch
            } else {
                log::warn!("malformed GET_CONFIGURATION {:?}", setup);
                Ep0Action::Stall
            }
        }

        StandardRequest::SetConfiguration => {
            if recipient == Some(Recipient::Device) && index == 0 && length == 0 {
                Ep0Action::Dispatch
            } else {
                log::warn!("malformed SET_CONFIGURATION {:?}", setup);
                Ep0Action::Stall
            }
        }

        StandardRequest::GetInterface | StandardRequest::SetInterface => Ep0Action::Dispatch,

        StandardRequest::SynchFrame => {
            // Nothing here uses isochronous frame sync; answer with an empty
            // status stage.
            log::debug!("SYNCH_FRAME for endpoint {:#x}", index);
            Ep0Action::Reply(Response::EMPTY)
        }
    }
}

/// Endpoint number from a `wIndex` endpoint address, direction bit dropped.
fn endpoint_from_index(index: u16) -> u8 {
    (index & 0x7f) as u8
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    const CTX: Ep0Context = Ep0Context { self_powered: false, stalled: 0 };

    fn setup(
        request_type: u8,
        request: StandardRequest,
        value: u16,
        index: u16,
        length: u16,
    ) -> SetupPacket {
        SetupPacket::new(request_type, request as u8, value, index, length)
    }

    // request_type values
    const DEV_IN: u8 = 0x80;
    const DEV_OUT: u8 = 0x00;
    const IFACE_IN: u8 = 0x81;
    const EP_IN: u8 = 0x82;
    const EP_OUT: u8 = 0x02;

    #[test]
    fn class_and_vendor_requests_are_dispatched() {
        let class = SetupPacket::new(0x21, 0x20, 0, 0, 7);
        assert_eq!(decide(&class, &CTX), Ep0Action::Dispatch);
        let vendor = SetupPacket::new(0xc0, 0x01, 0, 0, 4);
        assert_eq!(decide(&vendor, &CTX), Ep0Action::Dispatch);
    }

    #[test]
    fn device_status_reports_power_and_wakeup() {
        let req = setup(DEV_IN, StandardRequest::GetStatus, 0, 0, 2);
        let Ep0Action::Reply(r) = decide(&req, &CTX) else { panic!() };
        assert_eq!(r.as_bytes(), &[0b10, 0]);

        let powered = Ep0Context { self_powered: true, ..CTX };
        let Ep0Action::Reply(r) = decide(&req, &powered) else { panic!() };
        assert_eq!(r.as_bytes(), &[0b11, 0]);
    }

    #[test]
    fn endpoint_status_reports_stall() {
        let ctx = Ep0Context { stalled: 1 << 3, ..CTX };
        let req = setup(EP_IN, StandardRequest::GetStatus, 0, 0x83, 2);
        let Ep0Action::Reply(r) = decide(&req, &ctx) else { panic!() };
        assert_eq!(r.as_bytes(), &[1, 0]);

        let other = setup(EP_IN, StandardRequest::GetStatus, 0, 0x02, 2);
        let Ep0Action::Reply(r) = decide(&other, &ctx) else { panic!() };
        assert_eq!(r.as_bytes(), &[0, 0]);
    }

    #[test]
    fn interface_status_is_zero() {
        let req = setup(IFACE_IN, StandardRequest::GetStatus, 0, 1, 2);
        let Ep0Action::Reply(r) = decide(&req, &CTX) else { panic!() };
        assert_eq!(r.as_bytes(), &[0, 0]);
    }

    #[test]
    fn device_status_with_index_stalls() {
        let req = setup(DEV_IN, StandardRequest::GetStatus, 0, 1, 2);
        assert_eq!(decide(&req, &CTX), Ep0Action::Stall);
    }

    #[test]
    fn endpoint_halt_requests() {
        let set = setup(EP_OUT, StandardRequest::SetFeature, FEATURE_ENDPOINT_HALT, 0x81, 0);
        assert_eq!(decide(&set, &CTX), Ep0Action::Halt { epno: 1, halt: true });
        let clear = setup(EP_OUT, StandardRequest::ClearFeature, FEATURE_ENDPOINT_HALT, 0x02, 0);
        assert_eq!(decide(&clear, &CTX), Ep0Action::Halt { epno: 2, halt: false });

        let with_data = setup(EP_OUT, StandardRequest::SetFeature, FEATURE_ENDPOINT_HALT, 0x81, 2);
        assert_eq!(decide(&with_data, &CTX), Ep0Action::Stall);
        let bad_feature = setup(EP_OUT, StandardRequest::SetFeature, 7, 0x81, 0);
        assert_eq!(decide(&bad_feature, &CTX), Ep0Action::Stall);
    }

    #[test]
    fn endpoint_halt_with_junk_in_index_high_byte_stalls() {
        let set = setup(EP_OUT, StandardRequest::SetFeature, FEATURE_ENDPOINT_HALT, 0x0181, 0);
        assert_eq!(decide(&set, &CTX), Ep0Action::Stall);
        let clear = setup(EP_OUT, StandardRequest::ClearFeature, FEATURE_ENDPOINT_HALT, 0x1002, 0);
        assert_eq!(decide(&clear, &CTX), Ep0Action::Stall);
    }

    #[test]
    fn test_mode_is_accepted_but_not_entered() {
        let req = setup(DEV_OUT, StandardRequest::SetFeature, FEATURE_TEST_MODE, 0x0400, 0);
        assert_eq!(decide(&req, &CTX), Ep0Action::Reply(Response::EMPTY));
    }

    #[test]
    fn device_remote_wakeup_feature_is_dispatched() {
        let req = setup(DEV_OUT, StandardRequest::SetFeature, 1, 0, 0);
        assert_eq!(decide(&req, &CTX), Ep0Action::Dispatch);
    }

    #[test]
    fn set_address_validation() {
        let ok = setup(DEV_OUT, StandardRequest::SetAddress, 5, 0, 0);
        assert_eq!(decide(&ok, &CTX), Ep0Action::SetAddress(5));
        let too_big = setup(DEV_OUT, StandardRequest::SetAddress, 128, 0, 0);
        assert_eq!(decide(&too_big, &CTX), Ep0Action::Stall);
        let to_iface = setup(0x01, StandardRequest::SetAddress, 5, 0, 0);
        assert_eq!(decide(&to_iface, &CTX), Ep0Action::Stall);
    }

    #[test]
    fn descriptor_requests_must_target_device() {
        let dev = setup(DEV_IN, StandardRequest::GetDescriptor, 0x0100, 0, 18);
        assert_eq!(decide(&dev, &CTX), Ep0Action::Dispatch);
        let iface = setup(IFACE_IN, StandardRequest::GetDescriptor, 0x2200, 0, 64);
        assert_eq!(decide(&iface, &CTX), Ep0Action::Stall);
    }

    #[test]
    fn configuration_requests() {
        let get = setup(DEV_IN, StandardRequest::GetConfiguration, 0, 0, 1);
        assert_eq!(decide(&get, &CTX), Ep0Action::Dispatch);
        let get_bad = setup(DEV_IN, StandardRequest::GetConfiguration, 0, 0, 2);
        assert_eq!(decide(&get_bad, &CTX), Ep0Action::Stall);
        let set = setup(DEV_OUT, StandardRequest::SetConfiguration, 1, 0, 0);
        assert_eq!(decide(&set, &CTX), Ep0Action::Dispatch);
        let set_bad = setup(DEV_OUT, StandardRequest::SetConfiguration, 1, 3, 0);
        assert_eq!(decide(&set_bad, &CTX), Ep0Action::Stall);
    }

    #[test]
    fn unknown_standard_request_stalls() {
        let req = SetupPacket::new(DEV_IN, 0x42, 0, 0, 0);
        assert_eq!(decide(&req, &CTX), Ep0Action::Stall);
    }

    #[test]
    fn synch_frame_replies_empty() {
        let req = setup(EP_IN, StandardRequest::SynchFrame, 0, 0x83, 2);
        assert_eq!(decide(&req, &CTX), Ep0Action::Reply(Response::EMPTY));
    }

    proptest! {
        #[test]
        fn malformed_get_status_always_stalls(
            recipient in 0u8..4,
            dir_in in any::<bool>(),
            value in any::<u16>(),
            index in any::<u16>(),
            length in any::<u16>(),
        ) {
            let malformed = length != 2 || !dir_in || index & 0xff00 != 0 || value != 0;
            prop_assume!(malformed);
            let request_type = (if dir_in { 0x80 } else { 0 }) | recipient;
            let req = setup(request_type, StandardRequest::GetStatus, value, index, length);
            prop_assert_eq!(decide(&req, &CTX), Ep0Action::Stall);
        }

        #[test]
        fn replies_never_exceed_requested_length(
            recipient in 0u8..3,
            length in 0u16..4,
        ) {
            let req = setup(0x80 | recipient, StandardRequest::GetStatus, 0, 0, length);
            if let Ep0Action::Reply(r) = decide(&req, &CTX) {
                prop_assert!(r.as_bytes().len() <= usize::from(length));
            }
        }
    }
}
