// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! USB structure and constant definitions.
//!
//! These are the bits of USB 2.0 chapter 9 that the engine
//! needs to understand on its own. Everything here is bus-level and has
//! nothing to do with the UDPHS in particular.

use byteorder::LittleEndian;
use num_derive::FromPrimitive;
use num_traits::FromPrimitive;
use zerocopy::{AsBytes, FromBytes, LayoutVerified, Unaligned, U16};

/// USB deals in two different transfer directions, called OUT (host-to-device)
/// and IN (device-to-host). In the vast majority of cases, OUT is represented
/// by a 0 bit 7, and IN by an `0x80`.
#[derive(Copy, Clone, Debug, PartialEq, Eq, FromPrimitive)]
pub enum UsbDir {
    Out = 0,
    In = 0x80,
}

impl UsbDir {
    /// Builds an endpoint address from an endpoint number.
    pub const fn endpoint(self, num: u8) -> u8 {
        (num & ENDPOINT_NUMBER_MASK) | self as u8
    }

    /// Extracts the direction from an endpoint address or a SETUP
    /// `request_type`. Both keep it in bit 7.
    pub const fn of_endpoint_addr(addr: u8) -> Self {
        if addr & Self::In as u8 != 0 {
            Self::In
        } else {
            Self::Out
        }
    }
}

/// Bits of an endpoint address that carry the endpoint number.
pub const ENDPOINT_NUMBER_MASK: u8 = 0x0f;

/// Layout of an 8-byte USB SETUP packet.
#[repr(C)]
#[derive(Copy, Clone, Debug, AsBytes, FromBytes, Unaligned)]
pub struct SetupPacket {
    /// Direction in bit 7, `RequestKind` in bits 6:5, `Recipient` in bits 4:0.
    pub request_type: u8,
    /// Request code. Standard ones are in `StandardRequest`; class and vendor
    /// requests define their own.
    pub request: u8,
    /// A request-specific argument of up to 16 bits.
    pub value: U16<LittleEndian>,
    /// Another one, usually an interface or endpoint number.
    pub index: U16<LittleEndian>,
    /// If data will be transferred after this request (in the direction given
    /// by `request_type`), this gives the number of bytes (OUT) or maximum
    /// number of bytes (IN).
    pub length: U16<LittleEndian>,
}

impl SetupPacket {
    pub const SIZE: usize = 8;

    pub fn new(request_type: u8, request: u8, value: u16, index: u16, length: u16) -> Self {
        Self {
            request_type,
            request,
            value: U16::new(value),
            index: U16::new(index),
            length: U16::new(length),
        }
    }

    /// Reinterprets eight bytes off the wire. Returns `None` for anything that
    /// isn't exactly eight bytes long.
    pub fn parse(bytes: &[u8]) -> Option<Self> {
        LayoutVerified::<_, SetupPacket>::new(bytes).map(|lv| *lv.into_ref())
    }

    pub fn direction(&self) -> UsbDir {
        UsbDir::of_endpoint_addr(self.request_type)
    }

    pub fn kind(&self) -> RequestKind {
        // Two bits can only hold values that exist in the enum.
        RequestKind::from_u8((self.request_type >> 5) & 0b11).unwrap_or(RequestKind::Reserved)
    }

    /// `None` for the reserved recipient codes 4 through 31.
    pub fn recipient(&self) -> Option<Recipient> {
        Recipient::from_u8(self.request_type & 0x1f)
    }

    /// `None` for request codes the standard doesn't define.
    pub fn standard_request(&self) -> Option<StandardRequest> {
        StandardRequest::from_u8(self.request)
    }

    pub fn value(&self) -> u16 {
        self.value.get()
    }

    pub fn index(&self) -> u16 {
        self.index.get()
    }

    pub fn length(&self) -> u16 {
        self.length.get()
    }
}

/// Bits 6:5 of `request_type`.
#[derive(Copy, Clone, Debug, PartialEq, Eq, FromPrimitive)]
pub enum RequestKind {
    Standard = 0,
    Class = 1,
    Vendor = 2,
    Reserved = 3,
}

/// Bits 4:0 of `request_type`.
#[derive(Copy, Clone, Debug, PartialEq, Eq, FromPrimitive)]
pub enum Recipient {
    Device = 0,
    Interface = 1,
    Endpoint = 2,
    Other = 3,
}

/// The standard request codes from USB 2.0 table 9-4.
#[derive(Copy, Clone, Debug, PartialEq, Eq, FromPrimitive)]
pub enum StandardRequest {
    GetStatus = 0x00,
    ClearFeature = 0x01,
    SetFeature = 0x03,
    /// Notifies the device that it's being moved to a different address on
    /// the bus. The new address only takes effect after the status stage.
    SetAddress = 0x05,
    GetDescriptor = 0x06,
    SetDescriptor = 0x07,
    GetConfiguration = 0x08,
    SetConfiguration = 0x09,
    GetInterface = 0x0a,
    SetInterface = 0x0b,
    SynchFrame = 0x0c,
}

/// Feature selectors for `ClearFeature`/`SetFeature`.
pub const FEATURE_ENDPOINT_HALT: u16 = 0;
pub const FEATURE_TEST_MODE: u16 = 2;

/// Descriptor type code for an endpoint descriptor.
pub const DESC_TYPE_ENDPOINT: u8 = 0x05;

/// Describes an endpoint within an interface. The class driver hands us these
/// to configure endpoints.
#[repr(C)]
#[derive(Copy, Clone, Debug, AsBytes, FromBytes, Unaligned)]
pub struct EndpointDescriptor {
    /// Length of this struct, must be 7.
    pub length: u8,
    /// Type of this descriptor, must be `DESC_TYPE_ENDPOINT`.
    pub descriptor_type: u8,
    /// Address of this endpoint, where the bottom 4 bits give the endpoint
    /// number (0..15) and the top bit distinguishes IN (1) from OUT (0).
    pub endpoint_address: u8,
    /// Endpoint attributes; the bottom 2 bits are a `TransferType`.
    pub attributes: u8,
    /// Maximum packet size in bits 10:0. On high-speed high-bandwidth
    /// endpoints, bits 12:11 give the number of extra transactions per
    /// microframe.
    pub max_packet_size: U16<LittleEndian>,
    /// Polling interval for interrupt/isochronous endpoints.
    pub interval: u8,
}

impl EndpointDescriptor {
    pub fn new(endpoint_address: u8, transfer_type: TransferType, max_packet_size: u16) -> Self {
        Self {
            length: core::mem::size_of::<Self>() as u8,
            descriptor_type: DESC_TYPE_ENDPOINT,
            endpoint_address,
            attributes: transfer_type as u8,
            max_packet_size: U16::new(max_packet_size),
            interval: 0,
        }
    }

    pub fn number(&self) -> u8 {
        self.endpoint_address & ENDPOINT_NUMBER_MASK
    }

    pub fn direction(&self) -> UsbDir {
        UsbDir::of_endpoint_addr(self.endpoint_address)
    }

    pub fn transfer_type(&self) -> TransferType {
        TransferType::from_u8(self.attributes & 0b11).unwrap_or(TransferType::Control)
    }

    pub fn max_packet_size(&self) -> u16 {
        self.max_packet_size.get()
    }
}

/// Types of transfer that can be indicated by the `attributes` field on
/// `EndpointDescriptor`.
#[derive(Copy, Clone, Debug, PartialEq, Eq, FromPrimitive)]
#[repr(u8)]
pub enum TransferType {
    Control = 0,
    Isochronous = 1,
    Bulk = 2,
    Interrupt = 3,
}
