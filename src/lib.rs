// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Device-side driver for the Atmel/Microchip SAMA5 UDPHS, a USB 2.0
//! High-Speed device controller.
//!
//! The controller gives you sixteen endpoints, each backed by one to three
//! hardware FIFO banks, plus seven DMA channels serving endpoints 1 through 7.
//! Deciding what goes into those FIFOs and answering the host's control
//! requests is left to software, and that software is this crate.
//!
//! The shape of the thing:
//!
//! - [`Udphs`] is the controller context. You create one with [`Udphs::new`],
//!   handing it something that implements [`Registers`] (the memory-mapped
//!   register file and FIFO window) and something that implements
//!   [`Platform`] (interrupt masking, clocks, caches). There are no globals;
//!   if you somehow have two controllers, make two contexts.
//!
//! - A class driver (mass storage, serial, whatever) implements
//!   [`ClassDriver`] and gets bound with [`Udphs::register`]. It gets called
//!   back for SETUP requests the core doesn't answer itself, for bus events,
//!   and when transfers complete.
//!
//! - Your interrupt handler calls [`Udphs::handle_interrupt`]. That's the
//!   only place hardware events enter the engine.
//!
//! - Transfers are [`Request`]s living in an arena owned by the context and
//!   named by [`RequestId`] handles. Submitting a request hands it to the
//!   engine; the completion callback hands it back.
//!
//! # Locking
//!
//! There is exactly one lock: masking the controller's interrupt, done
//! through [`Platform::mask_irq`]. Every touch of shared state happens with
//! the interrupt masked. Callbacks into the class driver never do: they are
//! queued while state is being changed and delivered once the mask is
//! dropped, so the class driver is free to call back in (to resubmit, say)
//! from inside a callback.
//!
//! # Features
//!
//! - `dma` (default): endpoints 1-7 move data with the controller's DMA
//!   channels. Without it, every endpoint goes through the FIFO window a
//!   packet at a time.

#![cfg_attr(not(test), no_std)]

extern crate alloc;

mod config;
mod controller;
mod dma;
mod driver;
mod endpoint;
mod ep0;
mod error;
mod platform;
mod regs;
mod request;
mod usb;

#[cfg(test)]
mod testing;

pub use config::{Config, EP0, NDMACHANNELS, NENDPOINTS};
pub use controller::{DeviceState, Speed, Udphs};
pub use driver::ClassDriver;
pub use endpoint::{EndpointId, EndpointState};
pub use ep0::Ep0Outcome;
pub use error::{Error, Result};
pub use platform::Platform;
pub use regs::{Mmio, Registers};
pub use request::{Request, RequestFlags, RequestId};
pub use usb::{
    EndpointDescriptor, Recipient, RequestKind, SetupPacket, StandardRequest,
    TransferType, UsbDir,
};
