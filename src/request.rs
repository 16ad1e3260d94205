// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Transfer requests, the arena that holds them, and per-endpoint queues.
//!
//! Requests live in a `RequestPool` owned by the controller and are named by
//! `RequestId`. A queue is just a list of ids. The class driver owns a
//! request whenever it is not on a queue; while it is queued, only the engine
//! touches it.

use alloc::collections::VecDeque;
use alloc::vec::Vec;

use crate::error::{Error, Result};

/// Handle to a `Request` in the controller's arena.
///
/// Handles carry a generation count, so one that outlives its request (freed
/// and reallocated) is rejected instead of aliasing the new occupant.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash)]
pub struct RequestId {
    index: u16,
    generation: u16,
}

/// Per-request behaviour flags.
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq)]
pub struct RequestFlags(u8);

impl RequestFlags {
    pub const NONE: Self = Self(0);
    /// On IN endpoints, follow a transfer that ends exactly on a packet
    /// boundary with a zero-length packet, so the host sees it end.
    pub const NULLPKT: Self = Self(1 << 0);

    pub const fn contains(self, other: Self) -> bool {
        self.0 & other.0 == other.0
    }
}

impl core::ops::BitOr for RequestFlags {
    type Output = Self;

    fn bitor(self, rhs: Self) -> Self {
        Self(self.0 | rhs.0)
    }
}

/// One transfer: a buffer to send from or receive into, plus the engine's
/// bookkeeping on how far along it is.
#[derive(Debug, Default)]
pub struct Request {
    buf: Vec<u8>,
    len: usize,
    flags: RequestFlags,
    pub(crate) xfrd: usize,
    pub(crate) inflight: usize,
    result: Option<Result<()>>,
    /// Set once the engine has looked at this request at the head of its
    /// queue, so a zero-length write sends its one packet exactly once.
    pub(crate) started: bool,
    /// Endpoint whose queue holds this request, if any.
    pub(crate) queued: Option<u8>,
}

impl Request {
    /// Replaces the buffer. The transfer length becomes the buffer length.
    pub fn set_buffer(&mut self, buf: Vec<u8>) {
        self.len = buf.len();
        self.buf = buf;
    }

    /// Takes the buffer back out, leaving an empty one.
    pub fn take_buffer(&mut self) -> Vec<u8> {
        self.len = 0;
        core::mem::take(&mut self.buf)
    }

    pub fn buffer(&self) -> &[u8] {
        &self.buf
    }

    pub fn buffer_mut(&mut self) -> &mut [u8] {
        &mut self.buf
    }

    /// Sets how many bytes to send or receive. Must not exceed the buffer.
    pub fn set_len(&mut self, len: usize) -> Result<()> {
        if len > self.buf.len() {
            return Err(Error::InvalidArgs);
        }
        self.len = len;
        Ok(())
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    pub fn flags(&self) -> RequestFlags {
        self.flags
    }

    pub fn set_flags(&mut self, flags: RequestFlags) {
        self.flags = flags;
    }

    /// Bytes moved so far. After completion, the transfer's final size.
    pub fn transferred(&self) -> usize {
        self.xfrd
    }

    /// The received or sent bytes.
    pub fn data(&self) -> &[u8] {
        &self.buf[..self.xfrd.min(self.buf.len())]
    }

    /// Result of the last completion, `None` before the first.
    pub fn result(&self) -> Option<Result<()>> {
        self.result
    }

    pub fn is_queued(&self) -> bool {
        self.queued.is_some()
    }

    pub(crate) fn remaining(&self) -> usize {
        self.len - self.xfrd
    }

    /// Clears bookkeeping for a fresh submit.
    pub(crate) fn arm(&mut self, epno: u8) {
        self.xfrd = 0;
        self.inflight = 0;
        self.result = None;
        self.started = false;
        self.queued = Some(epno);
    }

    pub(crate) fn finish(&mut self, result: Result<()>) {
        self.inflight = 0;
        self.result = Some(result);
        self.queued = None;
    }

    /// Address range of the bytes currently handed to hardware.
    pub(crate) fn inflight_range(&self) -> (usize, usize) {
        let start = self.buf.as_ptr() as usize + self.xfrd;
        (start, start + self.inflight)
    }
}

////////////////////////////////////////////////////////////////////////////
// Arena.

#[derive(Debug)]
struct Slot {
    generation: u16,
    request: Option<Request>,
}

#[derive(Debug, Default)]
pub(crate) struct RequestPool {
    slots: Vec<Slot>,
    free: Vec<u16>,
}

impl RequestPool {
    pub fn alloc(&mut self) -> Result<RequestId> {
        if let Some(index) = self.free.pop() {
            let slot = &mut self.slots[usize::from(index)];
            slot.request = Some(Request::default());
            return Ok(RequestId { index, generation: slot.generation });
        }
        let index = u16::try_from(self.slots.len()).map_err(|_| Error::InvalidArgs)?;
        self.slots.push(Slot { generation: 0, request: Some(Request::default()) });
        Ok(RequestId { index, generation: 0 })
    }

    /// Returns the request to the arena. Refuses while it's queued.
    pub fn free(&mut self, id: RequestId) -> Result<Request> {
        let slot = self.slot_mut(id)?;
        match &slot.request {
            Some(r) if r.is_queued() => return Err(Error::Busy),
            Some(_) => {}
            None => return Err(Error::InvalidArgs),
        }
        let request = slot.request.take().ok_or(Error::InvalidArgs)?;
        slot.generation = slot.generation.wrapping_add(1);
        self.free.push(id.index);
        Ok(request)
    }

    pub fn get(&self, id: RequestId) -> Option<&Request> {
        self.slots
            .get(usize::from(id.index))
            .filter(|s| s.generation == id.generation)
            .and_then(|s| s.request.as_ref())
    }

    pub fn get_mut(&mut self, id: RequestId) -> Option<&mut Request> {
        self.slot_mut(id).ok().and_then(|s| s.request.as_mut())
    }

    fn slot_mut(&mut self, id: RequestId) -> Result<&mut Slot> {
        self.slots
            .get_mut(usize::from(id.index))
            .filter(|s| s.generation == id.generation)
            .ok_or(Error::InvalidArgs)
    }
}

////////////////////////////////////////////////////////////////////////////
// Queue.

/// FIFO of requests waiting on one endpoint. Only the head is ever in flight.
#[derive(Debug, Default)]
pub(crate) struct RequestQueue {
    ids: VecDeque<RequestId>,
}

impl RequestQueue {
    pub fn enqueue(&mut self, id: RequestId) {
        self.ids.push_back(id);
    }

    pub fn dequeue(&mut self) -> Option<RequestId> {
        self.ids.pop_front()
    }

    pub fn peek(&self) -> Option<RequestId> {
        self.ids.front().copied()
    }

    pub fn is_empty(&self) -> bool {
        self.ids.is_empty()
    }

    pub fn len(&self) -> usize {
        self.ids.len()
    }
}
