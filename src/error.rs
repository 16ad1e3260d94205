// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

/// Everything that can go wrong, either synchronously from an operation or
/// asynchronously as a transfer's completion result.
///
/// Completion results only ever carry `Shutdown`, `IoError` or `Protocol`
/// (the last on EP0 only).
#[derive(Copy, Clone, Debug, PartialEq, Eq, thiserror::Error)]
pub enum Error {
    /// The endpoint is mid-transfer or stalled and can't take this right now.
    #[error("endpoint busy")]
    Busy,
    /// The request was aborted by a bus reset, endpoint disable or cancel.
    #[error("request aborted")]
    Shutdown,
    /// DMA fault, or the hardware reported something we didn't ask for.
    #[error("transfer failed")]
    IoError,
    /// Malformed control request. On EP0 this always ends in a stall.
    #[error("control protocol error")]
    Protocol,
    /// The controller refused the endpoint's size/bank combination.
    #[error("endpoint geometry rejected by controller")]
    ConfigError,
    /// Bad endpoint number, stale request handle, and so on.
    #[error("invalid argument")]
    InvalidArgs,
}

pub type Result<T, E = Error> = core::result::Result<T, E>;
