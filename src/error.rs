// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Error type shared by the device and host drivers.

use core::fmt;

/// Things that can go wrong when talking to the USB core.
///
/// Note that a STALL we send as a device is _not_ an error at this layer:
/// it's an ordinary outcome of request handling, see
/// `request::RequestStatus`. A STALL we receive as a host is `Stalled`.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum Error {
    /// An endpoint number, length, or buffer that the hardware can't express.
    InvalidArgument,
    /// Every transfer slot in the relevant pool is in flight. Retry later.
    PoolExhausted,
    /// No transfer queue has been registered for the endpoint.
    NoQueue,
    /// A transfer queue is already registered for the endpoint.
    QueueAlreadyRegistered,
    /// The operation needs the controller in the other mode (device vs host).
    WrongMode,
    /// The requested configuration isn't in the descriptor table.
    NoConfiguration,
    /// The downstream device answered with a STALL handshake.
    Stalled,
    /// A host transfer ran out of retries on CRC, timeout or babble errors.
    TransactionError,
}

pub type Result<T> = core::result::Result<T, Error>;

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Error::InvalidArgument => "invalid endpoint, length, or buffer",
            Error::PoolExhausted => "transfer pool exhausted",
            Error::NoQueue => "no transfer queue registered for endpoint",
            Error::QueueAlreadyRegistered => "transfer queue already registered for endpoint",
            Error::WrongMode => "controller is in the wrong mode",
            Error::NoConfiguration => "no such configuration",
            Error::Stalled => "device stalled the transfer",
            Error::TransactionError => "transaction error",
        };
        f.write_str(s)
    }
}
