// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

//! Helpers for querying TPM 1.2 capability state over a pluggable
//! command/response transport.
//!
//! [`Tpm12Transport`] is the single seam between this crate and a device: it
//! exchanges one encoded command for one reply. [`Tpm12CommandHelper`] builds
//! `TPM_GetCapability` commands on top of it and decodes the replies, clamping
//! device-reported sizes to the caller's output (see [`reconcile`]).

#![forbid(unsafe_code)]

mod capability;
pub mod reconcile;
pub mod simulator;
pub mod transport;

pub use capability::Tpm12CommandHelper;
pub use capability::VersionInfo;

use thiserror::Error;
use tpm12_protocol::tpm12proto::InvalidInput;

/// Errors returned by a TPM 1.2 exchange.
#[derive(Debug, Error)]
pub enum Tpm12Error {
    /// The TPM did not answer in time.
    #[error("timed out waiting for the TPM to respond")]
    Timeout,
    /// The reply does not fit the caller's reply buffer.
    #[error("TPM reply of {size} bytes does not fit the {capacity} byte reply buffer")]
    BufferTooSmall {
        /// Size of the reply, in bytes.
        size: usize,
        /// Size of the reply buffer, in bytes.
        capacity: usize,
    },
    /// The device or its reply misbehaved.
    #[error("unexpected TPM device behavior")]
    DeviceError(#[source] DeviceError),
    /// A command parameter was rejected before submission.
    #[error("invalid input parameter for the TPM command")]
    InvalidInput(#[source] InvalidInput),
}

impl Tpm12Error {
    /// Classify an I/O error from a transport.
    pub fn from_io(err: std::io::Error) -> Self {
        match err.kind() {
            std::io::ErrorKind::TimedOut | std::io::ErrorKind::WouldBlock => Self::Timeout,
            _ => Self::DeviceError(DeviceError::Io(err)),
        }
    }
}

impl From<DeviceError> for Tpm12Error {
    fn from(err: DeviceError) -> Self {
        Self::DeviceError(err)
    }
}

/// Ways a device can fail or produce a reply that cannot be framed.
#[derive(Debug, Error)]
pub enum DeviceError {
    /// Reading or writing the transport failed.
    #[error("failed to exchange bytes with the TPM")]
    Io(#[source] std::io::Error),
    /// The reply ended before its header was complete.
    #[error("reply of {size} bytes is shorter than the {expected} byte reply header")]
    ReplyTooShort {
        /// Size of the reply, in bytes.
        size: usize,
        /// Size of the reply header, in bytes.
        expected: usize,
    },
    /// The reply carried a tag other than `TPM_TAG_RSP_COMMAND`.
    #[error("unexpected reply tag {0:#06x}")]
    UnexpectedTag(u16),
    /// The TPM returned a nonzero return code.
    #[error("TPM command failed, return code: {return_code:#x}")]
    CommandFailed {
        /// The `TPM_RESULT` of the reply.
        return_code: u32,
    },
    /// The simulator channel reported a nonzero status word.
    #[error("TPM simulator reported status {0:#x}")]
    SimulatorStatus(u32),
}

/// A byte-level command/response channel to a TPM 1.2 device.
///
/// Implementations send `command` and write the device's reply into `reply`,
/// returning the number of bytes written. `reply.len()` is the capacity of the
/// reply buffer. A reply that would exceed it fails with
/// [`Tpm12Error::BufferTooSmall`].
///
/// Callers must not issue overlapping commands to one device. Use
/// [`transport::SharedTransport`] to serialize callers that share a device.
pub trait Tpm12Transport {
    /// Exchange one command for one reply.
    fn submit(&mut self, command: &[u8], reply: &mut [u8]) -> Result<usize, Tpm12Error>;
}

impl<T: Tpm12Transport + ?Sized> Tpm12Transport for &mut T {
    fn submit(&mut self, command: &[u8], reply: &mut [u8]) -> Result<usize, Tpm12Error> {
        (**self).submit(command, reply)
    }
}

impl<T: Tpm12Transport + ?Sized> Tpm12Transport for Box<T> {
    fn submit(&mut self, command: &[u8], reply: &mut [u8]) -> Result<usize, Tpm12Error> {
        (**self).submit(command, reply)
    }
}
