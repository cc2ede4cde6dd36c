// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

//! Transport over a TPM character device.
//!
//! A TPM character device takes one complete command per write and returns
//! the complete reply from the following read.

use crate::Tpm12Error;
use crate::Tpm12Transport;
use std::io::Read;
use std::io::Write;
use std::path::Path;
use tpm12_protocol::TPM12_BUFFER_SIZE;

/// A TPM 1.2 reached through a character device such as `/dev/tpm0`.
pub struct DeviceTransport<F = fs_err::File> {
    device: F,
}

impl DeviceTransport {
    /// Open the device at `path` for reading and writing.
    pub fn open(path: impl AsRef<Path>) -> std::io::Result<Self> {
        let device = fs_err::OpenOptions::new()
            .read(true)
            .write(true)
            .open(path.as_ref())?;
        Ok(Self { device })
    }
}

impl<F: Read + Write> DeviceTransport<F> {
    /// Wrap an already open device.
    pub fn with_device(device: F) -> Self {
        Self { device }
    }
}

impl<F: Read + Write> Tpm12Transport for DeviceTransport<F> {
    fn submit(&mut self, command: &[u8], reply: &mut [u8]) -> Result<usize, Tpm12Error> {
        tracing::trace!(len = command.len(), "writing TPM command");
        self.device
            .write_all(command)
            .and_then(|()| self.device.flush())
            .map_err(Tpm12Error::from_io)?;

        let mut buffer = [0u8; TPM12_BUFFER_SIZE];
        let size = self.device.read(&mut buffer).map_err(Tpm12Error::from_io)?;
        tracing::trace!(len = size, "read TPM reply");

        if size > reply.len() {
            tracing::debug!(size, capacity = reply.len(), "TPM reply exceeds buffer");
            return Err(Tpm12Error::BufferTooSmall {
                size,
                capacity: reply.len(),
            });
        }

        reply[..size].copy_from_slice(&buffer[..size]);
        Ok(size)
    }
}
