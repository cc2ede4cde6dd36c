// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

//! Client for the TCP command channel of the Microsoft TPM simulator
//! (`mssim`).
//!
//! Each command is sent as `TPM_SEND_COMMAND`, a locality byte and the
//! length-prefixed command. The simulator answers with the length-prefixed
//! reply followed by a status word. All integers are big-endian `u32`s.

use crate::DeviceError;
use crate::Tpm12Error;
use crate::Tpm12Transport;
use std::io::Read;
use std::io::Write;
use std::net::TcpStream;
use std::net::ToSocketAddrs;
use std::time::Duration;
use tpm12_protocol::TPM12_BUFFER_SIZE;

#[repr(u32)]
enum IfaceCmd {
    SendCommand = 8,
    SessionEnd = 20,
}

const LOCALITY: u8 = 0;

/// A TPM 1.2 simulator reached over TCP.
///
/// A failed read or write can leave part of a reply in the stream, after which
/// the framing of later replies is unknown. The session is then marked broken
/// and every later exchange fails without touching the stream.
pub struct MssimTransport {
    stream: TcpStream,
    broken: bool,
}

impl MssimTransport {
    /// Connect to the simulator command port at `addr`. Reads and writes that
    /// stall for longer than `timeout` fail with [`Tpm12Error::Timeout`].
    pub fn connect(addr: impl ToSocketAddrs, timeout: Duration) -> std::io::Result<Self> {
        let stream = TcpStream::connect(addr)?;
        stream.set_read_timeout(Some(timeout))?;
        stream.set_write_timeout(Some(timeout))?;
        stream.set_nodelay(true)?;
        Ok(Self {
            stream,
            broken: false,
        })
    }

    fn read_u32(&mut self) -> std::io::Result<u32> {
        let mut b = [0u8; 4];
        self.stream.read_exact(&mut b)?;
        Ok(u32::from_be_bytes(b))
    }

    fn read_response(&mut self) -> std::io::Result<(Vec<u8>, u32)> {
        let len = self.read_u32()? as usize;
        if len > TPM12_BUFFER_SIZE {
            tracing::warn!(len, "simulator response length exceeds maximum");
            return Err(std::io::Error::new(
                std::io::ErrorKind::InvalidData,
                format!("response length {len} > max {TPM12_BUFFER_SIZE}"),
            ));
        }

        let mut response = vec![0u8; len];
        self.stream.read_exact(&mut response)?;
        let status = self.read_u32()?;

        Ok((response, status))
    }

    fn exchange(&mut self, message: &[u8]) -> std::io::Result<(Vec<u8>, u32)> {
        self.stream.write_all(message)?;
        self.read_response()
    }
}

impl Tpm12Transport for MssimTransport {
    fn submit(&mut self, command: &[u8], reply: &mut [u8]) -> Result<usize, Tpm12Error> {
        let mut message = Vec::with_capacity(9 + command.len());
        message.extend_from_slice(&(IfaceCmd::SendCommand as u32).to_be_bytes());
        message.push(LOCALITY);
        message.extend_from_slice(&(command.len() as u32).to_be_bytes());
        message.extend_from_slice(command);

        if self.broken {
            Err(DeviceError::Io(std::io::Error::new(
                std::io::ErrorKind::NotConnected,
                "simulator session lost reply framing",
            )))?
        }

        tracing::trace!(len = command.len(), "sending TPM command to simulator");
        let (response, status) = self.exchange(&message).map_err(|err| {
            tracing::warn!(
                error = &err as &dyn std::error::Error,
                "simulator exchange failed, closing session"
            );
            self.broken = true;
            Tpm12Error::from_io(err)
        })?;
        tracing::trace!(len = response.len(), status, "simulator replied");

        if status != 0 {
            Err(DeviceError::SimulatorStatus(status))?
        }

        if response.len() > reply.len() {
            tracing::debug!(
                size = response.len(),
                capacity = reply.len(),
                "TPM reply exceeds buffer"
            );
            return Err(Tpm12Error::BufferTooSmall {
                size: response.len(),
                capacity: reply.len(),
            });
        }

        reply[..response.len()].copy_from_slice(&response);
        Ok(response.len())
    }
}

impl Drop for MssimTransport {
    fn drop(&mut self) {
        if self.broken {
            return;
        }

        if let Err(err) = self
            .stream
            .write_all(&(IfaceCmd::SessionEnd as u32).to_be_bytes())
        {
            tracing::debug!(
                error = &err as &dyn std::error::Error,
                "failed to end simulator session"
            );
        }
    }
}
