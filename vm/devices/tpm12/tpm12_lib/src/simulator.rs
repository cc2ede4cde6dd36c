// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

//! An in-process TPM 1.2 that answers `TPM_GetCapability` from configured
//! state.
//!
//! Beyond a well-behaved device, the simulator can emulate an older device
//! that returns truncated payloads, or a faulty one that misreports the
//! payload size.

use crate::Tpm12Error;
use crate::Tpm12Transport;
use serde::Deserialize;
use serde::Serialize;
use thiserror::Error;
use tpm12_protocol::tpm12proto::CapVersionInfo;
use tpm12_protocol::tpm12proto::CapabilityArea;
use tpm12_protocol::tpm12proto::PermanentFlags;
use tpm12_protocol::tpm12proto::ResponseCode;
use tpm12_protocol::tpm12proto::StClearFlags;
use tpm12_protocol::tpm12proto::TPM_CAP_FLAG_PERMANENT;
use tpm12_protocol::tpm12proto::TPM_CAP_FLAG_VOLATILE;
use tpm12_protocol::tpm12proto::TPM_CAP_PROP_MANUFACTURER;
use tpm12_protocol::tpm12proto::TPM_CAP_PROP_PCR;
use tpm12_protocol::tpm12proto::TPM_ORD_GET_CAPABILITY;
use tpm12_protocol::tpm12proto::TPM_TAG_CAP_VERSION_INFO;
use tpm12_protocol::tpm12proto::TpmVersion;
use tpm12_protocol::tpm12proto::packed_nums::u16_be;
use tpm12_protocol::tpm12proto::protocol::GetCapabilityCmd;
use tpm12_protocol::tpm12proto::protocol::build_error_reply;
use tpm12_protocol::tpm12proto::protocol::build_get_capability_reply_with_size;
use tpm12_protocol::tpm12proto::protocol::common::CmdHeader;
use zerocopy::FromBytes;
use zerocopy::IntoBytes;

/// Configuration of a [`Tpm12Simulator`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct Tpm12SimulatorConfig {
    /// Names of the permanent flags reported as set, e.g. `"ownership"`.
    pub permanent_flags: Vec<String>,
    /// Names of the volatile flags reported as set, e.g. `"physical_presence"`.
    pub volatile_flags: Vec<String>,
    /// Number of PCRs reported through `TPM_CAP_PROP_PCR`.
    pub pcr_count: u32,
    /// Four-character manufacturer ID reported through
    /// `TPM_CAP_PROP_MANUFACTURER`. Shorter IDs are padded with NULs.
    pub manufacturer: String,
    /// Vendor-specific bytes appended to `TPM_CAP_VERSION_INFO`.
    pub vendor_specific: Vec<u8>,
    /// Truncate every capability payload to at most this many bytes.
    pub truncate_payload: Option<u32>,
    /// Report this payload size instead of the real one.
    pub reported_size_override: Option<u32>,
}

impl Default for Tpm12SimulatorConfig {
    fn default() -> Self {
        Self {
            permanent_flags: Vec::new(),
            volatile_flags: Vec::new(),
            pcr_count: 24,
            manufacturer: "MSFT".into(),
            vendor_specific: Vec::new(),
            truncate_payload: None,
            reported_size_override: None,
        }
    }
}

/// Errors building a [`Tpm12Simulator`] from its configuration.
#[derive(Debug, Error)]
pub enum SimulatorConfigError {
    /// A permanent flag name is not a `TPM_PERMANENT_FLAGS` field.
    #[error("unknown permanent flag '{0}'")]
    UnknownPermanentFlag(String),
    /// A volatile flag name is not a `TPM_STCLEAR_FLAGS` field.
    #[error("unknown volatile flag '{0}'")]
    UnknownVolatileFlag(String),
    /// The manufacturer ID does not fit four bytes.
    #[error("manufacturer ID '{0}' is longer than 4 bytes")]
    ManufacturerTooLong(String),
    /// The vendor-specific data would overflow the reply buffer.
    #[error("vendor-specific data of {0} bytes is too large")]
    VendorSpecificTooLarge(usize),
}

/// An in-process TPM 1.2 capability responder.
#[derive(Debug, Clone)]
pub struct Tpm12Simulator {
    permanent: PermanentFlags,
    volatile: StClearFlags,
    pcr_count: u32,
    manufacturer: [u8; 4],
    vendor_specific: Vec<u8>,
    truncate_payload: Option<u32>,
    reported_size_override: Option<u32>,
}

impl Tpm12Simulator {
    /// Build a simulator from its configuration.
    pub fn new(config: &Tpm12SimulatorConfig) -> Result<Self, SimulatorConfigError> {
        let mut permanent = PermanentFlags::new();
        for name in &config.permanent_flags {
            if !permanent.set_flag(name, true) {
                return Err(SimulatorConfigError::UnknownPermanentFlag(name.clone()));
            }
        }

        let mut volatile = StClearFlags::new();
        for name in &config.volatile_flags {
            if !volatile.set_flag(name, true) {
                return Err(SimulatorConfigError::UnknownVolatileFlag(name.clone()));
            }
        }

        let id = config.manufacturer.as_bytes();
        if id.len() > 4 {
            return Err(SimulatorConfigError::ManufacturerTooLong(
                config.manufacturer.clone(),
            ));
        }
        let mut manufacturer = [0; 4];
        manufacturer[..id.len()].copy_from_slice(id);

        if u16::try_from(config.vendor_specific.len()).is_err() {
            return Err(SimulatorConfigError::VendorSpecificTooLarge(
                config.vendor_specific.len(),
            ));
        }

        Ok(Self {
            permanent,
            volatile,
            pcr_count: config.pcr_count,
            manufacturer,
            vendor_specific: config.vendor_specific.clone(),
            truncate_payload: config.truncate_payload,
            reported_size_override: config.reported_size_override,
        })
    }

    /// The permanent flags the simulator reports.
    pub fn permanent_flags_mut(&mut self) -> &mut PermanentFlags {
        &mut self.permanent
    }

    /// The volatile flags the simulator reports.
    pub fn volatile_flags_mut(&mut self) -> &mut StClearFlags {
        &mut self.volatile
    }

    /// Execute one encoded command, returning the encoded reply.
    pub fn execute_command(&mut self, command: &[u8]) -> Vec<u8> {
        let Ok((header, _)) = CmdHeader::read_from_prefix(command) else {
            tracing::debug!(len = command.len(), "command shorter than header");
            return build_error_reply(ResponseCode::BadParameter as u32);
        };

        if header.ordinal.get() != TPM_ORD_GET_CAPABILITY {
            tracing::debug!(ordinal = header.ordinal.get(), "unsupported ordinal");
            return build_error_reply(ResponseCode::BadOrdinal as u32);
        }

        let Some(cmd) = GetCapabilityCmd::deserialize(command) else {
            tracing::debug!(len = command.len(), "malformed TPM_GetCapability command");
            return build_error_reply(ResponseCode::BadParameter as u32);
        };

        let Some(mut payload) = self.capability_payload(&cmd) else {
            tracing::debug!(
                cap_area = cmd.cap_area,
                sub_cap = ?cmd.sub_cap(),
                "unsupported capability"
            );
            return build_error_reply(ResponseCode::BadMode as u32);
        };

        if let Some(limit) = self.truncate_payload {
            payload.truncate(limit as usize);
        }
        let resp_size = self
            .reported_size_override
            .unwrap_or(payload.len() as u32);

        build_get_capability_reply_with_size(&payload, resp_size)
    }

    fn capability_payload(&self, cmd: &GetCapabilityCmd) -> Option<Vec<u8>> {
        let payload = match (CapabilityArea::from_u32(cmd.cap_area)?, cmd.sub_cap_u32()) {
            (CapabilityArea::Flag, Some(TPM_CAP_FLAG_PERMANENT)) => {
                self.permanent.as_bytes().to_vec()
            }
            (CapabilityArea::Flag, Some(TPM_CAP_FLAG_VOLATILE)) => {
                self.volatile.as_bytes().to_vec()
            }
            (CapabilityArea::Property, Some(TPM_CAP_PROP_PCR)) => {
                self.pcr_count.to_be_bytes().to_vec()
            }
            (CapabilityArea::Property, Some(TPM_CAP_PROP_MANUFACTURER)) => {
                self.manufacturer.to_vec()
            }
            (CapabilityArea::VersionVal, None) => {
                let info = CapVersionInfo {
                    tag: TPM_TAG_CAP_VERSION_INFO.into(),
                    version: TpmVersion {
                        major: 1,
                        minor: 2,
                        rev_major: 0,
                        rev_minor: 0,
                    },
                    spec_level: u16_be::new(2),
                    errata_rev: 3,
                    tpm_vendor_id: self.manufacturer,
                    vendor_specific_size: (self.vendor_specific.len() as u16).into(),
                };
                let mut payload = info.as_bytes().to_vec();
                payload.extend_from_slice(&self.vendor_specific);
                payload
            }
            _ => return None,
        };

        Some(payload)
    }
}

impl Tpm12Transport for Tpm12Simulator {
    fn submit(&mut self, command: &[u8], reply: &mut [u8]) -> Result<usize, Tpm12Error> {
        let response = self.execute_command(command);
        if response.len() > reply.len() {
            return Err(Tpm12Error::BufferTooSmall {
                size: response.len(),
                capacity: reply.len(),
            });
        }

        reply[..response.len()].copy_from_slice(&response);
        Ok(response.len())
    }
}
