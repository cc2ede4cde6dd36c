// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

//! TPM 1.2 protocol constants and wire structures for the capability command
//! family, shared by the TPM 1.2 transports and command helpers.

pub mod tpm12proto;

pub use tpm12proto::CapabilityArea;
pub use tpm12proto::CapabilityShape;
pub use tpm12proto::ResponseCode;
pub use tpm12proto::TPM_CAP_FLAG_PERMANENT;
pub use tpm12proto::TPM_CAP_FLAG_VOLATILE;
pub use tpm12proto::TPM_CAP_PROP_MANUFACTURER;
pub use tpm12proto::TPM_CAP_PROP_PCR;
pub use tpm12proto::TPM_ORD_GET_CAPABILITY;

/// Size of the intermediate buffers used by TPM 1.2 transports.
// DEVNOTE: TPM 1.2 devices do not exchange messages larger than a page in
// practice. Scale this up if a transport ever needs more.
pub const TPM12_BUFFER_SIZE: usize = 4096;
