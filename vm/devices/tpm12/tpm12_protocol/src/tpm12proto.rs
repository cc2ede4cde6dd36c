// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

//! TPM 1.2 protocol types, as defined in "TPM Main Part 2: TPM Structures" and
//! "TPM Main Part 3: Commands", version 1.2.
//!
//! Every structure here is a fixed, unpadded, big-endian wire layout. Multi-byte
//! fields use the zerocopy byte-order types so that no host layout or byte
//! order assumption leaks into the encoding.

use self::packed_nums::*;
use static_assertions::const_assert_eq;
use thiserror::Error;
use zerocopy::FromBytes;
use zerocopy::FromZeros;
use zerocopy::Immutable;
use zerocopy::IntoBytes;
use zerocopy::KnownLayout;

#[expect(non_camel_case_types)]
pub mod packed_nums {
    //! Unaligned big-endian integers used for TPM wire fields.

    /// Big-endian `u16`.
    pub type u16_be = zerocopy::U16<zerocopy::BigEndian>;
    /// Big-endian `u32`.
    pub type u32_be = zerocopy::U32<zerocopy::BigEndian>;
}

/// Upper bound on the sub-capability selector carried by a `TPM_GetCapability`
/// command.
pub const MAX_SUB_CAP_SIZE: usize = 1024;

#[derive(Debug, Error)]
pub enum InvalidInput {
    #[error("sub-capability size too large - input size > upper bound: {0} > {1}")]
    SubCapSizeTooLarge(usize, usize),
}

/// Command and reply framing tags (`TPM_TAG`).
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
#[repr(u16)]
pub enum CommandTagEnum {
    /// A command with no authentication.
    RquCommand = 0x00C1,
    /// An authenticated command with one authentication handle.
    RquAuth1Command = 0x00C2,
    /// An authenticated command with two authentication handles.
    RquAuth2Command = 0x00C3,
    /// A response from a command with no authentication.
    RspCommand = 0x00C4,
    /// An authenticated response with one authentication handle.
    RspAuth1Command = 0x00C5,
    /// An authenticated response with two authentication handles.
    RspAuth2Command = 0x00C6,
}

impl CommandTagEnum {
    pub fn from_u16(val: u16) -> Option<CommandTagEnum> {
        let ret = match val {
            0x00C1 => Self::RquCommand,
            0x00C2 => Self::RquAuth1Command,
            0x00C3 => Self::RquAuth2Command,
            0x00C4 => Self::RspCommand,
            0x00C5 => Self::RspAuth1Command,
            0x00C6 => Self::RspAuth2Command,
            _ => return None,
        };
        Some(ret)
    }
}

/// `TPM_ORD_GetCapability`.
pub const TPM_ORD_GET_CAPABILITY: u32 = 0x0000_0065;

/// Capability areas (`TPM_CAPABILITY_AREA`).
/// See Section 21.1, "TPM Main Part 2: TPM Structures", version 1.2.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
#[repr(u32)]
pub enum CapabilityArea {
    /// Whether an ordinal is supported.
    Ord = 0x01,
    /// Whether an algorithm is supported.
    Alg = 0x02,
    /// Whether a protocol ID is supported.
    Pid = 0x03,
    /// Permanent and volatile flag sets.
    Flag = 0x04,
    /// Device properties selected by `TPM_CAP_PROP_*`.
    Property = 0x05,
    /// The `TPM_STRUCT_VER` of the device. Deprecated by `VersionVal`.
    Version = 0x06,
    /// Loaded key handles.
    KeyHandle = 0x07,
    /// Whether a key of the given parameters could be loaded.
    CheckLoaded = 0x08,
    /// Whether a symmetric mode is supported.
    SymMode = 0x09,
    /// Key status bits.
    KeyStatus = 0x0C,
    /// Defined NV indexes.
    NvList = 0x0D,
    /// Manufacturer-specific capabilities.
    Mfr = 0x10,
    /// Public data of an NV index.
    NvIndex = 0x11,
    /// Whether a transport algorithm is supported.
    TransAlg = 0x12,
    /// Loaded handles of a given resource type.
    Handle = 0x14,
    /// Whether a transport encryption scheme is supported.
    TransEs = 0x15,
    /// Whether an authorization encryption algorithm is supported.
    AuthEncrypt = 0x17,
    /// Whether a `TPM_PCR_SELECTION` size is supported.
    SelectSize = 0x18,
    /// Dictionary attack logic state.
    DaLogic = 0x19,
    /// The `TPM_CAP_VERSION_INFO` of the device.
    VersionVal = 0x1A,
}

impl From<CapabilityArea> for u32 {
    fn from(x: CapabilityArea) -> Self {
        x as u32
    }
}

impl CapabilityArea {
    pub fn from_u32(val: u32) -> Option<CapabilityArea> {
        let ret = match val {
            0x01 => Self::Ord,
            0x02 => Self::Alg,
            0x03 => Self::Pid,
            0x04 => Self::Flag,
            0x05 => Self::Property,
            0x06 => Self::Version,
            0x07 => Self::KeyHandle,
            0x08 => Self::CheckLoaded,
            0x09 => Self::SymMode,
            0x0C => Self::KeyStatus,
            0x0D => Self::NvList,
            0x10 => Self::Mfr,
            0x11 => Self::NvIndex,
            0x12 => Self::TransAlg,
            0x14 => Self::Handle,
            0x15 => Self::TransEs,
            0x17 => Self::AuthEncrypt,
            0x18 => Self::SelectSize,
            0x19 => Self::DaLogic,
            0x1A => Self::VersionVal,
            _ => return None,
        };
        Some(ret)
    }
}

// Sub-capabilities of `CapabilityArea::Flag`.
pub const TPM_CAP_FLAG_PERMANENT: u32 = 0x0000_0108;
pub const TPM_CAP_FLAG_VOLATILE: u32 = 0x0000_0109;

// Sub-capabilities of `CapabilityArea::Property`.
pub const TPM_CAP_PROP_PCR: u32 = 0x0000_0101;
pub const TPM_CAP_PROP_DIR: u32 = 0x0000_0102;
pub const TPM_CAP_PROP_MANUFACTURER: u32 = 0x0000_0103;
pub const TPM_CAP_PROP_KEYS: u32 = 0x0000_0104;

// Structure tags (`TPM_STRUCTURE_TAG`).
pub const TPM_TAG_PERMANENT_FLAGS: u16 = 0x001F;
pub const TPM_TAG_STCLEAR_FLAGS: u16 = 0x0020;
pub const TPM_TAG_CAP_VERSION_INFO: u16 = 0x0030;

/// Return codes (`TPM_RESULT`).
/// See Section 16, "TPM Main Part 2: TPM Structures", version 1.2.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
#[repr(u32)]
pub enum ResponseCode {
    Success = 0,
    /// Authentication failed.
    AuthFail = 1,
    /// The index to a PCR, DIR or other register is incorrect.
    BadIndex = 2,
    /// One or more parameter is bad.
    BadParameter = 3,
    /// The TPM is disabled.
    Disabled = 7,
    /// The target command has been disabled.
    DisabledCmd = 8,
    /// The operation failed.
    Fail = 9,
    /// The ordinal was unknown or inconsistent.
    BadOrdinal = 10,
    /// The tag value sent for a command is invalid.
    BadTag = 30,
    /// A mode parameter is bad, such as an unknown capability area.
    BadMode = 44,
    /// The TPM is too busy to respond to the command immediately.
    Retry = 0x800,
}

impl ResponseCode {
    pub fn from_u32(val: u32) -> Option<ResponseCode> {
        let ret = match val {
            0 => Self::Success,
            1 => Self::AuthFail,
            2 => Self::BadIndex,
            3 => Self::BadParameter,
            7 => Self::Disabled,
            8 => Self::DisabledCmd,
            9 => Self::Fail,
            10 => Self::BadOrdinal,
            30 => Self::BadTag,
            44 => Self::BadMode,
            0x800 => Self::Retry,
            _ => return None,
        };
        Some(ret)
    }
}

/// Workaround to allow constructing a zerocopy U32 in a const context.
const fn new_u32_be(val: u32) -> u32_be {
    u32_be::from_bytes(val.to_be_bytes())
}

/// Workaround to allow constructing a zerocopy U16 in a const context.
const fn new_u16_be(val: u16) -> u16_be {
    u16_be::from_bytes(val.to_be_bytes())
}

/// TPM command / response definitions
pub mod protocol {
    use super::*;

    /// Common structs shared between multiple command / response structs
    pub mod common {
        use super::*;

        /// Header of every TPM 1.2 command (`TPM_RQU_COMMAND_HDR`).
        #[repr(C)]
        #[derive(Debug, Copy, Clone, IntoBytes, Immutable, KnownLayout, FromBytes)]
        pub struct CmdHeader {
            pub tag: u16_be,
            /// Total size of the command in bytes, including this header.
            pub param_size: u32_be,
            pub ordinal: u32_be,
        }

        impl CmdHeader {
            pub const fn new(tag: CommandTagEnum, param_size: u32, ordinal: u32) -> CmdHeader {
                CmdHeader {
                    tag: new_u16_be(tag as u16),
                    param_size: new_u32_be(param_size),
                    ordinal: new_u32_be(ordinal),
                }
            }
        }

        /// Header of every TPM 1.2 reply (`TPM_RSP_COMMAND_HDR`).
        #[repr(C)]
        #[derive(Debug, Copy, Clone, IntoBytes, Immutable, KnownLayout, FromBytes)]
        pub struct ReplyHeader {
            pub tag: u16_be,
            /// Total size of the reply in bytes, including this header.
            pub param_size: u32_be,
            pub return_code: u32_be,
        }

        impl ReplyHeader {
            pub const fn new(tag: CommandTagEnum, param_size: u32, return_code: u32) -> ReplyHeader {
                ReplyHeader {
                    tag: new_u16_be(tag as u16),
                    param_size: new_u32_be(param_size),
                    return_code: new_u32_be(return_code),
                }
            }

            pub fn deserialize(bytes: &[u8]) -> Option<Self> {
                Some(Self::read_from_prefix(bytes).ok()?.0)
            }
        }

        const_assert_eq!(size_of::<CmdHeader>(), 10);
        const_assert_eq!(size_of::<ReplyHeader>(), 10);
    }

    use common::CmdHeader;
    use common::ReplyHeader;

    /// A fixed-layout capability output bound to the selectors that return it.
    pub trait CapabilityShape: IntoBytes + FromBytes + Immutable + KnownLayout {
        /// The capability area to query.
        const CAP_AREA: CapabilityArea;
        /// The sub-capability selector, if the area takes one.
        const SUB_CAP: Option<u32>;
    }

    // === Get Capability === //

    /// The fixed parameters following the header of a `TPM_GetCapability`
    /// command.
    #[repr(C)]
    #[derive(Debug, Copy, Clone, IntoBytes, Immutable, KnownLayout, FromBytes)]
    struct GetCapabilityParams {
        cap_area: u32_be,
        sub_cap_size: u32_be,
    }

    /// A `TPM_GetCapability` command.
    ///
    /// The sub-capability is an opaque byte string whose size is encoded ahead
    /// of it. For the flag and property areas it is a big-endian `u32`.
    #[derive(Debug, Clone, PartialEq, Eq)]
    pub struct GetCapabilityCmd {
        pub cap_area: u32,
        sub_cap: Vec<u8>,
    }

    impl GetCapabilityCmd {
        /// Create a command for an arbitrary capability area and sub-capability.
        pub fn new(cap_area: u32, sub_cap: &[u8]) -> Result<Self, InvalidInput> {
            if sub_cap.len() > MAX_SUB_CAP_SIZE {
                Err(InvalidInput::SubCapSizeTooLarge(
                    sub_cap.len(),
                    MAX_SUB_CAP_SIZE,
                ))?
            }

            Ok(Self {
                cap_area,
                sub_cap: sub_cap.to_vec(),
            })
        }

        /// Create a command whose sub-capability is a single `u32` selector, or
        /// empty when `sub_cap` is `None`.
        pub fn with_selector(cap_area: u32, sub_cap: Option<u32>) -> Self {
            Self {
                cap_area,
                sub_cap: sub_cap
                    .map(|v| new_u32_be(v).as_bytes().to_vec())
                    .unwrap_or_default(),
            }
        }

        /// Create the command that queries the given output shape.
        pub fn for_shape<S: CapabilityShape>() -> Self {
            Self::with_selector(S::CAP_AREA.into(), S::SUB_CAP)
        }

        pub fn sub_cap(&self) -> &[u8] {
            &self.sub_cap
        }

        /// The sub-capability interpreted as a `u32` selector, if it is one.
        pub fn sub_cap_u32(&self) -> Option<u32> {
            u32_be::read_from_bytes(&self.sub_cap).ok().map(|v| v.get())
        }

        /// Exact size of the encoded command.
        pub fn encoded_size(&self) -> usize {
            size_of::<CmdHeader>() + size_of::<GetCapabilityParams>() + self.sub_cap.len()
        }

        pub fn serialize(&self) -> Vec<u8> {
            let header = CmdHeader::new(
                CommandTagEnum::RquCommand,
                self.encoded_size() as u32,
                TPM_ORD_GET_CAPABILITY,
            );
            let params = GetCapabilityParams {
                cap_area: self.cap_area.into(),
                sub_cap_size: (self.sub_cap.len() as u32).into(),
            };

            let mut buffer = Vec::with_capacity(self.encoded_size());
            buffer.extend_from_slice(header.as_bytes());
            buffer.extend_from_slice(params.as_bytes());
            buffer.extend_from_slice(&self.sub_cap);

            buffer
        }

        /// Parse a `TPM_GetCapability` command. The header tag, ordinal and
        /// size, as well as the sub-capability size, must all agree with `bytes`.
        pub fn deserialize(bytes: &[u8]) -> Option<Self> {
            let (header, rest) = CmdHeader::read_from_prefix(bytes).ok()?;
            if header.tag.get() != CommandTagEnum::RquCommand as u16
                || header.ordinal.get() != TPM_ORD_GET_CAPABILITY
                || header.param_size.get() as usize != bytes.len()
            {
                return None;
            }

            let (params, sub_cap) = GetCapabilityParams::read_from_prefix(rest).ok()?;
            if params.sub_cap_size.get() as usize != sub_cap.len()
                || sub_cap.len() > MAX_SUB_CAP_SIZE
            {
                return None;
            }

            Some(Self {
                cap_area: params.cap_area.get(),
                sub_cap: sub_cap.to_vec(),
            })
        }
    }

    /// The fixed prefix of a `TPM_GetCapability` reply. The capability payload
    /// follows, of `resp_size` bytes as reported by the device.
    #[repr(C)]
    #[derive(Debug, Copy, Clone, IntoBytes, Immutable, KnownLayout, FromBytes)]
    pub struct GetCapabilityReplyHeader {
        pub header: ReplyHeader,
        pub resp_size: u32_be,
    }

    const_assert_eq!(size_of::<GetCapabilityReplyHeader>(), 14);

    impl GetCapabilityReplyHeader {
        pub fn deserialize(bytes: &[u8]) -> Option<Self> {
            Some(Self::read_from_prefix(bytes).ok()?.0)
        }
    }

    /// Build a successful `TPM_GetCapability` reply carrying `payload`.
    pub fn build_get_capability_reply(payload: &[u8]) -> Vec<u8> {
        build_get_capability_reply_with_size(payload, payload.len() as u32)
    }

    /// Build a successful `TPM_GetCapability` reply carrying `payload`, but
    /// reporting `resp_size` in the reply. Used to emulate devices that
    /// misreport their payload size.
    pub fn build_get_capability_reply_with_size(payload: &[u8], resp_size: u32) -> Vec<u8> {
        let size = size_of::<GetCapabilityReplyHeader>() + payload.len();
        let reply = GetCapabilityReplyHeader {
            header: ReplyHeader::new(
                CommandTagEnum::RspCommand,
                size as u32,
                ResponseCode::Success as u32,
            ),
            resp_size: resp_size.into(),
        };

        let mut buffer = Vec::with_capacity(size);
        buffer.extend_from_slice(reply.as_bytes());
        buffer.extend_from_slice(payload);

        buffer
    }

    /// Build a failed reply. A failing TPM 1.2 command returns only the header.
    pub fn build_error_reply(return_code: u32) -> Vec<u8> {
        ReplyHeader::new(
            CommandTagEnum::RspCommand,
            size_of::<ReplyHeader>() as u32,
            return_code,
        )
        .as_bytes()
        .to_vec()
    }
}

pub use protocol::CapabilityShape;

/// Declares a TPM 1.2 flag structure: a structure tag followed by one `BOOL`
/// byte per flag, in wire order.
macro_rules! tpm_flag_struct {
    (
        $(#[$attr:meta])*
        pub struct $name:ident: tag = $tag:path {
            $( $(#[$fattr:meta])* $field:ident, )*
        }
    ) => {
        $(#[$attr])*
        #[repr(C)]
        #[derive(Debug, Copy, Clone, PartialEq, Eq, IntoBytes, Immutable, KnownLayout, FromBytes)]
        pub struct $name {
            /// Structure tag identifying the layout version.
            pub tag: u16_be,
            $( $(#[$fattr])* pub $field: u8, )*
        }

        impl $name {
            /// The structure tag of this layout.
            pub const TAG: u16 = $tag;

            /// Number of flags following the tag.
            pub const FLAG_COUNT: usize = [$(stringify!($field)),*].len();

            /// A correctly tagged instance with every flag clear.
            pub fn new() -> Self {
                Self {
                    tag: new_u16_be(Self::TAG),
                    ..Self::new_zeroed()
                }
            }

            /// Every flag with its name, in wire order.
            pub fn flags(&self) -> [(&'static str, bool); Self::FLAG_COUNT] {
                [$((stringify!($field), self.$field != 0)),*]
            }

            /// Set the flag with the given name. Returns `false` if there is no
            /// such flag.
            pub fn set_flag(&mut self, name: &str, value: bool) -> bool {
                match name {
                    $(stringify!($field) => self.$field = value as u8,)*
                    _ => return false,
                }
                true
            }
        }

        impl Default for $name {
            fn default() -> Self {
                Self::new()
            }
        }
    };
}

tpm_flag_struct! {
    /// `TPM_PERMANENT_FLAGS`: flags that persist across TPM resets.
    /// See Section 7.1, "TPM Main Part 2: TPM Structures", version 1.2.
    pub struct PermanentFlags: tag = TPM_TAG_PERMANENT_FLAGS {
        disable,
        ownership,
        deactivated,
        read_pubek,
        disable_owner_clear,
        allow_maintenance,
        physical_presence_lifetime_lock,
        physical_presence_hw_enable,
        physical_presence_cmd_enable,
        /// Whether the endorsement key was created with `TPM_CreateEndorsementKeyPair`.
        cekp_used,
        tpm_post,
        tpm_post_lock,
        fips,
        operator,
        enable_revoke_ek,
        nv_locked,
        read_srk_pub,
        tpm_established,
        maintenance_done,
        disable_full_da_logic_info,
    }
}

tpm_flag_struct! {
    /// `TPM_STCLEAR_FLAGS`: volatile flags cleared by `TPM_Startup(ST_CLEAR)`.
    /// See Section 7.2, "TPM Main Part 2: TPM Structures", version 1.2.
    pub struct StClearFlags: tag = TPM_TAG_STCLEAR_FLAGS {
        deactivated,
        disable_force_clear,
        physical_presence,
        physical_presence_lock,
        global_lock,
    }
}

const_assert_eq!(size_of::<PermanentFlags>(), 22);
const_assert_eq!(size_of::<StClearFlags>(), 7);

impl CapabilityShape for PermanentFlags {
    const CAP_AREA: CapabilityArea = CapabilityArea::Flag;
    const SUB_CAP: Option<u32> = Some(TPM_CAP_FLAG_PERMANENT);
}

impl CapabilityShape for StClearFlags {
    const CAP_AREA: CapabilityArea = CapabilityArea::Flag;
    const SUB_CAP: Option<u32> = Some(TPM_CAP_FLAG_VOLATILE);
}

/// `TPM_VERSION`.
#[repr(C)]
#[derive(Debug, Copy, Clone, PartialEq, Eq, IntoBytes, Immutable, KnownLayout, FromBytes)]
pub struct TpmVersion {
    pub major: u8,
    pub minor: u8,
    pub rev_major: u8,
    pub rev_minor: u8,
}

/// The fixed prefix of `TPM_CAP_VERSION_INFO`. The vendor-specific bytes that
/// follow on the wire are not retained.
///
/// Devices may append up to `vendor_specific_size` bytes to this prefix, so a
/// reply buffer sized to the prefix alone can be too small. This type has no
/// [`CapabilityShape`] impl; query it with a page-sized buffer instead.
/// See Section 21.6, "TPM Main Part 2: TPM Structures", version 1.2.
#[repr(C)]
#[derive(Debug, Copy, Clone, PartialEq, Eq, IntoBytes, Immutable, KnownLayout, FromBytes)]
pub struct CapVersionInfo {
    pub tag: u16_be,
    pub version: TpmVersion,
    pub spec_level: u16_be,
    pub errata_rev: u8,
    pub tpm_vendor_id: [u8; 4],
    pub vendor_specific_size: u16_be,
}

const_assert_eq!(size_of::<CapVersionInfo>(), 15);
