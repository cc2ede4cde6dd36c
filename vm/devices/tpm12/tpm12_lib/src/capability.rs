// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

//! `TPM_GetCapability` queries built on top of a [`Tpm12Transport`].

use crate::DeviceError;
use crate::Tpm12Error;
use crate::Tpm12Transport;
use crate::reconcile::reconcile;
use tpm12_protocol::TPM12_BUFFER_SIZE;
use tpm12_protocol::tpm12proto::CapVersionInfo;
use tpm12_protocol::tpm12proto::CapabilityArea;
use tpm12_protocol::tpm12proto::CapabilityShape;
use tpm12_protocol::tpm12proto::CommandTagEnum;
use tpm12_protocol::tpm12proto::PermanentFlags;
use tpm12_protocol::tpm12proto::ResponseCode;
use tpm12_protocol::tpm12proto::StClearFlags;
use tpm12_protocol::tpm12proto::TPM_CAP_PROP_MANUFACTURER;
use tpm12_protocol::tpm12proto::TPM_CAP_PROP_PCR;
use tpm12_protocol::tpm12proto::packed_nums::u32_be;
use tpm12_protocol::tpm12proto::protocol::GetCapabilityCmd;
use tpm12_protocol::tpm12proto::protocol::GetCapabilityReplyHeader;
use tpm12_protocol::tpm12proto::protocol::common::ReplyHeader;
use zerocopy::FromBytes;
use zerocopy::Immutable;
use zerocopy::IntoBytes;
use zerocopy::KnownLayout;

/// `TPM_CAP_VERSION_INFO` with its variable-length vendor-specific trailer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VersionInfo {
    /// The fixed prefix.
    pub info: CapVersionInfo,
    /// Vendor-specific bytes, clamped to what the device actually returned.
    pub vendor_specific: Vec<u8>,
}

/// Issues capability queries to a TPM 1.2 device through a transport.
///
/// Every query is a single synchronous exchange. Nothing is cached between
/// calls and failed exchanges are not retried.
pub struct Tpm12CommandHelper<T> {
    transport: T,
}

impl<T: Tpm12Transport> Tpm12CommandHelper<T> {
    /// Create a helper that issues commands through `transport`.
    pub fn new(transport: T) -> Self {
        Self { transport }
    }

    /// Access the underlying transport.
    pub fn transport_mut(&mut self) -> &mut T {
        &mut self.transport
    }

    /// Consume the helper, returning the underlying transport.
    pub fn into_transport(self) -> T {
        self.transport
    }

    /// Query `TPM_PERMANENT_FLAGS`.
    pub fn get_capability_flag_permanent(&mut self) -> Result<PermanentFlags, Tpm12Error> {
        self.get_capability::<PermanentFlags>()
    }

    /// Query `TPM_STCLEAR_FLAGS`, the volatile flags.
    pub fn get_capability_flag_volatile(&mut self) -> Result<StClearFlags, Tpm12Error> {
        self.get_capability::<StClearFlags>()
    }

    /// Query the number of PCRs the device implements.
    pub fn get_capability_pcr_count(&mut self) -> Result<u32, Tpm12Error> {
        let count: u32_be =
            self.get_capability_as(CapabilityArea::Property.into(), Some(TPM_CAP_PROP_PCR))?;
        Ok(count.get())
    }

    /// Query the manufacturer ID, four ASCII bytes packed big-endian.
    pub fn get_capability_manufacturer(&mut self) -> Result<u32, Tpm12Error> {
        let manufacturer: u32_be = self.get_capability_as(
            CapabilityArea::Property.into(),
            Some(TPM_CAP_PROP_MANUFACTURER),
        )?;
        Ok(manufacturer.get())
    }

    /// Query `TPM_CAP_VERSION_INFO`, including its vendor-specific trailer.
    pub fn get_capability_version_info(&mut self) -> Result<VersionInfo, Tpm12Error> {
        const PREFIX_SIZE: usize = size_of::<CapVersionInfo>();

        let mut out = vec![0u8; TPM12_BUFFER_SIZE - size_of::<GetCapabilityReplyHeader>()];
        let reported =
            self.get_capability_raw(CapabilityArea::VersionVal.into(), &[], &mut out)?;

        // `out` is larger than the prefix, so this cannot fail.
        let (info, rest) = CapVersionInfo::read_from_prefix(&out).map_err(|_| {
            DeviceError::ReplyTooShort {
                size: out.len(),
                expected: PREFIX_SIZE,
            }
        })?;

        let available = usize::try_from(reported)
            .unwrap_or(usize::MAX)
            .min(out.len())
            .saturating_sub(PREFIX_SIZE);
        let vendor_len = (info.vendor_specific_size.get() as usize).min(available);

        Ok(VersionInfo {
            info,
            vendor_specific: rest[..vendor_len].to_vec(),
        })
    }

    /// Query the capability bound to the output shape `S`.
    pub fn get_capability<S: CapabilityShape>(&mut self) -> Result<S, Tpm12Error> {
        let mut out = S::new_zeroed();
        self.execute_get_capability(&GetCapabilityCmd::for_shape::<S>(), out.as_mut_bytes())?;
        Ok(out)
    }

    /// Query an arbitrary capability area with an optional `u32`
    /// sub-capability selector, decoding the payload into `O`.
    pub fn get_capability_as<O>(&mut self, cap_area: u32, sub_cap: Option<u32>) -> Result<O, Tpm12Error>
    where
        O: IntoBytes + FromBytes + Immutable + KnownLayout,
    {
        let mut out = O::new_zeroed();
        self.execute_get_capability(
            &GetCapabilityCmd::with_selector(cap_area, sub_cap),
            out.as_mut_bytes(),
        )?;
        Ok(out)
    }

    /// Query an arbitrary capability area and sub-capability, copying the
    /// payload into `out`.
    ///
    /// `out` is zeroed and then receives at most `out.len()` payload bytes.
    /// Returns the payload size reported by the device, which may be larger or
    /// smaller than `out.len()`. On error the contents of `out` are unspecified.
    pub fn get_capability_raw(
        &mut self,
        cap_area: u32,
        sub_cap: &[u8],
        out: &mut [u8],
    ) -> Result<u32, Tpm12Error> {
        let cmd = GetCapabilityCmd::new(cap_area, sub_cap).map_err(Tpm12Error::InvalidInput)?;
        self.execute_get_capability(&cmd, out)
    }

    fn execute_get_capability(
        &mut self,
        cmd: &GetCapabilityCmd,
        out: &mut [u8],
    ) -> Result<u32, Tpm12Error> {
        const REPLY_HEADER_SIZE: usize = size_of::<GetCapabilityReplyHeader>();

        let command = cmd.serialize();

        // Room for exactly the largest payload `out` can hold.
        let mut reply = vec![0u8; REPLY_HEADER_SIZE + out.len()];
        let written = self.transport.submit(&command, &mut reply)?.min(reply.len());
        reply[written..].fill(0);

        let header = ReplyHeader::deserialize(&reply[..written]).ok_or(
            DeviceError::ReplyTooShort {
                size: written,
                expected: size_of::<ReplyHeader>(),
            },
        )?;

        if header.tag.get() != CommandTagEnum::RspCommand as u16 {
            Err(DeviceError::UnexpectedTag(header.tag.get()))?
        }

        let return_code = header.return_code.get();
        if return_code != ResponseCode::Success as u32 {
            Err(DeviceError::CommandFailed { return_code })?
        }

        let reply_header = GetCapabilityReplyHeader::deserialize(&reply[..written]).ok_or(
            DeviceError::ReplyTooShort {
                size: written,
                expected: REPLY_HEADER_SIZE,
            },
        )?;

        let resp_size = reply_header.resp_size.get();
        reconcile(out, &reply[REPLY_HEADER_SIZE..], resp_size);

        Ok(resp_size)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::VecDeque;
    use tpm12_protocol::tpm12proto::TPM_CAP_FLAG_PERMANENT;
    use tpm12_protocol::tpm12proto::TPM_CAP_FLAG_VOLATILE;
    use tpm12_protocol::tpm12proto::TPM_TAG_CAP_VERSION_INFO;
    use tpm12_protocol::tpm12proto::TpmVersion;
    use tpm12_protocol::tpm12proto::packed_nums::u16_be;
    use tpm12_protocol::tpm12proto::protocol::build_error_reply;
    use tpm12_protocol::tpm12proto::protocol::build_get_capability_reply;
    use tpm12_protocol::tpm12proto::protocol::build_get_capability_reply_with_size;

    enum Step {
        /// Write `bytes` and report their length.
        Reply(Vec<u8>),
        /// Write as much of `bytes` as fits, but report `written`.
        Raw { bytes: Vec<u8>, written: usize },
        /// Fail the exchange.
        Fail(fn() -> Tpm12Error),
    }

    /// A transport that replays a fixed script and records what it was sent.
    #[derive(Default)]
    struct ScriptedTransport {
        script: VecDeque<Step>,
        commands: Vec<Vec<u8>>,
        capacities: Vec<usize>,
    }

    impl ScriptedTransport {
        fn new(steps: impl IntoIterator<Item = Step>) -> Self {
            Self {
                script: steps.into_iter().collect(),
                ..Default::default()
            }
        }
    }

    impl Tpm12Transport for ScriptedTransport {
        fn submit(&mut self, command: &[u8], reply: &mut [u8]) -> Result<usize, Tpm12Error> {
            self.commands.push(command.to_vec());
            self.capacities.push(reply.len());

            match self.script.pop_front().expect("unexpected command") {
                Step::Reply(bytes) => {
                    if bytes.len() > reply.len() {
                        return Err(Tpm12Error::BufferTooSmall {
                            size: bytes.len(),
                            capacity: reply.len(),
                        });
                    }
                    reply[..bytes.len()].copy_from_slice(&bytes);
                    Ok(bytes.len())
                }
                Step::Raw { bytes, written } => {
                    let len = bytes.len().min(reply.len());
                    reply[..len].copy_from_slice(&bytes[..len]);
                    Ok(written)
                }
                Step::Fail(error) => Err(error()),
            }
        }
    }

    fn helper(steps: impl IntoIterator<Item = Step>) -> Tpm12CommandHelper<ScriptedTransport> {
        Tpm12CommandHelper::new(ScriptedTransport::new(steps))
    }

    fn permanent_flags_pattern() -> PermanentFlags {
        let mut flags = PermanentFlags::new();
        for name in ["disable", "nv_locked", "tpm_established"] {
            assert!(flags.set_flag(name, true));
        }
        flags
    }

    #[test]
    fn test_permanent_flags_exact_size() {
        let expected = permanent_flags_pattern();
        let mut helper = helper([Step::Reply(build_get_capability_reply(
            expected.as_bytes(),
        ))]);

        let flags = helper.get_capability_flag_permanent().unwrap();
        assert_eq!(flags, expected);

        let transport = helper.into_transport();
        assert_eq!(
            transport.commands,
            [GetCapabilityCmd::with_selector(
                CapabilityArea::Flag.into(),
                Some(TPM_CAP_FLAG_PERMANENT)
            )
            .serialize()]
        );
        assert_eq!(
            transport.capacities,
            [size_of::<GetCapabilityReplyHeader>() + size_of::<PermanentFlags>()]
        );
    }

    #[test]
    fn test_volatile_flags_exact_size() {
        let mut expected = StClearFlags::new();
        assert!(expected.set_flag("physical_presence_lock", true));
        let mut helper = helper([Step::Reply(build_get_capability_reply(
            expected.as_bytes(),
        ))]);

        assert_eq!(helper.get_capability_flag_volatile().unwrap(), expected);

        let command = &helper.transport_mut().commands[0];
        let parsed = GetCapabilityCmd::deserialize(command).unwrap();
        assert_eq!(parsed.cap_area, CapabilityArea::Flag as u32);
        assert_eq!(parsed.sub_cap_u32(), Some(TPM_CAP_FLAG_VOLATILE));
    }

    #[test]
    fn test_short_payload_zero_fills_tail() {
        let mut helper = helper([Step::Reply(build_get_capability_reply(&[0xab, 0xcd]))]);

        let mut out = [0xff; 4];
        let reported = helper
            .get_capability_raw(CapabilityArea::Flag.into(), &[0, 0, 1, 8], &mut out)
            .unwrap();
        assert_eq!(reported, 2);
        assert_eq!(out, [0xab, 0xcd, 0x00, 0x00]);
    }

    #[test]
    fn test_short_payload_leaves_newer_flags_unset() {
        // An older device that only knows the first four permanent flags.
        let payload = [0x00, 0x1f, 0x01, 0x01, 0x01, 0x01];
        let mut helper = helper([Step::Reply(build_get_capability_reply(&payload))]);

        let flags = helper.get_capability_flag_permanent().unwrap();
        assert_eq!(flags.as_bytes()[..payload.len()], payload);
        assert!(flags.as_bytes()[payload.len()..].iter().all(|b| *b == 0));
    }

    #[test]
    fn test_oversized_report_is_clamped() {
        let expected = permanent_flags_pattern();
        let mut helper = helper([
            Step::Reply(build_get_capability_reply_with_size(
                expected.as_bytes(),
                u32::MAX,
            )),
            Step::Reply(build_get_capability_reply_with_size(
                &[0x42; 4],
                u32::MAX,
            )),
        ]);

        assert_eq!(helper.get_capability_flag_permanent().unwrap(), expected);

        // Nothing beyond the caller's output is written.
        let mut buffer = [0xee; 8];
        let reported = helper
            .get_capability_raw(CapabilityArea::Mfr.into(), &[], &mut buffer[..4])
            .unwrap();
        assert_eq!(reported, u32::MAX);
        assert_eq!(buffer, [0x42, 0x42, 0x42, 0x42, 0xee, 0xee, 0xee, 0xee]);
    }

    #[test]
    fn test_undelivered_bytes_read_as_zero() {
        // The transport leaves bytes in the buffer past the length it reports.
        let reply = build_get_capability_reply_with_size(&[0x01; 22], 22);
        let mut helper = helper([Step::Raw {
            written: size_of::<GetCapabilityReplyHeader>() + 2,
            bytes: reply,
        }]);

        let flags = helper.get_capability_flag_permanent().unwrap();
        assert_eq!(flags.as_bytes()[..2], [0x01, 0x01]);
        assert!(flags.as_bytes()[2..].iter().all(|b| *b == 0));
    }

    #[test]
    fn test_overreported_written_length() {
        let expected = permanent_flags_pattern();
        let mut helper = helper([Step::Raw {
            bytes: build_get_capability_reply(expected.as_bytes()),
            written: usize::MAX,
        }]);

        assert_eq!(helper.get_capability_flag_permanent().unwrap(), expected);
    }

    #[test]
    fn test_timeout_propagates_without_decoding() {
        let mut helper = helper([Step::Fail(|| Tpm12Error::Timeout)]);

        let mut out = [0xee; 4];
        let result = helper.get_capability_raw(CapabilityArea::Flag.into(), &[0, 0, 1, 8], &mut out);
        assert!(matches!(result, Err(Tpm12Error::Timeout)));
        assert_eq!(out, [0xee; 4]);
    }

    #[test]
    fn test_device_error_propagates() {
        let mut helper = helper([Step::Fail(|| {
            Tpm12Error::DeviceError(DeviceError::Io(std::io::ErrorKind::BrokenPipe.into()))
        })]);

        let result = helper.get_capability_flag_volatile();
        assert!(matches!(
            result,
            Err(Tpm12Error::DeviceError(DeviceError::Io(_)))
        ));
    }

    #[test]
    fn test_buffer_too_small_propagates() {
        // A newer device reporting far more than the local layout holds.
        let mut helper = helper([Step::Reply(build_get_capability_reply(&[0; 64]))]);

        let result = helper.get_capability_flag_volatile();
        assert!(matches!(
            result,
            Err(Tpm12Error::BufferTooSmall { size: 78, capacity: 21 })
        ));
    }

    #[test]
    fn test_reply_too_short() {
        let mut helper = helper([
            Step::Reply(vec![0x00, 0xc4, 0x00, 0x00, 0x00, 0x08, 0x00, 0x00]),
            Step::Reply(build_error_reply(ResponseCode::Success as u32)),
        ]);

        let result = helper.get_capability_flag_permanent();
        assert!(matches!(
            result,
            Err(Tpm12Error::DeviceError(DeviceError::ReplyTooShort {
                size: 8,
                expected: 10
            }))
        ));

        let result = helper.get_capability_flag_permanent();
        assert!(matches!(
            result,
            Err(Tpm12Error::DeviceError(DeviceError::ReplyTooShort {
                size: 10,
                expected: 14
            }))
        ));
    }

    #[test]
    fn test_command_failed() {
        let mut helper = helper([Step::Reply(build_error_reply(ResponseCode::BadMode as u32))]);

        let result = helper.get_capability_as::<u32_be>(0xdead, None);
        assert!(matches!(
            result,
            Err(Tpm12Error::DeviceError(DeviceError::CommandFailed {
                return_code: 44
            }))
        ));
    }

    #[test]
    fn test_unexpected_tag() {
        let mut reply = build_get_capability_reply(&[0; 7]);
        reply[1] = 0xc5;
        let mut helper = helper([Step::Reply(reply)]);

        let result = helper.get_capability_flag_volatile();
        assert!(matches!(
            result,
            Err(Tpm12Error::DeviceError(DeviceError::UnexpectedTag(0x00c5)))
        ));
    }

    #[test]
    fn test_sub_cap_too_large_is_not_submitted() {
        let mut helper = helper([]);

        let mut out = [0; 4];
        let result = helper.get_capability_raw(CapabilityArea::Mfr.into(), &[0; 4096], &mut out);
        assert!(matches!(result, Err(Tpm12Error::InvalidInput(_))));
        assert!(helper.into_transport().commands.is_empty());
    }

    fn version_info(vendor_specific_size: u16) -> CapVersionInfo {
        CapVersionInfo {
            tag: TPM_TAG_CAP_VERSION_INFO.into(),
            version: TpmVersion {
                major: 1,
                minor: 2,
                rev_major: 3,
                rev_minor: 17,
            },
            spec_level: u16_be::new(2),
            errata_rev: 3,
            tpm_vendor_id: *b"IBM\0",
            vendor_specific_size: vendor_specific_size.into(),
        }
    }

    #[test]
    fn test_properties() {
        let mut helper = helper([
            Step::Reply(build_get_capability_reply(&24u32.to_be_bytes())),
            Step::Reply(build_get_capability_reply(b"IBM\0")),
            Step::Reply(build_get_capability_reply(version_info(0).as_bytes())),
        ]);

        assert_eq!(helper.get_capability_pcr_count().unwrap(), 24);
        assert_eq!(
            helper.get_capability_manufacturer().unwrap(),
            u32::from_be_bytes(*b"IBM\0")
        );
        let version = helper.get_capability_version_info().unwrap();
        assert_eq!(version.info, version_info(0));
        assert!(version.vendor_specific.is_empty());

        let commands = helper.into_transport().commands;
        let sub_caps: Vec<_> = commands
            .iter()
            .map(|c| GetCapabilityCmd::deserialize(c).unwrap().sub_cap_u32())
            .collect();
        assert_eq!(
            sub_caps,
            [Some(TPM_CAP_PROP_PCR), Some(TPM_CAP_PROP_MANUFACTURER), None]
        );
    }

    #[test]
    fn test_version_info_vendor_specific() {
        let mut payload = version_info(4).as_bytes().to_vec();
        payload.extend_from_slice(b"abcd");

        // A device that claims more vendor bytes than it sends.
        let mut truncated = version_info(32).as_bytes().to_vec();
        truncated.extend_from_slice(b"xy");

        let mut helper = helper([
            Step::Reply(build_get_capability_reply(&payload)),
            Step::Reply(build_get_capability_reply(&truncated)),
        ]);

        let info = helper.get_capability_version_info().unwrap();
        assert_eq!(info.info, version_info(4));
        assert_eq!(info.vendor_specific, b"abcd");

        let info = helper.get_capability_version_info().unwrap();
        assert_eq!(info.vendor_specific, b"xy");
    }

    #[test]
    fn test_works_through_trait_object() {
        let expected = StClearFlags::new();
        let mut transport = ScriptedTransport::new([Step::Reply(build_get_capability_reply(
            expected.as_bytes(),
        ))]);
        let dyn_transport: &mut dyn Tpm12Transport = &mut transport;

        let mut helper = Tpm12CommandHelper::new(dyn_transport);
        assert_eq!(helper.get_capability_flag_volatile().unwrap(), expected);
        assert_eq!(transport.commands.len(), 1);
    }
}
