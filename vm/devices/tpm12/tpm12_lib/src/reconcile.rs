// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

//! Copying a device-sized capability payload into a fixed-size local output.
//!
//! A device may report more bytes than the local structure holds (a newer
//! layout) or fewer (an older layout). The output is always zeroed first, so
//! bytes the device did not supply read as zero, i.e. "unset". The copy is
//! then clamped to the output size whatever size the device claims.

/// Zero `out`, then copy the first `min(out.len(), reported_size)` bytes of
/// `payload` into it.
///
/// `reported_size` is untrusted and is not validated beyond the clamp. The copy
/// is additionally bounded by `payload.len()`; callers pass a payload at least
/// as large as `out`, with undelivered bytes already zero.
///
/// Returns the number of bytes copied.
pub fn reconcile(out: &mut [u8], payload: &[u8], reported_size: u32) -> usize {
    out.fill(0);

    let len = usize::try_from(reported_size)
        .unwrap_or(usize::MAX)
        .min(out.len())
        .min(payload.len());
    out[..len].copy_from_slice(&payload[..len]);

    len
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn exact_size_round_trip() {
        let payload = [0x12, 0x34, 0x56, 0x78, 0x9a];
        let mut out = [0xff; 5];
        assert_eq!(reconcile(&mut out, &payload, payload.len() as u32), 5);
        assert_eq!(out, payload);
    }

    #[test]
    fn short_report_leaves_zero_tail() {
        let payload = [0xaa, 0xbb, 0xcc, 0xdd];
        let mut out = [0xff; 4];
        assert_eq!(reconcile(&mut out, &payload, 2), 2);
        assert_eq!(out, [0xaa, 0xbb, 0x00, 0x00]);
    }

    #[test]
    fn zero_report_zeroes_everything() {
        let payload = [0x11; 8];
        let mut out = [0xff; 8];
        assert_eq!(reconcile(&mut out, &payload, 0), 0);
        assert_eq!(out, [0; 8]);
    }

    #[test]
    fn oversized_report_is_clamped() {
        let payload = [0x5a; 16];
        for reported in [9, 16, 0x1000, u32::MAX] {
            let mut out = [0u8; 8];
            assert_eq!(reconcile(&mut out, &payload, reported), 8);
            assert_eq!(out, [0x5a; 8]);
        }
    }

    #[test]
    fn copy_bounded_by_payload() {
        let payload = [0x77; 3];
        let mut out = [0xff; 6];
        assert_eq!(reconcile(&mut out, &payload, u32::MAX), 3);
        assert_eq!(out, [0x77, 0x77, 0x77, 0, 0, 0]);
    }

    #[test]
    fn stale_output_never_survives() {
        // Every output byte is overwritten, whatever the reported size.
        for reported in 0..=10 {
            let mut out = [0xee; 6];
            let copied = reconcile(&mut out, &[0x01; 6], reported);
            assert!(out[..copied].iter().all(|b| *b == 0x01));
            assert!(out[copied..].iter().all(|b| *b == 0));
        }
    }
}
