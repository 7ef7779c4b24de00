//! CAN frame shape, 29-bit identifier codec and optional XOR checksum.
//!
//! The extended identifier packs three fields:
//!
//! ```text
//! bits 26..=28   priority (3 bits, preemption order)
//! bits 16..=25   module   (10 bits)
//! bits  0..=15   command  (16 bits)
//! ```
//!
//! Mask-and-shift round-trips are invariant: `decode(encode(p, m, c))`
//! yields the masked inputs, and `encode(decode(id))` yields `id`
//! restricted to 29 bits.

use crate::error::CanError;
use bitflags::bitflags;

/// Maximum CAN payload length [bytes].
pub const MAX_PAYLOAD: usize = 8;

/// Priority field position within the 29-bit identifier.
pub const PRIORITY_SHIFT: u32 = 26;
/// Priority field mask (3 bits).
pub const PRIORITY_MASK: u32 = 0x7;
/// Module field position.
pub const MODULE_SHIFT: u32 = 16;
/// Module field mask (10 bits).
pub const MODULE_MASK: u32 = 0x3FF;
/// Command field mask (16 bits).
pub const COMMAND_MASK: u32 = 0xFFFF;
/// Full 29-bit extended identifier mask.
pub const EXTENDED_ID_MASK: u32 = 0x1FFF_FFFF;

bitflags! {
    /// Wire-level frame flags, mirroring the driver contract.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
    pub struct FrameFlags: u8 {
        /// 29-bit extended identifier.
        const EXTENDED    = 0x01;
        /// Remote transmission request.
        const RTR         = 0x02;
        /// Loop the frame back to this node.
        const SELF_RX     = 0x04;
        /// Single-shot transmission (no controller-level retry).
        const SINGLE_SHOT = 0x08;
    }
}

impl Default for FrameFlags {
    fn default() -> Self {
        Self::EXTENDED
    }
}

/// A CAN frame as handled by the transport.
///
/// `retry_count` is transport-internal bookkeeping; it never reaches the
/// wire.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CanFrame {
    /// 29-bit extended identifier.
    pub id: u32,
    /// Data length code, 0..=8.
    pub dlc: u8,
    /// Payload bytes; only the first `dlc` are meaningful.
    pub data: [u8; MAX_PAYLOAD],
    /// Wire flags.
    pub flags: FrameFlags,
    /// Retransmission attempts consumed so far.
    pub retry_count: u8,
}

impl Default for CanFrame {
    fn default() -> Self {
        Self {
            id: 0,
            dlc: 0,
            data: [0; MAX_PAYLOAD],
            flags: FrameFlags::default(),
            retry_count: 0,
        }
    }
}

impl CanFrame {
    /// Build an extended frame from an identifier and payload.
    ///
    /// # Errors
    ///
    /// Returns `CanError::InvalidLength` when the payload exceeds 8 bytes.
    pub fn new(id: u32, payload: &[u8]) -> Result<Self, CanError> {
        if payload.len() > MAX_PAYLOAD {
            return Err(CanError::InvalidLength {
                len: payload.len(),
                limit: MAX_PAYLOAD,
            });
        }
        let mut data = [0u8; MAX_PAYLOAD];
        data[..payload.len()].copy_from_slice(payload);
        Ok(Self {
            id: id & EXTENDED_ID_MASK,
            dlc: payload.len() as u8,
            data,
            flags: FrameFlags::default(),
            retry_count: 0,
        })
    }

    /// Meaningful payload bytes.
    #[inline]
    pub fn payload(&self) -> &[u8] {
        &self.data[..self.dlc as usize]
    }

    /// The 3-bit preemption priority carried in the identifier.
    #[inline]
    pub const fn priority(&self) -> u8 {
        ((self.id >> PRIORITY_SHIFT) & PRIORITY_MASK) as u8
    }
}

/// Pack priority, module and command into a 29-bit extended identifier.
#[inline]
pub const fn encode_id(priority: u8, module: u16, command: u16) -> u32 {
    ((priority as u32 & PRIORITY_MASK) << PRIORITY_SHIFT)
        | ((module as u32 & MODULE_MASK) << MODULE_SHIFT)
        | (command as u32 & COMMAND_MASK)
}

/// Unpack a 29-bit extended identifier into `(priority, module, command)`.
#[inline]
pub const fn decode_id(id: u32) -> (u8, u16, u16) {
    (
        ((id >> PRIORITY_SHIFT) & PRIORITY_MASK) as u8,
        ((id >> MODULE_SHIFT) & MODULE_MASK) as u16,
        (id & COMMAND_MASK) as u16,
    )
}

// ─── Checksum ──────────────────────────────────────────────────────

/// XOR of all payload bytes.
#[inline]
pub fn xor_checksum(payload: &[u8]) -> u8 {
    payload.iter().fold(0, |acc, b| acc ^ b)
}

/// Append the XOR checksum as the frame's last byte.
///
/// # Errors
///
/// Returns `CanError::InvalidLength` when the payload already occupies all
/// 8 bytes.
pub fn apply_checksum(frame: &mut CanFrame) -> Result<(), CanError> {
    let len = frame.dlc as usize;
    if len >= MAX_PAYLOAD {
        return Err(CanError::InvalidLength {
            len,
            limit: MAX_PAYLOAD - 1,
        });
    }
    frame.data[len] = xor_checksum(&frame.data[..len]);
    frame.dlc += 1;
    Ok(())
}

/// Verify the trailing checksum byte and strip it from the frame.
///
/// On success the frame's `dlc` reports the user payload length, with the
/// checksum byte excluded.
///
/// # Errors
///
/// Returns `CanError::Receive` on an empty frame or a mismatching checksum.
pub fn verify_and_strip_checksum(frame: &mut CanFrame) -> Result<(), CanError> {
    let len = frame.dlc as usize;
    if len == 0 {
        return Err(CanError::Receive("checksum frame with empty payload".to_string()));
    }
    let expected = frame.data[len - 1];
    let actual = xor_checksum(&frame.data[..len - 1]);
    if expected != actual {
        return Err(CanError::Receive(format!(
            "checksum mismatch: expected {expected:#04x}, computed {actual:#04x}"
        )));
    }
    frame.dlc -= 1;
    frame.data[len - 1] = 0;
    Ok(())
}

static_assertions::const_assert_eq!(
    PRIORITY_MASK << PRIORITY_SHIFT | MODULE_MASK << MODULE_SHIFT | COMMAND_MASK,
    EXTENDED_ID_MASK
);

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn encode_reference_value() {
        assert_eq!(encode_id(1, 1, 0x101), 0x0401_0101);
        assert_eq!(decode_id(0x0401_0101), (1, 1, 0x101));
    }

    #[test]
    fn encode_masks_wide_inputs() {
        // Priority wider than 3 bits and module wider than 10 bits are masked.
        assert_eq!(decode_id(encode_id(0xFF, 0xFFFF, 0xFFFF)), (7, 0x3FF, 0xFFFF));
    }

    #[test]
    fn decode_encode_is_identity_on_29_bits() {
        for id in [0u32, 1, 0x0401_0101, 0x1FFF_FFFF, 0xFFFF_FFFF, 0x0F00_0001] {
            let (p, m, c) = decode_id(id);
            assert_eq!(encode_id(p, m, c), id & EXTENDED_ID_MASK);
        }
    }

    #[test]
    fn encode_decode_roundtrip_masks_fields() {
        for p in 0..8u8 {
            let (dp, dm, dc) = decode_id(encode_id(p, 0x155, 0xBEEF));
            assert_eq!((dp, dm, dc), (p, 0x155, 0xBEEF));
        }
    }

    #[test]
    fn frame_rejects_oversize_payload() {
        let result = CanFrame::new(0x100, &[0u8; 9]);
        assert!(matches!(result, Err(CanError::InvalidLength { len: 9, limit: 8 })));
    }

    #[test]
    fn frame_priority_tracks_id() {
        let frame = CanFrame::new(encode_id(5, 2, 0x10), &[1, 2]).unwrap();
        assert_eq!(frame.priority(), 5);
    }

    #[test]
    fn checksum_roundtrip() {
        let mut frame = CanFrame::new(0x100, &[0xDE, 0xAD, 0xBE, 0xEF]).unwrap();
        apply_checksum(&mut frame).unwrap();
        assert_eq!(frame.dlc, 5);

        verify_and_strip_checksum(&mut frame).unwrap();
        assert_eq!(frame.dlc, 4);
        assert_eq!(frame.payload(), &[0xDE, 0xAD, 0xBE, 0xEF]);
    }

    #[test]
    fn checksum_rejects_full_payload() {
        let mut frame = CanFrame::new(0x100, &[0u8; 8]).unwrap();
        assert!(matches!(
            apply_checksum(&mut frame),
            Err(CanError::InvalidLength { len: 8, limit: 7 })
        ));
    }

    #[test]
    fn mutated_byte_fails_verification() {
        let mut frame = CanFrame::new(0x100, &[1, 2, 3]).unwrap();
        apply_checksum(&mut frame).unwrap();
        frame.data[1] ^= 0x40;
        assert!(matches!(
            verify_and_strip_checksum(&mut frame),
            Err(CanError::Receive(_))
        ));
    }

    #[test]
    fn empty_checksum_frame_fails() {
        let mut frame = CanFrame::default();
        assert!(matches!(
            verify_and_strip_checksum(&mut frame),
            Err(CanError::Receive(_))
        ));
    }
}
