//! Bus-level message header packing and parsing.
//!
//! A MESSAGE frame's payload starts with the command byte, a one-byte
//! transfer ID, and a 4-byte little-endian packed header:
//!
//! - **anonymous broadcast** (source 0): 2-bit type ID, no destination.
//! - **named broadcast**: 7-bit source, 16-bit type ID.
//! - **service request/response**: 7-bit source, 7-bit destination, 8-bit
//!   type ID, with the service bit in the source byte and the
//!   request/response discriminator in the destination byte.
//!
//! A 5-bit priority rides in the fourth header byte alongside the 5-bit
//! transfer ID carried next to the command byte.

use crate::error::{ModlinkError, Result};
use crate::link::{command, DecodedFrame, PartialFrame};

/// Largest application payload that fits a single frame.
pub const MAX_PAYLOAD_LENGTH: usize = 245;

/// Well-known message and service type IDs.
pub mod type_id {
    // Broadcast types.
    pub const ALLOCATION: u16 = 1;
    pub const NODE_STATUS: u16 = 341;
    pub const PUBLISHED_FIELDS: u16 = 20000;

    // Service types.
    pub const GET_NODE_INFO: u8 = 1;
    pub const SUBSCRIBE_DEFAULT_FIELDS: u8 = 200;
    pub const GET_PREFERRED_NAME: u8 = 202;
    pub const ENUMERATE_FIELDS: u8 = 204;
    /// First of 16 consecutive field-write service types.
    pub const SET_FIELDS: u8 = 216;
}

/// Pack a broadcast header. An anonymous source (0) reduces the type ID
/// to its low two bits.
pub fn pack_broadcast(source: u8, type_id: u16, priority: u8) -> u32 {
    let type_bits = if source != 0 {
        (type_id as u32) << 8
    } else {
        ((type_id & 0x3) as u32) << 8
    };
    (source & 0x7F) as u32 | type_bits | ((priority & 0x1F) as u32) << 24
}

/// Pack a service request header.
pub fn pack_request(source: u8, destination: u8, type_id: u8, priority: u8) -> u32 {
    0x8080
        | (source & 0x7F) as u32
        | ((destination & 0x7F) as u32) << 8
        | (type_id as u32) << 16
        | ((priority & 0x1F) as u32) << 24
}

/// Pack a service response header.
pub fn pack_response(source: u8, destination: u8, type_id: u8, priority: u8) -> u32 {
    0x80 | (source & 0x7F) as u32
        | ((destination & 0x7F) as u32) << 8
        | (type_id as u32) << 16
        | ((priority & 0x1F) as u32) << 24
}

/// Build a complete MESSAGE frame body into `frame`.
pub fn write_message(
    frame: &mut PartialFrame,
    header: u32,
    transfer_id: u8,
    payload: &[u8],
) -> Result<()> {
    if payload.len() > MAX_PAYLOAD_LENGTH {
        return Err(ModlinkError::Protocol(
            "payload too long to fit a single frame".to_string(),
        ));
    }
    frame.write(command::MESSAGE)?;
    frame.write(transfer_id & 0x1F)?;
    frame.write_slice(&header.to_le_bytes())?;
    frame.write_slice(payload)?;
    Ok(())
}

/// Kind of a parsed bus message.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MessageKind {
    Broadcast,
    Request,
    Response,
}

/// A parsed MESSAGE frame, borrowing its payload from the frame buffer.
#[derive(Debug)]
pub struct BusMessage<'a> {
    pub kind: MessageKind,
    pub source: u8,
    /// Zero for broadcasts.
    pub destination: u8,
    pub type_id: u16,
    pub transfer_id: u8,
    pub priority: u8,
    pub payload: &'a [u8],
}

impl BusMessage<'_> {
    /// Whether this broadcast came from an anonymous node.
    pub fn is_anonymous(&self) -> bool {
        self.source == 0
    }
}

/// Parse a validated data frame into a bus message.
///
/// Returns `None` for non-MESSAGE frames and for frames too short to
/// carry a header (logged, since the link has already vouched for their
/// integrity).
pub fn parse(frame: &DecodedFrame) -> Option<BusMessage<'_>> {
    let bytes = frame.as_slice();
    let length = bytes.len();
    if length == 0 {
        return None;
    } else if length < 2 {
        tracing::warn!("received single-byte frame");
        return None;
    }
    if bytes[1] != command::MESSAGE {
        return None; // Ignore any non-bus frames.
    }
    if length < 10 {
        tracing::warn!(length, "received truncated bus frame");
        return None;
    }
    let transfer_id = bytes[2] & 0x1F;
    let source = bytes[3] & 0x7F;
    let priority = bytes[6] & 0x1F;
    let start = 7; // Payload start.
    let end = length - 3; // Payload end: sequence and CRC bytes follow.
    let payload = &bytes[start..end];
    if bytes[3] & 0x80 == 0 {
        let type_id = if source == 0 {
            (bytes[4] & 0x03) as u16
        } else {
            bytes[4] as u16 | (bytes[5] as u16) << 8
        };
        Some(BusMessage {
            kind: MessageKind::Broadcast,
            source,
            destination: 0,
            type_id,
            transfer_id,
            priority,
            payload,
        })
    } else {
        let destination = bytes[4] & 0x7F;
        let type_id = bytes[5] as u16;
        let kind = if bytes[4] & 0x80 == 0 {
            MessageKind::Response
        } else {
            MessageKind::Request
        };
        Some(BusMessage {
            kind,
            source,
            destination,
            type_id,
            transfer_id,
            priority,
            payload,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::link::seal_message;

    /// Run a built frame through the sealing path and back into a decoded
    /// frame, as the link would.
    fn loop_back(partial: &PartialFrame) -> DecodedFrame {
        let mut array = [0u8; 256];
        array[1..1 + partial.len()].copy_from_slice(partial.as_slice());
        let length = seal_message(&mut array, 1 + partial.len(), 9).unwrap();
        let mut decoded = array[..length - 1].to_vec();
        let decoded_len = decoded.len();
        let counter = crate::link::cobs::decode(&mut decoded, 0, 0, decoded_len).unwrap();
        assert_eq!(counter, 0);
        let mut frame = DecodedFrame::new();
        frame.write_slice(&decoded).unwrap();
        frame
    }

    #[test]
    fn test_named_broadcast_round_trip() {
        let mut partial = PartialFrame::new();
        let header = pack_broadcast(127, type_id::PUBLISHED_FIELDS, 20);
        write_message(&mut partial, header, 17, &[9, 8, 7]).unwrap();
        let frame = loop_back(&partial);
        let message = parse(&frame).unwrap();
        assert_eq!(message.kind, MessageKind::Broadcast);
        assert_eq!(message.source, 127);
        assert_eq!(message.type_id, type_id::PUBLISHED_FIELDS);
        assert_eq!(message.transfer_id, 17);
        assert_eq!(message.priority, 20);
        assert_eq!(message.payload, &[9, 8, 7]);
        assert!(!message.is_anonymous());
    }

    #[test]
    fn test_anonymous_broadcast_round_trip() {
        let mut partial = PartialFrame::new();
        let header = pack_broadcast(0, type_id::ALLOCATION, 20);
        write_message(&mut partial, header, 3, &[1, 2, 3, 4]).unwrap();
        let frame = loop_back(&partial);
        let message = parse(&frame).unwrap();
        assert_eq!(message.kind, MessageKind::Broadcast);
        assert_eq!(message.source, 0);
        assert!(message.is_anonymous());
        assert_eq!(message.type_id, type_id::ALLOCATION);
    }

    #[test]
    fn test_request_round_trip() {
        let mut partial = PartialFrame::new();
        let header = pack_request(127, 5, type_id::ENUMERATE_FIELDS, 20);
        write_message(&mut partial, header, 31, &[0x12, 0x00, 0x00]).unwrap();
        let frame = loop_back(&partial);
        let message = parse(&frame).unwrap();
        assert_eq!(message.kind, MessageKind::Request);
        assert_eq!(message.source, 127);
        assert_eq!(message.destination, 5);
        assert_eq!(message.type_id, type_id::ENUMERATE_FIELDS as u16);
        assert_eq!(message.transfer_id, 31);
    }

    #[test]
    fn test_response_round_trip() {
        let mut partial = PartialFrame::new();
        let header = pack_response(5, 127, type_id::GET_NODE_INFO, 10);
        write_message(&mut partial, header, 2, &[0xAB]).unwrap();
        let frame = loop_back(&partial);
        let message = parse(&frame).unwrap();
        assert_eq!(message.kind, MessageKind::Response);
        assert_eq!(message.source, 5);
        assert_eq!(message.destination, 127);
        assert_eq!(message.type_id, type_id::GET_NODE_INFO as u16);
        assert_eq!(message.priority, 10);
        assert_eq!(message.payload, &[0xAB]);
    }

    #[test]
    fn test_payload_length_bound() {
        let mut partial = PartialFrame::new();
        let header = pack_broadcast(1, 7, 0);
        let payload = [0u8; MAX_PAYLOAD_LENGTH + 1];
        assert!(write_message(&mut partial, header, 0, &payload).is_err());
    }

    #[test]
    fn test_non_message_frames_are_ignored() {
        let mut frame = DecodedFrame::new();
        frame.write_slice(&[0x00, 0xFF, 0x01, 0x00, 0x00]).unwrap();
        assert!(parse(&frame).is_none());
    }

    #[test]
    fn test_truncated_message_is_ignored() {
        let mut frame = DecodedFrame::new();
        frame
            .write_slice(&[0x00, command::MESSAGE, 0x01, 0x02, 0x03])
            .unwrap();
        assert!(parse(&frame).is_none());
    }
}
