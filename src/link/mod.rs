//! Link framing: COBS byte stuffing, CRC16 corruption detection, frame
//! buffers, and the control-frame vocabulary of the reliability protocol.
//!
//! Every wire frame has the shape
//!
//! ```text
//! [COBS overhead][command][command-specific bytes...][CRC16 hi][CRC16 lo][0x00]
//! ```
//!
//! COBS-encoded so that no byte before the trailing delimiter is zero.
//! MESSAGE frames additionally carry a one-byte sequence number directly
//! before the CRC, which drives the acknowledge/retransmit window.

pub mod cobs;
pub mod crc16;
mod frame;

pub use frame::{DecodedFrame, EncodedFrame, Frame, PartialFrame, FRAME_CAPACITY};

use crate::error::{ModlinkError, Result};

/// Wire command codes. The first payload byte of every frame determines its
/// interpretation; codes at or above [`command::RESPONSE_FLOOR`] are
/// replies fed back to the egress engine.
pub mod command {
    /// Keepalive probe; answered with PONG.
    pub const PING: u8 = 0x00;
    /// Channel initialisation carrying version and start sequence.
    pub const INITIALISE: u8 = 0x1E;
    /// Application data frame.
    pub const MESSAGE: u8 = 0x2D;
    /// Lowest reply code.
    pub const RESPONSE_FLOOR: u8 = 0xA0;
    /// Acknowledgement of a data frame, carries the sequence number.
    pub const ACKNOWLEDGE: u8 = 0xAA;
    /// Confirmation of INITIALISE.
    pub const INITIALISED: u8 = 0xB4;
    /// Refusal of data while the ingress side is uninitialised.
    pub const UNINITIALISED: u8 = 0xCC;
    /// Reply to PING, carries the protocol version.
    pub const PONG: u8 = 0xFF;
}

/// Protocol version spoken by this implementation. Peers must mutually
/// support at least version 1.
pub const PROTOCOL_VERSION: u8 = 1;

/// Smallest valid decoded frame: COBS byte, command byte, two CRC bytes.
pub const MIN_DECODED_LENGTH: usize = 4;

fn seal_control(array: &mut [u8], body: usize) -> Result<usize> {
    // `body` counts the command byte plus its operands; the CRC is
    // computed over exactly those bytes.
    let checksum = crc16::calculate(array, 1, body);
    array[1 + body] = (checksum >> 8) as u8;
    array[2 + body] = (checksum & 0xFF) as u8;
    cobs::encode(array, 0, 1, body + 2)?;
    array[3 + body] = 0x00;
    Ok(body + 4)
}

/// Write a PING frame into `array`, returning its total length.
pub fn write_ping(array: &mut [u8]) -> Result<usize> {
    array[1] = command::PING;
    seal_control(array, 1)
}

/// Write a PONG frame carrying `version` into `array`.
pub fn write_pong(array: &mut [u8], version: u8) -> Result<usize> {
    array[1] = command::PONG;
    array[2] = version;
    seal_control(array, 2)
}

/// Write an INITIALISE frame carrying `version` and the starting
/// acceptance `sequence` into `array`.
pub fn write_initialise(array: &mut [u8], version: u8, sequence: u8) -> Result<usize> {
    array[1] = command::INITIALISE;
    array[2] = version;
    array[3] = sequence;
    seal_control(array, 3)
}

/// Write an INITIALISED confirmation frame into `array`.
pub fn write_initialised(array: &mut [u8]) -> Result<usize> {
    array[1] = command::INITIALISED;
    seal_control(array, 1)
}

/// Write an UNINITIALISED refusal frame into `array`.
pub fn write_uninitialised(array: &mut [u8]) -> Result<usize> {
    array[1] = command::UNINITIALISED;
    seal_control(array, 1)
}

/// Write an ACKNOWLEDGE frame for `sequence` into `array`.
pub fn write_acknowledge(array: &mut [u8], sequence: u8) -> Result<usize> {
    array[1] = command::ACKNOWLEDGE;
    array[2] = sequence;
    seal_control(array, 2)
}

/// Seal an outgoing MESSAGE frame in place.
///
/// `array[1..prefix_length]` must already hold the command byte and
/// payload, with `array[0]` reserved for the COBS overhead byte. Appends
/// the sequence byte, the CRC16 over everything after the overhead byte,
/// COBS-encodes, and writes the delimiter. Returns the total frame length.
pub fn seal_message(array: &mut [u8], prefix_length: usize, sequence: u8) -> Result<usize> {
    if prefix_length < 2 {
        return Err(ModlinkError::Protocol("frame buffer is empty".to_string()));
    } else if prefix_length > 252 {
        return Err(ModlinkError::Protocol(
            "frame buffer is too full".to_string(),
        ));
    }
    array[prefix_length] = sequence;
    let checksum = crc16::calculate(array, 1, prefix_length);
    array[prefix_length + 1] = (checksum >> 8) as u8;
    array[prefix_length + 2] = (checksum & 0xFF) as u8;
    cobs::encode(array, 0, 1, prefix_length + 2)?;
    array[prefix_length + 3] = 0x00;
    Ok(prefix_length + 4)
}
