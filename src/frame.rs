//! Wire codec for the N-ranges frame family
//!
//! Frames are byte-packed with 1-byte alignment and little-endian multi-byte
//! fields, serialized with `ssmarshal` which writes struct fields in
//! declaration order without padding. The three exchange stages share a
//! common prefix: a final frame starts with the bytes of a response frame,
//! which starts with the bytes of a request frame. Encoding therefore always
//! serializes the full superset and transmits the stage prefix; decoding
//! deserializes the prefix type.
//!
//! Timestamps on the wire are truncated to 32 bits; the 40-bit radio time is
//! reconstructed from the receiver's own high-order time context, and deltas
//! are always taken with wrapping 32-bit subtraction.

use core::convert::TryFrom;

use num_enum::{IntoPrimitive, TryFromPrimitive};
use serde::{Deserialize, Serialize};

use crate::Error;

/// Frame control word identifying the N-ranges frame family.
pub const FCTRL_N_RANGES: u16 = 0x88C1;

/// The short address that addresses every node in range.
pub const BROADCAST_ADDRESS: u16 = 0xFFFF;

/// Frames held per ranging exchange: the first and second stage of the
/// double-sided scheme.
pub const FRAMES_PER_RANGE: usize = 2;

/// Encoded length of a request frame.
pub const REQUEST_LEN: usize = 13;
/// Encoded length of a response frame.
pub const RESPONSE_LEN: usize = 22;
/// Encoded length of a final frame.
pub const FINAL_LEN: usize = 30;
/// Encoded length of the auxiliary measurement payload.
pub const RANGE_DATA_LEN: usize = 36;
/// Encoded length of an extended final frame.
pub const EXT_FINAL_LEN: usize = FINAL_LEN + RANGE_DATA_LEN;

const DST_OFFSET: usize = 5;
const CODE_OFFSET: usize = 9;

/// Operation codes of the N-ranges exchange
///
/// The base family runs the plain 4-message exchange; the extended family
/// repeats it while appending [`RangeData`] to the final frame. The numeric
/// values are part of the wire format and must not change.
#[derive(Clone, Copy, Debug, Eq, PartialEq, IntoPrimitive, TryFromPrimitive)]
#[repr(u16)]
pub enum Opcode {
    /// Stage 1, initiator broadcast carrying the slot range.
    Request = 17,
    /// Stage 2, per-responder reply at a slot-offset transmit time.
    Response = 18,
    /// Stage 3, initiator broadcast echoing collected timestamps.
    Echo = 19,
    /// Stage 4, per-responder final timestamps.
    Final = 20,
    /// Stage 1 of the extended exchange.
    ExtRequest = 22,
    /// Stage 2 of the extended exchange.
    ExtResponse = 23,
    /// Stage 3 of the extended exchange.
    ExtEcho = 24,
    /// Stage 4 of the extended exchange, carries [`RangeData`].
    ExtFinal = 25,
}

/// The protocol stage an opcode belongs to, independent of family.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum Stage {
    /// Initiator's opening broadcast.
    Request,
    /// Responder's first-side reply.
    Response,
    /// Initiator's timestamp echo.
    Echo,
    /// Responder's closing frame.
    Final,
}

impl Opcode {
    /// Whether this opcode belongs to the extended family.
    pub fn is_ext(self) -> bool {
        u16::from(self) >= u16::from(Opcode::ExtRequest)
    }

    /// The exchange stage this opcode represents.
    pub fn stage(self) -> Stage {
        match self {
            Opcode::Request | Opcode::ExtRequest => Stage::Request,
            Opcode::Response | Opcode::ExtResponse => Stage::Response,
            Opcode::Echo | Opcode::ExtEcho => Stage::Echo,
            Opcode::Final | Opcode::ExtFinal => Stage::Final,
        }
    }

    /// The opcode of the next stage within the same family.
    ///
    /// Calling this on a final-stage opcode is a programming error.
    pub fn next_stage(self) -> Opcode {
        match self {
            Opcode::Request => Opcode::Response,
            Opcode::Response => Opcode::Echo,
            Opcode::Echo => Opcode::Final,
            Opcode::ExtRequest => Opcode::ExtResponse,
            Opcode::ExtResponse => Opcode::ExtEcho,
            Opcode::ExtEcho => Opcode::ExtFinal,
            Opcode::Final | Opcode::ExtFinal => {
                panic!("no stage follows a final frame")
            }
        }
    }

    /// Encoded length of the frame transmitted at this opcode's stage.
    pub fn frame_len(self) -> usize {
        match self.stage() {
            Stage::Request => REQUEST_LEN,
            Stage::Response => RESPONSE_LEN,
            Stage::Echo => FINAL_LEN,
            Stage::Final => {
                if self.is_ext() {
                    EXT_FINAL_LEN
                } else {
                    FINAL_LEN
                }
            }
        }
    }
}

/// Stage-1 request frame, the common prefix of every N-ranges frame
#[derive(Clone, Copy, Debug, Default, Eq, PartialEq, Deserialize, Serialize)]
pub struct RequestFrame {
    /// Frame control word, always [`FCTRL_N_RANGES`].
    pub fctrl: u16,
    /// Sequence number of the exchange.
    pub seq: u8,
    /// PAN identifier.
    pub pan_id: u16,
    /// Destination short address.
    pub dst: u16,
    /// Source short address.
    pub src: u16,
    /// Operation code, one of [`Opcode`] on the wire.
    pub code: u16,
    /// First responder slot allowed to answer.
    pub start_slot: u8,
    /// Last responder slot allowed to answer.
    pub end_slot: u8,
}

/// Stage-2 response frame
#[derive(Clone, Copy, Debug, Default, Eq, PartialEq, Deserialize, Serialize)]
pub struct ResponseFrame {
    /// The request prefix, with source/destination swapped.
    pub request: RequestFrame,
    /// Slot id of the transmitting responder.
    pub slot_id: u8,
    /// Request reception timestamp, truncated to 32 bits.
    pub reception_timestamp: u32,
    /// Response transmission timestamp, truncated to 32 bits.
    pub transmission_timestamp: u32,
}

/// Stage-3/4 final frame
#[derive(Clone, Copy, Debug, Default, Eq, PartialEq, Deserialize, Serialize)]
pub struct FinalFrame {
    /// The response prefix.
    pub response: ResponseFrame,
    /// First-side request timestamp, truncated to 32 bits.
    pub request_timestamp: u32,
    /// First-side response timestamp, truncated to 32 bits.
    pub response_timestamp: u32,
}

/// A three-component measurement vector
#[derive(Clone, Copy, Debug, Default, PartialEq, Deserialize, Serialize)]
pub struct Triad {
    /// First component.
    pub x: f32,
    /// Second component.
    pub y: f32,
    /// Third component.
    pub z: f32,
}

/// Auxiliary measurement payload of the extended family
#[derive(Clone, Copy, Debug, Default, PartialEq, Deserialize, Serialize)]
pub struct RangeData {
    /// Measurement in spherical coordinates.
    pub spherical: Triad,
    /// Measurement variance.
    pub spherical_variance: Triad,
    /// Position in local cartesian coordinates.
    pub cartesian: Triad,
}

/// Final frame of the extended family, with the measurement payload appended
#[derive(Clone, Copy, Debug, Default, PartialEq, Deserialize, Serialize)]
pub struct ExtFinalFrame {
    /// The plain final frame.
    pub base: FinalFrame,
    /// The appended measurement payload.
    pub data: RangeData,
}

/// Encodes the stage prefix of `frame` selected by `len` into `buf`.
///
/// `buf` must hold at least [`FINAL_LEN`] bytes; `len` is one of the stage
/// length constants.
pub fn encode_prefix(frame: &FinalFrame, len: usize, buf: &mut [u8]) -> Result<usize, Error> {
    let written = ssmarshal::serialize(buf, frame)?;
    debug_assert_eq!(written, FINAL_LEN);
    if len > written {
        return Err(Error::BufferTooSmall { required_len: len });
    }
    Ok(len)
}

/// Encodes an extended final frame (final fields plus payload).
pub fn encode_ext_final(frame: &ExtFinalFrame, buf: &mut [u8]) -> Result<usize, Error> {
    let written = ssmarshal::serialize(buf, frame)?;
    debug_assert_eq!(written, EXT_FINAL_LEN);
    Ok(written)
}

/// Decodes the request prefix of a received frame.
pub fn decode_request(buf: &[u8]) -> Result<RequestFrame, Error> {
    let (frame, _) = ssmarshal::deserialize::<RequestFrame>(buf)?;
    Ok(frame)
}

/// Decodes the response prefix of a received frame.
pub fn decode_response(buf: &[u8]) -> Result<ResponseFrame, Error> {
    let (frame, _) = ssmarshal::deserialize::<ResponseFrame>(buf)?;
    Ok(frame)
}

/// Decodes a full final frame.
pub fn decode_final(buf: &[u8]) -> Result<FinalFrame, Error> {
    let (frame, _) = ssmarshal::deserialize::<FinalFrame>(buf)?;
    Ok(frame)
}

/// Decodes an extended final frame.
pub fn decode_ext_final(buf: &[u8]) -> Result<ExtFinalFrame, Error> {
    let (frame, _) = ssmarshal::deserialize::<ExtFinalFrame>(buf)?;
    Ok(frame)
}

fn peek_u16(buf: &[u8], offset: usize) -> Option<u16> {
    if buf.len() < offset + 2 {
        return None;
    }
    Some(u16::from_le_bytes([buf[offset], buf[offset + 1]]))
}

/// Reads the frame control word from a raw receive buffer.
pub fn peek_fctrl(buf: &[u8]) -> Option<u16> {
    peek_u16(buf, 0)
}

/// Reads the destination address from a raw receive buffer.
pub fn peek_dst(buf: &[u8]) -> Option<u16> {
    peek_u16(buf, DST_OFFSET)
}

/// Reads and validates the operation code from a raw receive buffer.
///
/// Returns `None` for short buffers and for codes outside the N-ranges
/// families; such frames belong to someone else and are never an error.
pub fn peek_code(buf: &[u8]) -> Option<Opcode> {
    let raw = peek_u16(buf, CODE_OFFSET)?;
    Opcode::try_from(raw).ok()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_final() -> FinalFrame {
        FinalFrame {
            response: ResponseFrame {
                request: RequestFrame {
                    fctrl: FCTRL_N_RANGES,
                    seq: 7,
                    pan_id: 0xDECA,
                    dst: 0x4321,
                    src: 0x1234,
                    code: Opcode::Response.into(),
                    start_slot: 1,
                    end_slot: 4,
                },
                slot_id: 3,
                reception_timestamp: 0x1122_3344,
                transmission_timestamp: 0x5566_7788,
            },
            request_timestamp: 0x99AA_BBCC,
            response_timestamp: 0xDDEE_FF00,
        }
    }

    #[test]
    fn stage_prefixes_share_layout() {
        let frame = sample_final();
        let mut buf = [0u8; EXT_FINAL_LEN];

        let len = encode_prefix(&frame, FINAL_LEN, &mut buf).unwrap();
        assert_eq!(len, FINAL_LEN);

        // The first 13 bytes are a valid request frame, the first 22 a valid
        // response frame.
        assert_eq!(decode_request(&buf[..REQUEST_LEN]).unwrap(), frame.response.request);
        assert_eq!(decode_response(&buf[..RESPONSE_LEN]).unwrap(), frame.response);
        assert_eq!(decode_final(&buf).unwrap(), frame);
    }

    #[test]
    fn wire_field_offsets_are_stable() {
        let frame = sample_final();
        let mut buf = [0u8; EXT_FINAL_LEN];
        encode_prefix(&frame, FINAL_LEN, &mut buf).unwrap();

        assert_eq!(peek_fctrl(&buf), Some(FCTRL_N_RANGES));
        assert_eq!(peek_dst(&buf), Some(0x4321));
        assert_eq!(peek_code(&buf), Some(Opcode::Response));

        // Little-endian spot checks against the raw bytes.
        assert_eq!(&buf[0..2], &[0xC1, 0x88]);
        assert_eq!(buf[2], 7);
        assert_eq!(&buf[5..7], &[0x21, 0x43]);
        assert_eq!(&buf[14..18], &[0x44, 0x33, 0x22, 0x11]);
    }

    #[test]
    fn ext_final_appends_payload() {
        let mut frame = ExtFinalFrame::default();
        frame.base = sample_final();
        frame.data.cartesian = Triad { x: 1.0, y: 2.0, z: 3.0 };

        let mut buf = [0u8; EXT_FINAL_LEN];
        let len = encode_ext_final(&frame, &mut buf).unwrap();
        assert_eq!(len, EXT_FINAL_LEN);

        let decoded = decode_ext_final(&buf).unwrap();
        assert_eq!(decoded, frame);
        // The base prefix is still a plain final frame.
        assert_eq!(decode_final(&buf[..FINAL_LEN]).unwrap(), frame.base);
    }

    #[test]
    fn unknown_codes_are_rejected() {
        let mut buf = [0u8; REQUEST_LEN];
        buf[CODE_OFFSET] = 21; // gap between the two families
        assert_eq!(peek_code(&buf), None);
        assert_eq!(peek_code(&buf[..4]), None);
    }

    #[test]
    fn opcode_families_and_stages() {
        assert!(!Opcode::Request.is_ext());
        assert!(Opcode::ExtFinal.is_ext());
        assert_eq!(Opcode::Request.next_stage(), Opcode::Response);
        assert_eq!(Opcode::ExtEcho.next_stage(), Opcode::ExtFinal);
        assert_eq!(Opcode::Echo.frame_len(), FINAL_LEN);
        assert_eq!(Opcode::ExtFinal.frame_len(), EXT_FINAL_LEN);
        assert_eq!(Opcode::ExtResponse.stage(), Stage::Response);
    }
}
