// SPDX-FileCopyrightText: Copyright (c) 2026 modbus-link contributors
// SPDX-License-Identifier: MIT OR Apache-2.0

//! TCP framing: the 7 byte MBAP header followed by the PDU.
//!
//! `[txid(2) | proto_id(2) = 0 | length(2) | unit_id | pdu]` with
//! `length = 1 + len(pdu)`.

use std::io::{Error, ErrorKind};

use byteorder::{BigEndian, ByteOrder};
use bytes::{BufMut, BytesMut};
use tokio_util::codec::Decoder;

use crate::{
    frame::{Frame, FrameKind},
    slave::Slave,
};

use super::{decode_request_pdu, decode_response_pdu, encode_pdu, CodecError};

pub(crate) const HEADER_LEN: usize = 7;

const PROTOCOL_ID: u16 = 0x0000;

// Smallest PDU is two bytes (exception response), largest 253.
const MIN_ADU_LEN: usize = HEADER_LEN + 2;
const MAX_ADU_LEN: usize = HEADER_LEN + 253;

/// MBAP transaction identifier used to correlate requests and responses.
pub type TransactionId = u16;

/// MBAP unit identifier (the TCP rendition of the slave id).
pub type UnitId = u8;

/// The MBAP header fields preserved across encode/decode.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MbapHeader {
    pub transaction_id: TransactionId,
    pub unit_id: UnitId,
}

fn check_unit_id(frame: &Frame) -> Result<(), CodecError> {
    let slave = Slave(frame.slave_id);
    match frame.kind {
        FrameKind::Request => {
            if !slave.is_valid_request_target() {
                return Err(CodecError::InvalidSlaveId(frame.slave_id));
            }
            if slave.is_broadcast() && !frame.function.is_write() {
                return Err(CodecError::InvalidSlaveId(frame.slave_id));
            }
        }
        FrameKind::Response => {
            // A server that ignores unit ids echoes whatever it received,
            // including the 0xFF wildcard.
            if !slave.is_valid_response_source() {
                return Err(CodecError::InvalidSlaveId(frame.slave_id));
            }
        }
    }
    Ok(())
}

/// Encode a frame into a complete MBAP ADU.
pub fn encode_frame(frame: &Frame, transaction_id: TransactionId) -> Result<BytesMut, CodecError> {
    check_unit_id(frame)?;

    let mut pdu = BytesMut::with_capacity(MAX_ADU_LEN - HEADER_LEN);
    encode_pdu(frame, &mut pdu)?;

    let mut buf = BytesMut::with_capacity(HEADER_LEN + pdu.len());
    buf.put_u16(transaction_id);
    buf.put_u16(PROTOCOL_ID);
    #[allow(clippy::cast_possible_truncation)]
    buf.put_u16((pdu.len() + 1) as u16);
    buf.put_u8(frame.slave_id);
    buf.put_slice(&pdu);
    Ok(buf)
}

/// Decode one complete MBAP ADU.
pub fn decode_frame(buf: &[u8], kind: FrameKind) -> Result<(MbapHeader, Frame), CodecError> {
    if buf.len() < MIN_ADU_LEN || buf.len() > MAX_ADU_LEN {
        return Err(CodecError::InvalidLen(buf.len()));
    }

    let protocol_id = BigEndian::read_u16(&buf[2..4]);
    if protocol_id != PROTOCOL_ID {
        return Err(CodecError::InvalidMbapProtocolId(protocol_id));
    }

    let length = BigEndian::read_u16(&buf[4..6]);
    if usize::from(length) != buf.len() - (HEADER_LEN - 1) {
        return Err(CodecError::InvalidMbapLen(length));
    }

    let header = MbapHeader {
        transaction_id: BigEndian::read_u16(&buf[0..2]),
        unit_id: buf[6],
    };

    let pdu = &buf[HEADER_LEN..];
    let frame = match kind {
        FrameKind::Request => decode_request_pdu(header.unit_id, pdu)?,
        FrameKind::Response => decode_response_pdu(header.unit_id, pdu)?,
    };
    check_unit_id(&frame)?;
    Ok((header, frame))
}

/// Reassembles complete MBAP ADUs from a TCP byte stream.
///
/// Yields raw ADU buffers; the caller runs [`decode_frame`] on each so that
/// codec failures can be reported without tearing down the connection
/// machinery inside the decoder.
#[derive(Debug, Default)]
pub struct AduDecoder;

impl Decoder for AduDecoder {
    type Item = BytesMut;
    type Error = Error;

    fn decode(&mut self, buf: &mut BytesMut) -> Result<Option<BytesMut>, Error> {
        if buf.len() < HEADER_LEN {
            return Ok(None);
        }

        let len = usize::from(BigEndian::read_u16(&buf[4..6]));
        if len == 0 {
            return Err(Error::new(
                ErrorKind::InvalidData,
                "invalid MBAP length field: 0",
            ));
        }
        // len counts the unit id byte which is part of the header
        let adu_len = (HEADER_LEN - 1) + len;
        if adu_len > MAX_ADU_LEN {
            return Err(Error::new(
                ErrorKind::InvalidData,
                format!("oversized MBAP frame: {adu_len}"),
            ));
        }
        if buf.len() < adu_len {
            return Ok(None);
        }

        Ok(Some(buf.split_to(adu_len)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::frame::{FrameData, FunctionCode};

    #[test]
    fn encode_write_single_coil_request() {
        let req = Frame::request(
            FunctionCode::WriteSingleCoil,
            0x01,
            0x0000,
            1,
            vec![0xFF, 0x00],
        );
        let buf = encode_frame(&req, 0x0001).unwrap();
        assert_eq!(
            &buf[..],
            &[0x00, 0x01, 0x00, 0x00, 0x00, 0x06, 0x01, 0x05, 0x00, 0x00, 0xFF, 0x00]
        );
    }

    #[test]
    fn txid_preserved_across_round_trip() {
        let req = Frame::request(
            FunctionCode::ReadHoldingRegisters,
            0x11,
            0x000A,
            2,
            FrameData::new(),
        );
        let buf = encode_frame(&req, 0x1234).unwrap();
        let (header, decoded) = decode_frame(&buf, FrameKind::Request).unwrap();
        assert_eq!(header.transaction_id, 0x1234);
        assert_eq!(header.unit_id, 0x11);
        assert_eq!(decoded, req);
    }

    #[test]
    fn decode_exception_response() {
        let buf = [
            0xAB, 0xCD, // txid
            0x00, 0x00, // protocol id
            0x00, 0x03, // length
            0x01, // unit id
            0x83, 0x02, // exception PDU
        ];
        let (header, frame) = decode_frame(&buf, FrameKind::Response).unwrap();
        assert_eq!(header.transaction_id, 0xABCD);
        assert_eq!(frame.function, FunctionCode::ReadHoldingRegisters);
        assert_eq!(
            frame.exception,
            Some(crate::frame::ExceptionCode::IllegalDataAddress)
        );
    }

    #[test]
    fn invalid_protocol_id_rejected() {
        let mut buf = encode_frame(
            &Frame::request(FunctionCode::ReadCoils, 1, 0, 1, FrameData::new()),
            7,
        )
        .unwrap();
        buf[2] = 0x33;
        assert_eq!(
            decode_frame(&buf, FrameKind::Request),
            Err(CodecError::InvalidMbapProtocolId(0x3300))
        );
    }

    #[test]
    fn length_field_coherence() {
        let good = encode_frame(
            &Frame::request(FunctionCode::ReadCoils, 1, 0, 1, FrameData::new()),
            7,
        )
        .unwrap();

        for delta in [-1i32, 1] {
            let mut buf = good.clone();
            let length = BigEndian::read_u16(&buf[4..6]);
            #[allow(clippy::cast_possible_truncation, clippy::cast_sign_loss)]
            BigEndian::write_u16(&mut buf[4..6], (i32::from(length) + delta) as u16);
            assert!(matches!(
                decode_frame(&buf, FrameKind::Request),
                Err(CodecError::InvalidMbapLen(_))
            ));
        }

        // Truncating or extending the buffer instead trips the length checks.
        let mut truncated = good.clone();
        truncated.truncate(good.len() - 1);
        assert!(matches!(
            decode_frame(&truncated, FrameKind::Request),
            Err(CodecError::InvalidMbapLen(_))
        ));
    }

    #[test]
    fn undersized_adu_rejected() {
        let buf = [0u8; MIN_ADU_LEN - 1];
        assert_eq!(
            decode_frame(&buf, FrameKind::Request),
            Err(CodecError::InvalidLen(MIN_ADU_LEN - 1))
        );
    }

    #[test]
    fn wildcard_unit_id_accepted() {
        let req = Frame::request(
            FunctionCode::ReadHoldingRegisters,
            0xFF,
            0,
            1,
            FrameData::new(),
        );
        let buf = encode_frame(&req, 1).unwrap();
        let (header, decoded) = decode_frame(&buf, FrameKind::Request).unwrap();
        assert_eq!(header.unit_id, 0xFF);
        assert_eq!(decoded.slave_id, 0xFF);
    }

    mod adu_decoder {
        use super::*;

        #[test]
        fn header_fragment_yields_nothing() {
            let mut decoder = AduDecoder;
            let mut buf = BytesMut::from(&[0x00, 0x11, 0x00, 0x00, 0x00, 0x00][..]);
            assert!(decoder.decode(&mut buf).unwrap().is_none());
            assert_eq!(buf.len(), 6);
        }

        #[test]
        fn partial_body_yields_nothing() {
            let mut decoder = AduDecoder;
            let mut buf = BytesMut::from(
                &[
                    0x10, 0x01, // txid
                    0x00, 0x00, // protocol id
                    0x00, 0x06, // length
                    0x01, // unit id
                    0x03, // function code, rest missing
                ][..],
            );
            assert!(decoder.decode(&mut buf).unwrap().is_none());
            assert_eq!(buf.len(), 8);
        }

        #[test]
        fn complete_adu_is_split_off() {
            let mut decoder = AduDecoder;
            let mut buf = BytesMut::from(
                &[
                    0x10, 0x01, 0x00, 0x00, 0x00, 0x03, 0x01, 0x83, 0x02,
                    0xFF, // trailing byte of the next frame
                ][..],
            );
            let adu = decoder.decode(&mut buf).unwrap().unwrap();
            assert_eq!(adu.len(), 9);
            assert_eq!(buf.len(), 1);
        }

        #[test]
        fn zero_length_field_is_an_error() {
            let mut decoder = AduDecoder;
            let mut buf = BytesMut::from(&[0x00, 0x01, 0x00, 0x00, 0x00, 0x00, 0x01][..]);
            assert!(decoder.decode(&mut buf).is_err());
        }
    }
}
