// SPDX-FileCopyrightText: Copyright (c) 2026 modbus-link contributors
// SPDX-License-Identifier: MIT OR Apache-2.0

//! RTU framing: `[slave_id | pdu | crc_lo | crc_hi]`.

use bytes::{BufMut, BytesMut};

use crate::{
    frame::{Frame, FrameKind},
    slave::Slave,
};

use super::{decode_request_pdu, decode_response_pdu, encode_pdu, CodecError};

// [Modbus over Serial Line Specification and Implementation Guide V1.02](http://modbus.org/docs/Modbus_over_serial_line_V1_02.pdf), page 13
// "The maximum size of a Modbus RTU frame is 256 bytes."
pub(crate) const MAX_FRAME_LEN: usize = 256;

// slave id + minimal PDU + CRC
pub(crate) const MIN_FRAME_LEN: usize = 4;

/// Modbus CRC-16: reflected polynomial 0xA001, init 0xFFFF, no final xor.
/// Transmitted least significant byte first.
pub fn calc_crc(data: &[u8]) -> u16 {
    let mut crc = 0xFFFFu16;
    for x in data {
        crc ^= u16::from(*x);
        for _ in 0..8 {
            let crc_odd = (crc & 0x0001) != 0;
            crc >>= 1;
            if crc_odd {
                crc ^= 0xA001;
            }
        }
    }
    crc
}

fn check_crc(adu_data: &[u8], expected_crc: u16) -> Result<(), CodecError> {
    let actual_crc = calc_crc(adu_data);
    if expected_crc != actual_crc {
        return Err(CodecError::InvalidCrc {
            expected: expected_crc,
            actual: actual_crc,
        });
    }
    Ok(())
}

fn check_slave_id(frame: &Frame) -> Result<(), CodecError> {
    let slave = Slave(frame.slave_id);
    match frame.kind {
        FrameKind::Request => {
            // No unit-id wildcard on a serial line.
            if !slave.is_broadcast() && !slave.is_single_device() {
                return Err(CodecError::InvalidSlaveId(frame.slave_id));
            }
            if slave.is_broadcast() && !frame.function.is_write() {
                return Err(CodecError::InvalidSlaveId(frame.slave_id));
            }
        }
        FrameKind::Response => {
            if !slave.is_single_device() {
                return Err(CodecError::InvalidSlaveId(frame.slave_id));
            }
        }
    }
    Ok(())
}

/// Encode a frame into a complete RTU ADU with trailing CRC.
pub fn encode_frame(frame: &Frame) -> Result<BytesMut, CodecError> {
    check_slave_id(frame)?;
    let mut buf = BytesMut::with_capacity(MAX_FRAME_LEN);
    buf.put_u8(frame.slave_id);
    encode_pdu(frame, &mut buf)?;
    let crc = calc_crc(&buf);
    buf.put_u16_le(crc);
    Ok(buf)
}

/// Decode one complete, silence-delimited RTU ADU.
pub fn decode_frame(buf: &[u8], kind: FrameKind) -> Result<Frame, CodecError> {
    if buf.len() < MIN_FRAME_LEN {
        return Err(CodecError::BufferTooSmall);
    }
    if buf.len() > MAX_FRAME_LEN {
        return Err(CodecError::InvalidLen(buf.len()));
    }

    let (adu, crc_bytes) = buf.split_at(buf.len() - 2);
    let expected_crc = u16::from(crc_bytes[0]) | u16::from(crc_bytes[1]) << 8;
    check_crc(adu, expected_crc)?;

    let slave_id = adu[0];
    let pdu = &adu[1..];

    let frame = match kind {
        FrameKind::Request => decode_request_pdu(slave_id, pdu)?,
        FrameKind::Response => decode_response_pdu(slave_id, pdu)?,
    };
    check_slave_id(&frame)?;
    Ok(frame)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::frame::{pack_registers, FrameData, FunctionCode};

    #[test]
    fn crc_vectors() {
        // Wire order is low byte first, so 0x63B6 travels as B6 63.
        let msg = [0x01, 0x03, 0x08, 0x2B, 0x00, 0x02];
        assert_eq!(calc_crc(&msg), 0x63B6);

        let msg = [0x01, 0x03, 0x04, 0x00, 0x20, 0x00, 0x00];
        assert_eq!(calc_crc(&msg), 0xF9FB);

        // Canonical vector from the serial line spec examples.
        let msg = [0x01, 0x03, 0x00, 0x6B, 0x00, 0x03];
        assert_eq!(calc_crc(&msg), 0x1774);
    }

    #[test]
    fn encode_read_request() {
        let req = Frame::request(
            FunctionCode::ReadHoldingRegisters,
            0x01,
            0x006B,
            1,
            FrameData::new(),
        );
        let buf = encode_frame(&req).unwrap();
        assert_eq!(&buf[..], &[0x01, 0x03, 0x00, 0x6B, 0x00, 0x01, 0xF5, 0xD6]);
    }

    #[test]
    fn decode_read_response() {
        let rsp = Frame::response(
            FunctionCode::ReadHoldingRegisters,
            0x01,
            0,
            1,
            pack_registers(&[0x1234]),
        );
        let buf = encode_frame(&rsp).unwrap();
        assert_eq!(&buf[..2], &[0x01, 0x03]);

        let decoded = decode_frame(&buf, FrameKind::Response).unwrap();
        assert_eq!(decoded, rsp);
        assert_eq!(decoded.register(0), Some(0x1234));
    }

    #[test]
    fn frame_round_trip() {
        let req = Frame::request(
            FunctionCode::WriteMultipleRegisters,
            0x11,
            0x0006,
            2,
            pack_registers(&[0xABCD, 0xEF12]),
        );
        let buf = encode_frame(&req).unwrap();
        let decoded = decode_frame(&buf, FrameKind::Request).unwrap();
        assert_eq!(decoded, req);
    }

    #[test]
    fn single_bit_flip_is_caught() {
        let req = Frame::request(
            FunctionCode::ReadHoldingRegisters,
            0x01,
            0x006B,
            1,
            FrameData::new(),
        );
        let buf = encode_frame(&req).unwrap();
        // Flip every bit of every byte outside the CRC, one at a time.
        for byte in 0..buf.len() - 2 {
            for bit in 0..8 {
                let mut corrupted = buf.clone();
                corrupted[byte] ^= 1 << bit;
                assert!(matches!(
                    decode_frame(&corrupted, FrameKind::Request),
                    Err(CodecError::InvalidCrc { .. })
                ));
            }
        }
    }

    #[test]
    fn short_and_long_frames_rejected() {
        assert_eq!(
            decode_frame(&[0x01, 0x03, 0x00], FrameKind::Request),
            Err(CodecError::BufferTooSmall)
        );
        let oversized = vec![0u8; MAX_FRAME_LEN + 1];
        assert_eq!(
            decode_frame(&oversized, FrameKind::Request),
            Err(CodecError::InvalidLen(MAX_FRAME_LEN + 1))
        );
    }

    #[test]
    fn broadcast_read_rejected() {
        let req = Frame::request(FunctionCode::ReadCoils, 0, 0, 1, FrameData::new());
        assert_eq!(encode_frame(&req), Err(CodecError::InvalidSlaveId(0)));

        let req = Frame::request(
            FunctionCode::WriteSingleRegister,
            0,
            0,
            1,
            pack_registers(&[42]),
        );
        assert!(encode_frame(&req).is_ok());
    }

    #[test]
    fn response_from_reserved_slave_rejected() {
        for slave_id in [0x00, 0xFF] {
            let mut adu = BytesMut::new();
            adu.put_u8(slave_id);
            adu.put_slice(&[0x03, 0x02, 0x12, 0x34]);
            let crc = calc_crc(&adu);
            adu.put_u16_le(crc);
            assert_eq!(
                decode_frame(&adu, FrameKind::Response),
                Err(CodecError::InvalidSlaveId(slave_id))
            );
        }
    }

    #[test]
    fn wildcard_unit_id_rejected_on_serial() {
        let req = Frame::request(
            FunctionCode::ReadHoldingRegisters,
            0xFF,
            0,
            1,
            FrameData::new(),
        );
        assert_eq!(encode_frame(&req), Err(CodecError::InvalidSlaveId(0xFF)));
    }
}
