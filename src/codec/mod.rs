// SPDX-FileCopyrightText: Copyright (c) 2026 modbus-link contributors
// SPDX-License-Identifier: MIT OR Apache-2.0

//! Wire codecs.
//!
//! The PDU codec in this module encodes and decodes the function-code
//! dependent body shared by both framings. The [`rtu`] and [`tcp`] wrappers
//! add their framing headers and integrity fields on top.

#[cfg(feature = "rtu")]
pub mod rtu;

#[cfg(feature = "tcp")]
pub mod tcp;

use std::io::Cursor;

use byteorder::{BigEndian, ReadBytesExt};
use bytes::{BufMut, BytesMut};
use thiserror::Error;

use crate::{
    frame::{
        packed_coils_len, Frame, FrameData, FrameKind, FunctionCode, Quantity, MAX_PDU_DATA,
    },
    slave::SlaveId,
};

/// Errors produced while encoding or decoding frames.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum CodecError {
    #[error("invalid function code: 0x{0:02X}")]
    InvalidFunctionCode(u8),
    #[error("invalid frame type for this operation")]
    InvalidType,
    #[error("exception code not allowed here")]
    InvalidException,
    #[error("invalid slave id: {0}")]
    InvalidSlaveId(SlaveId),
    #[error("register count out of range: {0}")]
    InvalidRegisterCount(Quantity),
    #[error("invalid CRC: expected = 0x{expected:04X}, actual = 0x{actual:04X}")]
    InvalidCrc { expected: u16, actual: u16 },
    #[error("invalid MBAP protocol id: {0}")]
    InvalidMbapProtocolId(u16),
    #[error("MBAP length field disagrees with frame size: {0}")]
    InvalidMbapLen(u16),
    #[error("invalid frame length: {0}")]
    InvalidLen(usize),
    #[error("buffer too small")]
    BufferTooSmall,
}

impl CodecError {
    pub(crate) const fn as_str(self) -> &'static str {
        use CodecError::*;
        match self {
            InvalidFunctionCode(_) => "invalid function code",
            InvalidType => "invalid frame type",
            InvalidException => "invalid exception",
            InvalidSlaveId(_) => "invalid slave id",
            InvalidRegisterCount(_) => "invalid register count",
            InvalidCrc { .. } => "invalid CRC",
            InvalidMbapProtocolId(_) => "invalid MBAP protocol id",
            InvalidMbapLen(_) => "invalid MBAP length",
            InvalidLen(_) => "invalid length",
            BufferTooSmall => "buffer too small",
        }
    }
}

/// Inclusive register count limits for a function code, request side.
const fn count_limits(function: FunctionCode) -> (Quantity, Quantity) {
    use FunctionCode::*;
    match function {
        ReadCoils | ReadDiscreteInputs => (1, 2000),
        ReadHoldingRegisters | ReadInputRegisters => (1, 125),
        WriteMultipleCoils => (1, 1968),
        WriteMultipleRegisters => (1, 123),
        WriteSingleCoil | WriteSingleRegister => (1, 1),
    }
}

fn check_count(function: FunctionCode, count: Quantity) -> Result<(), CodecError> {
    let (min, max) = count_limits(function);
    if count < min || count > max {
        return Err(CodecError::InvalidRegisterCount(count));
    }
    Ok(())
}

/// Expected byte length of the data region given kind, fc and count.
fn expected_data_len(kind: FrameKind, function: FunctionCode, count: Quantity) -> usize {
    use FunctionCode::*;
    match (kind, function) {
        (FrameKind::Request, ReadCoils | ReadDiscreteInputs) => 0,
        (FrameKind::Request, ReadHoldingRegisters | ReadInputRegisters) => 0,
        (_, WriteSingleCoil | WriteSingleRegister) => 2,
        (FrameKind::Request, WriteMultipleCoils) => packed_coils_len(count as usize),
        (FrameKind::Request, WriteMultipleRegisters) => 2 * count as usize,
        (FrameKind::Response, ReadCoils | ReadDiscreteInputs) => packed_coils_len(count as usize),
        (FrameKind::Response, ReadHoldingRegisters | ReadInputRegisters) => 2 * count as usize,
        (FrameKind::Response, WriteMultipleCoils | WriteMultipleRegisters) => 0,
    }
}

/// Validate a frame before encoding: requests never carry an exception
/// code, register counts respect the per-function limits, and the data
/// region length follows from the function code and count.
///
/// Slave id rules depend on the framing and are enforced by the framing
/// wrappers; everything else lives here.
pub fn validate(frame: &Frame) -> Result<(), CodecError> {
    if frame.kind == FrameKind::Request && frame.exception.is_some() {
        return Err(CodecError::InvalidException);
    }
    if frame.exception.is_some() {
        // An exception response carries no addressing or payload.
        return Ok(());
    }
    check_count(frame.function, frame.reg_count)?;
    let expected = expected_data_len(frame.kind, frame.function, frame.reg_count);
    if frame.data.len() != expected || expected > MAX_PDU_DATA {
        return Err(CodecError::InvalidLen(frame.data.len()));
    }
    Ok(())
}

/// Encode the PDU of a validated frame into `buf`.
pub fn encode_pdu(frame: &Frame, buf: &mut BytesMut) -> Result<(), CodecError> {
    validate(frame)?;

    if let Some(exception) = frame.exception {
        buf.put_u8(frame.function.value() | 0x80);
        buf.put_u8(exception.value());
        return Ok(());
    }

    use FunctionCode::*;
    buf.put_u8(frame.function.value());
    match (frame.kind, frame.function) {
        (FrameKind::Request, ReadCoils | ReadDiscreteInputs)
        | (FrameKind::Request, ReadHoldingRegisters | ReadInputRegisters) => {
            buf.put_u16(frame.reg_address);
            buf.put_u16(frame.reg_count);
        }
        (_, WriteSingleCoil | WriteSingleRegister) => {
            buf.put_u16(frame.reg_address);
            buf.put_slice(&frame.data);
        }
        (FrameKind::Request, WriteMultipleCoils | WriteMultipleRegisters) => {
            buf.put_u16(frame.reg_address);
            buf.put_u16(frame.reg_count);
            #[allow(clippy::cast_possible_truncation)]
            buf.put_u8(frame.data.len() as u8);
            buf.put_slice(&frame.data);
        }
        (FrameKind::Response, ReadCoils | ReadDiscreteInputs)
        | (FrameKind::Response, ReadHoldingRegisters | ReadInputRegisters) => {
            #[allow(clippy::cast_possible_truncation)]
            buf.put_u8(frame.data.len() as u8);
            buf.put_slice(&frame.data);
        }
        (FrameKind::Response, WriteMultipleCoils | WriteMultipleRegisters) => {
            buf.put_u16(frame.reg_address);
            buf.put_u16(frame.reg_count);
        }
    }
    Ok(())
}

/// Decode a request PDU received by a server.
pub fn decode_request_pdu(slave_id: SlaveId, pdu: &[u8]) -> Result<Frame, CodecError> {
    let mut rdr = Cursor::new(pdu);
    let raw_fc = rdr.read_u8().map_err(|_| CodecError::BufferTooSmall)?;
    if raw_fc & 0x80 != 0 {
        // The exception bit only appears in responses.
        return Err(CodecError::InvalidType);
    }
    let function = FunctionCode::new(raw_fc).ok_or(CodecError::InvalidFunctionCode(raw_fc))?;

    use FunctionCode::*;
    let frame = match function {
        ReadCoils | ReadDiscreteInputs | ReadHoldingRegisters | ReadInputRegisters => {
            if pdu.len() != 5 {
                return Err(CodecError::InvalidLen(pdu.len()));
            }
            let address = read_u16(&mut rdr)?;
            let count = read_u16(&mut rdr)?;
            check_count(function, count)?;
            Frame::request(function, slave_id, address, count, FrameData::new())
        }
        WriteSingleCoil | WriteSingleRegister => {
            if pdu.len() != 5 {
                return Err(CodecError::InvalidLen(pdu.len()));
            }
            let address = read_u16(&mut rdr)?;
            let data = pdu[3..5].to_vec();
            Frame::request(function, slave_id, address, 1, data)
        }
        WriteMultipleCoils | WriteMultipleRegisters => {
            if pdu.len() < 6 {
                return Err(CodecError::InvalidLen(pdu.len()));
            }
            let address = read_u16(&mut rdr)?;
            let count = read_u16(&mut rdr)?;
            check_count(function, count)?;
            let byte_count = usize::from(pdu[5]);
            let expected = expected_data_len(FrameKind::Request, function, count);
            if byte_count != expected || pdu.len() != 6 + byte_count {
                return Err(CodecError::InvalidLen(pdu.len()));
            }
            let data = pdu[6..].to_vec();
            Frame::request(function, slave_id, address, count, data)
        }
    };
    Ok(frame)
}

/// Decode a response PDU received by a client.
///
/// Exception responses are normalised: the returned frame carries the base
/// function code plus the exception code, never the wire fc with the high
/// bit set.
pub fn decode_response_pdu(slave_id: SlaveId, pdu: &[u8]) -> Result<Frame, CodecError> {
    let mut rdr = Cursor::new(pdu);
    let raw_fc = rdr.read_u8().map_err(|_| CodecError::BufferTooSmall)?;

    if raw_fc & 0x80 != 0 {
        let function =
            FunctionCode::new(raw_fc & 0x7F).ok_or(CodecError::InvalidFunctionCode(raw_fc))?;
        if pdu.len() != 2 {
            return Err(CodecError::InvalidLen(pdu.len()));
        }
        let exception = crate::frame::ExceptionCode::new(pdu[1]).ok_or(CodecError::InvalidException)?;
        return Ok(Frame::exception_response(function, slave_id, exception));
    }

    let function = FunctionCode::new(raw_fc).ok_or(CodecError::InvalidFunctionCode(raw_fc))?;

    use FunctionCode::*;
    let frame = match function {
        ReadCoils | ReadDiscreteInputs | ReadHoldingRegisters | ReadInputRegisters => {
            if pdu.len() < 2 {
                return Err(CodecError::InvalidLen(pdu.len()));
            }
            let byte_count = usize::from(pdu[1]);
            if pdu.len() != 2 + byte_count {
                return Err(CodecError::InvalidLen(pdu.len()));
            }
            // The wire carries no count for read responses. For registers it
            // follows from the byte count; for bits only the padded total is
            // known and response matching compares packed lengths.
            let count = if function.addresses_bits() {
                #[allow(clippy::cast_possible_truncation)]
                let bits = (byte_count * 8).min(usize::from(u16::MAX)) as Quantity;
                bits
            } else {
                if byte_count % 2 != 0 {
                    return Err(CodecError::InvalidLen(pdu.len()));
                }
                #[allow(clippy::cast_possible_truncation)]
                let words = (byte_count / 2) as Quantity;
                words
            };
            let data = pdu[2..].to_vec();
            Frame::response(function, slave_id, 0, count, data)
        }
        WriteSingleCoil | WriteSingleRegister => {
            if pdu.len() != 5 {
                return Err(CodecError::InvalidLen(pdu.len()));
            }
            let address = read_u16(&mut rdr)?;
            let data = pdu[3..5].to_vec();
            Frame::response(function, slave_id, address, 1, data)
        }
        WriteMultipleCoils | WriteMultipleRegisters => {
            // fc + addr + count, nothing else.
            if pdu.len() != 5 {
                return Err(CodecError::InvalidLen(pdu.len()));
            }
            let address = read_u16(&mut rdr)?;
            let count = read_u16(&mut rdr)?;
            check_count(function, count)?;
            Frame::response(function, slave_id, address, count, FrameData::new())
        }
    };
    Ok(frame)
}

fn read_u16(rdr: &mut Cursor<&[u8]>) -> Result<u16, CodecError> {
    rdr.read_u16::<BigEndian>()
        .map_err(|_| CodecError::BufferTooSmall)
}
