// SPDX-FileCopyrightText: Copyright (c) 2026 modbus-link contributors
// SPDX-License-Identifier: MIT OR Apache-2.0

//! In-memory representation of a single Modbus message.
//!
//! A [`Frame`] carries one request or one response in normalised form: the
//! function code is always the base code (the exception bit exists only on
//! the wire) and the data region holds coils packed LSB-first or registers
//! as big-endian words, exactly as they travel inside the PDU.

use std::fmt;

use crate::slave::SlaveId;

/// A Modbus address is represented by 16 bit (from `0` to `65535`).
pub type Address = u16;

/// Number of coils or registers addressed by a frame (`0` - `65535`).
pub type Quantity = u16;

/// Largest PDU data region: 253 byte PDU minus the function code byte.
pub const MAX_PDU_DATA: usize = 252;

/// Storage for the PDU data region, never longer than [`MAX_PDU_DATA`].
pub type FrameData = Vec<u8>;

/// Direction of a frame.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FrameKind {
    /// Message from a client (master) to a server (slave).
    Request,
    /// Message from a server (slave) back to a client (master).
    Response,
}

/// The Modbus public function codes supported by this crate.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum FunctionCode {
    ReadCoils = 0x01,
    ReadDiscreteInputs = 0x02,
    ReadHoldingRegisters = 0x03,
    ReadInputRegisters = 0x04,
    WriteSingleCoil = 0x05,
    WriteSingleRegister = 0x06,
    WriteMultipleCoils = 0x0F,
    WriteMultipleRegisters = 0x10,
}

impl FunctionCode {
    /// Decode a base function code (without the exception bit).
    pub fn new(value: u8) -> Option<Self> {
        use FunctionCode::*;
        let fc = match value {
            0x01 => ReadCoils,
            0x02 => ReadDiscreteInputs,
            0x03 => ReadHoldingRegisters,
            0x04 => ReadInputRegisters,
            0x05 => WriteSingleCoil,
            0x06 => WriteSingleRegister,
            0x0F => WriteMultipleCoils,
            0x10 => WriteMultipleRegisters,
            _ => return None,
        };
        Some(fc)
    }

    #[must_use]
    pub const fn value(self) -> u8 {
        self as u8
    }

    /// `true` for the four read function codes.
    #[must_use]
    pub const fn is_read(self) -> bool {
        matches!(
            self,
            Self::ReadCoils
                | Self::ReadDiscreteInputs
                | Self::ReadHoldingRegisters
                | Self::ReadInputRegisters
        )
    }

    /// `true` for all write function codes, single and multiple.
    #[must_use]
    pub const fn is_write(self) -> bool {
        !self.is_read()
    }

    #[must_use]
    pub const fn is_write_single(self) -> bool {
        matches!(self, Self::WriteSingleCoil | Self::WriteSingleRegister)
    }

    #[must_use]
    pub const fn is_write_multiple(self) -> bool {
        matches!(self, Self::WriteMultipleCoils | Self::WriteMultipleRegisters)
    }

    /// `true` if the addressed items are single bits rather than registers.
    #[must_use]
    pub const fn addresses_bits(self) -> bool {
        matches!(
            self,
            Self::ReadCoils
                | Self::ReadDiscreteInputs
                | Self::WriteSingleCoil
                | Self::WriteMultipleCoils
        )
    }
}

impl fmt::Display for FunctionCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "0x{:02X}", self.value())
    }
}

/// A server (slave) exception code.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum ExceptionCode {
    IllegalFunction = 0x01,
    IllegalDataAddress = 0x02,
    IllegalDataValue = 0x03,
    ServerDeviceFailure = 0x04,
    Acknowledge = 0x05,
    ServerDeviceBusy = 0x06,
    MemoryParityError = 0x08,
    GatewayPathUnavailable = 0x0A,
    GatewayTargetDevice = 0x0B,
}

impl ExceptionCode {
    /// Decode a wire exception code.
    pub fn new(value: u8) -> Option<Self> {
        use ExceptionCode::*;
        let code = match value {
            0x01 => IllegalFunction,
            0x02 => IllegalDataAddress,
            0x03 => IllegalDataValue,
            0x04 => ServerDeviceFailure,
            0x05 => Acknowledge,
            0x06 => ServerDeviceBusy,
            0x08 => MemoryParityError,
            0x0A => GatewayPathUnavailable,
            0x0B => GatewayTargetDevice,
            _ => return None,
        };
        Some(code)
    }

    #[must_use]
    pub const fn value(self) -> u8 {
        self as u8
    }

    pub(crate) const fn as_str(self) -> &'static str {
        use ExceptionCode::*;
        match self {
            IllegalFunction => "Illegal function",
            IllegalDataAddress => "Illegal data address",
            IllegalDataValue => "Illegal data value",
            ServerDeviceFailure => "Server device failure",
            Acknowledge => "Acknowledge",
            ServerDeviceBusy => "Server device busy",
            MemoryParityError => "Memory parity error",
            GatewayPathUnavailable => "Gateway path unavailable",
            GatewayTargetDevice => "Gateway target device failed to respond",
        }
    }
}

impl fmt::Display for ExceptionCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One Modbus message in normalised, transport-independent form.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame {
    pub kind: FrameKind,
    pub function: FunctionCode,
    pub slave_id: SlaveId,
    pub reg_address: Address,
    pub reg_count: Quantity,
    /// PDU data region; interpretation depends on `function` and `kind`.
    pub data: FrameData,
    /// `Some` only on exception responses.
    pub exception: Option<ExceptionCode>,
}

impl Frame {
    /// Build a request frame.
    #[must_use]
    pub fn request(
        function: FunctionCode,
        slave_id: SlaveId,
        reg_address: Address,
        reg_count: Quantity,
        data: FrameData,
    ) -> Self {
        Self {
            kind: FrameKind::Request,
            function,
            slave_id,
            reg_address,
            reg_count,
            data,
            exception: None,
        }
    }

    /// Build a regular (non-exception) response frame.
    #[must_use]
    pub fn response(
        function: FunctionCode,
        slave_id: SlaveId,
        reg_address: Address,
        reg_count: Quantity,
        data: FrameData,
    ) -> Self {
        Self {
            kind: FrameKind::Response,
            function,
            slave_id,
            reg_address,
            reg_count,
            data,
            exception: None,
        }
    }

    /// Build an exception response for the given base function code.
    #[must_use]
    pub fn exception_response(
        function: FunctionCode,
        slave_id: SlaveId,
        exception: ExceptionCode,
    ) -> Self {
        Self {
            kind: FrameKind::Response,
            function,
            slave_id,
            reg_address: 0,
            reg_count: 0,
            data: FrameData::new(),
            exception: Some(exception),
        }
    }

    #[must_use]
    pub fn is_broadcast(&self) -> bool {
        self.kind == FrameKind::Request && crate::slave::Slave(self.slave_id).is_broadcast()
    }

    #[must_use]
    pub fn is_exception(&self) -> bool {
        self.exception.is_some()
    }

    /// Coil `i` of the data region (LSB of the first byte is coil 0).
    #[must_use]
    pub fn coil(&self, i: usize) -> Option<bool> {
        let byte = self.data.get(i / 8)?;
        Some((byte >> (i % 8)) & 0b1 != 0)
    }

    /// Register `i` of the data region (big-endian 16 bit words).
    #[must_use]
    pub fn register(&self, i: usize) -> Option<u16> {
        let hi = *self.data.get(2 * i)?;
        let lo = *self.data.get(2 * i + 1)?;
        Some(u16::from(hi) << 8 | u16::from(lo))
    }

    /// All registers of the data region, in order.
    #[must_use]
    pub fn registers(&self) -> Vec<u16> {
        self.data
            .chunks_exact(2)
            .map(|c| u16::from(c[0]) << 8 | u16::from(c[1]))
            .collect()
    }

    /// The first `count` coils of the data region.
    #[must_use]
    pub fn coils(&self, count: usize) -> Vec<bool> {
        unpack_coils(&self.data, count)
    }

    /// Header-only projection of this frame.
    #[must_use]
    pub fn meta(&self) -> FrameMeta {
        FrameMeta {
            kind: self.kind,
            function: self.function,
            slave_id: self.slave_id,
            reg_address: self.reg_address,
            reg_count: self.reg_count,
            exception: self.exception,
        }
    }
}

/// Copyable frame header without the data payload.
///
/// Used wherever a frame must be remembered without keeping its (much
/// larger) data region alive: transaction matching and diagnostics.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FrameMeta {
    pub kind: FrameKind,
    pub function: FunctionCode,
    pub slave_id: SlaveId,
    pub reg_address: Address,
    pub reg_count: Quantity,
    pub exception: Option<ExceptionCode>,
}

/// Number of bytes needed to pack `count` coils.
#[must_use]
pub const fn packed_coils_len(count: usize) -> usize {
    (count + 7) / 8
}

/// Pack coil states into bytes, LSB first.
#[must_use]
pub fn pack_coils(coils: &[bool]) -> FrameData {
    let mut data = FrameData::new();
    data.resize(packed_coils_len(coils.len()), 0);
    for (i, on) in coils.iter().enumerate() {
        if *on {
            data[i / 8] |= 1 << (i % 8);
        }
    }
    data
}

/// Pack register values into big-endian bytes.
#[must_use]
pub fn pack_registers(values: &[u16]) -> FrameData {
    let mut data = FrameData::with_capacity(values.len() * 2);
    for v in values {
        let [hi, lo] = v.to_be_bytes();
        data.push(hi);
        data.push(lo);
    }
    data
}

/// Unpack `count` coil states from packed bytes.
#[must_use]
pub fn unpack_coils(bytes: &[u8], count: usize) -> Vec<bool> {
    let mut coils = Vec::with_capacity(count);
    for i in 0..count {
        let Some(byte) = bytes.get(i / 8) else {
            break;
        };
        coils.push((byte >> (i % 8)) & 0b1 != 0);
    }
    coils
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn pack_booleans_to_bytes() {
        assert_eq!(&pack_coils(&[])[..], &[]);
        assert_eq!(&pack_coils(&[true])[..], &[0b_1]);
        assert_eq!(&pack_coils(&[false])[..], &[0b_0]);
        assert_eq!(&pack_coils(&[true, false])[..], &[0b_01]);
        assert_eq!(&pack_coils(&[false, true])[..], &[0b_10]);
        assert_eq!(&pack_coils(&[true, true])[..], &[0b_11]);
        assert_eq!(&pack_coils(&[true; 8])[..], &[0b_1111_1111]);
        assert_eq!(&pack_coils(&[true; 9])[..], &[255, 1]);
        assert_eq!(&pack_coils(&[false; 8])[..], &[0]);
        assert_eq!(&pack_coils(&[false; 9])[..], &[0, 0]);
    }

    #[test]
    fn unpack_bits() {
        assert_eq!(unpack_coils(&[], 0), &[] as &[bool]);
        assert_eq!(unpack_coils(&[0b1], 1), &[true]);
        assert_eq!(unpack_coils(&[0b01], 2), &[true, false]);
        assert_eq!(unpack_coils(&[0b10], 2), &[false, true]);
        assert_eq!(unpack_coils(&[0b101], 3), &[true, false, true]);
        assert_eq!(unpack_coils(&[0xff, 0b11], 10), &[true; 10]);
    }

    #[test]
    fn pack_registers_big_endian() {
        let data = pack_registers(&[0x1234, 0xABCD]);
        assert_eq!(&data[..], &[0x12, 0x34, 0xAB, 0xCD]);
    }

    #[test]
    fn register_accessor() {
        let frame = Frame::response(
            FunctionCode::ReadHoldingRegisters,
            1,
            0x6B,
            2,
            pack_registers(&[0x1234, 0x5678]),
        );
        assert_eq!(frame.register(0), Some(0x1234));
        assert_eq!(frame.register(1), Some(0x5678));
        assert_eq!(frame.register(2), None);
        assert_eq!(frame.registers(), vec![0x1234, 0x5678]);
    }

    #[test]
    fn coil_accessor() {
        let frame = Frame::response(
            FunctionCode::ReadCoils,
            1,
            0,
            5,
            pack_coils(&[true, false, false, true, false]),
        );
        assert_eq!(frame.coil(0), Some(true));
        assert_eq!(frame.coil(3), Some(true));
        assert_eq!(frame.coil(4), Some(false));
        assert_eq!(frame.coil(8), None);
        assert_eq!(
            frame.coils(5),
            vec![true, false, false, true, false]
        );
    }

    #[test]
    fn function_code_round_trip() {
        for value in [0x01, 0x02, 0x03, 0x04, 0x05, 0x06, 0x0F, 0x10] {
            let fc = FunctionCode::new(value).unwrap();
            assert_eq!(fc.value(), value);
        }
        assert_eq!(FunctionCode::new(0x00), None);
        assert_eq!(FunctionCode::new(0x07), None);
        assert_eq!(FunctionCode::new(0x80), None);
    }

    #[test]
    fn exception_code_round_trip() {
        for value in [0x01, 0x02, 0x03, 0x04, 0x05, 0x06, 0x08, 0x0A, 0x0B] {
            let code = ExceptionCode::new(value).unwrap();
            assert_eq!(code.value(), value);
        }
        assert_eq!(ExceptionCode::new(0x00), None);
        assert_eq!(ExceptionCode::new(0x07), None);
    }

    #[test]
    fn broadcast_detection() {
        let req = Frame::request(FunctionCode::WriteSingleCoil, 0, 0, 1, FrameData::new());
        assert!(req.is_broadcast());
        let rsp = Frame::response(FunctionCode::WriteSingleCoil, 1, 0, 1, FrameData::new());
        assert!(!rsp.is_broadcast());
    }
}
