// SPDX-FileCopyrightText: Copyright (c) 2026 modbus-link contributors
// SPDX-License-Identifier: MIT OR Apache-2.0

//! Modbus device addressing

use std::fmt;

/// Slave identifier
pub type SlaveId = u8;

/// A single byte for addressing Modbus slave devices.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub struct Slave(pub SlaveId);

impl Slave {
    /// The special address for sending a broadcast message to all
    /// connected Modbus slave devices at once. Broadcast messages
    /// are one-way: a request without a response, only meaningful
    /// for write function codes.
    #[must_use]
    pub const fn broadcast() -> Self {
        Slave(0)
    }

    /// The minimum address of a single Modbus slave device.
    #[must_use]
    pub const fn min_device() -> Self {
        Slave(1)
    }

    /// The maximum address of a single Modbus slave device.
    #[must_use]
    pub const fn max_device() -> Self {
        Slave(247)
    }

    /// The reserved unit id for addressing a Modbus TCP device directly,
    /// i.e. not forwarded through a TCP/RTU gateway.
    ///
    /// [Modbus Messaging on TCP/IP Implementation Guide](http://www.modbus.org/docs/Modbus_Messaging_Implementation_Guide_V1_0b.pdf), page 23
    /// "On TCP/IP, the Modbus server is addressed using its IP address; therefore,
    /// the Modbus Unit Identifier is useless. The value 0xFF has to be used."
    #[must_use]
    pub const fn tcp_device() -> Self {
        Slave(255)
    }

    /// Check if the [`SlaveId`] is used for broadcasting
    #[must_use]
    pub fn is_broadcast(self) -> bool {
        self == Self::broadcast()
    }

    /// Check if the [`SlaveId`] addresses a single device
    #[must_use]
    pub fn is_single_device(self) -> bool {
        self >= Self::min_device() && self <= Self::max_device()
    }

    /// Check if the [`SlaveId`] is reserved (248..=255)
    #[must_use]
    pub fn is_reserved(self) -> bool {
        self > Self::max_device()
    }

    /// Valid targets for a request frame: a single device, the broadcast
    /// address, or the TCP wildcard.
    #[must_use]
    pub fn is_valid_request_target(self) -> bool {
        self.is_broadcast() || self.is_single_device() || self == Self::tcp_device()
    }

    /// Valid originators of a response frame: a single device, or the TCP
    /// wildcard echoed by a server that ignores the unit id.
    #[must_use]
    pub fn is_valid_response_source(self) -> bool {
        self.is_single_device() || self == Self::tcp_device()
    }
}

impl From<SlaveId> for Slave {
    fn from(from: SlaveId) -> Self {
        Slave(from)
    }
}

impl From<Slave> for SlaveId {
    fn from(from: Slave) -> Self {
        from.0
    }
}

impl fmt::Display for Slave {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} (0x{:0>2X})", self.0, self.0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn classification() {
        assert!(Slave(0).is_broadcast());
        assert!(!Slave(1).is_broadcast());
        assert!(Slave(1).is_single_device());
        assert!(Slave(247).is_single_device());
        assert!(!Slave(0).is_single_device());
        assert!(!Slave(248).is_single_device());
        assert!(Slave(248).is_reserved());
        assert!(Slave(255).is_reserved());
    }

    #[test]
    fn request_targets() {
        assert!(Slave(0).is_valid_request_target());
        assert!(Slave(17).is_valid_request_target());
        assert!(Slave(255).is_valid_request_target());
        assert!(!Slave(250).is_valid_request_target());
    }

    #[test]
    fn response_sources() {
        assert!(!Slave(0).is_valid_response_source());
        assert!(Slave(17).is_valid_response_source());
        assert!(Slave(255).is_valid_response_source());
        assert!(!Slave(250).is_valid_response_source());
    }

    #[test]
    fn format() {
        assert!(format!("{}", Slave(123)).contains("123"));
        assert!(format!("{}", Slave(0x7B)).contains("0x7B"));
    }
}
