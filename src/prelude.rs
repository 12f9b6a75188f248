// SPDX-FileCopyrightText: Copyright (c) 2026 modbus-link contributors
// SPDX-License-Identifier: MIT OR Apache-2.0

//! Commonly used types, re-exported for convenient glob imports.

pub use crate::{
    client::{Client, ClientConfig, ClientError, RequestTracker, TransactionOutcome},
    codec::CodecError,
    frame::{
        pack_coils, pack_registers, ExceptionCode, Frame, FrameData, FrameKind, FrameMeta,
        FunctionCode,
    },
    slave::{Slave, SlaveId},
    transport::{Origin, Role, Transport, TransportError},
};

#[cfg(feature = "rtu")]
pub use crate::transport::rtu::{DriverEnable, RtuConfig, RtuTransport};

#[cfg(feature = "tcp")]
pub use crate::transport::tcp::{
    TcpClientConfig, TcpClientTransport, TcpServerConfig, TcpServerTransport,
};

#[cfg(feature = "server")]
pub use crate::server::{
    direct_storage, DynamicWordStore, LockPolicy, RegisterType, Server, ServerConfig, ServerError,
    StaticWordStore, Word, WordAccess, WordStore, MAX_WORD_SIZE,
};

#[cfg(feature = "bridge")]
pub use crate::bridge::{Bridge, BridgeConfig};
