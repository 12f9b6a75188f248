// SPDX-FileCopyrightText: Copyright (c) 2026 modbus-link contributors
// SPDX-License-Identifier: MIT OR Apache-2.0

//! TCP clients reaching an RTU server through the transparent bridge.

#![cfg(all(feature = "tcp", feature = "rtu", feature = "server", feature = "bridge"))]

use std::{
    sync::{atomic::Ordering, Arc},
    time::{Duration, Instant},
};

use modbus_link::{
    bridge::{Bridge, BridgeConfig},
    client::{Client, ClientConfig},
    frame::{ExceptionCode, Frame, FrameData, FunctionCode},
    server::{direct_storage, DynamicWordStore, RegisterType, Server, ServerConfig, Word},
    transport::{
        rtu::{RtuConfig, RtuTransport},
        tcp::{TcpClientConfig, TcpClientTransport, TcpServerConfig, TcpServerTransport},
        Role, Transport,
    },
};

#[tokio::test]
async fn bridge_passthrough() {
    let rtu_config = RtuConfig::with_baud(115_200);
    let (field_io, remote_io) = tokio::io::duplex(4096);

    // The remote RTU server holds [0x0014, 0x001E] at 0x000A.
    let remote_transport: Arc<dyn Transport> =
        Arc::new(RtuTransport::new(remote_io, Role::Server, &rtu_config));
    let remote = Server::new(Box::new(DynamicWordStore::new()), ServerConfig::default());
    remote.attach(remote_transport).await.unwrap();
    remote.begin().await.unwrap();
    let storage = direct_storage(2);
    storage[0].store(0x0014, Ordering::Relaxed);
    storage[1].store(0x001E, Ordering::Relaxed);
    remote
        .add_word(Word::direct(RegisterType::HoldingRegister, 0x000A, storage))
        .await
        .unwrap();

    // Bridge: RTU field side, TCP network side.
    let field: Arc<dyn Transport> = Arc::new(RtuTransport::new(field_io, Role::Client, &rtu_config));
    let network = Arc::new(TcpServerTransport::new(TcpServerConfig::new(
        "127.0.0.1:0".parse().unwrap(),
    )));
    let bridge = Bridge::new(field, network.clone(), &BridgeConfig::default());
    bridge.begin().await.unwrap();
    let addr = network.local_addr().unwrap();

    // A TCP client on the network side sees the RTU server's registers.
    let client = Client::new(
        Arc::new(TcpClientTransport::new(TcpClientConfig::new(addr))),
        ClientConfig {
            request_timeout: Duration::from_secs(2),
        },
    );
    client.begin().await.unwrap();

    let request = Frame::request(
        FunctionCode::ReadHoldingRegisters,
        1,
        0x000A,
        2,
        FrameData::new(),
    );
    let response = client.send_request(&request).await.unwrap().unwrap();
    assert_eq!(response.function, FunctionCode::ReadHoldingRegisters);
    assert_eq!(response.exception, None);
    assert_eq!(response.reg_count, 2);
    assert_eq!(response.registers(), vec![0x0014, 0x001E]);
}

#[tokio::test]
async fn exception_travels_back_through_the_bridge() {
    let rtu_config = RtuConfig::with_baud(115_200);
    let (field_io, remote_io) = tokio::io::duplex(4096);

    let remote_transport: Arc<dyn Transport> =
        Arc::new(RtuTransport::new(remote_io, Role::Server, &rtu_config));
    let remote = Server::new(Box::new(DynamicWordStore::new()), ServerConfig::default());
    remote.attach(remote_transport).await.unwrap();
    remote.begin().await.unwrap();

    let field: Arc<dyn Transport> = Arc::new(RtuTransport::new(field_io, Role::Client, &rtu_config));
    let network = Arc::new(TcpServerTransport::new(TcpServerConfig::new(
        "127.0.0.1:0".parse().unwrap(),
    )));
    let bridge = Bridge::new(field, network.clone(), &BridgeConfig::default());
    bridge.begin().await.unwrap();

    let client = Client::new(
        Arc::new(TcpClientTransport::new(TcpClientConfig::new(
            network.local_addr().unwrap(),
        ))),
        ClientConfig {
            request_timeout: Duration::from_secs(2),
        },
    );
    client.begin().await.unwrap();

    // No words published: the remote answers ILLEGAL_DATA_ADDRESS and the
    // bridge relays it untouched.
    let request = Frame::request(
        FunctionCode::ReadHoldingRegisters,
        1,
        0x0000,
        1,
        FrameData::new(),
    );
    let response = client.send_request(&request).await.unwrap().unwrap();
    assert_eq!(response.exception, Some(ExceptionCode::IllegalDataAddress));
}

#[tokio::test]
async fn silent_field_side_reports_gateway_target_failure() {
    let rtu_config = RtuConfig::with_baud(115_200);
    // Keep the peer end alive so writes succeed, but nobody ever answers.
    let (field_io, _silent_peer) = tokio::io::duplex(4096);

    let field: Arc<dyn Transport> = Arc::new(RtuTransport::new(field_io, Role::Client, &rtu_config));
    let network = Arc::new(TcpServerTransport::new(TcpServerConfig::new(
        "127.0.0.1:0".parse().unwrap(),
    )));
    let bridge_config = BridgeConfig {
        forward_timeout: Duration::from_millis(200),
        ..BridgeConfig::default()
    };
    let bridge = Bridge::new(field, network.clone(), &bridge_config);
    bridge.begin().await.unwrap();

    let client = Client::new(
        Arc::new(TcpClientTransport::new(TcpClientConfig::new(
            network.local_addr().unwrap(),
        ))),
        ClientConfig {
            request_timeout: Duration::from_secs(2),
        },
    );
    client.begin().await.unwrap();

    let request = Frame::request(
        FunctionCode::ReadHoldingRegisters,
        1,
        0x0000,
        1,
        FrameData::new(),
    );
    let started = Instant::now();
    let response = client.send_request(&request).await.unwrap().unwrap();
    assert_eq!(response.exception, Some(ExceptionCode::GatewayTargetDevice));
    assert!(started.elapsed() >= Duration::from_millis(200));
}
