// SPDX-FileCopyrightText: Copyright (c) 2026 modbus-link contributors
// SPDX-License-Identifier: MIT OR Apache-2.0

//! TCP transports: a persistent client connection and a multi-connection
//! server accept loop, both speaking MBAP-framed PDUs.
//!
//! The client allocates a fresh transaction id per request and validates it
//! on the way back. The server carries the inbound transaction id through
//! the [`Origin`] token so responses are routed onto the connection that
//! delivered the request, with the id echoed verbatim.

use std::{
    collections::HashMap,
    fmt,
    net::SocketAddr,
    sync::{
        atomic::{AtomicBool, AtomicU16, AtomicU32, Ordering},
        Arc, Mutex as StdMutex,
    },
    time::Duration,
};

use async_trait::async_trait;
use bytes::Bytes;
use futures_util::StreamExt as _;
use socket2::{Domain, Socket, Type};
use tokio::{
    io::AsyncWriteExt as _,
    net::{
        tcp::{OwnedReadHalf, OwnedWriteHalf},
        TcpListener, TcpStream,
    },
    sync::{mpsc, Mutex},
    time,
};
use tokio_util::codec::FramedRead;

use crate::{
    codec::tcp::{decode_frame, encode_frame, AduDecoder, TransactionId},
    diag,
    frame::{Frame, FrameKind},
    transport::{
        CallbackSet, Origin, Role, RxCallback, Transport, TransportError, TransportResult,
        TxResultCallback,
    },
};

/// Bound on queued, not yet written responses per server connection.
const RESPONSE_QUEUE_DEPTH: usize = 32;

const DEFAULT_CONNECT_TIMEOUT: Duration = Duration::from_secs(5);

const DEFAULT_MAX_CONNECTIONS: usize = 4;

/// Configuration of a client-role TCP transport.
#[derive(Debug, Clone)]
pub struct TcpClientConfig {
    /// Address of the remote Modbus TCP server.
    pub addr: SocketAddr,
    /// Bound on connection establishment.
    pub connect_timeout: Duration,
}

impl TcpClientConfig {
    #[must_use]
    pub fn new(addr: SocketAddr) -> Self {
        Self {
            addr,
            connect_timeout: DEFAULT_CONNECT_TIMEOUT,
        }
    }
}

/// Configuration of a server-role TCP transport.
#[derive(Debug, Clone)]
pub struct TcpServerConfig {
    /// Local address to listen on.
    pub bind_addr: SocketAddr,
    /// Bound on concurrently accepted client connections.
    pub max_connections: usize,
}

impl TcpServerConfig {
    #[must_use]
    pub fn new(bind_addr: SocketAddr) -> Self {
        Self {
            bind_addr,
            max_connections: DEFAULT_MAX_CONNECTIONS,
        }
    }
}

// ===========================================================================
// Client role
// ===========================================================================

struct TcpClientShared {
    config: TcpClientConfig,
    callbacks: CallbackSet,
    writer: Mutex<Option<OwnedWriteHalf>>,
    connected: AtomicBool,
    initialized: AtomicBool,
    next_transaction_id: AtomicU16,
    /// Transaction id of the request currently awaiting its response.
    expected: StdMutex<Option<TransactionId>>,
    /// Bumped per (re)connection so a stale RX task cannot tear down the
    /// state of its successor.
    generation: AtomicU32,
}

/// Client-role TCP transport with one persistent outbound connection.
///
/// The connection is established lazily by the first `send_frame` and
/// re-established on the next send after a disconnect.
pub struct TcpClientTransport {
    shared: Arc<TcpClientShared>,
}

impl TcpClientTransport {
    #[must_use]
    pub fn new(config: TcpClientConfig) -> Self {
        Self {
            shared: Arc::new(TcpClientShared {
                config,
                callbacks: CallbackSet::new(),
                writer: Mutex::new(None),
                connected: AtomicBool::new(false),
                initialized: AtomicBool::new(false),
                next_transaction_id: AtomicU16::new(0),
                expected: StdMutex::new(None),
                generation: AtomicU32::new(0),
            }),
        }
    }

    async fn ensure_connected(&self) -> TransportResult<()> {
        let shared = &self.shared;
        if shared.connected.load(Ordering::Acquire) {
            return Ok(());
        }
        let connect = TcpStream::connect(shared.config.addr);
        let stream = time::timeout(shared.config.connect_timeout, connect)
            .await
            .map_err(|_| TransportError::ConnectionFailed)?
            .map_err(|err| {
                log::warn!("connection to {} failed: {err}", shared.config.addr);
                TransportError::ConnectionFailed
            })?;
        let _ = stream.set_nodelay(true);
        let (reader, writer) = stream.into_split();
        *shared.writer.lock().await = Some(writer);
        shared.connected.store(true, Ordering::Release);
        let generation = shared.generation.fetch_add(1, Ordering::AcqRel) + 1;
        tokio::spawn(client_rx_task(reader, Arc::clone(shared), generation));
        Ok(())
    }
}

impl fmt::Debug for TcpClientTransport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TcpClientTransport")
            .field("addr", &self.shared.config.addr)
            .field("connected", &self.shared.connected.load(Ordering::Relaxed))
            .finish_non_exhaustive()
    }
}

#[async_trait]
impl Transport for TcpClientTransport {
    async fn begin(&self) -> TransportResult<()> {
        // The connection itself is lazy; `begin` only arms the transport.
        self.shared.initialized.store(true, Ordering::Release);
        Ok(())
    }

    async fn send_frame(
        &self,
        frame: &Frame,
        _origin: Origin,
        on_tx_result: Option<TxResultCallback>,
    ) -> TransportResult<()> {
        let shared = &self.shared;
        if !shared.initialized.load(Ordering::Acquire) {
            return Err(TransportError::NotInitialized);
        }
        if frame.kind != FrameKind::Request {
            return Err(TransportError::InvalidMessageType);
        }

        self.ensure_connected().await?;

        let transaction_id = shared.next_transaction_id.fetch_add(1, Ordering::Relaxed);
        let bytes = encode_frame(frame, transaction_id)?;
        set_slot(&shared.expected, Some(transaction_id));

        let mut writer_guard = shared.writer.lock().await;
        let Some(writer) = writer_guard.as_mut() else {
            shared.connected.store(false, Ordering::Release);
            return Err(TransportError::ConnectionFailed);
        };
        if let Err(err) = writer.write_all(&bytes).await {
            log::warn!("TCP TX failed: {err}");
            shared.connected.store(false, Ordering::Release);
            *writer_guard = None;
            set_slot(&shared.expected, None);
            diag::result(self as *const _ as usize, &TransportError::SendFailed);
            return Err(TransportError::SendFailed);
        }
        drop(writer_guard);

        if let Some(callback) = on_tx_result {
            callback(Ok(())).await;
        }
        Ok(())
    }

    fn is_ready(&self) -> bool {
        self.shared.initialized.load(Ordering::Acquire)
            && self.shared.connected.load(Ordering::Acquire)
    }

    fn abort_current(&self) {
        // The client gave up on its transaction: a late response must not
        // be delivered against a future request.
        set_slot(&self.shared.expected, None);
    }

    fn register_rx_callback(&self, callback: RxCallback) -> TransportResult<()> {
        self.shared.callbacks.register(callback)
    }

    fn role(&self) -> Role {
        Role::Client
    }
}

async fn client_rx_task(reader: OwnedReadHalf, shared: Arc<TcpClientShared>, generation: u32) {
    let mut framed = FramedRead::new(reader, AduDecoder);
    while let Some(item) = framed.next().await {
        let adu = match item {
            Ok(adu) => adu,
            Err(err) => {
                log::warn!("TCP RX stream failed: {err}");
                diag::result(Arc::as_ptr(&shared) as usize, &TransportError::RxFailed);
                break;
            }
        };
        match decode_frame(&adu, FrameKind::Response) {
            Ok((header, frame)) => {
                let matches = {
                    let mut expected = lock_slot(&shared.expected);
                    if *expected == Some(header.transaction_id) {
                        *expected = None;
                        true
                    } else {
                        false
                    }
                };
                if !matches {
                    log::warn!(
                        "dropping response with unexpected transaction id {}",
                        header.transaction_id
                    );
                    diag::result(
                        Arc::as_ptr(&shared) as usize,
                        &TransportError::InvalidTransactionId,
                    );
                    continue;
                }
                let frame = Arc::new(frame);
                let origin = Origin {
                    connection: 0,
                    transaction_id: header.transaction_id,
                };
                if let Err(err) = shared.callbacks.notify(&frame, origin).await {
                    log::debug!("TCP response not consumed: {err}");
                }
            }
            Err(err) => {
                log::warn!("dropping invalid TCP response: {err}");
                diag::result(Arc::as_ptr(&shared) as usize, &err);
            }
        }
    }
    // Only tear down state that still belongs to this connection.
    if shared.generation.load(Ordering::Acquire) == generation {
        shared.connected.store(false, Ordering::Release);
        *shared.writer.lock().await = None;
    }
    log::debug!("TCP client connection closed");
}

// ===========================================================================
// Server role
// ===========================================================================

struct TcpServerShared {
    config: TcpServerConfig,
    callbacks: CallbackSet,
    connections: StdMutex<HashMap<u32, mpsc::Sender<Bytes>>>,
    next_connection_id: AtomicU32,
    initialized: AtomicBool,
    local_addr: StdMutex<Option<SocketAddr>>,
}

/// Server-role TCP transport accepting up to `max_connections` clients.
///
/// Ignores the unit id for addressing purposes and echoes it on responses
/// ([`Transport::catches_all_slave_ids`]).
pub struct TcpServerTransport {
    shared: Arc<TcpServerShared>,
}

impl TcpServerTransport {
    #[must_use]
    pub fn new(config: TcpServerConfig) -> Self {
        Self {
            shared: Arc::new(TcpServerShared {
                config,
                callbacks: CallbackSet::new(),
                connections: StdMutex::new(HashMap::new()),
                next_connection_id: AtomicU32::new(1),
                initialized: AtomicBool::new(false),
                local_addr: StdMutex::new(None),
            }),
        }
    }

    /// Number of currently accepted connections.
    #[must_use]
    pub fn connection_count(&self) -> usize {
        lock_map(&self.shared.connections).len()
    }

    /// The bound listening address, available once `begin` has succeeded.
    /// Useful with an ephemeral port in the configuration.
    #[must_use]
    pub fn local_addr(&self) -> Option<SocketAddr> {
        match self.shared.local_addr.lock() {
            Ok(slot) => *slot,
            Err(poisoned) => *poisoned.into_inner(),
        }
    }
}

impl fmt::Debug for TcpServerTransport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TcpServerTransport")
            .field("bind_addr", &self.shared.config.bind_addr)
            .field("connections", &self.connection_count())
            .finish_non_exhaustive()
    }
}

#[async_trait]
impl Transport for TcpServerTransport {
    async fn begin(&self) -> TransportResult<()> {
        if self.shared.initialized.swap(true, Ordering::AcqRel) {
            return Ok(());
        }
        let listener = bind_listener(self.shared.config.bind_addr).map_err(|err| {
            log::error!("binding {} failed: {err}", self.shared.config.bind_addr);
            self.shared.initialized.store(false, Ordering::Release);
            TransportError::InitFailed
        })?;
        if let Ok(addr) = listener.local_addr() {
            match self.shared.local_addr.lock() {
                Ok(mut slot) => *slot = Some(addr),
                Err(poisoned) => *poisoned.into_inner() = Some(addr),
            }
        }
        tokio::spawn(accept_task(listener, Arc::clone(&self.shared)));
        Ok(())
    }

    async fn send_frame(
        &self,
        frame: &Frame,
        origin: Origin,
        on_tx_result: Option<TxResultCallback>,
    ) -> TransportResult<()> {
        let shared = &self.shared;
        if !shared.initialized.load(Ordering::Acquire) {
            return Err(TransportError::NotInitialized);
        }
        if frame.kind != FrameKind::Response {
            return Err(TransportError::InvalidMessageType);
        }
        if origin.is_none() {
            // A response without an originating request has nowhere to go.
            return Err(TransportError::InvalidTransactionId);
        }

        let bytes = encode_frame(frame, origin.transaction_id)?;
        let sender = lock_map(&shared.connections)
            .get(&origin.connection)
            .cloned();
        let Some(sender) = sender else {
            return Err(TransportError::SendFailed);
        };
        match sender.try_send(bytes.freeze()) {
            Ok(()) => {}
            Err(mpsc::error::TrySendError::Full(_)) => return Err(TransportError::Busy),
            Err(mpsc::error::TrySendError::Closed(_)) => return Err(TransportError::SendFailed),
        }

        if let Some(callback) = on_tx_result {
            callback(Ok(())).await;
        }
        Ok(())
    }

    fn is_ready(&self) -> bool {
        self.shared.initialized.load(Ordering::Acquire) && self.connection_count() > 0
    }

    fn register_rx_callback(&self, callback: RxCallback) -> TransportResult<()> {
        self.shared.callbacks.register(callback)
    }

    fn role(&self) -> Role {
        Role::Server
    }

    fn catches_all_slave_ids(&self) -> bool {
        true
    }
}

/// Configure and open the listening socket.
fn bind_listener(addr: SocketAddr) -> std::io::Result<TcpListener> {
    let socket = match addr {
        SocketAddr::V4(_) => Socket::new(Domain::IPV4, Type::STREAM, None)?,
        SocketAddr::V6(_) => Socket::new(Domain::IPV6, Type::STREAM, None)?,
    };
    socket.set_reuse_address(true)?;
    socket.bind(&addr.into())?;
    socket.listen(1024)?;
    socket.set_nonblocking(true)?;
    TcpListener::from_std(socket.into())
}

async fn accept_task(listener: TcpListener, shared: Arc<TcpServerShared>) {
    loop {
        let (stream, peer) = match listener.accept().await {
            Ok(accepted) => accepted,
            Err(err) => {
                log::warn!("accept failed: {err}");
                continue;
            }
        };
        if lock_map(&shared.connections).len() >= shared.config.max_connections {
            log::warn!("rejecting connection from {peer}: at capacity");
            drop(stream);
            continue;
        }
        let _ = stream.set_nodelay(true);
        let id = shared.next_connection_id.fetch_add(1, Ordering::Relaxed);
        let (reader, writer) = stream.into_split();
        let (response_tx, response_rx) = mpsc::channel(RESPONSE_QUEUE_DEPTH);
        lock_map(&shared.connections).insert(id, response_tx);
        log::debug!("accepted connection {id} from {peer}");
        tokio::spawn(connection_writer(writer, response_rx));
        tokio::spawn(connection_reader(reader, id, Arc::clone(&shared)));
    }
}

/// Drains the per-connection response queue onto the socket.
async fn connection_writer(mut writer: OwnedWriteHalf, mut queue: mpsc::Receiver<Bytes>) {
    while let Some(bytes) = queue.recv().await {
        if let Err(err) = writer.write_all(&bytes).await {
            log::warn!("TCP response write failed: {err}");
            break;
        }
    }
}

async fn connection_reader(reader: OwnedReadHalf, id: u32, shared: Arc<TcpServerShared>) {
    let mut framed = FramedRead::new(reader, AduDecoder);
    while let Some(item) = framed.next().await {
        let adu = match item {
            Ok(adu) => adu,
            Err(err) => {
                // Framing is lost on this connection, drop it.
                log::warn!("TCP RX stream failed on connection {id}: {err}");
                diag::result(Arc::as_ptr(&shared) as usize, &TransportError::RxFailed);
                break;
            }
        };
        match decode_frame(&adu, FrameKind::Request) {
            Ok((header, frame)) => {
                let origin = Origin {
                    connection: id,
                    transaction_id: header.transaction_id,
                };
                let frame = Arc::new(frame);
                if let Err(err) = shared.callbacks.notify(&frame, origin).await {
                    log::debug!("TCP request not consumed: {err}");
                }
            }
            Err(err) => {
                log::warn!("dropping invalid TCP request on connection {id}: {err}");
                diag::result(Arc::as_ptr(&shared) as usize, &err);
            }
        }
    }
    lock_map(&shared.connections).remove(&id);
    log::debug!("connection {id} closed");
}

fn lock_map<'a>(
    map: &'a StdMutex<HashMap<u32, mpsc::Sender<Bytes>>>,
) -> std::sync::MutexGuard<'a, HashMap<u32, mpsc::Sender<Bytes>>> {
    match map.lock() {
        Ok(guard) => guard,
        Err(poisoned) => poisoned.into_inner(),
    }
}

fn lock_slot(
    slot: &StdMutex<Option<TransactionId>>,
) -> std::sync::MutexGuard<'_, Option<TransactionId>> {
    match slot.lock() {
        Ok(guard) => guard,
        Err(poisoned) => poisoned.into_inner(),
    }
}

fn set_slot(slot: &StdMutex<Option<TransactionId>>, value: Option<TransactionId>) {
    *lock_slot(slot) = value;
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::frame::{FrameData, FunctionCode};

    fn read_request() -> Frame {
        Frame::request(
            FunctionCode::ReadHoldingRegisters,
            0xFF,
            0x10,
            1,
            FrameData::new(),
        )
    }

    #[tokio::test]
    async fn client_send_before_begin_is_rejected() {
        let config = TcpClientConfig::new("127.0.0.1:1502".parse().unwrap());
        let transport = TcpClientTransport::new(config);
        assert_eq!(
            transport
                .send_frame(&read_request(), Origin::NONE, None)
                .await,
            Err(TransportError::NotInitialized)
        );
        assert!(!transport.is_ready());
    }

    #[tokio::test]
    async fn client_connect_failure_is_reported() {
        // Port 1 on loopback is almost certainly closed.
        let mut config = TcpClientConfig::new("127.0.0.1:1".parse().unwrap());
        config.connect_timeout = Duration::from_millis(500);
        let transport = TcpClientTransport::new(config);
        transport.begin().await.unwrap();
        assert_eq!(
            transport
                .send_frame(&read_request(), Origin::NONE, None)
                .await,
            Err(TransportError::ConnectionFailed)
        );
    }

    #[tokio::test]
    async fn server_response_requires_an_origin() {
        let config = TcpServerConfig::new("127.0.0.1:0".parse().unwrap());
        let transport = TcpServerTransport::new(config);
        transport.begin().await.unwrap();
        let response = Frame::response(
            FunctionCode::ReadHoldingRegisters,
            1,
            0,
            1,
            crate::frame::pack_registers(&[7]),
        );
        assert_eq!(
            transport.send_frame(&response, Origin::NONE, None).await,
            Err(TransportError::InvalidTransactionId)
        );
        assert!(transport.catches_all_slave_ids());
        assert_eq!(transport.role(), Role::Server);
    }
}
