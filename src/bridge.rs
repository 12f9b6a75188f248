// SPDX-FileCopyrightText: Copyright (c) 2026 modbus-link contributors
// SPDX-License-Identifier: MIT OR Apache-2.0

//! Transparent bridge between two transports.
//!
//! Requests arriving on the network side are queued and forwarded one at a
//! time over the field side through an internal client; the matching
//! responses travel back with the original transaction id. Queue overflow
//! answers `SERVER_DEVICE_BUSY` immediately; a field-side timeout becomes a
//! `GATEWAY_TARGET_FAILED` exception, any other field-side failure a
//! `GATEWAY_PATH_UNAVAILABLE` exception.

use std::{
    fmt,
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc, Mutex as StdMutex,
    },
    time::Duration,
};

use tokio::sync::mpsc;

use crate::{
    client::{Client, ClientConfig, ClientError},
    diag,
    frame::{ExceptionCode, Frame, FrameKind},
    transport::{Origin, Role, Transport, TransportError, TransportResult},
};

const DEFAULT_QUEUE_DEPTH: usize = 4;

/// Bridge configuration.
#[derive(Debug, Clone)]
pub struct BridgeConfig {
    /// Bound on requests waiting to be forwarded.
    pub queue_depth: usize,
    /// Field-side round trip budget per forwarded request.
    pub forward_timeout: Duration,
}

impl Default for BridgeConfig {
    fn default() -> Self {
        Self {
            queue_depth: DEFAULT_QUEUE_DEPTH,
            forward_timeout: crate::client::DEFAULT_REQUEST_TIMEOUT,
        }
    }
}

type QueuedRequest = (Arc<Frame>, Origin);

struct BridgeShared {
    network: Arc<dyn Transport>,
    client: Client,
    initialized: AtomicBool,
}

/// A transparent relay pairing a field-side transport (toward the remote
/// servers) with a network-side transport (toward the requesters).
pub struct Bridge {
    shared: Arc<BridgeShared>,
    queue_tx: mpsc::Sender<QueuedRequest>,
    queue_rx: StdMutex<Option<mpsc::Receiver<QueuedRequest>>>,
}

impl fmt::Debug for Bridge {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Bridge")
            .field("network", &self.shared.network)
            .field(
                "initialized",
                &self.shared.initialized.load(Ordering::Relaxed),
            )
            .finish_non_exhaustive()
    }
}

impl Bridge {
    /// Pair `field` (client role) with `network` (server role).
    #[must_use]
    pub fn new(
        field: Arc<dyn Transport>,
        network: Arc<dyn Transport>,
        config: &BridgeConfig,
    ) -> Self {
        let client = Client::new(
            field,
            ClientConfig {
                request_timeout: config.forward_timeout,
            },
        );
        let (queue_tx, queue_rx) = mpsc::channel(config.queue_depth.max(1));
        Self {
            shared: Arc::new(BridgeShared {
                network,
                client,
                initialized: AtomicBool::new(false),
            }),
            queue_tx,
            queue_rx: StdMutex::new(Some(queue_rx)),
        }
    }

    /// Initialise both sides and start forwarding. One-shot and idempotent.
    pub async fn begin(&self) -> TransportResult<()> {
        let shared = &self.shared;
        if shared.initialized.swap(true, Ordering::AcqRel) {
            return Ok(());
        }
        if shared.network.role() != Role::Server {
            shared.initialized.store(false, Ordering::Release);
            return Err(TransportError::InvalidRole);
        }
        if shared.client.begin().await.is_err() {
            shared.initialized.store(false, Ordering::Release);
            return Err(TransportError::InitFailed);
        }
        shared.network.begin().await?;

        let queue_tx = self.queue_tx.clone();
        let cb_shared = Arc::clone(shared);
        shared.network.register_rx_callback(Arc::new(move |frame, origin| {
            let queue_tx = queue_tx.clone();
            let shared = Arc::clone(&cb_shared);
            Box::pin(async move {
                enqueue(shared, queue_tx, frame, origin).await;
            })
        }))?;

        let receiver = {
            let mut slot = match self.queue_rx.lock() {
                Ok(slot) => slot,
                Err(poisoned) => poisoned.into_inner(),
            };
            slot.take()
        };
        let Some(receiver) = receiver else {
            return Err(TransportError::InitFailed);
        };
        tokio::spawn(forward_task(Arc::clone(shared), receiver));
        Ok(())
    }
}

async fn enqueue(
    shared: Arc<BridgeShared>,
    queue_tx: mpsc::Sender<QueuedRequest>,
    frame: Arc<Frame>,
    origin: Origin,
) {
    if frame.kind != FrameKind::Request {
        return;
    }
    if let Err(err) = queue_tx.try_send((Arc::clone(&frame), origin)) {
        log::warn!("forward queue full, rejecting request: {err}");
        diag::result(Arc::as_ptr(&shared) as usize, &TransportError::Busy);
        respond_exception(&shared, &frame, origin, ExceptionCode::ServerDeviceBusy).await;
    }
}

async fn forward_task(shared: Arc<BridgeShared>, mut queue: mpsc::Receiver<QueuedRequest>) {
    while let Some((request, origin)) = queue.recv().await {
        forward(&shared, &request, origin).await;
    }
}

/// Forward one request over the field side and relay the outcome back.
async fn forward(shared: &Arc<BridgeShared>, request: &Arc<Frame>, origin: Origin) {
    match shared.client.send_request(request).await {
        Ok(Some(response)) => {
            if let Err(err) = shared.network.send_frame(&response, origin, None).await {
                log::warn!("relaying response failed: {err}");
                diag::result(Arc::as_ptr(shared) as usize, &TransportError::SendFailed);
            }
        }
        Ok(None) => {
            // Forwarded broadcast: nothing will come back, nothing to relay.
        }
        Err(ClientError::Timeout) => {
            log::warn!("field side timed out, reporting gateway target failure");
            diag::result(Arc::as_ptr(shared) as usize, &ClientError::Timeout);
            respond_exception(shared, request, origin, ExceptionCode::GatewayTargetDevice).await;
        }
        Err(err) => {
            log::warn!("field side failed ({err}), reporting gateway path unavailable");
            diag::result(Arc::as_ptr(shared) as usize, &err);
            respond_exception(shared, request, origin, ExceptionCode::GatewayPathUnavailable).await;
        }
    }
}

async fn respond_exception(
    shared: &Arc<BridgeShared>,
    request: &Frame,
    origin: Origin,
    code: ExceptionCode,
) {
    if request.is_broadcast() {
        return;
    }
    let response = Frame::exception_response(request.function, request.slave_id, code);
    if let Err(err) = shared.network.send_frame(&response, origin, None).await {
        log::warn!("exception relay failed: {err}");
    }
}
