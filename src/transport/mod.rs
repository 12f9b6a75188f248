// SPDX-FileCopyrightText: Copyright (c) 2026 modbus-link contributors
// SPDX-License-Identifier: MIT OR Apache-2.0

//! Transport abstraction shared by clients, servers and bridges.
//!
//! A [`Transport`] turns frames into wire bytes and back. Inbound frames are
//! fanned out to a bounded list of registered RX callbacks in registration
//! order, on the transport's RX task. Callbacks must return promptly and
//! never block on I/O of their own.

#[cfg(feature = "rtu")]
pub mod rtu;

#[cfg(feature = "tcp")]
pub mod tcp;

use std::{
    fmt,
    future::Future,
    pin::Pin,
    sync::{Arc, Mutex},
};

use async_trait::async_trait;
use thiserror::Error;

use crate::{codec::CodecError, frame::Frame};

/// Upper bound on RX callbacks per transport: the number of endpoint
/// instances (clients, servers, bridges) that can share one interface.
pub const MAX_RX_CALLBACKS: usize = 5;

/// A specialized [`Result`] for transport operations.
pub type TransportResult<T> = Result<T, TransportError>;

/// Errors produced by the transport layer.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum TransportError {
    #[error("init failed")]
    InitFailed,
    #[error("invalid frame: {0}")]
    InvalidFrame(#[from] CodecError),
    #[error("busy")]
    Busy,
    #[error("receive failed")]
    RxFailed,
    #[error("send failed")]
    SendFailed,
    #[error("invalid message type for this role")]
    InvalidMessageType,
    #[error("transaction id mismatch")]
    InvalidTransactionId,
    #[error("timeout")]
    Timeout,
    #[error("invalid role")]
    InvalidRole,
    #[error("connection failed")]
    ConnectionFailed,
    #[error("configuration failed")]
    ConfigFailed,
    #[error("too many callbacks registered")]
    TooManyCallbacks,
    #[error("no callbacks registered")]
    NoCallbacks,
    #[error("not initialized")]
    NotInitialized,
}

impl TransportError {
    pub(crate) const fn as_str(&self) -> &'static str {
        use TransportError::*;
        match self {
            InitFailed => "init failed",
            InvalidFrame(_) => "invalid frame",
            Busy => "busy",
            RxFailed => "rx failed",
            SendFailed => "send failed",
            InvalidMessageType => "invalid message type",
            InvalidTransactionId => "transaction id mismatch",
            Timeout => "timeout",
            InvalidRole => "invalid role",
            ConnectionFailed => "connection failed",
            ConfigFailed => "config failed",
            TooManyCallbacks => "too many callbacks",
            NoCallbacks => "no callbacks",
            NotInitialized => "not initialized",
        }
    }
}

/// Which side of the protocol a transport speaks for.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
    /// Sends requests, receives responses.
    Client,
    /// Receives requests, sends responses.
    Server,
}

/// Opaque token identifying where an inbound frame came from.
///
/// Server-role TCP transports stamp the originating connection and the MBAP
/// transaction id on every frame they deliver; handing the same token back
/// to [`Transport::send_frame`] routes the response onto the connection that
/// carried the request, with the transaction id echoed verbatim. RTU
/// transports and client-role sends use [`Origin::NONE`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Origin {
    pub(crate) connection: u32,
    pub(crate) transaction_id: u16,
}

impl Origin {
    /// The empty origin: no connection routing, transaction id 0.
    pub const NONE: Self = Self {
        connection: 0,
        transaction_id: 0,
    };

    #[must_use]
    pub fn is_none(&self) -> bool {
        self.connection == 0
    }

    /// The MBAP transaction id carried by this token (0 outside TCP).
    #[must_use]
    pub fn transaction_id(&self) -> u16 {
        self.transaction_id
    }
}

impl Default for Origin {
    fn default() -> Self {
        Self::NONE
    }
}

/// Boxed future driven by the transport after invoking a callback.
pub type CallbackFuture = Pin<Box<dyn Future<Output = ()> + Send>>;

/// Callback invoked for every received frame.
///
/// The frame is shared and read-only; the callback must not block.
pub type RxCallback = Arc<dyn Fn(Arc<Frame>, Origin) -> CallbackFuture + Send + Sync>;

/// Callback fired exactly once when a previously accepted TX completes.
pub type TxResultCallback = Box<dyn FnOnce(TransportResult<()>) -> CallbackFuture + Send>;

/// A Modbus transport endpoint (RTU bus or TCP socket).
#[async_trait]
pub trait Transport: fmt::Debug + Send + Sync {
    /// Initialise the transport: open the medium and spawn the RX task.
    /// One-shot and idempotent.
    async fn begin(&self) -> TransportResult<()>;

    /// Validate, encode and transmit a frame.
    ///
    /// `origin` routes server responses back to the connection that carried
    /// the request; pass [`Origin::NONE`] everywhere else. If the frame is
    /// accepted, `on_tx_result` fires exactly once when the transmission
    /// completes or fails.
    async fn send_frame(
        &self,
        frame: &Frame,
        origin: Origin,
        on_tx_result: Option<TxResultCallback>,
    ) -> TransportResult<()>;

    /// `true` once initialised and currently able to accept a frame.
    fn is_ready(&self) -> bool;

    /// Hint from a client that it has abandoned its transaction.
    fn abort_current(&self) {}

    /// Register a callback for received frames (bounded, registration order).
    fn register_rx_callback(&self, callback: RxCallback) -> TransportResult<()>;

    /// The role this transport was constructed for. Immutable.
    fn role(&self) -> Role;

    /// `true` if the transport accepts any slave id and merely echoes it
    /// (TCP server behaviour).
    fn catches_all_slave_ids(&self) -> bool {
        false
    }
}

/// Bounded RX callback registry shared by all transports.
pub(crate) struct CallbackSet {
    slots: Mutex<Vec<RxCallback>>,
}

impl CallbackSet {
    pub(crate) fn new() -> Self {
        Self {
            slots: Mutex::new(Vec::with_capacity(MAX_RX_CALLBACKS)),
        }
    }

    /// Try-lock registration: contention maps to `Busy` rather than waiting.
    pub(crate) fn register(&self, callback: RxCallback) -> TransportResult<()> {
        let mut slots = self.slots.try_lock().map_err(|_| TransportError::Busy)?;
        if slots.len() >= MAX_RX_CALLBACKS {
            return Err(TransportError::TooManyCallbacks);
        }
        slots.push(callback);
        Ok(())
    }

    /// Fan the frame out to every callback in registration order.
    pub(crate) async fn notify(&self, frame: &Arc<Frame>, origin: Origin) -> TransportResult<()> {
        let snapshot: Vec<RxCallback> = {
            let slots = match self.slots.lock() {
                Ok(slots) => slots,
                Err(poisoned) => poisoned.into_inner(),
            };
            slots.clone()
        };
        if snapshot.is_empty() {
            return Err(TransportError::NoCallbacks);
        }
        for callback in &snapshot {
            callback(Arc::clone(frame), origin).await;
        }
        Ok(())
    }
}

impl fmt::Debug for CallbackSet {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let len = self.slots.lock().map(|slots| slots.len()).unwrap_or(0);
        f.debug_struct("CallbackSet").field("len", &len).finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    use crate::frame::{FrameData, FunctionCode};

    fn test_frame() -> Arc<Frame> {
        Arc::new(Frame::request(
            FunctionCode::ReadCoils,
            1,
            0,
            1,
            FrameData::new(),
        ))
    }

    #[tokio::test]
    async fn fan_out_in_registration_order() {
        let set = CallbackSet::new();
        let order = Arc::new(Mutex::new(Vec::new()));
        for i in 0..3 {
            let order = Arc::clone(&order);
            set.register(Arc::new(move |_frame, _origin| {
                let order = Arc::clone(&order);
                Box::pin(async move {
                    order.lock().unwrap().push(i);
                })
            }))
            .unwrap();
        }
        set.notify(&test_frame(), Origin::NONE).await.unwrap();
        assert_eq!(*order.lock().unwrap(), vec![0, 1, 2]);
    }

    #[tokio::test]
    async fn bounded_registration() {
        let set = CallbackSet::new();
        for _ in 0..MAX_RX_CALLBACKS {
            set.register(Arc::new(|_frame, _origin| Box::pin(async {})))
                .unwrap();
        }
        assert_eq!(
            set.register(Arc::new(|_frame, _origin| Box::pin(async {}))),
            Err(TransportError::TooManyCallbacks)
        );
    }

    #[tokio::test]
    async fn notify_without_callbacks() {
        let set = CallbackSet::new();
        assert_eq!(
            set.notify(&test_frame(), Origin::NONE).await,
            Err(TransportError::NoCallbacks)
        );
    }

    #[tokio::test]
    async fn origin_token_round_trip() {
        let set = CallbackSet::new();
        let seen = Arc::new(AtomicUsize::new(0));
        let seen2 = Arc::clone(&seen);
        set.register(Arc::new(move |_frame, origin| {
            let seen = Arc::clone(&seen2);
            Box::pin(async move {
                assert_eq!(origin.transaction_id(), 0x1234);
                assert!(!origin.is_none());
                seen.fetch_add(1, Ordering::SeqCst);
            })
        }))
        .unwrap();
        let origin = Origin {
            connection: 7,
            transaction_id: 0x1234,
        };
        set.notify(&test_frame(), origin).await.unwrap();
        assert_eq!(seen.load(Ordering::SeqCst), 1);
    }
}
