// SPDX-FileCopyrightText: Copyright (c) 2026 modbus-link contributors
// SPDX-License-Identifier: MIT OR Apache-2.0

//! Client engine: one-shot transactions with bounded timeout.
//!
//! The engine guarantees at most one request in flight per client. A
//! transaction terminates exactly once, through whichever path gets there
//! first: a matching response, a response mismatch, a TX failure, or the
//! timeout timer. Every non-timer path must neutralise the timer before it
//! finalises; if the timer cannot be proven inert within a bounded wait the
//! path backs off and the timeout handler performs the single finalisation.

use std::{
    fmt,
    sync::{
        atomic::{AtomicBool, AtomicU8, Ordering},
        Arc, Mutex as StdMutex,
    },
    time::{Duration, Instant},
};

use thiserror::Error;
use tokio::{sync::oneshot, task::JoinHandle, time};

use crate::{
    codec, diag,
    frame::{packed_coils_len, Frame, FrameKind, FrameMeta},
    transport::{Origin, Role, Transport, TransportResult, TxResultCallback},
};

/// Max round trip time before a request is abandoned.
pub const DEFAULT_REQUEST_TIMEOUT: Duration = Duration::from_millis(1000);

/// Bounded wait for proving the timeout timer inert.
const TIMER_KILL_BUDGET: Duration = Duration::from_millis(5);

/// Client configuration.
#[derive(Debug, Clone)]
pub struct ClientConfig {
    pub request_timeout: Duration,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            request_timeout: DEFAULT_REQUEST_TIMEOUT,
        }
    }
}

/// Errors returned by client operations.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum ClientError {
    #[error("invalid frame")]
    InvalidFrame,
    #[error("busy (transaction in progress)")]
    Busy,
    #[error("tx failed")]
    TxFailed,
    #[error("timeout")]
    Timeout,
    #[error("invalid response")]
    InvalidResponse,
    #[error("client not initialized")]
    NotInitialized,
    #[error("init failed")]
    InitFailed,
    #[error("timer failure")]
    TimerFailure,
}

impl ClientError {
    pub(crate) const fn as_str(self) -> &'static str {
        use ClientError::*;
        match self {
            InvalidFrame => "invalid frame",
            Busy => "busy",
            TxFailed => "tx failed",
            Timeout => "timeout",
            InvalidResponse => "invalid response",
            NotInitialized => "client not initialized",
            InitFailed => "init failed",
            TimerFailure => "timer failure",
        }
    }
}

impl diag::Diagnostic for ClientError {
    fn code(&self) -> u16 {
        use ClientError::*;
        match self {
            InvalidFrame => 1,
            Busy => 2,
            TxFailed => 3,
            Timeout => 4,
            InvalidResponse => 5,
            NotInitialized => 6,
            InitFailed => 7,
            TimerFailure => 8,
        }
    }

    fn name(&self) -> &'static str {
        self.as_str()
    }
}

/// Terminal (or pending) state of an asynchronous transaction.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum TransactionOutcome {
    /// Transaction still in flight.
    NoData = 0,
    Success = 1,
    InvalidFrame = 2,
    Busy = 3,
    TxFailed = 4,
    Timeout = 5,
    InvalidResponse = 6,
    NotInitialized = 7,
    TimerFailure = 8,
}

impl TransactionOutcome {
    fn from_u8(value: u8) -> Self {
        use TransactionOutcome::*;
        match value {
            1 => Success,
            2 => InvalidFrame,
            3 => Busy,
            4 => TxFailed,
            5 => Timeout,
            6 => InvalidResponse,
            7 => NotInitialized,
            8 => TimerFailure,
            _ => NoData,
        }
    }

    /// The matching error for a failed terminal outcome.
    #[must_use]
    pub fn as_error(self) -> Option<ClientError> {
        use TransactionOutcome::*;
        match self {
            NoData | Success => None,
            InvalidFrame => Some(ClientError::InvalidFrame),
            Busy => Some(ClientError::Busy),
            TxFailed => Some(ClientError::TxFailed),
            Timeout => Some(ClientError::Timeout),
            InvalidResponse => Some(ClientError::InvalidResponse),
            NotInitialized => Some(ClientError::NotInitialized),
            TimerFailure => Some(ClientError::TimerFailure),
        }
    }
}

/// Completion tracker for [`Client::send_request_tracked`].
///
/// Starts out in [`TransactionOutcome::NoData`] and transitions exactly once
/// to a terminal outcome. The response frame is stored before the transition
/// becomes visible.
#[derive(Debug, Clone, Default)]
pub struct RequestTracker {
    inner: Arc<TrackerInner>,
}

#[derive(Debug, Default)]
struct TrackerInner {
    state: AtomicU8,
    response: StdMutex<Option<Frame>>,
}

impl RequestTracker {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn outcome(&self) -> TransactionOutcome {
        TransactionOutcome::from_u8(self.inner.state.load(Ordering::Acquire))
    }

    #[must_use]
    pub fn is_pending(&self) -> bool {
        self.outcome() == TransactionOutcome::NoData
    }

    /// Take the response once the outcome is [`TransactionOutcome::Success`].
    #[must_use]
    pub fn take_response(&self) -> Option<Frame> {
        match self.inner.response.lock() {
            Ok(mut slot) => slot.take(),
            Err(poisoned) => poisoned.into_inner().take(),
        }
    }

    fn reset(&self) {
        if let Ok(mut slot) = self.inner.response.lock() {
            *slot = None;
        }
        self.inner.state.store(TransactionOutcome::NoData as u8, Ordering::Release);
    }

    fn complete(&self, outcome: TransactionOutcome, response: Option<Frame>) {
        // Response first, state second: a reader observing a terminal
        // outcome must find the response already in place.
        if let Ok(mut slot) = self.inner.response.lock() {
            *slot = response;
        }
        let _ = self.inner.state.compare_exchange(
            TransactionOutcome::NoData as u8,
            outcome as u8,
            Ordering::AcqRel,
            Ordering::Acquire,
        );
    }
}

/// Completion callback for [`Client::send_request_with`].
///
/// The response reference is valid only for the duration of the call.
pub type ResponseCallback = Box<dyn FnOnce(TransactionOutcome, Option<&Frame>) + Send>;

enum Completion {
    Sync(oneshot::Sender<(TransactionOutcome, Option<Frame>)>),
    Tracked(RequestTracker),
    Callback(ResponseCallback),
}

struct Inflight {
    meta: FrameMeta,
    broadcast: bool,
    started_at: Instant,
    completion: Option<Completion>,
    timer: Option<JoinHandle<()>>,
}

/// The single-slot transaction record.
struct PendingRequest {
    active: AtomicBool,
    inner: StdMutex<Option<Inflight>>,
}

impl PendingRequest {
    fn new() -> Self {
        Self {
            active: AtomicBool::new(false),
            inner: StdMutex::new(None),
        }
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Option<Inflight>> {
        match self.inner.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }

    fn set(&self, meta: FrameMeta, broadcast: bool, completion: Completion) -> Result<(), ClientError> {
        let mut inner = self.lock();
        if inner.is_some() {
            return Err(ClientError::Busy);
        }
        *inner = Some(Inflight {
            meta,
            broadcast,
            started_at: Instant::now(),
            completion: Some(completion),
            timer: None,
        });
        self.active.store(true, Ordering::Release);
        Ok(())
    }

    fn attach_timer(&self, timer: JoinHandle<()>) {
        let mut inner = self.lock();
        match inner.as_mut() {
            Some(inflight) => inflight.timer = Some(timer),
            // Already finalised (degenerate zero timeout): nothing to arm.
            None => timer.abort(),
        }
    }

    fn is_active(&self) -> bool {
        self.active.load(Ordering::Acquire)
    }

    fn is_broadcast(&self) -> bool {
        self.lock().as_ref().map(|i| i.broadcast).unwrap_or(false)
    }

    fn snapshot(&self) -> Option<FrameMeta> {
        self.lock().as_ref().map(|i| i.meta)
    }

    /// Atomically end the transaction, returning its record exactly once.
    fn take(&self) -> Option<Inflight> {
        let mut inner = self.lock();
        let inflight = inner.take();
        if inflight.is_some() {
            self.active.store(false, Ordering::Release);
        }
        inflight
    }

    /// Neutralise the timeout timer: request cancellation, then wait for the
    /// timer task to be provably finished (the join is the fence past any
    /// in-flight firing). Returns `false` if that cannot be established
    /// within `budget`, in which case the caller must not finalise.
    async fn kill_timer(&self, budget: Duration) -> bool {
        let timer = self.lock().as_mut().and_then(|i| i.timer.take());
        let Some(mut timer) = timer else {
            return true;
        };
        timer.abort();
        match time::timeout(budget, &mut timer).await {
            Ok(_join) => true,
            Err(_elapsed) => {
                // The timer task is wedged mid-run; hand finalisation to it.
                if let Some(inflight) = self.lock().as_mut() {
                    inflight.timer = Some(timer);
                }
                false
            }
        }
    }
}

struct ClientShared {
    transport: Arc<dyn Transport>,
    request_timeout: Duration,
    pending: PendingRequest,
    initialized: AtomicBool,
}

/// A Modbus client bound to one transport.
pub struct Client {
    shared: Arc<ClientShared>,
}

impl fmt::Debug for Client {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Client")
            .field("transport", &self.shared.transport)
            .field("request_timeout", &self.shared.request_timeout)
            .field("active", &self.shared.pending.is_active())
            .finish()
    }
}

impl Client {
    #[must_use]
    pub fn new(transport: Arc<dyn Transport>, config: ClientConfig) -> Self {
        Self {
            shared: Arc::new(ClientShared {
                transport,
                request_timeout: config.request_timeout,
                pending: PendingRequest::new(),
                initialized: AtomicBool::new(false),
            }),
        }
    }

    /// Initialise the underlying transport and hook up response delivery.
    /// One-shot and idempotent.
    pub async fn begin(&self) -> Result<(), ClientError> {
        let shared = &self.shared;
        if shared.initialized.load(Ordering::Acquire) {
            return Ok(());
        }
        if shared.transport.role() != Role::Client {
            return Err(ClientError::InitFailed);
        }
        shared
            .transport
            .begin()
            .await
            .map_err(|_| ClientError::InitFailed)?;
        let rx_shared = Arc::clone(shared);
        shared
            .transport
            .register_rx_callback(Arc::new(move |frame, _origin| {
                let shared = Arc::clone(&rx_shared);
                Box::pin(async move {
                    shared.handle_response(&frame).await;
                })
            }))
            .map_err(|_| ClientError::InitFailed)?;
        shared.initialized.store(true, Ordering::Release);
        Ok(())
    }

    /// `true` when a new request would be accepted right away.
    #[must_use]
    pub fn is_ready(&self) -> bool {
        self.shared.initialized.load(Ordering::Acquire)
            && !self.shared.pending.is_active()
            && self.shared.transport.is_ready()
    }

    /// Send a request and wait for its completion.
    ///
    /// Returns the response frame, or `None` for broadcast requests (which
    /// complete as soon as the transmission is out). A returned frame with
    /// `exception` set means the server answered with a Modbus exception;
    /// that is still a successful transaction.
    pub async fn send_request(&self, request: &Frame) -> Result<Option<Frame>, ClientError> {
        let (tx, rx) = oneshot::channel();
        self.start_request(request, Completion::Sync(tx)).await?;
        let (outcome, response) = rx.await.map_err(|_| ClientError::TimerFailure)?;
        match outcome.as_error() {
            None => Ok(response),
            Some(err) => Err(err),
        }
    }

    /// Send a request and return immediately; `tracker` transitions from
    /// [`TransactionOutcome::NoData`] to the terminal outcome exactly once.
    pub async fn send_request_tracked(
        &self,
        request: &Frame,
        tracker: &RequestTracker,
    ) -> Result<(), ClientError> {
        tracker.reset();
        self.start_request(request, Completion::Tracked(tracker.clone()))
            .await
    }

    /// Send a request and return immediately; `callback` fires exactly once
    /// on completion.
    pub async fn send_request_with(
        &self,
        request: &Frame,
        callback: ResponseCallback,
    ) -> Result<(), ClientError> {
        self.start_request(request, Completion::Callback(callback))
            .await
    }

    async fn start_request(
        &self,
        request: &Frame,
        completion: Completion,
    ) -> Result<(), ClientError> {
        let shared = &self.shared;
        if !shared.initialized.load(Ordering::Acquire) {
            return Err(ClientError::NotInitialized);
        }
        if request.kind != FrameKind::Request || codec::validate(request).is_err() {
            return Err(ClientError::InvalidFrame);
        }

        shared
            .pending
            .set(request.meta(), request.is_broadcast(), completion)?;

        let timer_shared = Arc::clone(shared);
        let timer = tokio::spawn(async move {
            time::sleep(timer_shared.request_timeout).await;
            timer_shared.on_timer_fired().await;
        });
        shared.pending.attach_timer(timer);

        let tx_shared = Arc::clone(shared);
        let tx_callback: TxResultCallback = Box::new(move |result| {
            Box::pin(async move {
                tx_shared.on_tx_result(result).await;
            })
        });

        match shared
            .transport
            .send_frame(request, Origin::NONE, Some(tx_callback))
            .await
        {
            Ok(()) => Ok(()),
            Err(err) => {
                log::warn!("request not accepted by transport: {err}");
                diag::result(Arc::as_ptr(shared) as usize, &ClientError::TxFailed);
                // The frame never reached the wire and no TX callback will
                // fire; withdraw the transaction without notifying.
                shared.cancel().await;
                Err(ClientError::TxFailed)
            }
        }
    }
}

impl ClientShared {
    async fn handle_response(&self, response: &Frame) {
        if response.kind != FrameKind::Response {
            return;
        }
        if !self.pending.is_active() {
            // Stale response from an earlier, abandoned transaction.
            log::debug!("dropping unsolicited response");
            return;
        }
        let Some(meta) = self.pending.snapshot() else {
            return;
        };
        if matches_request(&meta, response) {
            self.finalize(TransactionOutcome::Success, Some(response))
                .await;
        } else {
            log::warn!(
                "response does not match request {:?}/{:?}",
                meta.function,
                meta.slave_id
            );
            diag::result(self as *const Self as usize, &ClientError::InvalidResponse);
            self.finalize(TransactionOutcome::InvalidResponse, None)
                .await;
        }
    }

    async fn on_tx_result(&self, result: TransportResult<()>) {
        match result {
            Ok(()) => {
                if self.pending.is_broadcast() {
                    // Broadcasts are done once the bytes are out; nobody
                    // will answer.
                    self.finalize(TransactionOutcome::Success, None).await;
                }
            }
            Err(err) => {
                log::warn!("TX completion failed: {err}");
                diag::result(self as *const Self as usize, &ClientError::TxFailed);
                self.finalize(TransactionOutcome::TxFailed, None).await;
            }
        }
    }

    async fn on_timer_fired(&self) {
        // This is the one path that does not neutralise the timer first.
        let Some(inflight) = self.pending.take() else {
            return;
        };
        log::warn!(
            "request timed out after {:?}",
            inflight.started_at.elapsed()
        );
        diag::result(self as *const Self as usize, &ClientError::Timeout);
        self.transport.abort_current();
        deliver(inflight, TransactionOutcome::Timeout, None);
    }

    /// Terminate the transaction through a non-timer path.
    async fn finalize(&self, outcome: TransactionOutcome, response: Option<&Frame>) -> bool {
        if !self.pending.kill_timer(TIMER_KILL_BUDGET).await {
            // Monotonic single-finalisation: the timeout path owns it now.
            log::debug!("timer not provably inert, deferring to timeout path");
            return false;
        }
        let Some(inflight) = self.pending.take() else {
            return false;
        };
        deliver(inflight, outcome, response);
        true
    }

    /// Withdraw the transaction without delivering a completion.
    async fn cancel(&self) {
        if !self.pending.kill_timer(TIMER_KILL_BUDGET).await {
            return;
        }
        drop(self.pending.take());
    }
}

fn deliver(mut inflight: Inflight, outcome: TransactionOutcome, response: Option<&Frame>) {
    let Some(completion) = inflight.completion.take() else {
        return;
    };
    match completion {
        Completion::Sync(tx) => {
            let _ = tx.send((outcome, response.cloned()));
        }
        Completion::Tracked(tracker) => tracker.complete(outcome, response.cloned()),
        Completion::Callback(callback) => callback(outcome, response),
    }
}

/// Response matching: slave id and base function code always; reads
/// additionally match the register count (packed byte length for bit reads,
/// since the wire does not echo the exact bit count); write responses echo
/// address and count.
fn matches_request(request: &FrameMeta, response: &Frame) -> bool {
    if response.slave_id != request.slave_id || response.function != request.function {
        return false;
    }
    if response.exception.is_some() {
        return true;
    }
    if request.function.is_read() {
        if request.function.addresses_bits() {
            packed_coils_len(usize::from(request.reg_count))
                == packed_coils_len(usize::from(response.reg_count))
                && usize::from(response.reg_count) >= usize::from(request.reg_count)
        } else {
            response.reg_count == request.reg_count
        }
    } else if request.function.is_write_single() {
        response.reg_address == request.reg_address
    } else {
        response.reg_address == request.reg_address && response.reg_count == request.reg_count
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::frame::{pack_registers, FrameData, FunctionCode};

    fn meta_of(frame: &Frame) -> FrameMeta {
        frame.meta()
    }

    #[test]
    fn tracker_transitions_once() {
        let tracker = RequestTracker::new();
        assert!(tracker.is_pending());

        let response = Frame::response(
            FunctionCode::ReadHoldingRegisters,
            1,
            0,
            1,
            pack_registers(&[0x1234]),
        );
        tracker.complete(TransactionOutcome::Success, Some(response));
        assert_eq!(tracker.outcome(), TransactionOutcome::Success);
        assert_eq!(tracker.take_response().unwrap().register(0), Some(0x1234));

        // A second completion must not overwrite the terminal state.
        tracker.complete(TransactionOutcome::Timeout, None);
        assert_eq!(tracker.outcome(), TransactionOutcome::Success);
    }

    #[test]
    fn response_matching_register_read() {
        let request = Frame::request(
            FunctionCode::ReadHoldingRegisters,
            1,
            0x6B,
            2,
            FrameData::new(),
        );
        let good = Frame::response(
            FunctionCode::ReadHoldingRegisters,
            1,
            0,
            2,
            pack_registers(&[1, 2]),
        );
        assert!(matches_request(&meta_of(&request), &good));

        let wrong_count = Frame::response(
            FunctionCode::ReadHoldingRegisters,
            1,
            0,
            3,
            pack_registers(&[1, 2, 3]),
        );
        assert!(!matches_request(&meta_of(&request), &wrong_count));

        let wrong_slave = Frame::response(
            FunctionCode::ReadHoldingRegisters,
            2,
            0,
            2,
            pack_registers(&[1, 2]),
        );
        assert!(!matches_request(&meta_of(&request), &wrong_slave));

        let wrong_fc = Frame::response(
            FunctionCode::ReadInputRegisters,
            1,
            0,
            2,
            pack_registers(&[1, 2]),
        );
        assert!(!matches_request(&meta_of(&request), &wrong_fc));
    }

    #[test]
    fn response_matching_bit_read_tolerates_padding() {
        let request = Frame::request(FunctionCode::ReadCoils, 1, 0, 5, FrameData::new());
        // The wire only reveals one padded byte: 8 coils.
        let response = Frame::response(
            FunctionCode::ReadCoils,
            1,
            0,
            8,
            crate::frame::pack_coils(&[true, false, false, true, false, false, false, false]),
        );
        assert!(matches_request(&meta_of(&request), &response));

        // Two bytes would mean the server answered a different request.
        let too_long = Frame::response(
            FunctionCode::ReadCoils,
            1,
            0,
            16,
            crate::frame::pack_coils(&[false; 16]),
        );
        assert!(!matches_request(&meta_of(&request), &too_long));
    }

    #[test]
    fn response_matching_exception() {
        let request = Frame::request(
            FunctionCode::ReadHoldingRegisters,
            1,
            0x6B,
            2,
            FrameData::new(),
        );
        let exception = Frame::exception_response(
            FunctionCode::ReadHoldingRegisters,
            1,
            crate::frame::ExceptionCode::IllegalDataAddress,
        );
        assert!(matches_request(&meta_of(&request), &exception));
    }

    #[test]
    fn response_matching_write_echo() {
        let request = Frame::request(
            FunctionCode::WriteMultipleRegisters,
            1,
            0x10,
            2,
            pack_registers(&[1, 2]),
        );
        let echo = Frame::response(
            FunctionCode::WriteMultipleRegisters,
            1,
            0x10,
            2,
            FrameData::new(),
        );
        assert!(matches_request(&meta_of(&request), &echo));

        let wrong_addr = Frame::response(
            FunctionCode::WriteMultipleRegisters,
            1,
            0x11,
            2,
            FrameData::new(),
        );
        assert!(!matches_request(&meta_of(&request), &wrong_addr));
    }

    #[tokio::test]
    async fn pending_request_single_flight() {
        let pending = PendingRequest::new();
        let request = Frame::request(
            FunctionCode::ReadHoldingRegisters,
            1,
            0,
            1,
            FrameData::new(),
        );
        let (tx, _rx) = oneshot::channel();
        pending
            .set(request.meta(), false, Completion::Sync(tx))
            .unwrap();
        assert!(pending.is_active());

        let (tx2, _rx2) = oneshot::channel();
        assert_eq!(
            pending.set(request.meta(), false, Completion::Sync(tx2)),
            Err(ClientError::Busy)
        );

        // Exactly one take succeeds.
        assert!(pending.take().is_some());
        assert!(pending.take().is_none());
        assert!(!pending.is_active());
    }

    #[tokio::test]
    async fn kill_timer_is_a_fence() {
        let pending = PendingRequest::new();
        let request = Frame::request(
            FunctionCode::ReadHoldingRegisters,
            1,
            0,
            1,
            FrameData::new(),
        );
        let (tx, _rx) = oneshot::channel();
        pending
            .set(request.meta(), false, Completion::Sync(tx))
            .unwrap();
        let timer = tokio::spawn(async {
            time::sleep(Duration::from_secs(60)).await;
        });
        pending.attach_timer(timer);

        assert!(pending.kill_timer(Duration::from_millis(100)).await);
        // Killing again is a no-op once the handle is gone.
        assert!(pending.kill_timer(Duration::from_millis(100)).await);
    }
}
