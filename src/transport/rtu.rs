// SPDX-FileCopyrightText: Copyright (c) 2026 modbus-link contributors
// SPDX-License-Identifier: MIT OR Apache-2.0

//! RTU transport: silence-framed byte stream over a half-duplex serial line.
//!
//! One bus, one speaker at a time. The RX task accumulates bytes and flushes
//! them into the codec once the line has been idle for the configured
//! silence interval (3.5 character times per the serial line spec). Frames
//! that fail CRC or length checks are dropped without a wire-level reply.

use std::{
    fmt,
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc, Mutex as StdMutex,
    },
    time::{Duration, Instant},
};

use async_trait::async_trait;
use bytes::BytesMut;
use smallvec::SmallVec;
use tokio::{
    io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt, ReadHalf, WriteHalf},
    sync::Mutex,
    time,
};

use crate::{
    codec::rtu::{decode_frame, encode_frame, MAX_FRAME_LEN},
    diag,
    frame::{Frame, FrameKind},
    transport::{
        CallbackSet, Origin, Role, RxCallback, Transport, TransportError, TransportResult,
        TxResultCallback,
    },
};

/// An RTU character is 11 bits on the wire (start + 8 data + parity/stop).
const CHAR_BITS: u64 = 11;

/// Bytes of undecodable line noise retained for the recovery log.
type DroppedBytes = SmallVec<[u8; MAX_FRAME_LEN]>;

/// RTU transport configuration.
#[derive(Debug, Clone)]
pub struct RtuConfig {
    /// Line speed in baud.
    pub baud: u32,
    /// Explicit inter-frame silence override. Derived from the baud rate
    /// when `None`.
    pub silence: Option<Duration>,
    /// Lower bound for the derived silence interval. The serial line spec
    /// recommends a fixed 1750 µs above 19200 baud.
    pub min_silence: Duration,
    /// Extra idle time required on top of the silence interval before
    /// seizing the bus for TX.
    pub bus_free_margin: Duration,
}

impl Default for RtuConfig {
    fn default() -> Self {
        Self {
            baud: 19_200,
            silence: None,
            min_silence: Duration::from_micros(1750),
            bus_free_margin: Duration::from_micros(500),
        }
    }
}

impl RtuConfig {
    #[must_use]
    pub fn with_baud(baud: u32) -> Self {
        Self {
            baud,
            ..Self::default()
        }
    }

    /// The effective inter-frame silence: 3.5 character times, floored at
    /// `min_silence`, unless explicitly overridden.
    #[must_use]
    pub fn effective_silence(&self) -> Duration {
        if let Some(silence) = self.silence {
            return silence;
        }
        let three_and_a_half_chars =
            Duration::from_micros(CHAR_BITS * 3_500_000 / u64::from(self.baud.max(1)));
        three_and_a_half_chars.max(self.min_silence)
    }

    fn char_time(&self) -> Duration {
        Duration::from_micros(CHAR_BITS * 1_000_000 / u64::from(self.baud.max(1)))
    }
}

/// Hook for a DE/RE (driver enable) line on half-duplex RS-485 hardware.
///
/// Asserted right before the transport starts driving the line, released
/// once the last character has drained.
pub trait DriverEnable: Send + Sync {
    fn assert(&self);
    fn release(&self);
}

struct RtuShared<S> {
    role: Role,
    silence: Duration,
    bus_free_margin: Duration,
    char_time: Duration,
    callbacks: CallbackSet,
    initialized: AtomicBool,
    transmitting: AtomicBool,
    last_activity: StdMutex<Instant>,
    writer: Mutex<Option<WriteHalf<S>>>,
    driver_enable: Option<Arc<dyn DriverEnable>>,
}

impl<S> RtuShared<S> {
    fn touch(&self) {
        let mut last = match self.last_activity.lock() {
            Ok(last) => last,
            Err(poisoned) => poisoned.into_inner(),
        };
        *last = Instant::now();
    }

    fn idle_for(&self) -> Duration {
        let last = match self.last_activity.lock() {
            Ok(last) => last,
            Err(poisoned) => poisoned.into_inner(),
        };
        last.elapsed()
    }
}

/// Modbus RTU transport over any asynchronous byte stream.
pub struct RtuTransport<S> {
    shared: Arc<RtuShared<S>>,
    io: StdMutex<Option<S>>,
}

impl<S> RtuTransport<S>
where
    S: AsyncRead + AsyncWrite + Send + 'static,
{
    /// Create a transport over `io`, typically a serial port.
    #[must_use]
    pub fn new(io: S, role: Role, config: &RtuConfig) -> Self {
        Self::with_driver_enable_opt(io, role, config, None)
    }

    /// Create a transport with a DE/RE guard for half-duplex line drivers.
    #[must_use]
    pub fn with_driver_enable(
        io: S,
        role: Role,
        config: &RtuConfig,
        driver_enable: Arc<dyn DriverEnable>,
    ) -> Self {
        Self::with_driver_enable_opt(io, role, config, Some(driver_enable))
    }

    fn with_driver_enable_opt(
        io: S,
        role: Role,
        config: &RtuConfig,
        driver_enable: Option<Arc<dyn DriverEnable>>,
    ) -> Self {
        Self {
            shared: Arc::new(RtuShared {
                role,
                silence: config.effective_silence(),
                bus_free_margin: config.bus_free_margin,
                char_time: config.char_time(),
                callbacks: CallbackSet::new(),
                initialized: AtomicBool::new(false),
                transmitting: AtomicBool::new(false),
                last_activity: StdMutex::new(Instant::now()),
                writer: Mutex::new(None),
                driver_enable,
            }),
            io: StdMutex::new(Some(io)),
        }
    }

    /// The effective silence interval this transport frames with.
    #[must_use]
    pub fn silence(&self) -> Duration {
        self.shared.silence
    }
}

#[cfg(feature = "serial")]
impl RtuTransport<tokio_serial::SerialStream> {
    /// Open a serial port by path (8N1 framing) and wrap it in an RTU
    /// transport.
    pub fn open<P: AsRef<std::path::Path>>(
        path: P,
        role: Role,
        config: &RtuConfig,
    ) -> TransportResult<Self> {
        let builder = tokio_serial::new(path.as_ref().to_string_lossy(), config.baud);
        Self::from_builder(&builder, role, config)
    }

    /// Open a pre-configured serial port builder (custom parity, stop
    /// bits, flow control) and wrap it in an RTU transport.
    pub fn from_builder(
        builder: &tokio_serial::SerialPortBuilder,
        role: Role,
        config: &RtuConfig,
    ) -> TransportResult<Self> {
        let serial = tokio_serial::SerialStream::open(builder)
            .map_err(|_| TransportError::ConfigFailed)?;
        Ok(Self::new(serial, role, config))
    }
}

impl<S> fmt::Debug for RtuTransport<S> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RtuTransport")
            .field("role", &self.shared.role)
            .field("silence", &self.shared.silence)
            .finish_non_exhaustive()
    }
}

#[async_trait]
impl<S> Transport for RtuTransport<S>
where
    S: AsyncRead + AsyncWrite + Send + 'static,
{
    async fn begin(&self) -> TransportResult<()> {
        if self.shared.initialized.swap(true, Ordering::AcqRel) {
            return Ok(());
        }
        let io = {
            let mut slot = match self.io.lock() {
                Ok(slot) => slot,
                Err(poisoned) => poisoned.into_inner(),
            };
            slot.take().ok_or(TransportError::InitFailed)?
        };
        let (reader, writer) = tokio::io::split(io);
        *self.shared.writer.lock().await = Some(writer);
        tokio::spawn(rx_task(reader, Arc::clone(&self.shared)));
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
        let expected_kind = match shared.role {
            Role::Client => FrameKind::Request,
            Role::Server => FrameKind::Response,
        };
        if frame.kind != expected_kind {
            return Err(TransportError::InvalidMessageType);
        }

        let bytes = encode_frame(frame)?;

        // One speaker at a time: concurrent senders observe Busy.
        let mut writer_guard = shared
            .writer
            .try_lock()
            .map_err(|_| TransportError::Busy)?;
        let writer = writer_guard.as_mut().ok_or(TransportError::NotInitialized)?;

        shared.transmitting.store(true, Ordering::Release);
        if let Some(de) = &shared.driver_enable {
            de.assert();
        }

        // Respect any ongoing silence window plus the bus-free margin.
        let needed = shared.silence + shared.bus_free_margin;
        loop {
            let idle = shared.idle_for();
            if idle >= needed {
                break;
            }
            time::sleep(needed - idle).await;
        }

        let result = async {
            writer.write_all(&bytes).await?;
            writer.flush().await
        }
        .await;

        // Let the line driver drain the last characters before releasing DE.
        #[allow(clippy::cast_possible_truncation)]
        let drain = shared.char_time * bytes.len() as u32;
        time::sleep(drain).await;

        if let Some(de) = &shared.driver_enable {
            de.release();
        }
        shared.touch();
        shared.transmitting.store(false, Ordering::Release);
        drop(writer_guard);

        if let Err(err) = result {
            log::warn!("RTU TX failed: {err}");
            diag::result(self as *const _ as usize, &TransportError::SendFailed);
            return Err(TransportError::SendFailed);
        }

        if let Some(callback) = on_tx_result {
            callback(Ok(())).await;
        }
        Ok(())
    }

    fn is_ready(&self) -> bool {
        let shared = &self.shared;
        shared.initialized.load(Ordering::Acquire)
            && !shared.transmitting.load(Ordering::Acquire)
            && shared.idle_for() >= shared.silence
    }

    fn register_rx_callback(&self, callback: RxCallback) -> TransportResult<()> {
        self.shared.callbacks.register(callback)
    }

    fn role(&self) -> Role {
        self.shared.role
    }
}

async fn rx_task<S>(mut reader: ReadHalf<S>, shared: Arc<RtuShared<S>>)
where
    S: AsyncRead + AsyncWrite + Send + 'static,
{
    let mut buf = BytesMut::with_capacity(2 * MAX_FRAME_LEN);
    let mut dropped = DroppedBytes::new();
    loop {
        if buf.is_empty() {
            // Nothing buffered: wait for the first byte of the next frame.
            match reader.read_buf(&mut buf).await {
                Ok(0) => break,
                Ok(_) => shared.touch(),
                Err(err) => {
                    log::warn!("RTU RX failed: {err}");
                    diag::result(
                        Arc::as_ptr(&shared) as usize,
                        &TransportError::RxFailed,
                    );
                    break;
                }
            }
            continue;
        }

        match time::timeout(shared.silence, reader.read_buf(&mut buf)).await {
            Ok(Ok(0)) => {
                // Stream closed with a buffered frame: flush it first.
                let bytes = buf.split();
                deliver(&shared, &bytes, &mut dropped).await;
                break;
            }
            Ok(Ok(_)) => {
                shared.touch();
                if buf.len() > MAX_FRAME_LEN {
                    log::warn!("RTU RX overflow, dropping {} byte(s)", buf.len());
                    diag::result(
                        Arc::as_ptr(&shared) as usize,
                        &TransportError::RxFailed,
                    );
                    buf.clear();
                }
            }
            Ok(Err(err)) => {
                log::warn!("RTU RX failed: {err}");
                diag::result(
                    Arc::as_ptr(&shared) as usize,
                    &TransportError::RxFailed,
                );
                break;
            }
            Err(_silence_elapsed) => {
                let bytes = buf.split();
                deliver(&shared, &bytes, &mut dropped).await;
            }
        }
    }
}

async fn deliver<S>(shared: &Arc<RtuShared<S>>, bytes: &BytesMut, dropped: &mut DroppedBytes) {
    let expected = match shared.role {
        Role::Client => FrameKind::Response,
        Role::Server => FrameKind::Request,
    };
    match decode_frame(bytes, expected) {
        Ok(frame) => {
            if !dropped.is_empty() {
                log::warn!(
                    "successfully decoded frame after dropping {} byte(s): {:X?}",
                    dropped.len(),
                    &dropped[..]
                );
                dropped.clear();
            }
            let frame = Arc::new(frame);
            if let Err(err) = shared.callbacks.notify(&frame, Origin::NONE).await {
                log::debug!("RTU frame not consumed: {err}");
            }
        }
        Err(err) => {
            // No negative acknowledgement on the wire: drop silently.
            log::warn!("dropping invalid RTU frame ({} bytes): {err}", bytes.len());
            diag::result(Arc::as_ptr(shared) as usize, &err);
            if dropped.len() + bytes.len() > MAX_FRAME_LEN {
                log::error!(
                    "giving up on recovery after dropping {} byte(s): {:X?}",
                    dropped.len(),
                    &dropped[..]
                );
                dropped.clear();
            }
            let keep = bytes.len().min(MAX_FRAME_LEN);
            dropped.extend_from_slice(&bytes[..keep]);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn silence_derivation() {
        // 9600 baud: 3.5 chars of 11 bits = 4010 µs, above the floor.
        let config = RtuConfig::with_baud(9600);
        assert_eq!(config.effective_silence(), Duration::from_micros(4010));

        // 115200 baud: the computed value collapses below the floor.
        let config = RtuConfig::with_baud(115_200);
        assert_eq!(config.effective_silence(), Duration::from_micros(1750));

        // Explicit override wins.
        let config = RtuConfig {
            silence: Some(Duration::from_millis(5)),
            ..RtuConfig::with_baud(9600)
        };
        assert_eq!(config.effective_silence(), Duration::from_millis(5));
    }

    #[tokio::test]
    async fn send_before_begin_is_rejected() {
        let (io, _peer) = tokio::io::duplex(1024);
        let transport = RtuTransport::new(io, Role::Client, &RtuConfig::default());
        let frame = Frame::request(
            crate::frame::FunctionCode::ReadCoils,
            1,
            0,
            1,
            crate::frame::FrameData::new(),
        );
        assert_eq!(
            transport.send_frame(&frame, Origin::NONE, None).await,
            Err(TransportError::NotInitialized)
        );
        assert!(!transport.is_ready());
    }

    #[tokio::test]
    async fn role_is_enforced_on_send() {
        let (io, _peer) = tokio::io::duplex(1024);
        let transport = RtuTransport::new(io, Role::Server, &RtuConfig::default());
        transport.begin().await.unwrap();
        let request = Frame::request(
            crate::frame::FunctionCode::ReadCoils,
            1,
            0,
            1,
            crate::frame::FrameData::new(),
        );
        assert_eq!(
            transport.send_frame(&request, Origin::NONE, None).await,
            Err(TransportError::InvalidMessageType)
        );
    }
}
