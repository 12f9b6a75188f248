// SPDX-FileCopyrightText: Copyright (c) 2026 modbus-link contributors
// SPDX-License-Identifier: MIT OR Apache-2.0

//! Diagnostic event bus.
//!
//! A fixed-size, process-wide queue of result records produced wherever
//! errors and noteworthy results arise inside the stack. Consumers pop
//! records, optionally filtering out named producer instances. Producers
//! never block; on overflow the oldest record is dropped and counted.
//!
//! The whole bus is compiled out unless the `diagnostics` feature is
//! enabled: every producer call becomes an empty inline function.

use crate::frame::FrameMeta;

/// Classification of a diagnostic record.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EventKind {
    /// An error or result code raised somewhere in the stack.
    Result,
    /// A processed request, with its frame metadata attached.
    Request,
}

/// One diagnostic record.
#[derive(Debug, Clone)]
pub struct Record {
    pub kind: EventKind,
    /// Numeric result code of the producing error enum.
    pub code: u16,
    /// Static textual name of the result.
    pub name: &'static str,
    /// Frame metadata, present for [`EventKind::Request`] records.
    pub frame: Option<FrameMeta>,
    /// Address of the producing instance, usable with [`filter_out`].
    pub instance: usize,
    pub timestamp: std::time::SystemTime,
    pub file: &'static str,
    pub line: u32,
}

/// Anything that can be reported on the bus: a numeric code plus a static
/// name, mirroring the `as_str` helpers on the error enums.
pub(crate) trait Diagnostic {
    fn code(&self) -> u16;
    fn name(&self) -> &'static str;
}

impl Diagnostic for crate::codec::CodecError {
    fn code(&self) -> u16 {
        use crate::codec::CodecError::*;
        match self {
            InvalidFunctionCode(_) => 1,
            InvalidType => 2,
            InvalidException => 3,
            InvalidSlaveId(_) => 4,
            InvalidRegisterCount(_) => 5,
            InvalidCrc { .. } => 6,
            InvalidMbapProtocolId(_) => 7,
            InvalidMbapLen(_) => 8,
            InvalidLen(_) => 9,
            BufferTooSmall => 10,
        }
    }

    fn name(&self) -> &'static str {
        self.as_str()
    }
}

impl Diagnostic for crate::frame::ExceptionCode {
    fn code(&self) -> u16 {
        u16::from(self.value())
    }

    fn name(&self) -> &'static str {
        self.as_str()
    }
}

/// Marker for successfully served requests.
#[derive(Debug, Clone, Copy)]
pub(crate) struct Served;

impl Diagnostic for Served {
    fn code(&self) -> u16 {
        0
    }

    fn name(&self) -> &'static str {
        "request served"
    }
}

impl Diagnostic for crate::transport::TransportError {
    fn code(&self) -> u16 {
        use crate::transport::TransportError::*;
        match self {
            InitFailed => 1,
            InvalidFrame(_) => 2,
            Busy => 3,
            RxFailed => 4,
            SendFailed => 5,
            InvalidMessageType => 6,
            InvalidTransactionId => 7,
            Timeout => 8,
            InvalidRole => 9,
            ConnectionFailed => 10,
            ConfigFailed => 11,
            TooManyCallbacks => 12,
            NoCallbacks => 13,
            NotInitialized => 14,
        }
    }

    fn name(&self) -> &'static str {
        self.as_str()
    }
}

#[cfg(feature = "diagnostics")]
mod bus {
    use std::{
        collections::VecDeque,
        sync::{
            atomic::{AtomicBool, AtomicU32, Ordering},
            Condvar, Mutex, OnceLock,
        },
        time::{Duration, SystemTime},
    };

    use smallvec::SmallVec;

    use super::{Diagnostic, EventKind, Record};
    use crate::frame::FrameMeta;

    /// Capacity of the record queue.
    pub(crate) const QUEUE_SIZE: usize = 16;

    /// Number of instance filter slots.
    pub(crate) const INSTANCE_FILTER_SIZE: usize = 8;

    struct Bus {
        enabled: AtomicBool,
        records: Mutex<VecDeque<Record>>,
        available: Condvar,
        dropped: AtomicU32,
        filters: Mutex<SmallVec<[usize; INSTANCE_FILTER_SIZE]>>,
    }

    static BUS: OnceLock<Bus> = OnceLock::new();

    fn bus() -> &'static Bus {
        BUS.get_or_init(|| Bus {
            enabled: AtomicBool::new(false),
            records: Mutex::new(VecDeque::with_capacity(QUEUE_SIZE)),
            available: Condvar::new(),
            dropped: AtomicU32::new(0),
            filters: Mutex::new(SmallVec::new()),
        })
    }

    /// Start collecting records. Idempotent.
    pub fn init() -> bool {
        bus().enabled.store(true, Ordering::Release);
        true
    }

    /// Stop collecting and discard anything queued.
    pub fn shutdown() {
        let bus = bus();
        bus.enabled.store(false, Ordering::Release);
        if let Ok(mut records) = bus.records.lock() {
            records.clear();
        }
    }

    /// Pop the oldest record, waiting up to `timeout` if the queue is empty.
    /// `None` timeout polls without waiting.
    pub fn pop(timeout: Option<Duration>) -> Option<Record> {
        let bus = bus();
        let mut records = bus.records.lock().ok()?;
        if let Some(record) = records.pop_front() {
            return Some(record);
        }
        let timeout = timeout?;
        let (mut records, result) = bus
            .available
            .wait_timeout_while(records, timeout, |records| records.is_empty())
            .ok()?;
        if result.timed_out() && records.is_empty() {
            return None;
        }
        records.pop_front()
    }

    /// Suppress records from the given producer instance.
    pub fn filter_out(instance: usize) -> bool {
        let Ok(mut filters) = bus().filters.lock() else {
            return false;
        };
        if filters.len() >= INSTANCE_FILTER_SIZE {
            return false;
        }
        if !filters.contains(&instance) {
            filters.push(instance);
        }
        true
    }

    /// Number of records lost to queue overflow so far.
    pub fn dropped_count() -> u32 {
        bus().dropped.load(Ordering::Relaxed)
    }

    fn is_filtered(instance: usize) -> bool {
        bus()
            .filters
            .lock()
            .map(|filters| filters.contains(&instance))
            .unwrap_or(false)
    }

    fn push(record: Record) {
        let bus = bus();
        if !bus.enabled.load(Ordering::Acquire) || is_filtered(record.instance) {
            return;
        }
        let Ok(mut records) = bus.records.lock() else {
            return;
        };
        if records.len() >= QUEUE_SIZE {
            records.pop_front();
            bus.dropped.fetch_add(1, Ordering::Relaxed);
        }
        records.push_back(record);
        bus.available.notify_one();
    }

    #[track_caller]
    pub(crate) fn result<E: Diagnostic>(instance: usize, error: &E) {
        let location = std::panic::Location::caller();
        push(Record {
            kind: EventKind::Result,
            code: error.code(),
            name: error.name(),
            frame: None,
            instance,
            timestamp: SystemTime::now(),
            file: location.file(),
            line: location.line(),
        });
    }

    #[track_caller]
    pub(crate) fn request<E: Diagnostic>(instance: usize, meta: FrameMeta, result: &E) {
        let location = std::panic::Location::caller();
        push(Record {
            kind: EventKind::Request,
            code: result.code(),
            name: result.name(),
            frame: Some(meta),
            instance,
            timestamp: SystemTime::now(),
            file: location.file(),
            line: location.line(),
        });
    }
}

#[cfg(feature = "diagnostics")]
pub use bus::{dropped_count, filter_out, init, pop, shutdown};
#[cfg(feature = "diagnostics")]
pub(crate) use bus::{request, result};

#[cfg(not(feature = "diagnostics"))]
mod noop {
    use std::time::Duration;

    use super::{Diagnostic, Record};
    use crate::frame::FrameMeta;

    #[inline]
    pub fn init() -> bool {
        false
    }

    #[inline]
    pub fn shutdown() {}

    #[inline]
    pub fn pop(_timeout: Option<Duration>) -> Option<Record> {
        None
    }

    #[inline]
    pub fn filter_out(_instance: usize) -> bool {
        true
    }

    #[inline]
    pub fn dropped_count() -> u32 {
        0
    }

    #[inline]
    pub(crate) fn result<E: Diagnostic>(_instance: usize, _error: &E) {}

    #[inline]
    pub(crate) fn request<E: Diagnostic>(_instance: usize, _meta: FrameMeta, _result: &E) {}
}

#[cfg(not(feature = "diagnostics"))]
pub use noop::{dropped_count, filter_out, init, pop, shutdown};
#[cfg(not(feature = "diagnostics"))]
pub(crate) use noop::{request, result};

#[cfg(all(test, feature = "diagnostics"))]
mod tests {
    use super::*;
    use std::time::Duration;

    use crate::transport::TransportError;

    // The bus is a process-wide singleton, so everything runs in one test
    // to avoid cross-test interference.
    #[test]
    fn bus_lifecycle() {
        init();

        result(0x1000, &TransportError::Timeout);
        let record = pop(Some(Duration::from_millis(100))).unwrap();
        assert_eq!(record.kind, EventKind::Result);
        assert_eq!(record.name, "timeout");
        assert_eq!(record.instance, 0x1000);
        assert!(record.file.ends_with("diag.rs"));

        // Overflow drops the oldest and counts it.
        for i in 0..(bus::QUEUE_SIZE as u16 + 4) {
            result(usize::from(i), &TransportError::Busy);
        }
        assert_eq!(dropped_count(), 4);
        let oldest = pop(None).unwrap();
        assert_eq!(oldest.instance, 4);
        while pop(None).is_some() {}

        // Filtered instances are suppressed.
        assert!(filter_out(0xBEEF));
        result(0xBEEF, &TransportError::Busy);
        assert!(pop(None).is_none());

        // Shutdown disables producers.
        shutdown();
        result(0x1000, &TransportError::Busy);
        assert!(pop(None).is_none());
    }
}
