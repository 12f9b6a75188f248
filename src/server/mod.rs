// SPDX-FileCopyrightText: Copyright (c) 2026 modbus-link contributors
// SPDX-License-Identifier: MIT OR Apache-2.0

//! Server engine: resolves requests against a store of user-defined words.
//!
//! A single mutex guards the word store and the whole dispatch path, across
//! every transport the server is attached to. The lock policy decides what
//! happens when interfaces contend: wait (serialisation) or answer
//! `SERVER_DEVICE_BUSY` right away (fast-busy).

pub mod word;

use std::{
    fmt,
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc, Mutex as StdMutex,
    },
    time::Duration,
};

use thiserror::Error;
use tokio::{
    sync::{Mutex, MutexGuard},
    time,
};

use crate::{
    diag,
    frame::{
        pack_coils, pack_registers, ExceptionCode, Frame, FrameData, FrameKind, FunctionCode,
    },
    slave::SlaveId,
    transport::{Origin, Role, Transport},
};

pub use word::{
    direct_storage, DynamicWordStore, ReadWordHandler, RegisterType, StaticWordStore, Word,
    WordAccess, WordStore, WriteWordHandler, MAX_WORD_SIZE,
};

use word::register_type;

/// Errors returned by server configuration and dispatch.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum ServerError {
    #[error("word store busy")]
    WordBusy,
    #[error("stored too many words")]
    WordOverflow,
    #[error("invalid word")]
    WordInvalid,
    #[error("invalid direct storage")]
    WordDirectPtr,
    #[error("malformed handlers")]
    WordHandler,
    #[error("word overlaps an existing word")]
    WordOverlap,
    #[error("unknown word")]
    UnknownWord,
    #[error("incoming request while busy")]
    BusyOnReceive,
    #[error("received invalid request")]
    InvalidType,
    #[error("wrong slave id in received frame")]
    WrongSlaveId,
    #[error("illegal function in received frame")]
    IllegalFunction,
    #[error("illegal data address in received frame")]
    IllegalDataAddress,
    #[error("illegal data value in received frame")]
    IllegalDataValue,
    #[error("slave device failure on received frame")]
    SlaveDeviceFailure,
    #[error("transmit response failed")]
    TxFailed,
    #[error("server not initialized")]
    NotInitialized,
    #[error("init failed")]
    InitFailed,
}

impl ServerError {
    pub(crate) const fn as_str(self) -> &'static str {
        use ServerError::*;
        match self {
            WordBusy => "word store busy",
            WordOverflow => "stored too many words",
            WordInvalid => "invalid word",
            WordDirectPtr => "invalid direct storage",
            WordHandler => "malformed handlers",
            WordOverlap => "word overlap",
            UnknownWord => "unknown word",
            BusyOnReceive => "busy on receive",
            InvalidType => "invalid request type",
            WrongSlaveId => "wrong slave id",
            IllegalFunction => "illegal function",
            IllegalDataAddress => "illegal data address",
            IllegalDataValue => "illegal data value",
            SlaveDeviceFailure => "slave device failure",
            TxFailed => "tx failed",
            NotInitialized => "server not initialized",
            InitFailed => "init failed",
        }
    }
}

impl diag::Diagnostic for ServerError {
    fn code(&self) -> u16 {
        use ServerError::*;
        match self {
            WordBusy => 1,
            WordOverflow => 2,
            WordInvalid => 3,
            WordDirectPtr => 4,
            WordHandler => 5,
            WordOverlap => 6,
            UnknownWord => 7,
            BusyOnReceive => 8,
            InvalidType => 9,
            WrongSlaveId => 10,
            IllegalFunction => 11,
            IllegalDataAddress => 12,
            IllegalDataValue => 13,
            SlaveDeviceFailure => 14,
            TxFailed => 15,
            NotInitialized => 16,
            InitFailed => 17,
        }
    }

    fn name(&self) -> &'static str {
        self.as_str()
    }
}

/// How dispatch acquires the per-server mutex.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LockPolicy {
    /// Never wait: contention answers `SERVER_DEVICE_BUSY` immediately.
    TryLock,
    /// Wait up to the given duration, then answer busy.
    Timeout(Duration),
    /// Wait until the mutex is free (full serialisation across interfaces).
    WaitForever,
}

impl Default for LockPolicy {
    fn default() -> Self {
        Self::WaitForever
    }
}

/// Server configuration.
#[derive(Debug, Clone)]
pub struct ServerConfig {
    /// The slave id this server answers to (broadcast aside).
    pub server_id: SlaveId,
    /// Reject reads touching undefined registers with
    /// `ILLEGAL_DATA_ADDRESS`; when `false`, gaps read as zero.
    pub reject_undefined: bool,
    pub lock_policy: LockPolicy,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            server_id: 1,
            reject_undefined: true,
            lock_policy: LockPolicy::WaitForever,
        }
    }
}

struct ServerShared {
    config: ServerConfig,
    store: Mutex<Box<dyn WordStore>>,
    transports: StdMutex<Vec<Arc<dyn Transport>>>,
    initialized: AtomicBool,
}

/// A Modbus server publishing words over one or more transports.
pub struct Server {
    shared: Arc<ServerShared>,
}

impl fmt::Debug for Server {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Server")
            .field("server_id", &self.shared.config.server_id)
            .field("initialized", &self.shared.initialized.load(Ordering::Relaxed))
            .finish_non_exhaustive()
    }
}

impl Server {
    #[must_use]
    pub fn new(store: Box<dyn WordStore>, config: ServerConfig) -> Self {
        Self {
            shared: Arc::new(ServerShared {
                config,
                store: Mutex::new(store),
                transports: StdMutex::new(Vec::new()),
                initialized: AtomicBool::new(false),
            }),
        }
    }

    /// Attach a server-role transport. Transports attached after `begin`
    /// are initialised and wired up immediately.
    pub async fn attach(&self, transport: Arc<dyn Transport>) -> Result<(), ServerError> {
        if transport.role() != Role::Server {
            return Err(ServerError::InitFailed);
        }
        if self.shared.initialized.load(Ordering::Acquire) {
            transport
                .begin()
                .await
                .map_err(|_| ServerError::InitFailed)?;
            register_dispatch(&self.shared, &transport)?;
        }
        lock_transports(&self.shared).push(transport);
        Ok(())
    }

    /// Initialise every attached transport and start serving. One-shot and
    /// idempotent.
    pub async fn begin(&self) -> Result<(), ServerError> {
        let shared = &self.shared;
        if shared.initialized.swap(true, Ordering::AcqRel) {
            return Ok(());
        }
        let transports = lock_transports(shared).clone();
        if transports.is_empty() {
            shared.initialized.store(false, Ordering::Release);
            return Err(ServerError::InitFailed);
        }
        for transport in &transports {
            if let Err(err) = transport.begin().await {
                log::error!("transport init failed: {err}");
                shared.initialized.store(false, Ordering::Release);
                return Err(ServerError::InitFailed);
            }
            if register_dispatch(shared, transport).is_err() {
                shared.initialized.store(false, Ordering::Release);
                return Err(ServerError::InitFailed);
            }
        }
        Ok(())
    }

    /// Publish a word. Allowed before or after `begin`.
    pub async fn add_word(&self, word: Word) -> Result<(), ServerError> {
        let mut store = self.acquire_store().await.ok_or(ServerError::WordBusy)?;
        validate_word(&word)?;
        if store.has_overlap(word.reg_type, word.start_addr, word.end_addr()) {
            return Err(ServerError::WordOverlap);
        }
        store.insert(word)
    }

    /// Publish several words; stops at the first failure, leaving the
    /// already inserted ones in place.
    pub async fn add_words(&self, words: Vec<Word>) -> Result<(), ServerError> {
        for word in words {
            self.add_word(word).await?;
        }
        Ok(())
    }

    /// Drop every published word.
    pub async fn clear_all_words(&self) -> Result<(), ServerError> {
        let mut store = self.acquire_store().await.ok_or(ServerError::WordBusy)?;
        store.clear();
        Ok(())
    }

    /// Look up the word starting exactly at `start_addr`.
    pub async fn get_word(&self, reg_type: RegisterType, start_addr: u16) -> Option<Word> {
        let store = self.acquire_store().await?;
        store.find_at(reg_type, start_addr).cloned()
    }

    pub async fn word_count(&self) -> usize {
        match self.acquire_store().await {
            Some(store) => store.len(),
            None => 0,
        }
    }

    /// `true` while a request is being dispatched (or the store is held).
    #[must_use]
    pub fn is_busy(&self) -> bool {
        self.shared.store.try_lock().is_err()
    }

    async fn acquire_store(&self) -> Option<MutexGuard<'_, Box<dyn WordStore>>> {
        acquire(&self.shared.store, self.shared.config.lock_policy).await
    }
}

fn lock_transports(shared: &ServerShared) -> std::sync::MutexGuard<'_, Vec<Arc<dyn Transport>>> {
    match shared.transports.lock() {
        Ok(guard) => guard,
        Err(poisoned) => poisoned.into_inner(),
    }
}

async fn acquire(
    store: &Mutex<Box<dyn WordStore>>,
    policy: LockPolicy,
) -> Option<MutexGuard<'_, Box<dyn WordStore>>> {
    match policy {
        LockPolicy::TryLock => store.try_lock().ok(),
        LockPolicy::WaitForever => Some(store.lock().await),
        LockPolicy::Timeout(limit) => time::timeout(limit, store.lock()).await.ok(),
    }
}

fn register_dispatch(
    shared: &Arc<ServerShared>,
    transport: &Arc<dyn Transport>,
) -> Result<(), ServerError> {
    let cb_shared = Arc::clone(shared);
    let cb_transport = Arc::clone(transport);
    transport
        .register_rx_callback(Arc::new(move |frame, origin| {
            let shared = Arc::clone(&cb_shared);
            let transport = Arc::clone(&cb_transport);
            Box::pin(async move {
                on_request(shared, transport, frame, origin).await;
            })
        }))
        .map_err(|_| ServerError::InitFailed)
}

async fn on_request(
    shared: Arc<ServerShared>,
    transport: Arc<dyn Transport>,
    frame: Arc<Frame>,
    origin: Origin,
) {
    let instance = Arc::as_ptr(&shared) as usize;
    if frame.kind != FrameKind::Request {
        diag::result(instance, &ServerError::InvalidType);
        return;
    }

    let broadcast = frame.is_broadcast();
    if !broadcast
        && frame.slave_id != shared.config.server_id
        && !transport.catches_all_slave_ids()
    {
        // Someone else's request: stay silent on the wire.
        log::debug!("ignoring request for slave {}", frame.slave_id);
        diag::request(instance, frame.meta(), &ServerError::WrongSlaveId);
        return;
    }

    let Some(mut store) = acquire(&shared.store, shared.config.lock_policy).await else {
        diag::request(instance, frame.meta(), &ServerError::BusyOnReceive);
        if !broadcast {
            let busy = Frame::exception_response(
                frame.function,
                frame.slave_id,
                ExceptionCode::ServerDeviceBusy,
            );
            send_response(&shared, &transport, &busy, origin).await;
        }
        return;
    };

    let outcome = process(&mut **store, &frame, shared.config.reject_undefined);

    match outcome {
        Ok(Some(response)) => {
            diag::request(instance, frame.meta(), &diag::Served);
            send_response(&shared, &transport, &response, origin).await;
        }
        Ok(None) => {
            // Broadcast write: applied, never answered.
            diag::request(instance, frame.meta(), &diag::Served);
        }
        Err(code) => {
            diag::request(instance, frame.meta(), &code);
            if !broadcast {
                let response = Frame::exception_response(frame.function, frame.slave_id, code);
                send_response(&shared, &transport, &response, origin).await;
            }
        }
    }
    drop(store);
}

async fn send_response(
    shared: &Arc<ServerShared>,
    transport: &Arc<dyn Transport>,
    response: &Frame,
    origin: Origin,
) {
    if let Err(err) = transport.send_frame(response, origin, None).await {
        log::warn!("response transmission failed: {err}");
        diag::result(Arc::as_ptr(shared) as usize, &ServerError::TxFailed);
    }
}

/// Resolve and execute one request against the store.
///
/// `Ok(None)` means the request was a broadcast write: applied, no reply.
fn process(
    store: &mut dyn WordStore,
    frame: &Frame,
    reject_undefined: bool,
) -> Result<Option<Frame>, ExceptionCode> {
    if frame.function.is_read() {
        handle_read(store, frame, reject_undefined).map(Some)
    } else {
        handle_write(store, frame)
    }
}

#[allow(clippy::cast_possible_truncation)]
fn handle_read(
    store: &mut dyn WordStore,
    frame: &Frame,
    reject_undefined: bool,
) -> Result<Frame, ExceptionCode> {
    let reg_type = register_type(frame.function);
    let start = frame.reg_address;
    let count = usize::from(frame.reg_count);
    let end = u32::from(start) + u32::from(frame.reg_count);
    if end > 0x1_0000 {
        return Err(ExceptionCode::IllegalDataAddress);
    }

    let words: Vec<Word> = store
        .overlapping(reg_type, start, end)
        .into_iter()
        .cloned()
        .collect();

    let mut values = vec![0u16; count];
    let mut covered = 0usize;
    for word in &words {
        let mut scratch = [0u16; MAX_WORD_SIZE];
        let slot = &mut scratch[..usize::from(word.nb_regs)];
        if let Some(code) = word.read(slot) {
            return Err(code);
        }
        let lo = u32::from(start.max(word.start_addr));
        let hi = end.min(word.end_addr());
        for addr in lo..hi {
            values[(addr - u32::from(start)) as usize] =
                slot[(addr - u32::from(word.start_addr)) as usize];
            covered += 1;
        }
    }

    // Words of one type never overlap, so `covered` counts distinct
    // addresses; anything missing is an undefined register.
    if reject_undefined && covered != count {
        return Err(ExceptionCode::IllegalDataAddress);
    }

    let data = if reg_type.is_bit() {
        let bits: Vec<bool> = values.iter().map(|v| *v != 0).collect();
        pack_coils(&bits)
    } else {
        pack_registers(&values)
    };
    Ok(Frame::response(
        frame.function,
        frame.slave_id,
        start,
        frame.reg_count,
        data,
    ))
}

#[allow(clippy::cast_possible_truncation)]
fn handle_write(store: &mut dyn WordStore, frame: &Frame) -> Result<Option<Frame>, ExceptionCode> {
    let reg_type = register_type(frame.function);
    let start = frame.reg_address;
    let end = u32::from(start) + u32::from(frame.reg_count);
    if end > 0x1_0000 {
        return Err(ExceptionCode::IllegalDataAddress);
    }

    let values: Vec<u16> = match frame.function {
        FunctionCode::WriteSingleCoil => match (frame.data.first(), frame.data.get(1)) {
            (Some(0xFF), Some(0x00)) => vec![1],
            (Some(0x00), Some(0x00)) => vec![0],
            _ => return Err(ExceptionCode::IllegalDataValue),
        },
        FunctionCode::WriteSingleRegister => {
            vec![frame.register(0).ok_or(ExceptionCode::IllegalDataValue)?]
        }
        FunctionCode::WriteMultipleCoils => frame
            .coils(usize::from(frame.reg_count))
            .into_iter()
            .map(u16::from)
            .collect(),
        FunctionCode::WriteMultipleRegisters => frame.registers(),
        _ => return Err(ExceptionCode::IllegalFunction),
    };
    if values.len() != usize::from(frame.reg_count) {
        return Err(ExceptionCode::IllegalDataValue);
    }

    // The written range must tile whole words exactly; writing part of a
    // word is an addressing error.
    let mut plan: Vec<Word> = Vec::new();
    let mut cursor = u32::from(start);
    while cursor < end {
        #[allow(clippy::cast_possible_truncation)]
        let Some(word) = store.find_at(reg_type, cursor as u16).cloned() else {
            return Err(ExceptionCode::IllegalDataAddress);
        };
        if word.end_addr() > end {
            return Err(ExceptionCode::IllegalDataAddress);
        }
        cursor = word.end_addr();
        plan.push(word);
    }

    for word in &plan {
        let offset = (u32::from(word.start_addr) - u32::from(start)) as usize;
        let slice = &values[offset..offset + usize::from(word.nb_regs)];
        if let Some(code) = word.write(slice) {
            return Err(code);
        }
    }

    if frame.is_broadcast() {
        return Ok(None);
    }

    let response = if frame.function.is_write_single() {
        Frame::response(frame.function, frame.slave_id, start, 1, frame.data.clone())
    } else {
        Frame::response(
            frame.function,
            frame.slave_id,
            start,
            frame.reg_count,
            FrameData::new(),
        )
    };
    Ok(Some(response))
}

fn validate_word(word: &Word) -> Result<(), ServerError> {
    if word.nb_regs == 0 || usize::from(word.nb_regs) > MAX_WORD_SIZE {
        return Err(ServerError::WordInvalid);
    }
    if word.end_addr() > 0x1_0000 {
        return Err(ServerError::WordInvalid);
    }
    match &word.access {
        WordAccess::Direct(storage) => {
            if storage.len() != usize::from(word.nb_regs) {
                return Err(ServerError::WordDirectPtr);
            }
        }
        WordAccess::Handlers { write, .. } => {
            if word.reg_type.is_read_only() && write.is_some() {
                return Err(ServerError::WordHandler);
            }
        }
    }
    Ok(())
}
