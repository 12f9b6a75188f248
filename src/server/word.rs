// SPDX-FileCopyrightText: Copyright (c) 2026 modbus-link contributors
// SPDX-License-Identifier: MIT OR Apache-2.0

//! Words: contiguous register groups published by a server.
//!
//! A word is backed either by direct storage (read and written in place) or
//! by a pair of user handlers; the two are mutually exclusive by
//! construction. Words of the same register type never overlap.

use std::{
    fmt,
    sync::{
        atomic::{AtomicU16, Ordering},
        Arc,
    },
};

use crate::frame::{Address, ExceptionCode, FunctionCode, Quantity};

use super::ServerError;

/// Max number of registers per word.
pub const MAX_WORD_SIZE: usize = 8;

/// The four Modbus register spaces.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum RegisterType {
    Coil,
    DiscreteInput,
    HoldingRegister,
    InputRegister,
}

impl RegisterType {
    /// Discrete inputs and input registers cannot be written.
    #[must_use]
    pub const fn is_read_only(self) -> bool {
        matches!(self, Self::DiscreteInput | Self::InputRegister)
    }

    /// Coils and discrete inputs are single-bit items.
    #[must_use]
    pub const fn is_bit(self) -> bool {
        matches!(self, Self::Coil | Self::DiscreteInput)
    }
}

/// The register space a function code operates on.
pub(crate) const fn register_type(function: FunctionCode) -> RegisterType {
    use FunctionCode::*;
    match function {
        ReadCoils | WriteSingleCoil | WriteMultipleCoils => RegisterType::Coil,
        ReadDiscreteInputs => RegisterType::DiscreteInput,
        ReadHoldingRegisters | WriteSingleRegister | WriteMultipleRegisters => {
            RegisterType::HoldingRegister
        }
        ReadInputRegisters => RegisterType::InputRegister,
    }
}

/// Read handler: fill `out` (sized to the word) with current values.
/// Return `Some(code)` to abort the request with a Modbus exception.
pub type ReadWordHandler =
    Arc<dyn Fn(&Word, &mut [u16]) -> Option<ExceptionCode> + Send + Sync>;

/// Write handler: apply `values` (sized to the word). Return `Some(code)`
/// to abort the request with a Modbus exception.
pub type WriteWordHandler =
    Arc<dyn Fn(&[u16], &Word) -> Option<ExceptionCode> + Send + Sync>;

/// How a word's registers are backed.
#[derive(Clone)]
pub enum WordAccess {
    /// Values live in shared storage, one cell per register. Coils use
    /// 0 / 1 values.
    Direct(Arc<[AtomicU16]>),
    /// Values are produced and consumed by user handlers. A missing write
    /// handler makes the word read-only.
    Handlers {
        read: ReadWordHandler,
        write: Option<WriteWordHandler>,
    },
}

impl fmt::Debug for WordAccess {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Direct(storage) => f.debug_tuple("Direct").field(&storage.len()).finish(),
            Self::Handlers { write, .. } => f
                .debug_struct("Handlers")
                .field("writable", &write.is_some())
                .finish(),
        }
    }
}

/// A contiguous register group published by a server.
#[derive(Debug, Clone)]
pub struct Word {
    pub reg_type: RegisterType,
    pub start_addr: Address,
    pub nb_regs: Quantity,
    pub access: WordAccess,
}

impl Word {
    /// A word backed by direct storage; its size is the storage length.
    #[must_use]
    pub fn direct(reg_type: RegisterType, start_addr: Address, storage: Arc<[AtomicU16]>) -> Self {
        #[allow(clippy::cast_possible_truncation)]
        let nb_regs = storage.len().min(usize::from(u16::MAX)) as Quantity;
        Self {
            reg_type,
            start_addr,
            nb_regs,
            access: WordAccess::Direct(storage),
        }
    }

    /// A word served by user handlers.
    #[must_use]
    pub fn with_handlers(
        reg_type: RegisterType,
        start_addr: Address,
        nb_regs: Quantity,
        read: ReadWordHandler,
        write: Option<WriteWordHandler>,
    ) -> Self {
        Self {
            reg_type,
            start_addr,
            nb_regs,
            access: WordAccess::Handlers { read, write },
        }
    }

    /// One past the last register address, widened to avoid u16 overflow.
    #[must_use]
    pub fn end_addr(&self) -> u32 {
        u32::from(self.start_addr) + u32::from(self.nb_regs)
    }

    #[must_use]
    pub fn contains(&self, addr: Address) -> bool {
        addr >= self.start_addr && u32::from(addr) < self.end_addr()
    }

    /// `true` if `[start, end)` intersects this word.
    #[must_use]
    pub fn intersects(&self, start: Address, end: u32) -> bool {
        u32::from(self.start_addr) < end && self.end_addr() > u32::from(start)
    }

    pub(crate) fn read(&self, out: &mut [u16]) -> Option<ExceptionCode> {
        debug_assert_eq!(out.len(), usize::from(self.nb_regs));
        match &self.access {
            WordAccess::Direct(storage) => {
                for (value, cell) in out.iter_mut().zip(storage.iter()) {
                    *value = cell.load(Ordering::Relaxed);
                }
                None
            }
            WordAccess::Handlers { read, .. } => read(self, out),
        }
    }

    pub(crate) fn write(&self, values: &[u16]) -> Option<ExceptionCode> {
        debug_assert_eq!(values.len(), usize::from(self.nb_regs));
        match &self.access {
            WordAccess::Direct(storage) => {
                for (value, cell) in values.iter().zip(storage.iter()) {
                    cell.store(*value, Ordering::Relaxed);
                }
                None
            }
            WordAccess::Handlers {
                write: Some(write), ..
            } => write(values, self),
            WordAccess::Handlers { write: None, .. } => {
                // Word published without a writer.
                Some(ExceptionCode::IllegalDataAddress)
            }
        }
    }
}

/// Convenience constructor for direct storage of `len` zeroed registers.
#[must_use]
pub fn direct_storage(len: usize) -> Arc<[AtomicU16]> {
    (0..len).map(|_| AtomicU16::new(0)).collect()
}

/// Ordered collection of words indexed by `(type, start address)`.
pub trait WordStore: Send + fmt::Debug {
    /// Capacity bound, `None` when the store grows on demand.
    fn capacity(&self) -> Option<usize>;

    fn len(&self) -> usize;

    fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn clear(&mut self);

    /// Insert keeping the order; the caller has already validated the word
    /// and checked overlap.
    fn insert(&mut self, word: Word) -> Result<(), ServerError>;

    /// The word whose range contains `addr`, if any.
    fn find_containing(&self, reg_type: RegisterType, addr: Address) -> Option<&Word>;

    /// The word starting exactly at `start`, if any.
    fn find_at(&self, reg_type: RegisterType, start: Address) -> Option<&Word>;

    /// All words of `reg_type` intersecting `[start, end)`, in address order.
    fn overlapping(&self, reg_type: RegisterType, start: Address, end: u32) -> Vec<&Word>;

    fn has_overlap(&self, reg_type: RegisterType, start: Address, end: u32) -> bool {
        !self.overlapping(reg_type, start, end).is_empty()
    }
}

fn sort_key(word: &Word) -> (RegisterType, Address) {
    (word.reg_type, word.start_addr)
}

fn sorted_insert(words: &mut Vec<Word>, word: Word) {
    let idx = words.partition_point(|w| sort_key(w) < sort_key(&word));
    words.insert(idx, word);
}

fn find_containing(words: &[Word], reg_type: RegisterType, addr: Address) -> Option<&Word> {
    words
        .iter()
        .find(|w| w.reg_type == reg_type && w.contains(addr))
}

fn find_at(words: &[Word], reg_type: RegisterType, start: Address) -> Option<&Word> {
    words
        .binary_search_by(|w| sort_key(w).cmp(&(reg_type, start)))
        .ok()
        .map(|idx| &words[idx])
}

fn overlapping(words: &[Word], reg_type: RegisterType, start: Address, end: u32) -> Vec<&Word> {
    words
        .iter()
        .filter(|w| w.reg_type == reg_type && w.intersects(start, end))
        .collect()
}

/// A store with a fixed capacity decided up front.
#[derive(Debug)]
pub struct StaticWordStore {
    words: Vec<Word>,
    capacity: usize,
}

impl StaticWordStore {
    #[must_use]
    pub fn new(capacity: usize) -> Self {
        Self {
            words: Vec::with_capacity(capacity),
            capacity,
        }
    }
}

impl WordStore for StaticWordStore {
    fn capacity(&self) -> Option<usize> {
        Some(self.capacity)
    }

    fn len(&self) -> usize {
        self.words.len()
    }

    fn clear(&mut self) {
        self.words.clear();
    }

    fn insert(&mut self, word: Word) -> Result<(), ServerError> {
        if self.words.len() >= self.capacity {
            return Err(ServerError::WordOverflow);
        }
        sorted_insert(&mut self.words, word);
        Ok(())
    }

    fn find_containing(&self, reg_type: RegisterType, addr: Address) -> Option<&Word> {
        find_containing(&self.words, reg_type, addr)
    }

    fn find_at(&self, reg_type: RegisterType, start: Address) -> Option<&Word> {
        find_at(&self.words, reg_type, start)
    }

    fn overlapping(&self, reg_type: RegisterType, start: Address, end: u32) -> Vec<&Word> {
        overlapping(&self.words, reg_type, start, end)
    }
}

/// A store that grows on demand.
#[derive(Debug, Default)]
pub struct DynamicWordStore {
    words: Vec<Word>,
}

impl DynamicWordStore {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }
}

impl WordStore for DynamicWordStore {
    fn capacity(&self) -> Option<usize> {
        None
    }

    fn len(&self) -> usize {
        self.words.len()
    }

    fn clear(&mut self) {
        self.words.clear();
    }

    fn insert(&mut self, word: Word) -> Result<(), ServerError> {
        sorted_insert(&mut self.words, word);
        Ok(())
    }

    fn find_containing(&self, reg_type: RegisterType, addr: Address) -> Option<&Word> {
        find_containing(&self.words, reg_type, addr)
    }

    fn find_at(&self, reg_type: RegisterType, start: Address) -> Option<&Word> {
        find_at(&self.words, reg_type, start)
    }

    fn overlapping(&self, reg_type: RegisterType, start: Address, end: u32) -> Vec<&Word> {
        overlapping(&self.words, reg_type, start, end)
    }
}
