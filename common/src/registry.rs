//! Handle table for every stream the transport owns.
//!
//! Handles are arena indices paired with a generation counter. Releasing a
//! slot bumps its generation, so a handle kept after `close` can never reach
//! whatever record later reuses the slot.
//!
//! Lock order: the table lock is held only to swap an entry in or out of a
//! slot and is always released before a record's own locks are taken.

use std::{
    fmt,
    net::{SocketAddr, TcpStream},
    sync::{
        atomic::{AtomicUsize, Ordering},
        Arc, Mutex, MutexGuard, PoisonError,
    },
};

use rustls::pki_types::CertificateDer;

use crate::{
    error::{Result, TransportError},
    stream::{os_handle, Stream, StreamKind},
};

/// Opaque identifier for a registered stream
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct StreamHandle {
    index:      u32,
    generation: u32,
}

impl StreamHandle {
    pub fn index(&self) -> u32 {
        self.index
    }

    pub fn generation(&self) -> u32 {
        self.generation
    }
}

impl fmt::Display for StreamHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}.{}", self.index, self.generation)
    }
}

/// Metadata kept for each live stream
#[derive(Debug)]
pub struct StreamRecord {
    pub(crate) kind:              StreamKind,
    /// Duplicate of the socket, used only to unblock I/O from `close`
    pub(crate) shadow:            Option<TcpStream>,
    pub(crate) peer_certificates: Vec<CertificateDer<'static>>,
    pub(crate) peer_addr:         Option<SocketAddr>,
    pub(crate) os_handle:         Option<u64>,
    pub(crate) is_open:           bool,
}

impl StreamRecord {
    pub(crate) fn new(kind: StreamKind) -> Self {
        Self {
            kind,
            shadow: None,
            peer_certificates: Vec::new(),
            peer_addr: None,
            os_handle: None,
            is_open: true,
        }
    }

    pub fn is_network(&self) -> bool {
        self.kind.is_network()
    }

    pub fn is_secure(&self) -> bool {
        self.kind.is_secure()
    }

    /// Clears session state and marks the record closed, handing back the
    /// shadow socket so the caller can close it together with the session
    pub(crate) fn release(&mut self) -> Option<TcpStream> {
        self.is_open = false;
        self.peer_certificates.clear();
        self.shadow.take()
    }
}

/// Snapshot of a record, safe to hold without any lock
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RecordInfo {
    pub handle:           StreamHandle,
    pub kind:             StreamKind,
    pub is_network:       bool,
    pub is_secure:        bool,
    pub is_open:          bool,
    pub has_shadow:       bool,
    pub os_handle:        Option<u64>,
    pub shadow_os_handle: Option<u64>,
    pub peer_addr:        Option<SocketAddr>,
    pub chain_len:        usize,
}

/// A live registry slot: metadata and the stream itself, locked separately
/// so metadata queries never wait on blocked I/O
pub(crate) struct Entry {
    pub(crate) record: Mutex<StreamRecord>,
    pub(crate) stream: Mutex<Option<Stream>>,
}

impl Entry {
    pub(crate) fn record(&self) -> MutexGuard<'_, StreamRecord> {
        self.record.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub(crate) fn stream(&self) -> MutexGuard<'_, Option<Stream>> {
        self.stream.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

struct Slot {
    generation: u32,
    entry:      Option<Arc<Entry>>,
}

#[derive(Default)]
struct Table {
    slots: Vec<Slot>,
    free:  Vec<u32>,
}

pub struct Registry {
    table:    Mutex<Table>,
    live:     AtomicUsize,
    capacity: usize,
}

impl Registry {
    pub fn new(capacity: usize) -> Self {
        Self {
            table: Mutex::new(Table::default()),
            live: AtomicUsize::new(0),
            capacity: capacity.min(u32::MAX as usize),
        }
    }

    fn table(&self) -> MutexGuard<'_, Table> {
        self.table.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Registers `stream`, reusing a freed slot when one is available
    pub(crate) fn insert(&self, record: StreamRecord, stream: Stream) -> Result<StreamHandle> {
        let entry = Arc::new(Entry {
            record: Mutex::new(record),
            stream: Mutex::new(Some(stream)),
        });

        let mut table = self.table();
        let index = match table.free.pop() {
            Some(index) => index,
            None => {
                if table.slots.len() >= self.capacity {
                    return Err(TransportError::OutOfMemory {
                        capacity: self.capacity,
                    });
                }
                table.slots.push(Slot {
                    generation: 0,
                    entry:      None,
                });
                (table.slots.len() - 1) as u32
            }
        };

        let slot = &mut table.slots[index as usize];
        slot.entry = Some(entry);
        let handle = StreamHandle {
            index,
            generation: slot.generation,
        };
        self.live.fetch_add(1, Ordering::SeqCst);
        Ok(handle)
    }

    pub(crate) fn lookup(&self, handle: StreamHandle) -> Result<Arc<Entry>> {
        let table = self.table();
        table
            .slots
            .get(handle.index as usize)
            .filter(|slot| slot.generation == handle.generation)
            .and_then(|slot| slot.entry.clone())
            .ok_or(TransportError::InvalidHandle(handle))
    }

    /// Unlinks the entry for `handle` and recycles its slot. The caller owns
    /// the returned entry and is responsible for tearing it down.
    pub(crate) fn remove(&self, handle: StreamHandle) -> Result<Arc<Entry>> {
        let mut table = self.table();
        let slot = table
            .slots
            .get_mut(handle.index as usize)
            .filter(|slot| slot.generation == handle.generation && slot.entry.is_some())
            .ok_or(TransportError::InvalidHandle(handle))?;

        let entry = slot.entry.take().ok_or(TransportError::InvalidHandle(handle))?;
        slot.generation = slot.generation.wrapping_add(1);
        table.free.push(handle.index);
        self.live.fetch_sub(1, Ordering::SeqCst);
        Ok(entry)
    }

    /// Unlinks every live entry, for process shutdown
    pub(crate) fn drain(&self) -> Vec<(StreamHandle, Arc<Entry>)> {
        let mut table = self.table();
        let mut drained = Vec::new();
        let mut freed = Vec::new();
        for (index, slot) in table.slots.iter_mut().enumerate() {
            if let Some(entry) = slot.entry.take() {
                let handle = StreamHandle {
                    index:      index as u32,
                    generation: slot.generation,
                };
                slot.generation = slot.generation.wrapping_add(1);
                freed.push(index as u32);
                drained.push((handle, entry));
            }
        }
        table.free.extend(freed);
        drained
    }

    pub fn info(&self, handle: StreamHandle) -> Result<RecordInfo> {
        let entry = self.lookup(handle)?;
        let record = entry.record();
        Ok(RecordInfo {
            handle,
            kind: record.kind,
            is_network: record.is_network(),
            is_secure: record.is_secure(),
            is_open: record.is_open,
            has_shadow: record.shadow.is_some(),
            os_handle: record.os_handle,
            shadow_os_handle: record.shadow.as_ref().map(os_handle),
            peer_addr: record.peer_addr,
            chain_len: record.peer_certificates.len(),
        })
    }

    /// Number of records inserted and not yet removed
    pub fn live_count(&self) -> usize {
        self.live.load(Ordering::SeqCst)
    }

    /// Subtracts `n` drained records from the live counter, returning the
    /// count it held beforehand
    pub(crate) fn forget_drained(&self, n: usize) -> usize {
        self.live.fetch_sub(n, Ordering::SeqCst)
    }

    pub fn handles(&self) -> Vec<StreamHandle> {
        self.table()
            .slots
            .iter()
            .enumerate()
            .filter(|(_, slot)| slot.entry.is_some())
            .map(|(index, slot)| StreamHandle {
                index:      index as u32,
                generation: slot.generation,
            })
            .collect()
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }
}

impl fmt::Debug for Registry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Registry")
            .field("live", &self.live_count())
            .field("capacity", &self.capacity)
            .finish()
    }
}
