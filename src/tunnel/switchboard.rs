//! Pool of underlying connections belonging to one session
//!
//! Each connection lives in an enclave holding its write half and a count of
//! bytes currently being written to it. Writes go to the sticky enclave of
//! the sending stream if it is still alive, otherwise to the least loaded
//! one (lowest index on ties). A failed write removes the enclave and the
//! frame is retried elsewhere.

use super::TunnelError;
use crate::transport::UnitWriter;
use parking_lot::RwLock;
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicUsize, Ordering};
use std::sync::Arc;
use tokio::sync::Mutex;
use tracing::{debug, warn};

/// Marker for "no enclave assigned yet"
pub const UNASSIGNED: u32 = u32::MAX;

struct Enclave {
    id: u32,
    writer: Mutex<UnitWriter>,
    send_queue: AtomicUsize,
}

/// Connection pool with sticky, least-loaded dispatch
pub struct Switchboard {
    enclaves: RwLock<Vec<Arc<Enclave>>>,
    next_id: AtomicU32,
    closed: AtomicBool,
}

impl Switchboard {
    pub fn new() -> Self {
        Self {
            enclaves: RwLock::new(Vec::new()),
            next_id: AtomicU32::new(0),
            closed: AtomicBool::new(false),
        }
    }

    /// Install a connection's write half, returning its enclave id
    pub fn add_connection(&self, writer: UnitWriter) -> Result<u32, TunnelError> {
        if self.closed.load(Ordering::Acquire) {
            return Err(TunnelError::BrokenSession("switchboard closed".to_string()));
        }
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        self.enclaves.write().push(Arc::new(Enclave {
            id,
            writer: Mutex::new(writer),
            send_queue: AtomicUsize::new(0),
        }));
        Ok(id)
    }

    pub fn connection_count(&self) -> usize {
        self.enclaves.read().len()
    }

    /// Enclave id at position `n % len`, used to spread new streams
    pub fn enclave_for(&self, n: u32) -> u32 {
        let enclaves = self.enclaves.read();
        if enclaves.is_empty() {
            return UNASSIGNED;
        }
        enclaves[n as usize % enclaves.len()].id
    }

    fn pick(&self, assigned: Option<&AtomicU32>) -> Option<Arc<Enclave>> {
        let enclaves = self.enclaves.read();
        if let Some(assigned) = assigned {
            let id = assigned.load(Ordering::Relaxed);
            if id != UNASSIGNED {
                if let Some(e) = enclaves.iter().find(|e| e.id == id) {
                    return Some(e.clone());
                }
            }
        }

        // min_by_key keeps the first of equal elements
        let chosen = enclaves
            .iter()
            .min_by_key(|e| e.send_queue.load(Ordering::Relaxed))?
            .clone();
        if let Some(assigned) = assigned {
            assigned.store(chosen.id, Ordering::Relaxed);
        }
        Some(chosen)
    }

    /// Write one unit, failing over to other enclaves on error
    pub async fn send(&self, unit: &[u8], assigned: Option<&AtomicU32>) -> Result<(), TunnelError> {
        loop {
            if self.closed.load(Ordering::Acquire) {
                return Err(TunnelError::BrokenSession("switchboard closed".to_string()));
            }
            let Some(enclave) = self.pick(assigned) else {
                return Err(TunnelError::BrokenSession("no live connections".to_string()));
            };

            enclave.send_queue.fetch_add(unit.len(), Ordering::Relaxed);
            let result = enclave.writer.lock().await.write_unit(unit).await;
            enclave.send_queue.fetch_sub(unit.len(), Ordering::Relaxed);

            match result {
                Ok(()) => return Ok(()),
                Err(e) => {
                    warn!(enclave = enclave.id, error = %e, "connection write failed, removing");
                    self.remove(enclave.id);
                    if let Some(assigned) = assigned {
                        assigned.store(UNASSIGNED, Ordering::Relaxed);
                    }
                }
            }
        }
    }

    /// Remove an enclave; returns true when none remain
    pub fn remove(&self, id: u32) -> bool {
        let mut enclaves = self.enclaves.write();
        enclaves.retain(|e| e.id != id);
        debug!(enclave = id, remaining = enclaves.len(), "enclave removed");
        enclaves.is_empty()
    }

    /// Close every connection; the switchboard cannot be reused afterwards
    pub async fn close_all(&self) {
        self.closed.store(true, Ordering::Release);
        let enclaves: Vec<_> = std::mem::take(&mut *self.enclaves.write());
        for enclave in enclaves {
            enclave.writer.lock().await.close().await;
        }
    }
}

impl Default for Switchboard {
    fn default() -> Self {
        Self::new()
    }
}
