//! Serialized access to a single long-lived connection.
//!
//! Some sources hand out exactly one connection (an embedded database file,
//! a session-bound driver). Unit-scans share it: each holds a unit slot for
//! its lifetime, which bounds how many units are in flight, and takes the
//! connection lock once per statement, so batches from different units
//! interleave but never overlap.

use crate::error::{Result, ScanError};
use std::sync::Arc;
use tokio::sync::{MappedMutexGuard, Mutex, MutexGuard, OwnedSemaphorePermit, Semaphore};

/// Exclusive borrow of the shared connection for one statement.
pub type SharedConnectionGuard<'a, C> = MappedMutexGuard<'a, C>;

/// One connection shared by concurrent unit-scans.
#[derive(Debug)]
pub struct SharedConnection<C> {
    conn: Mutex<Option<C>>,
    unit_slots: Arc<Semaphore>,
    max_units: usize,
}

impl<C: Send> SharedConnection<C> {
    /// Wraps `conn`, allowing at most `max_concurrent_units` units in flight.
    pub fn new(conn: C, max_concurrent_units: usize) -> Self {
        let max_units = max_concurrent_units.max(1);
        Self {
            conn: Mutex::new(Some(conn)),
            unit_slots: Arc::new(Semaphore::new(max_units)),
            max_units,
        }
    }

    /// Waits for a unit slot. Hold the permit for the whole unit-scan.
    ///
    /// # Errors
    /// Returns a connection error once the connection has been closed.
    pub async fn unit_slot(&self) -> Result<OwnedSemaphorePermit> {
        Arc::clone(&self.unit_slots)
            .acquire_owned()
            .await
            .map_err(|_| closed())
    }

    /// Locks the connection for one statement.
    ///
    /// # Errors
    /// Returns a connection error once the connection has been closed.
    pub async fn lock(&self) -> Result<SharedConnectionGuard<'_, C>> {
        let guard = self.conn.lock().await;
        MutexGuard::try_map(guard, Option::as_mut).map_err(|_| closed())
    }

    /// Takes the connection out for closing. Returns `None` if already closed.
    pub async fn take(&self) -> Option<C> {
        self.unit_slots.close();
        self.conn.lock().await.take()
    }

    pub async fn is_open(&self) -> bool {
        self.conn.lock().await.is_some()
    }

    pub fn max_concurrent_units(&self) -> usize {
        self.max_units
    }

    /// Unit slots currently free.
    pub fn available_slots(&self) -> usize {
        self.unit_slots.available_permits()
    }
}

fn closed() -> ScanError {
    ScanError::connection_failed(
        "shared connection",
        std::io::Error::other("connection is closed"),
    )
}
