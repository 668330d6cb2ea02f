//! Optional record of which worker ran which chunk, and when. Useful for
//! spotting load imbalance or idle tails in a `map`; enabled through
//! `PoolConfig::record_map_log`.

use std::io::Write;
use std::sync::Mutex;
use std::time::Instant;

use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};




/**
 * One executed chunk. Times are nanoseconds since the pool was created.
 */
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct MapLogEntry {
    pub worker: usize,
    pub start: usize,
    pub len: usize,
    pub tic_ns: u64,
    pub toc_ns: u64,
}




/**
 * Per-worker entry buffers. Each worker only ever locks its own slot, so the
 * mutexes are uncontended while a job runs; the driver reads them between
 * jobs.
 */
pub(crate) struct MapLog {
    epoch: Instant,
    slots: Vec<Mutex<Vec<MapLogEntry>>>,
}

impl MapLog {
    pub(crate) fn new(num_workers: usize) -> Self {
        Self {
            epoch: Instant::now(),
            slots: (0..num_workers).map(|_| Mutex::new(Vec::new())).collect(),
        }
    }

    pub(crate) fn now_ns(&self) -> u64 {
        self.epoch.elapsed().as_nanos() as u64
    }

    pub(crate) fn push(&self, entry: MapLogEntry) {
        if let Ok(mut slot) = self.slots[entry.worker].lock() {
            slot.push(entry)
        }
    }

    /// All entries, ordered by start time.
    pub(crate) fn entries(&self) -> Vec<MapLogEntry> {
        let mut entries: Vec<_> = self
            .slots
            .iter()
            .filter_map(|slot| slot.lock().ok().map(|s| s.clone()))
            .flatten()
            .collect();
        entries.sort_by_key(|e| (e.tic_ns, e.worker));
        entries
    }

    pub(crate) fn clear(&self) {
        for slot in &self.slots {
            if let Ok(mut slot) = slot.lock() {
                slot.clear()
            }
        }
    }

    pub(crate) fn write<W: Write>(&self, writer: W) -> Result<()> {
        ciborium::ser::into_writer(&self.entries(), writer).map_err(|e| Error::Encode(e.to_string()))
    }
}
