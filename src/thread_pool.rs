use core::ops::Range;
use core_affinity::{get_core_ids, set_for_current, CoreId};
use crossbeam_channel::{bounded, unbounded, Receiver, Sender};
use log::{debug, error, info, warn};
use std::any::Any;
use std::cell::Cell;
use std::io::Write;
use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::{AtomicU8, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::thread;

use crate::chunk::{ChunkSize, Cursor};
use crate::config::PoolConfig;
use crate::error::{Error, Result};
use crate::map_log::{MapLog, MapLogEntry};

type Body = dyn Fn(Chunk) + Sync;

static NEXT_POOL_ID: AtomicUsize = AtomicUsize::new(0);

thread_local! {
    static WORKER: Cell<Option<(usize, usize)>> = Cell::new(None);
}

/// Return the index of the pool worker running on the current thread, or
/// `None` if the current thread does not belong to any pool.
///
pub fn current_worker() -> Option<usize> {
    WORKER.with(|w| w.get()).map(|(_, index)| index)
}




/**
 * A contiguous run of indexes handed to one invocation of a `map` body.
 */
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Chunk {
    /// First index of the chunk.
    pub start: usize,

    /// Number of indexes in the chunk; never zero.
    pub len: usize,

    /// Index of the worker executing the chunk.
    pub worker: usize,
}

impl Chunk {
    pub fn end(&self) -> usize {
        self.start + self.len
    }

    pub fn range(&self) -> Range<usize> {
        self.start..self.end()
    }
}




/**
 * Lifecycle of a pool. `map` moves an idle pool through `Dispatching` (the
 * job is being handed to the workers) and `Draining` (the caller waits for
 * the last chunk), then back to `Idle`.
 */
#[repr(u8)]
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum PoolState {
    Idle = 0,
    Dispatching = 1,
    Draining = 2,
    ShuttingDown = 3,
}

impl PoolState {
    fn from_u8(value: u8) -> Self {
        match value {
            0 => PoolState::Idle,
            1 => PoolState::Dispatching,
            2 => PoolState::Draining,
            _ => PoolState::ShuttingDown,
        }
    }
}




/**
 * The descriptor of the one job in flight. Workers share it through an `Arc`
 * and touch only the cursor, the completion counter, and (on a panic) the
 * panic slot.
 */
struct Job {
    body: *const Body,
    cursor: Cursor,
    completed: AtomicUsize,
    panic: Mutex<Option<Box<dyn Any + Send>>>,
    done: Sender<()>,
}

// SAFETY: `body` points at a `Sync` closure that the dispatching `map` call
// keeps alive until `completed` reaches the job length. It is dereferenced
// only after a successful claim, and every successful claim is counted toward
// `completed` after the body returns, so no dereference outlives `map`.
unsafe impl Send for Job {}
unsafe impl Sync for Job {}

impl Job {
    fn execute(&self, worker: usize, map_log: Option<&MapLog>) {
        while let Some(range) = self.cursor.claim() {
            let chunk = Chunk {
                start: range.start,
                len: range.len(),
                worker,
            };
            let tic_ns = map_log.map(|log| log.now_ns());

            // SAFETY: see the `Send`/`Sync` impls above; this chunk has not
            // been counted yet, so the closure is still alive.
            let body = unsafe { &*self.body };

            if let Err(payload) = panic::catch_unwind(AssertUnwindSafe(|| body(chunk))) {
                error!("worker {} panicked on chunk {:?}", worker, chunk.range());
                if let Ok(mut slot) = self.panic.lock() {
                    slot.get_or_insert(payload);
                }
            }

            if let (Some(log), Some(tic_ns)) = (map_log, tic_ns) {
                log.push(MapLogEntry {
                    worker,
                    start: chunk.start,
                    len: chunk.len,
                    tic_ns,
                    toc_ns: log.now_ns(),
                });
            }
            self.finish(chunk.len);
        }
    }

    fn finish(&self, len: usize) {
        let completed = self.completed.fetch_add(len, Ordering::AcqRel) + len;

        if completed == self.cursor.len() {
            let _ = self.done.send(());
        }
    }
}




struct Worker {
    handle: Option<thread::JoinHandle<()>>,
    sender: Option<Sender<Arc<Job>>>,
}

impl Worker {
    fn spawn(
        pool_id: usize,
        index: usize,
        config: &PoolConfig,
        core_id: Option<CoreId>,
        map_log: Option<Arc<MapLog>>,
    ) -> Result<Self> {
        let (sender, receiver): (Sender<Arc<Job>>, Receiver<Arc<Job>>) = unbounded();
        let handle = thread::Builder::new()
            .name(format!("{}-{}", config.thread_name, index))
            .spawn(move || {
                if let Some(core_id) = core_id {
                    set_for_current(core_id);
                }
                WORKER.with(|w| w.set(Some((pool_id, index))));
                debug!("worker {} parked", index);

                for job in receiver {
                    job.execute(index, map_log.as_deref())
                }
                debug!("worker {} exiting", index);
            })
            .map_err(Error::Spawn)?;

        Ok(Worker {
            handle: Some(handle),
            sender: Some(sender),
        })
    }

    fn send(&self, job: Arc<Job>) -> bool {
        match &self.sender {
            Some(sender) => sender.send(job).is_ok(),
            None => false,
        }
    }
}

impl Drop for Worker {
    fn drop(&mut self) {
        self.sender.take();

        if let Some(handle) = self.handle.take() {
            if handle.join().is_err() {
                error!("worker thread terminated abnormally");
            }
        }
    }
}




/// A fixed set of worker threads executing one data-parallel job at a time.
/// A job is an index range `0..len` and a body; `map` cuts the range into
/// chunks that workers claim from a shared atomic cursor, runs the body once
/// per chunk, and returns when every index has been processed. The calling
/// thread does not participate: it parks until the last chunk completes.
///
/// `map` is a barrier, not a queue. Calling it while another `map` on the
/// same pool is in flight, or from inside one of the pool's own workers,
/// panics.
///
pub struct ThreadPool {
    workers: Vec<Worker>,
    state: AtomicU8,
    map_log: Option<Arc<MapLog>>,
    id: usize,
}

impl ThreadPool {
    /// Create a pool with the given number of worker threads and otherwise
    /// default options.
    ///
    pub fn new(num_threads: usize) -> Result<Self> {
        Self::with_config(&PoolConfig::with_threads(num_threads))
    }

    /// Create a pool from a full configuration. Workers are spawned parked;
    /// a worker that fails to spawn fails the whole call, and the workers
    /// already spawned are shut down again.
    ///
    pub fn with_config(config: &PoolConfig) -> Result<Self> {
        config.validate()?;

        let id = NEXT_POOL_ID.fetch_add(1, Ordering::Relaxed);
        let map_log = if config.record_map_log {
            Some(Arc::new(MapLog::new(config.num_threads)))
        } else {
            None
        };
        let core_ids = if config.pin_to_cores {
            let core_ids = get_core_ids().unwrap_or_default();
            if core_ids.is_empty() {
                warn!("core affinity requested but no core ids are available");
            }
            core_ids
        } else {
            Vec::new()
        };

        let workers = (0..config.num_threads)
            .map(|index| {
                let core_id = if core_ids.is_empty() {
                    None
                } else {
                    Some(core_ids[index % core_ids.len()])
                };
                Worker::spawn(id, index, config, core_id, map_log.clone())
            })
            .collect::<Result<Vec<_>>>()?;

        info!(
            "thread pool {} started with {} workers{}",
            id,
            workers.len(),
            if core_ids.is_empty() { "" } else { " (pinned)" }
        );

        Ok(ThreadPool {
            workers,
            state: AtomicU8::new(PoolState::Idle as u8),
            map_log,
            id,
        })
    }

    /// Return the number of worker threads in the pool.
    ///
    pub fn num_threads(&self) -> usize {
        self.workers.len()
    }

    pub fn state(&self) -> PoolState {
        PoolState::from_u8(self.state.load(Ordering::Acquire))
    }

    /// Run `body` over the index range `0..len`, one call per claimed chunk,
    /// and block until every index has been processed exactly once. Chunks
    /// run concurrently and in no particular order. With `len == 0` the body
    /// is never called.
    ///
    /// The body may borrow from the caller's stack; whatever context it
    /// needs (an output log, a cancellation flag) is simply captured. If any
    /// invocation panics, the remaining chunks still run and the first panic
    /// is resumed on the calling thread once the job has drained.
    ///
    pub fn map<C, F>(&self, len: usize, chunk: C, body: F)
    where
        C: Into<ChunkSize>,
        F: Fn(Chunk) + Sync,
    {
        self.dispatch(len, chunk.into(), &body)
    }

    /// Like `map`, but hand each chunk the corresponding sub-slice of `data`.
    ///
    pub fn map_slice<T, C, F>(&self, data: &[T], chunk: C, body: F)
    where
        T: Sync,
        C: Into<ChunkSize>,
        F: Fn(&[T], Chunk) + Sync,
    {
        self.map(data.len(), chunk, |c: Chunk| body(&data[c.range()], c))
    }

    /// Like `map_slice`, with exclusive access to each chunk's sub-slice.
    ///
    pub fn map_slice_mut<T, C, F>(&self, data: &mut [T], chunk: C, body: F)
    where
        T: Send,
        C: Into<ChunkSize>,
        F: Fn(&mut [T], Chunk) + Sync,
    {
        let len = data.len();
        let base = SlicePtr(data.as_mut_ptr());

        self.map(len, chunk, move |c: Chunk| {
            // SAFETY: claimed chunks are pairwise disjoint and lie inside
            // `0..len`, and `data` stays mutably borrowed until `map` returns.
            let part = unsafe { std::slice::from_raw_parts_mut(base.get().add(c.start), c.len) };
            body(part, c)
        })
    }

    /// Entries recorded by the workers since the pool was created or the log
    /// was last reset, ordered by start time. Empty unless the pool was
    /// configured with `record_map_log`.
    ///
    pub fn map_log(&self) -> Vec<MapLogEntry> {
        self.map_log.as_ref().map(|log| log.entries()).unwrap_or_default()
    }

    pub fn reset_map_log(&self) {
        if let Some(log) = &self.map_log {
            log.clear()
        }
    }

    /// Serialize the map log as CBOR.
    ///
    pub fn write_map_log<W: Write>(&self, writer: W) -> Result<()> {
        match &self.map_log {
            Some(log) => log.write(writer),
            None => ciborium::ser::into_writer(&Vec::<MapLogEntry>::new(), writer)
                .map_err(|e| Error::Encode(e.to_string())),
        }
    }

    /// Stop and join all workers. Equivalent to dropping the pool.
    ///
    pub fn clean(self) {
        drop(self)
    }

    fn dispatch(&self, len: usize, chunk: ChunkSize, body: &(dyn Fn(Chunk) + Sync + '_)) {
        if len == 0 {
            return;
        }
        assert!(
            WORKER.with(|w| w.get()).map_or(true, |(pool, _)| pool != self.id),
            "ThreadPool::map called from inside one of the pool's own workers"
        );
        if self
            .state
            .compare_exchange(
                PoolState::Idle as u8,
                PoolState::Dispatching as u8,
                Ordering::AcqRel,
                Ordering::Acquire,
            )
            .is_err()
        {
            panic!("ThreadPool::map called while another map is in flight");
        }

        let body: *const (dyn Fn(Chunk) + Sync + '_) = body;
        let (done, finished) = bounded(1);
        let job = Arc::new(Job {
            // SAFETY: only the lifetime is erased; see `Job`.
            body: unsafe { std::mem::transmute::<*const (dyn Fn(Chunk) + Sync + '_), *const Body>(body) },
            cursor: Cursor::new(len, chunk, self.num_threads()),
            completed: AtomicUsize::new(0),
            panic: Mutex::new(None),
            done,
        });

        debug!("pool {}: dispatching {} elements ({:?})", self.id, len, chunk);
        let reached = self.workers.iter().filter(|w| w.send(job.clone())).count();
        assert!(reached > 0, "ThreadPool::map found no live workers");
        self.state.store(PoolState::Draining as u8, Ordering::Release);

        finished.recv().expect("job holds a completion sender");
        self.state.store(PoolState::Idle as u8, Ordering::Release);

        let payload = job.panic.lock().ok().and_then(|mut slot| slot.take());

        if let Some(payload) = payload {
            panic::resume_unwind(payload);
        }
    }
}

impl Drop for ThreadPool {
    fn drop(&mut self) {
        self.state.store(PoolState::ShuttingDown as u8, Ordering::Release);
        debug!("pool {}: shutting down {} workers", self.id, self.workers.len());
    }
}




struct SlicePtr<T>(*mut T);

impl<T> SlicePtr<T> {
    fn get(&self) -> *mut T {
        self.0
    }
}

// SAFETY: used only by `map_slice_mut`, which hands out disjoint ranges.
unsafe impl<T: Send> Send for SlicePtr<T> {}
unsafe impl<T: Send> Sync for SlicePtr<T> {}
