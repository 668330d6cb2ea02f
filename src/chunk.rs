use core::ops::Range;
use std::sync::atomic::{AtomicUsize, Ordering};

/// With `ChunkSize::Auto`, each worker gets on the order of this many chunks
/// per job.
const AUTO_CHUNKS_PER_THREAD: usize = 7;




/**
 * How a job's index range is cut into chunks. Chunks are never handed out in
 * advance: workers claim them one at a time from a shared cursor, so a worker
 * that finishes early simply claims more.
 */
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ChunkSize {
    /// Fixed chunks sized so that each thread sees a handful of them.
    Auto,

    /// Every chunk has exactly this many elements, except possibly the last.
    Fixed(usize),

    /// Guided self-scheduling: a claim takes half of the remaining elements'
    /// fair share per thread, but never fewer than the given minimum. Chunks
    /// shrink as the job drains, which trims the tail where one straggler
    /// holds a large chunk while the others idle.
    Guided(usize),
}

impl Default for ChunkSize {
    fn default() -> Self {
        ChunkSize::Auto
    }
}

/// A bare minimum chunk size: zero means "pick for me", anything else is a
/// lower bound for guided scheduling.
impl From<usize> for ChunkSize {
    fn from(min_chunk: usize) -> Self {
        match min_chunk {
            0 => ChunkSize::Auto,
            m => ChunkSize::Guided(m),
        }
    }
}

#[derive(Clone, Copy, Debug)]
enum Policy {
    Fixed(usize),
    Guided { min: usize, divisor: usize },
}




/**
 * The claiming cursor of a single job. `claim` advances one shared atomic
 * index; the ranges it returns are contiguous, pairwise disjoint, and
 * together cover exactly `0..len`. The index never moves past `len`, so
 * claims made after the range is exhausted leave it untouched.
 */
#[derive(Debug)]
pub(crate) struct Cursor {
    next: AtomicUsize,
    len: usize,
    policy: Policy,
}

impl Cursor {
    pub(crate) fn new(len: usize, chunk: ChunkSize, num_threads: usize) -> Self {
        let num_threads = num_threads.max(1);
        let policy = match chunk {
            ChunkSize::Auto => Policy::Fixed((len / (num_threads * AUTO_CHUNKS_PER_THREAD)).max(1)),
            ChunkSize::Fixed(n) => Policy::Fixed(n.max(1)),
            ChunkSize::Guided(min) => Policy::Guided {
                min: min.max(1),
                divisor: 2 * num_threads,
            },
        };
        Self {
            next: AtomicUsize::new(0),
            len,
            policy,
        }
    }

    pub(crate) fn len(&self) -> usize {
        self.len
    }

    fn chunk_len(&self, next: usize) -> usize {
        let remaining = self.len - next;
        let size = match self.policy {
            Policy::Fixed(n) => n,
            Policy::Guided { min, divisor } => (remaining / divisor).max(min),
        };
        size.min(remaining)
    }

    /**
     * Claim the next chunk, or return `None` once the range is exhausted.
     * The chunk size is computed from the same value the update lands on, and
     * is clamped to what remains, so the cursor stops exactly at `len`.
     */
    pub(crate) fn claim(&self) -> Option<Range<usize>> {
        self.next
            .fetch_update(Ordering::Relaxed, Ordering::Relaxed, |next| {
                if next >= self.len {
                    None
                } else {
                    Some(next + self.chunk_len(next))
                }
            })
            .ok()
            .map(|start| start..start + self.chunk_len(start))
    }
}
