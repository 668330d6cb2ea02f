//! Mapdump is a small substrate for data-parallel kernels that need to record
//! their output cheaply. It has two pieces: a fixed-size `ThreadPool` whose
//! `map` runs a body over an index range in dynamically claimed chunks, and
//! an `AppendLog`, a memory-mapped file that any number of those bodies can
//! append to at once through a lock-free byte reservation. The driver owns
//! both, grows the log between jobs, and closes it when done; the resulting
//! file is exactly the concatenation of every reserved range, in offset
//! order.

pub mod append_log;
pub mod chunk;
pub mod config;
pub mod error;
pub mod map_log;
pub mod thread_pool;

pub use append_log::AppendLog;
pub use chunk::ChunkSize;
pub use config::{LogConfig, PoolConfig};
pub use error::{Error, Result};
pub use thread_pool::{Chunk, PoolState, ThreadPool};
