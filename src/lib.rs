//! # blockheap
//!
//! A `malloc`/`free`/`realloc` replacement built over a single memory region
//! that is reserved once from the operating system and never grows.
//!
//! ```text
//!   +--------------------------------------------------------------+
//!   |                        Region (1 MiB)                        |
//!   |  +--------+------+--------+------+--------+----------------+ |
//!   |  | header | used | header | free | header |      free      | |
//!   |  +--------+------+--------+------+--------+----------------+ |
//!   +--------------------------------------------------------------+
//!                               ^                    ^
//!                               |                    |
//!                        +------+--------------------+------+
//!                        |   Free index (min-heap by size)  |
//!                        +----------------------------------+
//! ```
//!
//! The region is partitioned into blocks kept in an address-ordered ledger.
//! Free blocks are tracked by a bounded, size-ordered index. Allocation is
//! first-fit over that index and splits the chosen block when the leftover
//! is big enough; releasing a block merges it with its free neighbours, so
//! two free blocks are never adjacent.
//!
//! ```rust,no_run
//! use blockheap::Heap;
//!
//! let mut heap = Heap::new();
//!
//! let ptr = heap.allocate(15).unwrap().unwrap();
//! unsafe { ptr.as_ptr().copy_from(b"test my string\0".as_ptr(), 15) };
//!
//! let ptr = heap.resize(Some(ptr), 64).unwrap();
//! heap.release(ptr).unwrap();
//! ```
//!
//! A [`Heap`] is single threaded and owns all of its state, so independent
//! heaps can live side by side. The raw [`Heap::malloc`], [`Heap::free`] and
//! [`Heap::realloc`] entry points follow the C contract and return null on
//! every failure; the typed ones report a [`HeapError`].
//!
//! Diagnostics go through the [`log`] facade. The crate never installs a
//! logger.

mod block;
pub mod config;
mod error;
mod free_index;
mod heap;
pub mod kernel;
mod list;
mod region;
pub mod utils;

pub use block::{BLOCK_HEADER_SIZE, BlockInfo};
pub use config::{BootstrapPolicy, HeapConfig};
pub use error::{HeapError, Result};
pub use heap::{Heap, HeapStats};
pub use kernel::{MemoryProvider, SystemMemory};
