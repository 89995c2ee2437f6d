//! Stratum - the storage core of a disk-oriented RDBMS
//!
//! This crate implements the on-disk/in-memory boundary of a relational
//! database: fixed-size pages cached in a buffer pool, an LRU-K page
//! replacement policy, and a concurrent B+Tree index built on top of them.
//! Query processing, transactions, and recovery live in other layers and
//! are consumed as collaborators.
//!
//! # Architecture
//!
//! - **Storage Layer** (`storage`): page-granular disk I/O
//!   - `DiskManager`: reads and writes pages in the database file
//!   - `DiskScheduler`: background worker ordering disk requests
//!
//! - **Buffer Pool** (`buffer`): memory management for database pages
//!   - `BufferPoolManager`: caches pages in a fixed arena of frames
//!   - `LruKReplacer`: LRU-K page replacement policy
//!   - `Frame`: per-frame metadata, page bytes, and the page latch
//!   - `PageGuard`/`ReadPageGuard`/`WritePageGuard`: RAII pin + latch holders
//!
//! - **Index** (`index`): ordered access paths
//!   - `BPlusTree`: concurrent B+Tree over buffer pool pages
//!   - `BTreeIterator`: leaf-chain scans
//!
//! - **Recovery** (`recovery`): `LogManager` pass-through collaborator
//!
//! # Example
//!
//! ```rust,no_run
//! use std::sync::Arc;
//! use stratum::buffer::BufferPoolManager;
//! use stratum::index::{BPlusTree, IntegerComparator};
//! use stratum::storage::disk::DiskManager;
//! use stratum::{RecordId, PageId, SlotId};
//!
//! let disk_manager = Arc::new(DiskManager::new("test.db").unwrap());
//! let bpm = Arc::new(BufferPoolManager::new(100, 2, disk_manager, None));
//!
//! // Page 0 backs the tree's header
//! let header_page_id = bpm.new_page().unwrap();
//! bpm.unpin_page(header_page_id, false);
//!
//! let tree = BPlusTree::new("primary", header_page_id, Arc::clone(&bpm),
//!     IntegerComparator, 64, 64).unwrap();
//!
//! tree.insert(42, RecordId::new(PageId::new(7), SlotId::new(0))).unwrap();
//!
//! let mut found = Vec::new();
//! assert!(tree.get_value(42, &mut found).unwrap());
//! ```

pub mod buffer;
pub mod common;
pub mod index;
pub mod recovery;
pub mod storage;

// Re-export commonly used types at the crate root
pub use common::{PageId, RecordId, Result, SlotId, StratumError};
