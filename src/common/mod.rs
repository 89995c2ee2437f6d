pub mod config;
pub mod error;
pub mod types;

pub use config::{
    DEFAULT_BUFFER_POOL_SIZE, DEFAULT_LRUK_K, INVALID_FRAME_ID, INVALID_PAGE_ID, PAGE_SIZE,
};
pub use error::{Result, StratumError};
pub use types::{FrameId, Lsn, PageId, RecordId, SlotId, Timestamp, INVALID_LSN};
