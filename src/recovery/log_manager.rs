use std::sync::atomic::{AtomicU64, Ordering};

use crate::common::Lsn;

/// LogManager allocates log sequence numbers. The buffer pool accepts one
/// as a collaborator and passes it through; write-ahead logging itself is
/// not implemented.
pub struct LogManager {
    next_lsn: AtomicU64,
}

impl LogManager {
    pub fn new() -> Self {
        Self {
            next_lsn: AtomicU64::new(1),
        }
    }

    /// Hands out the next log sequence number.
    pub fn next_lsn(&self) -> Lsn {
        self.next_lsn.fetch_add(1, Ordering::Relaxed)
    }
}

impl Default for LogManager {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_lsns_are_monotonic() {
        let lm = LogManager::new();
        let a = lm.next_lsn();
        let b = lm.next_lsn();
        assert!(b > a);
    }
}
