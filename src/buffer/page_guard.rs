use std::ops::{Deref, DerefMut};
use std::sync::Arc;

use parking_lot::{RwLockReadGuard, RwLockWriteGuard};

use crate::common::{PageId, PAGE_SIZE};

use super::buffer_pool_manager::PoolState;
use super::Frame;

/// Guard over a pinned page without a page latch. Readers take the latch
/// transiently through [`PageGuard::with_data`]; mutation requires
/// upgrading to a write guard. Dropping the guard unpins the page.
pub struct PageGuard {
    page_id: PageId,
    frame: Arc<Frame>,
    /// Back-reference used to unpin on drop; None once released
    pool: Option<Arc<PoolState>>,
}

impl PageGuard {
    /// Wraps an already-pinned frame. The pin is owned by the guard from
    /// here on.
    pub(crate) fn new(page_id: PageId, frame: Arc<Frame>, pool: Arc<PoolState>) -> Self {
        Self {
            page_id,
            frame,
            pool: Some(pool),
        }
    }

    pub fn page_id(&self) -> PageId {
        self.page_id
    }

    /// Runs the closure over the page bytes under a transient shared latch.
    pub fn with_data<R>(&self, f: impl FnOnce(&[u8]) -> R) -> R {
        let guard = self.frame.data.read();
        f(&guard[..])
    }

    /// Trades the pin for a read guard, taking the shared page latch.
    pub fn upgrade_read(mut self) -> ReadPageGuard {
        let pool = self.pool.take().expect("guard already released");
        let frame = Arc::clone(&self.frame);
        ReadPageGuard::latch(self.page_id, frame, pool)
    }

    /// Trades the pin for a write guard, taking the exclusive page latch.
    pub fn upgrade_write(mut self) -> WritePageGuard {
        let pool = self.pool.take().expect("guard already released");
        let frame = Arc::clone(&self.frame);
        WritePageGuard::latch(self.page_id, frame, pool)
    }

    /// Drops this guard, releasing the pin.
    pub fn drop_guard(self) {
        drop(self);
    }
}

impl Drop for PageGuard {
    fn drop(&mut self) {
        if let Some(pool) = self.pool.take() {
            pool.release_pin(&self.frame);
        }
    }
}

/// RAII guard for shared access to a page: a pin plus the page latch in
/// read mode. The latch is released before the page is unpinned.
pub struct ReadPageGuard {
    page_id: PageId,
    frame: Arc<Frame>,
    pool: Option<Arc<PoolState>>,
    /// Shared latch on the page data; dropped first
    data_guard: Option<RwLockReadGuard<'static, Box<[u8; PAGE_SIZE]>>>,
}

impl ReadPageGuard {
    pub(crate) fn latch(page_id: PageId, frame: Arc<Frame>, pool: Arc<PoolState>) -> Self {
        let data_guard = frame.data.read();
        // The frame is kept alive by the Arc held alongside, so extending
        // the guard lifetime is sound as long as the guard drops first.
        let data_guard: RwLockReadGuard<'static, Box<[u8; PAGE_SIZE]>> =
            unsafe { std::mem::transmute(data_guard) };

        Self {
            page_id,
            frame,
            pool: Some(pool),
            data_guard: Some(data_guard),
        }
    }

    pub fn page_id(&self) -> PageId {
        self.page_id
    }

    pub fn data(&self) -> &[u8] {
        &self.data_guard.as_ref().expect("guard already released")[..]
    }

    /// Drops this guard, releasing the latch and the pin.
    pub fn drop_guard(self) {
        drop(self);
    }
}

impl Deref for ReadPageGuard {
    type Target = [u8];

    fn deref(&self) -> &Self::Target {
        self.data()
    }
}

impl Drop for ReadPageGuard {
    fn drop(&mut self) {
        // Latch first, pin second
        self.data_guard.take();
        if let Some(pool) = self.pool.take() {
            pool.release_pin(&self.frame);
        }
    }
}

/// RAII guard for exclusive access to a page: a pin plus the page latch in
/// write mode. The frame is marked dirty on first mutable access.
pub struct WritePageGuard {
    page_id: PageId,
    frame: Arc<Frame>,
    pool: Option<Arc<PoolState>>,
    /// Exclusive latch on the page data; dropped first
    data_guard: Option<RwLockWriteGuard<'static, Box<[u8; PAGE_SIZE]>>>,
}

impl WritePageGuard {
    pub(crate) fn latch(page_id: PageId, frame: Arc<Frame>, pool: Arc<PoolState>) -> Self {
        let data_guard = frame.data.write();
        // Same lifetime argument as the read guard
        let data_guard: RwLockWriteGuard<'static, Box<[u8; PAGE_SIZE]>> =
            unsafe { std::mem::transmute(data_guard) };

        Self {
            page_id,
            frame,
            pool: Some(pool),
            data_guard: Some(data_guard),
        }
    }

    pub fn page_id(&self) -> PageId {
        self.page_id
    }

    pub fn data(&self) -> &[u8] {
        &self.data_guard.as_ref().expect("guard already released")[..]
    }

    /// Returns the page bytes mutably, marking the frame dirty so a
    /// concurrent flush cannot lose the mutation.
    pub fn data_mut(&mut self) -> &mut [u8] {
        self.frame.set_dirty(true);
        &mut self.data_guard.as_mut().expect("guard already released")[..]
    }

    /// Drops this guard, releasing the latch and the pin.
    pub fn drop_guard(self) {
        drop(self);
    }
}

impl Deref for WritePageGuard {
    type Target = [u8];

    fn deref(&self) -> &Self::Target {
        self.data()
    }
}

impl DerefMut for WritePageGuard {
    fn deref_mut(&mut self) -> &mut Self::Target {
        self.data_mut()
    }
}

impl Drop for WritePageGuard {
    fn drop(&mut self) {
        // Latch first, pin second
        self.data_guard.take();
        if let Some(pool) = self.pool.take() {
            pool.release_pin(&self.frame);
        }
    }
}
