use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;
use tracing::{debug, trace};

use crate::common::{FrameId, PageId, Result, StratumError};
use crate::recovery::LogManager;
use crate::storage::disk::{DiskManager, DiskScheduler};

use super::{Frame, LruKReplacer, PageGuard, ReadPageGuard, WritePageGuard};

/// State shared between the manager and outstanding page guards.
pub(crate) struct PoolState {
    /// The frame arena; frame ids index into this vector
    frames: Vec<Arc<Frame>>,
    /// Page table and free list, guarded by the pool latch
    inner: Mutex<PoolInner>,
    /// LRU-K replacer for eviction decisions
    replacer: LruKReplacer,
}

struct PoolInner {
    /// Maps resident page IDs to their frames
    page_table: HashMap<PageId, FrameId>,
    /// Frames not bound to any page
    free_list: VecDeque<FrameId>,
}

impl PoolState {
    /// Releases one pin, marking the frame evictable when the last pin
    /// goes away. Runs under the pool latch so pin state and the
    /// replacer's evictable flag cannot diverge.
    pub(crate) fn release_pin(&self, frame: &Frame) {
        let _inner = self.inner.lock();
        if let Some(0) = frame.unpin() {
            self.replacer.set_evictable(frame.frame_id(), true);
        }
    }
}

/// What to put into a frame that was just bound on a miss.
enum MissFill {
    /// Fresh page: zero the buffer
    Zero,
    /// Existing page: read its bytes from disk
    ReadDisk,
}

/// BufferPoolManager serves database pages out of a fixed arena of frames,
/// fetching from and writing back to disk through the disk scheduler and
/// choosing eviction victims with the LRU-K replacer. It also owns the
/// page-id allocator: ids increase monotonically and deleted ids are never
/// reissued.
pub struct BufferPoolManager {
    /// Number of frames in the buffer pool
    pool_size: usize,
    /// Next page id to hand out
    next_page_id: AtomicU32,
    /// Shared state, also referenced by page guards
    state: Arc<PoolState>,
    /// Disk scheduler for page I/O
    disk_scheduler: DiskScheduler,
    /// Pass-through collaborator; the pool never consults it
    #[allow(dead_code)]
    log_manager: Option<Arc<LogManager>>,
}

impl BufferPoolManager {
    /// Creates a new BufferPoolManager with the given pool size, k value
    /// for LRU-K, disk manager, and (optional) log manager.
    pub fn new(
        pool_size: usize,
        k: usize,
        disk_manager: Arc<DiskManager>,
        log_manager: Option<Arc<LogManager>>,
    ) -> Self {
        let mut frames = Vec::with_capacity(pool_size);
        let mut free_list = VecDeque::with_capacity(pool_size);

        for i in 0..pool_size {
            let frame_id = FrameId::new(i as u32);
            frames.push(Arc::new(Frame::new(frame_id)));
            free_list.push_back(frame_id);
        }

        let state = Arc::new(PoolState {
            frames,
            inner: Mutex::new(PoolInner {
                page_table: HashMap::new(),
                free_list,
            }),
            replacer: LruKReplacer::new(k, pool_size),
        });

        Self {
            pool_size,
            next_page_id: AtomicU32::new(0),
            state,
            disk_scheduler: DiskScheduler::new(disk_manager),
            log_manager,
        }
    }

    /// Allocates a fresh page id and binds it to a zeroed, pinned frame.
    /// The caller owns one pin and must release it with `unpin_page` (or
    /// use `new_page_guarded`). Fails with `BufferPoolFull` when no frame
    /// is free and none is evictable.
    pub fn new_page(&self) -> Result<PageId> {
        let page_id = PageId::new(self.next_page_id.fetch_add(1, Ordering::SeqCst));
        self.bind_frame(page_id, MissFill::Zero)?;
        trace!(page_id = page_id.as_u32(), "allocated new page");
        Ok(page_id)
    }

    /// Allocates a fresh page and returns it behind a basic guard.
    pub fn new_page_guarded(&self) -> Result<PageGuard> {
        let page_id = PageId::new(self.next_page_id.fetch_add(1, Ordering::SeqCst));
        let frame_id = self.bind_frame(page_id, MissFill::Zero)?;
        let frame = Arc::clone(&self.state.frames[frame_id.as_usize()]);
        Ok(PageGuard::new(page_id, frame, Arc::clone(&self.state)))
    }

    /// Fetches a page behind a basic (pin-only) guard.
    pub fn fetch_page_basic(&self, page_id: PageId) -> Result<PageGuard> {
        let frame_id = self.fetch_frame(page_id)?;
        let frame = Arc::clone(&self.state.frames[frame_id.as_usize()]);
        Ok(PageGuard::new(page_id, frame, Arc::clone(&self.state)))
    }

    /// Fetches a page behind a read guard (pin + shared page latch).
    pub fn fetch_page_read(&self, page_id: PageId) -> Result<ReadPageGuard> {
        let frame_id = self.fetch_frame(page_id)?;
        let frame = Arc::clone(&self.state.frames[frame_id.as_usize()]);
        Ok(ReadPageGuard::latch(page_id, frame, Arc::clone(&self.state)))
    }

    /// Fetches a page behind a write guard (pin + exclusive page latch).
    pub fn fetch_page_write(&self, page_id: PageId) -> Result<WritePageGuard> {
        let frame_id = self.fetch_frame(page_id)?;
        let frame = Arc::clone(&self.state.frames[frame_id.as_usize()]);
        Ok(WritePageGuard::latch(page_id, frame, Arc::clone(&self.state)))
    }

    /// Releases one pin on a resident page, optionally marking it dirty.
    /// Returns false when the page is not resident or not pinned.
    pub fn unpin_page(&self, page_id: PageId, is_dirty: bool) -> bool {
        let inner = self.state.inner.lock();
        let Some(&frame_id) = inner.page_table.get(&page_id) else {
            return false;
        };
        let frame = &self.state.frames[frame_id.as_usize()];

        if is_dirty {
            frame.set_dirty(true);
        }
        match frame.unpin() {
            None => false,
            Some(0) => {
                self.state.replacer.set_evictable(frame_id, true);
                true
            }
            Some(_) => true,
        }
    }

    /// Writes a resident page's bytes to disk and clears its dirty flag.
    /// Pin state is unchanged. Returns false when the page is not resident.
    pub fn flush_page(&self, page_id: PageId) -> Result<bool> {
        let inner = self.state.inner.lock();
        let Some(&frame_id) = inner.page_table.get(&page_id) else {
            return Ok(false);
        };
        let frame = &self.state.frames[frame_id.as_usize()];

        // Clear before copying: a concurrent writer re-dirties and gets a
        // later flush instead of losing its update
        frame.set_dirty(false);
        let data = frame.copy_data();
        if let Err(e) = self.disk_scheduler.write_sync(page_id, &data[..]) {
            frame.set_dirty(true);
            return Err(e);
        }
        Ok(true)
    }

    /// Flushes every dirty resident page.
    pub fn flush_all_pages(&self) -> Result<()> {
        let inner = self.state.inner.lock();
        for (&page_id, &frame_id) in inner.page_table.iter() {
            let frame = &self.state.frames[frame_id.as_usize()];
            if frame.is_dirty() {
                frame.set_dirty(false);
                let data = frame.copy_data();
                if let Err(e) = self.disk_scheduler.write_sync(page_id, &data[..]) {
                    frame.set_dirty(true);
                    return Err(e);
                }
            }
        }
        Ok(())
    }

    /// Drops a page from the pool. Non-resident pages succeed trivially;
    /// pinned pages fail with `PageStillPinned`. Dirty pages are written
    /// back first. The page id is not reused.
    pub fn delete_page(&self, page_id: PageId) -> Result<bool> {
        let mut inner = self.state.inner.lock();
        let Some(&frame_id) = inner.page_table.get(&page_id) else {
            return Ok(true);
        };
        let frame = &self.state.frames[frame_id.as_usize()];

        if frame.pin_count() > 0 {
            return Err(StratumError::PageStillPinned(page_id));
        }

        if frame.is_dirty() {
            let data = frame.copy_data();
            self.disk_scheduler.write_sync(page_id, &data[..])?;
        }

        inner.page_table.remove(&page_id);
        self.state.replacer.remove(frame_id)?;
        frame.reset();
        inner.free_list.push_back(frame_id);
        debug!(page_id = page_id.as_u32(), "deleted page");
        Ok(true)
    }

    /// Returns the pin count for a resident page.
    pub fn get_pin_count(&self, page_id: PageId) -> Option<u32> {
        let inner = self.state.inner.lock();
        inner
            .page_table
            .get(&page_id)
            .map(|&frame_id| self.state.frames[frame_id.as_usize()].pin_count())
    }

    /// Returns the pool size.
    pub fn pool_size(&self) -> usize {
        self.pool_size
    }

    /// Returns the number of free frames.
    pub fn free_frame_count(&self) -> usize {
        self.state.inner.lock().free_list.len()
    }

    /// Pins the frame holding `page_id`, reading it from disk on a miss.
    fn fetch_frame(&self, page_id: PageId) -> Result<FrameId> {
        if page_id == crate::common::INVALID_PAGE_ID {
            return Err(StratumError::InvalidPageId(page_id));
        }
        self.bind_frame(page_id, MissFill::ReadDisk)
    }

    /// Hit: pin the resident frame. Miss: claim a frame (free list first,
    /// then eviction), publish the mapping and pin while still under the
    /// pool latch, then fill the buffer outside the latch while holding
    /// the frame's exclusive page latch. Concurrent fetchers of the same
    /// page block on the page latch until the fill completes.
    fn bind_frame(&self, page_id: PageId, fill: MissFill) -> Result<FrameId> {
        let state = &self.state;

        let (frame_id, writeback, mut data_guard) = {
            let mut inner = state.inner.lock();

            if let Some(&frame_id) = inner.page_table.get(&page_id) {
                let frame = &state.frames[frame_id.as_usize()];
                frame.pin();
                state.replacer.record_access(frame_id)?;
                state.replacer.set_evictable(frame_id, false);
                return Ok(frame_id);
            }

            let (frame_id, writeback) = if let Some(frame_id) = inner.free_list.pop_front() {
                (frame_id, None)
            } else if let Some(frame_id) = state.replacer.evict() {
                let frame = &state.frames[frame_id.as_usize()];
                let old_page_id = frame.page_id();
                inner.page_table.remove(&old_page_id);
                let writeback = frame
                    .is_dirty()
                    .then(|| (old_page_id, frame.copy_data()));
                debug!(
                    victim = old_page_id.as_u32(),
                    frame = frame_id.as_u32(),
                    dirty = writeback.is_some(),
                    "evicted page"
                );
                (frame_id, writeback)
            } else {
                return Err(StratumError::BufferPoolFull);
            };

            let frame = &state.frames[frame_id.as_usize()];
            inner.page_table.insert(page_id, frame_id);
            frame.set_page_id(page_id);
            frame.set_dirty(false);
            frame.pin();
            state.replacer.record_access(frame_id)?;
            state.replacer.set_evictable(frame_id, false);

            // The frame has no pins besides ours, so this cannot block
            let data_guard = frame.data.write();
            (frame_id, writeback, data_guard)
        };

        if let Some((old_page_id, old_data)) = writeback {
            if let Err(e) = self.disk_scheduler.write_sync(old_page_id, &old_data[..]) {
                drop(data_guard);
                self.restore_victim(page_id, frame_id, old_page_id);
                return Err(e);
            }
        }

        match fill {
            MissFill::Zero => data_guard.fill(0),
            MissFill::ReadDisk => match self.disk_scheduler.read_sync(page_id) {
                Ok(bytes) => data_guard.copy_from_slice(&bytes[..]),
                Err(e) => {
                    data_guard.fill(0);
                    drop(data_guard);
                    self.discard_binding(page_id, frame_id);
                    return Err(e);
                }
            },
        }

        Ok(frame_id)
    }

    /// Undoes a failed miss: unbinds the page and returns the frame to
    /// the free list, leaving it neither dirty nor resident.
    fn discard_binding(&self, page_id: PageId, frame_id: FrameId) {
        let mut inner = self.state.inner.lock();
        let frame = &self.state.frames[frame_id.as_usize()];
        inner.page_table.remove(&page_id);
        frame.set_page_id(crate::common::INVALID_PAGE_ID);
        frame.set_dirty(false);
        frame.unpin();
        self.state.replacer.set_evictable(frame_id, true);
        let _ = self.state.replacer.remove(frame_id);
        inner.free_list.push_back(frame_id);
    }

    /// Undoes an eviction whose write-back failed: the victim page gets
    /// its frame (and its dirty bytes) back.
    fn restore_victim(&self, page_id: PageId, frame_id: FrameId, old_page_id: PageId) {
        let mut inner = self.state.inner.lock();
        let frame = &self.state.frames[frame_id.as_usize()];
        inner.page_table.remove(&page_id);
        inner.page_table.insert(old_page_id, frame_id);
        frame.set_page_id(old_page_id);
        frame.set_dirty(true);
        frame.unpin();
        let _ = self.state.replacer.record_access(frame_id);
        self.state.replacer.set_evictable(frame_id, true);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::NamedTempFile;

    fn create_bpm(pool_size: usize) -> (BufferPoolManager, NamedTempFile) {
        let temp_file = NamedTempFile::new().unwrap();
        let dm = Arc::new(DiskManager::new(temp_file.path()).unwrap());
        let bpm = BufferPoolManager::new(pool_size, 2, dm, None);
        (bpm, temp_file)
    }

    #[test]
    fn test_buffer_pool_manager_new() {
        let (bpm, _temp) = create_bpm(10);
        assert_eq!(bpm.pool_size(), 10);
        assert_eq!(bpm.free_frame_count(), 10);
    }

    #[test]
    fn test_buffer_pool_manager_new_page_is_pinned() {
        let (bpm, _temp) = create_bpm(10);

        let page_id = bpm.new_page().unwrap();
        assert_eq!(page_id, PageId::new(0));
        assert_eq!(bpm.get_pin_count(page_id), Some(1));
        assert_eq!(bpm.free_frame_count(), 9);

        assert!(bpm.unpin_page(page_id, false));
        assert_eq!(bpm.get_pin_count(page_id), Some(0));
    }

    #[test]
    fn test_buffer_pool_manager_read_write() {
        let (bpm, _temp) = create_bpm(10);

        let page_id = bpm.new_page().unwrap();
        bpm.unpin_page(page_id, false);

        {
            let mut guard = bpm.fetch_page_write(page_id).unwrap();
            guard.data_mut()[0] = 42;
            guard.data_mut()[100] = 255;
        }
        assert_eq!(bpm.get_pin_count(page_id), Some(0));

        {
            let guard = bpm.fetch_page_read(page_id).unwrap();
            assert_eq!(guard.data()[0], 42);
            assert_eq!(guard.data()[100], 255);
        }
    }

    #[test]
    fn test_buffer_pool_manager_unpin_contract() {
        let (bpm, _temp) = create_bpm(10);

        let page_id = bpm.new_page().unwrap();
        assert!(bpm.unpin_page(page_id, false));
        // Already at zero
        assert!(!bpm.unpin_page(page_id, false));
        // Not resident at all
        assert!(!bpm.unpin_page(PageId::new(99), false));
    }

    #[test]
    fn test_buffer_pool_manager_eviction_round_trip() {
        let (bpm, _temp) = create_bpm(3);

        let page_ids: Vec<_> = (0..3)
            .map(|i| {
                let pid = bpm.new_page().unwrap();
                {
                    let mut guard = bpm.fetch_page_write(pid).unwrap();
                    guard.data_mut()[0] = i as u8;
                }
                bpm.unpin_page(pid, false);
                pid
            })
            .collect();

        assert_eq!(bpm.free_frame_count(), 0);

        // Forces an eviction; the victim's bytes must survive on disk
        let new_pid = bpm.new_page().unwrap();
        assert_eq!(new_pid, PageId::new(3));
        bpm.unpin_page(new_pid, false);

        for (i, &pid) in page_ids.iter().enumerate() {
            let guard = bpm.fetch_page_read(pid).unwrap();
            assert_eq!(guard.data()[0], i as u8);
        }
    }

    #[test]
    fn test_buffer_pool_manager_pool_full() {
        let (bpm, _temp) = create_bpm(2);

        let _p1 = bpm.new_page().unwrap();
        let _p2 = bpm.new_page().unwrap();

        // Both frames still pinned by new_page
        assert!(matches!(bpm.new_page(), Err(StratumError::BufferPoolFull)));
    }

    #[test]
    fn test_buffer_pool_manager_delete_page() {
        let (bpm, _temp) = create_bpm(10);

        let pid = bpm.new_page().unwrap();

        // Cannot delete while pinned
        assert!(matches!(
            bpm.delete_page(pid),
            Err(StratumError::PageStillPinned(_))
        ));

        bpm.unpin_page(pid, false);
        assert!(bpm.delete_page(pid).unwrap());
        assert_eq!(bpm.get_pin_count(pid), None);
        assert_eq!(bpm.free_frame_count(), 10);

        // Deleting a non-resident page succeeds
        assert!(bpm.delete_page(PageId::new(42)).unwrap());
    }

    #[test]
    fn test_buffer_pool_manager_flush() {
        let temp_file = NamedTempFile::new().unwrap();
        let path = temp_file.path().to_path_buf();

        let page_id;
        {
            let dm = Arc::new(DiskManager::new(&path).unwrap());
            let bpm = BufferPoolManager::new(10, 2, dm, None);

            page_id = bpm.new_page().unwrap();
            bpm.unpin_page(page_id, false);
            {
                let mut guard = bpm.fetch_page_write(page_id).unwrap();
                guard.data_mut()[0] = 42;
            }
            assert!(bpm.flush_page(page_id).unwrap());
        }

        let dm = Arc::new(DiskManager::new(&path).unwrap());
        let bpm2 = BufferPoolManager::new(10, 2, dm, None);
        let guard = bpm2.fetch_page_read(page_id).unwrap();
        assert_eq!(guard.data()[0], 42);
    }

    #[test]
    fn test_buffer_pool_manager_flush_missing_page() {
        let (bpm, _temp) = create_bpm(4);
        assert!(!bpm.flush_page(PageId::new(5)).unwrap());
    }
}
