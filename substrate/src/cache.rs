//! The buffer cache: bounded RAM residency with pin/unpin discipline and
//! pluggable eviction.

use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::Arc;

use log::{trace, warn};
use parking_lot::{Mutex, RwLock, RwLockReadGuard, RwLockWriteGuard};

use crate::error::{Result, StoreError};
use crate::storage::{Page, Storage};
use crate::{PageId, PAGE_SIZE};

/// A page resident in memory: bytes plus the residency metadata.
pub struct CachedPage {
    id: PageId,
    data: RwLock<Box<[u8; PAGE_SIZE]>>,
    dirty: AtomicBool,
    pins: AtomicU32,
}

impl CachedPage {
    pub(crate) fn new(page: Page) -> Self {
        CachedPage {
            id: page.id,
            data: RwLock::new(page.data),
            dirty: AtomicBool::new(false),
            pins: AtomicU32::new(0),
        }
    }

    pub fn id(&self) -> PageId {
        self.id
    }

    pub fn is_dirty(&self) -> bool {
        self.dirty.load(Ordering::SeqCst)
    }

    pub fn pin_count(&self) -> u32 {
        self.pins.load(Ordering::SeqCst)
    }

    pub(crate) fn pin(&self) {
        self.pins.fetch_add(1, Ordering::SeqCst);
    }

    pub(crate) fn unpin(&self) {
        let previous = self.pins.fetch_sub(1, Ordering::SeqCst);
        debug_assert!(previous > 0);
    }

    pub(crate) fn mark_dirty(&self) {
        self.dirty.store(true, Ordering::SeqCst);
    }

    pub(crate) fn clear_dirty(&self) {
        self.dirty.store(false, Ordering::SeqCst);
    }

    /// An independent copy of the current bytes.
    pub fn snapshot(&self) -> Page {
        Page {
            id: self.id,
            data: self.data.read().clone(),
        }
    }

    /// Overwrites the bytes from a source image. Used by the transaction
    /// layer to revert an aborted working copy.
    pub fn reset_to(&self, source: &[u8; PAGE_SIZE]) {
        self.data.write().copy_from_slice(source);
    }
}

/// Interception points the transaction layer installs on handles it vends.
pub trait WriteHooks: Send + Sync {
    /// Runs before a write guard is produced; may block until the write is
    /// admissible. Returning a replacement entry redirects the write (an
    /// MVCC scheduler steering the transaction onto its private version).
    fn before_write(&self, logical: PageId, current: &Arc<CachedPage>)
        -> Result<Option<Arc<CachedPage>>>;

    /// Runs after every physical write, when the guard is released.
    fn after_write(&self, logical: PageId);
}

/// A borrowed, read-only view of a cached page's bytes.
pub struct PageReadGuard<'a> {
    guard: RwLockReadGuard<'a, Box<[u8; PAGE_SIZE]>>,
}

impl std::ops::Deref for PageReadGuard<'_> {
    type Target = [u8];

    fn deref(&self) -> &[u8] {
        &self.guard[..]
    }
}

/// A mutable view of a cached page's bytes. Acquiring one marks the page
/// dirty; releasing it fires the transactional after-write hook.
pub struct PageWriteGuard<'a> {
    guard: RwLockWriteGuard<'a, Box<[u8; PAGE_SIZE]>>,
    logical: PageId,
    hooks: Option<&'a Arc<dyn WriteHooks>>,
}

impl std::ops::Deref for PageWriteGuard<'_> {
    type Target = [u8];

    fn deref(&self) -> &[u8] {
        &self.guard[..]
    }
}

impl std::ops::DerefMut for PageWriteGuard<'_> {
    fn deref_mut(&mut self) -> &mut [u8] {
        &mut self.guard[..]
    }
}

impl Drop for PageWriteGuard<'_> {
    fn drop(&mut self) {
        if let Some(hooks) = self.hooks {
            hooks.after_write(self.logical);
        }
    }
}

/// An owned handle to a cached page. Dropping a pinned handle unpins it
/// exactly once; handles are deliberately not clonable.
pub struct PageHandle {
    entry: Arc<CachedPage>,
    logical: PageId,
    pinned: bool,
    hooks: Option<Arc<dyn WriteHooks>>,
    write_through: Option<Arc<dyn Storage>>,
}

impl std::fmt::Debug for PageHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PageHandle")
            .field("logical", &self.logical)
            .field("pinned", &self.pinned)
            .finish()
    }
}

impl PageHandle {
    pub(crate) fn new(entry: Arc<CachedPage>, pinned: bool) -> Self {
        let logical = entry.id();
        if pinned {
            entry.pin();
        }
        PageHandle {
            entry,
            logical,
            pinned,
            hooks: None,
            write_through: None,
        }
    }

    pub(crate) fn with_hooks(mut self, logical: PageId, hooks: Arc<dyn WriteHooks>) -> Self {
        self.logical = logical;
        self.hooks = Some(hooks);
        self
    }

    pub(crate) fn with_write_through(mut self, storage: Arc<dyn Storage>) -> Self {
        self.write_through = Some(storage);
        self
    }

    /// The logical page id this handle was requested for. An MVCC scheduler
    /// may serve the bytes of a different physical page.
    pub fn id(&self) -> PageId {
        self.logical
    }

    pub fn is_pinned(&self) -> bool {
        self.pinned
    }

    pub fn entry(&self) -> &Arc<CachedPage> {
        &self.entry
    }

    pub fn read(&self) -> PageReadGuard<'_> {
        PageReadGuard {
            guard: self.entry.data.read(),
        }
    }

    /// Acquires a write guard, running the transactional write interception
    /// first. May suspend the calling worker while the scheduler reports a
    /// conflicting transaction.
    pub fn write(&mut self) -> Result<PageWriteGuard<'_>> {
        if let Some(hooks) = self.hooks.clone() {
            if let Some(replacement) = hooks.before_write(self.logical, &self.entry)? {
                if self.pinned {
                    self.entry.unpin();
                    replacement.pin();
                }
                self.entry = replacement;
            }
        }
        self.entry.mark_dirty();
        Ok(PageWriteGuard {
            guard: self.entry.data.write(),
            logical: self.logical,
            hooks: self.hooks.as_ref(),
        })
    }
}

impl Drop for PageHandle {
    fn drop(&mut self) {
        if self.pinned {
            self.entry.unpin();
        }
        if let Some(storage) = self.write_through.take() {
            if self.entry.is_dirty() {
                if let Err(e) = storage.write(&self.entry.snapshot()) {
                    warn!("write-through of page {} failed: {e}", self.entry.id());
                }
                self.entry.clear_dirty();
            }
        }
    }
}

/// Cache statistics snapshot. The per-page load counter records how many
/// times each page was (re)fetched from storage.
#[derive(Debug, Clone, Default)]
pub struct CacheStats {
    pub hits: u64,
    pub misses: u64,
    pub loads: HashMap<PageId, u64>,
}

/// The residency contract shared by the buffer cache, the pass-through cache
/// and the transaction wrapper.
pub trait PageStore: Send + Sync {
    /// Hands out a handle without pinning.
    fn get(&self, page_id: PageId) -> Result<PageHandle>;

    /// Hands out a pinned handle; the pin is released when the handle drops.
    fn get_and_pin(&self, page_id: PageId) -> Result<PageHandle>;

    /// Bulk prefetch of consecutive pages. Hit/miss counters are untouched.
    fn load(&self, start: PageId, count: u32) -> Result<()>;

    /// Writes every dirty resident page through to storage.
    fn flush(&self) -> Result<()>;

    /// Maximum resident pages.
    fn capacity(&self) -> usize;

    fn stats(&self) -> CacheStats;

    /// Clears the counters but not the residency set.
    fn reset_stats(&self);
}

/// Eviction policy tag, chosen at construction.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EvictionPolicy {
    Fifo,
    Clock,
    Aging,
}

#[derive(Debug, Clone)]
pub struct CacheConfig {
    pub capacity: usize,
    pub policy: EvictionPolicy,
}

impl Default for CacheConfig {
    fn default() -> Self {
        CacheConfig {
            capacity: 100,
            policy: EvictionPolicy::Clock,
        }
    }
}

const AGE_HIGH_BIT: u32 = 1 << 31;

struct Slot {
    entry: Arc<CachedPage>,
    usage: u32,
}

enum PolicyState {
    Fifo { order: VecDeque<usize> },
    Clock { hand: usize },
    Aging { ticks: u64, period: u64 },
}

struct CacheInner {
    slots: Vec<Option<Slot>>,
    map: HashMap<PageId, usize>,
    policy: PolicyState,
    hits: u64,
    misses: u64,
    loads: HashMap<PageId, u64>,
}

impl CacheInner {
    fn touch(&mut self, index: usize) {
        match &mut self.policy {
            PolicyState::Fifo { .. } => {}
            PolicyState::Clock { .. } => {
                if let Some(slot) = &mut self.slots[index] {
                    slot.usage = slot.usage.max(1);
                }
            }
            PolicyState::Aging { ticks, period } => {
                if let Some(slot) = &mut self.slots[index] {
                    slot.usage |= AGE_HIGH_BIT;
                }
                *ticks += 1;
                if *ticks % *period == 0 {
                    for slot in self.slots.iter_mut().flatten() {
                        slot.usage >>= 1;
                    }
                }
            }
        }
    }

    fn admit(&mut self, index: usize, page_id: PageId, entry: Arc<CachedPage>) {
        self.slots[index] = Some(Slot { entry, usage: 0 });
        self.map.insert(page_id, index);
        if let PolicyState::Fifo { order } = &mut self.policy {
            order.push_back(index);
        }
        self.touch(index);
    }

    fn free_slot(&self) -> Option<usize> {
        self.slots.iter().position(Option::is_none)
    }

    /// Selects a victim among unpinned residents, per policy.
    fn pick_victim(&mut self) -> Result<usize> {
        let capacity = self.slots.len();
        let saturated = || StoreError::CacheSaturated(capacity);
        match &mut self.policy {
            PolicyState::Fifo { order } => {
                let position = order
                    .iter()
                    .position(|&index| {
                        self.slots[index]
                            .as_ref()
                            .is_some_and(|slot| slot.entry.pin_count() == 0)
                    })
                    .ok_or_else(saturated)?;
                let index = order[position];
                order.remove(position);
                Ok(index)
            }
            PolicyState::Clock { hand } => {
                let mut swept = 0usize;
                let mut unpinned_this_revolution = false;
                loop {
                    let index = *hand;
                    *hand = (*hand + 1) % capacity;
                    swept += 1;
                    if let Some(slot) = &mut self.slots[index] {
                        if slot.entry.pin_count() == 0 {
                            unpinned_this_revolution = true;
                            if slot.usage == 0 {
                                return Ok(index);
                            }
                            slot.usage -= 1;
                        } else if slot.usage > 0 {
                            slot.usage -= 1;
                        }
                    }
                    if swept % capacity == 0 {
                        // A full revolution with no unpinned entry at all.
                        if !unpinned_this_revolution {
                            return Err(saturated());
                        }
                        unpinned_this_revolution = false;
                    }
                }
            }
            PolicyState::Aging { .. } => self
                .slots
                .iter()
                .enumerate()
                .filter_map(|(index, slot)| {
                    let slot = slot.as_ref()?;
                    (slot.entry.pin_count() == 0).then_some((index, slot.usage))
                })
                .min_by_key(|&(_, usage)| usage)
                .map(|(index, _)| index)
                .ok_or_else(saturated),
        }
    }
}

/// The buffer cache proper.
pub struct BufferCache {
    storage: Arc<dyn Storage>,
    capacity: usize,
    inner: Mutex<CacheInner>,
}

impl BufferCache {
    pub fn new(storage: Arc<dyn Storage>, config: CacheConfig) -> Self {
        let capacity = config.capacity.max(1);
        let policy = match config.policy {
            EvictionPolicy::Fifo => PolicyState::Fifo {
                order: VecDeque::with_capacity(capacity),
            },
            EvictionPolicy::Clock => PolicyState::Clock { hand: 0 },
            EvictionPolicy::Aging => PolicyState::Aging {
                ticks: 0,
                period: (capacity as u64).div_ceil(40).max(1),
            },
        };
        BufferCache {
            storage,
            capacity,
            inner: Mutex::new(CacheInner {
                slots: (0..capacity).map(|_| None).collect(),
                map: HashMap::new(),
                policy,
                hits: 0,
                misses: 0,
                loads: HashMap::new(),
            }),
        }
    }

    pub fn storage(&self) -> &Arc<dyn Storage> {
        &self.storage
    }

    /// Number of currently resident pages.
    pub fn resident(&self) -> usize {
        self.inner.lock().map.len()
    }

    fn evict_into(&self, inner: &mut CacheInner) -> Result<usize> {
        let index = inner.pick_victim()?;
        if let Some(slot) = inner.slots[index].take() {
            inner.map.remove(&slot.entry.id());
            if slot.entry.is_dirty() {
                trace!("evicting dirty page {}", slot.entry.id());
                self.storage.write(&slot.entry.snapshot())?;
                slot.entry.clear_dirty();
            }
        }
        Ok(index)
    }

    fn admit_missing(&self, inner: &mut CacheInner, page_id: PageId) -> Result<Arc<CachedPage>> {
        let index = match inner.free_slot() {
            Some(free) => free,
            None => self.evict_into(inner)?,
        };
        let page = self.storage.read(page_id)?;
        *inner.loads.entry(page_id).or_insert(0) += 1;
        let entry = Arc::new(CachedPage::new(page));
        inner.admit(index, page_id, entry.clone());
        Ok(entry)
    }

    fn fetch(&self, page_id: PageId, pin: bool) -> Result<PageHandle> {
        if page_id < 0 {
            return Err(StoreError::NegativePageId(page_id));
        }
        let mut inner = self.inner.lock();
        if let Some(&index) = inner.map.get(&page_id) {
            inner.hits += 1;
            inner.touch(index);
            let entry = inner.slots[index]
                .as_ref()
                .expect("page table points at an occupied slot")
                .entry
                .clone();
            return Ok(PageHandle::new(entry, pin));
        }
        inner.misses += 1;
        let entry = self.admit_missing(&mut inner, page_id)?;
        Ok(PageHandle::new(entry, pin))
    }
}

impl PageStore for BufferCache {
    fn get(&self, page_id: PageId) -> Result<PageHandle> {
        self.fetch(page_id, false)
    }

    fn get_and_pin(&self, page_id: PageId) -> Result<PageHandle> {
        self.fetch(page_id, true)
    }

    fn load(&self, start: PageId, count: u32) -> Result<()> {
        let mut pages = Vec::with_capacity(count as usize);
        self.storage
            .bulk_read(start, count, &mut |page| pages.push(page))?;
        let mut inner = self.inner.lock();
        for page in pages {
            if inner.map.contains_key(&page.id) {
                continue;
            }
            let index = match inner.free_slot() {
                Some(free) => free,
                None => self.evict_into(&mut inner)?,
            };
            *inner.loads.entry(page.id).or_insert(0) += 1;
            let id = page.id;
            inner.admit(index, id, Arc::new(CachedPage::new(page)));
        }
        Ok(())
    }

    fn flush(&self) -> Result<()> {
        let inner = self.inner.lock();
        for slot in inner.slots.iter().flatten() {
            if slot.entry.is_dirty() {
                self.storage.write(&slot.entry.snapshot())?;
                slot.entry.clear_dirty();
            }
        }
        Ok(())
    }

    fn capacity(&self) -> usize {
        self.capacity
    }

    fn stats(&self) -> CacheStats {
        let inner = self.inner.lock();
        CacheStats {
            hits: inner.hits,
            misses: inner.misses,
            loads: inner.loads.clone(),
        }
    }

    fn reset_stats(&self) {
        let mut inner = self.inner.lock();
        inner.hits = 0;
        inner.misses = 0;
        inner.loads.clear();
    }
}

/// The "none" cache: no residency, every `get` reads straight through and a
/// dropped dirty handle writes straight back.
pub struct NoneCache {
    storage: Arc<dyn Storage>,
}

impl NoneCache {
    pub fn new(storage: Arc<dyn Storage>) -> Self {
        NoneCache { storage }
    }
}

impl PageStore for NoneCache {
    fn get(&self, page_id: PageId) -> Result<PageHandle> {
        let page = self.storage.read(page_id)?;
        let entry = Arc::new(CachedPage::new(page));
        Ok(PageHandle::new(entry, false).with_write_through(self.storage.clone()))
    }

    fn get_and_pin(&self, page_id: PageId) -> Result<PageHandle> {
        let page = self.storage.read(page_id)?;
        let entry = Arc::new(CachedPage::new(page));
        Ok(PageHandle::new(entry, true).with_write_through(self.storage.clone()))
    }

    fn load(&self, _start: PageId, _count: u32) -> Result<()> {
        Ok(())
    }

    fn flush(&self) -> Result<()> {
        Ok(())
    }

    fn capacity(&self) -> usize {
        0
    }

    fn stats(&self) -> CacheStats {
        CacheStats::default()
    }

    fn reset_stats(&self) {}
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::MemStorage;

    fn cache(capacity: usize, policy: EvictionPolicy) -> (Arc<MemStorage>, BufferCache) {
        let storage = Arc::new(MemStorage::new());
        let cache = BufferCache::new(storage.clone(), CacheConfig { capacity, policy });
        (storage, cache)
    }

    #[test]
    fn residency_never_exceeds_capacity() {
        let (_, cache) = cache(4, EvictionPolicy::Clock);
        for id in 0..20 {
            cache.get(id).unwrap();
        }
        assert!(cache.resident() <= 4);
    }

    #[test]
    fn hits_and_misses_are_counted() {
        let (_, cache) = cache(4, EvictionPolicy::Clock);
        cache.get(1).unwrap();
        cache.get(1).unwrap();
        cache.get(2).unwrap();
        let stats = cache.stats();
        assert_eq!(stats.hits, 1);
        assert_eq!(stats.misses, 2);
        assert_eq!(stats.loads[&1], 1);

        cache.reset_stats();
        let stats = cache.stats();
        assert_eq!((stats.hits, stats.misses), (0, 0));
        assert!(stats.loads.is_empty());
        // Residency survived the reset.
        assert_eq!(cache.resident(), 2);
    }

    #[test]
    fn fifo_evicts_oldest_unpinned() {
        let (_, cache) = cache(3, EvictionPolicy::Fifo);
        cache.get(10).unwrap();
        cache.get(11).unwrap();
        cache.get(12).unwrap();
        // Touching 10 again must not save it under FIFO.
        cache.get(10).unwrap();
        cache.get(13).unwrap();

        let stats = cache.stats();
        assert_eq!(stats.loads.get(&10), Some(&1));
        cache.get(10).unwrap();
        // 10 was evicted and had to be loaded again.
        assert_eq!(cache.stats().loads.get(&10), Some(&2));
    }

    #[test]
    fn fifo_skips_pinned_entries() {
        let (_, cache) = cache(2, EvictionPolicy::Fifo);
        let _pinned = cache.get_and_pin(1).unwrap();
        cache.get(2).unwrap();
        cache.get(3).unwrap();
        // Page 1 is pinned, so 2 was the victim.
        cache.get(1).unwrap();
        assert_eq!(cache.stats().loads.get(&1), Some(&1));
    }

    #[test]
    fn clock_gives_freshly_admitted_pages_a_second_chance() {
        let (_, cache) = cache(2, EvictionPolicy::Clock);
        cache.get(1).unwrap();
        cache.get(2).unwrap();
        // Both counters are 1; the sweep zeroes them and takes page 1.
        cache.get(3).unwrap();
        // Page 2's counter is already 0, page 3's is 1: 2 is the victim and
        // the fresh page 3 survives.
        cache.get(4).unwrap();
        cache.get(3).unwrap();
        assert_eq!(cache.stats().loads.get(&3), Some(&1));
        cache.get(2).unwrap();
        assert_eq!(cache.stats().loads.get(&2), Some(&2));
    }

    #[test]
    fn aging_evicts_the_coldest_page() {
        let (_, cache) = cache(3, EvictionPolicy::Aging);
        cache.get(1).unwrap();
        cache.get(2).unwrap();
        cache.get(3).unwrap();
        // Heat pages 1 and 3; page 2's register decays lowest.
        for _ in 0..50 {
            cache.get(1).unwrap();
            cache.get(3).unwrap();
        }
        cache.get(4).unwrap();
        cache.get(2).unwrap();
        assert_eq!(cache.stats().loads.get(&2), Some(&2));
        assert_eq!(cache.stats().loads.get(&1), Some(&1));
    }

    #[test]
    fn a_miss_into_a_free_slot_never_evicts() {
        let (storage, cache) = cache(4, EvictionPolicy::Fifo);
        {
            let mut handle = cache.get(1).unwrap();
            handle.write().unwrap()[0] = 1;
        }
        let cost_before = storage.access_cost();
        // Slots remain free: admitting page 2 must not write the dirty page.
        cache.get(2).unwrap();
        assert_eq!(
            storage.access_cost(),
            cost_before + crate::storage::RANDOM_ACCESS_COST
        );
        assert!(cache.get(1).is_ok());
        assert_eq!(cache.stats().loads.get(&1), Some(&1));
    }

    #[test]
    fn miss_with_every_page_pinned_saturates() {
        let (_, cache) = cache(2, EvictionPolicy::Clock);
        let _a = cache.get_and_pin(1).unwrap();
        let _b = cache.get_and_pin(2).unwrap();
        match cache.get(3) {
            Err(StoreError::CacheSaturated(2)) => {}
            other => panic!("expected saturation, got {other:?}"),
        }
    }

    #[test]
    fn unpinning_by_drop_allows_eviction_again() {
        let (_, cache) = cache(2, EvictionPolicy::Clock);
        {
            let _a = cache.get_and_pin(1).unwrap();
            let _b = cache.get_and_pin(2).unwrap();
        }
        cache.get(3).unwrap();
    }

    #[test]
    fn dirty_victim_is_written_back() {
        let (storage, cache) = cache(1, EvictionPolicy::Fifo);
        {
            let mut handle = cache.get(5).unwrap();
            let mut guard = handle.write().unwrap();
            guard[0] = 0x5A;
        }
        cache.get(6).unwrap();
        assert_eq!(storage.read(5).unwrap().data[0], 0x5A);
    }

    #[test]
    fn flush_writes_dirty_pages_and_is_idempotent() {
        let (storage, cache) = cache(4, EvictionPolicy::Clock);
        {
            let mut handle = cache.get(1).unwrap();
            handle.write().unwrap()[10] = 9;
        }
        cache.flush().unwrap();
        assert_eq!(storage.read(1).unwrap().data[10], 9);

        let cost_after_first = storage.access_cost();
        cache.flush().unwrap();
        // Nothing dirty remains, so the second flush performs no writes.
        assert_eq!(storage.access_cost(), cost_after_first);
    }

    #[test]
    fn load_prefetches_without_stats() {
        let (_, cache) = cache(8, EvictionPolicy::Clock);
        cache.load(0, 4).unwrap();
        let stats = cache.stats();
        assert_eq!((stats.hits, stats.misses), (0, 0));
        assert_eq!(stats.loads.len(), 4);
        // The prefetched page is now a hit.
        cache.get(2).unwrap();
        assert_eq!(cache.stats().hits, 1);
    }

    #[test]
    fn none_cache_reads_through_and_writes_back_on_drop() {
        let storage: Arc<MemStorage> = Arc::new(MemStorage::new());
        let cache = NoneCache::new(storage.clone());
        {
            let mut handle = cache.get(3).unwrap();
            handle.write().unwrap()[0] = 0x77;
        }
        assert_eq!(storage.read(3).unwrap().data[0], 0x77);
        // A clean handle does not write back.
        let cost = storage.access_cost();
        drop(cache.get(3).unwrap());
        assert_eq!(storage.access_cost(), cost + crate::storage::RANDOM_ACCESS_COST);
    }
}
