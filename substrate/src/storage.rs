//! Paged storage with the rotating-disk cost model.

use std::collections::HashMap;

use log::trace;
use parking_lot::Mutex;

use crate::error::{Result, StoreError};
use crate::{PageId, PAGE_SIZE};

/// Cost of one random page access, in abstract time units.
pub const RANDOM_ACCESS_COST: f64 = 5.0;
/// Additional per-page cost of a sequential (bulk) access.
pub const SEQUENTIAL_PAGE_COST: f64 = 1.3;

/// A fixed-size page: the unit of I/O and caching.
#[derive(Clone)]
pub struct Page {
    pub id: PageId,
    pub data: Box<[u8; PAGE_SIZE]>,
}

impl Page {
    pub fn new(id: PageId) -> Self {
        Page {
            id,
            data: Box::new([0; PAGE_SIZE]),
        }
    }

    pub fn with_data(id: PageId, data: Box<[u8; PAGE_SIZE]>) -> Self {
        Page { id, data }
    }
}

impl std::fmt::Debug for Page {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Page").field("id", &self.id).finish()
    }
}

/// The monotonically increasing access-cost accumulator. Shared by the
/// storage variants and used as the primary efficiency oracle in tests.
#[derive(Debug, Default)]
pub struct AccessCost {
    total: Mutex<f64>,
}

impl AccessCost {
    pub fn total(&self) -> f64 {
        *self.total.lock()
    }

    pub(crate) fn random(&self) {
        *self.total.lock() += RANDOM_ACCESS_COST;
    }

    pub(crate) fn bulk(&self, pages: u32) {
        *self.total.lock() += RANDOM_ACCESS_COST + SEQUENTIAL_PAGE_COST * pages as f64;
    }
}

/// Durable fixed-size page I/O. Implementations are shared behind
/// `Arc<dyn Storage>` and account every access against the cost model.
pub trait Storage: Send + Sync {
    /// Returns an independent copy of the stored bytes; a page that was never
    /// written materializes as a zero page.
    fn read(&self, page_id: PageId) -> Result<Page>;

    /// Stores a copy of the page. Negative ids are rejected.
    fn write(&self, page: &Page) -> Result<()>;

    /// Feeds `count` consecutive pages to `consumer`, strictly in order.
    /// `start == -1` means "the next id after the current maximum".
    fn bulk_read(&self, start: PageId, count: u32, consumer: &mut dyn FnMut(Page)) -> Result<()>;

    /// Opens a scoped sequential writer assigning ids from `start` (or the
    /// next free id when `start == -1`). Releasing the writer is mandatory
    /// and records the bulk cost once.
    fn bulk_write(&self, start: PageId) -> Result<BulkWriter<'_>>;

    /// The running access-cost total.
    fn access_cost(&self) -> f64;
}

/// Internal sink for `BulkWriter`: stores pages without per-page cost and
/// exposes the accumulator the writer charges on release.
pub trait BulkSink: Send + Sync {
    fn store_sequential(&self, page: &Page) -> Result<()>;
    fn cost(&self) -> &AccessCost;
}

/// A single-use scoped writer for sequential page runs. Dropping it releases
/// the writer and records one bulk cost for the whole run.
pub struct BulkWriter<'a> {
    sink: &'a dyn BulkSink,
    next_id: PageId,
    written: u32,
}

impl<'a> BulkWriter<'a> {
    pub(crate) fn new(sink: &'a dyn BulkSink, start: PageId) -> Self {
        BulkWriter {
            sink,
            next_id: start,
            written: 0,
        }
    }

    /// The id the next appended page will receive.
    pub fn next_id(&self) -> PageId {
        self.next_id
    }

    /// Appends a page at the next sequential id and returns that id.
    pub fn append(&mut self, data: &[u8; PAGE_SIZE]) -> Result<PageId> {
        let id = self.next_id;
        let page = Page {
            id,
            data: Box::new(*data),
        };
        self.sink.store_sequential(&page)?;
        self.next_id += 1;
        self.written += 1;
        Ok(id)
    }
}

impl Drop for BulkWriter<'_> {
    fn drop(&mut self) {
        self.sink.cost().bulk(self.written);
    }
}

fn check_page_id(page_id: PageId) -> Result<()> {
    if page_id < 0 {
        return Err(StoreError::NegativePageId(page_id));
    }
    Ok(())
}

/// The in-memory storage emulator: a page table keyed by id, no persistence,
/// the reference cost model.
#[derive(Default)]
pub struct MemStorage {
    pages: Mutex<HashMap<PageId, Box<[u8; PAGE_SIZE]>>>,
    next_free: Mutex<PageId>,
    cost: AccessCost,
}

impl MemStorage {
    pub fn new() -> Self {
        Self::default()
    }

    fn resolve_start(&self, start: PageId) -> Result<PageId> {
        if start == -1 {
            Ok(*self.next_free.lock())
        } else {
            check_page_id(start)?;
            Ok(start)
        }
    }

    fn fetch(&self, page_id: PageId) -> Page {
        let mut pages = self.pages.lock();
        let data = pages
            .entry(page_id)
            .or_insert_with(|| Box::new([0; PAGE_SIZE]));
        let page = Page {
            id: page_id,
            data: data.clone(),
        };
        let mut next_free = self.next_free.lock();
        if page_id >= *next_free {
            *next_free = page_id + 1;
        }
        page
    }

    fn store(&self, page: &Page) {
        self.pages.lock().insert(page.id, page.data.clone());
        let mut next_free = self.next_free.lock();
        if page.id >= *next_free {
            *next_free = page.id + 1;
        }
    }
}

impl Storage for MemStorage {
    fn read(&self, page_id: PageId) -> Result<Page> {
        check_page_id(page_id)?;
        trace!("mem read page {page_id}");
        self.cost.random();
        Ok(self.fetch(page_id))
    }

    fn write(&self, page: &Page) -> Result<()> {
        check_page_id(page.id)?;
        trace!("mem write page {}", page.id);
        self.cost.random();
        self.store(page);
        Ok(())
    }

    fn bulk_read(&self, start: PageId, count: u32, consumer: &mut dyn FnMut(Page)) -> Result<()> {
        let start = self.resolve_start(start)?;
        self.cost.bulk(count);
        for offset in 0..count {
            consumer(self.fetch(start + offset as PageId));
        }
        Ok(())
    }

    fn bulk_write(&self, start: PageId) -> Result<BulkWriter<'_>> {
        let start = self.resolve_start(start)?;
        Ok(BulkWriter::new(self, start))
    }

    fn access_cost(&self) -> f64 {
        self.cost.total()
    }
}

impl BulkSink for MemStorage {
    fn store_sequential(&self, page: &Page) -> Result<()> {
        self.store(page);
        Ok(())
    }

    fn cost(&self) -> &AccessCost {
        &self.cost
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn read_of_untouched_page_is_zeroed() {
        let storage = MemStorage::new();
        let page = storage.read(7).unwrap();
        assert_eq!(page.id, 7);
        assert!(page.data.iter().all(|&b| b == 0));
    }

    #[test]
    fn write_then_read_round_trips() {
        let storage = MemStorage::new();
        let mut page = Page::new(3);
        page.data[0] = 0xAB;
        page.data[PAGE_SIZE - 1] = 0xCD;
        storage.write(&page).unwrap();

        let back = storage.read(3).unwrap();
        assert_eq!(back.data[0], 0xAB);
        assert_eq!(back.data[PAGE_SIZE - 1], 0xCD);
    }

    #[test]
    fn negative_ids_are_rejected() {
        let storage = MemStorage::new();
        assert!(matches!(
            storage.read(-1),
            Err(StoreError::NegativePageId(-1))
        ));
        assert!(matches!(
            storage.write(&Page::new(-2)),
            Err(StoreError::NegativePageId(-2))
        ));
    }

    #[test]
    fn random_access_cost_is_accounted() {
        let storage = MemStorage::new();
        storage.read(0).unwrap();
        storage.write(&Page::new(1)).unwrap();
        assert_eq!(storage.access_cost(), 2.0 * RANDOM_ACCESS_COST);
    }

    #[test]
    fn bulk_read_costs_one_seek_plus_per_page() {
        let storage = MemStorage::new();
        let mut seen = Vec::new();
        storage
            .bulk_read(4, 3, &mut |page| seen.push(page.id))
            .unwrap();
        assert_eq!(seen, vec![4, 5, 6]);
        assert_eq!(
            storage.access_cost(),
            RANDOM_ACCESS_COST + 3.0 * SEQUENTIAL_PAGE_COST
        );
    }

    #[test]
    fn bulk_writer_assigns_sequential_ids_and_charges_on_release() {
        let storage = MemStorage::new();
        {
            let mut writer = storage.bulk_write(10).unwrap();
            let mut data = [0u8; PAGE_SIZE];
            data[0] = 1;
            assert_eq!(writer.append(&data).unwrap(), 10);
            data[0] = 2;
            assert_eq!(writer.append(&data).unwrap(), 11);
            // No cost until the writer is released.
            assert_eq!(storage.access_cost(), 0.0);
        }
        assert_eq!(
            storage.access_cost(),
            RANDOM_ACCESS_COST + 2.0 * SEQUENTIAL_PAGE_COST
        );
        assert_eq!(storage.read(11).unwrap().data[0], 2);
    }

    #[test]
    fn bulk_write_with_next_free_start_continues_after_maximum() {
        let storage = MemStorage::new();
        storage.write(&Page::new(5)).unwrap();
        let mut writer = storage.bulk_write(-1).unwrap();
        assert_eq!(writer.next_id(), 6);
        let id = writer.append(&[0u8; PAGE_SIZE]).unwrap();
        assert_eq!(id, 6);
    }

    #[test]
    fn releasing_an_empty_bulk_writer_still_costs_a_seek() {
        let storage = MemStorage::new();
        drop(storage.bulk_write(0).unwrap());
        assert_eq!(storage.access_cost(), RANDOM_ACCESS_COST);
    }

    #[test]
    fn cost_total_is_monotonic() {
        let storage = MemStorage::new();
        let mut last = 0.0;
        for i in 0..10 {
            storage.read(i).unwrap();
            let now = storage.access_cost();
            assert!(now > last);
            last = now;
        }
    }
}
