//! Table access: creation, deletion, growth, full scans and appends, all in
//! terms of the catalog and the cache.

use std::collections::VecDeque;
use std::sync::Arc;

use log::debug;

use substrate::page::BASE_HEADER;
use substrate::{GetResult, PageHandle, PageId, PageStore, PutResult, SlotId, SlottedPage, NEW_SLOT};

use crate::catalog::{LinkedCatalog, Oid, TableOidMapping, TablePageDirectory};
use crate::errors::{EngineError, Result};

/// The table-access facade: name resolution through the catalog, page
/// enumeration through the directory, bytes through the cache.
pub struct Tables {
    cache: Arc<dyn PageStore>,
    directory: Arc<dyn TablePageDirectory>,
    mapping: TableOidMapping,
}

impl Tables {
    pub fn new(cache: Arc<dyn PageStore>, directory: Arc<dyn TablePageDirectory>) -> Self {
        let mapping = TableOidMapping::new(cache.clone(), directory.clone());
        Tables {
            cache,
            directory,
            mapping,
        }
    }

    /// Opens (or bootstraps) a linked-catalog table space over the cache.
    pub fn open(cache: Arc<dyn PageStore>) -> Result<Self> {
        let directory = Arc::new(LinkedCatalog::bootstrap(cache.clone())?);
        Ok(Self::new(cache, directory))
    }

    pub fn cache(&self) -> &Arc<dyn PageStore> {
        &self.cache
    }

    /// The cache capacity operators budget against.
    pub fn capacity(&self) -> usize {
        self.cache.capacity()
    }

    pub fn oid(&self, name: &str) -> Result<Oid> {
        self.mapping
            .lookup(name)?
            .ok_or_else(|| EngineError::TableNotFound(name.to_string()))
    }

    pub fn table_exists(&self, name: &str) -> Result<bool> {
        Ok(self.mapping.lookup(name)?.is_some())
    }

    /// Creates an empty table and returns its fresh OID.
    pub fn create_table(&self, name: &str) -> Result<Oid> {
        let oid = self.mapping.create(name)?;
        self.directory.init_table(oid)?;
        Ok(oid)
    }

    /// Logically deletes the table: the name record is flagged, the OID and
    /// its pages are never reused.
    pub fn delete_table(&self, name: &str) -> Result<()> {
        // Resolve first so a missing table reports as such.
        self.oid(name)?;
        self.mapping.delete(name)
    }

    pub fn page_count(&self, name: &str) -> Result<usize> {
        self.directory.page_count(self.oid(name)?)
    }

    pub fn pages_of(&self, name: &str) -> Result<Vec<PageId>> {
        self.directory.pages(self.oid(name)?)
    }

    /// Appends `count` sequential pages to the table, returning the first
    /// new page id.
    pub fn add_pages(&self, oid: Oid, count: u32) -> Result<PageId> {
        self.directory.add_pages(oid, count)
    }

    /// Full scan as a lazy sequence of pinned page handles; dropping each
    /// handle unpins it.
    pub fn scan_pages(&self, name: &str) -> Result<PageScan> {
        Ok(PageScan {
            cache: self.cache.clone(),
            pages: self.pages_of(name)?.into_iter(),
        })
    }

    /// Full scan as a lazy sequence of live record bytes.
    pub fn scan_records(&self, name: &str) -> Result<RecordScan> {
        Ok(RecordScan {
            cache: self.cache.clone(),
            pages: self.pages_of(name)?,
            next_page: 0,
            queue: VecDeque::new(),
        })
    }

    /// Full scan through a caller-supplied record parser.
    pub fn scan_parsed<T, F>(
        &self,
        name: &str,
        mut parser: F,
    ) -> Result<impl Iterator<Item = Result<T>>>
    where
        F: FnMut(&[u8]) -> T,
    {
        let inner = self.scan_records(name)?;
        Ok(inner.map(move |record| record.map(|bytes| parser(&bytes))))
    }

    /// An appender that fills the table's last page before allocating.
    pub fn appender(&self, name: &str) -> Result<TableAppender<'_>> {
        let oid = self.oid(name)?;
        let current = self.directory.pages(oid)?.last().copied();
        Ok(TableAppender {
            tables: self,
            oid,
            current,
        })
    }
}

pub struct PageScan {
    cache: Arc<dyn PageStore>,
    pages: std::vec::IntoIter<PageId>,
}

impl Iterator for PageScan {
    type Item = Result<PageHandle>;

    fn next(&mut self) -> Option<Self::Item> {
        let page_id = self.pages.next()?;
        Some(self.cache.get_and_pin(page_id).map_err(EngineError::from))
    }
}

pub struct RecordScan {
    cache: Arc<dyn PageStore>,
    pages: Vec<PageId>,
    next_page: usize,
    queue: VecDeque<Vec<u8>>,
}

impl Iterator for RecordScan {
    type Item = Result<Vec<u8>>;

    fn next(&mut self) -> Option<Self::Item> {
        loop {
            if let Some(record) = self.queue.pop_front() {
                return Some(Ok(record));
            }
            if self.next_page >= self.pages.len() {
                return None;
            }
            let page_id = self.pages[self.next_page];
            self.next_page += 1;
            let handle = match self.cache.get_and_pin(page_id) {
                Ok(handle) => handle,
                Err(error) => return Some(Err(error.into())),
            };
            let guard = handle.read();
            let page = SlottedPage::new(&guard[..], BASE_HEADER);
            for (_, record) in page.all_records() {
                if let GetResult::Ok(bytes) = record {
                    self.queue.push_back(bytes.to_vec());
                }
            }
        }
    }
}

pub struct TableAppender<'a> {
    tables: &'a Tables,
    oid: Oid,
    current: Option<PageId>,
}

impl TableAppender<'_> {
    pub fn oid(&self) -> Oid {
        self.oid
    }

    /// Appends a record, growing the table by one page when the current
    /// page is full. Returns where the record landed.
    pub fn append(&mut self, bytes: &[u8]) -> Result<(PageId, SlotId)> {
        loop {
            let page_id = match self.current {
                Some(page_id) => page_id,
                None => {
                    let fresh = self.tables.add_pages(self.oid, 1)?;
                    debug!("table {}: grew to page {fresh}", self.oid);
                    self.current = Some(fresh);
                    fresh
                }
            };
            let mut handle = self.tables.cache.get_and_pin(page_id)?;
            let mut guard = handle.write()?;
            let mut page = SlottedPage::new(&mut guard[..], BASE_HEADER);
            match page.put_record(bytes, NEW_SLOT) {
                PutResult::Ok(slot) => return Ok((page_id, slot)),
                PutResult::OutOfSpace if page.directory_size() == 0 => {
                    return Err(EngineError::RecordTooLarge {
                        page: page_id,
                        size: bytes.len(),
                    });
                }
                PutResult::OutOfSpace => {
                    self.current = None;
                }
                PutResult::OutOfRange => unreachable!("append never passes a slot"),
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::record::{RecordReader, RecordWriter};
    use substrate::{BufferCache, CacheConfig, MemStorage};

    fn tables() -> Tables {
        let storage = Arc::new(MemStorage::new());
        let cache: Arc<dyn PageStore> =
            Arc::new(BufferCache::new(storage, CacheConfig::default()));
        Tables::open(cache).unwrap()
    }

    fn int_record(value: i32) -> Vec<u8> {
        let mut writer = RecordWriter::new();
        writer.put_i32(value);
        writer.finish()
    }

    #[test]
    fn create_scan_delete_lifecycle() {
        let tables = tables();
        tables.create_table("fleet").unwrap();
        assert!(tables.table_exists("fleet").unwrap());
        assert_eq!(tables.page_count("fleet").unwrap(), 0);

        let mut appender = tables.appender("fleet").unwrap();
        for value in 0..10 {
            appender.append(&int_record(value)).unwrap();
        }
        assert_eq!(tables.page_count("fleet").unwrap(), 1);

        let seen: Vec<i32> = tables
            .scan_parsed("fleet", |bytes| RecordReader::new(bytes).get_i32())
            .unwrap()
            .map(|record| record.unwrap())
            .collect();
        assert_eq!(seen, (0..10).collect::<Vec<_>>());

        tables.delete_table("fleet").unwrap();
        assert!(!tables.table_exists("fleet").unwrap());
        assert!(matches!(
            tables.scan_records("fleet"),
            Err(EngineError::TableNotFound(_))
        ));
    }

    #[test]
    fn appender_fills_pages_before_allocating() {
        let tables = tables();
        tables.create_table("dense").unwrap();
        let mut appender = tables.appender("dense").unwrap();
        // 507 bytes + 4 slot bytes: exactly 8 records fill a 4096-byte page
        // to the last byte after its 4-byte header.
        let record = vec![3u8; 507];
        for _ in 0..8 {
            appender.append(&record).unwrap();
        }
        let pages = tables.page_count("dense").unwrap();
        appender.append(&record).unwrap();
        assert_eq!(tables.page_count("dense").unwrap(), pages + 1);

        // A fresh appender resumes on the last page instead of growing.
        let mut resumed = tables.appender("dense").unwrap();
        resumed.append(&int_record(1)).unwrap();
        assert_eq!(tables.page_count("dense").unwrap(), pages + 1);
    }

    #[test]
    fn oversized_records_are_rejected() {
        let tables = tables();
        tables.create_table("narrow").unwrap();
        let mut appender = tables.appender("narrow").unwrap();
        let record = vec![0u8; substrate::PAGE_SIZE];
        assert!(matches!(
            appender.append(&record),
            Err(EngineError::RecordTooLarge { .. })
        ));
    }

    #[test]
    fn page_scan_pins_and_releases() {
        let tables = tables();
        tables.create_table("pins").unwrap();
        let mut appender = tables.appender("pins").unwrap();
        for value in 0..3 {
            appender.append(&int_record(value)).unwrap();
        }

        let mut scan = tables.scan_pages("pins").unwrap();
        let handle = scan.next().unwrap().unwrap();
        assert!(handle.is_pinned());
        assert_eq!(handle.entry().pin_count(), 1);
        drop(handle);

        let pages = tables.pages_of("pins").unwrap();
        let again = tables.cache().get_and_pin(pages[0]).unwrap();
        assert_eq!(again.entry().pin_count(), 1);
    }

    #[test]
    fn tombstoned_records_are_skipped_by_scans() {
        let tables = tables();
        tables.create_table("holes").unwrap();
        let mut appender = tables.appender("holes").unwrap();
        for value in 0..5 {
            appender.append(&int_record(value)).unwrap();
        }
        let pages = tables.pages_of("holes").unwrap();
        {
            let mut handle = tables.cache().get_and_pin(pages[0]).unwrap();
            let mut guard = handle.write().unwrap();
            let mut page = SlottedPage::new(&mut guard[..], BASE_HEADER);
            page.delete_record(2);
        }
        let seen: Vec<i32> = tables
            .scan_parsed("holes", |bytes| RecordReader::new(bytes).get_i32())
            .unwrap()
            .map(|record| record.unwrap())
            .collect();
        assert_eq!(seen, vec![0, 1, 3, 4]);
    }
}
