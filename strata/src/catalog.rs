//! The catalog: table-name↔OID mapping and per-table page directories,
//! stored on system pages.
//!
//! Page ids `0..RESERVED_PAGES` form the reserved root region: every table's
//! directory head page has id equal to its OID, and chained catalog pages
//! are drawn downward from the top of the region. Data pages are allocated
//! upward from `RESERVED_PAGES` by a monotonic counter. Both counters
//! persist in the zero page's header: `(directory_size, free_catalog_page,
//! free_data_page)`.

use std::collections::HashMap;
use std::sync::Arc;

use log::debug;
use parking_lot::Mutex;

use substrate::page::BASE_HEADER;
use substrate::{GetResult, PageId, PageStore, PutResult, SlottedPage, NEW_SLOT};

use crate::errors::{EngineError, Result};
use crate::record::{RecordReader, RecordWriter};

/// A table identifier: positive, unique, never reused.
pub type Oid = i32;

/// Size of the reserved root/catalog page region.
pub const RESERVED_PAGES: PageId = 4096;
pub const NAME_TABLE_OID: Oid = 0;
pub const ATTRIBUTE_TABLE_OID: Oid = 1;
pub const FIRST_USER_OID: Oid = 2;

/// Catalog pages carry a 12-byte header: the directory-size word plus two
/// i32 fields. On the zero page those are the allocation counters; on every
/// other catalog page they are `(last_page, next_page)`.
pub const CATALOG_HEADER: usize = 12;
const FIELD_LAST_PAGE: usize = 0;
const FIELD_NEXT_PAGE: usize = 1;
const FIELD_FREE_CATALOG: usize = 0;
const FIELD_FREE_DATA: usize = 1;

/// Sentinel for "no page" in catalog chain links.
pub const NO_PAGE: PageId = -1;

fn directory_entry(oid: Oid, page_id: PageId) -> Vec<u8> {
    let mut writer = RecordWriter::new();
    writer.put_i32(oid).put_i32(page_id);
    writer.finish()
}

/// Initializes the zero page and the attribute-table root on first contact
/// with a fresh storage.
fn bootstrap_root_pages(cache: &Arc<dyn PageStore>) -> Result<()> {
    let mut zero = cache.get_and_pin(0)?;
    let fresh = {
        let guard = zero.read();
        SlottedPage::new(&guard[..], CATALOG_HEADER).header_field(FIELD_FREE_DATA) == 0
    };
    if !fresh {
        return Ok(());
    }
    debug!("bootstrapping catalog root pages");
    {
        let mut guard = zero.write()?;
        let mut page = SlottedPage::new(&mut guard[..], CATALOG_HEADER);
        page.set_header_field(FIELD_FREE_CATALOG, RESERVED_PAGES - 1);
        page.set_header_field(FIELD_FREE_DATA, RESERVED_PAGES);
    }
    let mut attribute = cache.get_and_pin(ATTRIBUTE_TABLE_OID)?;
    let mut guard = attribute.write()?;
    let mut page = SlottedPage::new(&mut guard[..], CATALOG_HEADER);
    page.set_header_field(FIELD_LAST_PAGE, ATTRIBUTE_TABLE_OID);
    page.set_header_field(FIELD_NEXT_PAGE, NO_PAGE);
    Ok(())
}

/// Bumps the data-page counter on the zero page by `count`, returning the
/// first id of the new run.
fn allocate_data_pages(cache: &Arc<dyn PageStore>, count: u32) -> Result<PageId> {
    let mut zero = cache.get_and_pin(0)?;
    let mut guard = zero.write()?;
    let mut page = SlottedPage::new(&mut guard[..], CATALOG_HEADER);
    let first = page.header_field(FIELD_FREE_DATA);
    page.set_header_field(FIELD_FREE_DATA, first + count as PageId);
    Ok(first)
}

/// The id the chained-catalog counter would hand out next.
fn next_catalog_page(cache: &Arc<dyn PageStore>) -> Result<PageId> {
    let zero = cache.get(0)?;
    let guard = zero.read();
    Ok(SlottedPage::new(&guard[..], CATALOG_HEADER).header_field(FIELD_FREE_CATALOG))
}

/// Takes the next chained-catalog page id, counting down from the top of
/// the reserved region. The OID counter climbs the same region from below,
/// so a candidate that already serves as some table's root page means the
/// two ends have met: that is `CatalogOverflow`, never a silent overwrite.
fn allocate_catalog_page(cache: &Arc<dyn PageStore>, oid: Oid) -> Result<PageId> {
    let mut zero = cache.get_and_pin(0)?;
    let id = {
        let guard = zero.read();
        SlottedPage::new(&guard[..], CATALOG_HEADER).header_field(FIELD_FREE_CATALOG)
    };
    if id < FIRST_USER_OID {
        return Err(EngineError::CatalogOverflow(oid));
    }
    {
        // Live root pages carry their own id (or a later chain page) in
        // `last_page`; a virgin page reads 0 there.
        let head = cache.get(id)?;
        let guard = head.read();
        if SlottedPage::new(&guard[..], CATALOG_HEADER).header_field(FIELD_LAST_PAGE) != 0 {
            return Err(EngineError::CatalogOverflow(oid));
        }
    }
    let mut guard = zero.write()?;
    SlottedPage::new(&mut guard[..], CATALOG_HEADER).set_header_field(FIELD_FREE_CATALOG, id - 1);
    Ok(id)
}

/// Maps a table OID to the ordered set of its data pages and grows tables
/// on request.
pub trait TablePageDirectory: Send + Sync {
    /// Creates the (empty) directory for a freshly assigned OID.
    fn init_table(&self, oid: Oid) -> Result<()>;

    /// All data page ids of the table, in insertion order.
    fn pages(&self, oid: Oid) -> Result<Vec<PageId>>;

    /// Appends `count` sequential data pages; returns the first new id.
    fn add_pages(&self, oid: Oid, count: u32) -> Result<PageId>;

    fn page_count(&self, oid: Oid) -> Result<usize> {
        Ok(self.pages(oid)?.len())
    }
}

/// The production directory: the head catalog page (id = OID) chains into
/// further catalog pages via `(last_page, next_page)` header links.
pub struct LinkedCatalog {
    cache: Arc<dyn PageStore>,
    write_lock: Mutex<()>,
}

impl LinkedCatalog {
    pub fn bootstrap(cache: Arc<dyn PageStore>) -> Result<Self> {
        bootstrap_root_pages(&cache)?;
        Ok(LinkedCatalog {
            cache,
            write_lock: Mutex::new(()),
        })
    }

    fn check_oid(&self, oid: Oid) -> Result<()> {
        if !(0..RESERVED_PAGES).contains(&oid) {
            return Err(EngineError::UnknownOid(oid));
        }
        if oid != NAME_TABLE_OID {
            let handle = self.cache.get(oid)?;
            let guard = handle.read();
            if SlottedPage::new(&guard[..], CATALOG_HEADER).header_field(FIELD_LAST_PAGE) == 0 {
                return Err(EngineError::UnknownOid(oid));
            }
        }
        Ok(())
    }

    fn tail_page(&self, oid: Oid) -> Result<PageId> {
        if oid == NAME_TABLE_OID {
            return Ok(0);
        }
        let handle = self.cache.get(oid)?;
        let guard = handle.read();
        Ok(SlottedPage::new(&guard[..], CATALOG_HEADER).header_field(FIELD_LAST_PAGE))
    }

    /// Chains a fresh catalog page after `tail` and records it as the
    /// table's last page.
    fn chain_catalog_page(&self, oid: Oid, tail: PageId) -> Result<PageId> {
        if oid == NAME_TABLE_OID {
            // The name table's directory must fit its head page; the OID
            // region is exhausted long before this can trigger.
            return Err(EngineError::CatalogOverflow(oid));
        }
        let fresh = allocate_catalog_page(&self.cache, oid)?;
        {
            let mut handle = self.cache.get_and_pin(fresh)?;
            let mut guard = handle.write()?;
            let mut page = SlottedPage::new(&mut guard[..], CATALOG_HEADER);
            page.clear();
            page.set_header_field(FIELD_LAST_PAGE, NO_PAGE);
            page.set_header_field(FIELD_NEXT_PAGE, NO_PAGE);
        }
        {
            let mut handle = self.cache.get_and_pin(tail)?;
            let mut guard = handle.write()?;
            SlottedPage::new(&mut guard[..], CATALOG_HEADER)
                .set_header_field(FIELD_NEXT_PAGE, fresh);
        }
        let mut head = self.cache.get_and_pin(oid)?;
        let mut guard = head.write()?;
        SlottedPage::new(&mut guard[..], CATALOG_HEADER).set_header_field(FIELD_LAST_PAGE, fresh);
        debug!("table {oid}: chained catalog page {fresh}");
        Ok(fresh)
    }
}

impl TablePageDirectory for LinkedCatalog {
    fn init_table(&self, oid: Oid) -> Result<()> {
        let _guard = self.write_lock.lock();
        let mut handle = self.cache.get_and_pin(oid)?;
        let mut guard = handle.write()?;
        let mut page = SlottedPage::new(&mut guard[..], CATALOG_HEADER);
        page.clear();
        page.set_header_field(FIELD_LAST_PAGE, oid);
        page.set_header_field(FIELD_NEXT_PAGE, NO_PAGE);
        Ok(())
    }

    fn pages(&self, oid: Oid) -> Result<Vec<PageId>> {
        self.check_oid(oid)?;
        let mut result = Vec::new();
        let mut current = oid;
        loop {
            let handle = self.cache.get_and_pin(current)?;
            let guard = handle.read();
            let page = SlottedPage::new(&guard[..], CATALOG_HEADER);
            for (_, record) in page.all_records() {
                if let GetResult::Ok(bytes) = record {
                    let mut reader = RecordReader::new(bytes);
                    let _owner = reader.get_i32();
                    result.push(reader.get_i32());
                }
            }
            if current == NAME_TABLE_OID {
                break;
            }
            let next = page.header_field(FIELD_NEXT_PAGE);
            if next == NO_PAGE {
                break;
            }
            current = next;
        }
        Ok(result)
    }

    fn add_pages(&self, oid: Oid, count: u32) -> Result<PageId> {
        let _guard = self.write_lock.lock();
        self.check_oid(oid)?;
        let first = allocate_data_pages(&self.cache, count)?;
        let mut tail = self.tail_page(oid)?;
        for offset in 0..count {
            let entry = directory_entry(oid, first + offset as PageId);
            loop {
                let appended = {
                    let mut handle = self.cache.get_and_pin(tail)?;
                    let mut guard = handle.write()?;
                    let mut page = SlottedPage::new(&mut guard[..], CATALOG_HEADER);
                    matches!(page.put_record(&entry, NEW_SLOT), PutResult::Ok(_))
                };
                if appended {
                    break;
                }
                tail = self.chain_catalog_page(oid, tail)?;
            }
        }
        Ok(first)
    }
}

/// The illustrative fallback: the whole directory lives on the single page
/// whose id is the OID; running past its capacity is an error.
pub struct SinglePageDirectory {
    cache: Arc<dyn PageStore>,
    write_lock: Mutex<()>,
}

impl SinglePageDirectory {
    pub fn bootstrap(cache: Arc<dyn PageStore>) -> Result<Self> {
        bootstrap_root_pages(&cache)?;
        Ok(SinglePageDirectory {
            cache,
            write_lock: Mutex::new(()),
        })
    }

    fn check_oid(&self, oid: Oid) -> Result<()> {
        if !(0..RESERVED_PAGES).contains(&oid) {
            return Err(EngineError::UnknownOid(oid));
        }
        if oid != NAME_TABLE_OID {
            let handle = self.cache.get(oid)?;
            let guard = handle.read();
            if SlottedPage::new(&guard[..], CATALOG_HEADER).header_field(FIELD_LAST_PAGE) == 0 {
                return Err(EngineError::UnknownOid(oid));
            }
        }
        Ok(())
    }
}

impl TablePageDirectory for SinglePageDirectory {
    fn init_table(&self, oid: Oid) -> Result<()> {
        let _guard = self.write_lock.lock();
        let mut handle = self.cache.get_and_pin(oid)?;
        let mut guard = handle.write()?;
        let mut page = SlottedPage::new(&mut guard[..], CATALOG_HEADER);
        page.clear();
        page.set_header_field(FIELD_LAST_PAGE, oid);
        page.set_header_field(FIELD_NEXT_PAGE, NO_PAGE);
        Ok(())
    }

    fn pages(&self, oid: Oid) -> Result<Vec<PageId>> {
        self.check_oid(oid)?;
        let handle = self.cache.get_and_pin(oid)?;
        let guard = handle.read();
        let page = SlottedPage::new(&guard[..], CATALOG_HEADER);
        let mut result = Vec::new();
        for (_, record) in page.all_records() {
            if let GetResult::Ok(bytes) = record {
                let mut reader = RecordReader::new(bytes);
                let _owner = reader.get_i32();
                result.push(reader.get_i32());
            }
        }
        Ok(result)
    }

    fn add_pages(&self, oid: Oid, count: u32) -> Result<PageId> {
        let _guard = self.write_lock.lock();
        self.check_oid(oid)?;
        let first = allocate_data_pages(&self.cache, count)?;
        let mut handle = self.cache.get_and_pin(oid)?;
        let mut guard = handle.write()?;
        let mut page = SlottedPage::new(&mut guard[..], CATALOG_HEADER);
        for offset in 0..count {
            let entry = directory_entry(oid, first + offset as PageId);
            if !matches!(page.put_record(&entry, NEW_SLOT), PutResult::Ok(_)) {
                return Err(EngineError::CatalogOverflow(oid));
            }
        }
        Ok(first)
    }
}

struct NameRecord {
    oid: Oid,
    name: String,
    deleted: bool,
}

fn decode_name_record(bytes: &[u8]) -> NameRecord {
    let mut reader = RecordReader::new(bytes);
    NameRecord {
        oid: reader.get_i32(),
        name: reader.get_str(),
        deleted: reader.get_bool(),
    }
}

fn encode_name_record(record: &NameRecord) -> Vec<u8> {
    let mut writer = RecordWriter::new();
    writer
        .put_i32(record.oid)
        .put_str(&record.name)
        .put_bool(record.deleted);
    writer.finish()
}

/// The name system table (OID 0): records `(oid, name, deleted)` on the
/// name table's data pages. Deletion is logical; OIDs are never reused.
pub struct TableOidMapping {
    cache: Arc<dyn PageStore>,
    directory: Arc<dyn TablePageDirectory>,
    memo: Mutex<HashMap<String, Oid>>,
}

impl TableOidMapping {
    pub fn new(cache: Arc<dyn PageStore>, directory: Arc<dyn TablePageDirectory>) -> Self {
        TableOidMapping {
            cache,
            directory,
            memo: Mutex::new(HashMap::new()),
        }
    }

    /// Scans the name table; memoizes live hits.
    pub fn lookup(&self, name: &str) -> Result<Option<Oid>> {
        if let Some(&oid) = self.memo.lock().get(name) {
            return Ok(Some(oid));
        }
        for page_id in self.directory.pages(NAME_TABLE_OID)? {
            let handle = self.cache.get_and_pin(page_id)?;
            let guard = handle.read();
            let page = SlottedPage::new(&guard[..], BASE_HEADER);
            for (_, record) in page.all_records() {
                if let GetResult::Ok(bytes) = record {
                    let record = decode_name_record(bytes);
                    if !record.deleted && record.name == name {
                        self.memo.lock().insert(record.name, record.oid);
                        return Ok(Some(record.oid));
                    }
                }
            }
        }
        Ok(None)
    }

    /// Assigns `max(oid) + 1` — deleted names included, so ids stay unique
    /// forever — and appends the record to the first name page with room.
    pub fn create(&self, name: &str) -> Result<Oid> {
        if self.lookup(name)?.is_some() {
            return Err(EngineError::TableExists(name.to_string()));
        }

        let mut max_oid = ATTRIBUTE_TABLE_OID;
        let name_pages = self.directory.pages(NAME_TABLE_OID)?;
        for &page_id in &name_pages {
            let handle = self.cache.get_and_pin(page_id)?;
            let guard = handle.read();
            let page = SlottedPage::new(&guard[..], BASE_HEADER);
            for (_, record) in page.all_records() {
                if let GetResult::Ok(bytes) = record {
                    max_oid = max_oid.max(decode_name_record(bytes).oid);
                }
            }
        }
        let oid = max_oid + 1;
        // The chained-catalog counter descends through the same id space;
        // past its current position the page already belongs to some
        // table's chain.
        if oid >= RESERVED_PAGES || oid > next_catalog_page(&self.cache)? {
            return Err(EngineError::CatalogOverflow(NAME_TABLE_OID));
        }

        let entry = encode_name_record(&NameRecord {
            oid,
            name: name.to_string(),
            deleted: false,
        });
        let mut appended = false;
        for &page_id in &name_pages {
            let mut handle = self.cache.get_and_pin(page_id)?;
            let mut guard = handle.write()?;
            let mut page = SlottedPage::new(&mut guard[..], BASE_HEADER);
            if matches!(page.put_record(&entry, NEW_SLOT), PutResult::Ok(_)) {
                appended = true;
                break;
            }
        }
        if !appended {
            let page_id = self.directory.add_pages(NAME_TABLE_OID, 1)?;
            let mut handle = self.cache.get_and_pin(page_id)?;
            let mut guard = handle.write()?;
            let mut page = SlottedPage::new(&mut guard[..], BASE_HEADER);
            if !matches!(page.put_record(&entry, NEW_SLOT), PutResult::Ok(_)) {
                return Err(EngineError::CatalogOverflow(NAME_TABLE_OID));
            }
        }

        self.memo.lock().insert(name.to_string(), oid);
        debug!("table '{name}' created with oid {oid}");
        Ok(oid)
    }

    /// Flips the record's deleted flag in place and drops the memo entry.
    pub fn delete(&self, name: &str) -> Result<()> {
        for page_id in self.directory.pages(NAME_TABLE_OID)? {
            let mut handle = self.cache.get_and_pin(page_id)?;
            let mut guard = handle.write()?;
            let mut page = SlottedPage::new(&mut guard[..], BASE_HEADER);
            let slots = page.directory_size() as i32;
            for slot in 0..slots {
                let record = match page.get_record(slot) {
                    GetResult::Ok(bytes) => decode_name_record(bytes),
                    _ => continue,
                };
                if !record.deleted && record.name == name {
                    let entry = encode_name_record(&NameRecord {
                        deleted: true,
                        ..record
                    });
                    page.put_record(&entry, slot);
                    self.memo.lock().remove(name);
                    return Ok(());
                }
            }
        }
        Err(EngineError::TableNotFound(name.to_string()))
    }
}
