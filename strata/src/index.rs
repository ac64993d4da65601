//! B-tree indexes, built bottom-up from a sorted `(key, data page)` stream.
//!
//! Leaf pages are dense and singly linked (terminal link `i32::MIN`). A key
//! with more than one page reference stores its list as an overflow run in a
//! companion table: a head record `(run_id, length)` followed by `(-1, page)`
//! continuations, possibly across pages. Leaf records are
//! `(key, value, discriminator)` — discriminator 0 means the value is a data
//! page id, anything else means the value is the negated overflow head page
//! and the discriminator is the run id.

use std::marker::PhantomData;
use std::sync::Arc;

use log::debug;

use substrate::{GetResult, PageId, PutResult, SlottedPage, NEW_SLOT};

use crate::access::Tables;
use crate::catalog::Oid;
use crate::errors::{EngineError, Result};
use crate::record::{RecordReader, RecordWriter};
use crate::sort::MergeSort;

/// Node pages carry an 8-byte header: the directory-size word plus the
/// next-leaf link.
const NODE_HEADER: usize = 8;
const FIELD_NEXT_LEAF: usize = 0;

/// Terminal next-leaf link.
pub const LEAF_END: PageId = i32::MIN;

/// Keys an index can be built over: ordered, and encodable as a record
/// prefix.
pub trait IndexKey: Ord + Clone + Send + Sync + 'static {
    fn encode(&self, writer: &mut RecordWriter);
    fn decode(reader: &mut RecordReader) -> Self;
}

impl IndexKey for i32 {
    fn encode(&self, writer: &mut RecordWriter) {
        writer.put_i32(*self);
    }

    fn decode(reader: &mut RecordReader) -> Self {
        reader.get_i32()
    }
}

impl IndexKey for String {
    fn encode(&self, writer: &mut RecordWriter) {
        writer.put_str(self);
    }

    fn decode(reader: &mut RecordReader) -> Self {
        reader.get_str()
    }
}

fn node_record<K: IndexKey>(key: &K, value: i32, discriminator: i32) -> Vec<u8> {
    let mut writer = RecordWriter::new();
    key.encode(&mut writer);
    writer.put_i32(value).put_i32(discriminator);
    writer.finish()
}

fn decode_node_record<K: IndexKey>(bytes: &[u8]) -> (K, i32, i32) {
    let mut reader = RecordReader::new(bytes);
    let key = K::decode(&mut reader);
    (key, reader.get_i32(), reader.get_i32())
}

/// Writes one level of the tree left to right, promoting the smallest key
/// of every completed page.
struct LevelWriter<'a, K: IndexKey> {
    tables: &'a Tables,
    oid: Oid,
    leaf: bool,
    current: Option<PageId>,
    first_key: Option<K>,
    promotions: Vec<(K, PageId)>,
}

impl<'a, K: IndexKey> LevelWriter<'a, K> {
    fn new(tables: &'a Tables, oid: Oid, leaf: bool) -> Self {
        LevelWriter {
            tables,
            oid,
            leaf,
            current: None,
            first_key: None,
            promotions: Vec::new(),
        }
    }

    fn fresh_page(&self) -> Result<PageId> {
        let page_id = self.tables.add_pages(self.oid, 1)?;
        let mut handle = self.tables.cache().get_and_pin(page_id)?;
        let mut guard = handle.write()?;
        let mut page = SlottedPage::new(&mut guard[..], NODE_HEADER);
        page.set_header_field(FIELD_NEXT_LEAF, LEAF_END);
        Ok(page_id)
    }

    fn push(&mut self, key: &K, value: i32, discriminator: i32) -> Result<()> {
        let record = node_record(key, value, discriminator);
        loop {
            let page_id = match self.current {
                Some(page_id) => page_id,
                None => {
                    let fresh = self.fresh_page()?;
                    self.current = Some(fresh);
                    fresh
                }
            };

            let (appended, was_empty) = {
                let mut handle = self.tables.cache().get_and_pin(page_id)?;
                let mut guard = handle.write()?;
                let mut page = SlottedPage::new(&mut guard[..], NODE_HEADER);
                let was_empty = page.directory_size() == 0;
                (
                    matches!(page.put_record(&record, NEW_SLOT), PutResult::Ok(_)),
                    was_empty,
                )
            };
            if appended {
                if self.first_key.is_none() {
                    self.first_key = Some(key.clone());
                }
                return Ok(());
            }
            if was_empty {
                return Err(EngineError::RecordTooLarge {
                    page: page_id,
                    size: record.len(),
                });
            }

            // The page filled: promote its smallest key, link in the next
            // page and continue there.
            let fresh = self.fresh_page()?;
            if self.leaf {
                let mut handle = self.tables.cache().get_and_pin(page_id)?;
                let mut guard = handle.write()?;
                SlottedPage::new(&mut guard[..], NODE_HEADER)
                    .set_header_field(FIELD_NEXT_LEAF, fresh);
            }
            let promoted = self.first_key.take().expect("a filled page has a first key");
            self.promotions.push((promoted, page_id));
            self.current = Some(fresh);
        }
    }

    /// Closes the level, promoting the final partial page.
    fn finish(mut self) -> Result<Vec<(K, PageId)>> {
        if let Some(page_id) = self.current.take() {
            let first = self.first_key.take().expect("an open page has a first key");
            self.promotions.push((first, page_id));
        }
        Ok(self.promotions)
    }
}

/// A built (or reopened) B-tree index over one table's key.
pub struct BTreeIndex<K: IndexKey> {
    tables: Arc<Tables>,
    name: String,
    root: PageId,
    depth: u32,
    _key: PhantomData<K>,
}

fn overflow_table(index: &str) -> String {
    format!("{index}#ovf")
}

fn meta_table(index: &str) -> String {
    format!("{index}#meta")
}

fn aux_table(index: &str) -> String {
    format!("{index}#aux")
}

impl<K: IndexKey> BTreeIndex<K> {
    /// Builds an index named `index` over `table`, extracting the key from
    /// each record with `key_of`.
    pub fn build<F>(tables: &Arc<Tables>, table: &str, index: &str, key_of: F) -> Result<Self>
    where
        F: Fn(&[u8]) -> K + Send + Sync + 'static,
    {
        // Phase 1: emit (key, data page) pairs into an auxiliary table.
        let aux = aux_table(index);
        tables.create_table(&aux)?;
        {
            let mut appender = tables.appender(&aux)?;
            for handle in tables.scan_pages(table)? {
                let handle = handle?;
                let page_id = handle.id();
                let guard = handle.read();
                let page = SlottedPage::new(&guard[..], substrate::page::BASE_HEADER);
                for (_, record) in page.all_records() {
                    if let GetResult::Ok(bytes) = record {
                        let mut writer = RecordWriter::new();
                        key_of(bytes).encode(&mut writer);
                        writer.put_i32(page_id);
                        appender.append(&writer.finish())?;
                    }
                }
            }
        }

        // Phase 2: sort the pairs by key.
        let sort = MergeSort::new(
            tables.clone(),
            Arc::new(|bytes: &[u8]| K::decode(&mut RecordReader::new(bytes))),
        );
        let sorted = sort.sort(&aux)?;

        // Phase 3: stream the sorted pairs into dense leaves, spilling
        // non-unique key groups into overflow runs.
        tables.create_table(index)?;
        let node_oid = tables.oid(index)?;
        let overflow = overflow_table(index);
        tables.create_table(&overflow)?;

        let mut leaves = LevelWriter::new(tables, node_oid, true);
        {
            let mut overflow_appender = tables.appender(&overflow)?;
            let mut next_run: i32 = 1;
            let mut group: Option<(K, Vec<PageId>)> = None;

            let mut emit = |leaves: &mut LevelWriter<'_, K>,
                            key: K,
                            pages: Vec<PageId>|
             -> Result<()> {
                if pages.len() == 1 {
                    return leaves.push(&key, pages[0], 0);
                }
                let run_id = next_run;
                next_run += 1;
                let mut head = RecordWriter::new();
                head.put_i32(run_id).put_i32(pages.len() as i32);
                let (head_page, _) = overflow_appender.append(&head.finish())?;
                for page in pages {
                    let mut entry = RecordWriter::new();
                    entry.put_i32(-1).put_i32(page);
                    overflow_appender.append(&entry.finish())?;
                }
                leaves.push(&key, -head_page, run_id)
            };

            for record in tables.scan_records(&sorted)? {
                let bytes = record?;
                let mut reader = RecordReader::new(&bytes);
                let key = K::decode(&mut reader);
                let page = reader.get_i32();
                group = match group.take() {
                    None => Some((key, vec![page])),
                    Some((current, mut pages)) if current == key => {
                        pages.push(page);
                        Some((current, pages))
                    }
                    Some((current, pages)) => {
                        emit(&mut leaves, current, pages)?;
                        Some((key, vec![page]))
                    }
                };
            }
            if let Some((key, pages)) = group {
                emit(&mut leaves, key, pages)?;
            }
        }

        // Phase 4: raise internal levels until a single root remains. An
        // empty table still gets a single (empty) root leaf.
        let mut promotions = leaves.finish()?;
        let (root, depth) = if promotions.is_empty() {
            let writer = LevelWriter::<K>::new(tables, node_oid, true);
            (writer.fresh_page()?, 1)
        } else {
            let mut depth: u32 = 1;
            while promotions.len() > 1 {
                let mut level = LevelWriter::new(tables, node_oid, false);
                for (key, child) in &promotions {
                    level.push(key, *child, 0)?;
                }
                promotions = level.finish()?;
                depth += 1;
            }
            (promotions[0].1, depth)
        };

        // Phase 5: persist (root, depth) and drop the temporaries.
        let meta = meta_table(index);
        tables.create_table(&meta)?;
        let mut meta_writer = RecordWriter::new();
        meta_writer.put_i32(root).put_i32(depth as i32);
        tables.appender(&meta)?.append(&meta_writer.finish())?;

        tables.delete_table(&aux)?;
        tables.delete_table(&sorted)?;

        debug!("index '{index}': root {root}, depth {depth}");
        Ok(BTreeIndex {
            tables: tables.clone(),
            name: index.to_string(),
            root,
            depth,
            _key: PhantomData,
        })
    }

    /// Opens an index previously built under `name`.
    pub fn open(tables: &Arc<Tables>, name: &str) -> Result<Self> {
        let meta = meta_table(name);
        if !tables.table_exists(&meta)? {
            return Err(EngineError::IndexNotFound(name.to_string()));
        }
        let mut records = tables.scan_records(&meta)?;
        let bytes = records
            .next()
            .ok_or_else(|| EngineError::IndexCorrupt(format!("index '{name}' has no meta record")))??;
        let mut reader = RecordReader::new(&bytes);
        let root = reader.get_i32();
        let depth = reader.get_i32() as u32;
        Ok(BTreeIndex {
            tables: tables.clone(),
            name: name.to_string(),
            root,
            depth,
            _key: PhantomData,
        })
    }

    pub fn root(&self) -> PageId {
        self.root
    }

    pub fn depth(&self) -> u32 {
        self.depth
    }

    /// In an internal node, the child under the greatest separator key that
    /// is ≤ the target; the first child when every separator is greater.
    fn descend(&self, page_id: PageId, key: &K) -> Result<PageId> {
        let handle = self.tables.cache().get_and_pin(page_id)?;
        let guard = handle.read();
        let page = SlottedPage::new(&guard[..], NODE_HEADER);
        let slots = page.directory_size() as i32;
        if slots == 0 {
            return Err(EngineError::IndexCorrupt(format!(
                "empty internal node {page_id} in index '{}'",
                self.name
            )));
        }

        let record_key = |slot: i32| -> (K, i32) {
            match page.get_record(slot) {
                GetResult::Ok(bytes) => {
                    let (key, value, _) = decode_node_record::<K>(bytes);
                    (key, value)
                }
                _ => unreachable!("internal nodes have no tombstones"),
            }
        };

        // Binary search for the rightmost separator ≤ key.
        let (mut low, mut high) = (0, slots);
        while low < high {
            let mid = low + (high - low) / 2;
            if record_key(mid).0 <= *key {
                low = mid + 1;
            } else {
                high = mid;
            }
        }
        let chosen = if low == 0 { 0 } else { low - 1 };
        Ok(record_key(chosen).1)
    }

    /// Reads an overflow run: the head `(run_id, length)` record on the head
    /// page, then `length` `(-1, page)` continuations, walking into the
    /// following overflow pages as needed.
    fn read_run(&self, head_page: PageId, run_id: i32, out: &mut Vec<PageId>) -> Result<()> {
        let overflow = overflow_table(&self.name);
        let pages = self.tables.pages_of(&overflow)?;
        let start = pages
            .iter()
            .position(|&page| page == head_page)
            .ok_or_else(|| {
                EngineError::IndexCorrupt(format!(
                    "overflow head page {head_page} missing from '{overflow}'"
                ))
            })?;

        let mut remaining: Option<i32> = None;
        for &page_id in &pages[start..] {
            let handle = self.tables.cache().get_and_pin(page_id)?;
            let guard = handle.read();
            let page = SlottedPage::new(&guard[..], substrate::page::BASE_HEADER);
            for (_, record) in page.all_records() {
                let GetResult::Ok(bytes) = record else { continue };
                let mut reader = RecordReader::new(bytes);
                let marker = reader.get_i32();
                let value = reader.get_i32();
                match remaining {
                    None => {
                        if marker == run_id {
                            remaining = Some(value);
                        }
                    }
                    Some(0) => return Ok(()),
                    Some(left) => {
                        if marker != -1 {
                            return Err(EngineError::IndexCorrupt(format!(
                                "run {run_id} truncated in '{overflow}'"
                            )));
                        }
                        out.push(value);
                        remaining = Some(left - 1);
                    }
                }
            }
            if remaining == Some(0) {
                return Ok(());
            }
        }
        match remaining {
            Some(0) => Ok(()),
            _ => Err(EngineError::IndexCorrupt(format!(
                "run {run_id} not fully present in '{overflow}'"
            ))),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Every data page reference recorded under `key`, one entry per indexed
    /// record.
    pub fn lookup(&self, key: &K) -> Result<Vec<PageId>> {
        let mut page_id = self.root;
        for _ in 1..self.depth {
            page_id = self.descend(page_id, key)?;
        }

        let mut results = Vec::new();
        let mut current = page_id;
        loop {
            let mut passed_key = false;
            let next = {
                let handle = self.tables.cache().get_and_pin(current)?;
                let guard = handle.read();
                let page = SlottedPage::new(&guard[..], NODE_HEADER);
                for (_, record) in page.all_records() {
                    let GetResult::Ok(bytes) = record else { continue };
                    let (entry_key, value, discriminator) = decode_node_record::<K>(bytes);
                    if entry_key < *key {
                        continue;
                    }
                    if entry_key > *key {
                        passed_key = true;
                        break;
                    }
                    if discriminator == 0 {
                        results.push(value);
                    } else {
                        self.read_run(-value, discriminator, &mut results)?;
                    }
                }
                page.header_field(FIELD_NEXT_LEAF)
            };
            if passed_key || next == LEAF_END {
                break;
            }
            current = next;
        }
        Ok(results)
    }
}
