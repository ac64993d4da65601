//! External multiway merge sort.
//!
//! Partition phase: read half the cache worth of pages, sort their records
//! in memory, write each sorted run to its own fresh table. Merge phase: one
//! buffered cursor per run, always emitting the minimum top key. The run
//! count is bounded by half the cache capacity; larger inputs are refused.

use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;

use log::debug;

use substrate::page::BASE_HEADER;
use substrate::{GetResult, PageHandle, PageId, PageStore, SlotId, SlottedPage};

use crate::access::Tables;
use crate::errors::{EngineError, Result};

/// A key extractor over raw record bytes.
pub type KeyFn<K> = dyn Fn(&[u8]) -> K + Send + Sync;

/// Pages a cursor prefetches ahead of its current position.
pub(crate) const CURSOR_WINDOW: usize = 10;

/// A buffered cursor over one table's live records, in page/slot order.
/// The current page stays pinned; upcoming pages are prefetched in windows.
/// Cursors release their pin when dropped.
pub(crate) struct TableCursor<K> {
    cache: Arc<dyn PageStore>,
    pages: Arc<Vec<PageId>>,
    key: Arc<KeyFn<K>>,
    window: usize,
    page_index: usize,
    slot: SlotId,
    handle: Option<PageHandle>,
    current: Option<(K, Vec<u8>)>,
    position: (usize, SlotId),
}

impl<K> TableCursor<K> {
    pub(crate) fn open(tables: &Tables, table: &str, key: Arc<KeyFn<K>>) -> Result<Self> {
        let pages = Arc::new(tables.pages_of(table)?);
        Self::open_at(tables.cache().clone(), pages, key, 0, 0)
    }

    fn open_at(
        cache: Arc<dyn PageStore>,
        pages: Arc<Vec<PageId>>,
        key: Arc<KeyFn<K>>,
        page_index: usize,
        slot: SlotId,
    ) -> Result<Self> {
        let mut cursor = TableCursor {
            cache,
            pages,
            key,
            window: CURSOR_WINDOW,
            page_index,
            slot,
            handle: None,
            current: None,
            position: (page_index, slot),
        };
        cursor.advance()?;
        Ok(cursor)
    }

    /// A second cursor positioned exactly at this cursor's current record.
    pub(crate) fn reopened(&self) -> Result<Self> {
        Self::open_at(
            self.cache.clone(),
            self.pages.clone(),
            self.key.clone(),
            self.position.0,
            self.position.1,
        )
    }

    pub(crate) fn top(&self) -> Option<&(K, Vec<u8>)> {
        self.current.as_ref()
    }

    /// Takes the current record and advances past it.
    pub(crate) fn pull(&mut self) -> Result<Option<(K, Vec<u8>)>> {
        let record = self.current.take();
        if record.is_some() {
            self.advance()?;
        }
        Ok(record)
    }

    /// Prefetches the longest consecutive page run inside the next window.
    fn prefetch(&self) -> Result<()> {
        let upcoming = &self.pages[self.page_index..self.pages.len().min(self.page_index + self.window)];
        let mut run = 1;
        while run < upcoming.len() && upcoming[run] == upcoming[run - 1] + 1 {
            run += 1;
        }
        if run >= 2 {
            self.cache.load(upcoming[0], run as u32)?;
        }
        Ok(())
    }

    fn advance(&mut self) -> Result<()> {
        loop {
            if self.handle.is_none() {
                if self.page_index >= self.pages.len() {
                    self.current = None;
                    return Ok(());
                }
                if self.page_index % self.window == 0 {
                    self.prefetch()?;
                }
                self.handle = Some(self.cache.get_and_pin(self.pages[self.page_index])?);
            }

            let mut slot = self.slot;
            let mut found = None;
            {
                let handle = self.handle.as_ref().expect("cursor holds its current page");
                let guard = handle.read();
                let page = SlottedPage::new(&guard[..], BASE_HEADER);
                let slots = page.directory_size() as SlotId;
                while slot < slots {
                    let candidate = slot;
                    slot += 1;
                    if let GetResult::Ok(bytes) = page.get_record(candidate) {
                        found = Some((candidate, (self.key)(bytes), bytes.to_vec()));
                        break;
                    }
                }
            }
            self.slot = slot;

            match found {
                Some((at, key, bytes)) => {
                    self.position = (self.page_index, at);
                    self.current = Some((key, bytes));
                    return Ok(());
                }
                None => {
                    self.handle = None;
                    self.page_index += 1;
                    self.slot = 0;
                }
            }
        }
    }
}

/// The external merge sort operator. `sort` writes a fresh table owned by
/// the caller and leaves the input untouched.
pub struct MergeSort<K: Ord + Clone> {
    tables: Arc<Tables>,
    key: Arc<KeyFn<K>>,
    temp_counter: AtomicU32,
}

impl<K: Ord + Clone> MergeSort<K> {
    pub fn new(tables: Arc<Tables>, key: Arc<KeyFn<K>>) -> Self {
        MergeSort {
            tables,
            key,
            temp_counter: AtomicU32::new(0),
        }
    }

    fn temp_name(&self, base: &str, tag: &str) -> String {
        let n = self.temp_counter.fetch_add(1, Ordering::SeqCst);
        format!("{base}#{tag}{n}")
    }

    fn flush_run(&self, base: &str, records: &mut Vec<(K, Vec<u8>)>) -> Result<String> {
        records.sort_by(|a, b| a.0.cmp(&b.0));
        let run = self.temp_name(base, "run");
        self.tables.create_table(&run)?;
        let mut appender = self.tables.appender(&run)?;
        for (_, bytes) in records.drain(..) {
            appender.append(&bytes)?;
        }
        Ok(run)
    }

    pub fn sort(&self, table: &str) -> Result<String> {
        let fan_in = (self.tables.capacity() / 2).max(1);

        // Partition phase.
        let mut runs = Vec::new();
        let mut records: Vec<(K, Vec<u8>)> = Vec::new();
        let mut chunk_pages = 0;
        for handle in self.tables.scan_pages(table)? {
            let handle = handle?;
            {
                let guard = handle.read();
                let page = SlottedPage::new(&guard[..], BASE_HEADER);
                for (_, record) in page.all_records() {
                    if let GetResult::Ok(bytes) = record {
                        records.push(((self.key)(bytes), bytes.to_vec()));
                    }
                }
            }
            chunk_pages += 1;
            if chunk_pages == fan_in {
                runs.push(self.flush_run(table, &mut records)?);
                chunk_pages = 0;
            }
        }
        if !records.is_empty() {
            runs.push(self.flush_run(table, &mut records)?);
        }
        debug!("sort of '{table}': {} runs, fan-in {fan_in}", runs.len());

        match runs.len() {
            0 => {
                // An empty input still produces an (empty) output table.
                let output = self.temp_name(table, "sorted");
                self.tables.create_table(&output)?;
                Ok(output)
            }
            1 => Ok(runs.pop().expect("one run")),
            n if n > fan_in => {
                for run in &runs {
                    self.tables.delete_table(run)?;
                }
                Err(EngineError::SortFanIn {
                    runs: n,
                    max: fan_in,
                })
            }
            _ => self.merge(table, runs),
        }
    }

    fn merge(&self, base: &str, runs: Vec<String>) -> Result<String> {
        let output = self.temp_name(base, "sorted");
        self.tables.create_table(&output)?;

        let mut cursors = Vec::with_capacity(runs.len());
        for run in &runs {
            cursors.push(TableCursor::open(&self.tables, run, self.key.clone())?);
        }

        let mut appender = self.tables.appender(&output)?;
        loop {
            let mut best: Option<usize> = None;
            for index in 0..cursors.len() {
                let Some((key, _)) = cursors[index].top() else {
                    continue;
                };
                best = match best {
                    None => Some(index),
                    Some(current) => {
                        let (best_key, _) = cursors[current].top().expect("best cursor has a top");
                        if key < best_key {
                            Some(index)
                        } else {
                            Some(current)
                        }
                    }
                };
            }
            let Some(winner) = best else { break };
            let (_, bytes) = cursors[winner].pull()?.expect("winner has a record");
            appender.append(&bytes)?;
        }
        drop(cursors);

        for run in &runs {
            self.tables.delete_table(run)?;
        }
        Ok(output)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::record::{RecordReader, RecordWriter};
    use substrate::{BufferCache, CacheConfig, MemStorage};

    fn tables(capacity: usize) -> Arc<Tables> {
        let storage = Arc::new(MemStorage::new());
        let cache: Arc<dyn PageStore> = Arc::new(BufferCache::new(
            storage,
            CacheConfig {
                capacity,
                ..CacheConfig::default()
            },
        ));
        Arc::new(Tables::open(cache).unwrap())
    }

    fn int_key() -> Arc<KeyFn<i32>> {
        Arc::new(|bytes: &[u8]| RecordReader::new(bytes).get_i32())
    }

    fn fill(tables: &Tables, name: &str, values: &[i32]) {
        tables.create_table(name).unwrap();
        let mut appender = tables.appender(name).unwrap();
        for &value in values {
            let mut writer = RecordWriter::new();
            writer.put_i32(value);
            appender.append(&writer.finish()).unwrap();
        }
    }

    fn scan_ints(tables: &Tables, name: &str) -> Vec<i32> {
        tables
            .scan_parsed(name, |bytes| RecordReader::new(bytes).get_i32())
            .unwrap()
            .map(|record| record.unwrap())
            .collect()
    }

    #[test]
    fn sorts_a_small_shuffled_table() {
        let tables = tables(8);
        fill(&tables, "nums", &[5, 3, 9, 1, 7, 2, 8, 4, 6, 0]);
        let sort = MergeSort::new(tables.clone(), int_key());
        let output = sort.sort("nums").unwrap();
        assert_eq!(scan_ints(&tables, &output), (0..10).collect::<Vec<_>>());
        // The input is untouched.
        assert_eq!(scan_ints(&tables, "nums").len(), 10);
    }

    #[test]
    fn sorted_output_is_a_permutation() {
        let tables = tables(6);
        let values: Vec<i32> = (0..3000).map(|i| (i * 769) % 3000).collect();
        fill(&tables, "perm", &values);
        let sort = MergeSort::new(tables.clone(), int_key());
        let output = sort.sort("perm").unwrap();

        let seen = scan_ints(&tables, &output);
        assert_eq!(seen.len(), values.len());
        assert!(seen.windows(2).all(|pair| pair[0] <= pair[1]));
        let mut expected = values.clone();
        expected.sort_unstable();
        assert_eq!(seen, expected);
    }

    #[test]
    fn empty_input_yields_an_empty_output_table() {
        let tables = tables(8);
        fill(&tables, "void", &[]);
        let sort = MergeSort::new(tables.clone(), int_key());
        let output = sort.sort("void").unwrap();
        assert_ne!(output, "void");
        assert!(scan_ints(&tables, &output).is_empty());
    }

    #[test]
    fn oversized_inputs_are_refused() {
        // Capacity 4: chunks of 2 pages, at most 2 runs, so 5+ pages refuse.
        let tables = tables(4);
        let values: Vec<i32> = (0..6000).rev().collect();
        fill(&tables, "big", &values);
        assert!(tables.page_count("big").unwrap() > 4);
        let sort = MergeSort::new(tables.clone(), int_key());
        assert!(matches!(
            sort.sort("big"),
            Err(EngineError::SortFanIn { .. })
        ));
    }

    #[test]
    fn cursor_reopens_at_its_position() {
        let tables = tables(8);
        fill(&tables, "walk", &[10, 20, 30, 40]);
        let mut cursor = TableCursor::open(&tables, "walk", int_key()).unwrap();
        cursor.pull().unwrap();
        assert_eq!(cursor.top().unwrap().0, 20);

        let mut twin = cursor.reopened().unwrap();
        assert_eq!(twin.top().unwrap().0, 20);
        twin.pull().unwrap();
        assert_eq!(twin.top().unwrap().0, 30);
        // The original cursor is unaffected.
        assert_eq!(cursor.top().unwrap().0, 20);
    }
}
