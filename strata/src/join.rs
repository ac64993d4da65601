//! Join operators: naive and block nested loops, hash join with a
//! small-outer fallback, and sort-merge. All share one operand shape and
//! emit lazy sequences of `(left_bytes, right_bytes)` pairs; `close` drops
//! intermediate tables and pinned pages.

use std::collections::VecDeque;
use std::hash::Hash;
use std::sync::Arc;

use log::debug;

use substrate::page::BASE_HEADER;
use substrate::{GetResult, PageId, SlottedPage};

use crate::access::{RecordScan, Tables};
use crate::errors::Result;
use crate::hash::{HashPartitioner, HashedTable};
use crate::sort::{KeyFn, MergeSort, TableCursor};

/// Everything a join key needs across the three algorithm families.
pub trait JoinKey: Ord + Hash + Eq + Clone + Send + Sync + 'static {}
impl<T: Ord + Hash + Eq + Clone + Send + Sync + 'static> JoinKey for T {}

/// One side of a join: a table plus its key extractor.
pub struct JoinOperand<K> {
    pub table: String,
    pub key: Arc<KeyFn<K>>,
}

impl<K> JoinOperand<K> {
    pub fn new(table: impl Into<String>, key: Arc<KeyFn<K>>) -> Self {
        JoinOperand {
            table: table.into(),
            key,
        }
    }
}

pub type JoinPair = (Vec<u8>, Vec<u8>);

/// Join algorithm tag, chosen at construction.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum JoinKind {
    /// One outer record at a time, rescanning the inner side. A reference
    /// path, useful as a correctness oracle.
    NestedLoops,
    BlockNestedLoops,
    Hash,
    SortMerge,
}

/// Builds the join chosen by `kind` over the two operands.
pub fn join<K: JoinKey>(
    kind: JoinKind,
    tables: &Arc<Tables>,
    left: JoinOperand<K>,
    right: JoinOperand<K>,
) -> Result<JoinRows<K>> {
    Ok(match kind {
        JoinKind::NestedLoops => JoinRows::Naive(NaiveNestedLoops::open(tables, left, right)?),
        JoinKind::BlockNestedLoops => {
            JoinRows::Block(BlockNestedLoops::open(tables, left, right)?)
        }
        JoinKind::Hash => JoinRows::Hash(HashJoin::open(tables, left, right)?),
        JoinKind::SortMerge => JoinRows::SortMerge(SortMergeJoin::open(tables, left, right)?),
    })
}

/// A join's output: a finite, non-restartable sequence of byte pairs.
pub enum JoinRows<K: JoinKey> {
    Naive(NaiveNestedLoops<K>),
    Block(BlockNestedLoops<K>),
    Hash(HashJoin<K>),
    SortMerge(SortMergeJoin<K>),
}

impl<K: JoinKey> JoinRows<K> {
    pub fn close(&mut self) -> Result<()> {
        match self {
            JoinRows::Naive(_) | JoinRows::Block(_) => Ok(()),
            JoinRows::Hash(join) => join.close(),
            JoinRows::SortMerge(join) => join.close(),
        }
    }
}

impl<K: JoinKey> Iterator for JoinRows<K> {
    type Item = Result<JoinPair>;

    fn next(&mut self) -> Option<Self::Item> {
        match self {
            JoinRows::Naive(join) => join.next(),
            JoinRows::Block(join) => join.next(),
            JoinRows::Hash(join) => join.next(),
            JoinRows::SortMerge(join) => join.next(),
        }
    }
}

impl<K: JoinKey> Drop for JoinRows<K> {
    fn drop(&mut self) {
        let _ = self.close();
    }
}

/// The naive variant: rescans the inner table once per outer record.
pub struct NaiveNestedLoops<K> {
    tables: Arc<Tables>,
    right_table: String,
    right_key: Arc<KeyFn<K>>,
    outer: RecordScan,
    outer_key: Arc<KeyFn<K>>,
    current: Option<(K, Vec<u8>)>,
    inner: Option<RecordScan>,
}

impl<K: JoinKey> NaiveNestedLoops<K> {
    fn open(tables: &Arc<Tables>, left: JoinOperand<K>, right: JoinOperand<K>) -> Result<Self> {
        Ok(NaiveNestedLoops {
            tables: tables.clone(),
            outer: tables.scan_records(&left.table)?,
            outer_key: left.key,
            right_table: right.table,
            right_key: right.key,
            current: None,
            inner: None,
        })
    }
}

impl<K: JoinKey> Iterator for NaiveNestedLoops<K> {
    type Item = Result<JoinPair>;

    fn next(&mut self) -> Option<Self::Item> {
        loop {
            if self.current.is_none() {
                let bytes = match self.outer.next()? {
                    Ok(bytes) => bytes,
                    Err(error) => return Some(Err(error)),
                };
                self.current = Some(((self.outer_key)(&bytes), bytes));
                self.inner = match self.tables.scan_records(&self.right_table) {
                    Ok(scan) => Some(scan),
                    Err(error) => return Some(Err(error)),
                };
            }
            let inner = self.inner.as_mut().expect("inner scan exists with a current record");
            for record in inner.by_ref() {
                let bytes = match record {
                    Ok(bytes) => bytes,
                    Err(error) => return Some(Err(error)),
                };
                let (key, left_bytes) = self.current.as_ref().expect("current record");
                if (self.right_key)(&bytes) == *key {
                    return Some(Ok((left_bytes.clone(), bytes)));
                }
            }
            self.current = None;
            self.inner = None;
        }
    }
}

/// Block nested loops: the outer side is consumed in chunks of
/// `capacity - 1` pages, the inner side scanned once per chunk.
pub struct BlockNestedLoops<K> {
    tables: Arc<Tables>,
    right_table: String,
    right_key: Arc<KeyFn<K>>,
    left_key: Arc<KeyFn<K>>,
    left_pages: Vec<PageId>,
    chunk_pages: usize,
    next_page: usize,
    chunk: Vec<(K, Vec<u8>)>,
    inner: Option<RecordScan>,
    pending: VecDeque<JoinPair>,
}

impl<K: JoinKey> BlockNestedLoops<K> {
    fn open(tables: &Arc<Tables>, left: JoinOperand<K>, right: JoinOperand<K>) -> Result<Self> {
        Ok(BlockNestedLoops {
            left_pages: tables.pages_of(&left.table)?,
            chunk_pages: tables.capacity().saturating_sub(1).max(1),
            tables: tables.clone(),
            right_table: right.table,
            right_key: right.key,
            left_key: left.key,
            next_page: 0,
            chunk: Vec::new(),
            inner: None,
            pending: VecDeque::new(),
        })
    }

    fn load_chunk(&mut self) -> Result<()> {
        let end = (self.next_page + self.chunk_pages).min(self.left_pages.len());
        for &page_id in &self.left_pages[self.next_page..end] {
            let handle = self.tables.cache().get_and_pin(page_id)?;
            let guard = handle.read();
            let page = SlottedPage::new(&guard[..], BASE_HEADER);
            for (_, record) in page.all_records() {
                if let GetResult::Ok(bytes) = record {
                    self.chunk.push(((self.left_key)(bytes), bytes.to_vec()));
                }
            }
        }
        self.next_page = end;
        Ok(())
    }
}

impl<K: JoinKey> Iterator for BlockNestedLoops<K> {
    type Item = Result<JoinPair>;

    fn next(&mut self) -> Option<Self::Item> {
        loop {
            if let Some(pair) = self.pending.pop_front() {
                return Some(Ok(pair));
            }
            match &mut self.inner {
                Some(scan) => match scan.next() {
                    Some(Ok(bytes)) => {
                        let right_key = (self.right_key)(&bytes);
                        for (left_key, left_bytes) in &self.chunk {
                            if *left_key == right_key {
                                self.pending.push_back((left_bytes.clone(), bytes.clone()));
                            }
                        }
                    }
                    Some(Err(error)) => return Some(Err(error)),
                    None => {
                        self.inner = None;
                        self.chunk.clear();
                    }
                },
                None => {
                    if self.next_page >= self.left_pages.len() {
                        return None;
                    }
                    if let Err(error) = self.load_chunk() {
                        return Some(Err(error));
                    }
                    if self.chunk.is_empty() {
                        continue;
                    }
                    self.inner = match self.tables.scan_records(&self.right_table) {
                        Ok(scan) => Some(scan),
                        Err(error) => return Some(Err(error)),
                    };
                }
            }
        }
    }
}

/// The fraction of the cache a small outer side may occupy before the hash
/// join bothers partitioning.
const HASH_FALLBACK_FILL: f64 = 0.8;

/// Hash join: both sides are hashed to the same bucket count, then matching
/// buckets are joined pairwise with block nested loops. An outer side that
/// already fits the cache falls back to plain block nested loops.
pub struct HashJoin<K: JoinKey> {
    mode: HashJoinMode<K>,
}

enum HashJoinMode<K: JoinKey> {
    Fallback(Box<BlockNestedLoops<K>>),
    Partitioned {
        tables: Arc<Tables>,
        left: HashedTable<K>,
        right: HashedTable<K>,
        left_key: Arc<KeyFn<K>>,
        right_key: Arc<KeyFn<K>>,
        next_bucket: usize,
        current: Option<Box<BlockNestedLoops<K>>>,
    },
}

impl<K: JoinKey> HashJoin<K> {
    fn open(tables: &Arc<Tables>, left: JoinOperand<K>, right: JoinOperand<K>) -> Result<Self> {
        let outer_pages = tables.page_count(&left.table)?;
        let window = ((tables.capacity() as f64 * HASH_FALLBACK_FILL) as usize).max(1);
        if outer_pages <= window {
            debug!(
                "hash join: outer '{}' fits {outer_pages}/{window} pages, nested loops",
                left.table
            );
            return Ok(HashJoin {
                mode: HashJoinMode::Fallback(Box::new(BlockNestedLoops::open(
                    tables, left, right,
                )?)),
            });
        }

        let buckets = outer_pages.div_ceil(window) + 1;
        debug!(
            "hash join: partitioning '{}' and '{}' into {buckets} buckets",
            left.table, right.table
        );
        let left_hashed = HashPartitioner::new(tables.clone(), left.key.clone())
            .build(&left.table, buckets)?;
        let right_hashed = HashPartitioner::new(tables.clone(), right.key.clone())
            .build(&right.table, buckets)?;
        Ok(HashJoin {
            mode: HashJoinMode::Partitioned {
                tables: tables.clone(),
                left: left_hashed,
                right: right_hashed,
                left_key: left.key,
                right_key: right.key,
                next_bucket: 0,
                current: None,
            },
        })
    }

    fn close(&mut self) -> Result<()> {
        if let HashJoinMode::Partitioned {
            left,
            right,
            current,
            ..
        } = &mut self.mode
        {
            *current = None;
            left.close()?;
            right.close()?;
        }
        Ok(())
    }
}

impl<K: JoinKey> Iterator for HashJoin<K> {
    type Item = Result<JoinPair>;

    fn next(&mut self) -> Option<Self::Item> {
        match &mut self.mode {
            HashJoinMode::Fallback(join) => join.next(),
            HashJoinMode::Partitioned {
                tables,
                left,
                right,
                left_key,
                right_key,
                next_bucket,
                current,
            } => loop {
                if let Some(join) = current {
                    match join.next() {
                        Some(pair) => return Some(pair),
                        None => *current = None,
                    }
                }
                if *next_bucket >= left.buckets().len() {
                    return None;
                }
                let bucket = *next_bucket;
                *next_bucket += 1;
                let left_bucket = &left.buckets()[bucket];
                let right_bucket = &right.buckets()[bucket];
                if left_bucket.page_count == 0 || right_bucket.page_count == 0 {
                    continue;
                }
                let pair_join = BlockNestedLoops::open(
                    tables,
                    JoinOperand::new(left_bucket.table.clone(), left_key.clone()),
                    JoinOperand::new(right_bucket.table.clone(), right_key.clone()),
                );
                match pair_join {
                    Ok(join) => *current = Some(Box::new(join)),
                    Err(error) => return Some(Err(error)),
                }
            },
        }
    }
}

/// Sort-merge join: sort both sides, advance the smaller key, and walk the
/// right side's ties with a secondary cursor on key equality.
pub struct SortMergeJoin<K: JoinKey> {
    tables: Arc<Tables>,
    sorted_left: String,
    sorted_right: String,
    left: TableCursor<K>,
    right: TableCursor<K>,
    pending: VecDeque<JoinPair>,
    closed: bool,
}

impl<K: JoinKey> SortMergeJoin<K> {
    fn open(tables: &Arc<Tables>, left: JoinOperand<K>, right: JoinOperand<K>) -> Result<Self> {
        let sorted_left = MergeSort::new(tables.clone(), left.key.clone()).sort(&left.table)?;
        let sorted_right = MergeSort::new(tables.clone(), right.key.clone()).sort(&right.table)?;
        let left_cursor = TableCursor::open(tables, &sorted_left, left.key)?;
        let right_cursor = TableCursor::open(tables, &sorted_right, right.key)?;
        Ok(SortMergeJoin {
            tables: tables.clone(),
            sorted_left,
            sorted_right,
            left: left_cursor,
            right: right_cursor,
            pending: VecDeque::new(),
            closed: false,
        })
    }

    fn close(&mut self) -> Result<()> {
        if self.closed {
            return Ok(());
        }
        self.closed = true;
        self.tables.delete_table(&self.sorted_left)?;
        self.tables.delete_table(&self.sorted_right)?;
        Ok(())
    }

    fn step(&mut self) -> Result<bool> {
        let Some(left_key) = self.left.top().map(|(key, _)| key.clone()) else {
            return Ok(false);
        };
        let Some(right_key) = self.right.top().map(|(key, _)| key.clone()) else {
            return Ok(false);
        };

        if left_key < right_key {
            self.left.pull()?;
        } else if right_key < left_key {
            self.right.pull()?;
        } else {
            // Walk every right-side tie for the current left record with a
            // secondary cursor starting at the right cursor's position.
            let left_bytes = self
                .left
                .top()
                .map(|(_, bytes)| bytes.clone())
                .expect("left top exists");
            let mut ties = self.right.reopened()?;
            while let Some((key, bytes)) = ties.top() {
                if *key != left_key {
                    break;
                }
                self.pending.push_back((left_bytes.clone(), bytes.clone()));
                ties.pull()?;
            }
            self.left.pull()?;
        }
        Ok(true)
    }
}

impl<K: JoinKey> Iterator for SortMergeJoin<K> {
    type Item = Result<JoinPair>;

    fn next(&mut self) -> Option<Self::Item> {
        loop {
            if let Some(pair) = self.pending.pop_front() {
                return Some(Ok(pair));
            }
            match self.step() {
                Ok(true) => {}
                Ok(false) => return None,
                Err(error) => return Some(Err(error)),
            }
        }
    }
}
