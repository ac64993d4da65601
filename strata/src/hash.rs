//! The hash partitioner: spreads a table's records over temporary bucket
//! tables by key hash, for bucket-local probing and partitioned joins.

use std::collections::hash_map::DefaultHasher;
use std::hash::{Hash, Hasher};
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;

use log::debug;

use crate::access::Tables;
use crate::errors::Result;
use crate::sort::KeyFn;

/// One bucket of a hash session.
#[derive(Debug, Clone)]
pub struct Bucket {
    /// 0-based bucket number.
    pub number: usize,
    /// The temporary table holding the bucket's records.
    pub table: String,
    pub page_count: usize,
}

/// Bucket placement: the hash is folded to its absolute (unsigned) value
/// before the modulo, in both build and probe paths.
fn bucket_of<K: Hash>(key: &K, buckets: usize) -> usize {
    let mut hasher = DefaultHasher::new();
    key.hash(&mut hasher);
    (hasher.finish() % buckets as u64) as usize
}

pub struct HashPartitioner<K: Hash + Eq> {
    tables: Arc<Tables>,
    key: Arc<KeyFn<K>>,
    temp_counter: AtomicU32,
}

impl<K: Hash + Eq> HashPartitioner<K> {
    pub fn new(tables: Arc<Tables>, key: Arc<KeyFn<K>>) -> Self {
        HashPartitioner {
            tables,
            key,
            temp_counter: AtomicU32::new(0),
        }
    }

    /// Hashes every record of `table` into `buckets` temporary tables.
    pub fn build(&self, table: &str, buckets: usize) -> Result<HashedTable<K>> {
        let buckets = buckets.max(1);
        let session = self.temp_counter.fetch_add(1, Ordering::SeqCst);

        let mut names = Vec::with_capacity(buckets);
        for number in 0..buckets {
            let name = format!("{table}#hash{session}-{number}");
            self.tables.create_table(&name)?;
            names.push(name);
        }

        {
            let mut appenders = Vec::with_capacity(buckets);
            for name in &names {
                appenders.push(self.tables.appender(name)?);
            }
            for record in self.tables.scan_records(table)? {
                let bytes = record?;
                let number = bucket_of(&(self.key)(&bytes), buckets);
                appenders[number].append(&bytes)?;
            }
        }

        let mut list = Vec::with_capacity(buckets);
        for (number, table) in names.into_iter().enumerate() {
            let page_count = self.tables.page_count(&table)?;
            list.push(Bucket {
                number,
                table,
                page_count,
            });
        }
        debug!(
            "hashed '{table}' into {buckets} buckets, {} pages total",
            list.iter().map(|b| b.page_count).sum::<usize>()
        );
        Ok(HashedTable {
            tables: self.tables.clone(),
            key: self.key.clone(),
            buckets: list,
            closed: false,
        })
    }
}

/// The result of a hash build: the bucket list plus bucket-local search.
/// Bucket tables are temporary and die with the session's `close`.
pub struct HashedTable<K: Hash + Eq> {
    tables: Arc<Tables>,
    key: Arc<KeyFn<K>>,
    buckets: Vec<Bucket>,
    closed: bool,
}

impl<K: Hash + Eq> HashedTable<K> {
    pub fn buckets(&self) -> &[Bucket] {
        &self.buckets
    }

    /// Scans only the key's bucket, returning every matching record.
    pub fn find(&self, key: &K) -> Result<Vec<Vec<u8>>> {
        let bucket = &self.buckets[bucket_of(key, self.buckets.len())];
        let mut matches = Vec::new();
        for record in self.tables.scan_records(&bucket.table)? {
            let bytes = record?;
            if (self.key)(&bytes) == *key {
                matches.push(bytes);
            }
        }
        Ok(matches)
    }

    /// Drops the bucket tables.
    pub fn close(&mut self) -> Result<()> {
        if self.closed {
            return Ok(());
        }
        self.closed = true;
        for bucket in &self.buckets {
            self.tables.delete_table(&bucket.table)?;
        }
        Ok(())
    }
}

impl<K: Hash + Eq> Drop for HashedTable<K> {
    fn drop(&mut self) {
        let _ = self.close();
    }
}
