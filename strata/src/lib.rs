//! # Strata Relational Layer
//! The relational layer of the StrataDB engine, built on the `substrate`
//! storage crate: record codec, catalog and table access, the physical
//! operators (external sort, hash partitioning, joins) and B-tree indexes.
//!
//! There is no ambient configuration: an [`Engine`] is assembled from an
//! explicit [`EngineConfig`] naming the storage variant, the cache policy
//! and the scheduler, and everything downstream receives its strategies
//! from it.

/// Table access: scans, appends, create/delete.
pub mod access;
/// The catalog: OID mapping and table page directories.
pub mod catalog;
/// Error types of the relational layer.
pub mod errors;
/// The hash partitioner.
pub mod hash;
/// B-tree index build and lookup.
pub mod index;
/// Join operators.
pub mod join;
/// The record codec.
pub mod record;
/// External multiway merge sort.
pub mod sort;

use std::path::PathBuf;
use std::sync::Arc;

use substrate::cache::{BufferCache, CacheConfig, NoneCache, PageStore};
use substrate::file_storage::{FileStorage, FileStorageConfig};
use substrate::scheduler::{make_scheduler, SchedulerKind};
use substrate::storage::{MemStorage, Storage};
use substrate::transaction::{RevertableStorage, TransactionManager};
use substrate::wal::{FileWal, NoopWal, Wal};

use crate::access::Tables;
use crate::catalog::{LinkedCatalog, SinglePageDirectory, TablePageDirectory};
use crate::errors::Result;
use crate::hash::HashPartitioner;
use crate::index::{BTreeIndex, IndexKey};
use crate::join::{join, JoinKind, JoinOperand, JoinRows};
use crate::sort::{KeyFn, MergeSort};

pub use crate::errors::EngineError;

/// Storage variant tag.
#[derive(Debug, Clone)]
pub enum StorageKind {
    Memory,
    File(FileStorageConfig),
}

/// Cache variant tag: a real cache with its config, or the pass-through.
#[derive(Debug, Clone)]
pub enum CacheKind {
    Buffered(CacheConfig),
    None,
}

/// Directory variant tag.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DirectoryKind {
    Linked,
    SinglePage,
}

#[derive(Debug, Clone)]
pub struct EngineConfig {
    pub storage: StorageKind,
    pub cache: CacheKind,
    pub directory: DirectoryKind,
    pub scheduler: SchedulerKind,
    /// Write-ahead log file; `None` keeps the no-op WAL.
    pub wal_path: Option<PathBuf>,
}

impl Default for EngineConfig {
    fn default() -> Self {
        EngineConfig {
            storage: StorageKind::Memory,
            cache: CacheKind::Buffered(CacheConfig::default()),
            directory: DirectoryKind::Linked,
            scheduler: SchedulerKind::TwoPhaseLocking,
            wal_path: None,
        }
    }
}

/// The assembled engine: storage under a revertable adapter, the cache, the
/// catalog-backed table space and the transaction manager, all wired from
/// one config.
pub struct Engine {
    storage: Arc<dyn Storage>,
    cache: Arc<dyn PageStore>,
    tables: Arc<Tables>,
    transactions: TransactionManager,
}

impl Engine {
    pub fn open(config: EngineConfig) -> Result<Self> {
        let base: Arc<dyn Storage> = match &config.storage {
            StorageKind::Memory => Arc::new(MemStorage::new()),
            StorageKind::File(file_config) => {
                Arc::new(FileStorage::open(file_config.clone())?)
            }
        };
        let revertable = Arc::new(RevertableStorage::new(base.clone()));
        let storage: Arc<dyn Storage> = revertable.clone();

        let cache: Arc<dyn PageStore> = match &config.cache {
            CacheKind::Buffered(cache_config) => {
                Arc::new(BufferCache::new(storage.clone(), cache_config.clone()))
            }
            CacheKind::None => Arc::new(NoneCache::new(storage.clone())),
        };

        let directory: Arc<dyn TablePageDirectory> = match config.directory {
            DirectoryKind::Linked => Arc::new(LinkedCatalog::bootstrap(cache.clone())?),
            DirectoryKind::SinglePage => Arc::new(SinglePageDirectory::bootstrap(cache.clone())?),
        };
        let tables = Arc::new(Tables::new(cache.clone(), directory));

        let wal: Box<dyn Wal> = match &config.wal_path {
            Some(path) => Box::new(FileWal::open(path)?),
            None => Box::new(NoopWal),
        };
        let transactions =
            TransactionManager::new(cache.clone(), make_scheduler(config.scheduler), wal);
        revertable.set_filter(transactions.revert_filter());

        Ok(Engine {
            storage: base,
            cache,
            tables,
            transactions,
        })
    }

    pub fn in_memory() -> Result<Self> {
        Self::open(EngineConfig::default())
    }

    pub fn tables(&self) -> &Arc<Tables> {
        &self.tables
    }

    pub fn cache(&self) -> &Arc<dyn PageStore> {
        &self.cache
    }

    /// The underlying storage's running access-cost total.
    pub fn access_cost(&self) -> f64 {
        self.storage.access_cost()
    }

    pub fn transactions(&self) -> &TransactionManager {
        &self.transactions
    }

    /// A sort operator over this engine's tables.
    pub fn sorter<K: Ord + Clone>(&self, key: Arc<KeyFn<K>>) -> MergeSort<K> {
        MergeSort::new(self.tables.clone(), key)
    }

    /// A hash partitioner over this engine's tables.
    pub fn hasher<K: std::hash::Hash + Eq>(&self, key: Arc<KeyFn<K>>) -> HashPartitioner<K> {
        HashPartitioner::new(self.tables.clone(), key)
    }

    /// The join chosen by `kind` over two operands.
    pub fn join<K: join::JoinKey>(
        &self,
        kind: JoinKind,
        left: JoinOperand<K>,
        right: JoinOperand<K>,
    ) -> Result<JoinRows<K>> {
        join(kind, &self.tables, left, right)
    }

    /// Builds a B-tree index over `table`.
    pub fn build_index<K: IndexKey, F>(
        &self,
        table: &str,
        index: &str,
        key_of: F,
    ) -> Result<BTreeIndex<K>>
    where
        F: Fn(&[u8]) -> K + Send + Sync + 'static,
    {
        BTreeIndex::build(&self.tables, table, index, key_of)
    }

    /// Opens an index built earlier in this table space.
    pub fn open_index<K: IndexKey>(&self, index: &str) -> Result<BTreeIndex<K>> {
        BTreeIndex::open(&self.tables, index)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::record::{RecordReader, RecordWriter};

    #[test]
    fn engine_wires_the_default_stack() {
        let engine = Engine::in_memory().unwrap();
        engine.tables().create_table("smoke").unwrap();
        let mut appender = engine.tables().appender("smoke").unwrap();
        let mut writer = RecordWriter::new();
        writer.put_i32(42);
        appender.append(&writer.finish()).unwrap();

        let values: Vec<i32> = engine
            .tables()
            .scan_parsed("smoke", |bytes| RecordReader::new(bytes).get_i32())
            .unwrap()
            .map(|record| record.unwrap())
            .collect();
        assert_eq!(values, vec![42]);
        assert!(engine.access_cost() > 0.0);
    }

    #[test]
    fn engine_over_file_storage_persists_tables() {
        let dir = tempfile::tempdir().unwrap();
        let mut file_config = FileStorageConfig::new(dir.path());
        file_config.segment_bytes = 64 * substrate::PAGE_SIZE as u64;

        {
            let engine = Engine::open(EngineConfig {
                storage: StorageKind::File(file_config.clone()),
                ..EngineConfig::default()
            })
            .unwrap();
            engine.tables().create_table("durable").unwrap();
            let mut appender = engine.tables().appender("durable").unwrap();
            let mut writer = RecordWriter::new();
            writer.put_str("survives");
            appender.append(&writer.finish()).unwrap();
            engine.cache().flush().unwrap();
        }

        let engine = Engine::open(EngineConfig {
            storage: StorageKind::File(file_config),
            ..EngineConfig::default()
        })
        .unwrap();
        let values: Vec<String> = engine
            .tables()
            .scan_parsed("durable", |bytes| RecordReader::new(bytes).get_str())
            .unwrap()
            .map(|record| record.unwrap())
            .collect();
        assert_eq!(values, vec!["survives".to_string()]);
    }

    #[test]
    fn none_cache_engine_still_serves_tables() {
        let engine = Engine::open(EngineConfig {
            cache: CacheKind::None,
            ..EngineConfig::default()
        })
        .unwrap();
        engine.tables().create_table("direct").unwrap();
        let mut appender = engine.tables().appender("direct").unwrap();
        let mut writer = RecordWriter::new();
        writer.put_i32(7);
        appender.append(&writer.finish()).unwrap();
        let count = engine.tables().scan_records("direct").unwrap().count();
        assert_eq!(count, 1);
    }

    #[test]
    fn single_page_directory_engine_round_trips() {
        let engine = Engine::open(EngineConfig {
            directory: DirectoryKind::SinglePage,
            ..EngineConfig::default()
        })
        .unwrap();
        engine.tables().create_table("simple").unwrap();
        let mut appender = engine.tables().appender("simple").unwrap();
        for value in 0..20 {
            let mut writer = RecordWriter::new();
            writer.put_i32(value);
            appender.append(&writer.finish()).unwrap();
        }
        assert_eq!(engine.tables().scan_records("simple").unwrap().count(), 20);
    }
}
