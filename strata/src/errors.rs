use substrate::{PageId, StoreError};
use thiserror::Error;

use crate::catalog::Oid;

#[derive(Debug, Error)]
pub enum EngineError {
    #[error(transparent)]
    Store(#[from] StoreError),

    #[error("table '{0}' not found")]
    TableNotFound(String),

    #[error("table '{0}' already exists")]
    TableExists(String),

    #[error("catalog overflow while extending table {0}")]
    CatalogOverflow(Oid),

    #[error("no table with oid {0}")]
    UnknownOid(Oid),

    #[error("record of {size} bytes cannot fit an empty page {page}")]
    RecordTooLarge { page: PageId, size: usize },

    #[error("index '{0}' not found")]
    IndexNotFound(String),

    #[error("sort fan-in exceeded: {runs} runs against a merge capacity of {max}")]
    SortFanIn { runs: usize, max: usize },

    #[error("index corrupt: {0}")]
    IndexCorrupt(String),
}

pub type Result<T> = std::result::Result<T, EngineError>;
