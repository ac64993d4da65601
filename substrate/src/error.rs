use thiserror::Error;

use crate::{PageId, TxnId};

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("i/o error: {0}")]
    Io(#[from] std::io::Error),

    #[error("negative page id {0} in a persisted request")]
    NegativePageId(PageId),

    #[error("cache saturated: all {0} resident pages are pinned")]
    CacheSaturated(usize),

    #[error("transaction {txn} aborted: {reason}")]
    TransactionAborted { txn: TxnId, reason: String },

    #[error("wal failure: {0}")]
    Wal(String),
}

pub type Result<T> = std::result::Result<T, StoreError>;
