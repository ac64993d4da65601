//! Write-ahead-log hooks.
//!
//! The transaction manager drives these callbacks; the implementation owns
//! the log format. `FileWal` frames bincode-encoded records with a CRC32
//! checksum and addresses them by LSN (the record's file offset).

use std::fs::{File, OpenOptions};
use std::io::{Read, Seek, SeekFrom, Write};
use std::path::Path;

use crc32fast::Hasher;
use log::debug;
use serde::{Deserialize, Serialize};

use crate::error::{Result, StoreError};
use crate::{PageId, TxnId};

/// A Log Sequence Number: the record's offset in the log file.
pub type Lsn = u64;

/// Callbacks fired by the transaction manager.
///
/// `before_page_write` fires before the first write a transaction makes to a
/// page (carrying the page's pre-image); `after_page_write` after every
/// physical write; commit/abort after the scheduler released its bookkeeping
/// but before waiters are woken.
pub trait Wal: Send {
    fn transaction_started(&mut self, txn: TxnId);
    fn before_page_write(&mut self, txn: TxnId, page_id: PageId, before: &[u8]);
    fn after_page_write(&mut self, txn: TxnId, page_id: PageId);
    fn transaction_committed(&mut self, txn: TxnId, modified: &[PageId]);
    fn transaction_aborted(&mut self, txn: TxnId, modified: &[PageId]);
}

/// A WAL that records nothing.
#[derive(Debug, Default)]
pub struct NoopWal;

impl Wal for NoopWal {
    fn transaction_started(&mut self, _txn: TxnId) {}
    fn before_page_write(&mut self, _txn: TxnId, _page_id: PageId, _before: &[u8]) {}
    fn after_page_write(&mut self, _txn: TxnId, _page_id: PageId) {}
    fn transaction_committed(&mut self, _txn: TxnId, _modified: &[PageId]) {}
    fn transaction_aborted(&mut self, _txn: TxnId, _modified: &[PageId]) {}
}

/// A single record in the log.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub enum WalRecord {
    Start {
        txn: TxnId,
    },
    /// Pre-image of a page a transaction is about to touch for the first
    /// time; enough to undo the transaction physically.
    BeforeImage {
        txn: TxnId,
        page_id: PageId,
        image: Vec<u8>,
    },
    /// A physical write happened on the page.
    PageWrite {
        txn: TxnId,
        page_id: PageId,
    },
    Commit {
        txn: TxnId,
        modified: Vec<PageId>,
    },
    Abort {
        txn: TxnId,
        modified: Vec<PageId>,
    },
}

impl WalRecord {
    pub fn txn(&self) -> TxnId {
        match self {
            WalRecord::Start { txn }
            | WalRecord::BeforeImage { txn, .. }
            | WalRecord::PageWrite { txn, .. }
            | WalRecord::Commit { txn, .. }
            | WalRecord::Abort { txn, .. } => *txn,
        }
    }
}

/// Header written in front of every record.
const FRAME_BYTES: usize = 8 + 4 + 4; // prev_lsn + total_len + crc

/// A file-backed WAL. Records are framed as
/// `(prev_lsn: u64, total_len: u32, crc: u32, body)`, little-endian, where
/// `prev_lsn` chains the same transaction's records backward.
pub struct FileWal {
    file: File,
    next_lsn: Lsn,
    last_lsns: std::collections::HashMap<TxnId, Lsn>,
}

impl FileWal {
    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self> {
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(false)
            .open(path)?;
        let next_lsn = file.metadata()?.len();
        Ok(FileWal {
            file,
            next_lsn,
            last_lsns: std::collections::HashMap::new(),
        })
    }

    fn log(&mut self, record: &WalRecord) -> Result<Lsn> {
        let body = bincode::serialize(record).map_err(|e| StoreError::Wal(e.to_string()))?;
        let mut hasher = Hasher::new();
        hasher.update(&body);
        let crc = hasher.finalize();

        let txn = record.txn();
        let prev_lsn = self.last_lsns.get(&txn).copied().unwrap_or(0);
        let lsn = self.next_lsn;
        let total_len = (FRAME_BYTES + body.len()) as u32;

        self.file.seek(SeekFrom::Start(lsn))?;
        self.file.write_all(&prev_lsn.to_le_bytes())?;
        self.file.write_all(&total_len.to_le_bytes())?;
        self.file.write_all(&crc.to_le_bytes())?;
        self.file.write_all(&body)?;

        self.next_lsn += total_len as u64;
        self.last_lsns.insert(txn, lsn);
        Ok(lsn)
    }

    /// Reads the record at `lsn`, returning it with the previous LSN of the
    /// same transaction's chain.
    pub fn read_record(&mut self, lsn: Lsn) -> Result<(WalRecord, Lsn)> {
        self.file.seek(SeekFrom::Start(lsn))?;
        let mut frame = [0u8; FRAME_BYTES];
        self.file.read_exact(&mut frame)?;
        let prev_lsn = u64::from_le_bytes(frame[0..8].try_into().expect("frame slice"));
        let total_len = u32::from_le_bytes(frame[8..12].try_into().expect("frame slice"));
        let crc = u32::from_le_bytes(frame[12..16].try_into().expect("frame slice"));

        let mut body = vec![0u8; total_len as usize - FRAME_BYTES];
        self.file.read_exact(&mut body)?;
        let mut hasher = Hasher::new();
        hasher.update(&body);
        if hasher.finalize() != crc {
            return Err(StoreError::Wal(format!("record crc mismatch at lsn {lsn}")));
        }
        let record = bincode::deserialize(&body).map_err(|e| StoreError::Wal(e.to_string()))?;
        Ok((record, prev_lsn))
    }

    /// Scans the whole log in offset order.
    pub fn records(&mut self) -> Result<Vec<WalRecord>> {
        let mut records = Vec::new();
        let mut lsn = 0;
        while lsn < self.next_lsn {
            let (record, _) = self.read_record(lsn)?;
            self.file.seek(SeekFrom::Start(lsn + 8))?;
            let mut len = [0u8; 4];
            self.file.read_exact(&mut len)?;
            lsn += u32::from_le_bytes(len) as u64;
            records.push(record);
        }
        Ok(records)
    }

    pub fn last_lsn(&self, txn: TxnId) -> Option<Lsn> {
        self.last_lsns.get(&txn).copied()
    }

    fn sync(&mut self) {
        if let Err(e) = self.file.sync_all() {
            debug!("wal sync failed: {e}");
        }
    }
}

impl Wal for FileWal {
    fn transaction_started(&mut self, txn: TxnId) {
        let _ = self.log(&WalRecord::Start { txn });
    }

    fn before_page_write(&mut self, txn: TxnId, page_id: PageId, before: &[u8]) {
        let _ = self.log(&WalRecord::BeforeImage {
            txn,
            page_id,
            image: before.to_vec(),
        });
    }

    fn after_page_write(&mut self, txn: TxnId, page_id: PageId) {
        let _ = self.log(&WalRecord::PageWrite { txn, page_id });
    }

    fn transaction_committed(&mut self, txn: TxnId, modified: &[PageId]) {
        let _ = self.log(&WalRecord::Commit {
            txn,
            modified: modified.to_vec(),
        });
        self.sync();
        self.last_lsns.remove(&txn);
    }

    fn transaction_aborted(&mut self, txn: TxnId, modified: &[PageId]) {
        let _ = self.log(&WalRecord::Abort {
            txn,
            modified: modified.to_vec(),
        });
        self.sync();
        self.last_lsns.remove(&txn);
    }
}
