//! The transaction scheduler contract and two of its reference
//! implementations (timestamp ordering and an MVCC-shaped scheduler).
//!
//! Entry points are effectively single-threaded: the transaction manager
//! serializes every call behind one mutex, so implementations may assume
//! mutual exclusion and must never block.

use std::collections::HashMap;

use log::debug;

use crate::{PageId, TxnId};

/// Outcome of asking to read a page. `Ok` carries the page id to serve,
/// which an MVCC scheduler may point at an older committed version.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ReadOutcome {
    Ok(PageId),
    Wait(TxnId),
    Abort(String),
}

/// Outcome of asking to write a page. `redirect` carries the private
/// version page the write must land on instead, when the scheduler keeps
/// versions; the manager copies the current bytes there, performs the write
/// and reports back through `write_applied`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WriteOutcome {
    Ok { redirect: Option<PageId> },
    Wait(TxnId),
    Abort(String),
}

pub trait Scheduler: Send {
    fn read(&mut self, txn: TxnId, page: PageId) -> ReadOutcome;

    fn write(&mut self, txn: TxnId, page: PageId) -> WriteOutcome;

    /// Notification that the physical write for an earlier `write` outcome
    /// has been performed on `version` (the redirect target, or the page
    /// itself).
    fn write_applied(&mut self, txn: TxnId, page: PageId, version: PageId);

    /// Releases the transaction's bookkeeping; returns the transactions
    /// that were waiting on it and may now resume.
    fn commit(&mut self, txn: TxnId) -> Vec<TxnId>;

    fn abort(&mut self, txn: TxnId) -> Vec<TxnId>;
}

/// Scheduler tag, chosen at construction.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SchedulerKind {
    TwoPhaseLocking,
    TimestampOrdering,
    Mvcc,
}

/// Version pages created by the MVCC scheduler are allocated upward from
/// here, far above any id the catalog hands out.
pub const VERSION_PAGE_BASE: PageId = 1 << 30;

pub fn make_scheduler(kind: SchedulerKind) -> Box<dyn Scheduler> {
    match kind {
        SchedulerKind::TwoPhaseLocking => Box::new(crate::locking::LockingScheduler::new()),
        SchedulerKind::TimestampOrdering => Box::new(TimestampScheduler::new()),
        SchedulerKind::Mvcc => Box::new(MvccScheduler::new(VERSION_PAGE_BASE)),
    }
}

/// Basic timestamp ordering: the transaction descriptor is its timestamp.
/// A read behind the page's write stamp aborts; a write behind either stamp
/// aborts. Nothing ever waits.
#[derive(Debug, Default)]
pub struct TimestampScheduler {
    stamps: HashMap<PageId, (TxnId, TxnId)>, // (read_ts, write_ts)
}

impl TimestampScheduler {
    pub fn new() -> Self {
        Self::default()
    }
}

impl Scheduler for TimestampScheduler {
    fn read(&mut self, txn: TxnId, page: PageId) -> ReadOutcome {
        let (read_ts, write_ts) = self.stamps.entry(page).or_insert((0, 0));
        if txn < *write_ts {
            return ReadOutcome::Abort(format!(
                "read of page {page} behind write stamp {write_ts}"
            ));
        }
        *read_ts = (*read_ts).max(txn);
        ReadOutcome::Ok(page)
    }

    fn write(&mut self, txn: TxnId, page: PageId) -> WriteOutcome {
        let (read_ts, write_ts) = self.stamps.entry(page).or_insert((0, 0));
        if txn < *read_ts {
            return WriteOutcome::Abort(format!(
                "write of page {page} behind read stamp {read_ts}"
            ));
        }
        if txn < *write_ts {
            return WriteOutcome::Abort(format!(
                "write of page {page} behind write stamp {write_ts}"
            ));
        }
        *write_ts = txn;
        WriteOutcome::Ok { redirect: None }
    }

    fn write_applied(&mut self, _txn: TxnId, _page: PageId, _version: PageId) {}

    fn commit(&mut self, _txn: TxnId) -> Vec<TxnId> {
        Vec::new()
    }

    fn abort(&mut self, _txn: TxnId) -> Vec<TxnId> {
        Vec::new()
    }
}

#[derive(Debug)]
struct VersionChain {
    committed: PageId,
    pending: Option<(TxnId, PageId)>,
}

/// MVCC-shaped scheduling: writers are steered onto private version pages,
/// readers of other transactions keep seeing the last committed version, and
/// a second concurrent writer aborts (first-updater-wins).
#[derive(Debug)]
pub struct MvccScheduler {
    chains: HashMap<PageId, VersionChain>,
    next_version: PageId,
}

impl MvccScheduler {
    pub fn new(version_base: PageId) -> Self {
        MvccScheduler {
            chains: HashMap::new(),
            next_version: version_base,
        }
    }
}

impl Scheduler for MvccScheduler {
    fn read(&mut self, txn: TxnId, page: PageId) -> ReadOutcome {
        match self.chains.get(&page) {
            Some(chain) => match chain.pending {
                Some((writer, version)) if writer == txn => ReadOutcome::Ok(version),
                _ => ReadOutcome::Ok(chain.committed),
            },
            None => ReadOutcome::Ok(page),
        }
    }

    fn write(&mut self, txn: TxnId, page: PageId) -> WriteOutcome {
        let next_version = &mut self.next_version;
        let chain = self.chains.entry(page).or_insert(VersionChain {
            committed: page,
            pending: None,
        });
        match chain.pending {
            Some((writer, version)) if writer == txn => WriteOutcome::Ok {
                redirect: Some(version),
            },
            Some((writer, _)) => {
                WriteOutcome::Abort(format!("page {page} already written by transaction {writer}"))
            }
            None => {
                let version = *next_version;
                *next_version += 1;
                chain.pending = Some((txn, version));
                debug!("mvcc: txn {txn} writes page {page} as version {version}");
                WriteOutcome::Ok {
                    redirect: Some(version),
                }
            }
        }
    }

    fn write_applied(&mut self, txn: TxnId, page: PageId, version: PageId) {
        debug_assert!(matches!(
            self.chains.get(&page),
            Some(VersionChain { pending: Some((writer, pending_version)), .. })
                if *writer == txn && *pending_version == version
        ));
    }

    fn commit(&mut self, txn: TxnId) -> Vec<TxnId> {
        for chain in self.chains.values_mut() {
            if let Some((writer, version)) = chain.pending {
                if writer == txn {
                    chain.committed = version;
                    chain.pending = None;
                }
            }
        }
        Vec::new()
    }

    fn abort(&mut self, txn: TxnId) -> Vec<TxnId> {
        for chain in self.chains.values_mut() {
            if matches!(chain.pending, Some((writer, _)) if writer == txn) {
                chain.pending = None;
            }
        }
        Vec::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn timestamp_ordering_aborts_stale_reads_and_writes() {
        let mut scheduler = TimestampScheduler::new();
        assert_eq!(scheduler.read(5, 1), ReadOutcome::Ok(1));
        assert!(matches!(scheduler.write(5, 1), WriteOutcome::Ok { .. }));
        // An older transaction arriving late must abort.
        assert!(matches!(scheduler.read(3, 1), ReadOutcome::Abort(_)));
        assert!(matches!(scheduler.write(4, 1), WriteOutcome::Abort(_)));
        // A younger one proceeds.
        assert_eq!(scheduler.read(7, 1), ReadOutcome::Ok(1));
    }

    #[test]
    fn timestamp_write_behind_read_stamp_aborts() {
        let mut scheduler = TimestampScheduler::new();
        assert_eq!(scheduler.read(9, 2), ReadOutcome::Ok(2));
        assert!(matches!(scheduler.write(8, 2), WriteOutcome::Abort(_)));
    }

    #[test]
    fn mvcc_serves_writer_its_version_and_readers_the_committed_page() {
        let mut scheduler = MvccScheduler::new(1000);
        let redirect = match scheduler.write(1, 40) {
            WriteOutcome::Ok { redirect: Some(v) } => v,
            other => panic!("expected redirect, got {other:?}"),
        };
        assert_eq!(redirect, 1000);
        scheduler.write_applied(1, 40, redirect);

        // The writer reads its own version, everyone else the original.
        assert_eq!(scheduler.read(1, 40), ReadOutcome::Ok(1000));
        assert_eq!(scheduler.read(2, 40), ReadOutcome::Ok(40));

        // After commit the version becomes the page everyone sees.
        scheduler.commit(1);
        assert_eq!(scheduler.read(2, 40), ReadOutcome::Ok(1000));
    }

    #[test]
    fn mvcc_write_write_conflict_aborts_the_second_writer() {
        let mut scheduler = MvccScheduler::new(1000);
        assert!(matches!(scheduler.write(1, 8), WriteOutcome::Ok { .. }));
        assert!(matches!(scheduler.write(2, 8), WriteOutcome::Abort(_)));
        // The first writer aborting clears the way.
        scheduler.abort(1);
        assert!(matches!(scheduler.write(2, 8), WriteOutcome::Ok { .. }));
        // And readers still see the original page after the abort.
        assert_eq!(scheduler.read(3, 8), ReadOutcome::Ok(8));
    }

    #[test]
    fn mvcc_repeated_writes_reuse_the_same_version() {
        let mut scheduler = MvccScheduler::new(1000);
        let first = match scheduler.write(1, 3) {
            WriteOutcome::Ok { redirect: Some(v) } => v,
            other => panic!("unexpected {other:?}"),
        };
        let second = match scheduler.write(1, 3) {
            WriteOutcome::Ok { redirect: Some(v) } => v,
            other => panic!("unexpected {other:?}"),
        };
        assert_eq!(first, second);
    }
}
