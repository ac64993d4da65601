//! The two-phase-locking scheduler.

use std::collections::{HashMap, HashSet};

use log::debug;

use crate::scheduler::{ReadOutcome, Scheduler, WriteOutcome};
use crate::{PageId, TxnId};

#[derive(Debug, Default)]
struct PageLock {
    shared: HashSet<TxnId>,
    exclusive: Option<TxnId>,
}

impl PageLock {
    fn is_free(&self) -> bool {
        self.shared.is_empty() && self.exclusive.is_none()
    }
}

/// Strict two-phase locking over pages: shared read locks, exclusive write
/// locks, all released at commit or abort. Conflicts report `Wait`; cycles
/// in the waits-for graph report `Abort` instead.
#[derive(Debug, Default)]
pub struct LockingScheduler {
    locks: HashMap<PageId, PageLock>,
    held: HashMap<TxnId, HashSet<PageId>>,
    /// Maps a waiting transaction to the transactions it waits for.
    waits_for: HashMap<TxnId, HashSet<TxnId>>,
}

impl LockingScheduler {
    pub fn new() -> Self {
        Self::default()
    }

    /// Records that `waiter` is blocked by `blockers`; detects cycles with a
    /// depth-first walk over the waits-for graph. On deadlock the edge is
    /// withdrawn and the waiter told to abort.
    fn block_on(&mut self, waiter: TxnId, blockers: HashSet<TxnId>) -> Option<TxnId> {
        let representative = blockers.iter().next().copied();
        self.waits_for.insert(waiter, blockers);
        if self.has_cycle(waiter) {
            self.waits_for.remove(&waiter);
            return None;
        }
        representative
    }

    fn has_cycle(&self, start: TxnId) -> bool {
        let mut visited = HashSet::new();
        let mut path = HashSet::new();
        self.dfs(start, &mut visited, &mut path)
    }

    fn dfs(&self, current: TxnId, visited: &mut HashSet<TxnId>, path: &mut HashSet<TxnId>) -> bool {
        visited.insert(current);
        path.insert(current);
        if let Some(next_set) = self.waits_for.get(&current) {
            for &next in next_set {
                if path.contains(&next) {
                    return true;
                }
                if !visited.contains(&next) && self.dfs(next, visited, path) {
                    return true;
                }
            }
        }
        path.remove(&current);
        false
    }

    fn granted(&mut self, txn: TxnId, page: PageId) {
        self.held.entry(txn).or_default().insert(page);
        self.waits_for.remove(&txn);
    }

    fn release_all(&mut self, txn: TxnId) -> Vec<TxnId> {
        if let Some(pages) = self.held.remove(&txn) {
            for page in pages {
                if let Some(lock) = self.locks.get_mut(&page) {
                    lock.shared.remove(&txn);
                    if lock.exclusive == Some(txn) {
                        lock.exclusive = None;
                    }
                    if lock.is_free() {
                        self.locks.remove(&page);
                    }
                }
            }
        }
        self.waits_for.remove(&txn);

        // Everyone blocked by this transaction may retry now.
        let mut waiters = Vec::new();
        for (&waiter, blockers) in self.waits_for.iter_mut() {
            if blockers.remove(&txn) {
                waiters.push(waiter);
            }
        }
        debug!("txn {txn} released its locks, waking {waiters:?}");
        waiters
    }
}

impl Scheduler for LockingScheduler {
    fn read(&mut self, txn: TxnId, page: PageId) -> ReadOutcome {
        let lock = self.locks.entry(page).or_default();
        match lock.exclusive {
            Some(holder) if holder != txn => {
                let mut blockers = HashSet::new();
                blockers.insert(holder);
                match self.block_on(txn, blockers) {
                    Some(blocker) => ReadOutcome::Wait(blocker),
                    None => ReadOutcome::Abort(format!(
                        "deadlock waiting to read page {page} held by transaction {holder}"
                    )),
                }
            }
            _ => {
                lock.shared.insert(txn);
                self.granted(txn, page);
                ReadOutcome::Ok(page)
            }
        }
    }

    fn write(&mut self, txn: TxnId, page: PageId) -> WriteOutcome {
        let lock = self.locks.entry(page).or_default();
        let mut blockers: HashSet<TxnId> = lock.shared.iter().copied().filter(|&t| t != txn).collect();
        if let Some(holder) = lock.exclusive {
            if holder != txn {
                blockers.insert(holder);
            }
        }
        if blockers.is_empty() {
            // A lone shared holder upgrades in place.
            lock.shared.remove(&txn);
            lock.exclusive = Some(txn);
            self.granted(txn, page);
            return WriteOutcome::Ok { redirect: None };
        }
        match self.block_on(txn, blockers) {
            Some(blocker) => WriteOutcome::Wait(blocker),
            None => WriteOutcome::Abort(format!("deadlock waiting to write page {page}")),
        }
    }

    fn write_applied(&mut self, _txn: TxnId, _page: PageId, _version: PageId) {}

    fn commit(&mut self, txn: TxnId) -> Vec<TxnId> {
        self.release_all(txn)
    }

    fn abort(&mut self, txn: TxnId) -> Vec<TxnId> {
        self.release_all(txn)
    }
}
