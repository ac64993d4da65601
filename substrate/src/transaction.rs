//! The transaction manager.
//!
//! The manager vends `TransactionCache` wrappers that intercept every cache
//! access: reads consult the scheduler (suspending the calling worker on a
//! completion channel while a conflicting transaction is live), writes run
//! the scheduler plus the WAL hooks, and abort restores every modified page
//! from its pre-image.

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Weak};

use log::debug;
use parking_lot::{Condvar, Mutex};

use crate::cache::{CachedPage, PageHandle, PageStore, WriteHooks};
use crate::error::{Result, StoreError};
use crate::scheduler::{ReadOutcome, Scheduler, WriteOutcome};
use crate::storage::{BulkWriter, Page, Storage};
use crate::wal::Wal;
use crate::{PageId, TxnId, PAGE_SIZE};

/// Storage adapter that drops write-backs of pages still modified by a live
/// transaction, so uncommitted bytes never reach disk. The predicate is
/// installed by the transaction manager.
pub struct RevertableStorage {
    inner: Arc<dyn Storage>,
    filter: Mutex<Option<Arc<dyn Fn(PageId) -> bool + Send + Sync>>>,
}

impl RevertableStorage {
    pub fn new(inner: Arc<dyn Storage>) -> Self {
        RevertableStorage {
            inner,
            filter: Mutex::new(None),
        }
    }

    pub fn set_filter(&self, filter: Arc<dyn Fn(PageId) -> bool + Send + Sync>) {
        *self.filter.lock() = Some(filter);
    }

    fn is_held_back(&self, page_id: PageId) -> bool {
        self.filter
            .lock()
            .as_ref()
            .is_some_and(|filter| filter(page_id))
    }
}

impl Storage for RevertableStorage {
    fn read(&self, page_id: PageId) -> Result<Page> {
        self.inner.read(page_id)
    }

    fn write(&self, page: &Page) -> Result<()> {
        if self.is_held_back(page.id) {
            debug!("dropping write-back of page {} (live modifier)", page.id);
            return Ok(());
        }
        self.inner.write(page)
    }

    fn bulk_read(&self, start: PageId, count: u32, consumer: &mut dyn FnMut(Page)) -> Result<()> {
        self.inner.bulk_read(start, count, consumer)
    }

    fn bulk_write(&self, start: PageId) -> Result<BulkWriter<'_>> {
        self.inner.bulk_write(start)
    }

    fn access_cost(&self) -> f64 {
        self.inner.access_cost()
    }
}

struct Touched {
    entry: Arc<CachedPage>,
    pre: Box<[u8; PAGE_SIZE]>,
    physical: PageId,
}

#[derive(Default)]
struct TxnLocal {
    touched: HashMap<PageId, Touched>,
    /// Logical page ids in first-write order; the modified set for WAL.
    order: Vec<PageId>,
    aborted: bool,
    committed: bool,
}

struct TxnShared {
    cache: Arc<dyn PageStore>,
    scheduler: Mutex<Box<dyn Scheduler>>,
    wal: Mutex<Box<dyn Wal>>,
    live: Mutex<HashSet<TxnId>>,
    completion: Condvar,
    next_txn: AtomicU32,
    live_modified: Arc<Mutex<HashMap<PageId, HashSet<TxnId>>>>,
}

/// Arbitrates every read and write of the transactions it started.
pub struct TransactionManager {
    shared: Arc<TxnShared>,
}

impl TransactionManager {
    pub fn new(cache: Arc<dyn PageStore>, scheduler: Box<dyn Scheduler>, wal: Box<dyn Wal>) -> Self {
        TransactionManager {
            shared: Arc::new(TxnShared {
                cache,
                scheduler: Mutex::new(scheduler),
                wal: Mutex::new(wal),
                live: Mutex::new(HashSet::new()),
                completion: Condvar::new(),
                next_txn: AtomicU32::new(1),
                live_modified: Arc::new(Mutex::new(HashMap::new())),
            }),
        }
    }

    /// The predicate for a `RevertableStorage` sitting under the cache:
    /// true while some live transaction has modified the page.
    pub fn revert_filter(&self) -> Arc<dyn Fn(PageId) -> bool + Send + Sync> {
        let live_modified = self.shared.live_modified.clone();
        Arc::new(move |page_id| live_modified.lock().contains_key(&page_id))
    }

    /// Starts a transaction: allocates the next descriptor, notifies the
    /// WAL and returns the intercepting cache wrapper.
    pub fn begin(&self) -> Arc<TransactionCache> {
        let txn = self.shared.next_txn.fetch_add(1, Ordering::SeqCst);
        self.shared.live.lock().insert(txn);
        self.shared.wal.lock().transaction_started(txn);
        debug!("transaction {txn} started");
        let shared = self.shared.clone();
        Arc::new_cyclic(|weak| TransactionCache {
            shared,
            txn,
            weak_self: weak.clone(),
            local: Mutex::new(TxnLocal::default()),
        })
    }

    pub fn commit(&self, txc: &TransactionCache) -> Result<()> {
        txc.commit()
    }

    pub fn abort(&self, txc: &TransactionCache) -> Result<()> {
        txc.abort()
    }

    /// Runs `body` as a transaction. A clean return commits; any error (or
    /// an abort decided by the scheduler mid-body) aborts and surfaces as
    /// `TransactionAborted`.
    pub fn execute<T>(&self, body: impl FnOnce(&Arc<TransactionCache>) -> Result<T>) -> Result<T> {
        let txc = self.begin();
        match body(&txc) {
            Ok(value) => {
                txc.commit()?;
                Ok(value)
            }
            Err(error) => {
                txc.abort()?;
                Err(match error {
                    already @ StoreError::TransactionAborted { .. } => already,
                    other => StoreError::TransactionAborted {
                        txn: txc.txn(),
                        reason: other.to_string(),
                    },
                })
            }
        }
    }
}

/// A transaction's view of the cache. Implements `PageStore`, so everything
/// built on the cache works unchanged under a transaction.
pub struct TransactionCache {
    shared: Arc<TxnShared>,
    txn: TxnId,
    weak_self: Weak<TransactionCache>,
    local: Mutex<TxnLocal>,
}

impl TransactionCache {
    pub fn txn(&self) -> TxnId {
        self.txn
    }

    fn hooks(&self) -> Arc<dyn WriteHooks> {
        self.weak_self
            .upgrade()
            .expect("transaction cache is kept alive by its Arc")
    }

    /// Parks the worker until `blocker` commits or aborts.
    fn wait_for(&self, blocker: TxnId) {
        debug!("transaction {} waits for {}", self.txn, blocker);
        let mut live = self.shared.live.lock();
        while live.contains(&blocker) {
            self.shared.completion.wait(&mut live);
        }
    }

    /// The scheduler decided this transaction dies: run the abort protocol
    /// and hand back the error to raise.
    fn abort_now(&self, reason: String) -> StoreError {
        if let Err(error) = self.abort() {
            return error;
        }
        StoreError::TransactionAborted {
            txn: self.txn,
            reason,
        }
    }

    fn fetch(&self, page_id: PageId, pin: bool) -> Result<PageHandle> {
        if page_id < 0 {
            return Err(StoreError::NegativePageId(page_id));
        }
        loop {
            let outcome = self.shared.scheduler.lock().read(self.txn, page_id);
            match outcome {
                ReadOutcome::Ok(served) => {
                    {
                        // A page this transaction already modified is served
                        // from the held working copy, which survives eviction.
                        let local = self.local.lock();
                        if let Some(touched) = local.touched.get(&page_id) {
                            return Ok(PageHandle::new(touched.entry.clone(), pin)
                                .with_hooks(page_id, self.hooks()));
                        }
                    }
                    let handle = if pin {
                        self.shared.cache.get_and_pin(served)?
                    } else {
                        self.shared.cache.get(served)?
                    };
                    return Ok(handle.with_hooks(page_id, self.hooks()));
                }
                ReadOutcome::Wait(blocker) => self.wait_for(blocker),
                ReadOutcome::Abort(reason) => return Err(self.abort_now(reason)),
            }
        }
    }

    fn unregister_modified(&self, local: &TxnLocal) {
        let mut live_modified = self.shared.live_modified.lock();
        for (&logical, touched) in &local.touched {
            for key in [logical, touched.physical] {
                if let Some(owners) = live_modified.get_mut(&key) {
                    owners.remove(&self.txn);
                    if owners.is_empty() {
                        live_modified.remove(&key);
                    }
                }
            }
        }
    }

    /// Publishes this transaction's completion: scheduler bookkeeping is
    /// already released and the WAL record written by the caller.
    fn finish(&self, waiters: Vec<TxnId>) {
        let mut live = self.shared.live.lock();
        live.remove(&self.txn);
        self.shared.completion.notify_all();
        drop(live);
        if !waiters.is_empty() {
            debug!("transaction {} resumes {waiters:?}", self.txn);
        }
    }

    fn commit(&self) -> Result<()> {
        let mut local = self.local.lock();
        if local.aborted {
            return Err(StoreError::TransactionAborted {
                txn: self.txn,
                reason: "commit after abort".to_string(),
            });
        }
        if local.committed {
            return Ok(());
        }

        let waiters = self.shared.scheduler.lock().commit(self.txn);
        self.unregister_modified(&local);

        // The committed bytes become the canonical cache content; pages that
        // were evicted mid-transaction (their write-backs were dropped) get
        // re-admitted and overwritten.
        for touched in local.touched.values() {
            let handle = self.shared.cache.get(touched.physical)?;
            if !Arc::ptr_eq(handle.entry(), &touched.entry) {
                handle.entry().reset_to(&touched.entry.snapshot().data);
            }
            handle.entry().mark_dirty();
        }

        local.committed = true;
        let modified = local.order.clone();
        drop(local);

        self.shared
            .wal
            .lock()
            .transaction_committed(self.txn, &modified);
        self.finish(waiters);
        debug!("transaction {} committed", self.txn);
        Ok(())
    }

    fn abort(&self) -> Result<()> {
        let mut local = self.local.lock();
        if local.aborted || local.committed {
            return Ok(());
        }

        let waiters = self.shared.scheduler.lock().abort(self.txn);

        // Revert every modified resident page to its pre-transaction bytes.
        for (&logical, touched) in &local.touched {
            if touched.physical == logical {
                touched.entry.reset_to(&touched.pre);
                let handle = self.shared.cache.get(logical)?;
                if !Arc::ptr_eq(handle.entry(), &touched.entry) {
                    handle.entry().reset_to(&touched.pre);
                }
            }
            // A private version page simply dies with the transaction.
        }
        self.unregister_modified(&local);

        local.aborted = true;
        let modified = local.order.clone();
        drop(local);

        self.shared
            .wal
            .lock()
            .transaction_aborted(self.txn, &modified);
        self.finish(waiters);
        debug!("transaction {} aborted", self.txn);
        Ok(())
    }
}

impl WriteHooks for TransactionCache {
    fn before_write(
        &self,
        logical: PageId,
        current: &Arc<CachedPage>,
    ) -> Result<Option<Arc<CachedPage>>> {
        loop {
            let outcome = self.shared.scheduler.lock().write(self.txn, logical);
            match outcome {
                WriteOutcome::Ok { redirect } => {
                    let mut local = self.local.lock();
                    if let Some(touched) = local.touched.get(&logical) {
                        let replacement = (!Arc::ptr_eq(&touched.entry, current))
                            .then(|| touched.entry.clone());
                        return Ok(replacement);
                    }

                    // First write to this page: capture the pre-image, tell
                    // the WAL, and materialize the target entry.
                    let pre = current.snapshot().data;
                    let target = redirect.unwrap_or(logical);
                    let entry = if target == current.id() {
                        current.clone()
                    } else {
                        let handle = self.shared.cache.get(target)?;
                        let entry = handle.entry().clone();
                        entry.reset_to(&pre);
                        entry.mark_dirty();
                        entry
                    };
                    {
                        let mut live_modified = self.shared.live_modified.lock();
                        live_modified.entry(logical).or_default().insert(self.txn);
                        if target != logical {
                            live_modified.entry(target).or_default().insert(self.txn);
                        }
                    }
                    self.shared
                        .wal
                        .lock()
                        .before_page_write(self.txn, logical, &pre[..]);
                    self.shared
                        .scheduler
                        .lock()
                        .write_applied(self.txn, logical, target);

                    local.order.push(logical);
                    let replacement = (!Arc::ptr_eq(&entry, current)).then(|| entry.clone());
                    local.touched.insert(
                        logical,
                        Touched {
                            entry,
                            pre,
                            physical: target,
                        },
                    );
                    return Ok(replacement);
                }
                WriteOutcome::Wait(blocker) => self.wait_for(blocker),
                WriteOutcome::Abort(reason) => return Err(self.abort_now(reason)),
            }
        }
    }

    fn after_write(&self, logical: PageId) {
        self.shared.wal.lock().after_page_write(self.txn, logical);
    }
}

impl PageStore for TransactionCache {
    fn get(&self, page_id: PageId) -> Result<PageHandle> {
        self.fetch(page_id, false)
    }

    fn get_and_pin(&self, page_id: PageId) -> Result<PageHandle> {
        self.fetch(page_id, true)
    }

    fn load(&self, start: PageId, count: u32) -> Result<()> {
        self.shared.cache.load(start, count)
    }

    fn flush(&self) -> Result<()> {
        self.shared.cache.flush()
    }

    fn capacity(&self) -> usize {
        self.shared.cache.capacity()
    }

    fn stats(&self) -> crate::cache::CacheStats {
        self.shared.cache.stats()
    }

    fn reset_stats(&self) {
        self.shared.cache.reset_stats()
    }
}
