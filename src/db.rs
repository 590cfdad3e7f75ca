//! The embedding facade
//!
//! `Folio` wires the transaction manager, collections, and (optionally)
//! the subscription engine together for hosts that want the whole stack.
//! Collections created through the facade are bound to the WAL when
//! configured transactional, and publish their change records into the
//! subscription engine when one is attached.

use folio_collection::{schedule_rotation, Collection, CollectionConfig, SharedCollection};
use folio_core::{FolioError, FolioResult, ThreadTimer, TimerGuard};
use folio_subscriptions::SubscriptionEngine;
use folio_wal::{RecoverySummary, TransactionManager, TransactionOptions, WalOptions};
use parking_lot::Mutex;
use rustc_hash::FxHashMap;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

/// Options for opening a [`Folio`] instance.
#[derive(Debug, Clone)]
pub struct FolioOptions {
    /// Root directory for file-backed collections
    pub root: PathBuf,
    /// WAL options; defaults to `<root>/folio.wal`
    pub wal: WalOptions,
}

impl FolioOptions {
    /// Options rooted at a directory, WAL alongside the data.
    pub fn new(root: impl Into<PathBuf>) -> Self {
        let root = root.into();
        let wal = WalOptions::new(root.join("folio.wal"));
        FolioOptions { root, wal }
    }

    /// Replace the WAL options.
    pub fn with_wal(mut self, wal: WalOptions) -> Self {
        self.wal = wal;
        self
    }
}

/// An embedded FolioDB instance.
pub struct Folio {
    options: FolioOptions,
    manager: Arc<TransactionManager>,
    collections: Mutex<FxHashMap<String, Arc<SharedCollection>>>,
    subscriptions: Mutex<Option<Arc<SubscriptionEngine>>>,
    timer: ThreadTimer,
    timer_guards: Mutex<Vec<TimerGuard>>,
}

impl Folio {
    /// Open an instance: stands the WAL, the transaction manager, and the
    /// transaction-timeout sweeper up.
    pub fn open(options: FolioOptions) -> FolioResult<Self> {
        let manager = Arc::new(TransactionManager::open(options.wal.clone())?);
        let timer = ThreadTimer;
        let sweeper = manager.start_timeout_sweeper(&timer, Duration::from_secs(1));
        Ok(Folio {
            options,
            manager,
            collections: Mutex::new(FxHashMap::default()),
            subscriptions: Mutex::new(None),
            timer,
            timer_guards: Mutex::new(vec![sweeper]),
        })
    }

    /// Attach a subscription engine. Collections created afterwards
    /// publish their change records into it.
    pub fn attach_subscriptions(&self, engine: Arc<SubscriptionEngine>) {
        *self.subscriptions.lock() = Some(engine);
    }

    /// The attached subscription engine, if any.
    pub fn subscriptions(&self) -> Option<Arc<SubscriptionEngine>> {
        self.subscriptions.lock().clone()
    }

    /// The transaction manager.
    pub fn wal(&self) -> &Arc<TransactionManager> {
        &self.manager
    }

    /// Create (or reopen) a collection. A missing `root` in the config is
    /// filled from the instance root; transactional collections register
    /// with the WAL.
    pub fn create_collection(
        &self,
        mut config: CollectionConfig,
    ) -> FolioResult<Arc<SharedCollection>> {
        {
            let collections = self.collections.lock();
            if collections.contains_key(&config.name) {
                return Err(FolioError::validation(format!(
                    "collection '{}' already exists",
                    config.name
                )));
            }
        }
        if config.root.is_none() {
            config.root = Some(self.options.root.clone());
        }
        let transactional = config.transactional;
        let rotate = config.rotate;
        let name = config.name.clone();

        let mut collection = Collection::open(config)?;
        if let Some(engine) = self.subscriptions.lock().clone() {
            collection.set_sink(engine);
        }
        let shared = if transactional {
            SharedCollection::new_registered(collection, &self.manager)
        } else {
            SharedCollection::new(collection)
        };
        if let Some(rotate) = rotate {
            let guard = schedule_rotation(
                &shared,
                &self.timer,
                Duration::from_millis(rotate.period_ms),
                Some(Arc::clone(&self.manager)),
                None,
            );
            self.timer_guards.lock().push(guard);
        }
        self.collections.lock().insert(name, Arc::clone(&shared));
        Ok(shared)
    }

    /// Fetch a collection by name.
    pub fn collection(&self, name: &str) -> Option<Arc<SharedCollection>> {
        self.collections.lock().get(name).cloned()
    }

    /// Begin a transaction with default options.
    pub fn begin(&self) -> FolioResult<String> {
        self.manager.begin(TransactionOptions::default())
    }

    /// Begin a transaction.
    pub fn begin_with(&self, options: TransactionOptions) -> FolioResult<String> {
        self.manager.begin(options)
    }

    /// Commit a transaction (two-phase across all participants).
    ///
    /// Do not hold any collection lock across this call; the commit
    /// re-enters the collections through their participant hooks.
    pub fn commit(&self, tx_id: &str) -> FolioResult<()> {
        self.manager.commit(tx_id)
    }

    /// Roll a transaction back.
    pub fn rollback(&self, tx_id: &str) -> FolioResult<()> {
        self.manager.rollback(tx_id)
    }

    /// Snapshot all registered collections and truncate the WAL.
    pub fn checkpoint(&self) -> FolioResult<String> {
        self.manager.create_checkpoint()
    }

    /// Replay the WAL into the registered collections. Call after every
    /// collection has been created (restored) and registered.
    pub fn recover(&self) -> FolioResult<RecoverySummary> {
        self.manager.recover()
    }
}
