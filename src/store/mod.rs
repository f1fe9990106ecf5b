use crate::{
    configs::StoreConfig,
    error::AppResult,
    persistent::PersistentStore,
    types::BoundCertRecord,
};
use chrono::{DateTime, Utc};
use futures::{future::BoxFuture, ready, FutureExt};
use std::{
    collections::{HashMap, VecDeque},
    fmt::{Debug, Formatter},
    future::poll_fn,
    sync::Arc,
    task::{Context, Poll},
};

mod task;

use task::PendingTask;
pub use task::Pending;

/// Outcome of [`BoundCertStore::get`].
#[derive(Debug)]
pub enum CertLookup {
    Found(BoundCertRecord),
    NotFound,
    /// The backing store is still loading; the handle resolves once it has.
    Pending(Pending<Option<BoundCertRecord>>),
}

/// In-memory cache of origin-bound certificates, keyed by server identifier.
///
/// The backing store is loaded lazily on the first call. Until the load has
/// been merged every operation is queued, and the queue is replayed in order
/// as soon as the load completes. The load is driven by [`poll_load`] or
/// [`wait_for_load`]; nothing queued runs before one of them observes the
/// load finishing.
///
/// [`poll_load`]: BoundCertStore::poll_load
/// [`wait_for_load`]: BoundCertStore::wait_for_load
pub struct BoundCertStore {
    config: StoreConfig,
    backing_store: Option<Arc<dyn PersistentStore>>,
    certs: HashMap<String, BoundCertRecord>,
    pending_tasks: VecDeque<PendingTask>,
    loading: Option<BoxFuture<'static, AppResult<Vec<BoundCertRecord>>>>,
    initialized: bool,
    loaded: bool,
}

impl BoundCertStore {
    pub fn new(backing_store: Option<Arc<dyn PersistentStore>>, config: StoreConfig) -> Self {
        Self {
            config,
            backing_store,
            certs: Default::default(),
            pending_tasks: Default::default(),
            loading: None,
            initialized: false,
            loaded: false,
        }
    }

    pub fn in_memory(config: StoreConfig) -> Self {
        Self::new(None, config)
    }

    pub fn with_backing_store(backing_store: Arc<dyn PersistentStore>, config: StoreConfig) -> Self {
        Self::new(Some(backing_store), config)
    }

    pub fn is_loaded(&self) -> bool {
        self.loaded
    }

    /// Look up the certificate bound to `server_identifier`.
    pub fn get(&mut self, server_identifier: &str) -> CertLookup {
        self.init_if_necessary();

        if !self.loaded {
            let (completer, pending) = Pending::channel();
            self.enqueue(PendingTask::Get {
                server_identifier: server_identifier.to_owned(),
                completer,
            });
            return CertLookup::Pending(pending);
        }

        match self.certs.get(server_identifier) {
            Some(record) => CertLookup::Found(record.clone()),
            None => CertLookup::NotFound,
        }
    }

    /// Store a certificate, replacing whatever was bound to the same server.
    pub fn set(
        &mut self,
        server_identifier: impl Into<String>,
        creation_time: DateTime<Utc>,
        expiration_time: DateTime<Utc>,
        private_key: impl Into<Vec<u8>>,
        certificate: impl Into<Vec<u8>>,
    ) {
        self.set_record(BoundCertRecord::new(
            server_identifier,
            creation_time,
            expiration_time,
            private_key,
            certificate,
        ));
    }

    pub fn set_record(&mut self, record: BoundCertRecord) {
        self.init_if_necessary();

        if !self.loaded {
            self.enqueue(PendingTask::Set { record });
            return;
        }
        self.sync_set(record);
    }

    /// Remove the certificate bound to `server_identifier`, if any.
    pub fn delete(&mut self, server_identifier: &str) -> Pending<()> {
        self.init_if_necessary();

        if !self.loaded {
            let (completer, pending) = Pending::channel();
            self.enqueue(PendingTask::Delete {
                server_identifier: server_identifier.to_owned(),
                completer,
            });
            return pending;
        }

        self.sync_delete(server_identifier);
        Pending::ready(())
    }

    /// Remove every certificate created in `[begin, end)`. `None` leaves that
    /// side of the range open.
    pub fn delete_all_created_between(
        &mut self,
        begin: Option<DateTime<Utc>>,
        end: Option<DateTime<Utc>>,
    ) -> Pending<()> {
        self.init_if_necessary();

        if !self.loaded {
            let (completer, pending) = Pending::channel();
            self.enqueue(PendingTask::DeleteRange {
                begin,
                end,
                completer,
            });
            return pending;
        }

        self.sync_delete_between(begin, end);
        Pending::ready(())
    }

    pub fn delete_all(&mut self) -> Pending<()> {
        self.delete_all_created_between(None, None)
    }

    /// Snapshot of every certificate, in no particular order.
    pub fn get_all(&mut self) -> Pending<Vec<BoundCertRecord>> {
        self.init_if_necessary();

        if !self.loaded {
            let (completer, pending) = Pending::channel();
            self.enqueue(PendingTask::GetAll { completer });
            return pending;
        }

        Pending::ready(self.snapshot())
    }

    /// Number of certificates currently in memory. This is zero until the
    /// backing store has been loaded.
    pub fn get_count(&mut self) -> usize {
        self.init_if_necessary();
        self.certs.len()
    }

    pub fn set_force_keep_session_state(&mut self) {
        self.init_if_necessary();
        if let Some(backing_store) = &self.backing_store {
            backing_store.set_force_keep_session_state();
        }
    }

    /// Merge `records` into the store. Incoming records replace existing ones
    /// with the same server identifier.
    pub fn initialize_from(&mut self, records: impl IntoIterator<Item = BoundCertRecord>) {
        self.init_if_necessary();

        let records: Vec<BoundCertRecord> = records.into_iter().collect();
        if !self.loaded {
            self.enqueue(PendingTask::InitializeFrom { records });
            return;
        }
        self.sync_initialize_from(records);
    }

    /// Drive the backing store load. Resolves once the load has been merged
    /// and every queued operation has run.
    pub fn poll_load(&mut self, cx: &mut Context<'_>) -> Poll<()> {
        self.init_if_necessary();
        if self.loaded {
            return Poll::Ready(());
        }

        let Some(loading) = self.loading.as_mut() else {
            debug_assert!(false, "store initialized without a pending load");
            return Poll::Ready(());
        };
        let result = ready!(loading.poll_unpin(cx));
        self.loading = None;

        let records = match result {
            Ok(records) => records,
            Err(e) => {
                error!("Failed to load bound certificates: {}", e);
                Vec::new()
            }
        };
        self.on_loaded(records);

        Poll::Ready(())
    }

    pub async fn wait_for_load(&mut self) {
        poll_fn(|cx| self.poll_load(cx)).await
    }

    fn init_if_necessary(&mut self) {
        if self.initialized {
            return;
        }

        if let Some(backing_store) = &self.backing_store {
            debug!("Loading bound certificates from the backing store");
            self.loading = Some(backing_store.load());
        } else {
            self.loaded = true;
        }
        self.initialized = true;
    }

    fn on_loaded(&mut self, records: Vec<BoundCertRecord>) {
        for record in records {
            let server_identifier = record.server_identifier.clone();
            if let Some(previous) = self.certs.insert(server_identifier, record) {
                warn!(
                    "Backing store holds more than one certificate for {}, keeping the last",
                    previous.server_identifier
                );
            }
        }
        self.loaded = true;
        info!("Loaded {} bound certificates", self.certs.len());
        self.check_capacity();

        let tasks = std::mem::take(&mut self.pending_tasks);
        if !tasks.is_empty() {
            debug!("Running {} deferred store operations", tasks.len());
        }
        for task in tasks {
            self.run_task(task);
        }
    }

    fn enqueue(&mut self, task: PendingTask) {
        debug_assert!(!self.loaded);
        trace!("Deferring {} until the backing store is loaded", task.kind());
        self.pending_tasks.push_back(task);
    }

    fn run_task(&mut self, task: PendingTask) {
        trace!("Running deferred {}", task.kind());
        match task {
            PendingTask::Get {
                server_identifier,
                completer,
            } => completer.complete(self.certs.get(&server_identifier).cloned()),
            PendingTask::Set { record } => self.sync_set(record),
            PendingTask::Delete {
                server_identifier,
                completer,
            } => {
                self.sync_delete(&server_identifier);
                completer.complete(());
            }
            PendingTask::DeleteRange {
                begin,
                end,
                completer,
            } => {
                self.sync_delete_between(begin, end);
                completer.complete(());
            }
            PendingTask::GetAll { completer } => completer.complete(self.snapshot()),
            PendingTask::InitializeFrom { records } => self.sync_initialize_from(records),
        }
    }

    fn snapshot(&self) -> Vec<BoundCertRecord> {
        self.certs.values().cloned().collect()
    }

    fn sync_set(&mut self, record: BoundCertRecord) {
        debug_assert!(self.loaded);

        if let Some(previous) = self.certs.remove(&record.server_identifier) {
            self.persist_delete(&previous);
        }
        self.persist_add(&record);
        self.certs.insert(record.server_identifier.clone(), record);
        self.check_capacity();
    }

    fn sync_delete(&mut self, server_identifier: &str) {
        debug_assert!(self.loaded);

        if let Some(record) = self.certs.remove(server_identifier) {
            self.persist_delete(&record);
        }
    }

    fn sync_delete_between(&mut self, begin: Option<DateTime<Utc>>, end: Option<DateTime<Utc>>) {
        debug_assert!(self.loaded);

        let doomed: Vec<String> = self
            .certs
            .values()
            .filter(|record| record.created_between(begin, end))
            .map(|record| record.server_identifier.clone())
            .collect();
        debug!("Deleting {} bound certificates", doomed.len());

        for server_identifier in doomed {
            self.sync_delete(&server_identifier);
        }
    }

    fn sync_initialize_from(&mut self, records: Vec<BoundCertRecord>) {
        debug_assert!(self.loaded);

        for record in records {
            self.sync_set(record);
        }
    }

    fn persist_add(&self, record: &BoundCertRecord) {
        if let Some(backing_store) = &self.backing_store {
            if let Err(e) = backing_store.add(record) {
                error!(
                    "Failed to persist the certificate for {}: {}",
                    record.server_identifier, e
                );
            }
        }
    }

    fn persist_delete(&self, record: &BoundCertRecord) {
        if let Some(backing_store) = &self.backing_store {
            if let Err(e) = backing_store.delete(record) {
                error!(
                    "Failed to remove the persisted certificate for {}: {}",
                    record.server_identifier, e
                );
            }
        }
    }

    fn check_capacity(&self) {
        if self.certs.len() > self.config.max_records {
            warn!(
                "{} bound certificates exceed the configured limit of {}",
                self.certs.len(),
                self.config.max_records
            );
        }
    }
}

impl Debug for BoundCertStore {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BoundCertStore")
            .field("config", &self.config)
            .field("backing_store", &self.backing_store)
            .field("certs", &self.certs.len())
            .field("pending_tasks", &self.pending_tasks.len())
            .field("initialized", &self.initialized)
            .field("loaded", &self.loaded)
            .finish()
    }
}

impl Drop for BoundCertStore {
    fn drop(&mut self) {
        if !self.pending_tasks.is_empty() {
            debug!(
                "Dropping {} deferred operations before the backing store loaded",
                self.pending_tasks.len()
            );
        }
    }
}
