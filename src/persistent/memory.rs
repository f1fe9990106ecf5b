use super::PersistentStore;
use crate::{
    error::{AppResult, ErrorReason},
    types::BoundCertRecord,
};
use futures::{future::BoxFuture, FutureExt};
use std::{
    collections::HashMap,
    sync::{
        atomic::{AtomicBool, AtomicUsize, Ordering},
        Mutex,
    },
};

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum PersistentOp {
    Add(String),
    Delete(String),
}

/// A backing store that keeps everything in memory and records the calls made
/// against it.
#[derive(Debug, Default)]
pub struct MemoryPersistentStore {
    seed: Vec<BoundCertRecord>,
    records: Mutex<HashMap<String, BoundCertRecord>>,
    ops: Mutex<Vec<PersistentOp>>,
    loads: AtomicUsize,
    force_keep_session_state: AtomicBool,
}

impl MemoryPersistentStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Create a store whose `load` hands back `seed`, duplicates included.
    pub fn with_records(seed: Vec<BoundCertRecord>) -> Self {
        let records = seed
            .iter()
            .map(|record| (record.server_identifier.clone(), record.clone()))
            .collect();
        Self {
            seed,
            records: Mutex::new(records),
            ..Default::default()
        }
    }

    pub fn ops(&self) -> Vec<PersistentOp> {
        self.ops
            .lock()
            .map(|ops| ops.clone())
            .unwrap_or_default()
    }

    pub fn records(&self) -> Vec<BoundCertRecord> {
        self.records
            .lock()
            .map(|records| records.values().cloned().collect())
            .unwrap_or_default()
    }

    pub fn load_count(&self) -> usize {
        self.loads.load(Ordering::Relaxed)
    }

    pub fn force_keep_session_state(&self) -> bool {
        self.force_keep_session_state.load(Ordering::Relaxed)
    }

    fn record_op(&self, op: PersistentOp) -> AppResult<()> {
        self.ops
            .lock()
            .map_err(|_| ErrorReason::LockPoisoned)?
            .push(op);
        Ok(())
    }
}

impl PersistentStore for MemoryPersistentStore {
    fn load(&self) -> BoxFuture<'static, AppResult<Vec<BoundCertRecord>>> {
        self.loads.fetch_add(1, Ordering::Relaxed);
        let seed = self.seed.clone();
        async move { Ok(seed) }.boxed()
    }

    fn add(&self, record: &BoundCertRecord) -> AppResult<()> {
        self.records
            .lock()
            .map_err(|_| ErrorReason::LockPoisoned)?
            .insert(record.server_identifier.clone(), record.clone());
        self.record_op(PersistentOp::Add(record.server_identifier.clone()))
    }

    fn delete(&self, record: &BoundCertRecord) -> AppResult<()> {
        self.records
            .lock()
            .map_err(|_| ErrorReason::LockPoisoned)?
            .remove(&record.server_identifier);
        self.record_op(PersistentOp::Delete(record.server_identifier.clone()))
    }

    fn set_force_keep_session_state(&self) {
        self.force_keep_session_state.store(true, Ordering::Relaxed);
    }
}
