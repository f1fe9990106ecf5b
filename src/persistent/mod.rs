use crate::{error::AppResult, types::BoundCertRecord};
use futures::future::BoxFuture;
use std::fmt::Debug;

mod json_file;
mod memory;

pub use json_file::JsonFileStore;
pub use memory::{MemoryPersistentStore, PersistentOp};

/// Durable storage behind a [`BoundCertStore`](crate::store::BoundCertStore).
///
/// The store calls `load` once and only mutates through `add` and `delete`
/// after the load result has been merged.
pub trait PersistentStore: Send + Sync + Debug {
    /// Read back every persisted record.
    ///
    /// The returned future is polled by the owning store; it must not do any
    /// work that completes the load before it is first polled.
    fn load(&self) -> BoxFuture<'static, AppResult<Vec<BoundCertRecord>>>;

    /// Persist one record. Called from the store's synchronous methods, so an
    /// implementation doing file or network I/O blocks the calling thread.
    fn add(&self, record: &BoundCertRecord) -> AppResult<()>;

    /// Remove one record. Blocks like [`PersistentStore::add`].
    fn delete(&self, record: &BoundCertRecord) -> AppResult<()>;

    /// Keep session-scoped records across shutdown.
    fn set_force_keep_session_state(&self);
}
