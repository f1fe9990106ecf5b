//! An asynchronously loaded cache of origin-bound certificates.
//!
//! [`BoundCertStore`] keeps every certificate in memory and mirrors each
//! mutation to an optional [`PersistentStore`]. Operations issued while the
//! persistent store is still loading are queued and replayed in order once it
//! finishes.

#[macro_use]
extern crate tracing;

pub mod components;
pub mod configs;
pub mod error;
pub mod persistent;
pub mod store;
pub mod types;

pub use error::{AppError, AppResult, ErrorReason};
pub use persistent::PersistentStore;
pub use store::{BoundCertStore, CertLookup, Pending};
pub use types::BoundCertRecord;
