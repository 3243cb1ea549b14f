//! Embedded transactional storage.
//!
//! A [`StateStore`] holds named queues and dictionaries. Changes are made
//! inside a [`Transaction`] and become durable as one commit log frame.

pub mod commit_log;
pub mod retry;
pub mod snapshot;
pub mod store;

pub use commit_log::{CommitFrame, CommitLog, LogOperation};
pub use retry::with_retry;
pub use snapshot::{CollectionData, StoreImage};
pub use store::{CollectionKind, StateStore, Transaction};
