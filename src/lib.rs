//! Offline-first action queue and synchronization engine for the club
//! attendance/duty tracker. Intent is persisted durably the moment the user
//! acts, projected optimistically into a local cache, and replayed serially
//! against the server once connectivity returns.

pub mod classify;
pub mod clock;
pub mod config;
mod coordinator;
pub mod db;
pub mod error;
pub mod model;
pub mod service;
pub mod transport;

pub use error::{EngineError, TransportError};
pub use model::{ActionStatus, ActionType, EngineSnapshot, OptimisticRecord, QueuedAction};
pub use service::{SyncOptions, SyncService};
