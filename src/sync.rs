//! Incremental synchronization of reading lists.
//!
//! A collection sync lists the remote reading list, reconciles it against the
//! stored entries, prunes entries that left the list and dispatches one
//! [`Job::FetchItem`] per work that needs metadata. Item fetches link first and
//! fetch second, so every job can be retried without losing associations.

mod dispatch;
mod mode;
mod orchestrator;
mod reconcile;
mod worker;

pub use dispatch::{Dispatcher, Job, JobBuffer, JobQueue, JobReceiver, JobRunner, Priority};
pub use mode::{FetchMode, FetchModes};
pub use orchestrator::{DrainReport, SyncEngine, SyncOutcome};
pub use reconcile::{Reconciliation, reconcile};
pub use worker::ItemOutcome;
