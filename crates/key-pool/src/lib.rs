//! Time-bounded credential pool
//!
//! Holds API keys in a persistent pool scored by admission time, validates
//! them against the upstream they authorize, and mirrors the settled part of
//! the pool to an external key-value store. All outside systems are reached
//! through the `upstream` traits.
//!
//! Key lifecycle:
//! 1. A credential source (or an operator) hands over a key → admitted with
//!    its observed age; keys already past the TTL are rejected
//! 2. Re-admitting a key never makes it younger
//! 3. The validate job samples a key; a `Dead` verdict evicts it, a transport
//!    error leaves it alone
//! 4. The reconcile job evicts keys the mirror marks dead, samples one more,
//!    and pushes keys older than two acquire intervals to the mirror snapshot
//! 5. Keys age out of every default listing once the TTL has passed

pub mod classify;
pub mod clock;
pub mod error;
pub mod jobs;
pub mod manager;
pub mod reconcile;
pub mod scheduler;
pub mod store;

pub use classify::{classify_429, classify_status};
pub use clock::{Clock, ManualClock, SystemClock};
pub use error::{Error, Result};
pub use jobs::{ACQUIRE_JOB, AcquireJob, RECONCILE_JOB, ReconcileJob, VALIDATE_JOB, ValidateJob};
pub use manager::{EvictionReason, PoolManager, SAMPLE_ATTEMPTS};
pub use reconcile::{MirrorLayout, PushOutcome, ReconcileReport, Reconciler};
pub use scheduler::{
    Job, JobOutcome, JobState, ScheduleInfo, Scheduler, fire_spacing, parse_expression,
};
pub use store::{Admission, PoolStore};
