//! Controller runtime shared by the convoy operators: the work queue and
//! control loop, the finalizer deletion protocol and the cluster sweeper.

pub mod controller;
pub mod error;
pub mod finalizer;
pub mod queue;
pub mod rate_limit;
pub mod sweeper;

pub use controller::{Controller, ControllerConfig, Processed, SyncHandler};
pub use error::{ErrorPolicy, ReconcileError, RuntimeError, into_internal};
pub use finalizer::{Cleanup, Teardown, ensure_finalizer, remove_finalizer};
pub use queue::WorkQueue;
pub use rate_limit::{ItemExponentialFailureRateLimiter, RateLimiter};
pub use sweeper::{SweepConfig, SweepError, SweepOutcome, Sweeper};
