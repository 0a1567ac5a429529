//! Cronbeat - heartbeat-driven cron scheduling
//!
//! Compiles extended cron patterns into executable time predicates and
//! drives registered async callbacks once per heartbeat tick, with:
//! - Extended 6-field cron syntax (`sec min hour day month weekday`),
//!   predefined `@aliases` and `@every <duration>` intervals
//! - Run-count budgets (`add_once`, `add_times`)
//! - Singleton (non-overlapping) execution
//! - Drift tolerance for heartbeats that arrive a few seconds late
//! - Graceful shutdown that waits for in-flight callbacks
//!
//! ## Quick Start
//!
//! ```ignore
//! use cronbeat::Scheduler;
//!
//! let scheduler = Scheduler::new();
//!
//! // Every day at 02:00, never overlapping.
//! scheduler.add_singleton("0 0 2 * * *", Some("backup"), || async {
//!     run_backup().await;
//! }).await?;
//!
//! // Twice, 90 seconds apart, counted from registration.
//! scheduler.add_times("@every 1m30s", 2, None, || async {
//!     warm_cache().await;
//! }).await?;
//!
//! // Drive evaluation with the built-in 1-second heartbeat...
//! scheduler.spawn_heartbeat();
//!
//! // ...and shut down gracefully when done.
//! scheduler.close().await;
//! ```
//!
//! Tests (and embedders with their own clock) can skip the heartbeat task
//! and call [`Scheduler::tick`] directly with synthetic timestamps.

mod entry;
mod parser;
mod scheduler;
mod types;

pub use entry::Entry;
pub use parser::CompiledSchedule;
pub use scheduler::{Scheduler, SchedulerEvent};
pub use types::{CronError, JobFn, JobFuture, Result, Status};

use std::sync::OnceLock;

static GLOBAL: OnceLock<Scheduler> = OnceLock::new();

/// The process-wide default scheduler
///
/// Lazily initialized on first use and never torn down implicitly; call
/// [`Scheduler::close`] on it during application shutdown. Prefer
/// constructing isolated [`Scheduler::new`] instances in tests.
pub fn global() -> &'static Scheduler {
    GLOBAL.get_or_init(Scheduler::new)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_global_is_singleton() {
        let a = global() as *const Scheduler;
        let b = global() as *const Scheduler;
        assert_eq!(a, b);
    }
}
