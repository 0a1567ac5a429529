//! Registered entry lifecycle
//!
//! An [`Entry`] binds a compiled schedule to a callback together with a run
//! budget, a singleton flag and a lifecycle status. All mutable fields are
//! atomics: they are written both by the scheduler's tick loop and by
//! external `start`/`stop`/`close` calls from arbitrary tasks.

use crate::parser::CompiledSchedule;
use crate::types::{JobFn, Status};
use chrono::{DateTime, TimeZone, Utc};
use std::sync::atomic::{AtomicBool, AtomicI64, AtomicU8, Ordering};

/// Sentinel for an unbounded run budget
const UNLIMITED_RUNS: i64 = -1;

/// Heartbeat jitter tolerance in seconds
///
/// A tick arriving up to this late is treated as the next consecutive
/// second; a larger gap resynchronizes to the current timestamp and missed
/// fires are not replayed.
const TICK_JITTER_TOLERANCE: i64 = 3;

/// Drift-correction state for one entry
///
/// Tracks the last corrected heartbeat and the last schedule hit, both as
/// unix seconds (0 = never observed).
#[derive(Debug, Default)]
struct TickState {
    last_check: AtomicI64,
    last_meet: AtomicI64,
}

impl TickState {
    /// Apply the drift rule to a raw heartbeat timestamp
    ///
    /// A gap of one second is on time. A gap of two or three seconds is
    /// tolerated jitter: the internal clock advances by a single second so
    /// the delayed tick neither skips a fire nor double-fires. Anything else
    /// (including the very first tick) resynchronizes to the raw timestamp.
    fn effective_timestamp(&self, now_ts: i64) -> i64 {
        let last = self.last_check.load(Ordering::Acquire);
        let gap = now_ts - last;
        let effective = if last == 0 || gap == 1 || gap > TICK_JITTER_TOLERANCE || gap <= 0 {
            now_ts
        } else {
            last + 1
        };
        self.last_check.store(effective, Ordering::Release);
        effective
    }
}

/// A registered (schedule, callback) pair with its own lifecycle
///
/// Entries are created by the scheduler's `add*` methods and owned by its
/// registry; callers hold shared handles and interact through the lifecycle
/// methods only.
pub struct Entry {
    id: u64,
    name: String,
    schedule: CompiledSchedule,
    job: JobFn,
    singleton: bool,
    remaining: AtomicI64,
    status: AtomicU8,
    in_flight: AtomicBool,
    created_at: DateTime<Utc>,
    tick_state: TickState,
}

impl std::fmt::Debug for Entry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Entry")
            .field("id", &self.id)
            .field("name", &self.name)
            .field("pattern", &self.schedule.pattern)
            .field("singleton", &self.singleton)
            .field("status", &self.status())
            .field("remaining_runs", &self.remaining_runs())
            .finish()
    }
}

impl Entry {
    pub(crate) fn new(
        id: u64,
        name: String,
        schedule: CompiledSchedule,
        job: JobFn,
        singleton: bool,
        times: Option<usize>,
    ) -> Self {
        Self {
            id,
            name,
            schedule,
            job,
            singleton,
            remaining: AtomicI64::new(times.map_or(UNLIMITED_RUNS, |t| t as i64)),
            status: AtomicU8::new(Status::Ready.as_u8()),
            in_flight: AtomicBool::new(false),
            created_at: Utc::now(),
            tick_state: TickState::default(),
        }
    }

    /// Monotonic registration id
    pub fn id(&self) -> u64 {
        self.id
    }

    /// Unique registry name
    pub fn name(&self) -> &str {
        &self.name
    }

    /// The compiled schedule driving this entry
    pub fn schedule(&self) -> &CompiledSchedule {
        &self.schedule
    }

    /// Registration timestamp
    pub fn created_at(&self) -> DateTime<Utc> {
        self.created_at
    }

    /// Whether successive invocations are forbidden from overlapping
    pub fn is_singleton(&self) -> bool {
        self.singleton
    }

    /// Remaining run budget; `None` means unlimited
    pub fn remaining_runs(&self) -> Option<u64> {
        match self.remaining.load(Ordering::Acquire) {
            UNLIMITED_RUNS => None,
            n => Some(n.max(0) as u64),
        }
    }

    /// Current lifecycle status
    pub fn status(&self) -> Status {
        Status::from_u8(self.status.load(Ordering::Acquire))
    }

    /// Last time the schedule matched a heartbeat, if any
    pub fn last_meet(&self) -> Option<DateTime<Utc>> {
        match self.tick_state.last_meet.load(Ordering::Acquire) {
            0 => None,
            ts => Utc.timestamp_opt(ts, 0).single(),
        }
    }

    /// Last (drift-corrected) heartbeat this entry observed, if any
    pub fn last_heartbeat(&self) -> Option<DateTime<Utc>> {
        match self.tick_state.last_check.load(Ordering::Acquire) {
            0 => None,
            ts => Utc.timestamp_opt(ts, 0).single(),
        }
    }

    /// Next time the schedule fires strictly after `from`
    pub fn next_run(&self, from: DateTime<Utc>) -> Option<DateTime<Utc>> {
        self.schedule.next_after(from)
    }

    /// Resume a stopped entry (`Stopped → Ready`)
    ///
    /// Returns whether a transition happened.
    pub fn start(&self) -> bool {
        self.status
            .compare_exchange(
                Status::Stopped.as_u8(),
                Status::Ready.as_u8(),
                Ordering::AcqRel,
                Ordering::Acquire,
            )
            .is_ok()
    }

    /// Suspend dispatch (`Ready/Running → Stopped`) without destroying the entry
    ///
    /// An invocation already in flight keeps running; only future dispatch
    /// is prevented. Returns whether a transition happened.
    pub fn stop(&self) -> bool {
        loop {
            let current = self.status.load(Ordering::Acquire);
            if !Status::from_u8(current).is_dispatchable() {
                return false;
            }
            if self
                .status
                .compare_exchange(
                    current,
                    Status::Stopped.as_u8(),
                    Ordering::AcqRel,
                    Ordering::Acquire,
                )
                .is_ok()
            {
                return true;
            }
        }
    }

    /// Terminate the entry; idempotent
    pub fn close(&self) {
        self.status.store(Status::Closed.as_u8(), Ordering::Release);
    }

    /// Drift-corrected schedule check for one heartbeat
    ///
    /// Interval schedules match against the raw tick time relative to their
    /// compile anchor. Field schedules match the corrected effective time
    /// and are additionally guarded by the schedule's minimum fire interval
    /// so a late heartbeat cannot re-trigger inside one granular window.
    pub(crate) fn schedule_meets(&self, now: DateTime<Utc>) -> bool {
        if self.schedule.is_interval() {
            if !self.schedule.matches(&now) {
                return false;
            }
            self.tick_state
                .last_meet
                .store(now.timestamp(), Ordering::Release);
            return true;
        }

        let effective_ts = self.tick_state.effective_timestamp(now.timestamp());
        let effective = match Utc.timestamp_opt(effective_ts, 0).single() {
            Some(t) => t,
            None => return false,
        };
        if !self.schedule.matches(&effective) {
            return false;
        }

        let last_meet = self.tick_state.last_meet.load(Ordering::Acquire);
        if last_meet > 0 && effective_ts - last_meet < self.schedule.min_interval_secs() {
            return false;
        }

        self.tick_state
            .last_meet
            .store(effective_ts, Ordering::Release);
        true
    }

    /// Claim an invocation slot for this dispatch
    ///
    /// For singleton entries this is a test-and-set on the in-flight guard;
    /// a tick meeting the schedule while a previous invocation still runs is
    /// dropped. Marks the entry `Running` on success.
    pub(crate) fn try_acquire_flight(&self) -> bool {
        if self.singleton
            && self
                .in_flight
                .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
                .is_err()
        {
            return false;
        }
        if !self.singleton {
            self.in_flight.store(true, Ordering::Release);
        }
        let _ = self.status.compare_exchange(
            Status::Ready.as_u8(),
            Status::Running.as_u8(),
            Ordering::AcqRel,
            Ordering::Acquire,
        );
        true
    }

    /// Release the invocation slot once the callback completes
    pub(crate) fn release_flight(&self) {
        self.in_flight.store(false, Ordering::Release);
        let _ = self.status.compare_exchange(
            Status::Running.as_u8(),
            Status::Ready.as_u8(),
            Ordering::AcqRel,
            Ordering::Acquire,
        );
    }

    /// Consume one run from the budget
    ///
    /// Returns `Some(true)` when this dispatch exhausts a finite budget,
    /// `Some(false)` when runs remain (or the budget is unlimited), and
    /// `None` when the budget was already spent and dispatch must be
    /// skipped (the entry is pending closure by its last invocation).
    pub(crate) fn consume_run(&self) -> Option<bool> {
        if self.remaining.load(Ordering::Acquire) == UNLIMITED_RUNS {
            return Some(false);
        }
        match self
            .remaining
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |n| {
                if n > 0 {
                    Some(n - 1)
                } else {
                    None
                }
            }) {
            Ok(previous) => Some(previous == 1),
            Err(_) => None,
        }
    }

    pub(crate) fn job(&self) -> JobFn {
        self.job.clone()
    }
}
