//! Heartbeat-driven scheduler
//!
//! Owns the name-keyed entry registry, evaluates every dispatchable entry
//! once per heartbeat tick, and runs due callbacks on their own tokio tasks
//! so a slow job never blocks other entries or the next tick.

use crate::entry::Entry;
use crate::parser::CompiledSchedule;
use crate::types::{CronError, JobFn, JobFuture, Result, Status};
use chrono::{DateTime, Utc};
use std::collections::HashMap;
use std::future::Future;
use std::sync::atomic::{AtomicU8, AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{broadcast, Notify, RwLock};
use tokio::time::MissedTickBehavior;
use uuid::Uuid;

/// Scheduler events for monitoring
///
/// Delivered over a broadcast channel; lagging receivers lose events. This
/// is a sink for observers, never a control path.
#[derive(Debug, Clone)]
pub enum SchedulerEvent {
    /// Scheduler resumed dispatching
    Started,
    /// Scheduler suspended dispatching
    Stopped,
    /// Scheduler closed; no further ticks will be evaluated
    Closed,
    /// An entry's callback was dispatched
    JobStarted { name: String },
    /// An entry's callback returned
    JobFinished { name: String },
    /// An entry's callback panicked (recovered and logged)
    JobPanicked { name: String, message: String },
    /// An entry spent its run budget and was removed
    JobExhausted { name: String },
}

struct Inner {
    entries: RwLock<HashMap<String, Arc<Entry>>>,
    id_gen: AtomicU64,
    status: AtomicU8,
    in_flight: AtomicUsize,
    idle: Notify,
    event_tx: broadcast::Sender<SchedulerEvent>,
}

/// Cron scheduler
///
/// Cloning is cheap and shares the same registry. The scheduler never reads
/// the wall clock itself: time arrives through [`tick`](Scheduler::tick),
/// either injected by tests or produced by the task spawned from
/// [`spawn_heartbeat`](Scheduler::spawn_heartbeat).
#[derive(Clone)]
pub struct Scheduler {
    inner: Arc<Inner>,
}

impl Default for Scheduler {
    fn default() -> Self {
        Self::new()
    }
}

impl Scheduler {
    /// Create an isolated scheduler instance
    pub fn new() -> Self {
        let (event_tx, _) = broadcast::channel(100);
        Self {
            inner: Arc::new(Inner {
                entries: RwLock::new(HashMap::new()),
                id_gen: AtomicU64::new(1),
                status: AtomicU8::new(Status::Ready.as_u8()),
                in_flight: AtomicUsize::new(0),
                idle: Notify::new(),
                event_tx,
            }),
        }
    }

    /// Subscribe to scheduler events
    pub fn subscribe(&self) -> broadcast::Receiver<SchedulerEvent> {
        self.inner.event_tx.subscribe()
    }

    /// Current scheduler status
    pub fn status(&self) -> Status {
        Status::from_u8(self.inner.status.load(Ordering::Acquire))
    }

    // ========================================================================
    // Registration
    // ========================================================================

    /// Register an entry with an unlimited run budget
    ///
    /// `name` is the unique registry key; when `None`, a UUID-based name is
    /// generated. Returns the shared entry handle.
    pub async fn add<F, Fut>(&self, pattern: &str, name: Option<&str>, job: F) -> Result<Arc<Entry>>
    where
        F: Fn() -> Fut + Send + Sync + 'static,
        Fut: Future<Output = ()> + Send + 'static,
    {
        self.register(pattern, name, false, None, into_job_fn(job))
            .await
    }

    /// Register an entry whose invocations never overlap
    ///
    /// A tick that meets the schedule while a previous invocation is still
    /// running is dropped, not queued.
    pub async fn add_singleton<F, Fut>(
        &self,
        pattern: &str,
        name: Option<&str>,
        job: F,
    ) -> Result<Arc<Entry>>
    where
        F: Fn() -> Fut + Send + Sync + 'static,
        Fut: Future<Output = ()> + Send + 'static,
    {
        self.register(pattern, name, true, None, into_job_fn(job))
            .await
    }

    /// Register an entry that runs exactly once
    pub async fn add_once<F, Fut>(
        &self,
        pattern: &str,
        name: Option<&str>,
        job: F,
    ) -> Result<Arc<Entry>>
    where
        F: Fn() -> Fut + Send + Sync + 'static,
        Fut: Future<Output = ()> + Send + 'static,
    {
        self.register(pattern, name, false, Some(1), into_job_fn(job))
            .await
    }

    /// Register an entry that runs exactly `times` times
    pub async fn add_times<F, Fut>(
        &self,
        pattern: &str,
        times: usize,
        name: Option<&str>,
        job: F,
    ) -> Result<Arc<Entry>>
    where
        F: Fn() -> Fut + Send + Sync + 'static,
        Fut: Future<Output = ()> + Send + 'static,
    {
        self.register(pattern, name, false, Some(times), into_job_fn(job))
            .await
    }

    /// Register an entry after a one-shot delay
    ///
    /// The registration itself is deferred on a spawned timer, not through
    /// the cron registry; a failure at registration time is logged rather
    /// than returned. Must be called within a tokio runtime.
    pub fn delay_add<F, Fut>(&self, delay: Duration, pattern: &str, name: Option<&str>, job: F)
    where
        F: Fn() -> Fut + Send + Sync + 'static,
        Fut: Future<Output = ()> + Send + 'static,
    {
        self.delay_register(delay, pattern, name, false, None, into_job_fn(job));
    }

    /// Register a singleton entry after a one-shot delay
    pub fn delay_add_singleton<F, Fut>(
        &self,
        delay: Duration,
        pattern: &str,
        name: Option<&str>,
        job: F,
    ) where
        F: Fn() -> Fut + Send + Sync + 'static,
        Fut: Future<Output = ()> + Send + 'static,
    {
        self.delay_register(delay, pattern, name, true, None, into_job_fn(job));
    }

    /// Register a run-once entry after a one-shot delay
    pub fn delay_add_once<F, Fut>(&self, delay: Duration, pattern: &str, name: Option<&str>, job: F)
    where
        F: Fn() -> Fut + Send + Sync + 'static,
        Fut: Future<Output = ()> + Send + 'static,
    {
        self.delay_register(delay, pattern, name, false, Some(1), into_job_fn(job));
    }

    /// Register a bounded entry after a one-shot delay
    pub fn delay_add_times<F, Fut>(
        &self,
        delay: Duration,
        pattern: &str,
        times: usize,
        name: Option<&str>,
        job: F,
    ) where
        F: Fn() -> Fut + Send + Sync + 'static,
        Fut: Future<Output = ()> + Send + 'static,
    {
        self.delay_register(delay, pattern, name, false, Some(times), into_job_fn(job));
    }

    fn delay_register(
        &self,
        delay: Duration,
        pattern: &str,
        name: Option<&str>,
        singleton: bool,
        times: Option<usize>,
        job: JobFn,
    ) {
        let scheduler = self.clone();
        let pattern = pattern.to_string();
        let name = name.map(str::to_string);
        tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            if let Err(e) = scheduler
                .register(&pattern, name.as_deref(), singleton, times, job)
                .await
            {
                tracing::error!(pattern = %pattern, error = %e, "delayed registration failed");
            }
        });
    }

    async fn register(
        &self,
        pattern: &str,
        name: Option<&str>,
        singleton: bool,
        times: Option<usize>,
        job: JobFn,
    ) -> Result<Arc<Entry>> {
        if self.status() == Status::Closed {
            return Err(CronError::SchedulerClosed);
        }
        if times == Some(0) {
            return Err(CronError::InvalidTimes(0));
        }

        let schedule = CompiledSchedule::compile(pattern)?;
        let name = name
            .map(str::to_string)
            .unwrap_or_else(|| format!("cron-{}", Uuid::new_v4()));

        let mut entries = self.inner.entries.write().await;
        if entries.contains_key(&name) {
            return Err(CronError::DuplicateName(name));
        }

        let id = self.inner.id_gen.fetch_add(1, Ordering::Relaxed);
        let entry = Arc::new(Entry::new(id, name.clone(), schedule, job, singleton, times));
        entries.insert(name.clone(), entry.clone());

        tracing::debug!(name = %name, pattern = %pattern, singleton, "entry registered");
        Ok(entry)
    }

    // ========================================================================
    // Registry operations
    // ========================================================================

    /// Remove an entry by name
    pub async fn remove(&self, name: &str) -> Result<()> {
        match self.inner.entries.write().await.remove(name) {
            Some(entry) => {
                entry.close();
                tracing::debug!(name = %name, "entry removed");
                Ok(())
            }
            None => Err(CronError::NotFound(name.to_string())),
        }
    }

    /// Look up an entry by name
    pub async fn search(&self, name: &str) -> Option<Arc<Entry>> {
        self.inner.entries.read().await.get(name).cloned()
    }

    /// All registered entries, ordered by registration time
    pub async fn entries(&self) -> Vec<Arc<Entry>> {
        let mut entries: Vec<Arc<Entry>> =
            self.inner.entries.read().await.values().cloned().collect();
        entries.sort_by_key(|e| e.id());
        entries
    }

    /// Number of registered entries
    pub async fn size(&self) -> usize {
        self.inner.entries.read().await.len()
    }

    /// Resume a stopped entry; unknown names are a no-op
    pub async fn start_entry(&self, name: &str) {
        match self.search(name).await {
            Some(entry) => {
                entry.start();
            }
            None => tracing::debug!(name = %name, "start requested for unknown entry"),
        }
    }

    /// Suspend an entry; unknown names are a no-op
    pub async fn stop_entry(&self, name: &str) {
        match self.search(name).await {
            Some(entry) => {
                entry.stop();
            }
            None => tracing::debug!(name = %name, "stop requested for unknown entry"),
        }
    }

    // ========================================================================
    // Lifecycle
    // ========================================================================

    /// Resume dispatching after [`stop`](Scheduler::stop)
    pub fn start(&self) {
        if self
            .inner
            .status
            .compare_exchange(
                Status::Stopped.as_u8(),
                Status::Ready.as_u8(),
                Ordering::AcqRel,
                Ordering::Acquire,
            )
            .is_ok()
        {
            tracing::debug!("scheduler started");
            let _ = self.inner.event_tx.send(SchedulerEvent::Started);
        }
    }

    /// Suspend dispatching; entries and in-flight invocations are untouched
    pub fn stop(&self) {
        loop {
            let current = self.inner.status.load(Ordering::Acquire);
            if !Status::from_u8(current).is_dispatchable() {
                return;
            }
            if self
                .inner
                .status
                .compare_exchange(
                    current,
                    Status::Stopped.as_u8(),
                    Ordering::AcqRel,
                    Ordering::Acquire,
                )
                .is_ok()
            {
                tracing::debug!("scheduler stopped");
                let _ = self.inner.event_tx.send(SchedulerEvent::Stopped);
                return;
            }
        }
    }

    /// Close the scheduler and wait for in-flight invocations to complete
    ///
    /// Terminal and idempotent. New ticks and registrations are rejected
    /// immediately; running callbacks are never interrupted, so this waits
    /// for however long user callbacks take.
    pub async fn close(&self) {
        let previous = self
            .inner
            .status
            .swap(Status::Closed.as_u8(), Ordering::AcqRel);
        if Status::from_u8(previous) != Status::Closed {
            tracing::debug!("scheduler closing, waiting for in-flight jobs");
            let _ = self.inner.event_tx.send(SchedulerEvent::Closed);
        }

        loop {
            let notified = self.inner.idle.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();
            if self.inner.in_flight.load(Ordering::SeqCst) == 0 {
                break;
            }
            notified.await;
        }

        let mut entries = self.inner.entries.write().await;
        for entry in entries.values() {
            entry.close();
        }
        entries.clear();
    }

    // ========================================================================
    // Heartbeat
    // ========================================================================

    /// Evaluate every dispatchable entry against `now`
    ///
    /// Invoked once per heartbeat unit (nominal 1 second), either by the
    /// task from [`spawn_heartbeat`](Scheduler::spawn_heartbeat) or directly
    /// by tests injecting synthetic time. Ignored while the scheduler is
    /// stopped or closed.
    pub async fn tick(&self, now: DateTime<Utc>) {
        if !self.status().is_dispatchable() {
            return;
        }

        // Snapshot so dispatch and concurrent removal never race the map.
        let snapshot: Vec<Arc<Entry>> =
            self.inner.entries.read().await.values().cloned().collect();

        for entry in snapshot {
            if !entry.status().is_dispatchable() {
                continue;
            }
            if entry.schedule_meets(now) {
                self.dispatch(entry);
            }
        }
    }

    /// Spawn the default 1-second heartbeat driver
    ///
    /// The spawned task ticks with the wall clock until the scheduler is
    /// closed. Missed timer ticks are skipped, not replayed; the per-entry
    /// drift correction absorbs small jitter.
    pub fn spawn_heartbeat(&self) -> tokio::task::JoinHandle<()> {
        let _ = self.inner.status.fetch_update(
            Ordering::AcqRel,
            Ordering::Acquire,
            |current| match Status::from_u8(current) {
                Status::Closed => None,
                _ => Some(Status::Running.as_u8()),
            },
        );
        tracing::debug!("heartbeat started");

        let scheduler = self.clone();
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(Duration::from_secs(1));
            ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
            loop {
                ticker.tick().await;
                if scheduler.status() == Status::Closed {
                    break;
                }
                scheduler.tick(Utc::now()).await;
            }
            tracing::debug!("heartbeat stopped");
        })
    }

    /// Run one due entry on its own task
    fn dispatch(&self, entry: Arc<Entry>) {
        if !entry.try_acquire_flight() {
            tracing::debug!(name = %entry.name(), "singleton in flight, tick dropped");
            return;
        }

        let exhausted = match entry.consume_run() {
            Some(exhausted) => exhausted,
            None => {
                // Budget already spent; the final invocation will close it.
                entry.release_flight();
                return;
            }
        };

        self.inner.in_flight.fetch_add(1, Ordering::SeqCst);
        tracing::debug!(name = %entry.name(), "job dispatched");
        let _ = self.inner.event_tx.send(SchedulerEvent::JobStarted {
            name: entry.name().to_string(),
        });

        let inner = self.inner.clone();
        let handle = tokio::spawn((entry.job())());
        tokio::spawn(async move {
            let name = entry.name().to_string();
            match handle.await {
                Ok(()) => {
                    tracing::debug!(name = %name, "job finished");
                    let _ = inner
                        .event_tx
                        .send(SchedulerEvent::JobFinished { name: name.clone() });
                }
                Err(e) if e.is_panic() => {
                    let payload = e.into_panic();
                    let message = payload
                        .downcast_ref::<&str>()
                        .map(|s| s.to_string())
                        .or_else(|| payload.downcast_ref::<String>().cloned())
                        .unwrap_or_else(|| "unknown panic".to_string());
                    tracing::error!(name = %name, panic = %message, "job panicked");
                    let _ = inner.event_tx.send(SchedulerEvent::JobPanicked {
                        name: name.clone(),
                        message,
                    });
                }
                Err(e) => {
                    tracing::error!(name = %name, error = %e, "job task aborted");
                }
            }

            entry.release_flight();

            if exhausted {
                entry.close();
                let mut entries = inner.entries.write().await;
                if let Some(current) = entries.get(&name) {
                    if Arc::ptr_eq(current, &entry) {
                        entries.remove(&name);
                    }
                }
                drop(entries);
                tracing::debug!(name = %name, "run budget exhausted, entry closed");
                let _ = inner.event_tx.send(SchedulerEvent::JobExhausted { name });
            }

            if inner.in_flight.fetch_sub(1, Ordering::SeqCst) == 1 {
                inner.idle.notify_waiters();
            }
        });
    }
}

fn into_job_fn<F, Fut>(job: F) -> JobFn
where
    F: Fn() -> Fut + Send + Sync + 'static,
    Fut: Future<Output = ()> + Send + 'static,
{
    Arc::new(move || Box::pin(job()) as JobFuture)
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use std::sync::atomic::AtomicUsize;

    fn t0() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2026, 3, 1, 12, 0, 0).unwrap()
    }

    /// Drive `n` consecutive one-second ticks starting at `from`
    async fn run_ticks(scheduler: &Scheduler, from: DateTime<Utc>, n: i64) {
        for i in 0..n {
            scheduler.tick(from + chrono::Duration::seconds(i)).await;
        }
    }

    /// Let spawned job tasks run to completion under paused time
    async fn settle() {
        tokio::time::sleep(Duration::from_millis(50)).await;
    }

    #[tokio::test]
    async fn test_add_and_search() {
        let scheduler = Scheduler::new();
        scheduler
            .add("* * * * * *", Some("findme"), || async {})
            .await
            .unwrap();

        assert!(scheduler.search("findme").await.is_some());
        assert!(scheduler.search("missing").await.is_none());
        assert_eq!(scheduler.size().await, 1);
    }

    #[tokio::test]
    async fn test_add_duplicate_name() {
        let scheduler = Scheduler::new();
        scheduler
            .add("* * * * * *", Some("unique"), || async {})
            .await
            .unwrap();

        let result = scheduler.add("* * * * * *", Some("unique"), || async {}).await;
        assert!(matches!(result, Err(CronError::DuplicateName(_))));
    }

    #[tokio::test]
    async fn test_add_invalid_pattern() {
        let scheduler = Scheduler::new();
        let result = scheduler.add("not a pattern", None, || async {}).await;
        assert!(matches!(result, Err(CronError::InvalidPattern(_))));
    }

    #[tokio::test]
    async fn test_add_times_zero_rejected() {
        let scheduler = Scheduler::new();
        let result = scheduler
            .add_times("* * * * * *", 0, None, || async {})
            .await;
        assert!(matches!(result, Err(CronError::InvalidTimes(0))));
    }

    #[tokio::test]
    async fn test_auto_generated_names_are_unique() {
        let scheduler = Scheduler::new();
        let a = scheduler.add("* * * * * *", None, || async {}).await.unwrap();
        let b = scheduler.add("* * * * * *", None, || async {}).await.unwrap();
        assert!(!a.name().is_empty());
        assert_ne!(a.name(), b.name());
    }

    #[tokio::test]
    async fn test_entries_ordered_by_registration() {
        let scheduler = Scheduler::new();
        for name in ["zeta", "alpha", "mid"] {
            scheduler
                .add("* * * * * *", Some(name), || async {})
                .await
                .unwrap();
        }

        let names: Vec<String> = scheduler
            .entries()
            .await
            .iter()
            .map(|e| e.name().to_string())
            .collect();
        assert_eq!(names, vec!["zeta", "alpha", "mid"]);
    }

    #[tokio::test]
    async fn test_remove() {
        let scheduler = Scheduler::new();
        scheduler
            .add("* * * * * *", Some("gone"), || async {})
            .await
            .unwrap();

        scheduler.remove("gone").await.unwrap();
        assert!(scheduler.search("gone").await.is_none());
        assert!(matches!(
            scheduler.remove("gone").await,
            Err(CronError::NotFound(_))
        ));
    }

    #[tokio::test(start_paused = true)]
    async fn test_tick_dispatches_due_entries() {
        let scheduler = Scheduler::new();
        let count = Arc::new(AtomicUsize::new(0));
        let c = count.clone();
        scheduler
            .add("* * * * * *", Some("counter"), move || {
                let c = c.clone();
                async move {
                    c.fetch_add(1, Ordering::SeqCst);
                }
            })
            .await
            .unwrap();

        run_ticks(&scheduler, t0(), 3).await;
        settle().await;
        assert_eq!(count.load(Ordering::SeqCst), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn test_run_count_exactness() {
        let scheduler = Scheduler::new();
        let count = Arc::new(AtomicUsize::new(0));
        let c = count.clone();
        scheduler
            .add_times("* * * * * *", 2, Some("twice"), move || {
                let c = c.clone();
                async move {
                    c.fetch_add(1, Ordering::SeqCst);
                }
            })
            .await
            .unwrap();

        run_ticks(&scheduler, t0(), 5).await;
        settle().await;

        assert_eq!(count.load(Ordering::SeqCst), 2);
        assert!(scheduler.search("twice").await.is_none());
        assert!(scheduler.entries().await.is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_add_once_runs_once() {
        let scheduler = Scheduler::new();
        let count = Arc::new(AtomicUsize::new(0));
        let c = count.clone();
        scheduler
            .add_once("* * * * * *", Some("once"), move || {
                let c = c.clone();
                async move {
                    c.fetch_add(1, Ordering::SeqCst);
                }
            })
            .await
            .unwrap();

        run_ticks(&scheduler, t0(), 3).await;
        settle().await;

        assert_eq!(count.load(Ordering::SeqCst), 1);
        assert_eq!(scheduler.size().await, 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_singleton_non_overlap() {
        let scheduler = Scheduler::new();
        let current = Arc::new(AtomicUsize::new(0));
        let max_seen = Arc::new(AtomicUsize::new(0));
        let fires = Arc::new(AtomicUsize::new(0));

        let (cur, max, f) = (current.clone(), max_seen.clone(), fires.clone());
        scheduler
            .add_singleton("* * * * * *", Some("slow"), move || {
                let (cur, max, f) = (cur.clone(), max.clone(), f.clone());
                async move {
                    f.fetch_add(1, Ordering::SeqCst);
                    let now = cur.fetch_add(1, Ordering::SeqCst) + 1;
                    max.fetch_max(now, Ordering::SeqCst);
                    tokio::time::sleep(Duration::from_secs(3)).await;
                    cur.fetch_sub(1, Ordering::SeqCst);
                }
            })
            .await
            .unwrap();

        // Three ticks while the first invocation sleeps: both later ticks
        // must be dropped.
        run_ticks(&scheduler, t0(), 3).await;
        tokio::time::sleep(Duration::from_secs(4)).await;

        assert_eq!(fires.load(Ordering::SeqCst), 1);
        assert_eq!(max_seen.load(Ordering::SeqCst), 1);

        // After completion the singleton fires again.
        scheduler.tick(t0() + chrono::Duration::seconds(10)).await;
        settle().await;
        assert_eq!(fires.load(Ordering::SeqCst), 2);
        assert_eq!(max_seen.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_stop_and_start_scheduler() {
        let scheduler = Scheduler::new();
        let count = Arc::new(AtomicUsize::new(0));
        let c = count.clone();
        scheduler
            .add("* * * * * *", Some("gated"), move || {
                let c = c.clone();
                async move {
                    c.fetch_add(1, Ordering::SeqCst);
                }
            })
            .await
            .unwrap();

        scheduler.stop();
        scheduler.stop(); // idempotent
        run_ticks(&scheduler, t0(), 3).await;
        settle().await;
        assert_eq!(count.load(Ordering::SeqCst), 0);

        scheduler.start();
        scheduler.tick(t0() + chrono::Duration::seconds(10)).await;
        settle().await;
        assert_eq!(count.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_stop_entry_and_start_entry() {
        let scheduler = Scheduler::new();
        let count = Arc::new(AtomicUsize::new(0));
        let c = count.clone();
        scheduler
            .add("* * * * * *", Some("paused"), move || {
                let c = c.clone();
                async move {
                    c.fetch_add(1, Ordering::SeqCst);
                }
            })
            .await
            .unwrap();

        scheduler.stop_entry("paused").await;
        scheduler.tick(t0()).await;
        settle().await;
        assert_eq!(count.load(Ordering::SeqCst), 0);

        scheduler.start_entry("paused").await;
        scheduler.tick(t0() + chrono::Duration::seconds(1)).await;
        settle().await;
        assert_eq!(count.load(Ordering::SeqCst), 1);

        // Unknown names are a no-op, not an error.
        scheduler.stop_entry("missing").await;
        scheduler.start_entry("missing").await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_panic_recovery() {
        let scheduler = Scheduler::new();
        let mut events = scheduler.subscribe();
        let count = Arc::new(AtomicUsize::new(0));

        scheduler
            .add("* * * * * *", Some("bomb"), || async {
                panic!("boom");
            })
            .await
            .unwrap();
        let c = count.clone();
        scheduler
            .add("* * * * * *", Some("steady"), move || {
                let c = c.clone();
                async move {
                    c.fetch_add(1, Ordering::SeqCst);
                }
            })
            .await
            .unwrap();

        run_ticks(&scheduler, t0(), 2).await;
        settle().await;

        // The panicking job never takes the scheduler down.
        assert_eq!(count.load(Ordering::SeqCst), 2);

        let mut saw_panic = false;
        while let Ok(event) = events.try_recv() {
            if let SchedulerEvent::JobPanicked { name, message } = event {
                assert_eq!(name, "bomb");
                assert!(message.contains("boom"));
                saw_panic = true;
            }
        }
        assert!(saw_panic);
    }

    #[tokio::test(start_paused = true)]
    async fn test_close_waits_for_in_flight() {
        let scheduler = Scheduler::new();
        let done = Arc::new(AtomicUsize::new(0));
        let d = done.clone();
        scheduler
            .add("* * * * * *", Some("slowpoke"), move || {
                let d = d.clone();
                async move {
                    tokio::time::sleep(Duration::from_secs(2)).await;
                    d.fetch_add(1, Ordering::SeqCst);
                }
            })
            .await
            .unwrap();

        scheduler.tick(t0()).await;
        tokio::task::yield_now().await;

        scheduler.close().await;
        assert_eq!(done.load(Ordering::SeqCst), 1);
        assert_eq!(scheduler.status(), Status::Closed);
        assert_eq!(scheduler.size().await, 0);

        // Closed schedulers ignore ticks and reject registration.
        scheduler.tick(t0() + chrono::Duration::seconds(5)).await;
        let result = scheduler.add("* * * * * *", None, || async {}).await;
        assert!(matches!(result, Err(CronError::SchedulerClosed)));
    }

    #[tokio::test]
    async fn test_close_idempotent() {
        let scheduler = Scheduler::new();
        scheduler.close().await;
        scheduler.close().await;
        assert_eq!(scheduler.status(), Status::Closed);
    }

    #[tokio::test(start_paused = true)]
    async fn test_delay_add() {
        let scheduler = Scheduler::new();
        scheduler.delay_add(
            Duration::from_secs(2),
            "* * * * * *",
            Some("later"),
            || async {},
        );

        tokio::task::yield_now().await;
        assert_eq!(scheduler.size().await, 0);

        tokio::time::sleep(Duration::from_secs(3)).await;
        assert!(scheduler.search("later").await.is_some());
    }

    #[tokio::test(start_paused = true)]
    async fn test_delay_add_times_budget() {
        let scheduler = Scheduler::new();
        let count = Arc::new(AtomicUsize::new(0));
        let c = count.clone();
        scheduler.delay_add_times(
            Duration::from_secs(1),
            "* * * * * *",
            1,
            Some("delayed-once"),
            move || {
                let c = c.clone();
                async move {
                    c.fetch_add(1, Ordering::SeqCst);
                }
            },
        );

        tokio::time::sleep(Duration::from_secs(2)).await;
        run_ticks(&scheduler, t0(), 3).await;
        settle().await;

        assert_eq!(count.load(Ordering::SeqCst), 1);
        assert_eq!(scheduler.size().await, 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_dispatch_events() {
        let scheduler = Scheduler::new();
        let mut events = scheduler.subscribe();

        scheduler
            .add_once("* * * * * *", Some("evented"), || async {})
            .await
            .unwrap();
        scheduler.tick(t0()).await;
        settle().await;

        let mut names = Vec::new();
        while let Ok(event) = events.try_recv() {
            names.push(match event {
                SchedulerEvent::JobStarted { .. } => "started",
                SchedulerEvent::JobFinished { .. } => "finished",
                SchedulerEvent::JobExhausted { .. } => "exhausted",
                _ => "other",
            });
        }
        assert_eq!(names, vec!["started", "finished", "exhausted"]);
    }

    // Real wall clock: the heartbeat feeds Utc::now() into tick(), which
    // virtual time cannot move.
    #[tokio::test]
    async fn test_heartbeat_drives_ticks() {
        let scheduler = Scheduler::new();
        let count = Arc::new(AtomicUsize::new(0));
        let c = count.clone();
        scheduler
            .add("* * * * * *", Some("beating"), move || {
                let c = c.clone();
                async move {
                    c.fetch_add(1, Ordering::SeqCst);
                }
            })
            .await
            .unwrap();

        let handle = scheduler.spawn_heartbeat();
        assert_eq!(scheduler.status(), Status::Running);

        tokio::time::sleep(Duration::from_millis(2500)).await;
        assert!(count.load(Ordering::SeqCst) >= 1);

        scheduler.close().await;
        let _ = handle.await;
    }
}
