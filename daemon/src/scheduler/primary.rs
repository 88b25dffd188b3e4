use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use chrono_tz::Tz;
use common::trigger::MAX_INTERVAL_SECONDS;
use common::{JobChanges, RunArgs, ScheduledJob, SchedulerState, SchedulerStatus, Trigger};
use rand::Rng;
use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, OnceLock, Weak};
use tokio::sync::Semaphore;
use tokio::task::JoinHandle;

use super::{JobRunner, Scheduler};
use crate::config::SchedulerConfig;
use crate::error::{EngineError, Result};
use crate::metrics::MetricsCollector;
use crate::store::Store;

/// Upper bound on missed fire times replayed for one entry in one tick.
const MAX_CATCH_UP: usize = 1000;

struct Entry {
    job: ScheduledJob,
    running: Arc<AtomicUsize>,
}

impl Entry {
    fn new(job: ScheduledJob) -> Self {
        Self { job, running: Arc::new(AtomicUsize::new(0)) }
    }
}

/// Entry fire handed to the worker pool.
struct Fire {
    id: String,
    args: RunArgs,
    running: Arc<AtomicUsize>,
}

struct Inner {
    config: SchedulerConfig,
    tz: Tz,
    store: Arc<dyn Store>,
    metrics: Arc<MetricsCollector>,
    entries: Mutex<HashMap<String, Entry>>,
    state: Mutex<SchedulerState>,
    workers: Arc<Semaphore>,
    runner: OnceLock<Weak<dyn JobRunner>>,
    ticker: Mutex<Option<JoinHandle<()>>>,
}

/// Scheduler owning the timers. Entries are persisted through the store and
/// every fire is handed to the bound `JobRunner` on a pool of `max_workers`.
pub struct PrimaryScheduler {
    inner: Arc<Inner>,
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|e| e.into_inner())
}

fn invalid(e: anyhow::Error) -> EngineError {
    EngineError::InvalidTrigger(format!("{:#}", e))
}

impl PrimaryScheduler {
    pub fn new(config: SchedulerConfig, store: Arc<dyn Store>, metrics: Arc<MetricsCollector>) -> Self {
        let tz = config.tz();
        let workers = Arc::new(Semaphore::new(config.max_workers.max(1)));
        Self {
            inner: Arc::new(Inner {
                config,
                tz,
                store,
                metrics,
                entries: Mutex::new(HashMap::new()),
                state: Mutex::new(SchedulerState::Stopped),
                workers,
                runner: OnceLock::new(),
                ticker: Mutex::new(None),
            }),
        }
    }

    /// Stop the tick loop. Runs already handed to workers finish on their own.
    pub fn shutdown(&self) {
        if let Some(ticker) = lock(&self.inner.ticker).take() {
            ticker.abort();
        }
        *lock(&self.inner.state) = SchedulerState::Stopped;
        log::info!("Primary scheduler stopped");
    }

    /// Fire every entry due at `now`. Returns the number of runs started.
    pub fn fire_due(&self, now: DateTime<Utc>) -> usize {
        self.inner.fire_due(now)
    }
}

impl Drop for PrimaryScheduler {
    fn drop(&mut self) {
        if let Some(ticker) = lock(&self.inner.ticker).take() {
            ticker.abort();
        }
    }
}

impl Inner {
    fn next_after(&self, trigger: &Trigger, after: DateTime<Utc>) -> Option<DateTime<Utc>> {
        trigger
            .next_fire_time(after, self.tz)
            .map(|t| with_jitter(t, trigger.jitter()))
    }

    fn persist(&self, job: &ScheduledJob) {
        if let Err(e) = self.store.save_entry(job) {
            log::error!("Failed to persist scheduled entry {}: {}", job.id, e);
        }
    }

    fn forget(&self, id: &str) {
        if let Err(e) = self.store.delete_entry(id) {
            log::error!("Failed to delete scheduled entry {}: {}", id, e);
        }
    }

    fn tick(&self, now: DateTime<Utc>) -> Vec<Fire> {
        if *lock(&self.state) != SchedulerState::Running {
            return Vec::new();
        }

        let grace = Duration::seconds(self.config.misfire_grace_seconds as i64);
        let mut fires = Vec::new();
        let mut finished = Vec::new();
        let mut entries = lock(&self.entries);

        for entry in entries.values_mut() {
            let Some(due) = entry.job.next_run_time else {
                continue;
            };
            if due > now {
                continue;
            }

            let trigger = &entry.job.trigger;
            let mut missed = vec![due];
            let mut next = trigger.next_fire_time(due, self.tz);
            while let Some(t) = next {
                if t > now || missed.len() >= MAX_CATCH_UP {
                    break;
                }
                missed.push(t);
                next = trigger.next_fire_time(t, self.tz);
            }

            let (on_time, late): (Vec<_>, Vec<_>) =
                missed.into_iter().partition(|t| now - *t <= grace);
            for t in &late {
                log::warn!("Entry {} missed its fire time {} by more than {}s", entry.job.id, t, grace.num_seconds());
                self.metrics.record_misfire();
            }

            let wanted = if self.config.coalesce { on_time.len().min(1) } else { on_time.len() };
            for _ in 0..wanted {
                if entry.running.load(Ordering::SeqCst) >= self.config.max_instances.max(1) {
                    log::warn!(
                        "Entry {} skipped: maximum number of running instances ({}) reached",
                        entry.job.id, self.config.max_instances
                    );
                    break;
                }
                entry.running.fetch_add(1, Ordering::SeqCst);
                fires.push(Fire {
                    id: entry.job.id.clone(),
                    args: entry.job.args.clone(),
                    running: entry.running.clone(),
                });
            }

            entry.job.next_run_time = next.map(|t| with_jitter(t, trigger.jitter()));
            if entry.job.next_run_time.is_none() {
                finished.push(entry.job.id.clone());
            } else {
                self.persist(&entry.job);
            }
        }

        for id in finished {
            log::info!("Entry {} has no further fire time, removing", id);
            entries.remove(&id);
            self.forget(&id);
        }
        fires
    }

    fn fire_due(&self, now: DateTime<Utc>) -> usize {
        let fires = self.tick(now);
        let count = fires.len();
        for fire in fires {
            self.metrics.record_fire();
            let runner = self.runner.get().and_then(Weak::upgrade);
            let workers = self.workers.clone();
            tokio::spawn(async move {
                let Fire { id, args, running } = fire;
                match (runner, workers.acquire_owned().await) {
                    (Some(runner), Ok(_permit)) => {
                        log::info!("Firing entry {} for job {}", id, args.job_id);
                        runner.run_scheduled(id, args).await;
                    }
                    (None, _) => log::warn!("Entry {} fired with no runner bound", id),
                    (_, Err(_)) => log::warn!("Entry {} fired after the worker pool closed", id),
                }
                running.fetch_sub(1, Ordering::SeqCst);
            });
        }
        count
    }

    fn update(&self, id: &str, change: impl FnOnce(&Self, &mut ScheduledJob) -> Result<()>) -> Result<ScheduledJob> {
        let mut entries = lock(&self.entries);
        let entry = entries
            .get_mut(id)
            .ok_or_else(|| EngineError::not_found("Scheduled job", id))?;
        change(self, &mut entry.job)?;
        self.persist(&entry.job);
        Ok(entry.job.clone())
    }
}

fn with_jitter(t: DateTime<Utc>, jitter: u64) -> DateTime<Utc> {
    if jitter == 0 {
        return t;
    }
    let jitter = jitter.min(MAX_INTERVAL_SECONDS);
    let offset = rand::thread_rng().gen_range(0..=jitter);
    i64::try_from(offset)
        .ok()
        .and_then(Duration::try_seconds)
        .and_then(|delta| t.checked_add_signed(delta))
        .unwrap_or(t)
}

#[async_trait]
impl Scheduler for PrimaryScheduler {
    fn bind(&self, runner: Weak<dyn JobRunner>) {
        if self.inner.runner.set(runner).is_err() {
            log::warn!("Primary scheduler already has a runner bound");
        }
    }

    /// Stays `Stopped` if the stored entries cannot be loaded.
    async fn start(&self) -> Result<()> {
        if *lock(&self.inner.state) != SchedulerState::Stopped {
            return Ok(());
        }
        let stored = self.inner.store.fetch_entries()?;

        let mut state = lock(&self.inner.state);
        if *state != SchedulerState::Stopped {
            return Ok(());
        }
        {
            let mut entries = lock(&self.inner.entries);
            for job in stored {
                entries.entry(job.id.clone()).or_insert_with(|| Entry::new(job));
            }
            log::info!("Primary scheduler started with {} entries", entries.len());
        }

        let weak = Arc::downgrade(&self.inner);
        let period = std::time::Duration::from_millis(self.inner.config.tick_interval_ms.max(1));
        let ticker = tokio::spawn(async move {
            let mut interval = tokio::time::interval_at(tokio::time::Instant::now() + period, period);
            loop {
                interval.tick().await;
                let Some(inner) = weak.upgrade() else {
                    break;
                };
                inner.fire_due(Utc::now());
            }
        });
        *lock(&self.inner.ticker) = Some(ticker);
        *state = SchedulerState::Running;
        Ok(())
    }

    async fn pause(&self) -> Result<()> {
        let mut state = lock(&self.inner.state);
        if *state == SchedulerState::Running {
            *state = SchedulerState::Paused;
            log::info!("Primary scheduler paused");
        }
        Ok(())
    }

    async fn resume(&self) -> Result<()> {
        let mut state = lock(&self.inner.state);
        if *state == SchedulerState::Paused {
            *state = SchedulerState::Running;
            log::info!("Primary scheduler resumed");
        }
        Ok(())
    }

    async fn status(&self) -> Result<SchedulerStatus> {
        Ok(SchedulerStatus {
            state: *lock(&self.inner.state),
            jobs: lock(&self.inner.entries).len(),
        })
    }

    async fn get_job(&self, id: &str) -> Result<Option<ScheduledJob>> {
        Ok(lock(&self.inner.entries).get(id).map(|e| e.job.clone()))
    }

    async fn get_jobs(&self) -> Result<Vec<ScheduledJob>> {
        let mut jobs: Vec<ScheduledJob> = lock(&self.inner.entries)
            .values()
            .map(|e| e.job.clone())
            .collect();
        jobs.sort_by(|a, b| a.id.cmp(&b.id));
        Ok(jobs)
    }

    async fn add_job(&self, id: &str, trigger: Trigger, args: RunArgs) -> Result<ScheduledJob> {
        trigger.validate().map_err(invalid)?;
        let next = trigger
            .first_fire_time(Utc::now(), self.inner.tz)
            .map(|t| with_jitter(t, trigger.jitter()))
            .ok_or_else(|| EngineError::InvalidTrigger(format!("{} never fires", trigger.describe())))?;

        let mut entries = lock(&self.inner.entries);
        if entries.contains_key(id) {
            return Err(EngineError::Conflict(format!("scheduled job {} already exists", id)));
        }
        let job = ScheduledJob {
            id: id.to_string(),
            trigger,
            args,
            next_run_time: Some(next),
        };
        self.inner.store.save_entry(&job)?;
        log::info!("Scheduled entry {} ({}), next run {}", job.id, job.trigger.describe(), next);
        entries.insert(job.id.clone(), Entry::new(job.clone()));
        Ok(job)
    }

    async fn modify_job(&self, id: &str, changes: JobChanges) -> Result<ScheduledJob> {
        self.inner.update(id, |_, job| {
            if let Some(args) = changes.args {
                job.args = args;
            }
            Ok(())
        })
    }

    /// A paused entry stays paused.
    async fn reschedule_job(&self, id: &str, trigger: Trigger) -> Result<ScheduledJob> {
        trigger.validate().map_err(invalid)?;
        let job = self.inner.update(id, |inner, job| {
            if !job.is_paused() {
                job.next_run_time = trigger
                    .first_fire_time(Utc::now(), inner.tz)
                    .map(|t| with_jitter(t, trigger.jitter()));
                if job.next_run_time.is_none() {
                    return Err(EngineError::InvalidTrigger(format!("{} never fires", trigger.describe())));
                }
            }
            job.trigger = trigger;
            Ok(())
        })?;
        log::info!("Rescheduled entry {} ({})", job.id, job.trigger.describe());
        Ok(job)
    }

    async fn remove_job(&self, id: &str) -> Result<()> {
        lock(&self.inner.entries)
            .remove(id)
            .ok_or_else(|| EngineError::not_found("Scheduled job", id))?;
        self.inner.store.delete_entry(id)?;
        log::info!("Removed scheduled entry {}", id);
        Ok(())
    }

    async fn pause_job(&self, id: &str) -> Result<ScheduledJob> {
        self.inner.update(id, |_, job| {
            job.next_run_time = None;
            Ok(())
        })
    }

    async fn resume_job(&self, id: &str) -> Result<ScheduledJob> {
        let now = Utc::now();
        let job = self.inner.update(id, |inner, job| {
            job.next_run_time = inner.next_after(&job.trigger, now);
            Ok(())
        })?;
        if job.next_run_time.is_none() {
            log::info!("Entry {} has no fire time after {}, removing", id, now);
            lock(&self.inner.entries).remove(id);
            self.inner.forget(id);
        }
        Ok(job)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::MemoryStore;
    use common::{CronFields, JobId};

    #[derive(Default)]
    struct Recorder {
        calls: Mutex<Vec<(String, RunArgs)>>,
    }

    #[async_trait]
    impl JobRunner for Recorder {
        async fn run_scheduled(self: Arc<Self>, entry: String, args: RunArgs) {
            self.calls.lock().unwrap().push((entry, args));
        }
    }

    fn config(tick_interval_ms: u64) -> SchedulerConfig {
        SchedulerConfig { tick_interval_ms, ..Default::default() }
    }

    fn scheduler(config: SchedulerConfig) -> (PrimaryScheduler, Arc<MemoryStore>, Arc<MetricsCollector>) {
        let store = Arc::new(MemoryStore::new());
        let metrics = Arc::new(MetricsCollector::new());
        (PrimaryScheduler::new(config, store.clone(), metrics.clone()), store, metrics)
    }

    fn bind(scheduler: &PrimaryScheduler) -> Arc<Recorder> {
        let recorder = Arc::new(Recorder::default());
        let runner: Arc<dyn JobRunner> = recorder.clone();
        scheduler.bind(Arc::downgrade(&runner));
        recorder
    }

    fn interval(seconds: u64, jitter: Option<u64>) -> Trigger {
        Trigger::Interval { seconds, start: None, end: None, jitter }
    }

    async fn wait_for_calls(recorder: &Recorder, n: usize) {
        for _ in 0..200 {
            if recorder.calls.lock().unwrap().len() >= n {
                return;
            }
            tokio::time::sleep(std::time::Duration::from_millis(10)).await;
        }
        panic!("runner was called {} times, expected {}", recorder.calls.lock().unwrap().len(), n);
    }

    #[tokio::test]
    async fn test_interval_round_trip() {
        let (scheduler, store, _) = scheduler(config(3_600_000));
        let before = Utc::now();
        scheduler
            .add_job("backup", interval(30, Some(5)), RunArgs::job(JobId(1)))
            .await
            .unwrap();

        let job = scheduler.get_job("backup").await.unwrap().unwrap();
        match &job.trigger {
            Trigger::Interval { seconds, jitter, .. } => {
                assert_eq!(*seconds, 30);
                assert_eq!(*jitter, Some(5));
            }
            other => panic!("unexpected trigger {:?}", other),
        }
        let next = job.next_run_time.unwrap();
        assert!(next >= before + Duration::seconds(30));
        assert!(next <= Utc::now() + Duration::seconds(36));

        let persisted = store.fetch_entries().unwrap();
        assert_eq!(persisted, vec![job]);
    }

    #[tokio::test]
    async fn test_cron_round_trip() {
        let (scheduler, _, _) = scheduler(config(3_600_000));
        let fields = CronFields::from_crontab("*/5 * * * mon,wed").unwrap();
        let job = scheduler
            .add_job("poll", Trigger::Cron(fields), RunArgs::job(JobId(1)))
            .await
            .unwrap();
        let Trigger::Cron(stored) = scheduler.get_job(&job.id).await.unwrap().unwrap().trigger else {
            panic!("expected a cron trigger");
        };
        assert_eq!(stored.to_crontab(), "*/5 * * * 1,3");
    }

    #[tokio::test]
    async fn test_invalid_trigger_not_registered() {
        let (scheduler, store, _) = scheduler(config(3_600_000));
        let bad = Trigger::Cron(CronFields { minute: "61".to_string(), ..Default::default() });
        let err = scheduler.add_job("bad", bad, RunArgs::job(JobId(1))).await.unwrap_err();
        assert!(matches!(err, EngineError::InvalidTrigger(_)));

        let err = scheduler
            .add_job("zero", interval(0, None), RunArgs::job(JobId(1)))
            .await
            .unwrap_err();
        assert!(matches!(err, EngineError::InvalidTrigger(_)));

        assert!(scheduler.get_jobs().await.unwrap().is_empty());
        assert!(store.fetch_entries().unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_oversized_jitter_not_registered() {
        let (scheduler, store, _) = scheduler(config(3_600_000));
        let err = scheduler
            .add_job("j", interval(30, Some(u64::MAX)), RunArgs::job(JobId(1)))
            .await
            .unwrap_err();
        assert!(matches!(err, EngineError::InvalidTrigger(_)));
        assert!(scheduler.get_jobs().await.unwrap().is_empty());
        assert!(store.fetch_entries().unwrap().is_empty());
    }

    #[test]
    fn test_jitter_past_the_calendar_keeps_the_fire_time() {
        let t = DateTime::<Utc>::MAX_UTC - Duration::seconds(10);
        let jittered = with_jitter(t, MAX_INTERVAL_SECONDS);
        assert!(jittered >= t);

        let now = Utc::now();
        let jittered = with_jitter(now, u64::MAX);
        assert!(jittered >= now);
    }

    #[tokio::test]
    async fn test_duplicate_id_conflicts() {
        let (scheduler, _, _) = scheduler(config(3_600_000));
        scheduler.add_job("a", interval(60, None), RunArgs::job(JobId(1))).await.unwrap();
        let err = scheduler.add_job("a", interval(60, None), RunArgs::job(JobId(2))).await.unwrap_err();
        assert!(matches!(err, EngineError::Conflict(_)));
    }

    #[tokio::test]
    async fn test_resume_recomputes_from_now() {
        let (scheduler, _, _) = scheduler(config(3_600_000));
        let added = scheduler.add_job("a", interval(2, None), RunArgs::job(JobId(1))).await.unwrap();

        let paused = scheduler.pause_job("a").await.unwrap();
        assert!(paused.is_paused());

        tokio::time::sleep(std::time::Duration::from_millis(2100)).await;
        let resumed_at = Utc::now();
        let resumed = scheduler.resume_job("a").await.unwrap();
        let next = resumed.next_run_time.unwrap();
        assert!(next > resumed_at);
        assert!(next > added.next_run_time.unwrap());
    }

    #[tokio::test]
    async fn test_reschedule_keeps_pause() {
        let (scheduler, _, _) = scheduler(config(3_600_000));
        scheduler.add_job("a", interval(60, None), RunArgs::job(JobId(1))).await.unwrap();
        scheduler.pause_job("a").await.unwrap();
        let job = scheduler.reschedule_job("a", interval(120, None)).await.unwrap();
        assert!(job.is_paused());
        assert!(matches!(job.trigger, Trigger::Interval { seconds: 120, .. }));

        let err = scheduler.pause_job("missing").await.unwrap_err();
        assert!(err.is_not_found());
    }

    #[tokio::test]
    async fn test_ticker_fires_runner_and_drops_date_entry() {
        let (scheduler, store, metrics) = scheduler(config(20));
        let recorder = bind(&scheduler);
        let args = RunArgs { payload: serde_json::json!({"reason": "once"}), ..RunArgs::job(JobId(7)) };
        scheduler
            .add_job("once", Trigger::Date { run_at: Utc::now() }, args.clone())
            .await
            .unwrap();
        scheduler.start().await.unwrap();

        wait_for_calls(&recorder, 1).await;
        assert_eq!(recorder.calls.lock().unwrap()[0], ("once".to_string(), args));
        assert!(scheduler.get_job("once").await.unwrap().is_none());
        assert!(store.fetch_entries().unwrap().is_empty());
        assert!(metrics.export().contains("meshflow_scheduler_fires_total 1"));
        scheduler.shutdown();
    }

    #[tokio::test]
    async fn test_misfire_outside_grace_is_skipped() {
        let (scheduler, _, metrics) = scheduler(config(3_600_000));
        bind(&scheduler);
        scheduler.start().await.unwrap();
        let past = Utc::now() - Duration::hours(1);
        scheduler
            .add_job("late", Trigger::Date { run_at: past }, RunArgs::job(JobId(1)))
            .await
            .unwrap();

        assert_eq!(scheduler.fire_due(Utc::now()), 0);
        assert!(scheduler.get_job("late").await.unwrap().is_none());
        assert!(metrics.export().contains("meshflow_scheduler_misfires_total 1"));
    }

    async fn seeded(coalesce: bool, max_instances: usize) -> PrimaryScheduler {
        let (scheduler, store, _) = scheduler(SchedulerConfig {
            coalesce,
            max_instances,
            misfire_grace_seconds: 60,
            ..config(3_600_000)
        });
        store
            .save_entry(&ScheduledJob {
                id: "poll".to_string(),
                trigger: interval(10, None),
                args: RunArgs::job(JobId(1)),
                next_run_time: Some(Utc::now() - Duration::seconds(35)),
            })
            .unwrap();
        bind(&scheduler);
        scheduler.start().await.unwrap();
        scheduler
    }

    #[tokio::test]
    async fn test_missed_fires_coalesce() {
        let scheduler = seeded(true, 10).await;
        let now = Utc::now();
        assert_eq!(scheduler.fire_due(now), 1);
        let next = scheduler.get_job("poll").await.unwrap().unwrap().next_run_time.unwrap();
        assert!(next > now);
    }

    #[tokio::test]
    async fn test_missed_fires_replayed_without_coalesce() {
        let scheduler = seeded(false, 10).await;
        assert_eq!(scheduler.fire_due(Utc::now()), 4);
    }

    #[tokio::test]
    async fn test_max_instances_caps_fires() {
        let scheduler = seeded(false, 1).await;
        assert_eq!(scheduler.fire_due(Utc::now()), 1);
    }

    #[tokio::test]
    async fn test_paused_scheduler_fires_nothing() {
        let scheduler = seeded(true, 1).await;
        scheduler.pause().await.unwrap();
        assert_eq!(scheduler.status().await.unwrap().state, SchedulerState::Paused);
        assert_eq!(scheduler.fire_due(Utc::now()), 0);
        scheduler.resume().await.unwrap();
        assert_eq!(scheduler.fire_due(Utc::now()), 1);
    }

    /// Memory store whose first `fetch_entries` fails.
    #[derive(Default)]
    struct FlakyStore {
        inner: MemoryStore,
        failed: std::sync::atomic::AtomicBool,
    }

    impl Store for FlakyStore {
        fn fetch_job(&self, lookup: crate::store::Lookup<'_>) -> Result<Option<common::Job>> {
            self.inner.fetch_job(lookup)
        }
        fn fetch_jobs(&self) -> Result<Vec<common::Job>> {
            self.inner.fetch_jobs()
        }
        fn save_job(&self, job: common::Job) -> Result<common::Job> {
            self.inner.save_job(job)
        }
        fn delete_job(&self, id: JobId) -> Result<()> {
            self.inner.delete_job(id)
        }
        fn append_run(&self, run: &common::Run) -> Result<()> {
            self.inner.append_run(run)
        }
        fn fetch_runs(&self, job: JobId) -> Result<Vec<common::Run>> {
            self.inner.fetch_runs(job)
        }
        fn fetch_task(&self, lookup: crate::store::Lookup<'_>) -> Result<Option<common::Task>> {
            self.inner.fetch_task(lookup)
        }
        fn fetch_tasks(&self) -> Result<Vec<common::Task>> {
            self.inner.fetch_tasks()
        }
        fn save_task(&self, task: common::Task) -> Result<common::Task> {
            self.inner.save_task(task)
        }
        fn delete_task(&self, id: common::TaskId) -> Result<()> {
            self.inner.delete_task(id)
        }
        fn fetch_entries(&self) -> Result<Vec<ScheduledJob>> {
            if !self.failed.swap(true, Ordering::SeqCst) {
                return Err(EngineError::Database(rusqlite::Error::InvalidQuery));
            }
            self.inner.fetch_entries()
        }
        fn save_entry(&self, entry: &ScheduledJob) -> Result<()> {
            self.inner.save_entry(entry)
        }
        fn delete_entry(&self, id: &str) -> Result<()> {
            self.inner.delete_entry(id)
        }
    }

    #[tokio::test]
    async fn test_failed_start_stays_stopped() {
        let store = Arc::new(FlakyStore::default());
        store
            .inner
            .save_entry(&ScheduledJob {
                id: "stored".to_string(),
                trigger: interval(60, None),
                args: RunArgs::job(JobId(1)),
                next_run_time: Some(Utc::now() + Duration::seconds(60)),
            })
            .unwrap();
        let scheduler = PrimaryScheduler::new(config(3_600_000), store, Arc::new(MetricsCollector::new()));

        assert!(scheduler.start().await.is_err());
        let status = scheduler.status().await.unwrap();
        assert_eq!(status.state, SchedulerState::Stopped);
        assert!(lock(&scheduler.inner.ticker).is_none());

        scheduler.start().await.unwrap();
        let status = scheduler.status().await.unwrap();
        assert_eq!(status.state, SchedulerState::Running);
        assert_eq!(status.jobs, 1);
        assert!(lock(&scheduler.inner.ticker).is_some());
        scheduler.shutdown();
    }
}
