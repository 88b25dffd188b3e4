use async_trait::async_trait;
use common::{AddJobRequest, ErrorBody, JobChanges, RunArgs, ScheduledJob, SchedulerStatus, Trigger};
use rand::Rng;
use reqwest::{Method, RequestBuilder, StatusCode, Url};
use serde::de::DeserializeOwned;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, Weak};
use std::time::Duration;
use tokio::task::JoinHandle;

use super::Scheduler;
use crate::config::SchedulerConfig;
use crate::error::{EngineError, Result};

struct Inner {
    client: reqwest::Client,
    base: Url,
    api_key: Option<String>,
    refresh_min: Duration,
    refresh_max: Duration,
    max_idle_cycles: u32,
    cache: Mutex<HashMap<String, ScheduledJob>>,
    /// Bumped by every cache write from a mutation.
    generation: AtomicU64,
    idle: AtomicU32,
    refresher: Mutex<Option<JoinHandle<()>>>,
}

/// Forwards every scheduling call to a primary over HTTP.
///
/// A local cache of entries serves `get_job`. One background task refreshes
/// it at a random interval so that many delegates do not poll in lockstep;
/// the task stops after `max_idle_cycles` refreshes without caller activity
/// and is restarted by the next call.
pub struct DelegatingScheduler {
    inner: Arc<Inner>,
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|e| e.into_inner())
}

impl DelegatingScheduler {
    pub fn new(config: &SchedulerConfig, api_key: Option<String>) -> Result<Self> {
        let base = Url::parse(&config.primary_url).map_err(|e| {
            EngineError::InvalidDefinition(format!("invalid primary url {}: {}", config.primary_url, e))
        })?;
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(config.request_timeout_seconds.max(1)))
            .build()?;
        let refresh_min = Duration::from_secs(config.refresh_min_seconds);
        let refresh_max = Duration::from_secs(config.refresh_max_seconds.max(config.refresh_min_seconds));
        Ok(Self::with_client(client, base, api_key, refresh_min, refresh_max, config.max_idle_cycles))
    }

    fn with_client(
        client: reqwest::Client,
        base: Url,
        api_key: Option<String>,
        refresh_min: Duration,
        refresh_max: Duration,
        max_idle_cycles: u32,
    ) -> Self {
        Self {
            inner: Arc::new(Inner {
                client,
                base,
                api_key,
                refresh_min,
                refresh_max,
                max_idle_cycles: max_idle_cycles.max(1),
                cache: Mutex::new(HashMap::new()),
                generation: AtomicU64::new(0),
                idle: AtomicU32::new(0),
                refresher: Mutex::new(None),
            }),
        }
    }

    /// Whether the background refresh task is alive.
    pub fn is_refreshing(&self) -> bool {
        lock(&self.inner.refresher)
            .as_ref()
            .is_some_and(|handle| !handle.is_finished())
    }

    pub fn cached(&self, id: &str) -> Option<ScheduledJob> {
        lock(&self.inner.cache).get(id).cloned()
    }
}

impl Drop for DelegatingScheduler {
    fn drop(&mut self) {
        if let Some(handle) = lock(&self.inner.refresher).take() {
            handle.abort();
        }
    }
}

impl Inner {
    /// Record caller activity and make sure the refresh task runs.
    fn touch(self: &Arc<Self>) {
        self.idle.store(0, Ordering::SeqCst);
        let mut refresher = lock(&self.refresher);
        if refresher.as_ref().is_some_and(|h| !h.is_finished()) {
            return;
        }
        log::debug!("Starting scheduler cache refresh for {}", self.base);
        *refresher = Some(tokio::spawn(refresh_loop(Arc::downgrade(self))));
    }

    fn refresh_delay(&self) -> Duration {
        if self.refresh_max <= self.refresh_min {
            return self.refresh_min;
        }
        rand::thread_rng().gen_range(self.refresh_min..=self.refresh_max)
    }

    fn request(&self, method: Method, path: &[&str]) -> Result<RequestBuilder> {
        let mut url = self.base.clone();
        url.path_segments_mut()
            .map_err(|_| EngineError::InvalidDefinition(format!("{} cannot be a base url", self.base)))?
            .pop_if_empty()
            .extend(path);
        let mut request = self.client.request(method, url);
        if let Some(key) = &self.api_key {
            request = request.header(common::API_KEY_HEADER, key);
        }
        Ok(request)
    }

    async fn send(&self, request: RequestBuilder) -> Result<reqwest::Response> {
        let response = request.send().await?;
        let status = response.status();
        if status.is_success() {
            return Ok(response);
        }
        let text = response.text().await.unwrap_or_default();
        let message = serde_json::from_str::<ErrorBody>(&text)
            .map(|body| body.error)
            .unwrap_or(text);
        if status == StatusCode::NOT_FOUND {
            return Err(EngineError::NotFound { kind: "Scheduled job", key: message });
        }
        Err(EngineError::Remote { status: status.as_u16(), message })
    }

    async fn call<T: DeserializeOwned>(&self, request: RequestBuilder) -> Result<T> {
        Ok(self.send(request).await?.json::<T>().await?)
    }

    /// Call an endpoint returning one entry and cache the answer.
    async fn entry(&self, request: RequestBuilder) -> Result<ScheduledJob> {
        let job: ScheduledJob = self.call(request).await?;
        let mut cache = lock(&self.cache);
        cache.insert(job.id.clone(), job.clone());
        self.generation.fetch_add(1, Ordering::SeqCst);
        Ok(job)
    }

    fn forget(&self, id: &str) {
        let mut cache = lock(&self.cache);
        cache.remove(id);
        self.generation.fetch_add(1, Ordering::SeqCst);
    }

    async fn refresh(&self) -> Result<Vec<ScheduledJob>> {
        let seen = self.generation.load(Ordering::SeqCst);
        let jobs: Vec<ScheduledJob> = self.call(self.request(Method::GET, &["scheduler", "jobs"])?).await?;
        self.replace_cache(seen, &jobs);
        Ok(jobs)
    }

    /// Replace the cache with a listing fetched at generation `seen`. A listing
    /// that raced with a mutation is dropped.
    fn replace_cache(&self, seen: u64, jobs: &[ScheduledJob]) -> bool {
        let mut cache = lock(&self.cache);
        if self.generation.load(Ordering::SeqCst) != seen {
            log::debug!("Discarding scheduler listing that raced with a local change");
            return false;
        }
        *cache = jobs.iter().map(|j| (j.id.clone(), j.clone())).collect();
        true
    }
}

async fn refresh_loop(weak: Weak<Inner>) {
    loop {
        let Some(delay) = weak.upgrade().map(|i| i.refresh_delay()) else {
            return;
        };
        tokio::time::sleep(delay).await;
        let Some(inner) = weak.upgrade() else {
            return;
        };
        if let Err(e) = inner.refresh().await {
            log::warn!("Scheduler cache refresh from {} failed: {}", inner.base, e);
        }
        let idle = inner.idle.fetch_add(1, Ordering::SeqCst) + 1;
        if idle >= inner.max_idle_cycles {
            log::debug!("Scheduler cache refresh idle for {} cycles, stopping", idle);
            return;
        }
    }
}

#[async_trait]
impl Scheduler for DelegatingScheduler {
    /// The primary owns the timers; starting a delegate only warms the cache.
    async fn start(&self) -> Result<()> {
        self.inner.touch();
        let jobs = self.inner.refresh().await?;
        log::info!("Delegating to {} ({} entries)", self.inner.base, jobs.len());
        Ok(())
    }

    async fn pause(&self) -> Result<()> {
        self.inner.touch();
        let _: SchedulerStatus = self
            .inner
            .call(self.inner.request(Method::POST, &["scheduler", "pause"])?)
            .await?;
        Ok(())
    }

    async fn resume(&self) -> Result<()> {
        self.inner.touch();
        let _: SchedulerStatus = self
            .inner
            .call(self.inner.request(Method::POST, &["scheduler", "resume"])?)
            .await?;
        Ok(())
    }

    async fn status(&self) -> Result<SchedulerStatus> {
        self.inner.touch();
        self.inner
            .call(self.inner.request(Method::GET, &["scheduler", "status"])?)
            .await
    }

    async fn get_job(&self, id: &str) -> Result<Option<ScheduledJob>> {
        self.inner.touch();
        if let Some(job) = self.cached(id) {
            return Ok(Some(job));
        }
        match self
            .inner
            .entry(self.inner.request(Method::GET, &["scheduler", "jobs", id])?)
            .await
        {
            Ok(job) => Ok(Some(job)),
            Err(e) if e.is_not_found() => Ok(None),
            Err(e) => Err(e),
        }
    }

    async fn get_jobs(&self) -> Result<Vec<ScheduledJob>> {
        self.inner.touch();
        let mut jobs = self.inner.refresh().await?;
        jobs.sort_by(|a, b| a.id.cmp(&b.id));
        Ok(jobs)
    }

    async fn add_job(&self, id: &str, trigger: Trigger, args: RunArgs) -> Result<ScheduledJob> {
        self.inner.touch();
        trigger
            .validate()
            .map_err(|e| EngineError::InvalidTrigger(format!("{:#}", e)))?;
        let body = AddJobRequest { id: id.to_string(), trigger, args };
        self.inner
            .entry(self.inner.request(Method::POST, &["scheduler", "jobs"])?.json(&body))
            .await
    }

    async fn modify_job(&self, id: &str, changes: JobChanges) -> Result<ScheduledJob> {
        self.inner.touch();
        self.inner
            .entry(self.inner.request(Method::PATCH, &["scheduler", "jobs", id])?.json(&changes))
            .await
    }

    async fn reschedule_job(&self, id: &str, trigger: Trigger) -> Result<ScheduledJob> {
        self.inner.touch();
        trigger
            .validate()
            .map_err(|e| EngineError::InvalidTrigger(format!("{:#}", e)))?;
        self.inner
            .entry(
                self.inner
                    .request(Method::POST, &["scheduler", "jobs", id, "reschedule"])?
                    .json(&trigger),
            )
            .await
    }

    async fn remove_job(&self, id: &str) -> Result<()> {
        self.inner.touch();
        self.inner
            .send(self.inner.request(Method::DELETE, &["scheduler", "jobs", id])?)
            .await?;
        self.inner.forget(id);
        Ok(())
    }

    async fn pause_job(&self, id: &str) -> Result<ScheduledJob> {
        self.inner.touch();
        self.inner
            .entry(self.inner.request(Method::POST, &["scheduler", "jobs", id, "pause"])?)
            .await
    }

    async fn resume_job(&self, id: &str) -> Result<ScheduledJob> {
        self.inner.touch();
        self.inner
            .entry(self.inner.request(Method::POST, &["scheduler", "jobs", id, "resume"])?)
            .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::server::tests::spawn_primary;
    use common::JobId;
    use std::sync::atomic::AtomicUsize;

    fn delegate(addr: std::net::SocketAddr, key: Option<&str>, refresh_ms: u64, max_idle: u32) -> DelegatingScheduler {
        DelegatingScheduler::with_client(
            reqwest::Client::new(),
            Url::parse(&format!("http://{}", addr)).unwrap(),
            key.map(str::to_string),
            Duration::from_millis(refresh_ms),
            Duration::from_millis(refresh_ms * 2),
            max_idle,
        )
    }

    fn interval(seconds: u64, jitter: Option<u64>) -> Trigger {
        Trigger::Interval { seconds, start: None, end: None, jitter }
    }

    #[tokio::test]
    async fn test_get_job_served_from_cache() {
        let counter = Arc::new(AtomicUsize::new(0));
        let (addr, primary) = spawn_primary(Some("secret"), Some(counter.clone())).await;
        primary.add_job("backup", interval(30, Some(5)), RunArgs::job(JobId(1))).await.unwrap();

        let scheduler = delegate(addr, Some("secret"), 60_000, 10);
        let jobs = scheduler.get_jobs().await.unwrap();
        assert_eq!(jobs.len(), 1);
        let after_list = counter.load(Ordering::SeqCst);

        let job = scheduler.get_job("backup").await.unwrap().unwrap();
        assert_eq!(counter.load(Ordering::SeqCst), after_list);
        match job.trigger {
            Trigger::Interval { seconds, jitter, .. } => {
                assert_eq!(seconds, 30);
                assert_eq!(jitter, Some(5));
            }
            other => panic!("unexpected trigger {:?}", other),
        }

        // A miss goes to the primary.
        assert!(scheduler.get_job("ghost").await.unwrap().is_none());
        assert_eq!(counter.load(Ordering::SeqCst), after_list + 1);
    }

    #[tokio::test]
    async fn test_mutations_update_cache() {
        let (addr, primary) = spawn_primary(None, None).await;
        let scheduler = delegate(addr, None, 60_000, 10);

        let added = scheduler.add_job("a", interval(60, None), RunArgs::job(JobId(3))).await.unwrap();
        assert_eq!(scheduler.cached("a"), Some(added.clone()));
        assert_eq!(primary.get_job("a").await.unwrap(), Some(added));

        let paused = scheduler.pause_job("a").await.unwrap();
        assert!(paused.is_paused());
        assert!(scheduler.cached("a").unwrap().is_paused());

        let changes = JobChanges { args: Some(RunArgs::job(JobId(4))) };
        let modified = scheduler.modify_job("a", changes).await.unwrap();
        assert_eq!(modified.args.job_id, JobId(4));

        let resumed = scheduler.resume_job("a").await.unwrap();
        assert!(!resumed.is_paused());

        scheduler.remove_job("a").await.unwrap();
        assert!(scheduler.cached("a").is_none());
        assert!(primary.get_job("a").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_refresh_stops_when_idle_and_restarts() {
        let counter = Arc::new(AtomicUsize::new(0));
        let (addr, _) = spawn_primary(None, Some(counter.clone())).await;
        let scheduler = delegate(addr, None, 50, 3);

        scheduler.status().await.unwrap();
        assert!(scheduler.is_refreshing());

        for _ in 0..100 {
            if !scheduler.is_refreshing() {
                break;
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
        assert!(!scheduler.is_refreshing());

        // One status call plus exactly three idle refreshes.
        assert_eq!(counter.load(Ordering::SeqCst), 4);
        tokio::time::sleep(Duration::from_millis(100)).await;
        assert_eq!(counter.load(Ordering::SeqCst), 4);

        scheduler.get_job("anything").await.unwrap();
        assert!(scheduler.is_refreshing());
    }

    #[tokio::test]
    async fn test_wrong_key_is_remote_error() {
        let (addr, _) = spawn_primary(Some("secret"), None).await;
        let scheduler = delegate(addr, Some("wrong"), 60_000, 10);
        match scheduler.status().await.unwrap_err() {
            EngineError::Remote { status, .. } => assert_eq!(status, 401),
            other => panic!("unexpected error {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_failed_call_leaves_cache_untouched() {
        let (addr, _) = spawn_primary(None, None).await;
        let scheduler = delegate(addr, None, 60_000, 10);
        let job = scheduler.add_job("a", interval(60, None), RunArgs::job(JobId(1))).await.unwrap();

        let err = scheduler
            .add_job("a", interval(30, None), RunArgs::job(JobId(2)))
            .await
            .unwrap_err();
        assert!(matches!(err, EngineError::Remote { status: 409, .. }));
        let err = scheduler.pause_job("ghost").await.unwrap_err();
        assert!(err.is_not_found());
        assert_eq!(scheduler.cached("a"), Some(job));
        assert!(scheduler.cached("ghost").is_none());
    }

    #[tokio::test]
    async fn test_invalid_trigger_rejected_locally() {
        let counter = Arc::new(AtomicUsize::new(0));
        let (addr, _) = spawn_primary(None, Some(counter.clone())).await;
        let scheduler = delegate(addr, None, 60_000, 10);
        let err = scheduler
            .add_job("a", interval(0, None), RunArgs::job(JobId(1)))
            .await
            .unwrap_err();
        assert!(matches!(err, EngineError::InvalidTrigger(_)));
        assert_eq!(counter.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_unreachable_primary_is_transport_error() {
        let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        let addr = listener.local_addr().unwrap();
        drop(listener);
        let scheduler = delegate(addr, None, 60_000, 10);
        assert!(matches!(scheduler.get_jobs().await.unwrap_err(), EngineError::Transport(_)));
    }

    #[tokio::test]
    async fn test_listing_older_than_a_mutation_is_discarded() {
        let (addr, _primary) = spawn_primary(None, None).await;
        let scheduler = delegate(addr, None, 60_000, 10);

        let seen = scheduler.inner.generation.load(Ordering::SeqCst);
        let stale = scheduler.get_jobs().await.unwrap();
        assert!(stale.is_empty());
        let seen_after_list = scheduler.inner.generation.load(Ordering::SeqCst);
        assert_eq!(seen, seen_after_list);

        scheduler.add_job("fresh", interval(60, None), RunArgs::job(JobId(1))).await.unwrap();
        assert!(!scheduler.inner.replace_cache(seen, &stale));
        assert!(scheduler.cached("fresh").is_some());

        // A listing taken after the mutation applies.
        scheduler.get_jobs().await.unwrap();
        assert!(scheduler.cached("fresh").is_some());
        let current = scheduler.inner.generation.load(Ordering::SeqCst);
        assert!(scheduler.inner.replace_cache(current, &[]));
        assert!(scheduler.cached("fresh").is_none());
    }
}
