use async_trait::async_trait;
use common::{JobId, RunArgs};
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use std::sync::{Arc, Weak};
use std::time::Duration;
use tokio::sync::watch;

use crate::config::Config;
use crate::error::{EngineError, Result};
use crate::inventory::{Inventory, StaticInventory};
use crate::metrics::MetricsCollector;
use crate::registry::Registry;
use crate::retry::{self, RunRequest};
use crate::scheduler::primary::PrimaryScheduler;
use crate::scheduler::{JobRunner, Scheduler};
use crate::store::Store;

/// Everything an engine call needs: configuration, persistence, executables,
/// inventory and the scheduler handle.
pub struct Context {
    pub config: Config,
    pub store: Arc<dyn Store>,
    pub registry: Registry,
    pub inventory: Arc<dyn Inventory>,
    pub metrics: Arc<MetricsCollector>,
    scheduler: Arc<dyn Scheduler>,
    in_flight: DashMap<JobId, ()>,
    shutdown: watch::Sender<bool>,
}

pub struct ContextBuilder {
    config: Config,
    store: Arc<dyn Store>,
    registry: Registry,
    inventory: Arc<dyn Inventory>,
    metrics: Arc<MetricsCollector>,
    scheduler: Option<Arc<dyn Scheduler>>,
}

impl ContextBuilder {
    pub fn config(mut self, config: Config) -> Self {
        self.config = config;
        self
    }

    pub fn registry(mut self, registry: Registry) -> Self {
        self.registry = registry;
        self
    }

    pub fn inventory(mut self, inventory: impl Inventory + 'static) -> Self {
        self.inventory = Arc::new(inventory);
        self
    }

    pub fn metrics(mut self, metrics: Arc<MetricsCollector>) -> Self {
        self.metrics = metrics;
        self
    }

    pub fn scheduler(mut self, scheduler: Arc<dyn Scheduler>) -> Self {
        self.scheduler = Some(scheduler);
        self
    }

    /// Without an explicit scheduler, an embedded primary over the same store is used.
    pub fn build(self) -> Arc<Context> {
        let scheduler = self.scheduler.unwrap_or_else(|| {
            Arc::new(PrimaryScheduler::new(
                self.config.scheduler.clone(),
                self.store.clone(),
                self.metrics.clone(),
            ))
        });
        let (shutdown, _) = watch::channel(false);
        let ctx = Arc::new(Context {
            config: self.config,
            store: self.store,
            registry: self.registry,
            inventory: self.inventory,
            metrics: self.metrics,
            scheduler,
            in_flight: DashMap::new(),
            shutdown,
        });
        let weak = Arc::downgrade(&ctx);
        let runner: Weak<dyn JobRunner> = weak;
        ctx.scheduler.bind(runner);
        ctx
    }
}

/// Marks a job as in flight for as long as it lives.
pub struct InFlight<'a> {
    map: &'a DashMap<JobId, ()>,
    job: JobId,
}

impl Drop for InFlight<'_> {
    fn drop(&mut self) {
        self.map.remove(&self.job);
    }
}

impl Context {
    pub fn builder(store: Arc<dyn Store>) -> ContextBuilder {
        ContextBuilder {
            config: Config::default(),
            store,
            registry: Registry::with_builtins(),
            inventory: Arc::new(StaticInventory::default()),
            metrics: Arc::new(MetricsCollector::new()),
            scheduler: None,
        }
    }

    pub fn scheduler(&self) -> &Arc<dyn Scheduler> {
        &self.scheduler
    }

    /// Claim exclusive execution of a job. Fails if it is already claimed.
    pub fn claim(&self, job: JobId, name: &str) -> Result<InFlight<'_>> {
        match self.in_flight.entry(job) {
            Entry::Occupied(_) => Err(EngineError::AlreadyRunning { name: name.to_string() }),
            Entry::Vacant(slot) => {
                slot.insert(());
                Ok(InFlight { map: &self.in_flight, job })
            }
        }
    }

    pub fn is_running(&self, job: JobId) -> bool {
        self.in_flight.contains_key(&job)
    }

    /// Wait for `duration`. Returns false when cut short by `shutdown`.
    pub async fn sleep(&self, duration: Duration) -> bool {
        if duration.is_zero() {
            return true;
        }
        let mut stop = self.shutdown.subscribe();
        if *stop.borrow() {
            return false;
        }
        tokio::select! {
            _ = tokio::time::sleep(duration) => true,
            _ = stop.changed() => false,
        }
    }

    /// Interrupt pending retry and step waits.
    pub fn shutdown(&self) {
        self.shutdown.send_replace(true);
    }

    pub fn is_shutting_down(&self) -> bool {
        *self.shutdown.borrow()
    }
}

#[async_trait]
impl JobRunner for Context {
    async fn run_scheduled(self: Arc<Self>, entry: String, args: RunArgs) {
        let job = args.job_id;
        match retry::try_run(&self, RunRequest::from(args)).await {
            Ok(report) => log::info!(
                "Scheduled entry {} ran job {} ({}): success={}",
                entry, report.run.job_name, report.runtime, report.run.success
            ),
            Err(e) => log::error!("Scheduled entry {} could not run job {}: {}", entry, job, e),
        }
    }
}
