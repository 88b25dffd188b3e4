use anyhow::anyhow;
use common::{Job, JobKind, Outcome, Target};
use futures::FutureExt;
use serde_json::Value;
use std::any::Any;
use std::collections::BTreeMap;
use std::panic::AssertUnwindSafe;
use std::sync::{Arc, Mutex};
use tokio::sync::Semaphore;

use crate::context::Context;
use crate::registry::{RunLog, ServiceCall};
use crate::workflow;

/// Outcome of a single attempt over a set of targets.
#[derive(Debug, Clone, PartialEq)]
pub enum AttemptResults {
    Single(Outcome),
    PerTarget(BTreeMap<String, Outcome>),
}

/// Run `job` once against `targets`. Per-target faults never abort siblings.
pub async fn dispatch(
    ctx: &Arc<Context>,
    job: &Arc<Job>,
    targets: &[Target],
    payload: &Arc<Value>,
    log: &Arc<RunLog>,
) -> AttemptResults {
    if targets.is_empty() {
        let outcome = guarded(ctx, job, payload, log, None).await;
        return AttemptResults::Single(outcome);
    }

    let results = Arc::new(Mutex::new(BTreeMap::new()));
    if job.concurrency_enabled {
        let workers = targets.len().min(job.max_concurrency.max(1));
        log.line(format!("Running on {} targets with {} workers", targets.len(), workers));
        let pool = Arc::new(Semaphore::new(workers));
        let mut handles = Vec::with_capacity(targets.len());

        for target in targets.iter().cloned() {
            let Ok(permit) = pool.clone().acquire_owned().await else {
                break;
            };
            let (ctx, job, payload, log, results) =
                (ctx.clone(), job.clone(), payload.clone(), log.clone(), results.clone());
            let name = target.name.clone();
            let handle = tokio::spawn(async move {
                let _permit = permit;
                let outcome = guarded(&ctx, &job, &payload, &log, Some(&target)).await;
                record(&ctx, &job, &results, target.name, outcome);
            });
            handles.push((name, handle));
        }

        for (name, handle) in handles {
            if let Err(e) = handle.await {
                record(ctx, job, &results, name, Outcome::failure(format!("worker failed: {}", e)));
            }
        }
    } else {
        for target in targets {
            let outcome = guarded(ctx, job, payload, log, Some(target)).await;
            record(ctx, job, &results, target.name.clone(), outcome);
        }
    }

    let outcomes = std::mem::take(&mut *results.lock().unwrap_or_else(|e| e.into_inner()));
    AttemptResults::PerTarget(outcomes)
}

/// The only place the shared outcome map is written.
fn record(
    ctx: &Context,
    job: &Job,
    results: &Mutex<BTreeMap<String, Outcome>>,
    target: String,
    outcome: Outcome,
) {
    ctx.metrics.record_progress(job.id, outcome.success);
    results
        .lock()
        .unwrap_or_else(|e| e.into_inner())
        .insert(target, outcome);
}

/// Execute and convert errors and panics into failed outcomes.
async fn guarded(
    ctx: &Arc<Context>,
    job: &Job,
    payload: &Value,
    log: &RunLog,
    target: Option<&Target>,
) -> Outcome {
    match AssertUnwindSafe(execute(ctx, job, payload, log, target))
        .catch_unwind()
        .await
    {
        Ok(Ok(outcome)) => outcome,
        Ok(Err(e)) => {
            let on = target.map(|t| t.name.as_str()).unwrap_or(&job.name);
            log.line(format!("Error on {}: {:#}", on, e));
            Outcome::failure(format!("{:#}", e))
        }
        Err(panic) => {
            let message = panic_message(panic);
            log.line(format!("Execution panicked: {}", message));
            Outcome::failure(format!("panicked: {}", message))
        }
    }
}

async fn execute(
    ctx: &Arc<Context>,
    job: &Job,
    payload: &Value,
    log: &RunLog,
    target: Option<&Target>,
) -> anyhow::Result<Outcome> {
    match &job.kind {
        JobKind::Workflow(_) => workflow::run(ctx, job, payload, log).await,
        JobKind::Service(spec) => {
            let executable = ctx.registry.get(&spec.implementation).ok_or_else(|| {
                anyhow!("no executable registered for '{}'", spec.implementation)
            })?;
            executable
                .execute(ServiceCall {
                    job,
                    properties: &spec.properties,
                    payload,
                    target,
                    log,
                })
                .await
        }
    }
}

fn panic_message(panic: Box<dyn Any + Send>) -> String {
    if let Some(s) = panic.downcast_ref::<&str>() {
        s.to_string()
    } else if let Some(s) = panic.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic".to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::metrics::MetricsCollector;
    use crate::registry::{Executable, Registry};
    use crate::store::MemoryStore;
    use async_trait::async_trait;
    use std::time::Duration;

    /// `bad` errors, `boom` panics, everything else succeeds.
    struct Flaky;

    #[async_trait]
    impl Executable for Flaky {
        async fn execute(&self, call: ServiceCall<'_>) -> anyhow::Result<Outcome> {
            match call.target.map(|t| t.name.as_str()) {
                Some("bad") => Err(anyhow!("connection refused")),
                Some("boom") => panic!("driver crashed"),
                Some(name) => Ok(Outcome::success(name)),
                None => Ok(Outcome::success(call.payload.clone())),
            }
        }
    }

    /// `slow` only finishes once another target's result has been recorded.
    struct WaitsForSibling {
        metrics: Arc<MetricsCollector>,
    }

    #[async_trait]
    impl Executable for WaitsForSibling {
        async fn execute(&self, call: ServiceCall<'_>) -> anyhow::Result<Outcome> {
            let target = call.target.map(|t| t.name.clone()).unwrap_or_default();
            if target != "slow" {
                return Ok(Outcome::success("fast"));
            }
            for _ in 0..200 {
                if self.metrics.progress(call.job.id).0 >= 1 {
                    return Ok(Outcome::success("slow"));
                }
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
            Ok(Outcome::failure("sibling result never recorded"))
        }
    }

    fn context(registry: Registry, metrics: Arc<MetricsCollector>) -> Arc<Context> {
        Context::builder(Arc::new(MemoryStore::new()))
            .registry(registry)
            .metrics(metrics)
            .build()
    }

    fn targets(names: &[&str]) -> Vec<Target> {
        names.iter().map(|n| Target::named(n)).collect()
    }

    #[tokio::test]
    async fn test_no_targets_runs_once_with_payload() {
        let mut registry = Registry::new();
        registry.register("flaky", Flaky);
        let ctx = context(registry, Arc::new(MetricsCollector::new()));
        let job = Arc::new(Job::service("probe", "flaky"));
        let payload = Arc::new(serde_json::json!({"vlan": 10}));
        let log = Arc::new(RunLog::new("probe"));

        let results = dispatch(&ctx, &job, &[], &payload, &log).await;
        assert_eq!(
            results,
            AttemptResults::Single(Outcome::success(serde_json::json!({"vlan": 10})))
        );
    }

    #[tokio::test]
    async fn test_target_faults_are_isolated() {
        let mut registry = Registry::new();
        registry.register("flaky", Flaky);
        let ctx = context(registry, Arc::new(MetricsCollector::new()));
        let log = Arc::new(RunLog::new("probe"));
        let payload = Arc::new(Value::Null);

        for concurrent in [false, true] {
            let mut job = Job::service("probe", "flaky");
            job.concurrency_enabled = concurrent;
            let job = Arc::new(job);
            let results = dispatch(&ctx, &job, &targets(&["ok", "bad", "boom", "ok2"]), &payload, &log).await;
            let AttemptResults::PerTarget(map) = results else {
                panic!("expected per-target results");
            };
            assert_eq!(map.len(), 4);
            assert!(map["ok"].success);
            assert!(map["ok2"].success);
            assert!(!map["bad"].success);
            assert_eq!(map["bad"].result, "connection refused");
            assert!(!map["boom"].success);
            assert!(map["boom"].result.as_str().unwrap().contains("driver crashed"));
        }
    }

    #[tokio::test]
    async fn test_missing_executable_fails_each_target() {
        let ctx = context(Registry::new(), Arc::new(MetricsCollector::new()));
        let job = Arc::new(Job::service("probe", "netconf"));
        let results = dispatch(
            &ctx,
            &job,
            &targets(&["r1"]),
            &Arc::new(Value::Null),
            &Arc::new(RunLog::new("probe")),
        )
        .await;
        let AttemptResults::PerTarget(map) = results else {
            panic!("expected per-target results");
        };
        assert!(map["r1"].result.as_str().unwrap().contains("netconf"));
    }

    #[tokio::test]
    async fn test_fast_target_recorded_while_slow_runs() {
        let metrics = Arc::new(MetricsCollector::new());
        let mut registry = Registry::new();
        registry.register("wait", WaitsForSibling { metrics: metrics.clone() });
        let ctx = context(registry, metrics.clone());

        let mut job = Job::service("probe", "wait");
        job.concurrency_enabled = true;
        job.max_concurrency = 4;
        let job = Arc::new(job);

        let results = dispatch(
            &ctx,
            &job,
            &targets(&["slow", "fast"]),
            &Arc::new(Value::Null),
            &Arc::new(RunLog::new("probe")),
        )
        .await;
        let AttemptResults::PerTarget(map) = results else {
            panic!("expected per-target results");
        };
        assert!(map["fast"].success);
        assert!(map["slow"].success, "slow target saw no sibling result: {:?}", map["slow"]);
        assert_eq!(metrics.progress(job.id), (2, 0));
    }

    #[tokio::test]
    async fn test_pool_is_bounded() {
        struct Counting {
            active: std::sync::atomic::AtomicUsize,
            peak: std::sync::atomic::AtomicUsize,
        }

        #[async_trait]
        impl Executable for Arc<Counting> {
            async fn execute(&self, _call: ServiceCall<'_>) -> anyhow::Result<Outcome> {
                use std::sync::atomic::Ordering;
                let now = self.active.fetch_add(1, Ordering::SeqCst) + 1;
                self.peak.fetch_max(now, Ordering::SeqCst);
                tokio::time::sleep(Duration::from_millis(20)).await;
                self.active.fetch_sub(1, Ordering::SeqCst);
                Ok(Outcome::success(Value::Null))
            }
        }

        let counter = Arc::new(Counting {
            active: Default::default(),
            peak: Default::default(),
        });
        let mut registry = Registry::new();
        registry.register("count", counter.clone());
        let ctx = context(registry, Arc::new(MetricsCollector::new()));

        let mut job = Job::service("probe", "count");
        job.concurrency_enabled = true;
        job.max_concurrency = 2;
        let names: Vec<String> = (0..6).map(|i| format!("r{}", i)).collect();
        let names: Vec<&str> = names.iter().map(|s| s.as_str()).collect();
        dispatch(
            &ctx,
            &Arc::new(job),
            &targets(&names),
            &Arc::new(Value::Null),
            &Arc::new(RunLog::new("probe")),
        )
        .await;
        assert_eq!(counter.peak.load(std::sync::atomic::Ordering::SeqCst), 2);
    }
}
