use anyhow::anyhow;
use common::{EdgeKind, Job, JobId, Outcome};
use serde_json::{json, Map, Value};
use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

use crate::context::Context;
use crate::registry::RunLog;
use crate::retry::{self, RunRequest};
use crate::store::{require_job, Lookup};

/// Execution body of a workflow job.
///
/// Members are popped from a work list seeded with `Start`. A member whose
/// prerequisite predecessors have not all run yet is set aside and put back
/// on the list after the next member completes; members still waiting when
/// the list empties are dropped. `End` is evaluated after everything else
/// reachable and its outcome is the workflow's outcome.
///
/// Each member sees the accumulated payload, in which every finished member's
/// outcome is recorded under its name.
pub async fn run(ctx: &Arc<Context>, workflow: &Job, payload: &Value, log: &RunLog) -> anyhow::Result<Outcome> {
    let spec = workflow
        .as_workflow()
        .ok_or_else(|| anyhow!("{} is not a workflow", workflow.name))?;

    let mut state = match payload {
        Value::Object(map) => map.clone(),
        Value::Null => Map::new(),
        other => {
            let mut map = Map::new();
            map.insert("payload".to_string(), other.clone());
            map
        }
    };
    let mut work = vec![spec.start];
    let mut deferred: Vec<JobId> = Vec::new();
    let mut visited = HashSet::new();
    let mut path = Vec::new();
    let mut end_reached = false;

    while let Some(id) = work.pop() {
        if visited.contains(&id) {
            continue;
        }
        if id == spec.end {
            end_reached = true;
            continue;
        }
        if spec.prerequisites(id).any(|p| !visited.contains(&p)) {
            if !deferred.contains(&id) {
                deferred.push(id);
            }
            continue;
        }
        visited.insert(id);

        let member = require_job(ctx.store.as_ref(), Lookup::Id(id.0))?;
        let outcome = if id == spec.start {
            Outcome::success(Value::Null)
        } else {
            run_member(ctx, &member, &state).await
        };
        log.line(format!(
            "Workflow {} step {}: {}",
            workflow.name,
            member.name,
            if outcome.success { "success" } else { "failure" }
        ));
        path.push(member.name.clone());
        state.insert(member.name.clone(), json!({ "success": outcome.success, "result": outcome.result }));

        let subtype = if outcome.success { EdgeKind::Success } else { EdgeKind::Failure };
        work.extend(spec.outgoing(id, subtype).filter(|next| !visited.contains(next)));
        work.append(&mut deferred);

        if member.waiting_time_seconds > 0
            && !ctx.sleep(Duration::from_secs(member.waiting_time_seconds)).await
        {
            log.line(format!("Workflow {} interrupted by shutdown", workflow.name));
            end_reached = false;
            break;
        }
    }

    for id in deferred {
        log.line(format!("Workflow {} dropped job {}: prerequisites never ran", workflow.name, id));
        log::warn!("Workflow {} dropped job {} with unmet prerequisites", workflow.name, id);
    }

    let success = end_reached && spec.prerequisites(spec.end).all(|p| visited.contains(&p));
    if success {
        let end = require_job(ctx.store.as_ref(), Lookup::Id(spec.end.0))?;
        path.push(end.name.clone());
        state.insert(end.name, json!({ "success": true, "result": Value::Null }));
    } else {
        log.line(format!("Workflow {} did not reach End", workflow.name));
    }

    Ok(Outcome {
        success,
        result: json!({ "path": path, "payload": Value::Object(state) }),
    })
}

async fn run_member(ctx: &Arc<Context>, member: &Job, state: &Map<String, Value>) -> Outcome {
    let request = RunRequest::by_id(member.id)
        .payload(Value::Object(state.clone()))
        .nested();
    match retry::try_run(ctx, request).await {
        Ok(report) => match serde_json::to_value(&report.run.results) {
            Ok(result) => Outcome { success: report.run.success, result },
            Err(e) => Outcome::failure(e.to_string()),
        },
        Err(e) => Outcome::failure(e.to_string()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::catalog::{END, START};
    use crate::registry::{Executable, Registry, ServiceCall};
    use crate::store::MemoryStore;
    use async_trait::async_trait;
    use common::JobKind;

    /// Fails when the service's properties say so; returns the payload keys.
    struct Step;

    #[async_trait]
    impl Executable for Step {
        async fn execute(&self, call: ServiceCall<'_>) -> anyhow::Result<Outcome> {
            let seen: Vec<String> = call
                .payload
                .as_object()
                .map(|m| m.keys().cloned().collect())
                .unwrap_or_default();
            if call.properties["fail"].as_bool().unwrap_or(false) {
                Ok(Outcome::failure(json!(seen)))
            } else {
                Ok(Outcome::success(json!(seen)))
            }
        }
    }

    fn context() -> Arc<Context> {
        let mut registry = Registry::with_builtins();
        registry.register("step", Step);
        Context::builder(Arc::new(MemoryStore::new()))
            .registry(registry)
            .build()
    }

    fn step(ctx: &Context, workflow: &str, name: &str, fail: bool) {
        let mut job = Job::service(name, "step");
        if let JobKind::Service(spec) = &mut job.kind {
            spec.properties = json!({ "fail": fail });
        }
        ctx.define_job(job).unwrap();
        ctx.add_member(workflow, name).unwrap();
    }

    async fn execute(ctx: &Arc<Context>, name: &str) -> Outcome {
        let job = require_job(ctx.store.as_ref(), Lookup::Name(name)).unwrap();
        run(ctx, &job, &Value::Null, &RunLog::new(name)).await.unwrap()
    }

    fn path(outcome: &Outcome) -> Vec<String> {
        serde_json::from_value(outcome.result["path"].clone()).unwrap()
    }

    #[tokio::test]
    async fn test_success_edges_reach_end_last() {
        let ctx = context();
        ctx.create_workflow("provision").unwrap();
        for name in ["a", "b", "c", "unreached", "on-failure"] {
            step(&ctx, "provision", name, false);
        }
        ctx.connect("provision", START, "a", EdgeKind::Success).unwrap();
        ctx.connect("provision", START, "b", EdgeKind::Success).unwrap();
        ctx.connect("provision", "a", END, EdgeKind::Success).unwrap();
        ctx.connect("provision", "b", "c", EdgeKind::Success).unwrap();
        ctx.connect("provision", "c", END, EdgeKind::Success).unwrap();
        ctx.connect("provision", "a", "on-failure", EdgeKind::Failure).unwrap();

        let outcome = execute(&ctx, "provision").await;
        assert!(outcome.success);

        let path = path(&outcome);
        let visited: HashSet<&str> = path.iter().map(|s| s.as_str()).collect();
        assert_eq!(visited, HashSet::from([START, "a", "b", "c", END]));
        assert_eq!(path.len(), 5);
        assert_eq!(path.first().map(String::as_str), Some(START));
        assert_eq!(path.last().map(String::as_str), Some(END));
    }

    #[tokio::test]
    async fn test_failure_edges_route() {
        let ctx = context();
        ctx.create_workflow("provision").unwrap();
        step(&ctx, "provision", "configure", true);
        step(&ctx, "provision", "rollback", false);
        step(&ctx, "provision", "verify", false);
        ctx.connect("provision", START, "configure", EdgeKind::Success).unwrap();
        ctx.connect("provision", "configure", "verify", EdgeKind::Success).unwrap();
        ctx.connect("provision", "configure", "rollback", EdgeKind::Failure).unwrap();
        ctx.connect("provision", "rollback", END, EdgeKind::Success).unwrap();

        let outcome = execute(&ctx, "provision").await;
        assert!(outcome.success);
        assert_eq!(path(&outcome), vec![START, "configure", "rollback", END]);
        assert_eq!(outcome.result["payload"]["configure"]["success"], false);
    }

    #[tokio::test]
    async fn test_end_never_reached_fails() {
        let ctx = context();
        ctx.create_workflow("provision").unwrap();
        step(&ctx, "provision", "configure", true);
        ctx.connect("provision", START, "configure", EdgeKind::Success).unwrap();
        ctx.connect("provision", "configure", END, EdgeKind::Success).unwrap();

        let outcome = execute(&ctx, "provision").await;
        assert!(!outcome.success);
        assert_eq!(path(&outcome), vec![START, "configure"]);
    }

    #[tokio::test]
    async fn test_prerequisite_defers_instead_of_dropping() {
        let ctx = context();
        ctx.create_workflow("provision").unwrap();
        step(&ctx, "provision", "reserve", false);
        step(&ctx, "provision", "configure", false);
        // Start pushes configure last, so it is popped before reserve ran.
        ctx.connect("provision", START, "reserve", EdgeKind::Success).unwrap();
        ctx.connect("provision", START, "configure", EdgeKind::Success).unwrap();
        ctx.connect("provision", "reserve", "configure", EdgeKind::Prerequisite).unwrap();
        ctx.connect("provision", "configure", END, EdgeKind::Success).unwrap();

        let outcome = execute(&ctx, "provision").await;
        assert!(outcome.success);
        assert_eq!(path(&outcome), vec![START, "reserve", "configure", END]);

        let seen: Vec<String> =
            serde_json::from_value(outcome.result["payload"]["configure"]["result"]["outcome"]["result"].clone())
                .unwrap();
        assert!(seen.contains(&"reserve".to_string()));
    }

    #[tokio::test]
    async fn test_unreachable_prerequisite_drops_member() {
        let ctx = context();
        ctx.create_workflow("provision").unwrap();
        step(&ctx, "provision", "orphan", false);
        step(&ctx, "provision", "configure", false);
        ctx.connect("provision", START, "configure", EdgeKind::Success).unwrap();
        ctx.connect("provision", "orphan", "configure", EdgeKind::Prerequisite).unwrap();
        ctx.connect("provision", "configure", END, EdgeKind::Success).unwrap();

        let outcome = execute(&ctx, "provision").await;
        assert!(!outcome.success);
        assert_eq!(path(&outcome), vec![START]);
    }

    #[tokio::test]
    async fn test_nested_workflow() {
        let ctx = context();
        ctx.create_workflow("inner").unwrap();
        step(&ctx, "inner", "configure", false);
        ctx.connect("inner", START, "configure", EdgeKind::Success).unwrap();
        ctx.connect("inner", "configure", END, EdgeKind::Success).unwrap();

        ctx.create_workflow("outer").unwrap();
        ctx.add_member("outer", "inner").unwrap();
        step(&ctx, "outer", "report", false);
        ctx.connect("outer", START, "inner", EdgeKind::Success).unwrap();
        ctx.connect("outer", "inner", "report", EdgeKind::Success).unwrap();
        ctx.connect("outer", "report", END, EdgeKind::Success).unwrap();

        let outcome = execute(&ctx, "outer").await;
        assert!(outcome.success);
        assert_eq!(path(&outcome), vec![START, "inner", "report", END]);
        assert_eq!(outcome.result["payload"]["inner"]["success"], true);

        // The member run was recorded against the inner workflow.
        let inner = require_job(ctx.store.as_ref(), Lookup::Name("inner")).unwrap();
        assert_eq!(ctx.store.fetch_runs(inner.id).unwrap().len(), 1);
    }
}
