use async_trait::async_trait;
use common::{Job, Outcome, Target};
use serde_json::Value;
use std::collections::HashMap;
use std::sync::{Arc, Mutex};

/// Log lines of one run. Every line also goes to the `job_output` log target.
#[derive(Debug, Default)]
pub struct RunLog {
    job: String,
    lines: Mutex<Vec<String>>,
}

impl RunLog {
    pub fn new(job: &str) -> Self {
        Self { job: job.to_string(), lines: Mutex::new(Vec::new()) }
    }

    pub fn line(&self, message: impl Into<String>) {
        let message = message.into();
        log::info!(target: "job_output", "[{}] {}", self.job, message);
        let line = format!("{} - {}", chrono::Utc::now().format("%Y-%m-%d %H:%M:%S%.3f"), message);
        self.lines.lock().unwrap_or_else(|e| e.into_inner()).push(line);
    }

    pub fn lines(&self) -> Vec<String> {
        self.lines.lock().unwrap_or_else(|e| e.into_inner()).clone()
    }
}

/// One invocation of a service implementation.
pub struct ServiceCall<'a> {
    pub job: &'a Job,
    /// The service's configured properties.
    pub properties: &'a Value,
    pub payload: &'a Value,
    pub target: Option<&'a Target>,
    pub log: &'a RunLog,
}

/// A kind of service. Expected failures are reported as `Outcome::failure`;
/// an `Err` is an unexpected fault and is converted to a failed outcome by the
/// dispatcher.
#[async_trait]
pub trait Executable: Send + Sync {
    async fn execute(&self, call: ServiceCall<'_>) -> anyhow::Result<Outcome>;
}

/// Always succeeds. Backs the `Start` and `End` workflow sentinels.
pub struct Noop;

#[async_trait]
impl Executable for Noop {
    async fn execute(&self, call: ServiceCall<'_>) -> anyhow::Result<Outcome> {
        let result = match call.target {
            Some(target) => format!("noop on {}", target.name),
            None => "noop".to_string(),
        };
        Ok(Outcome::success(result))
    }
}

/// Maps a service's `implementation` tag to its executable.
#[derive(Clone, Default)]
pub struct Registry {
    executables: HashMap<String, Arc<dyn Executable>>,
}

impl Registry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registry with `noop`, `command` and `webhook`.
    pub fn with_builtins() -> Self {
        let mut registry = Self::new();
        registry.register("noop", Noop);
        registry.register("command", crate::command::Command);
        registry.register("webhook", crate::notifier::Webhook::new());
        registry
    }

    pub fn register(&mut self, tag: &str, executable: impl Executable + 'static) -> &mut Self {
        self.executables.insert(tag.to_string(), Arc::new(executable));
        self
    }

    pub fn get(&self, tag: &str) -> Option<Arc<dyn Executable>> {
        self.executables.get(tag).cloned()
    }

    pub fn tags(&self) -> Vec<&str> {
        let mut tags: Vec<&str> = self.executables.keys().map(|s| s.as_str()).collect();
        tags.sort_unstable();
        tags
    }
}
