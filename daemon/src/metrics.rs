use common::JobId;
use dashmap::DashMap;
use std::sync::atomic::{AtomicU64, Ordering};

/// Completed/failed target counts for the run currently in progress.
#[derive(Debug, Default)]
pub struct Progress {
    completed: AtomicU64,
    failed: AtomicU64,
}

impl Progress {
    pub fn completed(&self) -> u64 {
        self.completed.load(Ordering::Relaxed)
    }

    pub fn failed(&self) -> u64 {
        self.failed.load(Ordering::Relaxed)
    }
}

/// Run counters and progress, exported in Prometheus text format.
pub struct MetricsCollector {
    runs: DashMap<String, AtomicU64>,
    successes: DashMap<String, AtomicU64>,
    failures: DashMap<String, AtomicU64>,
    durations: DashMap<String, Vec<u64>>, // last 100 run durations, ms
    progress: DashMap<JobId, Progress>,
    scheduler_fires: AtomicU64,
    misfires: AtomicU64,
}

impl MetricsCollector {
    pub fn new() -> Self {
        Self {
            runs: DashMap::new(),
            successes: DashMap::new(),
            failures: DashMap::new(),
            durations: DashMap::new(),
            progress: DashMap::new(),
            scheduler_fires: AtomicU64::new(0),
            misfires: AtomicU64::new(0),
        }
    }

    pub fn record_run(&self, job: &str, success: bool, duration_ms: u64) {
        bump(&self.runs, job);
        if success {
            bump(&self.successes, job);
        } else {
            bump(&self.failures, job);
        }

        let mut entry = self.durations.entry(job.to_string()).or_default();
        entry.push(duration_ms);
        let len = entry.len();
        if len > 100 {
            entry.drain(0..len - 100);
        }
    }

    pub fn reset_progress(&self, job: JobId) {
        let progress = self.progress.entry(job).or_default();
        progress.completed.store(0, Ordering::Relaxed);
        progress.failed.store(0, Ordering::Relaxed);
    }

    pub fn record_progress(&self, job: JobId, success: bool) {
        let progress = self.progress.entry(job).or_default();
        progress.completed.fetch_add(1, Ordering::Relaxed);
        if !success {
            progress.failed.fetch_add(1, Ordering::Relaxed);
        }
    }

    /// `(completed, failed)` for the job's current run.
    pub fn progress(&self, job: JobId) -> (u64, u64) {
        self.progress
            .get(&job)
            .map(|p| (p.completed(), p.failed()))
            .unwrap_or((0, 0))
    }

    pub fn record_fire(&self) {
        self.scheduler_fires.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_misfire(&self) {
        self.misfires.fetch_add(1, Ordering::Relaxed);
    }

    pub fn export(&self) -> String {
        let mut output = String::new();

        output.push_str("# HELP meshflow_scheduler_fires_total Scheduled entries fired\n");
        output.push_str("# TYPE meshflow_scheduler_fires_total counter\n");
        output.push_str(&format!(
            "meshflow_scheduler_fires_total {}\n\n",
            self.scheduler_fires.load(Ordering::Relaxed)
        ));

        output.push_str("# HELP meshflow_scheduler_misfires_total Fire times skipped past the grace period\n");
        output.push_str("# TYPE meshflow_scheduler_misfires_total counter\n");
        output.push_str(&format!(
            "meshflow_scheduler_misfires_total {}\n\n",
            self.misfires.load(Ordering::Relaxed)
        ));

        write_counter(&mut output, "meshflow_job_runs_total", "Completed job runs", &self.runs);
        write_counter(&mut output, "meshflow_job_successes_total", "Successful job runs", &self.successes);
        write_counter(&mut output, "meshflow_job_failures_total", "Failed job runs", &self.failures);

        output.push_str("# HELP meshflow_job_duration_ms Job run duration percentiles\n");
        output.push_str("# TYPE meshflow_job_duration_ms gauge\n");
        for entry in self.durations.iter() {
            let mut durations = entry.value().clone();
            if durations.is_empty() {
                continue;
            }
            durations.sort_unstable();
            for (quantile, p) in [("0.5", 50.0), ("0.95", 95.0), ("0.99", 99.0)] {
                output.push_str(&format!(
                    "meshflow_job_duration_ms{{job=\"{}\",quantile=\"{}\"}} {}\n",
                    entry.key(),
                    quantile,
                    percentile(&durations, p)
                ));
            }
        }

        output
    }
}

impl Default for MetricsCollector {
    fn default() -> Self {
        Self::new()
    }
}

fn bump(map: &DashMap<String, AtomicU64>, job: &str) {
    map.entry(job.to_string())
        .or_insert_with(|| AtomicU64::new(0))
        .fetch_add(1, Ordering::Relaxed);
}

fn write_counter(output: &mut String, name: &str, help: &str, map: &DashMap<String, AtomicU64>) {
    output.push_str(&format!("# HELP {} {}\n", name, help));
    output.push_str(&format!("# TYPE {} counter\n", name));
    for entry in map.iter() {
        output.push_str(&format!(
            "{}{{job=\"{}\"}} {}\n",
            name,
            entry.key(),
            entry.value().load(Ordering::Relaxed)
        ));
    }
    output.push('\n');
}

fn percentile(sorted_data: &[u64], p: f64) -> u64 {
    if sorted_data.is_empty() {
        return 0;
    }
    let index = ((p / 100.0) * (sorted_data.len() as f64 - 1.0)).round() as usize;
    sorted_data[index.min(sorted_data.len() - 1)]
}
