use anyhow::{anyhow, Context as _};
use async_trait::async_trait;
use common::Outcome;
use serde::Deserialize;
use serde_json::json;
use std::collections::HashMap;
use std::time::Duration;

use crate::registry::{Executable, ServiceCall};

#[derive(Debug, Deserialize)]
struct CommandProperties {
    command: String,
    #[serde(default)]
    args: Vec<String>,
    #[serde(default)]
    env: HashMap<String, String>,
    #[serde(default)]
    timeout_seconds: Option<u64>,
}

/// Runs a local command once per target. The target's name and address and the
/// JSON payload are handed to the process through its environment.
pub struct Command;

#[async_trait]
impl Executable for Command {
    async fn execute(&self, call: ServiceCall<'_>) -> anyhow::Result<Outcome> {
        let props: CommandProperties = serde_json::from_value(call.properties.clone())
            .context("invalid command properties")?;

        let mut cmd = tokio::process::Command::new(&props.command);
        cmd.args(&props.args);
        cmd.envs(&props.env);
        cmd.env("MESHFLOW_JOB", &call.job.name);
        cmd.env("MESHFLOW_PAYLOAD", call.payload.to_string());
        if let Some(target) = call.target {
            cmd.env("MESHFLOW_TARGET", &target.name);
            if let Some(address) = &target.address {
                cmd.env("MESHFLOW_TARGET_ADDRESS", address);
            }
        }
        cmd.stdout(std::process::Stdio::piped());
        cmd.stderr(std::process::Stdio::piped());
        cmd.kill_on_drop(true);

        let child = match cmd.spawn() {
            Ok(child) => child,
            Err(e) => {
                call.log.line(format!("Failed to spawn {}: {}", props.command, e));
                return Ok(Outcome::failure(format!("Failed to spawn: {}", e)));
            }
        };

        let output = match props.timeout_seconds {
            Some(secs) => tokio::time::timeout(Duration::from_secs(secs), child.wait_with_output())
                .await
                .map_err(|_| anyhow!("command exceeded timeout of {}s", secs))?,
            None => child.wait_with_output().await,
        }
        .context("failed to wait for command")?;

        let stdout = String::from_utf8_lossy(&output.stdout);
        let stderr = String::from_utf8_lossy(&output.stderr);
        let target = call.target.map(|t| t.name.as_str()).unwrap_or("-");
        call.log.line(format!("{} on {} finished with status: {}", props.command, target, output.status));

        let result = json!({
            "status": output.status.code(),
            "stdout": stdout,
            "stderr": stderr,
        });
        Ok(Outcome { success: output.status.success(), result })
    }
}
