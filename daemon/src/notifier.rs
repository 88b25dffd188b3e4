use anyhow::Context as _;
use async_trait::async_trait;
use common::{Job, Outcome, Run};
use serde::Deserialize;
use serde_json::{json, Value};
use std::collections::HashMap;
use std::sync::Arc;

use crate::context::Context;
use crate::registry::{Executable, ServiceCall};
use crate::retry::{self, RunRequest};

#[derive(Debug, Deserialize)]
struct WebhookProperties {
    url: String,
    #[serde(default)]
    channel: Option<String>,
    #[serde(default)]
    username: Option<String>,
    #[serde(default)]
    headers: HashMap<String, String>,
}

/// Posts the payload's `content` to a Slack/Mattermost-style incoming webhook.
pub struct Webhook {
    client: reqwest::Client,
}

impl Webhook {
    pub fn new() -> Self {
        Self { client: reqwest::Client::new() }
    }
}

impl Default for Webhook {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Executable for Webhook {
    async fn execute(&self, call: ServiceCall<'_>) -> anyhow::Result<Outcome> {
        let props: WebhookProperties = serde_json::from_value(call.properties.clone())
            .context("invalid webhook properties")?;

        let text = call
            .payload
            .get("content")
            .and_then(Value::as_str)
            .map(str::to_string)
            .unwrap_or_else(|| call.payload.to_string());

        let mut body = json!({ "text": text });
        if let Some(channel) = &props.channel {
            body["channel"] = json!(channel);
        }
        if let Some(username) = &props.username {
            body["username"] = json!(username);
        }

        let mut request = self.client.post(&props.url);
        for (key, value) in &props.headers {
            request = request.header(key, value);
        }

        let response = request.json(&body).send().await?;
        let status = response.status();
        if status.is_success() {
            call.log.line(format!("Notification posted to {}", props.url));
            Ok(Outcome::success(json!({ "status": status.as_u16() })))
        } else {
            log::error!("Webhook failed with status: {}", status);
            Ok(Outcome::failure(json!({ "status": status.as_u16() })))
        }
    }
}

/// Payload handed to the notification job.
pub fn notification_payload(job: &Job, run: &Run) -> Value {
    json!({
        "job": { "id": job.id, "name": job.name },
        "runtime": run.runtime,
        "result": run,
        "content": run.summary(),
    })
}

/// Invoke the job named by `notification_method` with the run summary.
/// Failures are logged, never propagated.
pub async fn notify(ctx: &Arc<Context>, job: &Job, run: &Run) {
    let Some(method) = job.notification_method.as_deref() else {
        log::warn!("Job {} wants notifications but names no notification job", job.name);
        return;
    };

    let request = RunRequest::by_name(method)
        .payload(notification_payload(job, run))
        .nested();
    match retry::try_run(ctx, request).await {
        Ok(report) if report.run.success => {
            log::info!("Notification for {} sent via {}", job.name, method)
        }
        Ok(_) => log::error!("Notification job {} failed for {}", method, job.name),
        Err(e) => log::error!("Failed to send notification via {}: {}", method, e),
    }
}
