use crate::jobs::{Job, OutputFormat};
use base64::{engine::general_purpose::STANDARD, Engine as _};
use std::time::Duration;

/// Fire-and-forget callbacks to the requester. At most once, never retried;
/// a failed delivery is logged and forgotten.
pub struct Notifier {
    client: reqwest::Client,
}

impl Default for Notifier {
    fn default() -> Self {
        Self::new()
    }
}

impl Notifier {
    pub fn new() -> Self {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(10))
            .build()
            .unwrap_or_else(|_| reqwest::Client::new());
        Self { client }
    }

    /// POST `{id, status, trace}` to the job's notify URL, if it has one.
    pub async fn job_finished(&self, job: &Job, status: &str) {
        let Some(url) = &job.notify_url else {
            return;
        };

        let body = serde_json::json!({
            "id": job.id,
            "status": status,
            "trace": job.trace,
        });

        match self.client.post(url).json(&body).send().await {
            Ok(response) if response.status().is_success() => {
                tracing::debug!(job = job.id, url, "status notification delivered");
            }
            Ok(response) => {
                tracing::warn!(
                    job = job.id,
                    url,
                    status = %response.status(),
                    "status notification rejected"
                );
            }
            Err(e) => {
                tracing::warn!(job = job.id, url, "status notification failed: {}", e);
            }
        }
    }

    /// Deliver the captured output to the job's callback URL, raw or base64
    /// per the declared format.
    pub async fn output_callback(&self, job: &Job) {
        let Some(url) = &job.output.callback_url else {
            return;
        };

        let bytes = match tokio::fs::read(&job.output.dest_path).await {
            Ok(bytes) => bytes,
            Err(e) => {
                tracing::warn!(
                    job = job.id,
                    path = %job.output.dest_path.display(),
                    "cannot read captured output for callback: {}",
                    e
                );
                return;
            }
        };

        let request = match job.output.format {
            OutputFormat::Raw => self.client.post(url).body(bytes),
            OutputFormat::Base64 => self.client.post(url).json(&serde_json::json!({
                "id": job.id,
                "output": STANDARD.encode(&bytes),
            })),
        };

        match request.send().await {
            Ok(response) if response.status().is_success() => {
                tracing::debug!(job = job.id, url, "output callback delivered");
            }
            Ok(response) => {
                tracing::warn!(
                    job = job.id,
                    url,
                    status = %response.status(),
                    "output callback rejected"
                );
            }
            Err(e) => {
                tracing::warn!(job = job.id, url, "output callback failed: {}", e);
            }
        }
    }
}
