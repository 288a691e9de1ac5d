pub mod queue;

pub use queue::{JobQueue, QueueCounts};

use crate::util::digest::{compute_digest, Digest};
use crate::vmms::Machine;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;

/// Pointer to a file on this host plus the name it takes inside the
/// execution environment.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InputFile {
    pub local_file: PathBuf,
    pub dest_file: String,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OutputFormat {
    #[default]
    Raw,
    Base64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OutputSpec {
    pub dest_path: PathBuf,
    #[serde(default)]
    pub format: OutputFormat,
    #[serde(default)]
    pub callback_url: Option<String>,
}

#[derive(Debug, Clone, Serialize)]
pub struct Job {
    pub id: u64,
    pub name: String,
    pub image: String,
    pub input: Vec<InputFile>,
    pub output: OutputSpec,
    pub timeout_secs: u64,
    pub max_output_bytes: usize,
    pub notify_url: Option<String>,
    #[serde(skip)]
    pub access_key: Option<String>,
    /// The environment this job currently owns, if any. While set, that
    /// machine is in its pool's total set but never on a free list.
    pub vm: Option<Machine>,
    pub assigned: bool,
    pub retries: u32,
    pub cancel_requested: bool,
    pub trace: Vec<String>,
    pub appended_at: Option<DateTime<Utc>>,
    pub assigned_at: Option<DateTime<Utc>>,
    pub started_at: Option<DateTime<Utc>>,
    pub finished_at: Option<DateTime<Utc>>,
    #[serde(skip)]
    pub fingerprint: Option<String>,
}

impl Job {
    pub fn new(
        name: impl Into<String>,
        image: impl Into<String>,
        input: Vec<InputFile>,
        output: OutputSpec,
        timeout_secs: u64,
        max_output_bytes: usize,
    ) -> Self {
        Self {
            id: 0,
            name: name.into(),
            image: image.into(),
            input,
            output,
            timeout_secs,
            max_output_bytes,
            notify_url: None,
            access_key: None,
            vm: None,
            assigned: false,
            retries: 0,
            cancel_requested: false,
            trace: vec![],
            appended_at: None,
            assigned_at: None,
            started_at: None,
            finished_at: None,
            fingerprint: None,
        }
    }

    pub fn append_trace(&mut self, message: &str) {
        self.trace.push(format!(
            "{}|{}",
            Utc::now().format("%Y-%m-%d %H:%M:%S%.3f"),
            message
        ));
    }
}

/// Identity used for duplicate suppression: the image, the ordered input
/// files by destination name and content digest, and the output destination.
/// The requester key participates only when configured to.
pub fn job_fingerprint(
    image: &str,
    inputs: &[(String, Digest)],
    output_dest: &std::path::Path,
    access_key: Option<&str>,
) -> String {
    let mut buf = String::new();
    buf.push_str(image);
    buf.push('\n');
    for (dest, digest) in inputs {
        buf.push_str(dest);
        buf.push(':');
        buf.push_str(&digest.hash);
        buf.push('\n');
    }
    buf.push_str(&output_dest.to_string_lossy());
    if let Some(key) = access_key {
        buf.push('\n');
        buf.push_str(key);
    }
    compute_digest(buf.as_bytes()).hash
}
