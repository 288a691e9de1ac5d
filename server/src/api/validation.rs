use super::AppState;
use crate::jobs::{job_fingerprint, InputFile, Job, OutputFormat, OutputSpec};
use crate::storage::FileStore;
use crate::util::digest::compute_digest;
use serde::Deserialize;
use std::path::PathBuf;

#[derive(Debug, Clone, Deserialize)]
pub struct JobRequest {
    pub name: Option<String>,
    pub image: String,
    #[serde(default)]
    pub input_files: Vec<InputFileRequest>,
    pub output_file: OutputFileRequest,
    pub timeout: u64,
    pub max_output_file_size: Option<usize>,
    pub notify_url: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct InputFileRequest {
    /// Name of a file previously uploaded under the requester's key.
    pub local_file: String,
    /// Name the file takes inside the execution environment.
    pub dest_file: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct OutputFileRequest {
    /// Bare destination name; the captured output lands under the
    /// requester's output directory and is polled by this name.
    pub dest_path: String,
    #[serde(default)]
    pub format: OutputFormat,
    pub callback_url: Option<String>,
}

/// A submission that failed validation, shaped so it can still be parked in
/// the dead ring for the client to poll.
#[derive(Debug)]
pub struct Rejected {
    pub job: Job,
    pub reason: String,
}

/// Validate a submission and turn it into a runnable job with resolved
/// paths, a clamped output budget, and a dedupe fingerprint.
pub async fn build_job(state: &AppState, key: &str, request: JobRequest) -> Result<Job, Rejected> {
    let base = base_job(state, key, &request);

    match validate(state, key, &request).await {
        Ok(resolved) => Ok(resolved),
        Err(reason) => Err(Rejected { job: base, reason }),
    }
}

/// Best-effort job built straight from the request, used when the submission
/// is rejected but must remain pollable.
fn base_job(state: &AppState, key: &str, request: &JobRequest) -> Job {
    let mut job = Job::new(
        job_name(request),
        &request.image,
        request
            .input_files
            .iter()
            .map(|f| InputFile {
                local_file: PathBuf::from(&f.local_file),
                dest_file: f.dest_file.clone(),
            })
            .collect(),
        OutputSpec {
            dest_path: PathBuf::from(&request.output_file.dest_path),
            format: request.output_file.format,
            callback_url: request.output_file.callback_url.clone(),
        },
        request.timeout,
        request
            .max_output_file_size
            .unwrap_or(state.config.jobs.max_output_bytes),
    );
    job.notify_url = request.notify_url.clone();
    job.access_key = Some(key.to_string());
    job
}

fn job_name(request: &JobRequest) -> String {
    request
        .name
        .clone()
        .unwrap_or_else(|| format!("job-{}", request.image))
}

async fn validate(state: &AppState, key: &str, request: &JobRequest) -> Result<Job, String> {
    let limits = &state.config.jobs;

    if request.timeout == 0 {
        return Err("timeout must be positive".to_string());
    }
    if request.timeout > limits.max_timeout_secs {
        return Err(format!(
            "timeout {}s exceeds the configured ceiling of {}s",
            request.timeout, limits.max_timeout_secs
        ));
    }

    if request.input_files.is_empty() {
        return Err("input file list is empty".to_string());
    }
    if !request
        .input_files
        .iter()
        .any(|f| f.dest_file == "Makefile")
    {
        return Err("input files must include a Makefile".to_string());
    }
    for file in &request.input_files {
        if file.dest_file.starts_with('/') || file.dest_file.split('/').any(|c| c == "..") {
            return Err(format!("invalid destination name {:?}", file.dest_file));
        }
    }

    if request.output_file.dest_path.is_empty() {
        return Err("output destination is missing".to_string());
    }
    let output_dest = FileStore::sanitize(&request.output_file.dest_path)
        .map_err(|e| e.to_string())?
        .to_string();

    let images = state
        .driver
        .get_images()
        .await
        .map_err(|e| format!("cannot enumerate images: {:#}", e))?;
    if !images.iter().any(|i| i == &request.image) {
        return Err(format!("unknown image {:?}", request.image));
    }

    // Resolve the inputs against the requester's upload directory, digesting
    // each for the dedupe fingerprint.
    let mut inputs = Vec::with_capacity(request.input_files.len());
    let mut input_digests = Vec::with_capacity(request.input_files.len());
    for file in &request.input_files {
        let local = state
            .store
            .resolve(key, &file.local_file)
            .map_err(|e| e.to_string())?;
        let data = tokio::fs::read(&local)
            .await
            .map_err(|_| format!("input file {:?} has not been uploaded", file.local_file))?;
        input_digests.push((file.dest_file.clone(), compute_digest(&data)));
        inputs.push(InputFile {
            local_file: local,
            dest_file: file.dest_file.clone(),
        });
    }

    let dest_path = state
        .config
        .server
        .output_dir
        .join(FileStore::sanitize(key).map_err(|e| e.to_string())?)
        .join(&output_dest);

    let fingerprint = job_fingerprint(
        &request.image,
        &input_digests,
        &dest_path,
        limits
            .dedupe_include_access_key
            .then_some(key),
    );

    let max_output_bytes = request
        .max_output_file_size
        .unwrap_or(limits.max_output_bytes)
        .min(limits.max_output_bytes);

    let mut job = Job::new(
        job_name(request),
        &request.image,
        inputs,
        OutputSpec {
            dest_path,
            format: request.output_file.format,
            callback_url: request.output_file.callback_url.clone(),
        },
        request.timeout,
        max_output_bytes,
    );
    job.notify_url = request.notify_url.clone();
    job.access_key = Some(key.to_string());
    job.fingerprint = Some(fingerprint);
    Ok(job)
}
