use anyhow::{Context, Result};
use serde_json::{json, Value};

use crate::cli::Commands;

pub struct Client {
    http: reqwest::Client,
    server: String,
    key: String,
}

impl Client {
    pub fn new(server: String, key: String) -> Self {
        Self {
            http: reqwest::Client::new(),
            server,
            key,
        }
    }

    fn url(&self, path: &str) -> String {
        format!("{}/{}/{}", self.server.trim_end_matches('/'), path, self.key)
    }

    async fn json_of(&self, response: reqwest::Response) -> Result<Value> {
        let status = response.status();
        let body: Value = response
            .json()
            .await
            .context("Server returned a non-JSON response")?;
        if !status.is_success() {
            anyhow::bail!(
                "server said {}: {}",
                status,
                body.get("error").and_then(Value::as_str).unwrap_or("?")
            );
        }
        Ok(body)
    }
}

pub async fn execute_command(cmd: Commands, client: Client) -> Result<()> {
    match cmd {
        Commands::Open => {
            let response = client.http.get(client.url("open")).send().await?;
            let body = client.json_of(response).await?;
            println!("{}", serde_json::to_string_pretty(&body)?);
        }

        Commands::Upload { file, name } => {
            let bytes = tokio::fs::read(&file)
                .await
                .with_context(|| format!("Failed to read {}", file.display()))?;
            let name = match name {
                Some(name) => name,
                None => file
                    .file_name()
                    .map(|n| n.to_string_lossy().to_string())
                    .context("file has no name; pass --name")?,
            };

            let url = format!("{}/{}", client.url("upload"), name);
            let response = client.http.post(url).body(bytes).send().await?;
            let body = client.json_of(response).await?;
            println!(
                "Uploaded {} ({})",
                name,
                body.get("digest").and_then(Value::as_str).unwrap_or("?")
            );
        }

        Commands::Addjob {
            image,
            files,
            output,
            timeout,
            name,
            notify_url,
        } => {
            let input_files: Vec<Value> = files
                .iter()
                .map(|spec| {
                    let (local, dest) = match spec.split_once(':') {
                        Some((local, dest)) => (local, dest),
                        None => (spec.as_str(), spec.as_str()),
                    };
                    json!({ "local_file": local, "dest_file": dest })
                })
                .collect();

            let name = name.unwrap_or_else(|| format!("job-{}", uuid::Uuid::new_v4().simple()));

            let request = json!({
                "name": name,
                "image": image,
                "input_files": input_files,
                "output_file": { "dest_path": output, "format": "raw" },
                "timeout": timeout,
                "notify_url": notify_url,
            });

            let response = client
                .http
                .post(client.url("jobs"))
                .json(&request)
                .send()
                .await?;
            let body = client.json_of(response).await?;
            println!(
                "Job {} submitted as id {}",
                name,
                body.get("id").and_then(Value::as_u64).unwrap_or(0)
            );
        }

        Commands::Poll { dest } => {
            let url = format!("{}/{}", client.url("poll"), dest);
            let response = client.http.get(url).send().await?;
            let body = client.json_of(response).await?;

            match body.get("status").and_then(Value::as_str) {
                Some("ready") => {
                    if let Some(output) = body.get("output").and_then(Value::as_str) {
                        print!("{}", output);
                    }
                }
                _ => {
                    println!("Job is still running:");
                    if let Some(trace) = body.get("trace").and_then(Value::as_array) {
                        for entry in trace {
                            println!("  {}", entry.as_str().unwrap_or("?"));
                        }
                    }
                }
            }
        }

        Commands::Info => {
            let response = client.http.get(client.url("info")).send().await?;
            let body = client.json_of(response).await?;
            println!("{}", serde_json::to_string_pretty(&body)?);
        }

        Commands::Jobs { dead } => {
            let state = if dead { "dead" } else { "live" };
            let url = format!("{}?state={}", client.url("jobs"), state);
            let response = client.http.get(url).send().await?;
            let body = client.json_of(response).await?;

            let Some(jobs) = body.as_array() else {
                anyhow::bail!("unexpected job listing: {}", body);
            };
            if jobs.is_empty() {
                println!("No {} jobs", state);
            }
            for job in jobs {
                println!(
                    "{:>6}  {:<24} {:<12} {}",
                    job.get("id").and_then(Value::as_u64).unwrap_or(0),
                    job.get("name").and_then(Value::as_str).unwrap_or("?"),
                    job.get("image").and_then(Value::as_str).unwrap_or("?"),
                    job.get("trace")
                        .and_then(Value::as_array)
                        .and_then(|t| t.last())
                        .and_then(Value::as_str)
                        .unwrap_or(""),
                );
            }
        }

        Commands::Pool { image } => {
            let url = match &image {
                Some(image) => format!("{}/{}", client.url("pool"), image),
                None => client.url("pool"),
            };
            let response = client.http.get(url).send().await?;
            let body = client.json_of(response).await?;
            println!("{}", serde_json::to_string_pretty(&body)?);
        }

        Commands::Prealloc { image, count } => {
            let url = format!("{}/{}/{}", client.url("prealloc"), image, count);
            let response = client.http.post(url).send().await?;
            client.json_of(response).await?;
            println!("Pool for {} resized to {}", image, count);
        }

        Commands::Cancel { id } => {
            let url = format!("{}/{}/cancel", client.url("jobs"), id);
            let response = client.http.post(url).send().await?;
            client.json_of(response).await?;
            println!("Cancel requested for job {}", id);
        }

        Commands::Deljob { id, dead } => {
            let url = format!(
                "{}/{}?dead={}",
                client.url("jobs"),
                id,
                if dead { 1 } else { 0 }
            );
            let response = client.http.delete(url).send().await?;
            client.json_of(response).await?;
            println!("Deleted job {}", id);
        }
    }

    Ok(())
}
