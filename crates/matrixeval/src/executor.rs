use std::path::{Path, PathBuf};
use std::time::Instant;
use anyhow::{bail, Context, Result};
use async_trait::async_trait;
use log::{debug, info};
use serde::Deserialize;

/// Opaque handle to a source asset uploaded to an encode backend
#[derive(Debug, Clone)]
pub struct SourceRef(pub String);

/// Result of one encode run
#[derive(Debug, Clone)]
pub struct EncodeOutput {
    /// Address the encoded output can be fetched from
    pub download_url: String,
    pub elapsed_ms: u64,
}

/// Port to the exclusive encode backend.
///
/// `command_template` carries exactly two substitutable placeholders,
/// `{input}` and `{output}`.
#[async_trait]
pub trait EncodeExecutor: Send + Sync {
    /// Upload the source asset once; the returned reference is reused by
    /// every job of the task
    async fn upload(&self, target: &str, source: &Path) -> Result<SourceRef>;

    /// Run one encode command against the uploaded source
    async fn run(
        &self,
        target: &str,
        source: &SourceRef,
        command_template: &str,
        output_name: &str,
    ) -> Result<EncodeOutput>;

    /// Fetch the encoded output into local storage
    async fn save(&self, output: &EncodeOutput, output_name: &str) -> Result<PathBuf>;
}

/// Client for a remote FFmpeg encode server speaking the
/// upload_file/process/download protocol
pub struct HttpEncodeExecutor {
    client: reqwest::Client,
    output_dir: PathBuf,
}

#[derive(Debug, Deserialize)]
struct UploadResponse {
    status: String,
    job_id: Option<String>,
    #[serde(default)]
    message: Option<String>,
}

#[derive(Debug, Deserialize)]
struct ProcessResponse {
    status: String,
    download_path: Option<String>,
    duration_ms: Option<u64>,
    #[serde(default)]
    message: Option<String>,
}

impl HttpEncodeExecutor {
    pub fn new(output_dir: PathBuf) -> Self {
        Self { client: reqwest::Client::new(), output_dir }
    }
}

#[async_trait]
impl EncodeExecutor for HttpEncodeExecutor {
    async fn upload(&self, target: &str, source: &Path) -> Result<SourceRef> {
        let bytes = tokio::fs::read(source)
            .await
            .with_context(|| format!("Failed to read source asset: {}", source.display()))?;
        let filename = source
            .file_name()
            .and_then(|n| n.to_str())
            .unwrap_or("input.mp4")
            .to_string();

        let form = reqwest::multipart::Form::new()
            .part("file", reqwest::multipart::Part::bytes(bytes).file_name(filename));
        let url = format!("http://{target}/upload_file");
        debug!("uploading source asset to {url}");

        let resp: UploadResponse = self
            .client
            .post(&url)
            .multipart(form)
            .send()
            .await
            .with_context(|| format!("Upload request to {url} failed"))?
            .json()
            .await
            .context("Upload response was not valid JSON")?;

        if resp.status != "success" {
            bail!("encode backend rejected upload: {}", resp.message.unwrap_or_default());
        }
        let job_id = resp.job_id.context("Upload response carried no job_id")?;
        info!("source asset uploaded, backend ref {job_id}");
        Ok(SourceRef(job_id))
    }

    async fn run(
        &self,
        target: &str,
        source: &SourceRef,
        command_template: &str,
        output_name: &str,
    ) -> Result<EncodeOutput> {
        let form = reqwest::multipart::Form::new()
            .text("job_id", source.0.clone())
            .text("command", command_template.to_string())
            .text("output_filename", output_name.to_string());
        let url = format!("http://{target}/process");

        let resp: ProcessResponse = self
            .client
            .post(&url)
            .multipart(form)
            .send()
            .await
            .with_context(|| format!("Encode request to {url} failed"))?
            .json()
            .await
            .context("Encode response was not valid JSON")?;

        if resp.status != "success" {
            bail!("encode backend reported failure: {}", resp.message.unwrap_or_default());
        }
        let download_path = resp.download_path.context("Encode response carried no download path")?;
        Ok(EncodeOutput {
            download_url: format!("http://{target}{download_path}"),
            elapsed_ms: resp.duration_ms.unwrap_or(0),
        })
    }

    async fn save(&self, output: &EncodeOutput, output_name: &str) -> Result<PathBuf> {
        let resp = self
            .client
            .get(&output.download_url)
            .send()
            .await
            .with_context(|| format!("Download from {} failed", output.download_url))?;
        if !resp.status().is_success() {
            bail!("download failed with status {}", resp.status());
        }
        let bytes = resp.bytes().await.context("Failed to read download body")?;

        tokio::fs::create_dir_all(&self.output_dir)
            .await
            .with_context(|| format!("Failed to create output dir: {}", self.output_dir.display()))?;
        let dest = self.output_dir.join(output_name);
        tokio::fs::write(&dest, &bytes)
            .await
            .with_context(|| format!("Failed to write encoded output: {}", dest.display()))?;
        debug!("saved encoded output to {}", dest.display());
        Ok(dest)
    }
}

/// In-process encode executor running ffmpeg through the shell; used when the
/// encode target is "local" instead of a remote backend address
pub struct LocalEncodeExecutor {
    output_dir: PathBuf,
    public_base_url: String,
}

impl LocalEncodeExecutor {
    pub fn new(output_dir: PathBuf, public_base_url: String) -> Self {
        Self { output_dir, public_base_url }
    }
}

#[async_trait]
impl EncodeExecutor for LocalEncodeExecutor {
    async fn upload(&self, _target: &str, source: &Path) -> Result<SourceRef> {
        // Local runs read the source in place; stage a timestamped copy so
        // the pipeline never mutates the caller's file
        tokio::fs::create_dir_all(&self.output_dir)
            .await
            .with_context(|| format!("Failed to create output dir: {}", self.output_dir.display()))?;
        let name = source
            .file_name()
            .and_then(|n| n.to_str())
            .unwrap_or("input.mp4");
        let staged = self
            .output_dir
            .join(format!("{}_{name}", chrono::Utc::now().timestamp_millis()));
        tokio::fs::copy(source, &staged)
            .await
            .with_context(|| format!("Failed to stage source asset: {}", source.display()))?;
        Ok(SourceRef(staged.display().to_string()))
    }

    async fn run(
        &self,
        _target: &str,
        source: &SourceRef,
        command_template: &str,
        output_name: &str,
    ) -> Result<EncodeOutput> {
        let out_path = self.output_dir.join(output_name);
        let command = command_template
            .replace("{input}", &format!("\"{}\"", source.0))
            .replace("{output}", &format!("\"{}\"", out_path.display()));
        debug!("local encode: {command}");

        let start = Instant::now();
        let output = tokio::process::Command::new("sh")
            .arg("-c")
            .arg(&command)
            .output()
            .await
            .context("Failed to spawn local ffmpeg")?;
        let elapsed_ms = start.elapsed().as_millis() as u64;

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            bail!(
                "local ffmpeg exited with {}: {}",
                output.status.code().unwrap_or(-1),
                stderr.lines().last().unwrap_or("")
            );
        }
        Ok(EncodeOutput {
            download_url: format!("{}/{output_name}", self.public_base_url.trim_end_matches('/')),
            elapsed_ms,
        })
    }

    async fn save(&self, _output: &EncodeOutput, output_name: &str) -> Result<PathBuf> {
        // The encode already wrote into the output directory
        let dest = self.output_dir.join(output_name);
        if !dest.exists() {
            bail!("encoded output missing: {}", dest.display());
        }
        Ok(dest)
    }
}
