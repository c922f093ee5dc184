use std::path::{Path, PathBuf};
use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};

/// Configuration for the matrix evaluation orchestrator
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OrchestratorConfig {
    /// File where the durable task list is persisted
    pub state_file: PathBuf,
    /// Directory where encoded outputs and CSV reports are written
    pub output_dir: PathBuf,
    /// Base URL under which files in `output_dir` are reachable (e.g. "http://10.0.0.5:3000/files")
    pub public_base_url: String,
    /// Seconds before an unreleased foreground lock expires (e.g. 30 minutes)
    pub lock_timeout_secs: u64,
    /// Number of most-recently-created tasks retained by the store
    pub task_retention: usize,
    /// Default evaluation concurrency when a task does not specify one
    pub default_eval_concurrency: usize,
    /// Attempts for the best-effort save/download of an encoded output
    pub save_attempts: u32,
    /// Delay between save/download attempts, in milliseconds
    pub save_backoff_ms: u64,
    /// Path to the ffmpeg binary used for local encodes and quality metrics
    pub ffmpeg_bin: PathBuf,
    /// Path to the ffprobe binary
    pub ffprobe_bin: PathBuf,
}

impl Default for OrchestratorConfig {
    fn default() -> Self {
        Self::default_config()
    }
}

impl OrchestratorConfig {
    /// Create a default configuration with sensible values
    pub fn default_config() -> Self {
        Self {
            state_file: PathBuf::from("/var/lib/matrixeval/matrix_tasks.json"),
            output_dir: PathBuf::from("/var/lib/matrixeval/files"),
            public_base_url: "http://localhost:3000/files".to_string(),
            lock_timeout_secs: 30 * 60,
            task_retention: 100,
            default_eval_concurrency: 2,
            save_attempts: 3,
            save_backoff_ms: 500,
            ffmpeg_bin: PathBuf::from("ffmpeg"),
            ffprobe_bin: PathBuf::from("ffprobe"),
        }
    }

    /// Load configuration from a file, or return defaults if path is None or file doesn't exist
    pub fn load_config(path: Option<&Path>) -> Result<Self> {
        let mut config = Self::default_config();

        if let Some(config_path) = path {
            if config_path.exists() {
                let content = std::fs::read_to_string(config_path)
                    .with_context(|| format!("Failed to read config file: {}", config_path.display()))?;

                // Try JSON first, then TOML
                if config_path.extension().and_then(|s| s.to_str()) == Some("toml") {
                    let file_config: OrchestratorConfig = toml::from_str(&content)
                        .with_context(|| format!("Failed to parse TOML config: {}", config_path.display()))?;
                    config = file_config;
                } else {
                    let file_config: OrchestratorConfig = serde_json::from_str(&content)
                        .with_context(|| format!("Failed to parse JSON config: {}", config_path.display()))?;
                    config = file_config;
                }
            }
        }

        Ok(config)
    }
}
