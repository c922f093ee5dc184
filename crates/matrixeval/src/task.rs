use std::path::PathBuf;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Lifecycle status of a matrix evaluation task
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TaskStatus {
    Pending,
    Running,
    Completed,
    Failed,
    Cancelled,
}

impl TaskStatus {
    /// Terminal statuses admit no further mutation
    pub fn is_terminal(&self) -> bool {
        matches!(self, TaskStatus::Completed | TaskStatus::Failed | TaskStatus::Cancelled)
    }
}

/// Encoder family selected for a task
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EncoderFamily {
    X264,
    X265,
    /// Hardware-accelerated NVENC family; the only family that emits
    /// tune/multipass/lookahead/minrate flags and the CUDA hwaccel prefix
    Nvenc,
}

/// Codec variant for the NVENC family
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum NvencCodec {
    H264,
    Hevc,
}

/// Per-stage counters; exported never exceeds total, evaluated never exceeds exported
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TaskProgress {
    pub total: usize,
    pub exported: usize,
    pub evaluated: usize,
}

/// Submission configuration for one matrix evaluation task.
///
/// Parameter lists are comma-delimited strings; an empty list means the axis
/// is omitted and contributes exactly one combination to the matrix.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct TaskConfig {
    /// Encode backend address ("host:port", or "local" for in-process ffmpeg)
    pub encode_target: String,
    pub encoder: Option<EncoderFamily>,
    pub nvenc_codec: Option<NvencCodec>,
    pub presets: String,
    pub bitrates: String,
    pub maxrates: String,
    pub bufsizes: String,
    /// Rate-control mode ("vbr", "cbr", "constqp", ...)
    pub rc_mode: String,
    pub cq_values: String,
    pub qp_values: String,
    pub lookaheads: String,
    pub minrate: String,
    pub temporal_aq: bool,
    pub spatial_aq: bool,
    pub profile: String,
    pub tune: String,
    pub multipass: String,
    /// Batch size for the concurrent evaluate phase; 0 means use the default
    pub eval_concurrency: usize,
    /// Optional webhook target for the best-effort completion notification
    pub webhook_url: Option<String>,
    /// Source duration in seconds, used as a speed-score fallback
    pub input_duration: Option<f64>,
    /// Skip the expensive VMAF metric and evaluate with PSNR/SSIM only
    pub skip_vmaf: bool,
}

impl Default for TaskConfig {
    fn default() -> Self {
        Self {
            encode_target: String::new(),
            encoder: None,
            nvenc_codec: None,
            presets: String::new(),
            bitrates: String::new(),
            maxrates: String::new(),
            bufsizes: String::new(),
            rc_mode: String::new(),
            cq_values: String::new(),
            qp_values: String::new(),
            lookaheads: String::new(),
            minrate: String::new(),
            temporal_aq: false,
            spatial_aq: false,
            profile: String::new(),
            tune: String::new(),
            multipass: String::new(),
            eval_concurrency: 0,
            webhook_url: None,
            input_duration: None,
            skip_vmaf: false,
        }
    }
}

/// Quality summary for one evaluated job; absent metrics signal partial failure
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EvalSummary {
    pub vmaf: Option<f64>,
    pub psnr: Option<f64>,
    pub ssim: Option<f64>,
    pub bitrate_after_kbps: Option<u64>,
    pub final_score: f64,
}

/// One encode-then-evaluate unit for a single parameter combination
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct JobResult {
    pub id: String,
    pub preset: String,
    pub bitrate: String,
    pub maxrate: String,
    pub bufsize: String,
    pub cq: String,
    pub qp: String,
    pub lookahead: String,
    pub temporal_aq: bool,
    pub spatial_aq: bool,
    /// Profile after encoder-specific remapping
    pub profile: String,
    pub tune: String,
    pub multipass: String,
    pub minrate: String,
    /// Command template with {input}/{output} placeholders
    pub command: String,
    /// Unique within the task even for otherwise-identical parameter values
    pub output_filename: String,
    pub download_url: Option<String>,
    pub saved_path: Option<PathBuf>,
    pub export_duration_ms: Option<u64>,
    /// Set only when `saved_path` is set and evaluation succeeded
    pub eval: Option<EvalSummary>,
}

/// One submitted matrix-evaluation request comprising many jobs
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Task {
    pub id: String,
    pub status: TaskStatus,
    pub created_at: DateTime<Utc>,
    pub config: TaskConfig,
    /// Local path of the source asset this task encodes from
    #[serde(default)]
    pub source_path: Option<PathBuf>,
    pub progress: TaskProgress,
    pub results: Vec<JobResult>,
    pub csv_url: Option<String>,
    pub error: Option<String>,
    pub queue_position: usize,
    /// "backend" for queued tasks, "frontend" for recorded interactive runs
    #[serde(default = "default_task_type")]
    pub task_type: String,
}

fn default_task_type() -> String {
    "backend".to_string()
}

impl Task {
    /// Create a new pending task with a fresh globally unique id
    pub fn new(config: TaskConfig, queue_position: usize) -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            status: TaskStatus::Pending,
            created_at: Utc::now(),
            config,
            source_path: None,
            progress: TaskProgress::default(),
            results: Vec::new(),
            csv_url: None,
            error: None,
            queue_position,
            task_type: default_task_type(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn terminal_statuses() {
        assert!(!TaskStatus::Pending.is_terminal());
        assert!(!TaskStatus::Running.is_terminal());
        assert!(TaskStatus::Completed.is_terminal());
        assert!(TaskStatus::Failed.is_terminal());
        assert!(TaskStatus::Cancelled.is_terminal());
    }

    #[test]
    fn task_snapshot_round_trips_through_json() {
        let task = Task::new(
            TaskConfig {
                encode_target: "10.0.0.5:5000".to_string(),
                encoder: Some(EncoderFamily::Nvenc),
                nvenc_codec: Some(NvencCodec::Hevc),
                presets: "p6,p7".to_string(),
                ..Default::default()
            },
            3,
        );
        let json = serde_json::to_string(&task).unwrap();
        assert!(json.contains("\"createdAt\""));
        assert!(json.contains("\"queuePosition\":3"));
        assert!(json.contains("\"status\":\"pending\""));

        let back: Task = serde_json::from_str(&json).unwrap();
        assert_eq!(back.id, task.id);
        assert_eq!(back.config.encoder, Some(EncoderFamily::Nvenc));
        assert_eq!(back.queue_position, 3);
    }
}
