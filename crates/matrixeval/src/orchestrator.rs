use std::collections::{HashMap, VecDeque};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use futures::future::join_all;
use log::{error, info, warn};
use tokio::sync::Mutex;

use crate::config::OrchestratorConfig;
use crate::error::SubmitError;
use crate::evaluator::{CompareOptions, MetricScores, QualityEvaluator};
use crate::executor::EncodeExecutor;
use crate::lock::{ExecutionLock, SystemClock};
use crate::matrix::generate_jobs;
use crate::notify::NotificationSink;
use crate::report::build_csv;
use crate::scoring::{self, Weights};
use crate::store::TaskStore;
use crate::task::{EvalSummary, JobResult, Task, TaskConfig, TaskStatus};

/// Target real-time factor against which encode speed is normalized
const TARGET_RTF: f64 = 1.0;

/// Receipt returned to the submitter
#[derive(Debug, Clone)]
pub struct SubmitReceipt {
    pub task_id: String,
    pub queue_position: usize,
}

/// Immutable snapshot of the queue for status polling
#[derive(Debug, Clone)]
pub struct QueueState {
    pub pending: Vec<String>,
    pub running: Option<String>,
}

/// Lock holder state together with the current queue depth, the full
/// picture an interactive caller checks before starting its own run
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PipelineStatus {
    pub foreground_active: bool,
    pub background_active: bool,
    pub queued: usize,
}

#[derive(Default)]
struct Inner {
    tasks: HashMap<String, Task>,
    queue: VecDeque<String>,
    running: Option<String>,
}

/// Owner of the task queue and the encode/evaluate pipeline.
///
/// All collaborators are injected as trait objects; the orchestrator never
/// talks to ffmpeg, HTTP backends or webhooks directly. Exactly one pipeline
/// executes at a time, gated by the shared [`ExecutionLock`].
pub struct Orchestrator {
    config: OrchestratorConfig,
    lock: Arc<ExecutionLock>,
    store: TaskStore,
    executor: Arc<dyn EncodeExecutor>,
    evaluator: Arc<dyn QualityEvaluator>,
    notifier: Arc<dyn NotificationSink>,
    inner: Mutex<Inner>,
    draining: AtomicBool,
}

impl Orchestrator {
    /// Build an orchestrator, rehydrating task history from the store.
    ///
    /// Tasks that were pending or running when the previous process died are
    /// marked failed; their pipeline state is unrecoverable.
    pub fn new(
        config: OrchestratorConfig,
        executor: Arc<dyn EncodeExecutor>,
        evaluator: Arc<dyn QualityEvaluator>,
        notifier: Arc<dyn NotificationSink>,
    ) -> anyhow::Result<Arc<Self>> {
        let store = TaskStore::new(config.state_file.clone(), config.task_retention);
        let mut tasks = HashMap::new();
        for mut task in store.load()? {
            if !task.status.is_terminal() {
                warn!("task {} was interrupted by a restart, marking failed", task.id);
                task.status = TaskStatus::Failed;
                task.error = Some("interrupted by service restart".to_string());
            }
            tasks.insert(task.id.clone(), task);
        }

        let lock = Arc::new(ExecutionLock::new(config.lock_timeout_secs, Box::new(SystemClock)));
        Ok(Arc::new(Self {
            config,
            lock,
            store,
            executor,
            evaluator,
            notifier,
            inner: Mutex::new(Inner { tasks, ..Inner::default() }),
            draining: AtomicBool::new(false),
        }))
    }

    /// The shared pipeline gate, exposed for interactive (foreground) callers
    pub fn lock(&self) -> &ExecutionLock {
        &self.lock
    }

    /// Validate and enqueue a matrix task, then wake the drain loop.
    ///
    /// Rejected submissions are never persisted. The returned queue position
    /// is fixed at submission time and does not shrink as the queue drains.
    pub async fn submit(
        self: &Arc<Self>,
        source: PathBuf,
        config: TaskConfig,
    ) -> Result<SubmitReceipt, SubmitError> {
        if source.as_os_str().is_empty() || !source.exists() {
            return Err(SubmitError::MissingSourceAsset);
        }
        if config.encode_target.trim().is_empty() {
            return Err(SubmitError::MissingEncodeTarget);
        }

        let receipt = {
            let mut inner = self.inner.lock().await;
            let position = inner.queue.len() + usize::from(inner.running.is_some());
            let mut task = Task::new(config, position);
            task.source_path = Some(source);
            let receipt = SubmitReceipt { task_id: task.id.clone(), queue_position: position };
            info!("task {} submitted at queue position {position}", task.id);
            inner.queue.push_back(task.id.clone());
            inner.tasks.insert(task.id.clone(), task);
            self.persist(&inner);
            receipt
        };
        self.spawn_drain();
        Ok(receipt)
    }

    /// Start the background drain loop if it is not already running.
    /// Redundant wake-ups are a no-op.
    pub fn spawn_drain(self: &Arc<Self>) {
        if self.draining.swap(true, Ordering::SeqCst) {
            return;
        }
        let this = Arc::clone(self);
        tokio::spawn(async move {
            loop {
                this.drain().await;
                this.draining.store(false, Ordering::SeqCst);
                // A submission may have landed between the last pop and the
                // flag reset; reclaim the drainer role if work remains
                let more = !this.inner.lock().await.queue.is_empty();
                if !more || this.draining.swap(true, Ordering::SeqCst) {
                    break;
                }
            }
        });
    }

    /// Pop and execute queued tasks FIFO until the queue is empty
    async fn drain(self: &Arc<Self>) {
        loop {
            self.wait_for_foreground_idle().await;

            let task_id = {
                let mut inner = self.inner.lock().await;
                match inner.queue.pop_front() {
                    Some(id) => id,
                    None => return,
                }
            };

            self.lock.set_background_active(true);
            // A foreground acquire may have slipped in before the claim took
            // effect; if so, put the task back and wait again
            if !self.lock.foreground_idle() {
                self.lock.set_background_active(false);
                self.inner.lock().await.queue.push_front(task_id);
                continue;
            }

            self.mark_running(&task_id).await;
            self.run_pipeline(&task_id).await;
            self.lock.set_background_active(false);
            self.inner.lock().await.running = None;
        }
    }

    async fn wait_for_foreground_idle(&self) {
        loop {
            // Register for the release signal before re-checking the holder,
            // so a release landing in between is not lost
            let released = self.lock.released_notified();
            tokio::pin!(released);
            released.as_mut().enable();
            if self.lock.foreground_idle() {
                return;
            }
            info!("pipeline held by foreground caller, drain loop waiting");
            tokio::select! {
                _ = &mut released => {}
                // A holder that never releases only goes away by expiry, so
                // re-check periodically as well
                _ = tokio::time::sleep(Duration::from_secs(30)) => {}
            }
        }
    }

    async fn mark_running(&self, task_id: &str) {
        let mut inner = self.inner.lock().await;
        if let Some(task) = inner.tasks.get_mut(task_id) {
            if !task.status.is_terminal() {
                task.status = TaskStatus::Running;
            }
        }
        inner.running = Some(task_id.to_string());
        self.persist(&inner);
    }

    /// Execute the full encode/evaluate pipeline for one task.
    /// Errors never escape; they become the task's failure state.
    async fn run_pipeline(&self, task_id: &str) {
        let snapshot = {
            let inner = self.inner.lock().await;
            inner.tasks.get(task_id).map(|t| (t.config.clone(), t.source_path.clone()))
        };
        let Some((config, source)) = snapshot else {
            error!("task {task_id} vanished before pipeline start");
            return;
        };
        let Some(source) = source else {
            self.fail_task(task_id, "task has no source asset", &config).await;
            return;
        };

        match self.execute(task_id, &config, &source).await {
            Ok(()) => info!("task {task_id} pipeline finished"),
            Err(e) => {
                error!("task {task_id} pipeline failed: {e:#}");
                self.fail_task(task_id, &format!("{e:#}"), &config).await;
            }
        }
    }

    async fn execute(&self, task_id: &str, config: &TaskConfig, source: &Path) -> anyhow::Result<()> {
        // Stage 1: upload. The only stage whose failure aborts the task;
        // without the source on the backend no job can run.
        let source_ref = self.executor.upload(&config.encode_target, source).await?;

        // Stage 2: matrix generation
        let run_stamp = Utc::now().timestamp_millis();
        let jobs = generate_jobs(config, run_stamp);
        info!("task {task_id}: matrix expanded to {} job(s)", jobs.len());
        {
            let mut inner = self.inner.lock().await;
            if let Some(task) = inner.tasks.get_mut(task_id) {
                task.progress.total = jobs.len();
                task.results = jobs.clone();
            }
            self.persist(&inner);
        }

        // Stage 3: sequential encode, tolerating per-job failure
        for (index, job) in jobs.iter().enumerate() {
            if self.is_cancelled(task_id).await {
                info!("task {task_id} cancelled, stopping before job {index}");
                return Ok(());
            }
            match self
                .executor
                .run(&config.encode_target, &source_ref, &job.command, &job.output_filename)
                .await
            {
                Ok(output) => {
                    let saved = self.save_with_retry(&output, &job.output_filename).await;
                    let mut inner = self.inner.lock().await;
                    if let Some(task) = inner.tasks.get_mut(task_id) {
                        // A job counts as exported only once its output
                        // actually landed in local storage
                        if saved.is_some() {
                            task.progress.exported += 1;
                        }
                        if let Some(result) = task.results.get_mut(index) {
                            result.download_url = Some(output.download_url.clone());
                            result.export_duration_ms = Some(output.elapsed_ms);
                            result.saved_path = saved;
                        }
                    }
                    self.persist(&inner);
                }
                Err(e) => {
                    warn!("task {task_id}: encode of {} failed, skipping: {e:#}", job.output_filename);
                }
            }
        }

        // Stage 4: evaluate in bounded concurrent batches
        let eval_targets: Vec<(usize, PathBuf)> = {
            let inner = self.inner.lock().await;
            inner
                .tasks
                .get(task_id)
                .map(|t| {
                    t.results
                        .iter()
                        .enumerate()
                        .filter_map(|(i, r)| r.saved_path.clone().map(|p| (i, p)))
                        .collect()
                })
                .unwrap_or_default()
        };
        let concurrency = if config.eval_concurrency > 0 {
            config.eval_concurrency
        } else {
            self.config.default_eval_concurrency.max(1)
        };
        let options = CompareOptions { skip_vmaf: config.skip_vmaf };

        for batch in eval_targets.chunks(concurrency) {
            if self.is_cancelled(task_id).await {
                info!("task {task_id} cancelled, stopping evaluation");
                return Ok(());
            }
            let futures = batch.iter().map(|(index, path)| {
                let evaluator = Arc::clone(&self.evaluator);
                let reference = source.to_path_buf();
                let candidate = path.clone();
                let index = *index;
                async move { (index, evaluator.compare(&reference, &candidate, options).await) }
            });
            let measured = join_all(futures).await;

            let mut inner = self.inner.lock().await;
            if let Some(task) = inner.tasks.get_mut(task_id) {
                for (index, metrics) in measured {
                    if let Some(result) = task.results.get_mut(index) {
                        if let Some(summary) = summarize(result, config, &metrics) {
                            result.eval = Some(summary);
                            task.progress.evaluated += 1;
                        } else {
                            warn!(
                                "task {task_id}: no usable metrics for {}, leaving unevaluated",
                                result.output_filename
                            );
                        }
                    }
                }
            }
            self.persist(&inner);
        }

        // Stage 5: CSV report
        let csv_url = self.write_report(task_id, run_stamp).await?;

        // Stage 6: best-effort completion notification
        self.notify_completion(task_id, config, csv_url.as_deref()).await;

        // Stage 7: completed, unless cancellation already sealed the status
        let mut inner = self.inner.lock().await;
        if let Some(task) = inner.tasks.get_mut(task_id) {
            if !task.status.is_terminal() {
                task.status = TaskStatus::Completed;
            }
        }
        self.persist(&inner);
        Ok(())
    }

    /// Best-effort save/download with bounded retries and a fixed backoff
    async fn save_with_retry(&self, output: &crate::executor::EncodeOutput, name: &str) -> Option<PathBuf> {
        for attempt in 1..=self.config.save_attempts.max(1) {
            match self.executor.save(output, name).await {
                Ok(path) => return Some(path),
                Err(e) => {
                    warn!("save attempt {attempt} for {name} failed: {e:#}");
                    tokio::time::sleep(Duration::from_millis(self.config.save_backoff_ms)).await;
                }
            }
        }
        None
    }

    async fn write_report(&self, task_id: &str, run_stamp: i64) -> anyhow::Result<Option<String>> {
        let csv = {
            let inner = self.inner.lock().await;
            match inner.tasks.get(task_id) {
                Some(task) => build_csv(task),
                None => return Ok(None),
            }
        };
        let name = format!("matrix_report_{run_stamp}.csv");
        std::fs::create_dir_all(&self.config.output_dir)?;
        std::fs::write(self.config.output_dir.join(&name), csv)?;
        let url = format!("{}/{name}", self.config.public_base_url.trim_end_matches('/'));

        let mut inner = self.inner.lock().await;
        if let Some(task) = inner.tasks.get_mut(task_id) {
            task.csv_url = Some(url.clone());
        }
        self.persist(&inner);
        Ok(Some(url))
    }

    async fn notify_completion(&self, task_id: &str, config: &TaskConfig, csv_url: Option<&str>) {
        let Some(webhook) = config.webhook_url.as_deref() else { return };
        let (progress, scores) = {
            let inner = self.inner.lock().await;
            match inner.tasks.get(task_id) {
                Some(task) => {
                    let scores: Vec<(f64, String)> = task
                        .results
                        .iter()
                        .filter_map(|r| r.eval.as_ref().map(|e| (e.final_score, r.output_filename.clone())))
                        .collect();
                    (task.progress.clone(), scores)
                }
                None => return,
            }
        };

        let mut lines = vec![
            format!("Task {task_id} finished"),
            format!(
                "Jobs: {} total, {} exported, {} evaluated",
                progress.total, progress.exported, progress.evaluated
            ),
        ];
        if !scores.is_empty() {
            let average = scores.iter().map(|(s, _)| s).sum::<f64>() / scores.len() as f64;
            lines.push(format!("Average score: {average:.4}"));
        }
        if let Some((score, name)) = scores
            .iter()
            .max_by(|a, b| a.0.total_cmp(&b.0))
        {
            lines.push(format!("Best combination: {name} (score {score:.4})"));
        }
        if let Err(e) = self
            .notifier
            .push(webhook, "Matrix evaluation completed", &lines, csv_url)
            .await
        {
            warn!("completion notification failed: {e:#}");
        }
    }

    /// Mark a task failed and fire the best-effort failure notification
    async fn fail_task(&self, task_id: &str, reason: &str, config: &TaskConfig) {
        {
            let mut inner = self.inner.lock().await;
            if let Some(task) = inner.tasks.get_mut(task_id) {
                if !task.status.is_terminal() {
                    task.status = TaskStatus::Failed;
                    task.error = Some(reason.to_string());
                }
            }
            self.persist(&inner);
        }
        if let Some(webhook) = config.webhook_url.as_deref() {
            let lines = vec![format!("Task {task_id} failed"), reason.to_string()];
            if let Err(e) = self
                .notifier
                .push(webhook, "Matrix evaluation failed", &lines, None)
                .await
            {
                warn!("failure notification failed: {e:#}");
            }
        }
    }

    async fn is_cancelled(&self, task_id: &str) -> bool {
        let inner = self.inner.lock().await;
        inner
            .tasks
            .get(task_id)
            .map(|t| t.status == TaskStatus::Cancelled)
            .unwrap_or(false)
    }

    /// Cancel one task. A pending task leaves the queue immediately; a
    /// running task is flagged and the pipeline stops at its next job
    /// boundary, never preempting the in-flight encode.
    pub async fn cancel(&self, task_id: &str) -> anyhow::Result<()> {
        let mut inner = self.inner.lock().await;
        let status = match inner.tasks.get(task_id) {
            Some(task) => task.status,
            None => anyhow::bail!("no task with id {task_id}"),
        };
        if status.is_terminal() {
            anyhow::bail!("task {task_id} already finished as {status:?}");
        }
        inner.queue.retain(|id| id != task_id);
        if let Some(task) = inner.tasks.get_mut(task_id) {
            task.status = TaskStatus::Cancelled;
        }
        info!("task {task_id} cancelled");
        self.persist(&inner);
        Ok(())
    }

    /// Cancel every pending and running task; returns how many were affected
    pub async fn cancel_all(&self) -> usize {
        let mut inner = self.inner.lock().await;
        inner.queue.clear();
        let mut cancelled = 0;
        for task in inner.tasks.values_mut() {
            if !task.status.is_terminal() {
                task.status = TaskStatus::Cancelled;
                cancelled += 1;
            }
        }
        info!("cancelled {cancelled} task(s)");
        self.persist(&inner);
        cancelled
    }

    /// Record a completed interactive (foreground) run into the history, so
    /// polling shows both entry points side by side
    pub async fn record_foreground(
        &self,
        config: TaskConfig,
        results: Vec<JobResult>,
        csv_url: Option<String>,
    ) -> String {
        let mut task = Task::new(config, 0);
        task.task_type = "frontend".to_string();
        task.status = TaskStatus::Completed;
        task.progress.total = results.len();
        task.progress.exported = results.iter().filter(|r| r.saved_path.is_some()).count();
        task.progress.evaluated = results.iter().filter(|r| r.eval.is_some()).count();
        task.results = results;
        task.csv_url = csv_url;
        let id = task.id.clone();

        let mut inner = self.inner.lock().await;
        inner.tasks.insert(id.clone(), task);
        self.persist(&inner);
        id
    }

    /// Snapshot of one task
    pub async fn task(&self, task_id: &str) -> Option<Task> {
        self.inner.lock().await.tasks.get(task_id).cloned()
    }

    /// All known tasks, newest first
    pub async fn tasks(&self) -> Vec<Task> {
        let inner = self.inner.lock().await;
        let mut tasks: Vec<Task> = inner.tasks.values().cloned().collect();
        tasks.sort_by(|a, b| b.created_at.cmp(&a.created_at));
        tasks
    }

    /// Combined lock and queue snapshot; never mutates either
    pub async fn pipeline_status(&self) -> PipelineStatus {
        let status = self.lock.check();
        let inner = self.inner.lock().await;
        PipelineStatus {
            foreground_active: status.foreground_active,
            background_active: status.background_active,
            queued: inner.queue.len() + usize::from(inner.running.is_some()),
        }
    }

    /// Snapshot of the queue
    pub async fn queue_state(&self) -> QueueState {
        let inner = self.inner.lock().await;
        QueueState {
            pending: inner.queue.iter().cloned().collect(),
            running: inner.running.clone(),
        }
    }

    /// Persist the current task map; persistence failure never fails the
    /// caller's operation
    fn persist(&self, inner: &Inner) {
        let tasks: Vec<Task> = inner.tasks.values().cloned().collect();
        if let Err(e) = self.store.save(&tasks) {
            error!("task persistence failed: {e:#}");
        }
    }
}

/// Bitrate strings accept ffmpeg-style k/M suffixes ("4000k", "8M") or raw bps
fn parse_rate_bps(raw: &str) -> Option<f64> {
    let s = raw.trim().to_lowercase();
    if s.is_empty() {
        return None;
    }
    let (digits, multiplier) = if let Some(p) = s.strip_suffix('m') {
        (p, 1_000_000.0)
    } else if let Some(p) = s.strip_suffix('k') {
        (p, 1_000.0)
    } else {
        (s.as_str(), 1.0)
    };
    digits.parse::<f64>().ok().map(|v| v * multiplier).filter(|v| *v > 0.0)
}

/// Fold measured metrics into an evaluation summary.
///
/// Returns None when no quality metric came back at all. Sub-scores whose
/// inputs are unavailable drop out of the composite with the remaining
/// weights renormalized.
fn summarize(job: &JobResult, config: &TaskConfig, metrics: &MetricScores) -> Option<EvalSummary> {
    if metrics.vmaf.is_none() && metrics.psnr.is_none() && metrics.ssim.is_none() {
        return None;
    }
    let weights = Weights::MATRIX;
    let quality = scoring::quality_score(metrics.vmaf, metrics.psnr);

    let bitrate = match (parse_rate_bps(&job.bitrate), metrics.bitrate_bps) {
        (Some(base), Some(actual)) => Some(scoring::bitrate_score(base, actual)),
        _ => None,
    };
    let duration = config.input_duration.or(metrics.duration_secs);
    let speed = match (duration, job.export_duration_ms) {
        (Some(d), Some(ms)) if ms > 0 => Some(scoring::speed_score(d, ms as f64 / 1000.0, TARGET_RTF)),
        _ => None,
    };

    let (mut numerator, mut denominator) = (weights.quality * quality, weights.quality);
    if let Some(s) = speed {
        numerator += weights.speed * s;
        denominator += weights.speed;
    }
    if let Some(b) = bitrate {
        numerator += weights.bitrate * b;
        denominator += weights.bitrate;
    }
    let final_score = ((numerator / denominator) * 10000.0).round() / 10000.0;

    Some(EvalSummary {
        vmaf: metrics.vmaf,
        psnr: metrics.psnr,
        ssim: metrics.ssim,
        bitrate_after_kbps: metrics.bitrate_bps.map(|b| (b / 1000.0).round() as u64),
        final_score,
    })
}
