use std::path::{Path, PathBuf};
use async_trait::async_trait;
use log::{debug, warn};
use serde::Deserialize;
use uuid::Uuid;

/// Options for one quality comparison
#[derive(Debug, Clone, Copy, Default)]
pub struct CompareOptions {
    /// Skip the expensive VMAF pass and rely on PSNR/SSIM only
    pub skip_vmaf: bool,
}

/// Metric values for one (reference, candidate) pair.
///
/// Every field is optional: an absent metric signals partial failure of that
/// measurement, never of the comparison as a whole.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct MetricScores {
    pub vmaf: Option<f64>,
    pub psnr: Option<f64>,
    pub ssim: Option<f64>,
    /// Candidate stream bitrate in bits per second
    pub bitrate_bps: Option<f64>,
    /// Candidate duration in seconds
    pub duration_secs: Option<f64>,
}

/// Port to the quality-metric backend; infallible by contract
#[async_trait]
pub trait QualityEvaluator: Send + Sync {
    async fn compare(&self, reference: &Path, candidate: &Path, options: CompareOptions) -> MetricScores;
}

/// Quality evaluator driving ffmpeg filter graphs (psnr/ssim/libvmaf) and
/// ffprobe for candidate stream properties
pub struct FfmpegQualityEvaluator {
    ffmpeg_bin: PathBuf,
    ffprobe_bin: PathBuf,
    /// Scratch directory for libvmaf JSON logs
    work_dir: PathBuf,
}

impl FfmpegQualityEvaluator {
    pub fn new(ffmpeg_bin: PathBuf, ffprobe_bin: PathBuf, work_dir: PathBuf) -> Self {
        Self { ffmpeg_bin, ffprobe_bin, work_dir }
    }

    /// Run one metric filter graph and return combined stdout+stderr;
    /// ffmpeg prints metric summaries on stderr
    async fn run_filter(&self, reference: &Path, candidate: &Path, lavfi: &str) -> Option<String> {
        let output = tokio::process::Command::new(&self.ffmpeg_bin)
            .arg("-hide_banner")
            .arg("-i")
            .arg(candidate)
            .arg("-i")
            .arg(reference)
            .arg("-lavfi")
            .arg(lavfi)
            .arg("-f")
            .arg("null")
            .arg("-")
            .output()
            .await
            .ok()?;
        let mut text = String::from_utf8_lossy(&output.stderr).to_string();
        text.push_str(&String::from_utf8_lossy(&output.stdout));
        Some(text)
    }

    async fn psnr(&self, reference: &Path, candidate: &Path) -> Option<f64> {
        let lavfi = "[0:v][1:v]scale2ref=flags=bicubic[dist][ref];[dist][ref]psnr";
        let text = self.run_filter(reference, candidate, lavfi).await?;
        parse_psnr_average(&text)
    }

    async fn ssim(&self, reference: &Path, candidate: &Path) -> Option<f64> {
        let lavfi = "[0:v][1:v]scale2ref=flags=bicubic[dist][ref];[dist][ref]ssim";
        let text = self.run_filter(reference, candidate, lavfi).await?;
        parse_ssim_all(&text)
    }

    async fn vmaf(&self, reference: &Path, candidate: &Path) -> Option<f64> {
        if std::fs::create_dir_all(&self.work_dir).is_err() {
            return None;
        }
        let log_path = self.work_dir.join(format!("vmaf_{}.json", Uuid::new_v4()));
        let lavfi = format!(
            "[0:v][1:v]scale2ref=flags=bicubic[dist][ref];\
             [dist]format=pix_fmts=yuv420p[distf];\
             [ref]format=pix_fmts=yuv420p[reff];\
             [distf][reff]libvmaf=log_fmt=json:log_path={}:n_threads=4",
            log_path.display()
        );
        let text = self.run_filter(reference, candidate, &lavfi).await?;

        let score = match std::fs::read_to_string(&log_path) {
            Ok(json) => parse_vmaf_log(&json),
            // No log file: fall back to the console summary line
            Err(_) => parse_vmaf_stderr(&text),
        };
        std::fs::remove_file(&log_path).ok();
        score
    }

    /// Probe candidate bitrate and duration; bitrate falls back from the
    /// video stream to the container, then to size*8/duration
    async fn probe(&self, candidate: &Path) -> (Option<f64>, Option<f64>) {
        let output = match tokio::process::Command::new(&self.ffprobe_bin)
            .args(["-v", "error", "-print_format", "json", "-show_format", "-show_streams"])
            .arg(candidate)
            .output()
            .await
        {
            Ok(o) => o,
            Err(e) => {
                warn!("ffprobe spawn failed for {}: {e}", candidate.display());
                return (None, None);
            }
        };
        let data: ProbeData = match serde_json::from_slice(&output.stdout) {
            Ok(d) => d,
            Err(e) => {
                debug!("ffprobe output unparseable for {}: {e}", candidate.display());
                return (None, None);
            }
        };

        let duration = data
            .format
            .as_ref()
            .and_then(|f| f.duration.as_deref())
            .and_then(|d| d.parse::<f64>().ok())
            .filter(|d| *d > 0.0);

        let stream_bitrate = data
            .streams
            .iter()
            .find(|s| s.codec_type.as_deref() == Some("video"))
            .and_then(|s| s.bit_rate.as_deref())
            .and_then(|b| b.parse::<f64>().ok());
        let format_bitrate = data
            .format
            .as_ref()
            .and_then(|f| f.bit_rate.as_deref())
            .and_then(|b| b.parse::<f64>().ok());
        let bitrate = stream_bitrate
            .or(format_bitrate)
            .filter(|b| *b > 0.0)
            .or_else(|| {
                let size = std::fs::metadata(candidate).ok()?.len() as f64;
                duration.map(|d| (size * 8.0) / d)
            });

        (bitrate, duration)
    }
}

#[async_trait]
impl QualityEvaluator for FfmpegQualityEvaluator {
    async fn compare(&self, reference: &Path, candidate: &Path, options: CompareOptions) -> MetricScores {
        // The metric passes are independent ffmpeg invocations; run them together
        let (psnr, ssim, vmaf) = if options.skip_vmaf {
            let (psnr, ssim) = tokio::join!(self.psnr(reference, candidate), self.ssim(reference, candidate));
            (psnr, ssim, None)
        } else {
            tokio::join!(
                self.psnr(reference, candidate),
                self.ssim(reference, candidate),
                self.vmaf(reference, candidate),
            )
        };
        let (bitrate_bps, duration_secs) = self.probe(candidate).await;

        debug!(
            "compared {} vs {}: vmaf={vmaf:?} psnr={psnr:?} ssim={ssim:?}",
            reference.display(),
            candidate.display()
        );
        MetricScores { vmaf, psnr, ssim, bitrate_bps, duration_secs }
    }
}

#[derive(Debug, Default, Deserialize)]
struct ProbeData {
    #[serde(default)]
    streams: Vec<ProbeStream>,
    format: Option<ProbeFormat>,
}

#[derive(Debug, Deserialize)]
struct ProbeStream {
    codec_type: Option<String>,
    bit_rate: Option<String>,
}

#[derive(Debug, Deserialize)]
struct ProbeFormat {
    duration: Option<String>,
    bit_rate: Option<String>,
}

/// Extract the trailing number after `marker` on a line, e.g. "average:41.23"
fn number_after(line: &str, marker: &str) -> Option<f64> {
    let lower = line.to_lowercase();
    let pos = lower.find(&marker.to_lowercase())?;
    let rest = line[pos + marker.len()..].trim_start().trim_start_matches(':').trim_start();
    let end = rest
        .find(|c: char| !c.is_ascii_digit() && c != '.')
        .unwrap_or(rest.len());
    rest[..end].parse::<f64>().ok()
}

/// Parse the PSNR summary line; the last "average:" value wins
pub(crate) fn parse_psnr_average(text: &str) -> Option<f64> {
    text.lines()
        .filter_map(|line| number_after(line, "average"))
        .last()
}

/// Parse the SSIM summary line; the last "All:" value wins
pub(crate) fn parse_ssim_all(text: &str) -> Option<f64> {
    text.lines()
        .filter_map(|line| number_after(line, "All"))
        .last()
}

/// Parse a libvmaf JSON log: pooled mean first, then per-frame average
pub(crate) fn parse_vmaf_log(json: &str) -> Option<f64> {
    let value: serde_json::Value = serde_json::from_str(json).ok()?;
    if let Some(mean) = value
        .pointer("/pooled_metrics/vmaf/mean")
        .and_then(|v| v.as_f64())
    {
        return Some(mean);
    }
    let frames = value.get("frames")?.as_array()?;
    let scores: Vec<f64> = frames
        .iter()
        .filter_map(|f| f.pointer("/metrics/vmaf").and_then(|v| v.as_f64()))
        .collect();
    if scores.is_empty() {
        None
    } else {
        Some(scores.iter().sum::<f64>() / scores.len() as f64)
    }
}

/// Console fallback: "VMAF score: 93.42"
pub(crate) fn parse_vmaf_stderr(text: &str) -> Option<f64> {
    text.lines()
        .filter_map(|line| number_after(line, "VMAF score"))
        .last()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn psnr_average_takes_last_summary_line() {
        let text = "frame=100\n\
                    [Parsed_psnr_1 @ 0x1] PSNR y:43.21 u:45.00 v:44.10 average:43.73 min:40.00 max:48.00\n";
        assert_eq!(parse_psnr_average(text), Some(43.73));
    }

    #[test]
    fn ssim_all_value() {
        let text = "[Parsed_ssim_1 @ 0x1] SSIM Y:0.987 (18.9) U:0.99 V:0.99 All:0.9881 (19.2)\n";
        assert_eq!(parse_ssim_all(text), Some(0.9881));
    }

    #[test]
    fn missing_summary_yields_none() {
        assert_eq!(parse_psnr_average("no metrics here\n"), None);
        assert_eq!(parse_ssim_all("no metrics here\n"), None);
    }

    #[test]
    fn vmaf_log_prefers_pooled_mean() {
        let json = r#"{"pooled_metrics":{"vmaf":{"mean":93.42,"min":80.0}},"frames":[]}"#;
        assert_eq!(parse_vmaf_log(json), Some(93.42));
    }

    #[test]
    fn vmaf_log_falls_back_to_frame_average() {
        let json = r#"{"frames":[
            {"metrics":{"vmaf":90.0}},
            {"metrics":{"vmaf":94.0}}
        ]}"#;
        assert_eq!(parse_vmaf_log(json), Some(92.0));
    }

    #[test]
    fn vmaf_stderr_fallback() {
        let text = "lots of noise\nVMAF score: 88.15\n";
        assert_eq!(parse_vmaf_stderr(text), Some(88.15));
        assert_eq!(parse_vmaf_stderr("nothing"), None);
    }
}
