use crate::matrix::{encoder_tag, resolve_family};
use crate::task::Task;

/// Column order of the per-task report; one row per evaluated job
const COLUMNS: [&str; 25] = [
    "encoder",
    "preset",
    "bitrate",
    "maxrate",
    "bufsize",
    "rate_control",
    "const_quality",
    "fixed_quantizer",
    "temporal_aq",
    "spatial_aq",
    "profile",
    "tune",
    "multipass",
    "lookahead",
    "minrate",
    "output_file",
    "composite_score",
    "primary_metric",
    "secondary_metric",
    "structural_metric",
    "bitrate_after",
    "export_duration_seconds",
    "download_url",
    "saved_path",
    "command",
];

/// Quote a field per RFC 4180: wrap when it contains a comma, quote, or
/// newline, doubling any embedded quotes
fn csv_field(value: &str) -> String {
    if value.contains(',') || value.contains('"') || value.contains('\n') || value.contains('\r') {
        format!("\"{}\"", value.replace('"', "\"\""))
    } else {
        value.to_string()
    }
}

fn csv_row(fields: &[String]) -> String {
    fields.iter().map(|f| csv_field(f)).collect::<Vec<_>>().join(",")
}

fn opt_metric(value: Option<f64>) -> String {
    value.map(|v| format!("{v:.4}")).unwrap_or_default()
}

/// Render the task's report as CSV text.
///
/// Only jobs that finished evaluation produce rows; a task where every job
/// failed yields the header line alone.
pub fn build_csv(task: &Task) -> String {
    let (family, codec) = resolve_family(&task.config);
    let encoder = encoder_tag(family, codec);

    let mut lines = Vec::with_capacity(task.results.len() + 1);
    lines.push(COLUMNS.join(","));

    for job in &task.results {
        let eval = match &job.eval {
            Some(eval) => eval,
            None => continue,
        };
        let rate_control = if task.config.rc_mode.is_empty() {
            "vbr".to_string()
        } else {
            task.config.rc_mode.clone()
        };
        let fields = vec![
            encoder.to_string(),
            job.preset.clone(),
            job.bitrate.clone(),
            job.maxrate.clone(),
            job.bufsize.clone(),
            rate_control,
            job.cq.clone(),
            job.qp.clone(),
            job.temporal_aq.to_string(),
            job.spatial_aq.to_string(),
            job.profile.clone(),
            job.tune.clone(),
            job.multipass.clone(),
            job.lookahead.clone(),
            job.minrate.clone(),
            job.output_filename.clone(),
            format!("{:.4}", eval.final_score),
            opt_metric(eval.vmaf),
            opt_metric(eval.psnr),
            opt_metric(eval.ssim),
            eval.bitrate_after_kbps.map(|b| b.to_string()).unwrap_or_default(),
            job.export_duration_ms
                .map(|ms| format!("{:.2}", ms as f64 / 1000.0))
                .unwrap_or_default(),
            job.download_url.clone().unwrap_or_default(),
            job.saved_path
                .as_ref()
                .map(|p| p.display().to_string())
                .unwrap_or_default(),
            job.command.clone(),
        ];
        lines.push(csv_row(&fields));
    }

    let mut csv = lines.join("\r\n");
    csv.push_str("\r\n");
    csv
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::task::{EvalSummary, JobResult, TaskConfig};

    fn job(id: &str, eval: Option<EvalSummary>) -> JobResult {
        JobResult {
            id: id.to_string(),
            preset: "p6".to_string(),
            bitrate: "4000k".to_string(),
            maxrate: "6000k".to_string(),
            bufsize: "8000k".to_string(),
            cq: "".to_string(),
            qp: "".to_string(),
            lookahead: "32".to_string(),
            temporal_aq: true,
            spatial_aq: false,
            profile: "main".to_string(),
            tune: "hq".to_string(),
            multipass: "qres".to_string(),
            minrate: "".to_string(),
            command: "ffmpeg -y -i {input} -c:v hevc_nvenc {output}".to_string(),
            output_filename: format!("out_{id}.mp4"),
            download_url: Some(format!("http://host/out_{id}.mp4")),
            saved_path: Some(format!("/data/out_{id}.mp4").into()),
            export_duration_ms: Some(12_345),
            eval,
        }
    }

    fn summary() -> EvalSummary {
        EvalSummary {
            vmaf: Some(93.42),
            psnr: Some(43.73),
            ssim: Some(0.9881),
            bitrate_after_kbps: Some(4123),
            final_score: 0.8123,
        }
    }

    #[test]
    fn header_plus_one_row_per_evaluated_job() {
        let mut task = Task::new(TaskConfig::default(), 0);
        task.results = vec![job("a", Some(summary())), job("b", None), job("c", Some(summary()))];
        let csv = build_csv(&task);
        let lines: Vec<&str> = csv.trim_end().split("\r\n").collect();
        assert_eq!(lines.len(), 3);
        assert!(lines[0].starts_with("encoder,preset,bitrate,"));
        assert_eq!(lines[0].split(',').count(), 25);
    }

    #[test]
    fn commas_and_quotes_are_escaped() {
        assert_eq!(csv_field("plain"), "plain");
        assert_eq!(csv_field("a,b"), "\"a,b\"");
        assert_eq!(csv_field("say \"hi\""), "\"say \"\"hi\"\"\"");
        assert_eq!(csv_field("two\nlines"), "\"two\nlines\"");
    }

    #[test]
    fn command_with_commas_stays_one_field() {
        let mut task = Task::new(TaskConfig::default(), 0);
        let mut j = job("a", Some(summary()));
        j.command = "ffmpeg -y -i {input} -vf scale=1920:1080,format=yuv420p {output}".to_string();
        task.results = vec![j];
        let csv = build_csv(&task);
        let row = csv.trim_end().split("\r\n").nth(1).unwrap();
        // A naive split would overcount; the quoted command keeps 25 logical fields
        assert!(row.contains("\"ffmpeg -y -i {input} -vf scale=1920:1080,format=yuv420p {output}\""));
    }

    #[test]
    fn empty_rate_control_reports_vbr() {
        let mut task = Task::new(TaskConfig::default(), 0);
        task.results = vec![job("a", Some(summary()))];
        let csv = build_csv(&task);
        let row = csv.trim_end().split("\r\n").nth(1).unwrap();
        let fields: Vec<&str> = row.split(',').collect();
        assert_eq!(fields[5], "vbr");
    }

    #[test]
    fn export_duration_rendered_in_seconds() {
        let mut task = Task::new(TaskConfig::default(), 0);
        task.results = vec![job("a", Some(summary()))];
        let csv = build_csv(&task);
        assert!(csv.contains("12.35"));
    }
}
