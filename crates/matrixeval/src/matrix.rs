use crate::task::{EncoderFamily, JobResult, NvencCodec, TaskConfig};

/// Split a comma-delimited parameter list, trimming and dropping empty entries
pub fn split_list(raw: &str) -> Vec<String> {
    raw.split(',')
        .map(|s| s.trim().to_string())
        .filter(|s| !s.is_empty())
        .collect()
}

/// An empty axis contributes exactly one combination, never zero
fn axis_or_blank(values: Vec<String>) -> Vec<String> {
    if values.is_empty() {
        vec![String::new()]
    } else {
        values
    }
}

/// Lazy n-ary cartesian product over a list of axes, in fixed axis order.
///
/// Yields one `Vec` per combination with one element per axis. The first
/// axis varies slowest, matching nested-loop expansion order.
pub fn cartesian(axes: Vec<Vec<String>>) -> impl Iterator<Item = Vec<String>> {
    let total: usize = axes.iter().map(|a| a.len().max(1)).product();
    let mut indices = vec![0usize; axes.len()];
    let mut emitted = 0usize;

    std::iter::from_fn(move || {
        if emitted >= total || axes.iter().any(|a| a.is_empty()) {
            return None;
        }
        let combo: Vec<String> = axes
            .iter()
            .zip(indices.iter())
            .map(|(axis, &i)| axis[i].clone())
            .collect();
        emitted += 1;

        // Odometer increment, last axis fastest
        for pos in (0..axes.len()).rev() {
            indices[pos] += 1;
            if indices[pos] < axes[pos].len() {
                break;
            }
            indices[pos] = 0;
        }
        Some(combo)
    })
}

/// Resolve the effective encoder family and NVENC codec for a task
pub(crate) fn resolve_family(config: &TaskConfig) -> (EncoderFamily, NvencCodec) {
    (
        config.encoder.unwrap_or(EncoderFamily::Nvenc),
        config.nvenc_codec.unwrap_or(NvencCodec::H264),
    )
}

/// Short encoder tag used in output filenames
pub(crate) fn encoder_tag(family: EncoderFamily, codec: NvencCodec) -> &'static str {
    match (family, codec) {
        (EncoderFamily::X264, _) => "x264",
        (EncoderFamily::X265, _) => "x265",
        (EncoderFamily::Nvenc, NvencCodec::Hevc) => "nvhevc",
        (EncoderFamily::Nvenc, NvencCodec::H264) => "nvh264",
    }
}

/// ffmpeg video codec name for the encoder family
fn codec_name(family: EncoderFamily, codec: NvencCodec) -> &'static str {
    match (family, codec) {
        (EncoderFamily::X264, _) => "libx264",
        (EncoderFamily::X265, _) => "libx265",
        (EncoderFamily::Nvenc, NvencCodec::Hevc) => "hevc_nvenc",
        (EncoderFamily::Nvenc, NvencCodec::H264) => "h264_nvenc",
    }
}

/// Remap a requested profile when the encoder/codec pair does not support it.
///
/// NVENC HEVC has no "high" profile; anything outside its supported set
/// falls back to the broadest profile, "main".
pub fn remap_profile(family: EncoderFamily, codec: NvencCodec, profile: &str) -> String {
    let requested = profile.trim();
    if requested.is_empty() {
        return String::new();
    }
    if family == EncoderFamily::Nvenc && codec == NvencCodec::Hevc {
        let lower = requested.to_lowercase();
        if lower == "high" || !matches!(lower.as_str(), "main" | "main10" | "rext") {
            return "main".to_string();
        }
        return lower;
    }
    requested.to_string()
}

/// Expand a task configuration into its ordered job matrix.
///
/// `run_stamp_ms` is the shared run timestamp baked into every filename and
/// job id; together with the ordinal index it keeps output filenames
/// pairwise distinct even for identical parameter combinations.
pub fn generate_jobs(config: &TaskConfig, run_stamp_ms: i64) -> Vec<JobResult> {
    let (family, nv_codec) = resolve_family(config);
    let is_nvenc = family == EncoderFamily::Nvenc;

    let axes = vec![
        axis_or_blank(split_list(&config.presets)),
        axis_or_blank(split_list(&config.bitrates)),
        axis_or_blank(split_list(&config.maxrates)),
        axis_or_blank(split_list(&config.bufsizes)),
        axis_or_blank(split_list(&config.cq_values)),
        axis_or_blank(split_list(&config.qp_values)),
        axis_or_blank(split_list(&config.lookaheads)),
    ];

    let codec = codec_name(family, nv_codec);
    let hwaccel = if is_nvenc {
        "-hwaccel cuda -hwaccel_output_format cuda "
    } else {
        ""
    };
    let rc_mode = config.rc_mode.trim();
    let profile = remap_profile(family, nv_codec, &config.profile);
    let tune = config.tune.trim();
    let multipass = config.multipass.trim();
    let minrate = config.minrate.trim();

    let mut jobs = Vec::new();
    for combo in cartesian(axes) {
        let mut values = combo.into_iter();
        let mut next = || values.next().unwrap_or_default();
        let (preset, bitrate, maxrate, bufsize, cq, qp, lookahead) =
            (next(), next(), next(), next(), next(), next(), next());
        let index = jobs.len();

        // Filename: every non-empty parameter token plus the run stamp and ordinal
        let mut name_parts: Vec<String> = vec!["auto".into(), encoder_tag(family, nv_codec).into()];
        if !preset.is_empty() {
            name_parts.push(format!("pre-{preset}"));
        }
        name_parts.push(format!(
            "rc-{}",
            if rc_mode.is_empty() { "vbr" } else { rc_mode }
        ));
        if !bitrate.is_empty() {
            name_parts.push(format!("b-{bitrate}"));
        }
        if !maxrate.is_empty() {
            name_parts.push(format!("max-{maxrate}"));
        }
        if !bufsize.is_empty() {
            name_parts.push(format!("buf-{bufsize}"));
        }
        if !cq.is_empty() {
            name_parts.push(format!("cq-{cq}"));
        }
        if !qp.is_empty() {
            name_parts.push(format!("qp-{qp}"));
        }
        if !tune.is_empty() {
            name_parts.push(format!("t-{tune}"));
        }
        if !multipass.is_empty() {
            name_parts.push(format!("mp-{multipass}"));
        }
        if !lookahead.is_empty() && lookahead != "0" {
            name_parts.push(format!("la-{lookahead}"));
        }
        if !minrate.is_empty() {
            name_parts.push(format!("min-{minrate}"));
        }
        if config.temporal_aq {
            name_parts.push("ta-1".into());
        }
        if config.spatial_aq {
            name_parts.push("sa-1".into());
        }
        if !profile.is_empty() {
            name_parts.push(format!("pr-{profile}"));
        }
        let output_filename = format!("{}_{run_stamp_ms}_{index}.mp4", name_parts.join("_"));

        let mut params: Vec<String> = vec![format!("-c:v {codec}")];
        if !preset.is_empty() {
            params.push(format!("-preset {preset}"));
        }
        if rc_mode == "constqp" {
            // Constant-quantizer mode: no bitrate-shaping flags, fixed QP only
            params.push("-rc constqp".into());
            if !qp.is_empty() {
                params.push(format!("-qp {qp}"));
            }
        } else {
            if !rc_mode.is_empty() {
                params.push(format!("-rc:v {rc_mode}"));
            }
            if !bitrate.is_empty() {
                params.push(format!("-b:v {bitrate}"));
            }
            if !maxrate.is_empty() {
                params.push(format!("-maxrate {maxrate}"));
            }
            if !bufsize.is_empty() {
                params.push(format!("-bufsize {bufsize}"));
            }
            if !cq.is_empty() {
                params.push(format!("-cq:v {cq}"));
            }
        }
        if config.temporal_aq {
            params.push("-temporal-aq 1".into());
        }
        if config.spatial_aq {
            params.push("-spatial-aq 1".into());
        }
        if !profile.is_empty() {
            params.push(format!("-profile:v {profile}"));
        }
        params.push("-c:a copy".into());
        if is_nvenc {
            if !tune.is_empty() {
                params.push(format!("-tune {tune}"));
            }
            if !multipass.is_empty() {
                params.push(format!("-multipass {multipass}"));
            }
            if !lookahead.is_empty() && lookahead != "0" {
                params.push(format!("-rc-lookahead {lookahead}"));
            }
            if !minrate.is_empty() {
                params.push(format!("-minrate {minrate}"));
            }
        }
        let command = format!("ffmpeg -y {hwaccel}-i {{input}} {} {{output}}", params.join(" "));

        jobs.push(JobResult {
            id: format!("{run_stamp_ms}-{index}"),
            preset,
            bitrate,
            maxrate,
            bufsize,
            cq,
            qp,
            lookahead,
            temporal_aq: config.temporal_aq,
            spatial_aq: config.spatial_aq,
            profile: profile.clone(),
            tune: tune.to_string(),
            multipass: multipass.to_string(),
            minrate: minrate.to_string(),
            command,
            output_filename,
            download_url: None,
            saved_path: None,
            export_duration_ms: None,
            eval: None,
        });
    }
    jobs
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;
    use std::collections::HashSet;

    fn nvenc_config() -> TaskConfig {
        TaskConfig {
            encode_target: "10.0.0.5:5000".to_string(),
            encoder: Some(EncoderFamily::Nvenc),
            nvenc_codec: Some(NvencCodec::H264),
            ..Default::default()
        }
    }

    #[test]
    fn job_count_is_product_of_nonempty_axis_lengths() {
        let config = TaskConfig {
            presets: "p6,p7".to_string(),
            bitrates: "8M".to_string(),
            cq_values: String::new(),
            ..nvenc_config()
        };
        let jobs = generate_jobs(&config, 1_700_000_000_000);
        assert_eq!(jobs.len(), 2);
    }

    #[test]
    fn filenames_are_distinct_for_identical_parameter_values() {
        // Duplicated axis entries produce jobs whose visible parameters match
        let config = TaskConfig {
            presets: "p5,p5".to_string(),
            ..nvenc_config()
        };
        let jobs = generate_jobs(&config, 1_700_000_000_000);
        assert_eq!(jobs.len(), 2);
        assert_eq!(jobs[0].preset, jobs[1].preset);
        assert_ne!(jobs[0].output_filename, jobs[1].output_filename);
    }

    #[test]
    fn constqp_omits_bitrate_flags_and_emits_qp() {
        let config = TaskConfig {
            rc_mode: "constqp".to_string(),
            bitrates: "8M".to_string(),
            maxrates: "10M".to_string(),
            bufsizes: "16M".to_string(),
            cq_values: "23".to_string(),
            qp_values: "24".to_string(),
            ..nvenc_config()
        };
        for job in generate_jobs(&config, 1_700_000_000_000) {
            assert!(job.command.contains("-rc constqp"));
            assert!(job.command.contains("-qp 24"));
            assert!(!job.command.contains("-b:v"));
            assert!(!job.command.contains("-maxrate"));
            assert!(!job.command.contains("-bufsize"));
            assert!(!job.command.contains("-cq:v"));
        }
    }

    #[test]
    fn nvenc_only_flags_are_suppressed_for_software_encoders() {
        let config = TaskConfig {
            encoder: Some(EncoderFamily::X264),
            tune: "hq".to_string(),
            multipass: "fullres".to_string(),
            lookaheads: "32".to_string(),
            minrate: "1M".to_string(),
            ..Default::default()
        };
        let jobs = generate_jobs(&config, 1_700_000_000_000);
        assert_eq!(jobs.len(), 1);
        let cmd = &jobs[0].command;
        assert!(cmd.contains("-c:v libx264"));
        assert!(!cmd.starts_with("ffmpeg -y -hwaccel"));
        assert!(!cmd.contains("-tune"));
        assert!(!cmd.contains("-multipass"));
        assert!(!cmd.contains("-rc-lookahead"));
        assert!(!cmd.contains("-minrate"));
    }

    #[test]
    fn nvenc_emits_hwaccel_prefix_and_family_flags() {
        let config = TaskConfig {
            tune: "hq".to_string(),
            lookaheads: "32".to_string(),
            ..nvenc_config()
        };
        let jobs = generate_jobs(&config, 1_700_000_000_000);
        let cmd = &jobs[0].command;
        assert!(cmd.starts_with("ffmpeg -y -hwaccel cuda -hwaccel_output_format cuda -i {input}"));
        assert!(cmd.contains("-tune hq"));
        assert!(cmd.contains("-rc-lookahead 32"));
        assert!(cmd.ends_with("{output}"));
    }

    #[test]
    fn lookahead_zero_is_treated_as_disabled() {
        let config = TaskConfig {
            lookaheads: "0".to_string(),
            ..nvenc_config()
        };
        let jobs = generate_jobs(&config, 1_700_000_000_000);
        assert!(!jobs[0].command.contains("-rc-lookahead"));
        assert!(!jobs[0].output_filename.contains("la-"));
    }

    #[test]
    fn hevc_nvenc_remaps_unsupported_profiles_to_main() {
        assert_eq!(remap_profile(EncoderFamily::Nvenc, NvencCodec::Hevc, "high"), "main");
        assert_eq!(remap_profile(EncoderFamily::Nvenc, NvencCodec::Hevc, "baseline"), "main");
        assert_eq!(remap_profile(EncoderFamily::Nvenc, NvencCodec::Hevc, "main10"), "main10");
        assert_eq!(remap_profile(EncoderFamily::Nvenc, NvencCodec::H264, "high"), "high");
        assert_eq!(remap_profile(EncoderFamily::X264, NvencCodec::H264, "high"), "high");
        assert_eq!(remap_profile(EncoderFamily::X264, NvencCodec::H264, ""), "");
    }

    #[test]
    fn commands_contain_exactly_the_two_placeholders() {
        let config = TaskConfig {
            presets: "p4".to_string(),
            bitrates: "6M".to_string(),
            ..nvenc_config()
        };
        let cmd = &generate_jobs(&config, 1_700_000_000_000)[0].command;
        assert_eq!(cmd.matches("{input}").count(), 1);
        assert_eq!(cmd.matches("{output}").count(), 1);
    }

    proptest! {
        #[test]
        fn generated_count_matches_axis_product(
            presets in prop::collection::vec("[a-z][a-z0-9]{0,3}", 0..4),
            bitrates in prop::collection::vec("[1-9]M", 0..3),
            cqs in prop::collection::vec("[1-9][0-9]?", 0..3),
            qps in prop::collection::vec("[1-9][0-9]?", 0..3),
        ) {
            let config = TaskConfig {
                presets: presets.join(","),
                bitrates: bitrates.join(","),
                cq_values: cqs.join(","),
                qp_values: qps.join(","),
                ..nvenc_config()
            };
            let expected = presets.len().max(1)
                * bitrates.len().max(1)
                * cqs.len().max(1)
                * qps.len().max(1);
            prop_assert_eq!(generate_jobs(&config, 1_700_000_000_000).len(), expected);
        }

        #[test]
        fn filenames_are_pairwise_distinct(
            presets in prop::collection::vec("[a-z][a-z0-9]{0,3}", 0..4),
            bitrates in prop::collection::vec("[1-9]M", 0..3),
            stamp in 1_000_000_000_000i64..2_000_000_000_000i64,
        ) {
            let config = TaskConfig {
                presets: presets.join(","),
                bitrates: bitrates.join(","),
                ..nvenc_config()
            };
            let jobs = generate_jobs(&config, stamp);
            let names: HashSet<_> = jobs.iter().map(|j| j.output_filename.clone()).collect();
            prop_assert_eq!(names.len(), jobs.len());
        }
    }
}
