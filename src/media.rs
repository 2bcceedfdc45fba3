use crate::errors::MediaError;
use std::path::Path;
use std::process::Stdio;
use tokio::process::Command;

/// What ffprobe reports about a source file. Fields are `None` when the
/// respective stream or tag was not present (yet).
#[derive(Clone, Debug, Default)]
pub struct MediaInfo {
    pub duration_secs: Option<f64>,
    pub container: Option<String>,
    pub video_codec: Option<String>,
    pub audio_codec: Option<String>,
}

impl MediaInfo {
    /// Browsers play it natively iff it is an MP4 container carrying
    /// H.264 video and AAC audio.
    pub fn is_browser_compatible(&self) -> bool {
        let container_ok = self
            .container
            .as_deref()
            .map(|c| c.split(',').any(|n| n.trim() == "mp4"))
            .unwrap_or(false);
        container_ok
            && self.video_codec.as_deref() == Some("h264")
            && self.audio_codec.as_deref() == Some("aac")
    }
}

/// Run ffprobe against `path` and parse its JSON report.
pub async fn probe(path: &Path) -> Result<MediaInfo, MediaError> {
    let output = Command::new("ffprobe")
        .args([
            "-v",
            "quiet",
            "-print_format",
            "json",
            "-show_format",
            "-show_streams",
        ])
        .arg(path)
        .stdin(Stdio::null())
        .output()
        .await?;

    if !output.status.success() {
        return Err(MediaError::ProbeFailed(format!(
            "exit {:?} for {}",
            output.status.code(),
            path.display()
        )));
    }

    parse_probe_output(&output.stdout)
}

pub async fn probe_duration(path: &Path) -> Result<f64, MediaError> {
    probe(path)
        .await?
        .duration_secs
        .ok_or_else(|| MediaError::ProbeFailed(format!("no duration for {}", path.display())))
}

fn parse_probe_output(stdout: &[u8]) -> Result<MediaInfo, MediaError> {
    let data: serde_json::Value = serde_json::from_slice(stdout)
        .map_err(|e| MediaError::ProbeFailed(format!("unparseable ffprobe output: {e}")))?;

    let mut info = MediaInfo::default();

    if let Some(format) = data.get("format") {
        info.container = format
            .get("format_name")
            .and_then(|f| f.as_str())
            .map(|s| s.to_string());
        info.duration_secs = format
            .get("duration")
            .and_then(|d| d.as_str())
            .and_then(|d| d.parse().ok());
    }

    if let Some(streams) = data.get("streams").and_then(|s| s.as_array()) {
        for stream in streams {
            let codec_type = stream.get("codec_type").and_then(|t| t.as_str());
            let codec_name = stream
                .get("codec_name")
                .and_then(|c| c.as_str())
                .map(|s| s.to_string());
            match codec_type {
                Some("video") if info.video_codec.is_none() => info.video_codec = codec_name,
                Some("audio") if info.audio_codec.is_none() => info.audio_codec = codec_name,
                _ => {}
            }
        }
    }

    Ok(info)
}

/// Cut `[start_sec, start_sec + duration_sec)` out of `src` into a
/// fragmented-MP4 at `dst`. With `copy_streams` the input streams are copied
/// verbatim; otherwise video is re-encoded to H.264 and audio to AAC.
///
/// The output lands in `<dst>.partial` first and is renamed into place, so
/// a segment file is either absent or complete.
pub async fn extract_segment(
    src: &Path,
    dst: &Path,
    start_sec: f64,
    duration_sec: f64,
    copy_streams: bool,
) -> Result<(), MediaError> {
    let partial = dst.with_extension("mp4.partial");
    let args = extract_args(src, &partial, start_sec, duration_sec, copy_streams);

    tracing::debug!(src = %src.display(), dst = %dst.display(), copy_streams, "running ffmpeg");
    let output = Command::new("ffmpeg")
        .args(&args)
        .stdin(Stdio::null())
        .stdout(Stdio::null())
        .stderr(Stdio::piped())
        .output()
        .await?;

    if !output.status.success() {
        let stderr = String::from_utf8_lossy(&output.stderr);
        let tail: String = stderr
            .lines()
            .rev()
            .take(10)
            .collect::<Vec<_>>()
            .into_iter()
            .rev()
            .collect::<Vec<_>>()
            .join("\n");
        tracing::warn!(dst = %dst.display(), "ffmpeg failed: {tail}");
        let _ = tokio::fs::remove_file(&partial).await;
        return Err(MediaError::ExtractFailed {
            exit_code: output.status.code(),
            stderr: tail,
        });
    }

    tokio::fs::rename(&partial, dst).await?;
    Ok(())
}

fn extract_args(
    src: &Path,
    dst: &Path,
    start_sec: f64,
    duration_sec: f64,
    copy_streams: bool,
) -> Vec<String> {
    let mut args: Vec<String> = vec![
        "-ss".into(),
        format!("{start_sec}"),
        "-t".into(),
        format!("{duration_sec}"),
        "-i".into(),
        src.to_string_lossy().into_owned(),
    ];
    if copy_streams {
        args.extend(["-c".into(), "copy".into()]);
    } else {
        args.extend([
            "-c:v".into(),
            "libx264".into(),
            "-preset".into(),
            "ultrafast".into(),
            "-crf".into(),
            "23".into(),
            "-c:a".into(),
            "aac".into(),
            "-b:a".into(),
            "128k".into(),
        ]);
    }
    args.extend([
        "-movflags".into(),
        "frag_keyframe+empty_moov+default_base_moof".into(),
        "-avoid_negative_ts".into(),
        "make_zero".into(),
        "-f".into(),
        "mp4".into(),
        "-y".into(),
        dst.to_string_lossy().into_owned(),
    ]);
    args
}
