use std::path::Path;
use std::process::Command;

use serde::Deserialize;
use tracing::{debug, info};

use crate::error::PipelineError;
use crate::frame::MediaGeometry;

#[derive(Debug, Deserialize)]
struct ProbeOutput {
    #[serde(default)]
    streams: Vec<StreamInfo>,
}

#[derive(Debug, Deserialize)]
struct StreamInfo {
    #[serde(default)]
    codec_type: Option<String>,
    #[serde(default)]
    width: Option<i64>,
    #[serde(default)]
    height: Option<i64>,
}

/// Determines the raw frame geometry of the input by invoking ffprobe and
/// selecting the first stream classified as video. Fails before any
/// pipeline process is started when the input is unreadable, carries no
/// video stream, or reports non-positive dimensions.
pub fn probe_geometry(program: &str, path: &Path) -> Result<MediaGeometry, PipelineError> {
    info!(input = %path.display(), "Probing input geometry");

    let output = Command::new(program)
        .args(["-v", "error", "-print_format", "json", "-show_streams"])
        .arg(path)
        .output()
        .map_err(|source| PipelineError::Launch {
            tool: program.to_string(),
            source,
        })?;

    if !output.status.success() {
        let stderr = String::from_utf8_lossy(&output.stderr);
        return Err(PipelineError::Probe {
            path: path.to_path_buf(),
            reason: format!(
                "{program} exited with {}: {}",
                output.status,
                stderr.trim()
            ),
        });
    }

    let geometry = parse_probe_output(&output.stdout).map_err(|reason| PipelineError::Probe {
        path: path.to_path_buf(),
        reason,
    })?;

    debug!(
        width = geometry.width,
        height = geometry.height,
        frame_size = geometry.frame_size(),
        "Probe complete"
    );
    Ok(geometry)
}

/// Parses ffprobe's `-print_format json -show_streams` output into a
/// geometry. Split out from the process invocation so stream selection and
/// dimension validation are testable on their own.
fn parse_probe_output(stdout: &[u8]) -> Result<MediaGeometry, String> {
    let probe: ProbeOutput =
        serde_json::from_slice(stdout).map_err(|err| format!("invalid probe JSON: {err}"))?;

    let video = probe
        .streams
        .iter()
        .find(|s| s.codec_type.as_deref() == Some("video"))
        .ok_or_else(|| "no video stream found".to_string())?;

    let width = video.width.ok_or_else(|| "video stream has no width".to_string())?;
    let height = video
        .height
        .ok_or_else(|| "video stream has no height".to_string())?;
    if width <= 0 || height <= 0 {
        return Err(format!("non-positive video dimensions {width}x{height}"));
    }

    Ok(MediaGeometry::rgb24(width as u32, height as u32))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn selects_first_video_stream() {
        let json = br#"{
            "streams": [
                {"codec_type": "audio", "sample_rate": "48000"},
                {"codec_type": "video", "width": 64, "height": 48},
                {"codec_type": "video", "width": 1920, "height": 1080}
            ]
        }"#;
        let geometry = parse_probe_output(json).unwrap();
        assert_eq!(geometry.width, 64);
        assert_eq!(geometry.height, 48);
        assert_eq!(geometry.frame_size(), 64 * 48 * 3);
    }

    #[test]
    fn rejects_input_without_video_stream() {
        let json = br#"{"streams": [{"codec_type": "audio"}]}"#;
        let err = parse_probe_output(json).unwrap_err();
        assert!(err.contains("no video stream"));
    }

    #[test]
    fn rejects_non_positive_dimensions() {
        let json = br#"{"streams": [{"codec_type": "video", "width": 0, "height": 48}]}"#;
        let err = parse_probe_output(json).unwrap_err();
        assert!(err.contains("non-positive"));
    }

    #[test]
    fn rejects_malformed_json() {
        let err = parse_probe_output(b"not json").unwrap_err();
        assert!(err.contains("invalid probe JSON"));
    }

    #[test]
    fn probe_fails_fast_when_tool_is_missing() {
        let err = probe_geometry(
            "/nonexistent/ffprobe",
            Path::new("input.mp4"),
        )
        .unwrap_err();
        assert!(matches!(err, PipelineError::Launch { .. }));
    }
}
