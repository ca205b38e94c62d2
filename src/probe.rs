//! Wraps an external ffprobe-compatible binary to answer two questions: what codec is a
//! file currently encoded with, and how long does it run.

use serde::Deserialize;
use std::time::Duration;
use tokio::process::Command;
use tokio::time::timeout;
use tracing::{debug, warn};

const PROBE_TIMEOUT: Duration = Duration::from_secs(30);

fn ffprobe_bin() -> String {
    std::env::var("FFPROBE_BIN").unwrap_or_else(|_| "ffprobe".to_string())
}

#[derive(Debug, Deserialize)]
struct ProbeOutput {
    #[serde(default)]
    streams: Vec<ProbeStream>,
    #[serde(default)]
    format: Option<ProbeFormat>,
}

#[derive(Debug, Deserialize)]
struct ProbeStream {
    codec_type: Option<String>,
    codec_name: Option<String>,
}

#[derive(Debug, Deserialize)]
struct ProbeFormat {
    duration: Option<String>,
}

/// Returns the first video stream's codec name, or `None` if it can't be determined
/// (missing binary, malformed output, or timeout). Callers treat `None` as "needs conversion".
pub async fn codec_of(path: &str) -> Option<String> {
    let output = match run_probe(path, &["-show_streams"]).await {
        Some(o) => o,
        None => return None,
    };
    output
        .streams
        .into_iter()
        .find(|s| s.codec_type.as_deref() == Some("video"))
        .and_then(|s| s.codec_name)
}

/// Returns the container duration in seconds, or `0.0` on any failure.
pub async fn duration_of(path: &str) -> f64 {
    let output = match run_probe(path, &["-show_format"]).await {
        Some(o) => o,
        None => return 0.0,
    };
    output
        .format
        .and_then(|f| f.duration)
        .and_then(|d| d.parse::<f64>().ok())
        .unwrap_or(0.0)
}

async fn run_probe(path: &str, extra: &[&str]) -> Option<ProbeOutput> {
    let mut cmd = Command::new(ffprobe_bin());
    cmd.args(["-v", "quiet", "-print_format", "json"])
        .args(extra)
        .arg(path)
        .stdout(std::process::Stdio::piped())
        .stderr(std::process::Stdio::null());

    let spawned = cmd.output();
    let result = match timeout(PROBE_TIMEOUT, spawned).await {
        Ok(Ok(output)) => output,
        Ok(Err(e)) => {
            warn!("ffprobe spawn failed for {path}: {e}");
            return None;
        }
        Err(_) => {
            warn!("ffprobe timed out after {:?} for {path}", PROBE_TIMEOUT);
            return None;
        }
    };

    if !result.status.success() {
        debug!("ffprobe exited non-zero for {path}");
        return None;
    }

    serde_json::from_slice(&result.stdout).ok()
}

/// True if `codec` already belongs to the target family ("hevc" or "h264"), i.e. no
/// conversion is needed.
pub fn codec_matches_family(codec: &str, family: &str) -> bool {
    let codec = codec.to_lowercase();
    match family {
        "hevc" => codec == "hevc" || codec == "h265",
        "h264" => codec == "h264",
        _ => false,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn hevc_family_matches_hevc_and_h265_names() {
        assert!(codec_matches_family("hevc", "hevc"));
        assert!(codec_matches_family("h265", "hevc"));
        assert!(!codec_matches_family("h264", "hevc"));
    }

    #[test]
    fn h264_family_matches_only_exact_h264_name() {
        assert!(codec_matches_family("h264", "h264"));
        assert!(!codec_matches_family("avc1", "h264"));
        assert!(!codec_matches_family("hevc", "h264"));
    }

    #[test]
    fn family_match_is_exact_not_substring() {
        assert!(!codec_matches_family("hevc_other", "hevc"));
        assert!(!codec_matches_family("h264_rgb", "h264"));
    }

    #[tokio::test]
    async fn codec_of_returns_none_for_missing_binary() {
        std::env::set_var("FFPROBE_BIN", "definitely-not-a-real-binary-xyz");
        assert_eq!(codec_of("/no/such/file.mkv").await, None);
        std::env::remove_var("FFPROBE_BIN");
    }
}
