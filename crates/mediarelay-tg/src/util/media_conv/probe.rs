use crate::prelude::*;
use crate::Result;
use serde::Deserialize;
use std::path::Path;
use std::time::Duration;

/// Dimensions and duration of a media file
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub(crate) struct StreamMeta {
    pub(crate) width: Option<u32>,
    pub(crate) height: Option<u32>,
    pub(crate) duration: Option<Duration>,
}

#[derive(Deserialize)]
struct ProbeOutput {
    #[serde(default)]
    streams: Vec<ProbeStream>,
    format: Option<ProbeFormat>,
}

#[derive(Deserialize)]
struct ProbeStream {
    codec_type: Option<String>,
    width: Option<u32>,
    height: Option<u32>,
    duration: Option<String>,
}

#[derive(Deserialize)]
struct ProbeFormat {
    duration: Option<String>,
}

#[instrument(skip_all, fields(input = %input.display()))]
pub(crate) async fn probe(input: &Path, timeout: Duration) -> Result<StreamMeta> {
    let input_arg = input.to_string_lossy();

    #[rustfmt::skip]
    let args = [
        "-v",
        "error",

        "-print_format",
        "json",

        "-show_streams",
        "-show_format",

        &input_arg,
    ];

    let output: ProbeOutput = crate::util::process::run_json("ffprobe", &args, timeout).await?;

    Ok(output.into())
}

impl From<ProbeOutput> for StreamMeta {
    fn from(output: ProbeOutput) -> Self {
        let video = output
            .streams
            .iter()
            .find(|stream| stream.codec_type.as_deref() == Some("video"));

        // Container duration is more reliable than the per-stream one,
        // e.g. WebM streams don't have duration at all.
        let duration = output
            .format
            .and_then(|format| format.duration)
            .or_else(|| output.streams.iter().find_map(|stream| stream.duration.clone()))
            .and_then(|duration| parse_seconds(&duration));

        Self {
            width: video.and_then(|video| video.width),
            height: video.and_then(|video| video.height),
            duration,
        }
    }
}

fn parse_seconds(secs: &str) -> Option<Duration> {
    let secs: f64 = secs.trim().parse().ok()?;
    Duration::try_from_secs_f64(secs).ok()
}

#[cfg(test)]
mod tests {
    use super::*;
    use expect_test::{expect, Expect};

    #[track_caller]
    fn assert_probe(json: &str, expected: Expect) {
        let output: ProbeOutput = serde_json::from_str(json).unwrap();
        expected.assert_eq(&format!("{:?}", StreamMeta::from(output)));
    }

    #[test]
    fn video_with_audio() {
        assert_probe(
            r#"{
                "streams": [
                    { "codec_type": "audio", "duration": "10.5" },
                    { "codec_type": "video", "width": 1280, "height": 720, "duration": "10.48" }
                ],
                "format": { "duration": "10.500000" }
            }"#,
            expect!["StreamMeta { width: Some(1280), height: Some(720), duration: Some(10.5s) }"],
        );
    }

    #[test]
    fn audio_only_without_container_duration() {
        assert_probe(
            r#"{ "streams": [{ "codec_type": "audio", "duration": "3.25" }], "format": {} }"#,
            expect!["StreamMeta { width: None, height: None, duration: Some(3.25s) }"],
        );
    }

    #[test]
    fn garbage_duration() {
        assert_probe(
            r#"{ "streams": [], "format": { "duration": "N/A" } }"#,
            expect!["StreamMeta { width: None, height: None, duration: None }"],
        );
    }
}
