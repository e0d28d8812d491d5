//! Wrappers over `ffmpeg` and `ffprobe` for the conversions that Telegram
//! replies need.

mod probe;

pub(crate) use probe::*;

use crate::prelude::*;
use crate::Result;
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Converts any audio to OGG/Opus, which is the only format Telegram
/// displays as a voice message.
#[instrument(skip_all, fields(input = %input.display()))]
pub(crate) async fn to_voice_ogg(input: &Path, timeout: Duration) -> Result<PathBuf> {
    let output = sibling_output(input, "ogg")?;
    let log_message = format!("Converting audio to OGG/Opus with output at {output:?}");

    let input_arg = input.to_string_lossy();
    let output_arg = output.to_string_lossy();

    // Rustfmt is doing a bad job of condensing this code, so let's disable it
    #[rustfmt::skip]
    let args = [
        // Overwrite output file without interactive confirmation
        "-y",

        "-i",
        &input_arg,

        // Drop cover art and any other video streams
        "-vn",

        "-c:a",
        "libopus",

        // Speech-grade bitrate is enough for voice messages
        "-b:a",
        "64k",

        &output_arg,
    ];

    ffmpeg(&args, timeout).with_duration_log(&log_message).await?;

    Ok(output)
}

/// Re-encodes a video to H.264 MP4 that Telegram can stream.
#[instrument(skip_all, fields(input = %input.display()))]
pub(crate) async fn to_streamable_mp4(input: &Path, timeout: Duration) -> Result<PathBuf> {
    let output = sibling_output(input, "mp4")?;
    let log_message = format!("Converting video to mp4 with output at {output:?}");

    let input_arg = input.to_string_lossy();
    let output_arg = output.to_string_lossy();

    #[rustfmt::skip]
    let args = [
        "-y",

        "-i",
        &input_arg,

        // H.264 needs dimensions divisible by 2
        "-vf",
        "crop=floor(iw/2)*2:floor(ih/2)*2:0:0",

        "-c:v",
        "libx264",

        "-preset",
        "faster",

        "-pix_fmt",
        "yuv420p",

        "-crf",
        "23",

        "-c:a",
        "aac",

        // Fast start is needed to make the video playable before it's fully downloaded
        "-movflags",
        "+faststart",

        &output_arg,
    ];

    ffmpeg(&args, timeout).with_duration_log(&log_message).await?;

    Ok(output)
}

/// Output goes next to the input, so it's cleaned up together with
/// the input's directory.
fn sibling_output(input: &Path, extension: &str) -> Result<PathBuf> {
    let dir = input
        .parent()
        .fatal_ctx(|| format!("BUG: media file path has no parent: {input:?}"))?;

    Ok(dir.join(format!("{}.{extension}", nanoid::nanoid!())))
}

async fn ffmpeg(args: &[&str], timeout: Duration) -> Result<Vec<u8>> {
    crate::util::process::run("ffmpeg", args, timeout).await
}
