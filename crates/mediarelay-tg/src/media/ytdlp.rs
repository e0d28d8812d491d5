//! Invocations of `yt-dlp` and parsing of its output.

use super::model::{DownloadOptions, MediaInfo, YtDlpInfo};
use super::ToolOutput;
use crate::prelude::*;
use crate::util::process;
use crate::Result;
use lazy_regex::regex;
use std::path::{Path, PathBuf};
use std::time::Duration;
use url::Url;

const PROGRAM: &str = "yt-dlp";

/// Prefix of the lines with the size of the selected format that `yt-dlp`
/// prints before downloading it
const SIZE_PREFIX: &str = "size:";

/// Messages in stderr of `yt-dlp` which mean that it doesn't know how to
/// extract anything from the URL, but `gallery-dl` may still be able to.
const NO_MEDIA_MARKERS: &[&str] = &[
    "Unsupported URL",
    "No video formats found",
    "There's no video in this",
    "No video could be found",
];

/// Transient failures reported by `yt-dlp` only in its free-form stderr
pub(super) fn transient_markers() -> [lazy_regex::Regex; 3] {
    [
        lazy_regex::Regex::clone(regex!(
            r"(?i)(connection (reset|refused|timed out)|read timed out|network is unreachable)"
        )),
        lazy_regex::Regex::clone(regex!(
            r"(?i)(unable to download (webpage|json metadata)|temporary failure in name resolution)"
        )),
        lazy_regex::Regex::clone(regex!(r"HTTP Error (429|5\d\d)")),
    ]
}

pub(super) fn has_no_media(stderr: &str) -> bool {
    NO_MEDIA_MARKERS.iter().any(|marker| stderr.contains(marker))
}

#[instrument(skip_all, fields(%url))]
pub(super) async fn fetch_info(
    url: &Url,
    cookies: Option<&Path>,
    timeout: Duration,
) -> Result<MediaInfo> {
    let cookies = cookies.map(|path| path.to_string_lossy().into_owned());

    let mut args = vec![
        "--dump-single-json",
        "--no-playlist",
        "--no-warnings",
        "--skip-download",
    ];

    if let Some(cookies) = &cookies {
        args.extend(["--cookies", cookies.as_str()]);
    }

    args.push(url.as_str());

    let info: YtDlpInfo = process::run_json(PROGRAM, &args, timeout).await?;

    Ok(info.into())
}

/// Returns the stdout of `yt-dlp`. Use [`parse_download_output`] to get
/// the paths of the files out of it.
#[instrument(skip_all, fields(%url, dir = %dir.display()))]
pub(super) async fn download(
    url: &Url,
    dir: &Path,
    options: &DownloadOptions,
    cookies: Option<&Path>,
    max_file_size: u64,
    timeout: Duration,
) -> Result<String> {
    let output_template = dir
        .join("%(id).64s.%(ext)s")
        .to_string_lossy()
        .into_owned();
    let cookies = cookies.map(|path| path.to_string_lossy().into_owned());
    let max_file_size = max_file_size.to_string();
    let size_template = format!("video:{SIZE_PREFIX}%(filesize,filesize_approx)s");

    #[rustfmt::skip]
    let mut args = vec![
        "--no-playlist",
        "--no-warnings",
        "--no-progress",
        "--restrict-filenames",

        "--output",
        output_template.as_str(),

        "--max-filesize",
        max_file_size.as_str(),

        // `--print` implies `--simulate` in some combinations
        "--no-simulate",

        // The size of the selected format. If `--max-filesize` rejects the
        // file, this is the only trace of the reason left in the output.
        "--print",
        size_template.as_str(),

        // The final paths of the files after all post-processing
        "--print",
        "after_move:filepath",
    ];

    if options.audio_only {
        args.extend(["--format", "bestaudio/best", "--extract-audio"]);
    } else {
        // Telegram plays mp4 inline, so prefer it when there is a choice
        args.extend([
            "--format",
            "bestvideo*+bestaudio/best",
            "--format-sort",
            "ext:mp4:m4a",
            "--merge-output-format",
            "mp4",
        ]);
    }

    if let Some(cookies) = &cookies {
        args.extend(["--cookies", cookies.as_str()]);
    }

    args.push(url.as_str());

    process::run_utf8(PROGRAM, &args, timeout).await
}

/// Every line of the `after_move:filepath` print is a path of a file.
/// Lines that don't point into the download directory are noise.
///
/// Sizes above `max_file_size` are remembered, so that the caller can tell
/// a rejected file from a link without media.
pub(super) fn parse_download_output(stdout: &str, dir: &Path, max_file_size: u64) -> ToolOutput {
    let mut output = ToolOutput::default();

    for line in stdout.lines().map(str::trim).filter(|line| !line.is_empty()) {
        if let Some(size) = line.strip_prefix(SIZE_PREFIX) {
            // "NA" when the size is unknown
            if let Ok(size) = size.parse::<u64>() {
                if size > max_file_size {
                    output.skip_too_large(size);
                }
            }
            continue;
        }

        let rejected = regex!(r"larger than max-filesize \((\d+) bytes > \d+ bytes\)");
        if let Some(caps) = rejected.captures(line) {
            if let Ok(size) = caps[1].parse() {
                output.skip_too_large(size);
            }
            continue;
        }

        let path = PathBuf::from(line);
        if path.starts_with(dir) && !output.files.contains(&path) {
            output.files.push(path);
        }
    }

    output
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::util::retry::RetryPolicy;
    use expect_test::expect;

    #[test]
    fn parses_after_move_prints() {
        let stdout = "\
            /tmp/mediarelay/abc/dQw4w9WgXcQ.mp4\n\
            \n\
            [download] Some stray progress line\n\
            /elsewhere/file.mp4\n\
            /tmp/mediarelay/abc/dQw4w9WgXcQ.mp4\n\
            /tmp/mediarelay/abc/second.m4a\r\n";

        let output = parse_download_output(stdout, Path::new("/tmp/mediarelay/abc"), 1000);

        expect![[r#"
            [
                "/tmp/mediarelay/abc/dQw4w9WgXcQ.mp4",
                "/tmp/mediarelay/abc/second.m4a",
            ]
        "#]]
        .assert_debug_eq(&output.files);
        assert_eq!(output.smallest_too_large, None);
    }

    #[test]
    fn rejected_sizes_are_reported() {
        let dir = Path::new("/tmp/mediarelay/abc");

        // The format was rejected by `--max-filesize`, no file was moved
        let output = parse_download_output("size:73400320\n", dir, 52428800);
        assert!(output.files.is_empty());
        assert_eq!(output.smallest_too_large, Some(73400320));

        let stdout = "\
            [download] File is larger than max-filesize (90000000 bytes > 52428800 bytes). Aborting.\n\
            size:NA\n\
            size:1024\n\
            /tmp/mediarelay/abc/small.jpg\n";

        let output = parse_download_output(stdout, dir, 52428800);
        assert_eq!(output.files, [dir.join("small.jpg")]);
        assert_eq!(output.smallest_too_large, Some(90000000));
    }

    #[test]
    fn no_media_detection() {
        assert!(has_no_media(
            "ERROR: [generic] Unsupported URL: https://imgur.com/gallery/abc"
        ));
        assert!(has_no_media(
            "ERROR: [twitter] 123: No video could be found in this tweet"
        ));
        assert!(!has_no_media("ERROR: HTTP Error 503: Service Unavailable"));
    }

    #[test]
    fn transient_markers_match_typical_stderr() {
        let policy = RetryPolicy::named("test").retryable_errors(transient_markers());

        let messages = [
            "ERROR: Unable to download webpage: <urlopen error [Errno 104] Connection reset by peer>",
            "ERROR: unable to download video data: HTTP Error 503: Service Unavailable",
            "ERROR: HTTP Error 429: Too Many Requests",
            "ERROR: Read timed out.",
            "ERROR: [youtube] abc: Private video. Sign in if you've been granted access",
            "ERROR: HTTP Error 404: Not Found",
        ];

        let actual = messages.map(|message| {
            let retryable = policy
                .retryable_errors
                .iter()
                .any(|pattern| pattern.is_match(message));
            format!("{retryable}: {message}")
        });

        expect![[r#"
            [
                "true: ERROR: Unable to download webpage: <urlopen error [Errno 104] Connection reset by peer>",
                "true: ERROR: unable to download video data: HTTP Error 503: Service Unavailable",
                "true: ERROR: HTTP Error 429: Too Many Requests",
                "true: ERROR: Read timed out.",
                "false: ERROR: [youtube] abc: Private video. Sign in if you've been granted access",
                "false: ERROR: HTTP Error 404: Not Found",
            ]
        "#]]
        .assert_debug_eq(&actual);
    }
}
