//! Fallback for image galleries and posts without video.

use crate::prelude::*;
use crate::util::process;
use crate::Result;
use std::path::{Path, PathBuf};
use std::time::Duration;
use url::Url;

const PROGRAM: &str = "gallery-dl";

/// `gallery-dl` prefixes the paths of the files that were already present
/// on disk with this marker instead of downloading them again.
const SKIPPED_PREFIX: &str = "# ";

#[instrument(skip_all, fields(%url, dir = %dir.display()))]
pub(super) async fn download(
    url: &Url,
    dir: &Path,
    cookies: Option<&Path>,
    max_file_size: u64,
    timeout: Duration,
) -> Result<String> {
    let dir_arg = dir.to_string_lossy().into_owned();
    let cookies = cookies.map(|path| path.to_string_lossy().into_owned());
    let max_file_size = max_file_size.to_string();

    #[rustfmt::skip]
    let mut args = vec![
        // Put all files directly into the dir without any nested structure
        "--directory",
        dir_arg.as_str(),

        "--filesize-max",
        max_file_size.as_str(),
    ];

    if let Some(cookies) = &cookies {
        args.extend(["--cookies", cookies.as_str()]);
    }

    args.push(url.as_str());

    process::run_utf8(PROGRAM, &args, timeout).await
}

/// One path per line, already present files are marked with a prefix
pub(super) fn parse_downloaded_files(stdout: &str, dir: &Path) -> Vec<PathBuf> {
    let mut files = Vec::new();

    for line in stdout.lines().map(str::trim_end) {
        let line = line.strip_prefix(SKIPPED_PREFIX).unwrap_or(line).trim();
        if line.is_empty() {
            continue;
        }

        let path = PathBuf::from(line);
        if path.starts_with(dir) && !files.contains(&path) {
            files.push(path);
        }
    }

    files
}

#[cfg(test)]
mod tests {
    use super::*;
    use expect_test::expect;

    #[test]
    fn parses_fresh_and_skipped_files() {
        let stdout = "\
            /tmp/mediarelay/xyz/imgur_abc_1.jpg\n\
            # /tmp/mediarelay/xyz/imgur_abc_2.png\n\
            \n\
            #\n\
            [imgur][warning] Some stray log line\n\
            /tmp/mediarelay/xyz/imgur_abc_3.gif\n";

        let files = parse_downloaded_files(stdout, Path::new("/tmp/mediarelay/xyz"));

        expect![[r#"
            [
                "/tmp/mediarelay/xyz/imgur_abc_1.jpg",
                "/tmp/mediarelay/xyz/imgur_abc_2.png",
                "/tmp/mediarelay/xyz/imgur_abc_3.gif",
            ]
        "#]]
        .assert_debug_eq(&files);
    }
}
