//! Acquisition of media behind links with external extraction tools.

mod cookies;
mod gallery_dl;
mod model;
mod ytdlp;

pub(crate) use cookies::CookieJar;
pub(crate) use model::*;

use crate::error::IoError;
use crate::observability::metrics::MEDIA_DOWNLOADS_TOTAL;
use crate::prelude::*;
use crate::util::display::human_size;
use crate::util::process::ProcessError;
use crate::util::retry::{with_retry, RetryPolicy};
use crate::{err_ctx, ErrorKind, Result};
use serde::Deserialize;
use serde_with::serde_as;
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::time::Duration;
use url::Url;

const BYTES_IN_MB: u64 = 1024 * 1024;

#[serde_as]
#[derive(Deserialize, Clone, Debug)]
pub(crate) struct Config {
    /// Files larger than this are not sent. Telegram itself doesn't allow
    /// bots to upload more than 50 MB.
    #[serde(default = "default_max_file_size_mb")]
    pub(crate) max_file_size_mb: u64,

    /// Wall-clock limit for every invocation of an external program
    #[serde(default = "default_timeout_secs")]
    pub(crate) timeout_secs: u64,

    /// Root for the per-request temporary directories
    #[serde(default = "default_temp_dir")]
    pub(crate) temp_dir: PathBuf,

    #[serde(default = "default_supported_domains")]
    pub(crate) supported_domains: Vec<String>,

    /// Cookie files keyed by host, parent domain or site alias
    #[serde_as(as = "serde_with::json::JsonString")]
    #[serde(default)]
    pub(crate) cookies: HashMap<String, PathBuf>,

    pub(crate) default_cookies: Option<PathBuf>,
}

fn default_max_file_size_mb() -> u64 {
    50
}

fn default_timeout_secs() -> u64 {
    300
}

fn default_temp_dir() -> PathBuf {
    std::env::temp_dir().join("mediarelay")
}

fn default_supported_domains() -> Vec<String> {
    [
        "youtube.com",
        "youtu.be",
        "twitter.com",
        "x.com",
        "instagram.com",
        "tiktok.com",
        "reddit.com",
        "vimeo.com",
        "soundcloud.com",
        "pinterest.com",
        "imgur.com",
    ]
    .map(ToOwned::to_owned)
    .into()
}

impl Config {
    pub(crate) fn max_file_size(&self) -> u64 {
        self.max_file_size_mb.saturating_mul(BYTES_IN_MB)
    }

    pub(crate) fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs)
    }

    pub(crate) fn is_supported(&self, url: &Url) -> bool {
        self.supported_domains
            .iter()
            .any(|domain| url.matches_domain(domain))
    }
}

#[derive(Debug, thiserror::Error)]
pub(crate) enum MediaError {
    #[error(
        "The file is too large: {}, but the limit is {}",
        human_size(*actual),
        human_size(*max)
    )]
    TooLarge { actual: u64, max: u64 },

    #[error("Couldn't find any media by the link")]
    NoMedia,

    #[error("The media extraction tool failed: {message}")]
    Tool { message: String },
}

impl MediaError {
    pub(crate) fn is_user_error(&self) -> bool {
        match self {
            Self::TooLarge { .. } | Self::NoMedia => true,
            Self::Tool { .. } => false,
        }
    }
}

impl From<DownloadFailure> for MediaError {
    fn from(failure: DownloadFailure) -> Self {
        match failure {
            DownloadFailure::TooLarge { actual, max } => Self::TooLarge { actual, max },
            DownloadFailure::NoFiles => Self::NoMedia,
            DownloadFailure::Tool { message } => Self::Tool { message },
        }
    }
}

/// Files reported by an extraction tool
#[derive(Debug, Default)]
struct ToolOutput {
    files: Vec<PathBuf>,

    /// The tool refused to download some files because of the size limit
    smallest_too_large: Option<u64>,
}

impl ToolOutput {
    fn skip_too_large(&mut self, size: u64) {
        self.smallest_too_large = Some(self.smallest_too_large.map_or(size, |min| min.min(size)));
    }
}

/// Scratch space for a single request. All files of the request live here
/// and are removed together with the directory.
pub(crate) struct RequestDir {
    dir: tempfile::TempDir,
}

impl RequestDir {
    pub(crate) fn path(&self) -> &Path {
        self.dir.path()
    }

    /// Removes the directory on the blocking thread pool. Failures are only
    /// logged, there is nothing the user can do about them.
    pub(crate) async fn cleanup(self) {
        let path = self.dir.path().to_owned();
        let result = tokio::task::spawn_blocking(move || self.dir.close())
            .await
            .map_err(std::io::Error::from)
            .and_then(|result| result);

        if let Err(err) = result {
            warn!(
                path = %path.display(),
                err = tracing_err(&err),
                "Failed to remove the request directory"
            );
        }
    }
}

pub(crate) struct Client {
    cfg: Config,
    cookies: CookieJar,
    info_policy: RetryPolicy,
    download_policy: RetryPolicy,
}

impl Client {
    pub(crate) fn new(cfg: Config) -> Self {
        let cookies = CookieJar::new(cfg.cookies.clone(), cfg.default_cookies.clone());

        let info_policy = RetryPolicy::named("media_info")
            .max_attempts(3)
            .delays(Duration::from_secs(1), Duration::from_secs(5))
            .retryable_errors(ytdlp::transient_markers());

        let download_policy = RetryPolicy::named("media_download")
            .max_attempts(2)
            .delays(Duration::from_secs(2), Duration::from_secs(10))
            .retryable_errors(ytdlp::transient_markers());

        Self {
            cfg,
            cookies,
            info_policy,
            download_policy,
        }
    }

    pub(crate) fn config(&self) -> &Config {
        &self.cfg
    }

    /// Creates a directory with a unique name under the configured root
    pub(crate) async fn create_request_dir(&self) -> Result<RequestDir> {
        let root = &self.cfg.temp_dir;

        fs_err::tokio::create_dir_all(root).await?;

        let dir = tempfile::Builder::new()
            .prefix(&nanoid::nanoid!())
            .rand_bytes(0)
            .tempdir_in(root)
            .map_err(err_ctx!(IoError::CreateTempDir { path: root.clone() }))?;

        Ok(RequestDir { dir })
    }

    /// Returns [`None`] if the metadata couldn't be fetched even after
    /// retries. The reason is logged.
    #[instrument(skip_all, fields(%url))]
    pub(crate) async fn get_info(&self, url: &Url) -> Option<MediaInfo> {
        let cookies = self.cookies_for(url);
        let timeout = self.cfg.timeout();

        let result = with_retry(&self.info_policy, || {
            ytdlp::fetch_info(url, cookies, timeout)
        })
        .with_duration_log("Fetching media info")
        .await;

        match result {
            Ok(info) => {
                info!(
                    id = info.id.as_deref(),
                    extractor = info.extractor.as_deref(),
                    duration = info.duration.map(tracing_duration),
                    size = info.size.map(human_size).as_deref(),
                    is_live = info.is_live,
                    "Fetched media info"
                );
                Some(info)
            }
            Err(err) => {
                warn!(err = tracing_err(&err), "Failed to fetch media info");
                None
            }
        }
    }

    /// Downloads the media into `dir`. The expected failures are reported
    /// via [`DownloadOutcome::Failure`], and [`Err`] is returned only when
    /// something is wrong with the local environment.
    #[instrument(skip_all, fields(%url, audio_only = options.audio_only))]
    pub(crate) async fn download(
        &self,
        url: &Url,
        dir: &Path,
        options: &DownloadOptions,
    ) -> Result<DownloadOutcome> {
        let outcome = match self.download_with_ytdlp(url, dir, options).await {
            Ok(output) => self.collect_files(output).await?,
            Err(err) if is_no_media(&err) && !options.audio_only => {
                info!("yt-dlp found no media, falling back to gallery-dl");
                match self.download_with_gallery_dl(url, dir).await {
                    Ok(output) => self.collect_files(output).await?,
                    Err(err) => tool_failure(&err),
                }
            }
            Err(err) => tool_failure(&err),
        };

        let label = match &outcome {
            DownloadOutcome::Success { .. } => "ok",
            DownloadOutcome::Failure(failure) => failure.metric_label(),
        };

        metrics::increment_counter!(MEDIA_DOWNLOADS_TOTAL, "outcome" => label);

        Ok(outcome)
    }

    async fn download_with_ytdlp(
        &self,
        url: &Url,
        dir: &Path,
        options: &DownloadOptions,
    ) -> Result<ToolOutput> {
        let cookies = self.cookies_for(url);
        let max_file_size = self.cfg.max_file_size();
        let timeout = self.cfg.timeout();

        let stdout = with_retry(&self.download_policy, || {
            ytdlp::download(url, dir, options, cookies, max_file_size, timeout)
        })
        .with_duration_log("Downloading with yt-dlp")
        .await?;

        Ok(ytdlp::parse_download_output(&stdout, dir, max_file_size))
    }

    async fn download_with_gallery_dl(&self, url: &Url, dir: &Path) -> Result<ToolOutput> {
        let cookies = self.cookies_for(url);
        let max_file_size = self.cfg.max_file_size();
        let timeout = self.cfg.timeout();

        let stdout = with_retry(&self.download_policy, || {
            gallery_dl::download(url, dir, cookies, max_file_size, timeout)
        })
        .with_duration_log("Downloading with gallery-dl")
        .await?;

        Ok(ToolOutput {
            files: gallery_dl::parse_downloaded_files(&stdout, dir),
            smallest_too_large: None,
        })
    }

    /// Keeps only the files that exist and fit into the size limit
    async fn collect_files(&self, mut output: ToolOutput) -> Result<DownloadOutcome> {
        let max = self.cfg.max_file_size();
        let mut files = Vec::with_capacity(output.files.len());

        for path in std::mem::take(&mut output.files) {
            let metadata = match fs_err::tokio::metadata(&path).await {
                Ok(metadata) if metadata.is_file() => metadata,
                Ok(_) => continue,
                Err(err) if err.kind() == std::io::ErrorKind::NotFound => {
                    debug!(path = %path.display(), "Skipping a path that doesn't exist");
                    continue;
                }
                Err(err) => return Err(err.into()),
            };

            let size = metadata.len();

            if size > max {
                warn!(
                    path = %path.display(),
                    size = %human_size(size),
                    "Skipping a file that is too large"
                );
                output.skip_too_large(size);
                continue;
            }

            files.push(MediaFile {
                kind: MediaKind::from_path(&path),
                path,
                size,
            });
        }

        if !files.is_empty() {
            return Ok(DownloadOutcome::Success { files });
        }

        let failure = match output.smallest_too_large {
            Some(actual) => DownloadFailure::TooLarge { actual, max },
            None => DownloadFailure::NoFiles,
        };

        Ok(DownloadOutcome::Failure(failure))
    }

    fn cookies_for(&self, url: &Url) -> Option<&Path> {
        let path = self.cookies.select(url.host_str()?)?;

        if !path.exists() {
            warn!(path = %path.display(), "Configured cookie file doesn't exist");
            return None;
        }

        Some(path)
    }
}

fn process_error(err: &crate::Error) -> Option<&ProcessError> {
    match err.kind() {
        ErrorKind::Process { source } => Some(source),
        _ => None,
    }
}

fn is_no_media(err: &crate::Error) -> bool {
    process_error(err)
        .and_then(ProcessError::stderr)
        .is_some_and(ytdlp::has_no_media)
}

fn tool_failure(err: &crate::Error) -> DownloadOutcome {
    warn!(err = tracing_err(err), "Media download failed");

    let message = process_error(err)
        .and_then(ProcessError::stderr)
        .and_then(|stderr| stderr.lines().rev().find(|line| !line.trim().is_empty()))
        .map(ToOwned::to_owned)
        .unwrap_or_else(|| err.to_string());

    DownloadOutcome::Failure(DownloadFailure::Tool { message })
}

/// Size check before the download based on the metadata
pub(crate) fn check_size(info: &MediaInfo, max: u64) -> Result<(), MediaError> {
    match info.size {
        Some(actual) if actual > max => Err(MediaError::TooLarge { actual, max }),
        _ => Ok(()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use expect_test::expect;

    fn config() -> Config {
        serde_json::from_value(serde_json::json!({
            "cookies": r#"{ "youtube": "/cookies/yt.txt" }"#,
        }))
        .unwrap()
    }

    #[test]
    fn config_defaults() {
        let cfg = config();

        assert_eq!(cfg.max_file_size(), 50 * 1024 * 1024);
        assert_eq!(cfg.timeout(), Duration::from_secs(300));
        assert_eq!(cfg.default_cookies, None);
        assert_eq!(cfg.cookies["youtube"], Path::new("/cookies/yt.txt"));
        assert_eq!(cfg.supported_domains.len(), 11);
    }

    #[test]
    fn supported_links() {
        let cfg = config();

        let actual = [
            "https://www.youtube.com/watch?v=dQw4w9WgXcQ",
            "https://youtu.be/dQw4w9WgXcQ",
            "https://X.com/user/status/1",
            "https://evilyoutube.com/watch",
            "https://fox.com/video",
            "https://netflix.com/title/1",
            "https://old.reddit.com/r/rust",
        ]
        .map(|url| {
            let url = Url::parse(url).unwrap();
            format!("{}: {url}", cfg.is_supported(&url))
        });

        expect![[r#"
            [
                "true: https://www.youtube.com/watch?v=dQw4w9WgXcQ",
                "true: https://youtu.be/dQw4w9WgXcQ",
                "true: https://x.com/user/status/1",
                "false: https://evilyoutube.com/watch",
                "false: https://fox.com/video",
                "false: https://netflix.com/title/1",
                "true: https://old.reddit.com/r/rust",
            ]
        "#]]
        .assert_debug_eq(&actual);
    }

    #[test]
    fn size_pre_check() {
        let info = |size| MediaInfo {
            id: None,
            title: None,
            uploader: None,
            duration: None,
            size,
            extractor: None,
            is_live: false,
        };

        assert!(check_size(&info(None), 10).is_ok());
        assert!(check_size(&info(Some(10)), 10).is_ok());
        assert!(matches!(
            check_size(&info(Some(11)), 10),
            Err(MediaError::TooLarge {
                actual: 11,
                max: 10
            })
        ));
    }

    #[tokio::test]
    async fn request_dirs_are_unique_and_removed() {
        let root = std::env::temp_dir().join(format!("mediarelay-test-{}", nanoid::nanoid!()));
        let client = Client::new(Config {
            temp_dir: root.clone(),
            ..config()
        });

        let first = client.create_request_dir().await.unwrap();
        let second = client.create_request_dir().await.unwrap();

        assert_ne!(first.path(), second.path());
        assert!(first.path().starts_with(&root));

        let first_path = first.path().to_owned();
        std::fs::write(first_path.join("video.mp4"), b"data").unwrap();

        first.cleanup().await;
        second.cleanup().await;

        assert!(!first_path.exists());
        std::fs::remove_dir_all(root).unwrap();
    }

    #[tokio::test]
    async fn collected_files_respect_the_size_limit() {
        let client = Client::new(Config {
            temp_dir: std::env::temp_dir().join(format!("mediarelay-test-{}", nanoid::nanoid!())),
            max_file_size_mb: 1,
            ..config()
        });

        let dir = client.create_request_dir().await.unwrap();
        let small = dir.path().join("small.jpg");
        let large = dir.path().join("large.mp4");

        std::fs::write(&small, vec![0; 1024]).unwrap();
        std::fs::write(&large, vec![0; 2 * 1024 * 1024]).unwrap();

        let tool_output = |files: Vec<PathBuf>| ToolOutput {
            files,
            smallest_too_large: None,
        };

        let outcome = client
            .collect_files(tool_output(vec![
                small.clone(),
                large.clone(),
                dir.path().join("missing.png"),
            ]))
            .await
            .unwrap();

        let DownloadOutcome::Success { files } = outcome else {
            panic!("Expected success, got {outcome:?}");
        };

        assert_eq!(files.len(), 1);
        assert_eq!(files[0].path, small);
        assert_eq!(files[0].kind, MediaKind::Image);

        let outcome = client.collect_files(tool_output(vec![large])).await.unwrap();

        assert!(matches!(
            outcome,
            DownloadOutcome::Failure(DownloadFailure::TooLarge {
                actual: 2097152,
                max: 1048576
            })
        ));

        let outcome = client.collect_files(tool_output(vec![])).await.unwrap();

        assert!(matches!(
            outcome,
            DownloadOutcome::Failure(DownloadFailure::NoFiles)
        ));

        // Nothing was downloaded, because the tool rejected the file
        let outcome = client
            .collect_files(ToolOutput {
                files: vec![],
                smallest_too_large: Some(3 * 1024 * 1024),
            })
            .await
            .unwrap();

        assert!(matches!(
            outcome,
            DownloadOutcome::Failure(DownloadFailure::TooLarge {
                actual: 3145728,
                max: 1048576
            })
        ));

        let root = client.config().temp_dir.clone();
        dir.cleanup().await;
        std::fs::remove_dir_all(root).unwrap();
    }
}
