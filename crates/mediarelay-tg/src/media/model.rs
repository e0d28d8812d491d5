use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Metadata of the media behind a link as reported by `yt-dlp`
#[derive(Debug, Clone, PartialEq)]
pub(crate) struct MediaInfo {
    pub(crate) id: Option<String>,
    pub(crate) title: Option<String>,
    pub(crate) uploader: Option<String>,
    pub(crate) duration: Option<Duration>,

    /// Exact or approximate size of the file that would be downloaded
    pub(crate) size: Option<u64>,
    pub(crate) extractor: Option<String>,
    pub(crate) is_live: bool,
}

/// Subset of the fields of `yt-dlp --dump-single-json` that we care about
#[derive(Deserialize)]
pub(super) struct YtDlpInfo {
    id: Option<String>,
    title: Option<String>,
    uploader: Option<String>,
    duration: Option<f64>,
    filesize: Option<f64>,
    filesize_approx: Option<f64>,
    extractor_key: Option<String>,
    #[serde(default)]
    is_live: Option<bool>,
}

impl From<YtDlpInfo> for MediaInfo {
    fn from(info: YtDlpInfo) -> Self {
        // yt-dlp reports these numbers as floats for some extractors
        let size = info
            .filesize
            .or(info.filesize_approx)
            .filter(|size| size.is_finite() && *size >= 0.0)
            .map(|size| size as u64);

        Self {
            id: info.id,
            title: info.title.filter(|title| !title.trim().is_empty()),
            uploader: info.uploader,
            duration: info
                .duration
                .and_then(|secs| Duration::try_from_secs_f64(secs).ok()),
            size,
            extractor: info.extractor_key,
            is_live: info.is_live.unwrap_or(false),
        }
    }
}

#[derive(Debug, Clone, Default)]
pub(crate) struct DownloadOptions {
    /// Extract only the audio track. It is sent as a voice message.
    pub(crate) audio_only: bool,
}

/// Result of [`super::Client::download`]. The expected failures are
/// values, not errors, so that the caller can branch on them.
#[derive(Debug)]
pub(crate) enum DownloadOutcome {
    Success { files: Vec<MediaFile> },
    Failure(DownloadFailure),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) enum DownloadFailure {
    /// All downloaded files exceed the size limit
    TooLarge { actual: u64, max: u64 },

    /// The tool finished, but produced no files
    NoFiles,

    /// The tool failed, the message is suitable for logs only
    Tool { message: String },
}

impl DownloadFailure {
    pub(crate) fn metric_label(&self) -> &'static str {
        match self {
            Self::TooLarge { .. } => "too_large",
            Self::NoFiles => "no_files",
            Self::Tool { .. } => "tool_error",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) struct MediaFile {
    pub(crate) path: PathBuf,
    pub(crate) kind: MediaKind,
    pub(crate) size: u64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, strum::Display, strum::IntoStaticStr)]
pub(crate) enum MediaKind {
    Video,
    Image,
    Animation,
    Audio,
    Document,
}

impl MediaKind {
    pub(crate) fn from_path(path: &Path) -> Self {
        let extension = path
            .extension()
            .and_then(|extension| extension.to_str())
            .map(str::to_ascii_lowercase);

        match extension.as_deref() {
            Some("mp4" | "m4v" | "mov" | "webm" | "mkv") => Self::Video,
            Some("jpg" | "jpeg" | "png" | "webp") => Self::Image,
            Some("gif") => Self::Animation,
            Some("mp3" | "m4a" | "ogg" | "opus" | "oga" | "wav" | "flac" | "aac") => Self::Audio,
            _ => Self::Document,
        }
    }
}
