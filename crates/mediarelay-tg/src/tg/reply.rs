//! Uploading of the downloaded files as a reply to the original message.

use crate::media::{MediaError, MediaFile, MediaInfo, MediaKind};
use crate::prelude::*;
use crate::util::media_conv::{self, StreamMeta};
use crate::util::teloxide_ext::reply_to;
use crate::{fatal, tg, Result};
use std::path::Path;
use teloxide::prelude::*;
use teloxide::types::{InputFile, InputMedia, InputMediaPhoto, InputMediaVideo, ParseMode};
use teloxide::utils::markdown;

/// Telegram doesn't allow more items in a single media group
const MAX_MEDIA_GROUP_SIZE: usize = 10;

/// Limit of the caption length of a media message in Telegram is 1024
/// characters. The title is cut much earlier to leave room for escaping.
const MAX_TITLE_CHARS: usize = 200;

#[instrument(skip_all, fields(files = files.len()))]
pub(crate) async fn send_files(
    ctx: &tg::Ctx,
    msg: &Message,
    info: Option<&MediaInfo>,
    files: Vec<MediaFile>,
) -> Result {
    if files.is_empty() {
        return Err(fatal!("BUG: there are no files to send"));
    }

    let caption = info.and_then(caption);

    if let [file] = files.as_slice() {
        return send_single(ctx, msg, file, caption).await;
    }

    // Only photos and videos may be mixed in a single group
    let (groupable, rest): (Vec<_>, Vec<_>) = files
        .into_iter()
        .partition(|file| matches!(file.kind, MediaKind::Image | MediaKind::Video));

    let mut caption = caption;

    for chunk in groupable.chunks(MAX_MEDIA_GROUP_SIZE) {
        if let [file] = chunk {
            send_single(ctx, msg, file, caption.take()).await?;
            continue;
        }
        send_group(ctx, msg, chunk, caption.take()).await?;
    }

    for file in &rest {
        send_single(ctx, msg, file, caption.take()).await?;
    }

    Ok(())
}

async fn send_single(
    ctx: &tg::Ctx,
    msg: &Message,
    file: &MediaFile,
    caption: Option<String>,
) -> Result {
    let chat_id = msg.chat.id;
    let timeout = ctx.media.config().timeout();
    let max_file_size = ctx.media.config().max_file_size();

    debug!(path = %file.path.display(), kind = %file.kind, "Sending file");

    match file.kind {
        MediaKind::Video => {
            let video = if has_extension(&file.path, &["mp4"]) {
                file.path.clone()
            } else {
                let video = media_conv::to_streamable_mp4(&file.path, timeout).await?;
                ensure_fits(&video, max_file_size).await?;
                video
            };

            let meta = probe_or_default(&video, timeout).await;
            let mut request = ctx
                .bot
                .send_video(chat_id, InputFile::file(&video))
                .supports_streaming(true)
                .reply_parameters(reply_to(msg));

            if let Some(width) = meta.width {
                request = request.width(width);
            }
            if let Some(height) = meta.height {
                request = request.height(height);
            }
            if let Some(duration) = meta.duration {
                request = request.duration(duration_secs(duration));
            }
            if let Some(caption) = caption {
                request = request.caption(caption);
            }
            request.await?;
        }
        MediaKind::Image => {
            let mut request = ctx
                .bot
                .send_photo(chat_id, InputFile::file(&file.path))
                .reply_parameters(reply_to(msg));

            if let Some(caption) = caption {
                request = request.caption(caption);
            }
            request.await?;
        }
        MediaKind::Animation => {
            let mut request = ctx
                .bot
                .send_animation(chat_id, InputFile::file(&file.path))
                .reply_parameters(reply_to(msg));

            if let Some(caption) = caption {
                request = request.caption(caption);
            }
            request.await?;
        }
        MediaKind::Audio => {
            let voice = if has_extension(&file.path, &["ogg", "oga", "opus"]) {
                file.path.clone()
            } else {
                let voice = media_conv::to_voice_ogg(&file.path, timeout).await?;
                ensure_fits(&voice, max_file_size).await?;
                voice
            };

            let meta = probe_or_default(&voice, timeout).await;

            let mut request = ctx
                .bot
                .send_voice(chat_id, InputFile::file(&voice))
                .reply_parameters(reply_to(msg));

            if let Some(duration) = meta.duration {
                request = request.duration(duration_secs(duration));
            }
            if let Some(caption) = caption {
                request = request.caption(caption);
            }
            request.await?;
        }
        MediaKind::Document => {
            let mut request = ctx
                .bot
                .send_document(chat_id, InputFile::file(&file.path))
                .reply_parameters(reply_to(msg));

            if let Some(caption) = caption {
                request = request.caption(caption);
            }
            request.await?;
        }
    }

    Ok(())
}

async fn send_group(
    ctx: &tg::Ctx,
    msg: &Message,
    files: &[MediaFile],
    caption: Option<String>,
) -> Result {
    let mut media = Vec::with_capacity(files.len());

    // Telegram shows the caption of the first item as the caption of the group
    let mut caption = caption;

    for file in files {
        let input = InputFile::file(&file.path);
        let item = match file.kind {
            MediaKind::Video => {
                let mut video = InputMediaVideo::new(input)
                    .parse_mode(ParseMode::MarkdownV2)
                    .supports_streaming(true);

                if let Some(caption) = caption.take() {
                    video = video.caption(caption);
                }
                InputMedia::Video(video)
            }
            _ => {
                let mut photo = InputMediaPhoto::new(input).parse_mode(ParseMode::MarkdownV2);
                if let Some(caption) = caption.take() {
                    photo = photo.caption(caption);
                }
                InputMedia::Photo(photo)
            }
        };
        media.push(item);
    }

    ctx.bot
        .send_media_group(msg.chat.id, media)
        .reply_parameters(reply_to(msg))
        .await?;

    Ok(())
}

/// Dimensions are optional for Telegram, so a failure to get them is not
/// a reason to fail the reply.
async fn probe_or_default(path: &Path, timeout: std::time::Duration) -> StreamMeta {
    media_conv::probe(path, timeout)
        .await
        .unwrap_or_else(|err| {
            warn!(err = tracing_err(&err), "Failed to probe the media file");
            StreamMeta::default()
        })
}

/// Re-encoding may make the file larger than it was
async fn ensure_fits(path: &Path, max: u64) -> Result {
    let actual = fs_err::tokio::metadata(path).await?.len();
    if actual > max {
        return Err(MediaError::TooLarge { actual, max }.into());
    }
    Ok(())
}

fn duration_secs(duration: std::time::Duration) -> u32 {
    u32::try_from(duration.as_secs()).unwrap_or(u32::MAX)
}

fn has_extension(path: &Path, extensions: &[&str]) -> bool {
    path.extension()
        .and_then(|extension| extension.to_str())
        .is_some_and(|actual| {
            extensions
                .iter()
                .any(|expected| actual.eq_ignore_ascii_case(expected))
        })
}

/// Markdown-escaped title and uploader of the media
fn caption(info: &MediaInfo) -> Option<String> {
    let title = info.title.as_deref()?.trim();
    let title = truncate(title, MAX_TITLE_CHARS);
    let title = markdown::bold(&markdown::escape(&title));

    let Some(uploader) = info.uploader.as_deref().filter(|name| !name.trim().is_empty()) else {
        return Some(title);
    };

    let uploader = markdown::escape(&truncate(uploader.trim(), MAX_TITLE_CHARS));

    Some(format!("{title}\n{uploader}"))
}

fn truncate(text: &str, max_chars: usize) -> String {
    if text.chars().count() <= max_chars {
        return text.to_owned();
    }
    let mut truncated: String = text.chars().take(max_chars - 1).collect();
    truncated.push('…');
    truncated
}

#[cfg(test)]
mod tests {
    use super::*;
    use expect_test::expect;

    fn info(title: Option<&str>, uploader: Option<&str>) -> MediaInfo {
        MediaInfo {
            id: None,
            title: title.map(ToOwned::to_owned),
            uploader: uploader.map(ToOwned::to_owned),
            duration: None,
            size: None,
            extractor: None,
            is_live: false,
        }
    }

    #[test]
    fn captions_are_escaped() {
        let actual = [
            info(Some("Cats (2019) - best_of!"), Some("cat.lover")),
            info(Some("Title only"), Some("  ")),
            info(None, Some("Uploader without a title")),
        ]
        .map(|info| caption(&info));

        expect![[r#"
            [
                Some(
                    "*Cats \\(2019\\) \\- best\\_of\\!*\ncat\\.lover",
                ),
                Some(
                    "*Title only*",
                ),
                None,
            ]
        "#]]
        .assert_debug_eq(&actual);
    }

    #[test]
    fn long_titles_are_truncated() {
        let title = "a".repeat(MAX_TITLE_CHARS + 10);
        let truncated = truncate(&title, MAX_TITLE_CHARS);

        assert_eq!(truncated.chars().count(), MAX_TITLE_CHARS);
        assert!(truncated.ends_with('…'));
        assert_eq!(truncate("short", MAX_TITLE_CHARS), "short");
    }

    #[tokio::test]
    async fn converted_files_are_checked_against_the_limit() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("converted.mp4");
        std::fs::write(&path, vec![0; 2048]).unwrap();

        ensure_fits(&path, 2048).await.unwrap();

        let err = ensure_fits(&path, 1024).await.unwrap_err();
        assert!(err.is_user_error());
        assert!(matches!(
            err.kind(),
            crate::ErrorKind::Media {
                source: MediaError::TooLarge {
                    actual: 2048,
                    max: 1024
                }
            }
        ));
    }

    #[test]
    fn extension_detection() {
        let ogg = &["ogg", "oga", "opus"];
        assert!(has_extension(Path::new("/tmp/a/voice.OGG"), ogg));
        assert!(has_extension(Path::new("/tmp/a/voice.opus"), ogg));
        assert!(!has_extension(Path::new("/tmp/a/song.mp3"), ogg));
        assert!(!has_extension(Path::new("/tmp/a/ogg"), ogg));
    }
}
