//! Handling of the messages that contain links to media.

use crate::media::{self, DownloadOptions, DownloadOutcome, MediaError};
use crate::observability::metrics::MESSAGE_DURATION_SECONDS;
use crate::rate_limit::RateLimiter;
use crate::prelude::*;
use crate::tg::keepalive::KeepAlive;
use crate::tg::reply;
use crate::util::display::human_duration;
use crate::util::url::extract_urls;
use crate::util::DynResult;
use crate::{tg, Error, ErrorKind, Result};
use itertools::Itertools;
use std::sync::Arc;
use std::time::{Duration, Instant};
use teloxide::prelude::*;
use teloxide::types::{ChatAction, ChatId, User, UserId};
use teloxide::utils::markdown;
use url::Url;

/// Links beyond this number in a single message are ignored
pub(crate) const MAX_URLS_PER_MESSAGE: usize = 3;

/// Sites that host only audio. Links to them are sent as voice messages.
const AUDIO_DOMAINS: &[&str] = &["soundcloud.com"];

#[derive(Debug, thiserror::Error)]
pub(crate) enum DispatchError {
    #[error(
        "You are sending too many requests. Please wait {} before trying again",
        human_duration(*remaining)
    )]
    RateLimited { remaining: Duration },
}

/// The key of the rate limiter. Messages sent on behalf of channels
/// have no user, so they are limited per chat.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub(crate) enum Identity {
    User(UserId),
    Chat(ChatId),
}

impl Identity {
    fn of(msg: &Message) -> Self {
        msg.from
            .as_ref()
            .map(|user| Self::User(user.id))
            .unwrap_or(Self::Chat(msg.chat.id))
    }
}

/// Supported links found in the message
#[derive(Debug, Clone)]
pub(crate) struct MediaLinks(Vec<Url>);

pub(crate) fn filter_media_links(ctx: Arc<tg::Ctx>, msg: Message) -> Option<MediaLinks> {
    let text = msg.text_or_caption()?;
    let links = supported_links(text, ctx.media.config());
    (!links.is_empty()).then_some(MediaLinks(links))
}

fn supported_links(text: &str, cfg: &media::Config) -> Vec<Url> {
    let mut links = extract_urls(text)
        .into_iter()
        .filter(|url| cfg.is_supported(url))
        .unique()
        .collect::<Vec<_>>();

    if links.len() > MAX_URLS_PER_MESSAGE {
        debug!(
            total = links.len(),
            max = MAX_URLS_PER_MESSAGE,
            "Ignoring the links over the limit"
        );
        links.truncate(MAX_URLS_PER_MESSAGE);
    }

    links
}

pub(crate) async fn handle(ctx: Arc<tg::Ctx>, msg: Message, links: MediaLinks) -> DynResult {
    let span = info_span!(
        "handle_message",
        sender = msg.from.as_ref().map(User::debug_id).as_deref(),
        chat = %msg.chat.debug_id(),
        links = links.0.len(),
    );

    async {
        let start = Instant::now();
        let result = handle_links(&ctx, &msg, &links.0).await;

        let label = match &result {
            Ok(()) => "ok",
            Err(err) if err.is_user_error() => "user_error",
            Err(_) => "err",
        };

        metrics::histogram!(
            MESSAGE_DURATION_SECONDS,
            start.elapsed().as_secs_f64(),
            "result" => label
        );

        if let Err(err) = &result {
            reply_with_error(&ctx, &msg, err).await;
        }

        result.map_err(Into::into)
    }
    .instrument(span)
    .await
}

/// Checks the limit once per message and counts only the admitted messages
fn admit(limiter: &RateLimiter<Identity>, identity: &Identity) -> Result<(), DispatchError> {
    if !limiter.can_make_request(identity) {
        let remaining = limiter.cooldown_remaining(identity).unwrap_or_default();
        return Err(DispatchError::RateLimited { remaining });
    }

    limiter.record_request(identity);

    Ok(())
}

async fn handle_links(ctx: &tg::Ctx, msg: &Message, links: &[Url]) -> Result {
    admit(&ctx.rate_limiter, &Identity::of(msg))?;

    // Links are processed one by one, and a failure of one of them
    // doesn't prevent the rest from being processed
    let mut last_err = None;

    for url in links {
        if let Err(err) = handle_link(ctx, msg, url).await {
            if !err.is_user_error() {
                warn!(%url, err = tracing_err(&err), "Failed to process the link");
            }
            if links.len() > 1 {
                reply_with_error(ctx, msg, &err).await;
            }
            last_err = Some(err);
        }
    }

    match last_err {
        // The error was already reported for every link
        Some(err) if links.len() > 1 => {
            debug!(err = tracing_err(&err), "Some of the links failed");
            Ok(())
        }
        Some(err) => Err(err),
        None => Ok(()),
    }
}

#[instrument(skip_all, fields(%url))]
async fn handle_link(ctx: &tg::Ctx, msg: &Message, url: &Url) -> Result {
    let dir = ctx.media.create_request_dir().await?;

    let result = download_and_reply(ctx, msg, url, dir.path()).await;

    dir.cleanup().await;

    result
}

async fn download_and_reply(
    ctx: &tg::Ctx,
    msg: &Message,
    url: &Url,
    dir: &std::path::Path,
) -> Result {
    let audio_only = AUDIO_DOMAINS.iter().any(|domain| url.matches_domain(domain));
    let action = if audio_only {
        ChatAction::RecordVoice
    } else {
        ChatAction::UploadVideo
    };

    let _keepalive = KeepAlive::chat_action(ctx.bot.clone(), msg.chat.id, action);

    let info = ctx.media.get_info(url).await;

    if let Some(info) = &info {
        if info.is_live {
            info!("The link points to a live stream, it may fail to download");
        }
        media::check_size(info, ctx.media.config().max_file_size())?;
    }

    let options = DownloadOptions { audio_only };

    let files = match ctx.media.download(url, dir, &options).await? {
        DownloadOutcome::Success { files } => files,
        DownloadOutcome::Failure(failure) => return Err(MediaError::from(failure).into()),
    };

    info!(files = files.len(), "Downloaded media, sending the reply");

    reply::send_files(ctx, msg, info.as_ref(), files).await
}

async fn reply_with_error(ctx: &tg::Ctx, msg: &Message, err: &Error) {
    let text = error_reply_text(err);

    if let Err(err) = ctx.bot.reply(msg, text).await {
        warn!(
            err = tracing_err(&err),
            "Failed to reply with the error message to the user"
        );
    }
}

/// Markdown-escaped message that names the category of the failure
fn error_reply_text(err: &Error) -> String {
    match err.kind() {
        ErrorKind::Dispatch { source } => markdown::escape(&format!("⏳ {source}")),
        ErrorKind::Media { source } if source.is_user_error() => {
            markdown::escape(&format!("⚠️ {source}"))
        }
        _ => format!(
            "{} {}",
            markdown::escape("❌ Failed to process the link. Error id:"),
            markdown::code_inline(err.id()),
        ),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use expect_test::expect;

    fn config() -> media::Config {
        serde_json::from_value(serde_json::json!({})).unwrap()
    }

    #[test]
    fn only_supported_links_are_selected() {
        let text = "\
            look https://evilyoutube.com/watch?v=1 and https://www.youtube.com/watch?v=2, \
            also (https://x.com/user/status/3) https://fox.com/4 https://www.youtube.com/watch?v=2 \
            https://imgur.com/a/5 https://vimeo.com/6";

        let actual = supported_links(text, &config())
            .iter()
            .map(Url::to_string)
            .collect::<Vec<_>>();

        expect![[r#"
            [
                "https://www.youtube.com/watch?v=2",
                "https://x.com/user/status/3",
                "https://imgur.com/a/5",
            ]
        "#]]
        .assert_debug_eq(&actual);
    }

    #[test]
    fn no_links() {
        assert!(supported_links("just text, no links", &config()).is_empty());
        assert!(supported_links("https://netflix.com/title/1", &config()).is_empty());
    }

    #[test_log::test(tokio::test(start_paused = true))]
    async fn messages_over_the_limit_are_rejected_until_the_cooldown_ends() {
        let limiter = RateLimiter::with_limits(2, Duration::from_secs(90));
        let user = Identity::User(UserId(1));
        let other = Identity::Chat(ChatId(-100));

        admit(&limiter, &user).unwrap();
        admit(&limiter, &user).unwrap();

        let remaining = |result: Result<(), DispatchError>| match result {
            Err(DispatchError::RateLimited { remaining }) => remaining,
            Ok(()) => panic!("Expected the message to be rejected"),
        };

        assert_eq!(remaining(admit(&limiter, &user)), Duration::from_secs(90));

        tokio::time::advance(Duration::from_secs(30)).await;

        // Still in the cooldown, the rejection doesn't restart it
        assert_eq!(remaining(admit(&limiter, &user)), Duration::from_secs(60));

        admit(&limiter, &other).unwrap();

        tokio::time::advance(Duration::from_secs(61)).await;

        // The cooldown is over and the window has rotated
        admit(&limiter, &user).unwrap();
        admit(&limiter, &user).unwrap();
        remaining(admit(&limiter, &user));
    }

    #[test]
    fn error_replies_name_the_category() {
        let rate_limited = Error::from(DispatchError::RateLimited {
            remaining: Duration::from_millis(42_100),
        });
        let too_large = Error::from(MediaError::TooLarge {
            actual: 60 * 1024 * 1024,
            max: 50 * 1024 * 1024,
        });
        let no_media = Error::from(MediaError::NoMedia);

        expect!["⏳ You are sending too many requests\\. Please wait 43s before trying again"]
            .assert_eq(&error_reply_text(&rate_limited));

        assert!(error_reply_text(&too_large).starts_with("⚠️ The file is too large: "));
        assert_eq!(
            error_reply_text(&no_media),
            "⚠️ Couldn't find any media by the link"
        );

        let tool = Error::from(MediaError::Tool {
            message: "boom".to_owned(),
        });

        let text = error_reply_text(&tool);
        assert!(text.starts_with("❌ Failed to process the link\\. Error id: `"));
        assert!(text.ends_with(&format!("{}`", tool.id())));
    }
}
