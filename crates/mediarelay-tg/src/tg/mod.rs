//! Telegram bot root module

mod cmd;
mod config;
mod dispatch;
mod keepalive;
mod reply;

use crate::observability::metrics::TG_UPDATES_TOTAL;
use crate::prelude::*;
use crate::rate_limit::RateLimiter;
use crate::{media, rate_limit, Result};
use dptree::di::DependencyMap;
use std::sync::Arc;
use teloxide::adaptors::{CacheMe, DefaultParseMode, Throttle, Trace};
use teloxide::prelude::*;
use teloxide::types::{ParseMode, UpdateKind};
use teloxide::utils::command::BotCommands;

pub(crate) use config::*;
pub(crate) use dispatch::DispatchError;

pub(crate) type Bot = Trace<CacheMe<DefaultParseMode<Throttle<teloxide::Bot>>>>;

pub(crate) struct Ctx {
    bot: Bot,
    media: media::Client,
    rate_limiter: RateLimiter<dispatch::Identity>,
}

pub(crate) struct RunBotOptions {
    pub(crate) tg_cfg: Config,
    pub(crate) media_cfg: media::Config,
    pub(crate) rate_limit_cfg: rate_limit::Config,
}

pub(crate) async fn run_bot(opts: RunBotOptions) -> Result {
    let mut di = DependencyMap::new();

    let bot: Bot = teloxide::Bot::new(opts.tg_cfg.token)
        .throttle(Default::default())
        .parse_mode(ParseMode::MarkdownV2)
        .cache_me()
        .trace(teloxide::adaptors::trace::Settings::TRACE_REQUESTS);

    di.insert(Arc::new(Ctx {
        bot: bot.clone(),
        media: media::Client::new(opts.media_cfg),
        rate_limiter: RateLimiter::new(&opts.rate_limit_cfg),
    }));

    info!("Starting bot...");

    bot.set_my_commands(cmd::Cmd::bot_commands()).await?;

    let handler = dptree::entry()
        .inspect(|update: Update| {
            metrics::increment_counter!(TG_UPDATES_TOTAL, "kind" => update_kind(&update.kind));
        })
        .branch(
            Update::filter_message()
                .filter_command::<cmd::Cmd>()
                .endpoint(cmd::handle),
        )
        .branch(
            Update::filter_message()
                .chain(dptree::filter_map(dispatch::filter_media_links))
                .endpoint(dispatch::handle),
        );

    Dispatcher::builder(bot, handler)
        .dependencies(di)
        // Most of the messages in group chats have nothing to do with the
        // bot, so to suppress the warning about them we have a noop
        // default handler here
        .default_handler(|_| std::future::ready(()))
        .enable_ctrlc_handler()
        .build()
        .dispatch()
        .await;

    info!("Bot stopped");

    Ok(())
}

fn update_kind(kind: &UpdateKind) -> &'static str {
    match kind {
        UpdateKind::Message(_) => "message",
        UpdateKind::EditedMessage(_) => "edited_message",
        UpdateKind::ChannelPost(_) => "channel_post",
        UpdateKind::MyChatMember(_) => "my_chat_member",
        _ => "other",
    }
}
