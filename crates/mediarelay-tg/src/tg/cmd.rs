use crate::prelude::*;
use crate::tg;
use crate::util::DynResult;
use std::sync::Arc;
use teloxide::prelude::*;
use teloxide::types::User;
use teloxide::utils::command::BotCommands;

#[derive(BotCommands, Clone, Debug)]
#[command(
    rename_rule = "lowercase",
    description = "The following commands are available:"
)]
pub(crate) enum Cmd {
    #[command(description = "display this text")]
    Help,

    // Sent by Telegram when the user opens the chat with the bot for the
    // first time. It's not worth a line in the help message.
    #[command(hide)]
    Start,
}

#[instrument(skip_all, fields(
    sender = msg.from.as_ref().map(User::debug_id).as_deref(),
    chat = %msg.chat.debug_id(),
    ?cmd,
))]
pub(crate) async fn handle(ctx: Arc<tg::Ctx>, msg: Message, cmd: Cmd) -> DynResult {
    debug!("Processing command");

    match cmd {
        Cmd::Help | Cmd::Start => {
            let footer = usage(&ctx.media.config().supported_domains);
            ctx.bot.reply_help_md_escaped::<Cmd>(&msg, &footer).await?;
        }
    }

    Ok(())
}

fn usage(domains: &[String]) -> String {
    let domains = domains
        .iter()
        .map(|domain| format!("- {domain}"))
        .collect::<Vec<_>>()
        .join("\n");

    format!(
        "Send me a link to a post or a video from any of the following sites, \
        and I'll reply with the media from it:\n{domains}"
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use expect_test::expect;

    #[test]
    fn usage_lists_domains() {
        let domains = ["youtube.com", "x.com"].map(ToOwned::to_owned);

        expect![[r#"
            Send me a link to a post or a video from any of the following sites, and I'll reply with the media from it:
            - youtube.com
            - x.com"#]]
        .assert_eq(&usage(&domains));
    }
}
