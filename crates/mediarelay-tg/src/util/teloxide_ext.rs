use easy_ext::ext;
use teloxide::payloads::setters::*;
use teloxide::requests::Requester;
use teloxide::types::{Chat, Message, ReplyParameters, User};
use teloxide::utils::markdown;

pub(crate) mod prelude {
    pub(crate) use super::{ChatExt as _, MessageExt as _, UserExt as _, UtilRequesterExt as _};
}

#[ext(UserExt)]
pub(crate) impl User {
    fn username(&self) -> String {
        self.username.clone().unwrap_or_else(|| self.full_name())
    }

    fn debug_id(&self) -> String {
        format!("{} ({})", self.username(), self.id)
    }
}

#[ext(ChatExt)]
pub(crate) impl Chat {
    fn debug_id(&self) -> String {
        let title = self
            .title()
            .or_else(|| self.username())
            .unwrap_or("{private}");

        format!("{title} ({})", self.id)
    }
}

#[ext(MessageExt)]
pub(crate) impl Message {
    /// Media links may come in plain text messages as well as in captions
    /// of the forwarded media.
    fn text_or_caption(&self) -> Option<&str> {
        self.text().or_else(|| self.caption())
    }
}

/// There is [`teloxide::prelude::RequesterExt`]. We name this symbol
/// different to avoid collisions.
#[ext(UtilRequesterExt)]
pub(crate) impl<T: Requester> T {
    /// Sends a text reply to the given message. The reply is still sent
    /// if the original message was deleted in the meantime.
    fn reply(&self, msg: &Message, text: impl Into<String>) -> Self::SendMessage {
        self.send_message(msg.chat.id, text)
            .reply_parameters(reply_to(msg))
    }

    fn reply_help_md_escaped<Cmd: teloxide::utils::command::BotCommands>(
        &self,
        msg: &Message,
        footer: &str,
    ) -> Self::SendMessage {
        let text = format!("{}\n\n{footer}", Cmd::descriptions());
        self.reply(msg, markdown::escape(&text))
    }
}

pub(crate) fn reply_to(msg: &Message) -> ReplyParameters {
    ReplyParameters::new(msg.id).allow_sending_without_reply()
}
