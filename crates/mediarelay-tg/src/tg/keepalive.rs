//! Periodic chat actions ("typing...") for the time of a long operation.

use crate::prelude::*;
use crate::tg;
use crate::util::retry::{with_retry, RetryPolicy};
use futures::prelude::*;
use std::time::Duration;
use teloxide::prelude::*;
use teloxide::types::{ChatAction, ChatId};

/// Telegram displays a chat action for 5 seconds or until the next message
const CHAT_ACTION_PERIOD: Duration = Duration::from_secs(4);

/// Owns a background task that runs while the guard is alive.
/// Dropping the guard aborts the task.
#[must_use = "the task is aborted when the guard is dropped"]
pub(crate) struct KeepAlive {
    task: tokio::task::JoinHandle<()>,
}

impl KeepAlive {
    /// Repeatedly sends the chat action to the chat. Failures to send it
    /// are logged and don't stop the loop.
    pub(crate) fn chat_action(bot: tg::Bot, chat_id: ChatId, action: ChatAction) -> Self {
        let policy = RetryPolicy::named("chat_action")
            .max_attempts(2)
            .delays(Duration::from_millis(200), Duration::from_secs(1));

        Self::spawn_periodic(CHAT_ACTION_PERIOD, move || {
            let bot = bot.clone();
            let policy = policy.clone();
            async move {
                let result = with_retry(&policy, || bot.send_chat_action(chat_id, action).send())
                    .await;

                if let Err(err) = result {
                    warn!(err = tracing_err(&err), "Failed to send the chat action");
                }
            }
        })
    }

    /// Runs `tick` right away and then once per `period`
    pub(crate) fn spawn_periodic<F, Fut>(period: Duration, mut tick: F) -> Self
    where
        F: FnMut() -> Fut + Send + 'static,
        Fut: Future<Output = ()> + Send + 'static,
    {
        let task = async move {
            let mut interval = tokio::time::interval(period);
            interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                interval.tick().await;
                tick().await;
            }
        };

        Self {
            task: tokio::spawn(task.in_current_span()),
        }
    }
}

impl Drop for KeepAlive {
    fn drop(&mut self) {
        self.task.abort();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    #[test_log::test(tokio::test(start_paused = true))]
    async fn ticks_until_dropped() {
        let ticks = Arc::new(AtomicUsize::new(0));

        let guard = KeepAlive::spawn_periodic(Duration::from_secs(4), {
            let ticks = ticks.clone();
            move || {
                ticks.fetch_add(1, Ordering::SeqCst);
                future::ready(())
            }
        });

        // The first tick happens right away
        tokio::time::sleep(Duration::from_millis(1)).await;
        assert_eq!(ticks.load(Ordering::SeqCst), 1);

        tokio::time::sleep(Duration::from_secs(9)).await;
        assert_eq!(ticks.load(Ordering::SeqCst), 3);

        drop(guard);

        tokio::time::sleep(Duration::from_secs(60)).await;
        assert_eq!(ticks.load(Ordering::SeqCst), 3);
    }
}
