use anyhow::Result;
use async_trait::async_trait;
use serde_json::{Value, json};
use std::sync::Arc;
use teloxide::prelude::*;
use teloxide::types::{BotCommand, ChatAction};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::core::channel::{
    ChannelDefinition, ChannelEvent, ChannelSink, ConcurrencyPolicy, EventSender, ListenerHandle,
    StreamHandler,
};
use crate::core::config::OutputConfig;
use crate::core::output::{BufferSettings, OutputBuffer, Verbosity};
use crate::interfaces::split_message;

/// Telegram rejects messages longer than this.
const MESSAGE_LIMIT: usize = 4096;

pub fn session_key_for(chat_id: i64) -> String {
    format!("telegram:{}", chat_id)
}

fn is_allowed(allowed_chats: &[i64], chat_id: i64) -> bool {
    allowed_chats.is_empty() || allowed_chats.contains(&chat_id)
}

fn chat_id_from(payload: &Value) -> i64 {
    payload.get("chat_id").and_then(Value::as_i64).unwrap_or_default()
}

fn bot_commands() -> Vec<BotCommand> {
    vec![
        BotCommand::new("reset", "Start a new conversation"),
        BotCommand::new("stop", "Stop the running job"),
        BotCommand::new("status", "Show whether a job is running or queued"),
        BotCommand::new("style", "Show or set the reply style"),
        BotCommand::new("restart", "Restart the bridge"),
    ]
}

struct TelegramSink {
    bot: Bot,
    chat_id: ChatId,
}

#[async_trait]
impl ChannelSink for TelegramSink {
    async fn send(&self, text: &str) -> Result<()> {
        for piece in split_message(text, MESSAGE_LIMIT) {
            self.bot.send_message(self.chat_id, piece).await?;
        }
        Ok(())
    }

    fn has_working_indicator(&self) -> bool {
        true
    }

    async fn working(&self) {
        if let Err(e) = self.bot.send_chat_action(self.chat_id, ChatAction::Typing).await {
            debug!("[telegram] typing indicator failed for {}: {}", self.chat_id, e);
        }
    }
}

/// Long-polling bot. One session per chat.
pub struct TelegramChannel {
    bot: Bot,
    allowed_chats: Arc<Vec<i64>>,
    output: OutputConfig,
}

impl TelegramChannel {
    pub fn new(token: &str, allowed_chats: Vec<i64>, output: OutputConfig) -> Self {
        Self {
            bot: Bot::new(token),
            allowed_chats: Arc::new(allowed_chats),
            output,
        }
    }
}

#[async_trait]
impl ChannelDefinition for TelegramChannel {
    fn name(&self) -> &str {
        "telegram"
    }

    fn concurrency(&self) -> ConcurrencyPolicy {
        ConcurrencyPolicy::Session
    }

    fn accepts_commands(&self) -> bool {
        true
    }

    async fn start_listener(&self, events: EventSender) -> Result<ListenerHandle> {
        let bot = self.bot.clone();
        if let Err(e) = bot.set_my_commands(bot_commands()).await {
            error!("[telegram] Failed to set bot commands: {}", e);
        }

        let allowed = self.allowed_chats.clone();
        let token = CancellationToken::new();
        let stop = token.clone();

        tokio::spawn(async move {
            let poll = teloxide::repl(bot, move |_bot: Bot, msg: Message| {
                let events = events.clone();
                let allowed = allowed.clone();
                async move {
                    let chat_id = msg.chat.id.0;
                    let Some(text) = msg.text().map(str::trim).filter(|t| !t.is_empty()) else {
                        return respond(());
                    };
                    if !is_allowed(&allowed, chat_id) {
                        warn!("[telegram] Ignoring message from chat {} (not allowed)", chat_id);
                        return respond(());
                    }

                    let payload = json!({
                        "chat_id": chat_id,
                        "message_id": msg.id.0,
                        "from": msg.from.as_ref().and_then(|u| u.username.clone()),
                    });
                    info!("[telegram] Message from chat {}", chat_id);
                    events.emit(text, payload);
                    respond(())
                }
            });
            tokio::select! {
                _ = stop.cancelled() => info!("[telegram] Polling stopped"),
                _ = poll => warn!("[telegram] Polling ended"),
            }
        });

        Ok(ListenerHandle::new(token))
    }

    fn create_handler(&self, event: &ChannelEvent, verbosity: Verbosity) -> Arc<dyn StreamHandler> {
        let sink = TelegramSink {
            bot: self.bot.clone(),
            chat_id: ChatId(chat_id_from(&event.payload)),
        };
        Arc::new(OutputBuffer::new(
            Arc::new(sink),
            BufferSettings::from_config(&self.output, verbosity),
        ))
    }

    fn session_key(&self, payload: &Value) -> String {
        session_key_for(chat_id_from(payload))
    }

    async fn notify(&self, event: &ChannelEvent, text: &str) -> Result<()> {
        let chat_id = ChatId(chat_id_from(&event.payload));
        self.bot.send_message(chat_id, text).await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn session_key_uses_chat_id() {
        assert_eq!(session_key_for(-100123), "telegram:-100123");
        assert_eq!(chat_id_from(&json!({ "chat_id": 42 })), 42);
        assert_eq!(session_key_for(chat_id_from(&json!({}))), "telegram:0");
    }

    #[test]
    fn empty_allow_list_admits_every_chat() {
        assert!(is_allowed(&[], 7));
        assert!(is_allowed(&[7, 8], 8));
        assert!(!is_allowed(&[7, 8], 9));
    }

    #[test]
    fn registered_commands_match_router_commands() {
        use crate::core::orchestrator::RouterCommand;
        for cmd in bot_commands() {
            assert!(
                RouterCommand::parse(&format!("/{}", cmd.command)).is_some(),
                "/{} is not routed",
                cmd.command
            );
        }
    }
}
