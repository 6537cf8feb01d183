use anyhow::Result;
use async_trait::async_trait;
use serde_json::{Value, json};
use serenity::Client;
use serenity::all::{ChannelId, Context, EventHandler, GatewayIntents, Message, Ready};
use serenity::http::Http;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info};

use crate::core::channel::{
    ChannelDefinition, ChannelEvent, ChannelSink, ConcurrencyPolicy, EventSender, ListenerHandle,
    StreamHandler,
};
use crate::core::config::OutputConfig;
use crate::core::output::{BufferSettings, OutputBuffer, Verbosity};
use crate::interfaces::split_message;

const MESSAGE_LIMIT: usize = 2000;

pub fn session_key_for(channel_id: u64) -> String {
    format!("discord:{}", channel_id)
}

fn channel_id_from(payload: &Value) -> Option<ChannelId> {
    payload
        .get("channel_id")
        .and_then(Value::as_u64)
        .filter(|id| *id != 0)
        .map(ChannelId::new)
}

struct Handler {
    events: EventSender,
}

#[async_trait]
impl EventHandler for Handler {
    async fn message(&self, _ctx: Context, msg: Message) {
        if msg.author.bot {
            return;
        }
        let text = msg.content.trim();
        if text.is_empty() {
            return;
        }

        let channel_id = msg.channel_id.get();
        info!("[discord] Message from {} in {}", msg.author.name, channel_id);
        let payload = json!({
            "channel_id": channel_id,
            "message_id": msg.id.get(),
            "author": msg.author.name,
            "guild_id": msg.guild_id.map(|g| g.get()),
        });
        self.events.emit(text, payload);
    }

    async fn ready(&self, _: Context, ready: Ready) {
        info!("[discord] Connected as {}", ready.user.name);
    }
}

struct DiscordSink {
    http: Arc<Http>,
    channel_id: Option<ChannelId>,
}

#[async_trait]
impl ChannelSink for DiscordSink {
    async fn send(&self, text: &str) -> Result<()> {
        let Some(channel_id) = self.channel_id else {
            anyhow::bail!("event carries no discord channel id");
        };
        for piece in split_message(text, MESSAGE_LIMIT) {
            channel_id.say(&self.http, piece).await?;
        }
        Ok(())
    }

    fn has_working_indicator(&self) -> bool {
        self.channel_id.is_some()
    }

    async fn working(&self) {
        if let Some(channel_id) = self.channel_id
            && let Err(e) = channel_id.broadcast_typing(&self.http).await
        {
            debug!("[discord] typing broadcast failed for {}: {}", channel_id, e);
        }
    }
}

/// Gateway bot. One session per Discord channel.
pub struct DiscordChannel {
    token: String,
    http: Arc<Http>,
    output: OutputConfig,
}

impl DiscordChannel {
    pub fn new(token: &str, output: OutputConfig) -> Self {
        Self {
            token: token.to_string(),
            http: Arc::new(Http::new(token)),
            output,
        }
    }
}

#[async_trait]
impl ChannelDefinition for DiscordChannel {
    fn name(&self) -> &str {
        "discord"
    }

    fn concurrency(&self) -> ConcurrencyPolicy {
        ConcurrencyPolicy::Session
    }

    async fn start_listener(&self, events: EventSender) -> Result<ListenerHandle> {
        let intents = GatewayIntents::GUILD_MESSAGES
            | GatewayIntents::DIRECT_MESSAGES
            | GatewayIntents::MESSAGE_CONTENT;
        let mut client = Client::builder(&self.token, intents)
            .event_handler(Handler { events })
            .await?;

        let token = CancellationToken::new();
        let stop = token.clone();
        let shards = client.shard_manager.clone();
        tokio::spawn(async move {
            tokio::select! {
                _ = stop.cancelled() => {
                    shards.shutdown_all().await;
                    info!("[discord] Client stopped");
                }
                result = client.start() => {
                    if let Err(why) = result {
                        error!("[discord] Client error: {:?}", why);
                    }
                }
            }
        });

        Ok(ListenerHandle::new(token))
    }

    fn create_handler(&self, event: &ChannelEvent, verbosity: Verbosity) -> Arc<dyn StreamHandler> {
        let sink = DiscordSink {
            http: self.http.clone(),
            channel_id: channel_id_from(&event.payload),
        };
        Arc::new(OutputBuffer::new(
            Arc::new(sink),
            BufferSettings::from_config(&self.output, verbosity),
        ))
    }

    fn session_key(&self, payload: &Value) -> String {
        let id = payload.get("channel_id").and_then(Value::as_u64).unwrap_or_default();
        session_key_for(id)
    }

    async fn notify(&self, event: &ChannelEvent, text: &str) -> Result<()> {
        let Some(channel_id) = channel_id_from(&event.payload) else {
            anyhow::bail!("event carries no discord channel id");
        };
        channel_id.say(&self.http, text).await?;
        Ok(())
    }
}
