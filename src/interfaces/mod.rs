pub mod console;
pub mod discord;
pub mod http;
pub mod telegram;

use std::sync::Arc;
use tracing::warn;

use crate::core::channel::ChannelDefinition;
use crate::core::config::HeraldConfig;

/// Every channel enabled in `config`. A chat channel without a token is
/// skipped with a warning rather than failing startup.
pub fn build_channels(config: &HeraldConfig) -> Vec<Arc<dyn ChannelDefinition>> {
    let mut channels: Vec<Arc<dyn ChannelDefinition>> = Vec::new();
    let cfg = &config.channels;

    if cfg.console.enabled {
        channels.push(Arc::new(console::ConsoleChannel::new(config.output.clone())));
    }

    if cfg.telegram.enabled {
        match cfg.telegram.token.as_deref().filter(|t| !t.trim().is_empty()) {
            Some(token) => channels.push(Arc::new(telegram::TelegramChannel::new(
                token,
                cfg.telegram.allowed_chats.clone(),
                config.output.clone(),
            ))),
            None => warn!("[telegram] Enabled but no token configured (set TELEGRAM_BOT_TOKEN). Skipping."),
        }
    }

    if cfg.discord.enabled {
        match cfg.discord.token.as_deref().filter(|t| !t.trim().is_empty()) {
            Some(token) => channels.push(Arc::new(discord::DiscordChannel::new(
                token,
                config.output.clone(),
            ))),
            None => warn!("[discord] Enabled but no token configured (set DISCORD_BOT_TOKEN). Skipping."),
        }
    }

    if cfg.http.enabled {
        channels.push(Arc::new(http::HttpChannel::new(
            cfg.http.clone(),
            config.output.clone(),
        )));
    }

    channels
}

/// Split `text` into pieces of at most `limit` characters, preferring line
/// breaks, then spaces, as cut points.
pub(crate) fn split_message(text: &str, limit: usize) -> Vec<String> {
    let limit = limit.max(1);
    let mut pieces = Vec::new();
    let mut rest = text.trim();
    while !rest.is_empty() {
        if rest.chars().count() <= limit {
            pieces.push(rest.to_string());
            break;
        }
        let hard = rest
            .char_indices()
            .nth(limit)
            .map(|(i, _)| i)
            .unwrap_or(rest.len());
        let window = &rest[..hard];
        let cut = window
            .rfind('\n')
            .or_else(|| window.rfind(' '))
            .filter(|&i| i > 0)
            .unwrap_or(hard);
        let (head, tail) = rest.split_at(cut);
        let head = head.trim_end();
        if !head.is_empty() {
            pieces.push(head.to_string());
        }
        rest = tail.trim_start();
    }
    pieces
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn split_message_keeps_short_text_whole() {
        assert_eq!(split_message("  hello  ", 10), vec!["hello"]);
        assert!(split_message("   ", 10).is_empty());
    }

    #[test]
    fn split_message_prefers_line_then_word_breaks() {
        let text = "first line\nsecond line here";
        assert_eq!(split_message(text, 14), vec!["first line", "second line", "here"]);
    }

    #[test]
    fn split_message_cuts_long_words_on_char_boundaries() {
        let pieces = split_message("ééééé", 2);
        assert_eq!(pieces, vec!["éé", "éé", "é"]);
    }

    #[test]
    fn default_config_builds_no_channels() {
        assert!(build_channels(&HeraldConfig::default()).is_empty());
    }

    #[test]
    fn enabled_chat_channel_without_token_is_skipped() {
        let config = HeraldConfig::parse(
            "[channels.telegram]\nenabled = true\n\n[channels.console]\nenabled = true\n",
        )
        .unwrap();
        let names: Vec<String> = build_channels(&config)
            .iter()
            .map(|c| c.name().to_string())
            .collect();
        assert_eq!(names, vec!["console"]);
    }
}
