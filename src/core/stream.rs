//! Worker output protocol: one JSON object per line, discriminated by `type`.
//!
//! Known tags decode into [`StreamEvent`] variants. Anything else, including a
//! known tag whose body does not match the expected shape, becomes
//! [`StreamEvent::Unknown`] so a protocol drift never aborts a run.

use serde::Deserialize;
use serde_json::Value;
use tracing::{debug, warn};

#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum StreamEvent {
    System(SystemEvent),
    Assistant(AssistantEvent),
    User(UserEvent),
    /// Incremental message deltas (`"type": "stream_event"`).
    #[serde(rename = "stream_event")]
    Partial(PartialEvent),
    Result(ResultEvent),
    #[serde(other)]
    Unknown,
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct SystemEvent {
    #[serde(default)]
    pub subtype: String,
    #[serde(default)]
    pub model: Option<String>,
    #[serde(default)]
    pub session_id: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct AssistantEvent {
    pub message: AssistantMessage,
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct AssistantMessage {
    #[serde(default)]
    pub model: Option<String>,
    #[serde(default)]
    pub content: Vec<ContentBlock>,
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ContentBlock {
    Text {
        text: String,
    },
    ToolUse {
        #[serde(default)]
        id: String,
        name: String,
        #[serde(default)]
        input: Value,
    },
    Thinking {
        #[serde(default)]
        thinking: String,
    },
    #[serde(other)]
    Other,
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct UserEvent {
    #[serde(default)]
    pub message: Option<Value>,
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct PartialEvent {
    pub event: Value,
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct ResultEvent {
    #[serde(default)]
    pub subtype: String,
    #[serde(default)]
    pub is_error: bool,
    #[serde(default)]
    pub result: Option<String>,
    #[serde(default)]
    pub total_cost_usd: Option<f64>,
    #[serde(default)]
    pub duration_ms: Option<u64>,
    #[serde(default)]
    pub num_turns: Option<u32>,
}

impl AssistantMessage {
    /// Concatenated text blocks of this turn.
    pub fn text(&self) -> String {
        self.content
            .iter()
            .filter_map(|block| match block {
                ContentBlock::Text { text } => Some(text.as_str()),
                _ => None,
            })
            .collect::<Vec<_>>()
            .join("")
    }

    pub fn tool_uses(&self) -> impl Iterator<Item = (&str, &str)> {
        self.content.iter().filter_map(|block| match block {
            ContentBlock::ToolUse { id, name, .. } => Some((id.as_str(), name.as_str())),
            _ => None,
        })
    }
}

impl PartialEvent {
    fn kind(&self) -> &str {
        self.event.get("type").and_then(Value::as_str).unwrap_or("")
    }

    /// Text carried by a `content_block_delta` / `text_delta` event.
    pub fn text_delta(&self) -> Option<&str> {
        if self.kind() != "content_block_delta" {
            return None;
        }
        let delta = self.event.get("delta")?;
        if delta.get("type").and_then(Value::as_str) != Some("text_delta") {
            return None;
        }
        delta.get("text").and_then(Value::as_str)
    }

    /// `(id, name)` of a tool invocation announced by `content_block_start`.
    pub fn tool_start(&self) -> Option<(&str, &str)> {
        if self.kind() != "content_block_start" {
            return None;
        }
        let block = self.event.get("content_block")?;
        if block.get("type").and_then(Value::as_str) != Some("tool_use") {
            return None;
        }
        let name = block.get("name").and_then(Value::as_str)?;
        let id = block.get("id").and_then(Value::as_str).unwrap_or("");
        Some((id, name))
    }

    pub fn is_message_start(&self) -> bool {
        self.kind() == "message_start"
    }
}

impl ResultEvent {
    pub fn is_success(&self) -> bool {
        !self.is_error && (self.subtype.is_empty() || self.subtype == "success")
    }
}

/// Decode one complete output line. Blank and malformed lines yield `None`;
/// malformed ones are logged and dropped.
pub fn decode_line(line: &str) -> Option<(Value, StreamEvent)> {
    let line = line.trim();
    if line.is_empty() {
        return None;
    }
    let raw: Value = match serde_json::from_str(line) {
        Ok(v) => v,
        Err(e) => {
            warn!("Dropping malformed worker line ({}): {}", e, truncate(line, 200));
            return None;
        }
    };
    if !raw.is_object() {
        warn!("Dropping non-object worker line: {}", truncate(line, 200));
        return None;
    }
    let event = match serde_json::from_value::<StreamEvent>(raw.clone()) {
        Ok(event) => event,
        Err(e) => {
            debug!("Unrecognized worker event shape ({}), keeping raw", e);
            StreamEvent::Unknown
        }
    };
    Some((raw, event))
}

fn truncate(s: &str, max: usize) -> &str {
    match s.char_indices().nth(max) {
        Some((idx, _)) => &s[..idx],
        None => s,
    }
}
