//! Local terminal channel: every stdin line is a prompt, replies go to stdout.

use anyhow::Result;
use async_trait::async_trait;
use console::style;
use serde_json::{Value, json};
use std::io::Write;
use std::sync::{Arc, Mutex};
use tokio::io::{AsyncBufRead, AsyncBufReadExt};
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::core::channel::{
    ChannelDefinition, ChannelEvent, ChannelSink, ConcurrencyPolicy, EventSender, ListenerHandle,
    StreamHandler,
};
use crate::core::config::OutputConfig;
use crate::core::output::{BufferSettings, OutputBuffer, Verbosity};

pub const CONSOLE_KEY: &str = "console";

type SharedWriter = Arc<Mutex<dyn Write + Send>>;

/// Writes each chunk as its own paragraph.
pub struct ConsoleSink {
    out: SharedWriter,
}

impl ConsoleSink {
    pub fn stdout() -> Self {
        Self::with_writer(Arc::new(Mutex::new(std::io::stdout())))
    }

    pub fn with_writer(out: SharedWriter) -> Self {
        Self { out }
    }

    fn write_line(&self, text: &str) -> Result<()> {
        let mut out = self
            .out
            .lock()
            .map_err(|_| anyhow::anyhow!("console writer poisoned"))?;
        writeln!(out, "{}", text)?;
        out.flush()?;
        Ok(())
    }
}

#[async_trait]
impl ChannelSink for ConsoleSink {
    async fn send(&self, text: &str) -> Result<()> {
        self.write_line(&format!("\n{}\n", text))
    }

    async fn completed(&self, success: bool) {
        let marker = if success {
            style("done").dim().to_string()
        } else {
            style("failed").red().to_string()
        };
        if let Err(e) = self.write_line(&format!("[{}]", marker)) {
            warn!("[console] Could not write to stdout: {}", e);
        }
    }
}

pub struct ConsoleChannel {
    output: OutputConfig,
}

impl ConsoleChannel {
    pub fn new(output: OutputConfig) -> Self {
        Self { output }
    }

    /// Handler writing to an arbitrary sink; `herald run` uses it directly.
    pub fn handler_with_sink(&self, sink: Arc<dyn ChannelSink>, verbosity: Verbosity) -> Arc<dyn StreamHandler> {
        Arc::new(OutputBuffer::new(
            sink,
            BufferSettings::from_config(&self.output, verbosity),
        ))
    }
}

/// Emit one event per non-empty line until EOF or cancellation.
async fn read_lines<R>(reader: R, events: EventSender, token: CancellationToken)
where
    R: AsyncBufRead + Unpin,
{
    let mut lines = reader.lines();
    loop {
        let line = tokio::select! {
            _ = token.cancelled() => break,
            line = lines.next_line() => line,
        };
        match line {
            Ok(Some(line)) => {
                let prompt = line.trim();
                if prompt.is_empty() {
                    continue;
                }
                if !events.emit(prompt, json!({ "line": prompt })) {
                    break;
                }
            }
            Ok(None) => {
                info!("[console] stdin closed");
                break;
            }
            Err(e) => {
                warn!("[console] stdin read failed: {}", e);
                break;
            }
        }
    }
}

#[async_trait]
impl ChannelDefinition for ConsoleChannel {
    fn name(&self) -> &str {
        "console"
    }

    fn concurrency(&self) -> ConcurrencyPolicy {
        ConcurrencyPolicy::Global
    }

    fn accepts_commands(&self) -> bool {
        true
    }

    async fn start_listener(&self, events: EventSender) -> Result<ListenerHandle> {
        let token = CancellationToken::new();
        let reader_token = token.clone();
        tokio::spawn(async move {
            let stdin = tokio::io::BufReader::new(tokio::io::stdin());
            read_lines(stdin, events, reader_token).await;
        });
        println!(
            "{} Type a message and press Enter. {} resets the conversation.",
            style(">").cyan().bold(),
            style("/reset").green()
        );
        Ok(ListenerHandle::new(token))
    }

    fn create_handler(&self, _event: &ChannelEvent, verbosity: Verbosity) -> Arc<dyn StreamHandler> {
        self.handler_with_sink(Arc::new(ConsoleSink::stdout()), verbosity)
    }

    fn session_key(&self, _payload: &Value) -> String {
        CONSOLE_KEY.to_string()
    }

    async fn notify(&self, _event: &ChannelEvent, text: &str) -> Result<()> {
        println!("{} {}", style("herald:").yellow().bold(), text);
        Ok(())
    }
}
