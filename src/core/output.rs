//! Output buffering: turns a worker's stream into channel sends according to a
//! verbosity mode, plus the keep-alive indicator while the run is in progress.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::fmt;
use std::str::FromStr;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::core::channel::{ChannelSink, StreamHandler};
use crate::core::config::OutputConfig;
use crate::core::executor::RunOutcome;
use crate::core::jobs::RunStatus;
use crate::core::stream::StreamEvent;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Verbosity {
    /// Flush by size threshold or interval while the worker is talking.
    #[default]
    Streaming,
    /// Every turn, sent once at the end.
    Bundled,
    /// Only the last turn, sent once at the end.
    Final,
    /// Tool notices while working, then the last turn.
    Progress,
}

impl Verbosity {
    pub const ALL: [Verbosity; 4] = [
        Verbosity::Streaming,
        Verbosity::Bundled,
        Verbosity::Final,
        Verbosity::Progress,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Verbosity::Streaming => "streaming",
            Verbosity::Bundled => "bundled",
            Verbosity::Final => "final",
            Verbosity::Progress => "progress",
        }
    }
}

impl fmt::Display for Verbosity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Verbosity {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let wanted = s.trim().to_ascii_lowercase();
        Verbosity::ALL
            .into_iter()
            .find(|v| v.as_str() == wanted)
            .ok_or_else(|| {
                anyhow::anyhow!(
                    "unknown style '{}' (expected one of: streaming, bundled, final, progress)",
                    s.trim()
                )
            })
    }
}

#[derive(Debug, Clone, Copy)]
pub struct BufferSettings {
    pub verbosity: Verbosity,
    pub min_chunk_chars: usize,
    pub flush_interval: Duration,
    pub keepalive_interval: Duration,
}

impl BufferSettings {
    pub fn from_config(config: &OutputConfig, verbosity: Verbosity) -> Self {
        Self {
            verbosity,
            min_chunk_chars: config.min_chunk_chars,
            flush_interval: config.flush_interval(),
            keepalive_interval: config.keepalive_interval(),
        }
    }
}

#[derive(Default)]
struct BufferState {
    pending: String,
    last_flush: Option<Instant>,
    timer: Option<JoinHandle<()>>,
    // Text of the turn in progress, from deltas or the assistant event.
    turn: String,
    turn_streamed: bool,
    last_turn: String,
    announced: HashSet<String>,
    sent_any: bool,
}

struct Inner {
    sink: Arc<dyn ChannelSink>,
    settings: BufferSettings,
    state: Mutex<BufferState>,
    done: AtomicBool,
    keepalive: CancellationToken,
}

/// Per-event output handler. One instance per [`ChannelEvent`], never reused.
///
/// [`ChannelEvent`]: crate::core::channel::ChannelEvent
pub struct OutputBuffer {
    inner: Arc<Inner>,
}

impl OutputBuffer {
    pub fn new(sink: Arc<dyn ChannelSink>, settings: BufferSettings) -> Self {
        let keepalive = CancellationToken::new();
        if sink.has_working_indicator() {
            let sink = sink.clone();
            let token = keepalive.clone();
            let every = settings.keepalive_interval;
            tokio::spawn(async move {
                loop {
                    sink.working().await;
                    tokio::select! {
                        _ = token.cancelled() => break,
                        _ = tokio::time::sleep(every) => {}
                    }
                }
            });
        }

        Self {
            inner: Arc::new(Inner {
                sink,
                settings,
                state: Mutex::new(BufferState {
                    last_flush: Some(Instant::now()),
                    ..Default::default()
                }),
                done: AtomicBool::new(false),
                keepalive,
            }),
        }
    }

    pub fn is_complete(&self) -> bool {
        self.inner.done.load(Ordering::SeqCst)
    }
}

impl Drop for OutputBuffer {
    fn drop(&mut self) {
        self.inner.keepalive.cancel();
    }
}

impl Inner {
    async fn flush(&self, state: &mut BufferState) {
        if let Some(timer) = state.timer.take() {
            timer.abort();
        }
        let text = state.pending.trim().to_string();
        state.pending.clear();
        state.last_flush = Some(Instant::now());
        if text.is_empty() {
            return;
        }
        if let Err(e) = self.sink.send(&text).await {
            warn!("Output send failed: {:#}", e);
            return;
        }
        state.sent_any = true;
    }

    async fn push_streaming(self: &Arc<Self>, state: &mut BufferState, text: &str) {
        state.pending.push_str(text);
        let since = state
            .last_flush
            .map(|t| t.elapsed())
            .unwrap_or(self.settings.flush_interval);
        if state.pending.len() >= self.settings.min_chunk_chars || since >= self.settings.flush_interval {
            self.flush(state).await;
        } else if state.timer.is_none() {
            let remaining = self.settings.flush_interval - since;
            let inner = self.clone();
            state.timer = Some(tokio::spawn(async move {
                tokio::time::sleep(remaining).await;
                inner.timer_fired().await;
            }));
        }
    }

    async fn timer_fired(&self) {
        let mut state = self.state.lock().await;
        // Detach before flushing so flush() does not abort this very task.
        state.timer = None;
        if self.done.load(Ordering::SeqCst) {
            return;
        }
        self.flush(&mut state).await;
    }

    async fn announce_tool(&self, state: &mut BufferState, id: &str, name: &str) {
        if !id.is_empty() && !state.announced.insert(id.to_string()) {
            return;
        }
        if self.settings.verbosity == Verbosity::Progress {
            match self.sink.send(&format!("Using {}...", name)).await {
                Ok(()) => state.sent_any = true,
                Err(e) => warn!("Progress notice failed: {:#}", e),
            }
        }
    }

    fn end_turn(&self, state: &mut BufferState) {
        let turn = std::mem::take(&mut state.turn);
        state.turn_streamed = false;
        let turn = turn.trim();
        if turn.is_empty() {
            return;
        }
        state.last_turn = turn.to_string();
        match self.settings.verbosity {
            Verbosity::Bundled => {
                if !state.pending.is_empty() {
                    state.pending.push_str("\n\n");
                }
                state.pending.push_str(turn);
            }
            Verbosity::Streaming => {
                if !state.pending.is_empty() {
                    state.pending.push_str("\n\n");
                }
            }
            Verbosity::Final | Verbosity::Progress => {}
        }
    }

    /// Final flush plus completion signal. Only the first call does anything.
    async fn complete(&self, state: &mut BufferState, success: bool, fallback: Option<&str>) {
        if self.done.swap(true, Ordering::SeqCst) {
            return;
        }
        self.keepalive.cancel();
        if let Some(timer) = state.timer.take() {
            timer.abort();
        }

        match self.settings.verbosity {
            Verbosity::Streaming | Verbosity::Bundled => {
                if !state.sent_any
                    && state.pending.trim().is_empty()
                    && let Some(text) = fallback
                {
                    state.pending = text.to_string();
                }
            }
            Verbosity::Final | Verbosity::Progress => {
                state.pending = if state.last_turn.is_empty() {
                    fallback.unwrap_or_default().to_string()
                } else {
                    state.last_turn.clone()
                };
            }
        }
        self.flush(state).await;
        self.sink.completed(success).await;
    }
}

#[async_trait]
impl StreamHandler for OutputBuffer {
    async fn on_event(&self, event: &StreamEvent) {
        if self.is_complete() {
            return;
        }
        let inner = &self.inner;
        let mut state = inner.state.lock().await;
        match event {
            StreamEvent::Partial(partial) => {
                if partial.is_message_start() {
                    state.turn.clear();
                    state.turn_streamed = false;
                }
                if let Some(text) = partial.text_delta() {
                    state.turn_streamed = true;
                    state.turn.push_str(text);
                    if inner.settings.verbosity == Verbosity::Streaming {
                        inner.push_streaming(&mut state, text).await;
                    }
                }
                if let Some((id, name)) = partial.tool_start() {
                    inner.announce_tool(&mut state, id, name).await;
                }
            }
            StreamEvent::Assistant(assistant) => {
                if !state.turn_streamed {
                    let text = assistant.message.text();
                    if inner.settings.verbosity == Verbosity::Streaming && !text.is_empty() {
                        inner.push_streaming(&mut state, &text).await;
                    }
                    state.turn = text;
                }
                for (id, name) in assistant.message.tool_uses() {
                    inner.announce_tool(&mut state, id, name).await;
                }
                inner.end_turn(&mut state);
            }
            StreamEvent::Result(result) => {
                inner
                    .complete(&mut state, result.is_success(), result.result.as_deref())
                    .await;
            }
            _ => {}
        }
    }

    async fn on_finish(&self, outcome: &RunOutcome) {
        if self.is_complete() {
            return;
        }
        let mut state = self.inner.state.lock().await;
        let notice = match outcome.status {
            RunStatus::Stopped => Some("Stopped.".to_string()),
            RunStatus::Error if !state.sent_any && state.pending.trim().is_empty() => Some(
                match &outcome.error {
                    Some(reason) => format!("Run failed: {}", reason),
                    None => "Run failed.".to_string(),
                },
            ),
            _ => None,
        };
        if let Some(notice) = notice {
            if !state.pending.is_empty() {
                state.pending.push_str("\n\n");
            }
            state.pending.push_str(&notice);
        }
        self.inner
            .complete(&mut state, outcome.status == RunStatus::Completed, None)
            .await;
    }
}

/// Handler for runs nobody is watching: collects assistant text and logs it
/// when the run ends.
pub struct LogOnlyHandler {
    label: String,
    text: Mutex<String>,
}

impl LogOnlyHandler {
    pub fn new(label: impl Into<String>) -> Self {
        Self {
            label: label.into(),
            text: Mutex::new(String::new()),
        }
    }

    pub async fn text(&self) -> String {
        self.text.lock().await.clone()
    }
}

#[async_trait]
impl StreamHandler for LogOnlyHandler {
    async fn on_event(&self, event: &StreamEvent) {
        if let StreamEvent::Assistant(assistant) = event {
            let turn = assistant.message.text();
            if turn.trim().is_empty() {
                return;
            }
            let mut text = self.text.lock().await;
            if !text.is_empty() {
                text.push_str("\n\n");
            }
            text.push_str(turn.trim());
        }
    }

    async fn on_finish(&self, outcome: &RunOutcome) {
        let text = self.text.lock().await;
        let preview: String = text.chars().take(300).collect();
        info!(
            "[{}] Run {} finished {}: {}",
            self.label,
            outcome.job_id,
            outcome.status.as_str(),
            if preview.is_empty() { "(no output)" } else { &preview }
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::stream::decode_line;
    use anyhow::Result;
    use std::sync::atomic::AtomicUsize;

    #[derive(Default)]
    struct RecordingSink {
        sent: std::sync::Mutex<Vec<String>>,
        completions: AtomicUsize,
        working: AtomicUsize,
        indicator: bool,
    }

    impl RecordingSink {
        fn with_indicator() -> Self {
            Self {
                indicator: true,
                ..Default::default()
            }
        }

        fn sent(&self) -> Vec<String> {
            self.sent.lock().unwrap().clone()
        }
    }

    #[async_trait]
    impl ChannelSink for RecordingSink {
        async fn send(&self, text: &str) -> Result<()> {
            self.sent.lock().unwrap().push(text.to_string());
            Ok(())
        }

        fn has_working_indicator(&self) -> bool {
            self.indicator
        }

        async fn working(&self) {
            self.working.fetch_add(1, Ordering::SeqCst);
        }

        async fn completed(&self, _success: bool) {
            self.completions.fetch_add(1, Ordering::SeqCst);
        }
    }

    fn settings(verbosity: Verbosity) -> BufferSettings {
        BufferSettings {
            verbosity,
            min_chunk_chars: 100,
            flush_interval: Duration::from_millis(1000),
            keepalive_interval: Duration::from_secs(4),
        }
    }

    fn event(json: &str) -> StreamEvent {
        decode_line(json).unwrap().1
    }

    fn delta(text: &str) -> StreamEvent {
        event(
            &serde_json::json!({
                "type": "stream_event",
                "event": {"type": "content_block_delta", "delta": {"type": "text_delta", "text": text}}
            })
            .to_string(),
        )
    }

    fn assistant(text: &str) -> StreamEvent {
        event(
            &serde_json::json!({
                "type": "assistant",
                "message": {"content": [{"type": "text", "text": text}]}
            })
            .to_string(),
        )
    }

    fn tool_turn(id: &str, name: &str) -> StreamEvent {
        event(
            &serde_json::json!({
                "type": "assistant",
                "message": {"content": [{"type": "tool_use", "id": id, "name": name, "input": {}}]}
            })
            .to_string(),
        )
    }

    fn result(text: &str) -> StreamEvent {
        event(
            &serde_json::json!({"type": "result", "subtype": "success", "is_error": false, "result": text})
                .to_string(),
        )
    }

    fn outcome(status: RunStatus) -> RunOutcome {
        RunOutcome {
            job_id: "job-1".to_string(),
            status,
            handle: "h".to_string(),
            final_text: None,
            error: None,
        }
    }

    #[tokio::test(start_paused = true)]
    async fn streaming_holds_small_fragments_until_the_interval_elapses() {
        let sink = Arc::new(RecordingSink::default());
        let buffer = OutputBuffer::new(sink.clone(), settings(Verbosity::Streaming));

        for word in ["alpha ", "beta ", "gamma "] {
            buffer.on_event(&delta(word)).await;
            tokio::time::sleep(Duration::from_millis(100)).await;
        }
        assert!(sink.sent().is_empty(), "sent early: {:?}", sink.sent());

        tokio::time::sleep(Duration::from_millis(800)).await;
        assert_eq!(sink.sent(), vec!["alpha beta gamma".to_string()]);
    }

    #[tokio::test(start_paused = true)]
    async fn streaming_flushes_immediately_past_the_size_threshold() {
        let sink = Arc::new(RecordingSink::default());
        let buffer = OutputBuffer::new(sink.clone(), settings(Verbosity::Streaming));

        buffer.on_event(&delta("short")).await;
        assert!(sink.sent().is_empty());
        buffer.on_event(&delta(&"x".repeat(120))).await;
        assert_eq!(sink.sent(), vec![format!("short{}", "x".repeat(120))]);
    }

    #[tokio::test(start_paused = true)]
    async fn threshold_flush_sends_the_whole_accumulator_mid_sentence() {
        let sink = Arc::new(RecordingSink::default());
        let buffer = OutputBuffer::new(sink.clone(), settings(Verbosity::Streaming));

        let tail = format!("First sentence. Then an unfinished {}", "y".repeat(100));
        buffer.on_event(&delta(&tail)).await;
        assert_eq!(sink.sent(), vec![tail.trim().to_string()]);

        buffer.on_event(&delta(" and the rest.")).await;
        buffer.on_event(&result("")).await;
        assert_eq!(sink.sent().last().map(String::as_str), Some("and the rest."));
    }

    #[tokio::test(start_paused = true)]
    async fn terminal_event_flushes_remainder_and_completes_once() {
        let sink = Arc::new(RecordingSink::default());
        let buffer = OutputBuffer::new(sink.clone(), settings(Verbosity::Streaming));

        buffer.on_event(&delta("  tail text  ")).await;
        buffer.on_event(&result("tail text")).await;
        assert_eq!(sink.sent(), vec!["tail text".to_string()]);
        assert_eq!(sink.completions.load(Ordering::SeqCst), 1);

        buffer.on_event(&result("tail text")).await;
        buffer.on_finish(&outcome(RunStatus::Completed)).await;
        tokio::time::sleep(Duration::from_secs(5)).await;
        assert_eq!(sink.sent().len(), 1);
        assert_eq!(sink.completions.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn streaming_does_not_repeat_text_already_seen_as_deltas() {
        let sink = Arc::new(RecordingSink::default());
        let buffer = OutputBuffer::new(sink.clone(), settings(Verbosity::Streaming));

        buffer.on_event(&delta("hello there")).await;
        buffer.on_event(&assistant("hello there")).await;
        buffer.on_event(&result("hello there")).await;
        assert_eq!(sink.sent(), vec!["hello there".to_string()]);
    }

    #[tokio::test(start_paused = true)]
    async fn bundled_sends_every_turn_once_at_the_end() {
        let sink = Arc::new(RecordingSink::default());
        let buffer = OutputBuffer::new(sink.clone(), settings(Verbosity::Bundled));

        buffer.on_event(&assistant("turn one")).await;
        buffer.on_event(&tool_turn("t1", "Bash")).await;
        tokio::time::sleep(Duration::from_secs(3)).await;
        buffer.on_event(&assistant("turn two")).await;
        assert!(sink.sent().is_empty());

        buffer.on_event(&result("turn two")).await;
        assert_eq!(sink.sent(), vec!["turn one\n\nturn two".to_string()]);
    }

    #[tokio::test(start_paused = true)]
    async fn final_sends_only_the_last_turn() {
        let sink = Arc::new(RecordingSink::default());
        let buffer = OutputBuffer::new(sink.clone(), settings(Verbosity::Final));

        buffer.on_event(&assistant("thinking out loud")).await;
        buffer.on_event(&assistant("the answer")).await;
        buffer.on_event(&result("the answer")).await;
        assert_eq!(sink.sent(), vec!["the answer".to_string()]);
    }

    #[tokio::test(start_paused = true)]
    async fn final_falls_back_to_result_text() {
        let sink = Arc::new(RecordingSink::default());
        let buffer = OutputBuffer::new(sink.clone(), settings(Verbosity::Final));
        buffer.on_event(&result("from result")).await;
        assert_eq!(sink.sent(), vec!["from result".to_string()]);
    }

    #[tokio::test(start_paused = true)]
    async fn progress_announces_each_tool_once_then_the_answer() {
        let sink = Arc::new(RecordingSink::default());
        let buffer = OutputBuffer::new(sink.clone(), settings(Verbosity::Progress));

        let start = event(
            r#"{"type":"stream_event","event":{"type":"content_block_start","content_block":{"type":"tool_use","id":"t1","name":"Read"}}}"#,
        );
        buffer.on_event(&start).await;
        assert_eq!(sink.sent(), vec!["Using Read...".to_string()]);

        // The assistant event repeats the same tool id.
        buffer.on_event(&tool_turn("t1", "Read")).await;
        buffer.on_event(&assistant("intermediate chatter")).await;
        buffer.on_event(&tool_turn("t2", "Grep")).await;
        buffer.on_event(&assistant("done")).await;
        buffer.on_event(&result("done")).await;

        assert_eq!(
            sink.sent(),
            vec![
                "Using Read...".to_string(),
                "Using Grep...".to_string(),
                "done".to_string()
            ]
        );
    }

    #[tokio::test(start_paused = true)]
    async fn keepalive_ticks_until_completion() {
        let sink = Arc::new(RecordingSink::with_indicator());
        let buffer = OutputBuffer::new(sink.clone(), settings(Verbosity::Streaming));

        tokio::time::sleep(Duration::from_millis(10)).await;
        assert_eq!(sink.working.load(Ordering::SeqCst), 1);

        tokio::time::sleep(Duration::from_secs(8)).await;
        assert_eq!(sink.working.load(Ordering::SeqCst), 3);

        buffer.on_event(&result("")).await;
        tokio::time::sleep(Duration::from_secs(20)).await;
        assert_eq!(sink.working.load(Ordering::SeqCst), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn failed_run_without_output_reports_failure() {
        let sink = Arc::new(RecordingSink::default());
        let buffer = OutputBuffer::new(sink.clone(), settings(Verbosity::Streaming));
        let mut failed = outcome(RunStatus::Error);
        failed.error = Some("exit code 2".to_string());

        buffer.on_finish(&failed).await;
        assert_eq!(sink.sent(), vec!["Run failed: exit code 2".to_string()]);
        assert_eq!(sink.completions.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn stopped_run_flushes_pending_text_with_notice() {
        let sink = Arc::new(RecordingSink::default());
        let buffer = OutputBuffer::new(sink.clone(), settings(Verbosity::Streaming));
        buffer.on_event(&delta("partial answer")).await;
        buffer.on_finish(&outcome(RunStatus::Stopped)).await;
        assert_eq!(sink.sent(), vec!["partial answer\n\nStopped.".to_string()]);
    }

    #[test]
    fn verbosity_parses_case_insensitively() {
        assert_eq!("Bundled".parse::<Verbosity>().unwrap(), Verbosity::Bundled);
        assert_eq!(" final ".parse::<Verbosity>().unwrap(), Verbosity::Final);
        assert!("loud".parse::<Verbosity>().is_err());
    }

    #[tokio::test]
    async fn log_only_handler_collects_turns() {
        let handler = LogOnlyHandler::new("cron:daily");
        handler.on_event(&assistant("first")).await;
        handler.on_event(&tool_turn("t", "Bash")).await;
        handler.on_event(&assistant("second")).await;
        handler.on_finish(&outcome(RunStatus::Completed)).await;
        assert_eq!(handler.text().await, "first\n\nsecond");
    }
}
