//! Router: channel events in, worker runs out.
//!
//! Every event goes through the concurrency controller under its channel's
//! lock key. Scheduled firings use the same path with their own `cron:<id>`
//! keys, so they never contend with channel traffic.

use anyhow::Result;
use async_trait::async_trait;
use serde_json::json;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::{Mutex, mpsc, oneshot};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::core::channel::{ChannelDefinition, ChannelEvent, EventSender, ListenerHandle, StreamHandler};
use crate::core::concurrency::{Admission, BoxTask, ConcurrencyController, Runner};
use crate::core::config::OutputConfig;
use crate::core::executor::{JobExecutor, RunOutcome};
use crate::core::jobs::RunStatus;
use crate::core::output::{LogOnlyHandler, Verbosity};
use crate::core::schedule::CronJob;
use crate::core::scheduler::CronDispatch;
use crate::core::session::{QueueMode, SessionSettings};

pub const CRON_CHANNEL: &str = "cron";

pub struct WorkItem {
    pub channel: String,
    pub event: ChannelEvent,
    done: Option<oneshot::Sender<RunOutcome>>,
}

/// Chat commands recognized on channels that accept them.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RouterCommand {
    Reset,
    Stop,
    Status,
    Style(Option<String>),
    Restart,
}

impl RouterCommand {
    /// `/reset`, `/new`, `/stop`, `/status`, `/style [mode]`, `/restart`.
    /// A Telegram-style `@botname` suffix is ignored. Anything else is a prompt.
    pub fn parse(text: &str) -> Option<Self> {
        let text = text.trim();
        let rest = text.strip_prefix('/')?;
        let mut parts = rest.splitn(2, char::is_whitespace);
        let word = parts.next()?.split('@').next()?.to_ascii_lowercase();
        let arg = parts.next().map(str::trim).filter(|a| !a.is_empty());
        match word.as_str() {
            "reset" | "new" => Some(RouterCommand::Reset),
            "stop" | "cancel" => Some(RouterCommand::Stop),
            "status" => Some(RouterCommand::Status),
            "style" | "verbosity" => Some(RouterCommand::Style(arg.map(str::to_string))),
            "restart" => Some(RouterCommand::Restart),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RouteResult {
    Admitted(Admission),
    Command,
    Restart,
    /// No channel registered under that name.
    Dropped,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExitReason {
    Shutdown,
    Restart,
}

struct Shared {
    output: OutputConfig,
    executor: Arc<JobExecutor>,
    channels: HashMap<String, Arc<dyn ChannelDefinition>>,
    last_replies: Mutex<HashMap<String, String>>,
}

impl Shared {
    async fn settings(&self, session_key: &str) -> SessionSettings {
        match self.executor.sessions().settings(session_key).await {
            Ok(settings) => settings,
            Err(e) => {
                warn!("Settings for [{}] unreadable, using defaults: {:#}", session_key, e);
                SessionSettings::default()
            }
        }
    }

    async fn handler_for(&self, item: &WorkItem) -> Arc<dyn StreamHandler> {
        match self.channels.get(&item.channel) {
            Some(channel) => {
                let settings = self.settings(&item.event.session_key).await;
                let verbosity = settings
                    .response_style
                    .unwrap_or(self.output.default_verbosity);
                channel.create_handler(&item.event, verbosity)
            }
            None => Arc::new(LogOnlyHandler::new(item.event.session_key.clone())),
        }
    }

    async fn run(&self, mut item: WorkItem) {
        let handler = self.handler_for(&item).await;
        let outcome = self.executor.execute(&item.channel, &item.event, handler).await;
        if let Some(text) = &outcome.final_text {
            self.last_replies
                .lock()
                .await
                .insert(item.event.session_key.clone(), text.clone());
        }
        if let Some(done) = item.done.take() {
            let _ = done.send(outcome);
        }
    }
}

/// Last `n` lines of `reply`, prepended to `prompt` as context.
pub fn compose_prompt(prompt: &str, reply: Option<&str>, n: u32) -> String {
    let Some(reply) = reply.filter(|r| n > 0 && !r.trim().is_empty()) else {
        return prompt.to_string();
    };
    let lines: Vec<&str> = reply.lines().collect();
    let tail = &lines[lines.len().saturating_sub(n as usize)..];
    format!(
        "For context, the end of your previous reply was:\n{}\n\n{}",
        tail.join("\n"),
        prompt
    )
}

#[derive(Clone)]
pub struct Orchestrator {
    shared: Arc<Shared>,
    controller: ConcurrencyController<WorkItem>,
}

impl Orchestrator {
    pub fn new(output: OutputConfig, executor: Arc<JobExecutor>, channels: Vec<Arc<dyn ChannelDefinition>>) -> Self {
        let channels = channels
            .into_iter()
            .map(|c| (c.name().to_string(), c))
            .collect();
        let shared = Arc::new(Shared {
            output,
            executor,
            channels,
            last_replies: Mutex::new(HashMap::new()),
        });
        let runner_shared = shared.clone();
        let runner: Runner<WorkItem> = Arc::new(move |item: WorkItem| -> BoxTask {
            let shared = runner_shared.clone();
            Box::pin(async move { shared.run(item).await })
        });
        Self {
            shared,
            controller: ConcurrencyController::new(runner),
        }
    }

    pub fn executor(&self) -> &Arc<JobExecutor> {
        &self.shared.executor
    }

    pub fn cron_dispatch(&self) -> Arc<dyn CronDispatch> {
        Arc::new(self.clone())
    }

    /// Route one event: intercept commands, compose the prompt, admit it.
    pub async fn route(&self, channel_name: &str, event: ChannelEvent) -> RouteResult {
        let Some(channel) = self.shared.channels.get(channel_name).cloned() else {
            warn!("Dropping event from unregistered channel [{}]", channel_name);
            return RouteResult::Dropped;
        };

        if channel.accepts_commands()
            && let Some(command) = RouterCommand::parse(&event.prompt)
        {
            let restart = command == RouterCommand::Restart;
            let reply = self.handle_command(channel.as_ref(), &event, command).await;
            if let Err(e) = channel.notify(&event, &reply).await {
                warn!("[{}] Could not deliver command reply: {:#}", channel_name, e);
            }
            return if restart { RouteResult::Restart } else { RouteResult::Command };
        }

        let settings = self.shared.settings(&event.session_key).await;
        let event = if settings.transcript_lines > 0 {
            let replies = self.shared.last_replies.lock().await;
            let prompt = compose_prompt(
                &event.prompt,
                replies.get(&event.session_key).map(String::as_str),
                settings.transcript_lines,
            );
            ChannelEvent::new(event.session_key.clone(), prompt, event.payload.clone())
        } else {
            event
        };

        let lock_key = channel.concurrency().lock_key(channel_name, &event);
        let item = WorkItem {
            channel: channel_name.to_string(),
            event: event.clone(),
            done: None,
        };
        let admission = self
            .controller
            .submit(lock_key, item, settings.queue_mode == QueueMode::Reject)
            .await;
        match admission {
            Admission::Started => debug!("[{}] {} started", channel_name, event.session_key),
            Admission::Queued { position } => {
                info!("[{}] {} queued at position {}", channel_name, event.session_key, position);
                let _ = channel
                    .notify(&event, &format!("Queued behind the current run (position {}).", position))
                    .await;
            }
            Admission::Rejected => {
                info!("[{}] {} busy, event rejected", channel_name, event.session_key);
                let _ = channel
                    .notify(&event, "Still working on the previous message. Try again once it finishes.")
                    .await;
            }
        }
        RouteResult::Admitted(admission)
    }

    async fn handle_command(&self, channel: &dyn ChannelDefinition, event: &ChannelEvent, command: RouterCommand) -> String {
        let key = &event.session_key;
        let sessions = self.shared.executor.sessions();
        info!("[{}] Command {:?} for {}", channel.name(), command, key);
        match command {
            RouterCommand::Reset => match sessions.reset(key).await {
                Ok(_) => {
                    self.shared.last_replies.lock().await.remove(key);
                    "Session reset. The next message starts a new conversation.".to_string()
                }
                Err(e) => format!("Reset failed: {:#}", e),
            },
            RouterCommand::Stop => {
                let running = match self.shared.executor.jobs().running_for_session(key).await {
                    Ok(running) => running,
                    Err(e) => return format!("Could not look up running jobs: {:#}", e),
                };
                let Some(job) = running else {
                    return "Nothing is running.".to_string();
                };
                match self.shared.executor.stop(&job.id).await {
                    Ok(outcome) => format!("Stop: {}.", outcome.describe()),
                    Err(e) => format!("Stop failed: {:#}", e),
                }
            }
            RouterCommand::Status => {
                let lock_key = channel.concurrency().lock_key(channel.name(), event);
                let status = match &lock_key {
                    Some(lock_key) => self.controller.status(lock_key).await,
                    None => Default::default(),
                };
                let settings = self.shared.settings(key).await;
                let style = settings
                    .response_style
                    .unwrap_or(self.shared.output.default_verbosity);
                format!(
                    "Running: {}. Queued: {}. Style: {}.",
                    if status.active { "yes" } else { "no" },
                    status.queued,
                    style
                )
            }
            RouterCommand::Style(None) => {
                let settings = self.shared.settings(key).await;
                let current = settings
                    .response_style
                    .unwrap_or(self.shared.output.default_verbosity);
                let options: Vec<&str> = Verbosity::ALL.iter().map(|v| v.as_str()).collect();
                format!("Style is {}. Options: {}.", current, options.join(", "))
            }
            RouterCommand::Style(Some(mode)) => match mode.parse::<Verbosity>() {
                Ok(verbosity) => match sessions
                    .update_settings(key, |s| s.response_style = Some(verbosity))
                    .await
                {
                    Ok(_) => format!("Style set to {}.", verbosity),
                    Err(e) => format!("Could not save style: {:#}", e),
                },
                Err(e) => format!("{:#}", e),
            },
            RouterCommand::Restart => "Restarting. Queued messages will be dropped.".to_string(),
        }
    }

    /// Start every listener and route their events until `shutdown` fires or
    /// a `/restart` arrives. A listener that fails to start is logged and
    /// skipped.
    pub async fn run(&self, shutdown: CancellationToken) -> Result<ExitReason> {
        let (tx, mut rx) = mpsc::unbounded_channel();
        let mut listeners: Vec<ListenerHandle> = Vec::new();
        for (name, channel) in &self.shared.channels {
            match channel.start_listener(EventSender::new(channel.clone(), tx.clone())).await {
                Ok(handle) => {
                    info!("[{}] Listener started", name);
                    listeners.push(handle);
                }
                Err(e) => error!("[{}] Listener failed to start: {:#}", name, e),
            }
        }
        drop(tx);
        if listeners.is_empty() {
            warn!("No channel listeners running; only scheduled jobs will fire");
        }

        let reason = loop {
            tokio::select! {
                _ = shutdown.cancelled() => break ExitReason::Shutdown,
                received = rx.recv() => match received {
                    Some((channel, event)) => {
                        if self.route(&channel, event).await == RouteResult::Restart {
                            break ExitReason::Restart;
                        }
                    }
                    None => {
                        // Every listener has gone away; scheduled jobs keep running.
                        shutdown.cancelled().await;
                        break ExitReason::Shutdown;
                    }
                },
            }
        };

        for listener in listeners {
            listener.stop();
        }
        let dropped = self.controller.clear_queues().await;
        if dropped > 0 {
            warn!("{} queued event(s) dropped; queues are not persisted", dropped);
        }
        let active = self.controller.active_count().await;
        if active > 0 {
            warn!("{} run(s) still active at {:?}", active, reason);
        }
        Ok(reason)
    }
}

#[async_trait]
impl CronDispatch for Orchestrator {
    async fn dispatch(&self, job: &CronJob) -> RunOutcome {
        let key = job.session_key();
        let event = ChannelEvent::new(
            key.clone(),
            job.prompt.clone(),
            json!({ "job_id": job.id, "description": job.description }),
        );
        let (tx, rx) = oneshot::channel();
        let item = WorkItem {
            channel: CRON_CHANNEL.to_string(),
            event,
            done: Some(tx),
        };
        self.controller.submit(Some(key.clone()), item, false).await;
        match rx.await {
            Ok(outcome) => outcome,
            Err(_) => RunOutcome {
                job_id: String::new(),
                status: RunStatus::Error,
                handle: String::new(),
                final_text: None,
                error: Some(format!("run for [{}] ended without an outcome", key)),
            },
        }
    }
}
