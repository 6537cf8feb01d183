//! Job executor: one worker subprocess per event, its stream forwarded to the
//! event's handler and appended to the job record.

use anyhow::{Result, anyhow};
use std::collections::HashSet;
use std::process::{ExitStatus, Stdio};
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::process::Command;
use tokio::sync::Mutex;
use tokio::time::Instant;
use tracing::{debug, error, info, warn};

use crate::core::channel::{ChannelEvent, StreamHandler};
use crate::core::config::WorkerConfig;
use crate::core::jobs::{JobRecord, JobStore, JobSummary, RunStatus, StopOutcome};
use crate::core::session::{MemoryMode, ResolvedSession, SessionStore};
use crate::core::stream::{StreamEvent, decode_line};

const STDERR_KEEP: usize = 2000;
const CHECKPOINT_EVENTS: u32 = 20;
const CHECKPOINT_EVERY: Duration = Duration::from_secs(2);

/// Paces mid-run record saves; `finalize` always writes the full record.
struct Checkpoint {
    last: Instant,
    pending: u32,
}

impl Checkpoint {
    fn new(now: Instant) -> Self {
        Self { last: now, pending: 0 }
    }

    /// Counts one event and says whether the record should be written now.
    fn due(&mut self, now: Instant) -> bool {
        self.pending += 1;
        if self.pending >= CHECKPOINT_EVENTS || now.duration_since(self.last) >= CHECKPOINT_EVERY {
            self.pending = 0;
            self.last = now;
            true
        } else {
            false
        }
    }
}

/// What a run ended as. Handed to the handler's `on_finish`.
#[derive(Debug, Clone, PartialEq)]
pub struct RunOutcome {
    pub job_id: String,
    pub status: RunStatus,
    pub handle: String,
    /// Last assistant text (or the result text) if the worker produced any.
    pub final_text: Option<String>,
    pub error: Option<String>,
}

#[derive(Default)]
struct StreamTally {
    summary: JobSummary,
    last_text: Option<String>,
    result_text: Option<String>,
    tool_ids: HashSet<String>,
}

impl StreamTally {
    fn observe(&mut self, event: &StreamEvent) {
        match event {
            StreamEvent::System(system) => {
                if let Some(model) = &system.model {
                    self.summary.model = Some(model.clone());
                }
            }
            StreamEvent::Assistant(assistant) => {
                if let Some(model) = &assistant.message.model {
                    self.summary.model = Some(model.clone());
                }
                let text = assistant.message.text();
                if !text.trim().is_empty() {
                    self.last_text = Some(text.trim().to_string());
                }
                for (id, _) in assistant.message.tool_uses() {
                    if id.is_empty() || self.tool_ids.insert(id.to_string()) {
                        self.summary.tool_count += 1;
                    }
                }
            }
            StreamEvent::Result(result) => {
                self.summary.cost_usd = result.total_cost_usd;
                self.summary.duration_ms = result.duration_ms;
                if let Some(text) = &result.result
                    && !text.trim().is_empty()
                {
                    self.result_text = Some(text.trim().to_string());
                }
            }
            _ => {}
        }
    }

    fn final_text(&self) -> Option<String> {
        self.result_text.clone().or_else(|| self.last_text.clone())
    }
}

pub struct JobExecutor {
    worker: WorkerConfig,
    sessions: Arc<SessionStore>,
    jobs: Arc<JobStore>,
    // Job ids whose stop was requested through this executor.
    stopping: Mutex<HashSet<String>>,
}

impl JobExecutor {
    pub fn new(worker: WorkerConfig, sessions: Arc<SessionStore>, jobs: Arc<JobStore>) -> Self {
        Self {
            worker,
            sessions,
            jobs,
            stopping: Mutex::new(HashSet::new()),
        }
    }

    pub fn sessions(&self) -> &Arc<SessionStore> {
        &self.sessions
    }

    pub fn jobs(&self) -> &Arc<JobStore> {
        &self.jobs
    }

    /// `base_args`, then the new-session or resume flag with the handle, then
    /// the prompt as the final positional argument.
    pub fn build_args(&self, session: &ResolvedSession, prompt: &str) -> Vec<String> {
        let mut args = self.worker.base_args.clone();
        let flag = if session.is_new {
            &self.worker.new_session_flag
        } else {
            &self.worker.resume_flag
        };
        args.push(flag.clone());
        args.push(session.handle.clone());
        args.push(prompt.to_string());
        args
    }

    /// Run one event to completion. Never fails: every failure ends up as an
    /// `error` outcome delivered to the handler.
    pub async fn execute(
        &self,
        channel: &str,
        event: &ChannelEvent,
        handler: Arc<dyn StreamHandler>,
    ) -> RunOutcome {
        let outcome = match self.prepare(channel, event).await {
            Ok((session, record)) => self.run(event, session, record, handler.as_ref()).await,
            Err(e) => {
                error!("[{}] Could not start run for {}: {:#}", channel, event.session_key, e);
                RunOutcome {
                    job_id: String::new(),
                    status: RunStatus::Error,
                    handle: String::new(),
                    final_text: None,
                    error: Some(format!("{:#}", e)),
                }
            }
        };
        handler.on_finish(&outcome).await;
        outcome
    }

    async fn prepare(&self, channel: &str, event: &ChannelEvent) -> Result<(ResolvedSession, JobRecord)> {
        let settings = match self.sessions.settings(&event.session_key).await {
            Ok(settings) => settings,
            Err(e) => {
                warn!("Session settings unreadable, using defaults: {:#}", e);
                Default::default()
            }
        };
        if settings.memory_mode == MemoryMode::Fresh {
            self.sessions.reset(&event.session_key).await?;
        }
        let session = self.sessions.resolve(&event.session_key).await?;
        let record = self
            .jobs
            .create(channel, &event.session_key, &session.handle, &event.prompt)
            .await?;
        Ok((session, record))
    }

    async fn run(
        &self,
        event: &ChannelEvent,
        session: ResolvedSession,
        mut record: JobRecord,
        handler: &dyn StreamHandler,
    ) -> RunOutcome {
        let args = self.build_args(&session, &event.prompt);
        info!(
            "[{}] Job {} starting ({} session {})",
            record.channel,
            record.id,
            if session.is_new { "new" } else { "resumed" },
            session.handle
        );

        let mut command = Command::new(&self.worker.binary);
        command
            .args(&args)
            .envs(&self.worker.env)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        if let Some(dir) = &self.worker.working_dir {
            command.current_dir(dir);
        }

        let mut child = match command.spawn() {
            Ok(child) => child,
            Err(e) => {
                let reason = format!("failed to spawn {}: {}", self.worker.binary, e);
                return self
                    .conclude(record, session, RunStatus::Error, StreamTally::default(), Some(reason))
                    .await;
            }
        };

        record.pid = child.id();
        if let Err(e) = self.jobs.save(&record).await {
            warn!("Job {}: could not record pid: {:#}", record.id, e);
        }

        let stderr_buf = Arc::new(Mutex::new(String::new()));
        let stderr_task = child.stderr.take().map(|stderr| {
            let stderr_buf = stderr_buf.clone();
            let job_id = record.id.clone();
            tokio::spawn(async move {
                let mut reader = BufReader::new(stderr).lines();
                while let Ok(Some(line)) = reader.next_line().await {
                    debug!("Worker stderr [{}]: {}", job_id, line);
                    let mut s = stderr_buf.lock().await;
                    if s.len() < STDERR_KEEP {
                        s.push_str(&line);
                        s.push('\n');
                    }
                }
            })
        });

        let mut tally = StreamTally::default();
        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| anyhow!("worker stdout was not captured"));
        match stdout {
            Ok(stdout) => {
                let mut reader = BufReader::new(stdout);
                let mut buf = Vec::new();
                let mut checkpoint = Checkpoint::new(Instant::now());
                loop {
                    buf.clear();
                    match reader.read_until(b'\n', &mut buf).await {
                        Ok(0) => break,
                        Ok(_) => {
                            let Ok(line) = std::str::from_utf8(&buf) else {
                                warn!("Job {}: dropped worker line that is not UTF-8", record.id);
                                continue;
                            };
                            let Some((raw, event)) = decode_line(line) else {
                                continue;
                            };
                            tally.observe(&event);
                            record.events.push(raw);
                            handler.on_event(&event).await;
                            if !matches!(event, StreamEvent::Partial(_))
                                && checkpoint.due(Instant::now())
                                && let Err(e) = self.jobs.save(&record).await
                            {
                                warn!("Job {}: could not append event: {:#}", record.id, e);
                            }
                        }
                        Err(e) => {
                            warn!("Job {}: worker stdout read failed: {}", record.id, e);
                            break;
                        }
                    }
                }
            }
            Err(e) => warn!("Job {}: {}", record.id, e),
        }

        let exit = child.wait().await;
        if let Some(task) = stderr_task {
            let _ = task.await;
        }
        let stopped = self.stopping.lock().await.remove(&record.id);
        let (status, reason) = match exit {
            Ok(exit) if stopped || terminated_by_stop_signal(&exit) => (RunStatus::Stopped, None),
            Ok(exit) if exit.success() => (RunStatus::Completed, None),
            Ok(exit) => {
                let stderr = stderr_buf.lock().await;
                let mut reason = match exit.code() {
                    Some(code) => format!("exit code {}", code),
                    None => "terminated by signal".to_string(),
                };
                if let Some(last) = stderr.lines().rev().find(|l| !l.trim().is_empty()) {
                    reason.push_str(": ");
                    reason.push_str(last.trim());
                }
                (RunStatus::Error, Some(reason))
            }
            Err(e) => (RunStatus::Error, Some(format!("waiting for worker: {}", e))),
        };
        self.conclude(record, session, status, tally, reason).await
    }

    async fn conclude(
        &self,
        mut record: JobRecord,
        session: ResolvedSession,
        status: RunStatus,
        tally: StreamTally,
        reason: Option<String>,
    ) -> RunOutcome {
        // Stopped runs leave `known` untouched.
        let bookkeeping = match status {
            RunStatus::Completed => self.sessions.mark_known(&session.handle).await,
            RunStatus::Stopped => Ok(()),
            _ => self.sessions.forget(&session.handle).await,
        };
        if let Err(e) = bookkeeping {
            error!("Job {}: session bookkeeping failed: {:#}", record.id, e);
        }
        if let Some(reason) = &reason {
            warn!("[{}] Job {} failed: {}", record.channel, record.id, reason);
        }

        let final_text = tally.final_text();
        let mut summary = tally.summary;
        summary.error = reason.clone();
        if let Err(e) = self.jobs.finalize(&mut record, status, summary).await {
            error!("Job {}: could not finalize record: {:#}", record.id, e);
        }

        RunOutcome {
            job_id: record.id,
            status,
            handle: session.handle,
            final_text,
            error: reason,
        }
    }

    /// Stop a running job. A successful signal makes the run finish as
    /// `stopped` whatever exit code the worker reports.
    pub async fn stop(&self, job_id: &str) -> Result<StopOutcome> {
        self.stopping.lock().await.insert(job_id.to_string());
        let outcome = self.jobs.stop(job_id).await;
        if !matches!(outcome, Ok(StopOutcome::Signalled { .. })) {
            self.stopping.lock().await.remove(job_id);
        }
        outcome
    }
}

#[cfg(unix)]
fn terminated_by_stop_signal(status: &ExitStatus) -> bool {
    use std::os::unix::process::ExitStatusExt;
    status.signal() == Some(15)
}

#[cfg(not(unix))]
fn terminated_by_stop_signal(_status: &ExitStatus) -> bool {
    false
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;
    use crate::core::session::SessionSettings;
    use async_trait::async_trait;
    use std::path::Path;

    #[derive(Default)]
    struct Recorder {
        events: std::sync::Mutex<Vec<StreamEvent>>,
        finished: std::sync::Mutex<Vec<RunOutcome>>,
    }

    #[async_trait]
    impl StreamHandler for Recorder {
        async fn on_event(&self, event: &StreamEvent) {
            self.events.lock().unwrap().push(event.clone());
        }

        async fn on_finish(&self, outcome: &RunOutcome) {
            self.finished.lock().unwrap().push(outcome.clone());
        }
    }

    const HAPPY: &str = r#"
echo "$@" >> "$ARGS_LOG"
echo '{"type":"system","subtype":"init","model":"fake-1"}'
printf '{"type":"assistant","message":{"content":[{"type":"text","text":"hi"},'
printf '{"type":"tool_use","id":"t1","name":"Bash","input":{}}]}}\n'
echo 'this is not json'
echo '{"type":"result","subtype":"success","is_error":false,"result":"hi","total_cost_usd":0.01,"duration_ms":7}'
"#;

    const FAILING: &str = r#"
echo "$@" >> "$ARGS_LOG"
echo '{"type":"system","subtype":"init"}'
echo 'worker exploded' >&2
exit 3
"#;

    const GARBLED: &str = r#"
printf '\377\376 garbage\n'
echo '{"type":"assistant","message":{"content":[{"type":"text","text":"still here"}]}}'
echo '{"type":"result","subtype":"success","is_error":false,"result":"still here"}'
"#;

    const SLOW: &str = r#"
echo '{"type":"system","subtype":"init"}'
exec sleep 30
"#;

    fn executor(dir: &Path, script: &str) -> JobExecutor {
        let mut worker = WorkerConfig::default();
        worker.binary = "sh".to_string();
        worker.base_args = vec!["-c".to_string(), script.to_string(), "worker".to_string()];
        worker
            .env
            .insert("ARGS_LOG".to_string(), dir.join("args.log").display().to_string());
        JobExecutor::new(
            worker,
            Arc::new(SessionStore::new(dir)),
            Arc::new(JobStore::new(dir)),
        )
    }

    fn event(key: &str) -> ChannelEvent {
        ChannelEvent::new(key, "do the thing", serde_json::Value::Null)
    }

    fn args_log(dir: &Path) -> Vec<String> {
        std::fs::read_to_string(dir.join("args.log"))
            .unwrap_or_default()
            .lines()
            .map(str::to_string)
            .collect()
    }

    #[test]
    fn build_args_puts_prompt_last() {
        let dir = tempfile::tempdir().unwrap();
        let exec = JobExecutor::new(
            WorkerConfig::default(),
            Arc::new(SessionStore::new(dir.path())),
            Arc::new(JobStore::new(dir.path())),
        );
        let mut session = ResolvedSession {
            handle: "abc".to_string(),
            generation: 0,
            is_new: true,
        };
        let args = exec.build_args(&session, "hello world");
        assert_eq!(
            args,
            vec!["-p", "--output-format", "stream-json", "--verbose", "--session-id", "abc", "hello world"]
        );
        session.is_new = false;
        let args = exec.build_args(&session, "again");
        assert_eq!(&args[4..], &["--resume", "abc", "again"]);
    }

    #[tokio::test]
    async fn zero_exit_completes_and_marks_handle_known() {
        let dir = tempfile::tempdir().unwrap();
        let exec = executor(dir.path(), HAPPY);
        let recorder = Arc::new(Recorder::default());

        let before = exec.sessions().resolve("console").await.unwrap();
        assert!(before.is_new);

        let outcome = exec.execute("console", &event("console"), recorder.clone()).await;
        assert_eq!(outcome.status, RunStatus::Completed);
        assert_eq!(outcome.final_text.as_deref(), Some("hi"));
        assert!(exec.sessions().snapshot().await.unwrap().known.contains(&before.handle));

        // Malformed line dropped; three events forwarded in order.
        let events = recorder.events.lock().unwrap().clone();
        assert_eq!(events.len(), 3);
        assert!(matches!(events[2], StreamEvent::Result(_)));
        assert_eq!(recorder.finished.lock().unwrap().len(), 1);

        let record = exec.jobs().get(&outcome.job_id).await.unwrap().unwrap();
        assert_eq!(record.status, RunStatus::Completed);
        assert_eq!(record.events.len(), 3);
        assert_eq!(record.model.as_deref(), Some("fake-1"));
        assert_eq!(record.tool_count, 1);
        assert_eq!(record.cost_usd, Some(0.01));
        assert!(record.pid.is_some());

        // Second run resumes the same handle.
        exec.execute("console", &event("console"), recorder.clone()).await;
        let log = args_log(dir.path());
        assert!(log[0].starts_with(&format!("--session-id {}", before.handle)));
        assert!(log[1].starts_with(&format!("--resume {}", before.handle)));
        assert!(log[1].ends_with("do the thing"));
    }

    #[tokio::test]
    async fn non_zero_exit_errors_and_forgets_handle() {
        let dir = tempfile::tempdir().unwrap();
        let exec = executor(dir.path(), FAILING);
        let handle = exec.sessions().resolve("k").await.unwrap().handle;
        exec.sessions().mark_known(&handle).await.unwrap();

        let recorder = Arc::new(Recorder::default());
        let outcome = exec.execute("console", &event("k"), recorder.clone()).await;
        assert_eq!(outcome.status, RunStatus::Error);
        let reason = outcome.error.clone().unwrap();
        assert!(reason.contains("exit code 3"), "{}", reason);
        assert!(reason.contains("worker exploded"), "{}", reason);
        assert!(!exec.sessions().snapshot().await.unwrap().known.contains(&handle));

        let record = exec.jobs().get(&outcome.job_id).await.unwrap().unwrap();
        assert_eq!(record.status, RunStatus::Error);
        assert_eq!(recorder.finished.lock().unwrap()[0].status, RunStatus::Error);

        // The next attempt starts a new session with the same handle.
        exec.execute("console", &event("k"), recorder).await;
        assert!(args_log(dir.path())[1].starts_with(&format!("--session-id {}", handle)));
    }

    #[tokio::test]
    async fn spawn_failure_is_an_error_run() {
        let dir = tempfile::tempdir().unwrap();
        let mut worker = WorkerConfig::default();
        worker.binary = dir.path().join("no-such-worker").display().to_string();
        let exec = JobExecutor::new(
            worker,
            Arc::new(SessionStore::new(dir.path())),
            Arc::new(JobStore::new(dir.path())),
        );
        let recorder = Arc::new(Recorder::default());
        let outcome = exec.execute("console", &event("k"), recorder.clone()).await;
        assert_eq!(outcome.status, RunStatus::Error);
        assert!(outcome.error.unwrap().contains("failed to spawn"));
        assert!(exec.sessions().snapshot().await.unwrap().known.is_empty());
        assert_eq!(recorder.finished.lock().unwrap().len(), 1);
    }

    async fn stop_first_running_job(exec: &Arc<JobExecutor>, key: &str) -> JobRecord {
        for _ in 0..200 {
            if let Some(record) = exec.jobs().running_for_session(key).await.unwrap()
                && record.pid.is_some()
            {
                let outcome = exec.stop(&record.id).await.unwrap();
                assert!(matches!(outcome, StopOutcome::Signalled { .. }), "{:?}", outcome);
                return record;
            }
            tokio::time::sleep(Duration::from_millis(25)).await;
        }
        panic!("job never started");
    }

    #[tokio::test]
    async fn stopped_run_leaves_known_untouched() {
        let dir = tempfile::tempdir().unwrap();
        let exec = Arc::new(executor(dir.path(), SLOW));
        let recorder = Arc::new(Recorder::default());

        let running = {
            let exec = exec.clone();
            let recorder = recorder.clone();
            tokio::spawn(async move { exec.execute("console", &event("k"), recorder).await })
        };
        let job = stop_first_running_job(&exec, "k").await;

        let finished = running.await.unwrap();
        assert_eq!(finished.status, RunStatus::Stopped);
        assert!(!exec.sessions().snapshot().await.unwrap().known.contains(&finished.handle));
        assert_eq!(
            exec.stop(&job.id).await.unwrap(),
            StopOutcome::NotRunning(RunStatus::Stopped)
        );

        // The worker never finished creating the session, so the next run starts it again.
        let next = exec.sessions().resolve("k").await.unwrap();
        assert!(next.is_new);
        assert_eq!(next.handle, finished.handle);
    }

    #[tokio::test]
    async fn stopping_a_resumed_session_does_not_forget_it() {
        let dir = tempfile::tempdir().unwrap();
        let exec = Arc::new(executor(dir.path(), SLOW));
        let handle = exec.sessions().resolve("k").await.unwrap().handle;
        exec.sessions().mark_known(&handle).await.unwrap();

        let running = {
            let exec = exec.clone();
            let recorder = Arc::new(Recorder::default());
            tokio::spawn(async move { exec.execute("console", &event("k"), recorder).await })
        };
        stop_first_running_job(&exec, "k").await;

        assert_eq!(running.await.unwrap().status, RunStatus::Stopped);
        assert!(exec.sessions().snapshot().await.unwrap().known.contains(&handle));
    }

    #[tokio::test]
    async fn non_utf8_worker_line_is_dropped() {
        let dir = tempfile::tempdir().unwrap();
        let exec = executor(dir.path(), GARBLED);
        let recorder = Arc::new(Recorder::default());

        let outcome = exec.execute("console", &event("k"), recorder.clone()).await;
        assert_eq!(outcome.status, RunStatus::Completed, "{:?}", outcome.error);
        assert_eq!(outcome.final_text.as_deref(), Some("still here"));
        assert_eq!(recorder.events.lock().unwrap().len(), 2);

        let record = exec.jobs().get(&outcome.job_id).await.unwrap().unwrap();
        assert_eq!(record.events.len(), 2);
    }

    #[test]
    fn checkpoint_saves_every_batch_or_interval() {
        let start = Instant::now();
        let mut checkpoint = Checkpoint::new(start);
        let due = (0..CHECKPOINT_EVENTS).filter(|_| checkpoint.due(start)).count();
        assert_eq!(due, 1);
        assert!(!checkpoint.due(start));
        assert!(checkpoint.due(start + CHECKPOINT_EVERY));
        assert!(!checkpoint.due(start + CHECKPOINT_EVERY));
    }

    #[tokio::test]
    async fn long_run_record_holds_every_event() {
        let dir = tempfile::tempdir().unwrap();
        let script = r#"
i=0
while [ $i -lt 45 ]; do
  echo '{"type":"assistant","message":{"content":[{"type":"text","text":"tick"}]}}'
  i=$((i+1))
done
"#;
        let exec = executor(dir.path(), script);
        let outcome = exec
            .execute("console", &event("k"), Arc::new(Recorder::default()))
            .await;
        assert_eq!(outcome.status, RunStatus::Completed);
        let record = exec.jobs().get(&outcome.job_id).await.unwrap().unwrap();
        assert_eq!(record.events.len(), 45);
    }

    #[tokio::test]
    async fn fresh_memory_mode_starts_new_every_time() {
        let dir = tempfile::tempdir().unwrap();
        let exec = executor(dir.path(), HAPPY);
        exec.sessions()
            .update_settings("k", |s: &mut SessionSettings| s.memory_mode = MemoryMode::Fresh)
            .await
            .unwrap();

        let recorder = Arc::new(Recorder::default());
        let first = exec.execute("console", &event("k"), recorder.clone()).await;
        let second = exec.execute("console", &event("k"), recorder).await;
        assert_ne!(first.handle, second.handle);
        for line in args_log(dir.path()) {
            assert!(line.starts_with("--session-id"), "{}", line);
        }
    }
}
