//! Persisted job records, one JSON document per worker run under `jobs/`.

use anyhow::{Context, Result, bail};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::path::{Path, PathBuf};
use tracing::{info, warn};
use uuid::Uuid;

use crate::platform::{NativePlatform, Platform, SignalResult};

pub const JOBS_DIR: &str = "jobs";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunStatus {
    Running,
    Completed,
    Error,
    Stopped,
}

impl RunStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            RunStatus::Running => "running",
            RunStatus::Completed => "completed",
            RunStatus::Error => "error",
            RunStatus::Stopped => "stopped",
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JobRecord {
    pub id: String,
    pub channel: String,
    pub session_key: String,
    pub session_handle: String,
    pub trigger: String,
    pub status: RunStatus,
    #[serde(default)]
    pub pid: Option<u32>,
    #[serde(default)]
    pub model: Option<String>,
    #[serde(default)]
    pub cost_usd: Option<f64>,
    #[serde(default)]
    pub duration_ms: Option<u64>,
    #[serde(default)]
    pub tool_count: u32,
    #[serde(default)]
    pub error: Option<String>,
    pub started_at: DateTime<Utc>,
    #[serde(default)]
    pub finished_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub events: Vec<Value>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StopOutcome {
    UnknownJob,
    /// The job is not in `running` status; nothing was touched.
    NotRunning(RunStatus),
    Signalled { pid: u32 },
    /// The process had already exited.
    NotFound,
    PermissionDenied,
    Failed(String),
}

impl StopOutcome {
    pub fn describe(&self) -> String {
        match self {
            StopOutcome::UnknownJob => "no such job".to_string(),
            StopOutcome::NotRunning(status) => format!("job is not running ({})", status.as_str()),
            StopOutcome::Signalled { pid } => format!("stop signal sent to pid {}", pid),
            StopOutcome::NotFound => "worker process already exited".to_string(),
            StopOutcome::PermissionDenied => "not permitted to signal the worker process".to_string(),
            StopOutcome::Failed(reason) => format!("stop failed: {}", reason),
        }
    }
}

/// Fields known once the run is over.
#[derive(Debug, Clone, Default)]
pub struct JobSummary {
    pub model: Option<String>,
    pub cost_usd: Option<f64>,
    pub duration_ms: Option<u64>,
    pub tool_count: u32,
    pub error: Option<String>,
}

pub struct JobStore {
    dir: PathBuf,
}

impl JobStore {
    pub fn new<P: AsRef<Path>>(data_dir: P) -> Self {
        Self {
            dir: data_dir.as_ref().join(JOBS_DIR),
        }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    fn path_for(&self, id: &str) -> PathBuf {
        self.dir.join(format!("{}.json", id))
    }

    async fn write(&self, record: &JobRecord) -> Result<()> {
        tokio::fs::create_dir_all(&self.dir).await?;
        let path = self.path_for(&record.id);
        let tmp = path.with_extension("json.tmp");
        tokio::fs::write(&tmp, serde_json::to_vec_pretty(record)?)
            .await
            .with_context(|| format!("writing {}", tmp.display()))?;
        tokio::fs::rename(&tmp, &path)
            .await
            .with_context(|| format!("replacing {}", path.display()))?;
        Ok(())
    }

    pub async fn create(
        &self,
        channel: &str,
        session_key: &str,
        session_handle: &str,
        trigger: &str,
    ) -> Result<JobRecord> {
        let record = JobRecord {
            id: Uuid::new_v4().to_string(),
            channel: channel.to_string(),
            session_key: session_key.to_string(),
            session_handle: session_handle.to_string(),
            trigger: trigger.to_string(),
            status: RunStatus::Running,
            pid: None,
            model: None,
            cost_usd: None,
            duration_ms: None,
            tool_count: 0,
            error: None,
            started_at: Utc::now(),
            finished_at: None,
            events: Vec::new(),
        };
        self.write(&record).await?;
        Ok(record)
    }

    /// Persist the in-memory record as it stands (pid, appended events).
    pub async fn save(&self, record: &JobRecord) -> Result<()> {
        self.write(record).await
    }

    pub async fn finalize(&self, record: &mut JobRecord, status: RunStatus, summary: JobSummary) -> Result<()> {
        record.status = status;
        record.finished_at = Some(Utc::now());
        if summary.model.is_some() {
            record.model = summary.model;
        }
        record.cost_usd = summary.cost_usd.or(record.cost_usd);
        record.duration_ms = summary.duration_ms.or(record.duration_ms);
        record.tool_count = record.tool_count.max(summary.tool_count);
        record.error = summary.error;
        self.write(record).await?;
        info!("Job {} finished: {}", record.id, status.as_str());
        Ok(())
    }

    pub async fn get(&self, id: &str) -> Result<Option<JobRecord>> {
        if id.is_empty() || id.contains(['/', '\\']) || id.contains("..") {
            bail!("invalid job id '{}'", id);
        }
        let path = self.path_for(id);
        match tokio::fs::read_to_string(&path).await {
            Ok(content) => Ok(Some(
                serde_json::from_str(&content).with_context(|| format!("parsing {}", path.display()))?,
            )),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e).with_context(|| format!("reading {}", path.display())),
        }
    }

    /// Every readable record, newest first. Unreadable files are skipped.
    pub async fn list(&self) -> Result<Vec<JobRecord>> {
        let mut entries = match tokio::fs::read_dir(&self.dir).await {
            Ok(entries) => entries,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(e).with_context(|| format!("listing {}", self.dir.display())),
        };
        let mut records = Vec::new();
        while let Some(entry) = entries.next_entry().await? {
            let path = entry.path();
            if path.extension().and_then(|e| e.to_str()) != Some("json") {
                continue;
            }
            let parsed = tokio::fs::read_to_string(&path)
                .await
                .map_err(anyhow::Error::from)
                .and_then(|c| serde_json::from_str::<JobRecord>(&c).map_err(anyhow::Error::from));
            match parsed {
                Ok(record) => records.push(record),
                Err(e) => warn!("Skipping unreadable job record {}: {}", path.display(), e),
            }
        }
        records.sort_by(|a, b| b.started_at.cmp(&a.started_at));
        Ok(records)
    }

    pub async fn running_for_session(&self, session_key: &str) -> Result<Option<JobRecord>> {
        Ok(self
            .list()
            .await?
            .into_iter()
            .find(|r| r.session_key == session_key && r.status == RunStatus::Running))
    }

    /// Signal the worker of a running job. Never modifies the record; the
    /// executor finalizes it when the process exits.
    pub async fn stop(&self, id: &str) -> Result<StopOutcome> {
        let Some(record) = self.get(id).await? else {
            return Ok(StopOutcome::UnknownJob);
        };
        if record.status != RunStatus::Running {
            return Ok(StopOutcome::NotRunning(record.status));
        }
        let Some(pid) = record.pid else {
            return Ok(StopOutcome::NotFound);
        };
        let outcome = match NativePlatform::terminate_process(pid) {
            SignalResult::Delivered => StopOutcome::Signalled { pid },
            SignalResult::NoSuchProcess => StopOutcome::NotFound,
            SignalResult::PermissionDenied => StopOutcome::PermissionDenied,
            SignalResult::Failed(reason) => StopOutcome::Failed(reason),
        };
        info!("Stop requested for job {}: {}", id, outcome.describe());
        Ok(outcome)
    }
}
