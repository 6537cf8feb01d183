//! Session identity: deterministic worker handles derived from a session key
//! and its reset generation, plus per-session behaviour settings.
//!
//! `sessions.json` is the only copy of this state. Every operation reads it,
//! applies its change and writes it back before returning.

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use std::path::{Path, PathBuf};
use tokio::sync::Mutex;
use tracing::info;
use uuid::Uuid;

use crate::core::output::Verbosity;
use crate::platform::{NativePlatform, Platform};

pub const SESSIONS_FILE: &str = "sessions.json";

/// Namespace for handle derivation. Changing it orphans every resumable
/// worker session.
pub const SESSION_NAMESPACE: Uuid = Uuid::from_u128(0x6b1d_93f0_52a4_4c8e_9f3e_27c1_d0a8_b415);

/// `(session_key, generation)` → UUIDv5 handle. Pure; no random component.
pub fn derive_handle(session_key: &str, generation: u64) -> String {
    let name = format!("{}-gen{}", session_key, generation);
    Uuid::new_v5(&SESSION_NAMESPACE, name.as_bytes()).to_string()
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MemoryMode {
    /// Resume the same worker session across events.
    #[default]
    Persistent,
    /// Reset before every run.
    Fresh,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum QueueMode {
    #[default]
    Queue,
    /// Turn events away while the lock key is busy.
    Reject,
}

#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionSettings {
    #[serde(default)]
    pub memory_mode: MemoryMode,
    #[serde(default)]
    pub queue_mode: QueueMode,
    #[serde(default)]
    pub transcript_lines: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub response_style: Option<Verbosity>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct SessionRecord {
    #[serde(default)]
    pub known: BTreeSet<String>,
    #[serde(default)]
    pub generations: BTreeMap<String, u64>,
    #[serde(default)]
    pub settings: BTreeMap<String, SessionSettings>,
}

impl SessionRecord {
    pub fn generation(&self, session_key: &str) -> u64 {
        self.generations.get(session_key).copied().unwrap_or(0)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResolvedSession {
    pub handle: String,
    pub generation: u64,
    pub is_new: bool,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionReset {
    pub retired_handle: String,
    pub handle: String,
    pub generation: u64,
}

pub struct SessionStore {
    path: PathBuf,
    // Serializes read-modify-write cycles inside this process.
    guard: Mutex<()>,
}

impl SessionStore {
    pub fn new<P: AsRef<Path>>(data_dir: P) -> Self {
        Self {
            path: data_dir.as_ref().join(SESSIONS_FILE),
            guard: Mutex::new(()),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    async fn load(&self) -> Result<SessionRecord> {
        match tokio::fs::read_to_string(&self.path).await {
            Ok(content) if content.trim().is_empty() => Ok(SessionRecord::default()),
            Ok(content) => serde_json::from_str(&content)
                .with_context(|| format!("parsing {}", self.path.display())),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(SessionRecord::default()),
            Err(e) => Err(e).with_context(|| format!("reading {}", self.path.display())),
        }
    }

    async fn persist(&self, record: &SessionRecord) -> Result<()> {
        if let Some(parent) = self.path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        let tmp = self.path.with_extension("json.tmp");
        tokio::fs::write(&tmp, serde_json::to_vec_pretty(record)?)
            .await
            .with_context(|| format!("writing {}", tmp.display()))?;
        NativePlatform::restrict_file_permissions(&tmp);
        tokio::fs::rename(&tmp, &self.path)
            .await
            .with_context(|| format!("replacing {}", self.path.display()))?;
        Ok(())
    }

    async fn modify<T>(&self, f: impl FnOnce(&mut SessionRecord) -> T) -> Result<T> {
        let _held = self.guard.lock().await;
        let mut record = self.load().await?;
        let out = f(&mut record);
        self.persist(&record).await?;
        Ok(out)
    }

    pub async fn snapshot(&self) -> Result<SessionRecord> {
        let _held = self.guard.lock().await;
        self.load().await
    }

    pub async fn resolve(&self, session_key: &str) -> Result<ResolvedSession> {
        let record = self.snapshot().await?;
        let generation = record.generation(session_key);
        let handle = derive_handle(session_key, generation);
        let is_new = !record.known.contains(&handle);
        Ok(ResolvedSession {
            handle,
            generation,
            is_new,
        })
    }

    /// Retire the current handle and move the key to the next generation.
    pub async fn reset(&self, session_key: &str) -> Result<SessionReset> {
        let reset = self
            .modify(|record| {
                let generation = record.generation(session_key);
                let retired_handle = derive_handle(session_key, generation);
                record.known.remove(&retired_handle);
                let next = generation + 1;
                record.generations.insert(session_key.to_string(), next);
                SessionReset {
                    retired_handle,
                    handle: derive_handle(session_key, next),
                    generation: next,
                }
            })
            .await?;
        info!(
            "Session [{}] reset to generation {} ({})",
            session_key, reset.generation, reset.handle
        );
        Ok(reset)
    }

    pub async fn mark_known(&self, handle: &str) -> Result<()> {
        self.modify(|record| {
            record.known.insert(handle.to_string());
        })
        .await
    }

    /// Drop a handle from `known` so the next run starts a new worker session.
    pub async fn forget(&self, handle: &str) -> Result<()> {
        self.modify(|record| {
            record.known.remove(handle);
        })
        .await
    }

    pub async fn settings(&self, session_key: &str) -> Result<SessionSettings> {
        Ok(self
            .snapshot()
            .await?
            .settings
            .get(session_key)
            .cloned()
            .unwrap_or_default())
    }

    pub async fn update_settings(
        &self,
        session_key: &str,
        f: impl FnOnce(&mut SessionSettings),
    ) -> Result<SessionSettings> {
        self.modify(|record| {
            let entry = record.settings.entry(session_key.to_string()).or_default();
            f(entry);
            entry.clone()
        })
        .await
    }
}
