use anyhow::{Context, Result};
use serde::Deserialize;
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::info;

use crate::core::output::Verbosity;

pub const CONFIG_FILE: &str = "herald.toml";

#[derive(Debug, Clone, Deserialize, Default)]
pub struct HeraldConfig {
    #[serde(default)]
    pub worker: WorkerConfig,

    #[serde(default)]
    pub output: OutputConfig,

    #[serde(default)]
    pub scheduler: SchedulerConfig,

    #[serde(default)]
    pub channels: ChannelsConfig,
}

#[derive(Debug, Clone, Deserialize)]
pub struct WorkerConfig {
    #[serde(default = "default_worker_binary")]
    pub binary: String,

    /// Arguments placed before the session flag and the prompt.
    #[serde(default = "default_base_args")]
    pub base_args: Vec<String>,

    #[serde(default = "default_new_session_flag")]
    pub new_session_flag: String,

    #[serde(default = "default_resume_flag")]
    pub resume_flag: String,

    #[serde(default)]
    pub working_dir: Option<PathBuf>,

    #[serde(default)]
    pub env: HashMap<String, String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct OutputConfig {
    #[serde(default = "default_min_chunk_chars")]
    pub min_chunk_chars: usize,

    #[serde(default = "default_flush_interval_ms")]
    pub flush_interval_ms: u64,

    #[serde(default = "default_keepalive_secs")]
    pub keepalive_secs: u64,

    #[serde(default)]
    pub default_verbosity: Verbosity,
}

#[derive(Debug, Clone, Deserialize)]
pub struct SchedulerConfig {
    #[serde(default = "default_true")]
    pub enabled: bool,

    /// Relative paths resolve against the data directory.
    #[serde(default = "default_jobs_file")]
    pub jobs_file: PathBuf,

    #[serde(default = "default_reload_poll_secs")]
    pub reload_poll_secs: u64,
}

#[derive(Debug, Clone, Deserialize, Default)]
pub struct ChannelsConfig {
    #[serde(default)]
    pub console: ConsoleChannelConfig,

    #[serde(default)]
    pub telegram: TelegramChannelConfig,

    #[serde(default)]
    pub discord: DiscordChannelConfig,

    #[serde(default)]
    pub http: HttpChannelConfig,
}

#[derive(Debug, Clone, Deserialize, Default)]
pub struct ConsoleChannelConfig {
    #[serde(default)]
    pub enabled: bool,
}

#[derive(Debug, Clone, Deserialize, Default)]
pub struct TelegramChannelConfig {
    #[serde(default)]
    pub enabled: bool,

    #[serde(default)]
    pub token: Option<String>,

    /// Empty means every chat may talk to the bot.
    #[serde(default)]
    pub allowed_chats: Vec<i64>,
}

#[derive(Debug, Clone, Deserialize, Default)]
pub struct DiscordChannelConfig {
    #[serde(default)]
    pub enabled: bool,

    #[serde(default)]
    pub token: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct HttpChannelConfig {
    #[serde(default)]
    pub enabled: bool,

    #[serde(default = "default_http_host")]
    pub host: String,

    #[serde(default = "default_http_port")]
    pub port: u16,

    #[serde(default)]
    pub secret: Option<String>,
}

fn default_worker_binary() -> String {
    "claude".to_string()
}
fn default_base_args() -> Vec<String> {
    ["-p", "--output-format", "stream-json", "--verbose"]
        .iter()
        .map(|s| s.to_string())
        .collect()
}
fn default_new_session_flag() -> String {
    "--session-id".to_string()
}
fn default_resume_flag() -> String {
    "--resume".to_string()
}
fn default_min_chunk_chars() -> usize {
    400
}
fn default_flush_interval_ms() -> u64 {
    2500
}
fn default_keepalive_secs() -> u64 {
    4
}
fn default_true() -> bool {
    true
}
fn default_jobs_file() -> PathBuf {
    PathBuf::from("cron.json")
}
fn default_reload_poll_secs() -> u64 {
    2
}
fn default_http_host() -> String {
    "127.0.0.1".to_string()
}
fn default_http_port() -> u16 {
    17900
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            binary: default_worker_binary(),
            base_args: default_base_args(),
            new_session_flag: default_new_session_flag(),
            resume_flag: default_resume_flag(),
            working_dir: None,
            env: HashMap::new(),
        }
    }
}

impl Default for OutputConfig {
    fn default() -> Self {
        Self {
            min_chunk_chars: default_min_chunk_chars(),
            flush_interval_ms: default_flush_interval_ms(),
            keepalive_secs: default_keepalive_secs(),
            default_verbosity: Verbosity::default(),
        }
    }
}

impl OutputConfig {
    pub fn flush_interval(&self) -> Duration {
        Duration::from_millis(self.flush_interval_ms)
    }

    pub fn keepalive_interval(&self) -> Duration {
        Duration::from_secs(self.keepalive_secs.max(1))
    }
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            jobs_file: default_jobs_file(),
            reload_poll_secs: default_reload_poll_secs(),
        }
    }
}

impl Default for HttpChannelConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            host: default_http_host(),
            port: default_http_port(),
            secret: None,
        }
    }
}

impl HeraldConfig {
    pub async fn load<P: AsRef<Path>>(data_dir: P) -> Result<Self> {
        let config_path = data_dir.as_ref().join(CONFIG_FILE);
        let mut config = if config_path.exists() {
            let content = tokio::fs::read_to_string(&config_path)
                .await
                .with_context(|| format!("reading {}", config_path.display()))?;
            Self::parse(&content)
                .with_context(|| format!("parsing {}", config_path.display()))?
        } else {
            info!("No {} found, using defaults.", CONFIG_FILE);
            Self::default()
        };

        config.apply_env_fallbacks(|key| std::env::var(key).ok());

        info!(
            "Loaded config: worker={}, verbosity={}, scheduler={}",
            config.worker.binary,
            config.output.default_verbosity.as_str(),
            if config.scheduler.enabled { "on" } else { "off" }
        );
        Ok(config)
    }

    pub fn parse(content: &str) -> Result<Self> {
        Ok(toml::from_str(content)?)
    }

    /// Tokens may come from the environment when the file leaves them unset.
    fn apply_env_fallbacks(&mut self, lookup: impl Fn(&str) -> Option<String>) {
        let tg = &mut self.channels.telegram;
        if tg.token.as_deref().is_none_or(str::is_empty) {
            tg.token = lookup("TELEGRAM_BOT_TOKEN").filter(|t| !t.trim().is_empty());
        }
        let dc = &mut self.channels.discord;
        if dc.token.as_deref().is_none_or(str::is_empty) {
            dc.token = lookup("DISCORD_BOT_TOKEN").filter(|t| !t.trim().is_empty());
        }
    }

    pub fn jobs_file(&self, data_dir: &Path) -> PathBuf {
        if self.scheduler.jobs_file.is_absolute() {
            self.scheduler.jobs_file.clone()
        } else {
            data_dir.join(&self.scheduler.jobs_file)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_config_targets_stream_json_worker() {
        let config = HeraldConfig::default();
        assert_eq!(config.worker.binary, "claude");
        assert!(config.worker.base_args.contains(&"stream-json".to_string()));
        assert_eq!(config.worker.new_session_flag, "--session-id");
        assert_eq!(config.worker.resume_flag, "--resume");
        assert_eq!(config.output.min_chunk_chars, 400);
        assert_eq!(config.output.flush_interval(), Duration::from_millis(2500));
        assert_eq!(config.output.default_verbosity, Verbosity::Streaming);
        assert!(config.scheduler.enabled);
        assert!(!config.channels.console.enabled);
        assert_eq!(config.channels.http.port, 17900);
    }

    #[test]
    fn parse_partial_toml_keeps_defaults() {
        let content = r#"
[worker]
binary = "/opt/bin/agent"

[output]
default_verbosity = "progress"
keepalive_secs = 0

[channels.telegram]
enabled = true
allowed_chats = [42, -100]
"#;
        let config = HeraldConfig::parse(content).unwrap();
        assert_eq!(config.worker.binary, "/opt/bin/agent");
        assert_eq!(config.worker.resume_flag, "--resume");
        assert_eq!(config.output.default_verbosity, Verbosity::Progress);
        assert_eq!(config.output.keepalive_interval(), Duration::from_secs(1));
        assert!(config.channels.telegram.enabled);
        assert_eq!(config.channels.telegram.allowed_chats, vec![42, -100]);
    }

    #[test]
    fn parse_rejects_unknown_verbosity() {
        let content = "[output]\ndefault_verbosity = \"chatty\"\n";
        assert!(HeraldConfig::parse(content).is_err());
    }

    #[test]
    fn env_fallback_fills_missing_tokens_only() {
        let mut config = HeraldConfig::parse(
            "[channels.discord]\ntoken = \"from-file\"\n",
        )
        .unwrap();
        config.apply_env_fallbacks(|key| match key {
            "TELEGRAM_BOT_TOKEN" => Some("tg-env".to_string()),
            "DISCORD_BOT_TOKEN" => Some("dc-env".to_string()),
            _ => None,
        });
        assert_eq!(config.channels.telegram.token.as_deref(), Some("tg-env"));
        assert_eq!(config.channels.discord.token.as_deref(), Some("from-file"));
    }

    #[test]
    fn relative_jobs_file_resolves_against_data_dir() {
        let config = HeraldConfig::default();
        assert_eq!(
            config.jobs_file(Path::new("/srv/herald")),
            PathBuf::from("/srv/herald/cron.json")
        );
    }

    #[tokio::test]
    async fn load_missing_file_returns_default() {
        let tmpdir = tempfile::tempdir().unwrap();
        let config = HeraldConfig::load(tmpdir.path()).await.unwrap();
        assert_eq!(config.worker.binary, "claude");
    }
}
