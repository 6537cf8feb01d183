//! Declarative cron job list and schedule phrase translation.
//!
//! The job file is either a bare JSON array of jobs or an object with a
//! `jobs` array. Removal edits the raw document so fields this crate does not
//! know about survive.

use anyhow::{Context, Result, bail};
use chrono::{DateTime, Local, NaiveDateTime, TimeZone, Utc};
use regex::Regex;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::path::Path;
use std::sync::LazyLock;
use tracing::warn;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CronJob {
    pub id: String,
    #[serde(default)]
    pub schedule: String,
    #[serde(default)]
    pub description: String,
    pub prompt: String,
    #[serde(default = "default_enabled")]
    pub enabled: bool,
    #[serde(default)]
    pub run_once: bool,
    /// ISO timestamp. Without an offset it is read as local time.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub run_at: Option<String>,
}

fn default_enabled() -> bool {
    true
}

impl CronJob {
    pub fn is_one_shot(&self) -> bool {
        self.run_once || (self.run_at.is_some() && self.schedule.trim().is_empty())
    }

    pub fn run_at_utc(&self) -> Result<Option<DateTime<Utc>>> {
        self.run_at.as_deref().map(parse_timestamp).transpose()
    }

    /// Session key for every firing of this job.
    pub fn session_key(&self) -> String {
        format!("cron:{}", self.id)
    }
}

pub fn parse_timestamp(raw: &str) -> Result<DateTime<Utc>> {
    let raw = raw.trim();
    if let Ok(dt) = DateTime::parse_from_rfc3339(raw) {
        return Ok(dt.with_timezone(&Utc));
    }
    for format in ["%Y-%m-%dT%H:%M:%S%.f", "%Y-%m-%dT%H:%M:%S", "%Y-%m-%d %H:%M:%S", "%Y-%m-%dT%H:%M", "%Y-%m-%d %H:%M"] {
        if let Ok(naive) = NaiveDateTime::parse_from_str(raw, format) {
            return match Local.from_local_datetime(&naive).earliest() {
                Some(local) => Ok(local.with_timezone(&Utc)),
                None => bail!("'{}' does not exist in the local time zone", raw),
            };
        }
    }
    bail!("unrecognized timestamp '{}'", raw)
}

static CRON_FIELD: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^[0-9A-Za-z*/,?#LW-]+$").expect("static regex"));
static CRON_NAMES: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(
        r"(?i)^(?:mon|tue|wed|thu|fri|sat|sun|jan|feb|mar|apr|may|jun|jul|aug|sep|oct|nov|dec)(?:[-,/](?:mon|tue|wed|thu|fri|sat|sun|jan|feb|mar|apr|may|jun|jul|aug|sep|oct|nov|dec|\d+))*$",
    )
    .expect("static regex")
});
static EVERY_N_MINUTES: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^every (\d+) ?(?:minutes?|mins?|m)$").expect("static regex"));
static EVERY_N_HOURS: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^every (\d+) ?(?:hours?|hrs?|h)$").expect("static regex"));
static DAILY_AT: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^(?:daily at|every day at|each day at|at) (.+)$").expect("static regex")
});
static WEEKDAYS_AT: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^(?:every )?weekdays?(?: at (.+))?$").expect("static regex")
});
static EVERY_DAY_OF_WEEK: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^(?:every|on) (monday|tuesday|wednesday|thursday|friday|saturday|sunday)s?(?: at (.+))?$")
        .expect("static regex")
});
static CLOCK: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^(\d{1,2})(?::(\d{2}))?\s*(am|pm)?$").expect("static regex"));

/// Every field must carry a digit, `*` or `?`, or be a day/month name list.
/// English words like "every" or "pm" rule it out.
fn looks_like_cron(expr: &str) -> bool {
    let fields: Vec<&str> = expr.split_whitespace().collect();
    (5..=7).contains(&fields.len())
        && fields.iter().all(|f| {
            CRON_FIELD.is_match(f)
                && (f.contains(|c: char| c.is_ascii_digit() || c == '*' || c == '?')
                    || CRON_NAMES.is_match(f))
        })
}

/// `9am` → (9, 0); `5:30pm` → (17, 30); `17:05` → (17, 5).
fn parse_clock(raw: &str) -> Option<(u32, u32)> {
    let caps = CLOCK.captures(raw.trim())?;
    let mut hour: u32 = caps.get(1)?.as_str().parse().ok()?;
    let minute: u32 = caps.get(2).map_or(Some(0), |m| m.as_str().parse().ok())?;
    match caps.get(3).map(|m| m.as_str()) {
        Some(meridiem) => {
            if !(1..=12).contains(&hour) {
                return None;
            }
            hour %= 12;
            if meridiem == "pm" {
                hour += 12;
            }
        }
        None if hour > 23 => return None,
        None => {}
    }
    (minute < 60).then_some((hour, minute))
}

fn weekday_number(name: &str) -> u32 {
    match name {
        "monday" => 1,
        "tuesday" => 2,
        "wednesday" => 3,
        "thursday" => 4,
        "friday" => 5,
        "saturday" => 6,
        _ => 0,
    }
}

fn at_clock(time: Option<&str>, dow: &str) -> Option<String> {
    let (hour, minute) = match time {
        Some(t) => parse_clock(t)?,
        None => (0, 0),
    };
    Some(format!("{} {} * * {}", minute, hour, dow))
}

/// Translate a schedule phrase into a five-field cron expression. Literal
/// cron syntax and anything unrecognized come back unchanged (trimmed).
pub fn to_cron_expression(schedule: &str) -> String {
    let original = schedule.trim();
    if looks_like_cron(original) {
        return original.to_string();
    }
    let phrase = original
        .to_lowercase()
        .split_whitespace()
        .collect::<Vec<_>>()
        .join(" ");

    let translated = match phrase.as_str() {
        "every minute" | "minutely" => Some("* * * * *".to_string()),
        "every hour" | "hourly" => Some("0 * * * *".to_string()),
        "every day" | "daily" | "midnight" => Some("0 0 * * *".to_string()),
        "weekly" | "every week" => Some("0 0 * * 0".to_string()),
        "monthly" | "every month" => Some("0 0 1 * *".to_string()),
        _ => None,
    }
    .or_else(|| {
        let caps = EVERY_N_MINUTES.captures(&phrase)?;
        let n: u32 = caps[1].parse().ok()?;
        (1..60).contains(&n).then(|| {
            if n == 1 {
                "* * * * *".to_string()
            } else {
                format!("*/{} * * * *", n)
            }
        })
    })
    .or_else(|| {
        let caps = EVERY_N_HOURS.captures(&phrase)?;
        let n: u32 = caps[1].parse().ok()?;
        (1..24).contains(&n).then(|| {
            if n == 1 {
                "0 * * * *".to_string()
            } else {
                format!("0 */{} * * *", n)
            }
        })
    })
    .or_else(|| {
        let caps = WEEKDAYS_AT.captures(&phrase)?;
        at_clock(caps.get(1).map(|m| m.as_str()), "1-5")
    })
    .or_else(|| {
        let caps = EVERY_DAY_OF_WEEK.captures(&phrase)?;
        let dow = weekday_number(&caps[1]).to_string();
        at_clock(caps.get(2).map(|m| m.as_str()), &dow)
    })
    .or_else(|| {
        let caps = DAILY_AT.captures(&phrase)?;
        at_clock(Some(&caps[1]), "*")
    });

    translated.unwrap_or_else(|| original.to_string())
}

/// The cron engine wants seconds first; five-field expressions fire at :00.
pub fn to_six_field(expr: &str) -> String {
    let expr = expr.trim();
    if expr.split_whitespace().count() == 5 {
        format!("0 {}", expr)
    } else {
        expr.to_string()
    }
}

fn jobs_array(doc: &Value) -> Option<&Vec<Value>> {
    match doc {
        Value::Array(items) => Some(items),
        Value::Object(map) => map.get("jobs").and_then(Value::as_array),
        _ => None,
    }
}

fn jobs_array_mut(doc: &mut Value) -> Option<&mut Vec<Value>> {
    match doc {
        Value::Array(items) => Some(items),
        Value::Object(map) => map.get_mut("jobs").and_then(Value::as_array_mut),
        _ => None,
    }
}

async fn read_document(path: &Path) -> Result<Option<Value>> {
    match tokio::fs::read_to_string(path).await {
        Ok(content) if content.trim().is_empty() => Ok(None),
        Ok(content) => Ok(Some(
            serde_json::from_str(&content).with_context(|| format!("parsing {}", path.display()))?,
        )),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
        Err(e) => Err(e).with_context(|| format!("reading {}", path.display())),
    }
}

/// Every entry that parses. Malformed entries are logged and skipped so one
/// bad job never hides the rest.
pub async fn load_jobs(path: &Path) -> Result<Vec<CronJob>> {
    let Some(doc) = read_document(path).await? else {
        return Ok(Vec::new());
    };
    let Some(items) = jobs_array(&doc) else {
        bail!("{} must hold a JSON array or an object with a 'jobs' array", path.display());
    };
    let mut jobs = Vec::with_capacity(items.len());
    for (idx, item) in items.iter().enumerate() {
        match serde_json::from_value::<CronJob>(item.clone()) {
            Ok(job) => jobs.push(job),
            Err(e) => warn!("Skipping cron entry #{} in {}: {}", idx, path.display(), e),
        }
    }
    Ok(jobs)
}

async fn write_document(path: &Path, doc: &Value) -> Result<()> {
    if let Some(parent) = path.parent() {
        tokio::fs::create_dir_all(parent).await?;
    }
    let tmp = path.with_extension("json.tmp");
    tokio::fs::write(&tmp, serde_json::to_vec_pretty(doc)?)
        .await
        .with_context(|| format!("writing {}", tmp.display()))?;
    tokio::fs::rename(&tmp, path)
        .await
        .with_context(|| format!("replacing {}", path.display()))?;
    Ok(())
}

pub async fn save_jobs(path: &Path, jobs: &[CronJob]) -> Result<()> {
    write_document(path, &serde_json::to_value(jobs)?).await
}

/// Delete the entry with `id`. Returns whether anything was removed.
pub async fn remove_job(path: &Path, id: &str) -> Result<bool> {
    let Some(mut doc) = read_document(path).await? else {
        return Ok(false);
    };
    let Some(items) = jobs_array_mut(&mut doc) else {
        return Ok(false);
    };
    let before = items.len();
    items.retain(|item| item.get("id").and_then(Value::as_str) != Some(id));
    if items.len() == before {
        return Ok(false);
    }
    write_document(path, &doc).await?;
    Ok(true)
}
