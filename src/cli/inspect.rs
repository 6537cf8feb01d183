use anyhow::Result;
use console::style;
use std::path::Path;

use super::LOG_FILE;
use crate::core::jobs::{JobRecord, JobStore, RunStatus, StopOutcome};
use crate::core::session::{SessionStore, derive_handle};
use crate::core::terminal::{GuideSection, print_error, print_info, print_success, print_warn};
use crate::platform::{NativePlatform, Platform};

fn styled_status(status: RunStatus) -> String {
    match status {
        RunStatus::Running => style("RUNNING").cyan().bold().to_string(),
        RunStatus::Completed => style("COMPLETED").green().to_string(),
        RunStatus::Error => style("ERROR").red().bold().to_string(),
        RunStatus::Stopped => style("STOPPED").yellow().to_string(),
    }
}

fn summary_line(job: &JobRecord) -> String {
    format!(
        "{}  {}  {}  {}",
        styled_status(job.status),
        job.started_at.format("%Y-%m-%d %H:%M:%S"),
        style(&job.session_key).cyan(),
        style(preview(&job.trigger, 48)).dim()
    )
}

fn preview(text: &str, max: usize) -> String {
    let flat = text.split_whitespace().collect::<Vec<_>>().join(" ");
    if flat.chars().count() <= max {
        flat
    } else {
        format!("{}...", flat.chars().take(max).collect::<String>())
    }
}

pub async fn list_jobs(data_dir: &Path, limit: usize) -> Result<()> {
    let store = JobStore::new(data_dir);
    let jobs = store.list().await?;
    if jobs.is_empty() {
        print_info(&format!("No jobs recorded yet in {}", store.dir().display()));
        return Ok(());
    }
    let mut guide = GuideSection::new(&format!("Jobs ({} of {})", jobs.len().min(limit), jobs.len()));
    for job in jobs.iter().take(limit) {
        guide = guide.command(&job.id, &summary_line(job));
    }
    guide
        .blank()
        .info(&format!(
            "Run {} for details.",
            style("herald jobs <id>").cyan().bold()
        ))
        .print();
    println!();
    Ok(())
}

pub async fn show_job(data_dir: &Path, id: &str) -> Result<()> {
    let Some(job) = JobStore::new(data_dir).get(id).await? else {
        print_error(&format!("No job with id {}", id));
        return Ok(());
    };

    let mut guide = GuideSection::new(&format!("Job {}", job.id))
        .status("Status", &styled_status(job.status))
        .status("Channel", &job.channel)
        .status("Session", &format!("{} ({})", job.session_key, job.session_handle))
        .status("Started", &job.started_at.to_rfc3339());
    if let Some(finished) = job.finished_at {
        guide = guide.status("Finished", &finished.to_rfc3339());
    }
    if let Some(pid) = job.pid {
        guide = guide.status("PID", &pid.to_string());
    }
    if let Some(model) = &job.model {
        guide = guide.status("Model", model);
    }
    if let Some(ms) = job.duration_ms {
        guide = guide.status("Duration", &format!("{:.1}s", ms as f64 / 1000.0));
    }
    if let Some(cost) = job.cost_usd {
        guide = guide.status("Cost", &format!("${:.4}", cost));
    }
    guide = guide
        .status("Tools", &job.tool_count.to_string())
        .status("Events", &job.events.len().to_string())
        .blank()
        .text(&preview(&job.trigger, 200));
    if let Some(error) = &job.error {
        guide = guide.blank().warn(error);
    }
    guide.print();
    println!();
    Ok(())
}

pub async fn stop_job(data_dir: &Path, id: &str) -> Result<()> {
    let outcome = JobStore::new(data_dir).stop(id).await?;
    match &outcome {
        StopOutcome::Signalled { .. } => print_success(&format!("Job {}: {}", id, outcome.describe())),
        StopOutcome::NotFound | StopOutcome::NotRunning(_) => {
            print_info(&format!("Job {}: {}", id, outcome.describe()))
        }
        StopOutcome::UnknownJob | StopOutcome::PermissionDenied | StopOutcome::Failed(_) => {
            print_warn(&format!("Job {}: {}", id, outcome.describe()))
        }
    }
    Ok(())
}

pub async fn list_sessions(data_dir: &Path) -> Result<()> {
    let store = SessionStore::new(data_dir);
    let record = store.snapshot().await?;
    let mut keys: Vec<&String> = record
        .generations
        .keys()
        .chain(record.settings.keys())
        .collect();
    keys.sort();
    keys.dedup();
    if keys.is_empty() {
        print_info("No sessions have been reset or configured yet.");
        return Ok(());
    }

    let mut guide = GuideSection::new(&format!("Sessions ({})", store.path().display()));
    for key in keys {
        let generation = record.generation(key);
        let handle = derive_handle(key, generation);
        let known = if record.known.contains(&handle) { "known" } else { "new" };
        let mut about = format!("gen {}  {}  {}", generation, handle, known);
        if let Some(settings) = record.settings.get(key.as_str()) {
            about.push_str(&format!(
                "  memory={:?} queue={:?} transcript={}",
                settings.memory_mode, settings.queue_mode, settings.transcript_lines
            ));
            if let Some(style) = settings.response_style {
                about.push_str(&format!(" style={}", style));
            }
        }
        guide = guide.command(key, &about);
    }
    guide
        .blank()
        .info(&format!("{} handles in the known set.", record.known.len()))
        .print();
    println!();
    Ok(())
}

pub async fn reset_session(data_dir: &Path, key: &str) -> Result<()> {
    let reset = SessionStore::new(data_dir).reset(key).await?;
    print_success(&format!(
        "Session {} reset to generation {} (handle {}).",
        key, reset.generation, reset.handle
    ));
    Ok(())
}

pub fn follow_logs(data_dir: &Path) -> Result<()> {
    let log_file = data_dir.join("run").join(LOG_FILE);
    if !log_file.exists() {
        GuideSection::new("Live Logs")
            .warn("No log file yet.")
            .blank()
            .info(&format!(
                "Run {} to start herald.",
                style("herald serve").cyan().bold()
            ))
            .print();
        println!();
        return Ok(());
    }
    GuideSection::new("Live Logs")
        .text(&format!(
            "Following {} - press {} to stop.",
            style(LOG_FILE).cyan(),
            style("Ctrl+C").bold().yellow()
        ))
        .print();
    println!();
    let mut child = NativePlatform::tail_file(&log_file)?;
    let _ = child.wait()?;
    Ok(())
}
