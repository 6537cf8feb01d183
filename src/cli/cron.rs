use anyhow::{Result, bail};
use console::style;
use std::path::Path;

use super::ScheduleAddArgs;
use crate::core::config::HeraldConfig;
use crate::core::schedule::{CronJob, load_jobs, parse_timestamp, remove_job, save_jobs, to_cron_expression};
use crate::core::scheduler::validate_schedule;
use crate::core::terminal::{GuideSection, print_info, print_success, print_warn};

pub fn preview(phrase: &str) -> Result<()> {
    let translated = to_cron_expression(phrase);
    let six = validate_schedule(phrase)?;
    GuideSection::new("Schedule Preview")
        .status("Phrase", phrase)
        .status("Cron", &translated)
        .status("Engine", &six)
        .print();
    println!();
    Ok(())
}

async fn jobs_file(data_dir: &Path) -> Result<std::path::PathBuf> {
    let config = HeraldConfig::load(data_dir).await?;
    Ok(config.jobs_file(data_dir))
}

pub async fn list(data_dir: &Path) -> Result<()> {
    let path = jobs_file(data_dir).await?;
    let jobs = load_jobs(&path).await?;
    if jobs.is_empty() {
        print_info(&format!("No scheduled jobs in {}", path.display()));
        return Ok(());
    }

    let mut guide = GuideSection::new(&format!("Scheduled Jobs ({})", path.display()));
    for job in &jobs {
        let when = if job.is_one_shot() {
            match job.run_at_utc() {
                Ok(Some(at)) => format!("once at {}", at.to_rfc3339()),
                Ok(None) => "once (no run_at)".to_string(),
                Err(e) => format!("invalid run_at: {}", e),
            }
        } else {
            match validate_schedule(&job.schedule) {
                Ok(six) => format!("{} [{}]", job.schedule, six),
                Err(_) => format!("{} [{}]", job.schedule, style("invalid").red()),
            }
        };
        let state = if job.enabled { "" } else { " (disabled)" };
        let about = if job.description.is_empty() {
            format!("{}{}", when, state)
        } else {
            format!("{}{} - {}", when, state, job.description)
        };
        guide = guide.command(&job.id, &about);
    }
    guide.print();
    println!();
    Ok(())
}

pub async fn add(data_dir: &Path, args: ScheduleAddArgs) -> Result<()> {
    let path = jobs_file(data_dir).await?;
    let mut jobs = load_jobs(&path).await?;
    if jobs.iter().any(|j| j.id == args.id) {
        bail!("a job with id '{}' already exists", args.id);
    }

    let job = match (&args.schedule, &args.at) {
        (Some(schedule), None) => {
            validate_schedule(schedule)?;
            CronJob {
                id: args.id.clone(),
                schedule: schedule.clone(),
                description: args.description.clone().unwrap_or_default(),
                prompt: args.prompt.clone(),
                enabled: true,
                run_once: false,
                run_at: None,
            }
        }
        (None, Some(at)) => {
            parse_timestamp(at)?;
            CronJob {
                id: args.id.clone(),
                schedule: String::new(),
                description: args.description.clone().unwrap_or_default(),
                prompt: args.prompt.clone(),
                enabled: true,
                run_once: true,
                run_at: Some(at.clone()),
            }
        }
        _ => bail!("give exactly one of --schedule or --at"),
    };

    jobs.push(job);
    save_jobs(&path, &jobs).await?;
    print_success(&format!("Added job '{}' to {}", args.id, path.display()));
    Ok(())
}

pub async fn remove(data_dir: &Path, id: &str) -> Result<()> {
    let path = jobs_file(data_dir).await?;
    if remove_job(&path, id).await? {
        print_success(&format!("Removed job '{}'", id));
    } else {
        print_warn(&format!("No job '{}' in {}", id, path.display()));
    }
    Ok(())
}
