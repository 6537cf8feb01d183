mod cron;
mod inspect;
mod serve;

use anyhow::{Result, bail};
use console::style;

use crate::core::output::Verbosity;
use crate::core::terminal::{self, GuideSection, print_error};
use crate::platform::{NativePlatform, Platform};

pub const LOG_FILE: &str = "herald.log";

fn print_help() {
    terminal::print_banner();

    GuideSection::new("Core")
        .command("serve", "Start every enabled channel and the scheduler")
        .command("run", "Run a single prompt and print the reply")
        .print();

    GuideSection::new("Jobs & Sessions")
        .command("jobs [id]", "List recent runs, or show one")
        .command("stop <id>", "Stop a running job")
        .command("sessions", "List session keys and their handles")
        .command("reset <key>", "Start a new conversation for a session key")
        .print();

    GuideSection::new("Schedule")
        .command("schedule list", "Show the cron job list")
        .command("schedule preview <phrase>", "Translate a schedule phrase")
        .command("schedule add <id> ...", "Add a job (--prompt, --schedule or --at)")
        .command("schedule remove <id>", "Remove a job")
        .print();

    GuideSection::new("Diagnostics")
        .command("logs", "Follow the serve log")
        .command("version", "Print the version")
        .print();

    println!(
        "\n {} {} <command> [options]\n",
        style("Usage:").bold(),
        style("herald").green()
    );
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) struct RunCommandArgs {
    pub prompt: String,
    pub session: Option<String>,
    pub style: Option<Verbosity>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) struct ScheduleAddArgs {
    pub id: String,
    pub prompt: String,
    pub schedule: Option<String>,
    pub at: Option<String>,
    pub description: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) enum Command {
    Serve,
    Run(RunCommandArgs),
    Jobs { id: Option<String>, limit: usize },
    Stop(String),
    Sessions,
    Reset(String),
    ScheduleList,
    SchedulePreview(String),
    ScheduleAdd(ScheduleAddArgs),
    ScheduleRemove(String),
    Logs,
    Version,
    Help,
}

fn flag_value<'a>(args: &'a [String], i: usize, flag: &str) -> Result<&'a str> {
    match args.get(i + 1) {
        Some(v) => Ok(v.as_str()),
        None => bail!("{} needs a value", flag),
    }
}

pub(crate) fn parse_run_command_args(args: &[String], start: usize) -> Result<RunCommandArgs> {
    let mut prompt = String::new();
    let mut session = None;
    let mut style = None;
    let mut i = start;
    while i < args.len() {
        match args[i].as_str() {
            "--prompt" | "-p" => {
                prompt = flag_value(args, i, "--prompt")?.to_string();
                i += 2;
            }
            "--session" | "-s" => {
                session = Some(flag_value(args, i, "--session")?.to_string());
                i += 2;
            }
            "--style" => {
                style = Some(flag_value(args, i, "--style")?.parse::<Verbosity>()?);
                i += 2;
            }
            _ => i += 1,
        }
    }
    if prompt.trim().is_empty() {
        bail!("--prompt is required for run mode.");
    }
    Ok(RunCommandArgs {
        prompt,
        session,
        style,
    })
}

pub(crate) fn parse_schedule_add_args(args: &[String], start: usize) -> Result<ScheduleAddArgs> {
    let mut id = None;
    let mut prompt = String::new();
    let mut schedule = None;
    let mut at = None;
    let mut description = None;
    let mut i = start;
    while i < args.len() {
        match args[i].as_str() {
            "--prompt" | "-p" => {
                prompt = flag_value(args, i, "--prompt")?.to_string();
                i += 2;
            }
            "--schedule" => {
                schedule = Some(flag_value(args, i, "--schedule")?.to_string());
                i += 2;
            }
            "--at" => {
                at = Some(flag_value(args, i, "--at")?.to_string());
                i += 2;
            }
            "--description" | "-d" => {
                description = Some(flag_value(args, i, "--description")?.to_string());
                i += 2;
            }
            other => {
                if id.is_none() {
                    id = Some(other.to_string());
                }
                i += 1;
            }
        }
    }
    let Some(id) = id else {
        bail!("Usage: herald schedule add <id> --prompt <text> (--schedule <phrase> | --at <time>)");
    };
    if prompt.trim().is_empty() {
        bail!("--prompt is required");
    }
    Ok(ScheduleAddArgs {
        id,
        prompt,
        schedule,
        at,
        description,
    })
}

pub(crate) fn parse_command(args: &[String]) -> Result<Command> {
    let Some(cmd) = args.get(1) else {
        return Ok(Command::Help);
    };
    let arg = |i: usize| args.get(i).map(|s| s.trim()).filter(|s| !s.is_empty());
    match cmd.as_str() {
        "serve" | "start" => Ok(Command::Serve),
        "run" => Ok(Command::Run(parse_run_command_args(args, 2)?)),
        "jobs" => {
            let mut id = None;
            let mut limit = 20;
            let mut i = 2;
            while i < args.len() {
                match args[i].as_str() {
                    "--limit" | "-n" => {
                        limit = flag_value(args, i, "--limit")?.parse().unwrap_or(20);
                        i += 2;
                    }
                    other => {
                        id = Some(other.to_string());
                        i += 1;
                    }
                }
            }
            Ok(Command::Jobs { id, limit })
        }
        "stop" => match arg(2) {
            Some(id) => Ok(Command::Stop(id.to_string())),
            None => bail!("Usage: herald stop <job-id>"),
        },
        "sessions" => Ok(Command::Sessions),
        "reset" => match arg(2) {
            Some(key) => Ok(Command::Reset(key.to_string())),
            None => bail!("Usage: herald reset <session-key>"),
        },
        "schedule" => match args.get(2).map(String::as_str) {
            Some("list") | None => Ok(Command::ScheduleList),
            Some("preview") => {
                let phrase = args[3.min(args.len())..].join(" ");
                if phrase.trim().is_empty() {
                    bail!("Usage: herald schedule preview <phrase>");
                }
                Ok(Command::SchedulePreview(phrase))
            }
            Some("add") => Ok(Command::ScheduleAdd(parse_schedule_add_args(args, 3)?)),
            Some("remove") | Some("rm") => match arg(3) {
                Some(id) => Ok(Command::ScheduleRemove(id.to_string())),
                None => bail!("Usage: herald schedule remove <id>"),
            },
            Some(other) => bail!(
                "Unknown schedule command '{}'. Expected: list, preview, add, remove",
                other
            ),
        },
        "logs" => Ok(Command::Logs),
        "version" | "--version" | "-V" => Ok(Command::Version),
        "help" | "--help" | "-h" => Ok(Command::Help),
        other => bail!("Unknown command '{}'. Run 'herald help' for the list.", other),
    }
}

pub async fn run_main() -> Result<()> {
    let args: Vec<String> = std::env::args().collect();
    let command = match parse_command(&args) {
        Ok(command) => command,
        Err(e) => {
            print_error(&format!("{:#}", e));
            print_help();
            std::process::exit(2);
        }
    };

    let data_dir = NativePlatform::data_dir();
    match command {
        Command::Serve => serve::serve(&data_dir).await,
        Command::Run(run) => serve::run_once(&data_dir, run).await,
        Command::Jobs { id: Some(id), .. } => inspect::show_job(&data_dir, &id).await,
        Command::Jobs { id: None, limit } => inspect::list_jobs(&data_dir, limit).await,
        Command::Stop(id) => inspect::stop_job(&data_dir, &id).await,
        Command::Sessions => inspect::list_sessions(&data_dir).await,
        Command::Reset(key) => inspect::reset_session(&data_dir, &key).await,
        Command::ScheduleList => cron::list(&data_dir).await,
        Command::SchedulePreview(phrase) => cron::preview(&phrase),
        Command::ScheduleAdd(add) => cron::add(&data_dir, add).await,
        Command::ScheduleRemove(id) => cron::remove(&data_dir, &id).await,
        Command::Logs => inspect::follow_logs(&data_dir),
        Command::Version => {
            println!("herald {}", env!("CARGO_PKG_VERSION"));
            Ok(())
        }
        Command::Help => {
            print_help();
            Ok(())
        }
    }
}
