use anyhow::{Result, bail};
use serde_json::json;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use super::{LOG_FILE, RunCommandArgs};
use crate::core::channel::ChannelEvent;
use crate::core::config::HeraldConfig;
use crate::core::executor::JobExecutor;
use crate::core::jobs::{JobStore, RunStatus};
use crate::core::lifecycle::LifecycleManager;
use crate::core::orchestrator::{ExitReason, Orchestrator};
use crate::core::scheduler::{SchedulerComponent, TaskScheduler};
use crate::core::session::SessionStore;
use crate::core::terminal::{self, GuideSection, print_warn};
use crate::interfaces::{self, console};
use crate::logging;
use crate::platform::{NativePlatform, Platform};

fn prepare_data_dir(data_dir: &Path) -> Result<()> {
    std::fs::create_dir_all(data_dir.join("run"))?;
    NativePlatform::restrict_dir_permissions(data_dir);
    Ok(())
}

fn build_executor(data_dir: &Path, config: &HeraldConfig) -> Arc<JobExecutor> {
    Arc::new(JobExecutor::new(
        config.worker.clone(),
        Arc::new(SessionStore::new(data_dir)),
        Arc::new(JobStore::new(data_dir)),
    ))
}

/// Long-running mode. `/restart` from a channel loops back here with a
/// freshly loaded config; Ctrl+C ends it.
pub async fn serve(data_dir: &Path) -> Result<()> {
    prepare_data_dir(data_dir)?;
    let log_path = data_dir.join("run").join(LOG_FILE);
    logging::init(Some(&log_path), false);
    terminal::print_banner();

    let shutdown = CancellationToken::new();
    {
        let shutdown = shutdown.clone();
        tokio::spawn(async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                info!("Ctrl+C received, shutting down");
                shutdown.cancel();
            }
        });
    }

    loop {
        let config = HeraldConfig::load(data_dir).await?;
        let channels = interfaces::build_channels(&config);

        let mut guide = GuideSection::new("herald is running")
            .status("Data", &data_dir.display().to_string())
            .status("Worker", &config.worker.binary)
            .status("Style", config.output.default_verbosity.as_str());
        for channel in &channels {
            guide = guide.status("Channel", channel.name());
        }
        if config.scheduler.enabled {
            guide = guide.status("Schedule", &config.jobs_file(data_dir).display().to_string());
        }
        guide.blank().info("Press Ctrl+C to stop.").print();
        println!();

        let orchestrator = Orchestrator::new(config.output.clone(), build_executor(data_dir, &config), channels);
        let mut lifecycle = LifecycleManager::new().await?;
        if config.scheduler.enabled {
            let scheduler = Arc::new(TaskScheduler::new(
                config.jobs_file(data_dir),
                lifecycle.scheduler.clone(),
                orchestrator.cron_dispatch(),
                Duration::from_secs(config.scheduler.reload_poll_secs.max(1)),
            ));
            lifecycle.attach(Arc::new(Mutex::new(SchedulerComponent::new(scheduler))));
        }

        lifecycle.start().await?;
        let reason = orchestrator.run(shutdown.clone()).await;
        lifecycle.shutdown().await?;

        match reason? {
            ExitReason::Shutdown => break,
            ExitReason::Restart => {
                info!("Restart requested, reloading configuration");
                print_warn("Restarting...");
            }
        }
    }
    Ok(())
}

/// One prompt through the worker, rendered on stdout like the console channel.
pub async fn run_once(data_dir: &Path, args: RunCommandArgs) -> Result<()> {
    prepare_data_dir(data_dir)?;
    logging::init(Some(&data_dir.join("run").join(LOG_FILE)), true);

    let config = HeraldConfig::load(data_dir).await?;
    let executor = build_executor(data_dir, &config);
    let channel = console::ConsoleChannel::new(config.output.clone());

    let session_key = args.session.unwrap_or_else(|| console::CONSOLE_KEY.to_string());
    let verbosity = match args.style {
        Some(style) => style,
        None => match executor.sessions().settings(&session_key).await {
            Ok(settings) => settings
                .response_style
                .unwrap_or(config.output.default_verbosity),
            Err(e) => {
                warn!("Settings for [{}] unreadable: {:#}", session_key, e);
                config.output.default_verbosity
            }
        },
    };

    let event = ChannelEvent::new(session_key, args.prompt.clone(), json!({ "line": args.prompt }));
    let handler = channel.handler_with_sink(Arc::new(console::ConsoleSink::stdout()), verbosity);
    let outcome = executor.execute("console", &event, handler).await;

    match outcome.status {
        RunStatus::Completed => Ok(()),
        RunStatus::Stopped => {
            print_warn(&format!("Job {} was stopped.", outcome.job_id));
            Ok(())
        }
        status => bail!(
            "job {} ended {}: {}",
            outcome.job_id,
            status.as_str(),
            outcome.error.unwrap_or_else(|| "no details".to_string())
        ),
    }
}
