use std::sync::Arc;

use anyhow::{Context, Result};
use clap::Parser;
use client_core::{load_settings, CoordinatorUpdate, SyncCoordinator};
use shared::protocol::{StatusSnapshot, SyncEvent};
use tokio::sync::broadcast::error::RecvError;
use tracing::warn;
use tracing_subscriber::EnvFilter;

#[derive(Parser, Debug)]
#[command(about = "Follows the council data sync job until interrupted")]
struct Args {
    #[arg(long)]
    api_base_url: Option<String>,
    #[arg(long)]
    poll_interval_secs: Option<u64>,
    /// Start a sync before following it.
    #[arg(long)]
    trigger: bool,
    /// Restrict the triggered sync to one town.
    #[arg(long, requires = "trigger")]
    town: Option<String>,
    /// Print events as JSON lines instead of text.
    #[arg(long)]
    json: bool,
    /// Print the effective settings and exit.
    #[arg(long)]
    print_settings: bool,
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();
    let args = Args::parse();

    let mut settings = load_settings();
    if let Some(url) = args.api_base_url {
        settings.api_base_url = url;
    }
    if let Some(secs) = args.poll_interval_secs {
        settings.poll_interval_secs = secs;
    }
    if args.print_settings {
        println!("{}", serde_json::to_string_pretty(&settings)?);
        return Ok(());
    }

    let client = settings
        .build_client()
        .with_context(|| format!("invalid api base url {}", settings.api_base_url))?;
    let coordinator = SyncCoordinator::new(Arc::new(client), settings.coordinator_config());
    let mut updates = coordinator.subscribe_updates();
    coordinator.initialize().await;

    if args.trigger {
        let response = coordinator
            .trigger_sync(args.town.as_deref())
            .await
            .context("sync trigger rejected")?;
        println!("trigger: {} {}", response.status, response.message);
    }

    loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => break,
            update = updates.recv() => match update {
                Ok(update) => print_update(&update, args.json)?,
                Err(RecvError::Lagged(skipped)) => {
                    warn!(skipped, "monitor fell behind; some updates were not printed");
                }
                Err(RecvError::Closed) => break,
            },
        }
    }

    coordinator.shutdown();
    Ok(())
}

fn print_update(update: &CoordinatorUpdate, json: bool) -> Result<()> {
    match update {
        CoordinatorUpdate::StatusChanged(status) => println!("{}", describe_status(status)),
        CoordinatorUpdate::EventAppended(event) if json => {
            println!("{}", serde_json::to_string(event)?)
        }
        CoordinatorUpdate::EventAppended(event) => println!("{}", describe_event(event)),
        CoordinatorUpdate::EventLogTruncated { dropped, retained } => {
            println!("log: dropped {dropped} oldest events, {retained} kept")
        }
        CoordinatorUpdate::EventLogCleared => println!("log: cleared for new run"),
        CoordinatorUpdate::EventLogSeeded { count } => {
            println!("log: {count} events from the last run")
        }
        CoordinatorUpdate::LastRunLoaded(summary) if json => {
            println!("{}", serde_json::to_string(summary)?)
        }
        CoordinatorUpdate::LastRunLoaded(summary) => println!(
            "last run: town={} success={} meetings={}",
            summary.town.as_deref().unwrap_or("all"),
            summary
                .success
                .map_or_else(|| "-".to_string(), |ok| ok.to_string()),
            summary.processed_meetings.unwrap_or_default()
        ),
        CoordinatorUpdate::StreamClosed { reason: Some(reason) } => {
            println!("stream: lost ({reason})")
        }
        CoordinatorUpdate::StreamClosed { reason: None } => println!("stream: closed by server"),
    }
    Ok(())
}

fn describe_status(status: &StatusSnapshot) -> String {
    if !status.running {
        return match status.last_completed_at {
            Some(at) => format!("status: idle, last completed {at}"),
            None => "status: idle".to_string(),
        };
    }
    let progress = status
        .progress()
        .map(|p| format!(" {:.0}%", p * 100.0))
        .unwrap_or_default();
    format!(
        "status: running town={} season={} phase={} {}/{}{progress}",
        status.current_town.as_deref().unwrap_or("-"),
        status.current_season.as_deref().unwrap_or("-"),
        status.current_phase.as_deref().unwrap_or("-"),
        status.processed_meetings,
        status.total_meetings,
    )
}

fn describe_event(event: &SyncEvent) -> String {
    let scope = [event.town.as_deref(), event.season.as_deref(), event.phase.as_deref()]
        .into_iter()
        .flatten()
        .collect::<Vec<_>>()
        .join("/");
    format!(
        "{} {:?} [{scope}] {}",
        event.timestamp.format("%H:%M:%S"),
        event.level,
        event.message
    )
}
