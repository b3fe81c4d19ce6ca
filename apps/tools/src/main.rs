use anyhow::{Context, Result};
use clap::{Parser, Subcommand, ValueEnum};
use client_core::{load_settings, ApiClient, SyncBackend};
use serde::Serialize;
use shared::domain::DEFAULT_INSTITUTION;
use tracing_subscriber::EnvFilter;

#[derive(Parser, Debug)]
struct Cli {
    /// Overrides the configured api base url.
    #[arg(long)]
    api_base_url: Option<String>,
    #[arg(long, default_value = DEFAULT_INSTITUTION)]
    institution: String,
    #[command(subcommand)]
    command: Command,
}

#[derive(Clone, Copy, Debug, ValueEnum)]
enum SwitcherKind {
    Party,
    Club,
}

#[derive(Subcommand, Debug)]
enum Command {
    Towns,
    RegisterTown {
        reference: String,
        name: String,
    },
    Seasons {
        city: String,
    },
    Polls {
        city: String,
        season: String,
    },
    Poll {
        reference: String,
    },
    Members {
        city: String,
        season: String,
    },
    Member {
        reference: String,
    },
    MemberVotes {
        reference: String,
    },
    Switchers {
        city: String,
        #[arg(long, value_enum, default_value_t = SwitcherKind::Party)]
        kind: SwitcherKind,
    },
    Status,
    LastRun,
    Trigger {
        town: Option<String>,
    },
    SyncLogs {
        #[arg(long)]
        town: Option<String>,
    },
    DataSources,
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn")))
        .with_writer(std::io::stderr)
        .init();
    let cli = Cli::parse();

    let mut settings = load_settings();
    if let Some(url) = cli.api_base_url {
        settings.api_base_url = url;
    }
    let client = settings
        .build_client()
        .with_context(|| format!("invalid api base url {}", settings.api_base_url))?;
    let institution = cli.institution.as_str();

    match cli.command {
        Command::Towns => print(&client.fetch_towns().await?),
        Command::RegisterTown { reference, name } => {
            print(&client.register_town(&reference, &name).await?)
        }
        Command::Seasons { city } => print(&client.fetch_seasons(&city, institution).await?),
        Command::Polls { city, season } => {
            print(&client.fetch_polls(&city, institution, &season).await?)
        }
        Command::Poll { reference } => print(&client.fetch_poll(&reference).await?),
        Command::Members { city, season } => {
            print(&client.fetch_members(&city, institution, &season).await?)
        }
        Command::Member { reference } => print(&client.fetch_member(&reference).await?),
        Command::MemberVotes { reference } => {
            print(&client.fetch_member_votes(&reference).await?)
        }
        Command::Switchers { city, kind } => print(&switchers(&client, &city, kind).await?),
        Command::Status => print(&client.fetch_status().await?),
        Command::LastRun => print(&client.fetch_last_run().await?),
        Command::Trigger { town } => print(
            &client
                .trigger_sync(town.as_deref())
                .await
                .context("sync trigger rejected")?,
        ),
        Command::SyncLogs { town } => print(&client.fetch_sync_logs(town.as_deref()).await?),
        Command::DataSources => print(&client.fetch_data_sources().await?),
    }
}

async fn switchers(
    client: &ApiClient,
    city: &str,
    kind: SwitcherKind,
) -> Result<Vec<shared::domain::Politician>> {
    let politicians = match kind {
        SwitcherKind::Party => client.fetch_party_switchers(city).await?,
        SwitcherKind::Club => client.fetch_club_switchers(city).await?,
    };
    Ok(politicians)
}

fn print<T: Serialize>(value: &T) -> Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}
