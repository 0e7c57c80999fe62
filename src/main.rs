use std::process::ExitCode;

use anyhow::Context;
use tracing::debug;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use gator::commands::{Command, State};
use gator::config::ConfigStore;
use gator::db::Database;
use gator::error::CommandError;
use gator::fetcher::Fetcher;
use gator::handlers;

#[tokio::main]
async fn main() -> ExitCode {
    // Initialize logging
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "gator=warn".into()),
        )
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .init();

    match run(std::env::args().skip(1)).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            eprintln!("Error: {}", e);
            ExitCode::from(e.exit_code())
        }
    }
}

async fn run<I>(args: I) -> Result<(), CommandError>
where
    I: IntoIterator<Item = String>,
{
    // Usage errors win over a missing or broken config file
    let command = Command::from_args(args)?;

    // Load configuration
    let config_store = ConfigStore::default_location().map_err(CommandError::Config)?;
    let config = config_store.read().map_err(CommandError::Config)?;
    debug!("Loaded configuration from {}", config_store.path().display());

    // Initialize database
    let database_url = std::env::var("DATABASE_URL").unwrap_or_else(|_| config.db_url.clone());
    let db = Database::new(&database_url)
        .await
        .with_context(|| format!("couldn't open database {}", database_url))?;
    db.initialize()
        .await
        .context("couldn't initialize database schema")?;

    let fetcher = Fetcher::new()?;

    let mut state = State {
        db,
        config,
        config_store,
        fetcher,
    };

    handlers::registry().run(&mut state, &command).await
}
