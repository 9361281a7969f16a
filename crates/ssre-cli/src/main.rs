use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use ssre_core::{AppConfig, StoreBackend};
use ssre_storage::{PgRunStore, PoolConfig};
use tracing_subscriber::EnvFilter;

mod demo;

#[derive(Debug, Parser)]
#[command(name = "ssre-cli")]
#[command(about = "Scraper SRE command-line interface")]
struct Cli {
    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Run the HTTP API (default).
    Serve,
    /// Apply database migrations to the configured Postgres store.
    Migrate,
    /// Register a demo scraper and report a working run followed by a drifted one.
    Demo {
        /// API root to report to; defaults to SSRE_API_URL.
        #[arg(long)]
        api_url: Option<String>,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    dotenvy::dotenv().ok();
    let cli = Cli::parse();
    let config = ssre_core::load_app_config_from_env().context("loading configuration")?;
    init_tracing(&config)?;

    match cli.command.unwrap_or(Commands::Serve) {
        Commands::Serve => {
            let state = ssre_web::AppState::from_config(&config).await?;
            ssre_web::serve(&config, state).await?;
        }
        Commands::Migrate => {
            let applied = migrate(&config).await?;
            println!("migrations complete: applied={applied}");
        }
        Commands::Demo { api_url } => {
            let api_url = api_url.unwrap_or_else(|| config.api_url.clone());
            let report = demo::run(&api_url).await?;
            println!(
                "demo complete: scraper_id={} first_run_items={} second_run_items={}",
                report.scraper_id, report.first_run_items, report.second_run_items
            );
            println!("inspect alerts at {api_url}/scrapers/{}/alerts", report.scraper_id);
        }
    }

    Ok(())
}

fn init_tracing(config: &AppConfig) -> Result<()> {
    let env_filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(&config.log_level))
        .context("building log filter")?;
    tracing_subscriber::fmt().with_env_filter(env_filter).init();
    Ok(())
}

async fn migrate(config: &AppConfig) -> Result<usize> {
    let StoreBackend::Postgres { database_url } = &config.store else {
        bail!("migrate requires SSRE_STORE=postgres");
    };
    let store = PgRunStore::connect(
        database_url,
        PoolConfig {
            max_connections: config.db_max_connections,
            acquire_timeout: std::time::Duration::from_secs(config.db_acquire_timeout_secs),
        },
    )
    .await
    .context("connecting to postgres")?;
    store.migrate().await.context("running migrations")
}
