use std::path::PathBuf;

use clap::{Parser, Subcommand};
use tracing::error;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

use airwave::commands;

#[derive(Parser)]
#[command(name = "airwave", version, about = "Aviation-data mission-control backend")]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the ingestion and processing service
    Run {
        /// Directory holding the database and recordings (default: data/)
        #[arg(long)]
        data_dir: Option<PathBuf>,
    },
    /// Delete expired rows and compact the store
    Cleanup {
        #[arg(long)]
        data_dir: Option<PathBuf>,
        /// Override system.database_retention_days
        #[arg(long)]
        message_retention_days: Option<i64>,
        #[arg(long)]
        aircraft_stale_hours: Option<i64>,
        /// Override system.photo_retention_days
        #[arg(long)]
        photo_retention_days: Option<i64>,
    },
}

#[tokio::main]
async fn main() {
    dotenvy::dotenv().ok();

    tracing_subscriber::registry()
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .with(tracing_subscriber::fmt::layer())
        .init();

    let cli = Cli::parse();
    let result = match cli.command {
        Commands::Run { data_dir } => commands::handle_run(data_dir).await,
        Commands::Cleanup {
            data_dir,
            message_retention_days,
            aircraft_stale_hours,
            photo_retention_days,
        } => {
            commands::handle_cleanup(
                data_dir,
                message_retention_days,
                aircraft_stale_hours,
                photo_retention_days,
            )
            .await
        }
    };

    if let Err(e) = result {
        error!(error = %e, "fatal error");
        std::process::exit(1);
    }
}
