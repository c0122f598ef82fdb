use anyhow::Result;
use clap::{Parser, Subcommand};
use tracing_subscriber::EnvFilter;

mod commands;
mod error;
mod utils;

#[derive(Parser)]
#[command(name = "layerpress")]
#[command(about = "Export build layers as OCI images under gzip, zstd or nydus compression")]
#[command(version = "0.1.0")]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Export layer tarballs as an image
    Export(commands::export::ExportArgs),
    /// Show the layers of an exported or remote image
    Inspect {
        /// Manifest digest or image name (e.g., localhost:5000/app:v1)
        image: String,
    },
    /// List exported images
    List,
    /// Remove an exported image tag
    Remove {
        /// Image name (e.g., localhost:5000/app:v1)
        image: String,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn")),
        )
        .with_target(false)
        .init();

    let cli = Cli::parse();

    match cli.command {
        Commands::Export(args) => {
            commands::export::execute(args).await?;
        }
        Commands::Inspect { image } => {
            commands::inspect::execute(&image).await?;
        }
        Commands::List => {
            commands::list::execute().await?;
        }
        Commands::Remove { image } => {
            commands::remove::execute(&image).await?;
        }
    }

    Ok(())
}
