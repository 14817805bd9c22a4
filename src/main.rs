use clap::{Parser, Subcommand};
use std::error::Error;
use std::path::PathBuf;

use distfs::commands::NodeArgs;

#[derive(Parser)]
#[command(name = "distfs")]
#[command(about = "Peer-to-peer content-addressable file store", long_about = None)]
#[command(version)]
struct Cli {
    /// Enable verbose logging
    #[arg(short, long, global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run a storage node until Ctrl-C
    Serve {
        #[command(flatten)]
        node: NodeArgs,
    },
    /// Store a file under a key and replicate it to peers
    Put {
        #[command(flatten)]
        node: NodeArgs,
        /// Logical key to store the file under
        key: String,
        /// Path to the file to store
        file_path: String,
    },
    /// Read a key, fetching it from peers when needed
    Get {
        #[command(flatten)]
        node: NodeArgs,
        /// Logical key to read
        key: String,
        /// Write to this file instead of stdout
        #[arg(short, long)]
        out: Option<PathBuf>,
    },
    /// Print a fresh random cluster encryption key
    Keygen,
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn Error>> {
    let cli = Cli::parse();

    // Configure logging based on verbose flag
    if cli.verbose {
        env_logger::Builder::from_default_env()
            .filter_level(log::LevelFilter::Debug)
            .init();
        log::info!("Verbose logging enabled");
    } else {
        env_logger::Builder::from_default_env()
            .filter_level(log::LevelFilter::Info)
            .init();
    }

    match cli.command {
        Commands::Serve { node } => {
            distfs::commands::serve::run(&node).await?;
        }
        Commands::Put { node, key, file_path } => {
            distfs::commands::put::run(&node, &key, &file_path).await?;
        }
        Commands::Get { node, key, out } => {
            distfs::commands::get::run(&node, &key, out.as_deref()).await?;
        }
        Commands::Keygen => {
            println!("{}", hex::encode(distfs::cipher::new_encryption_key()));
        }
    }

    Ok(())
}
