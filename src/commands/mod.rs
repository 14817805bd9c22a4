//! # Commands Module
//!
//! Command handlers for the `distfs` binary. Every command starts a node from
//! the shared [`NodeArgs`]:
//!
//! ## `serve`
//! Runs a node until Ctrl-C:
//! - Listens for peers and dials the configured seeds
//! - Accepts replicas announced by peers
//! - Serves Get requests from its local disk
//!
//! ## `put`
//! Stores a local file under a key:
//! - Starts a node and waits for its seeds to connect
//! - Writes the file into its own namespace
//! - Replicates it, encrypted, to every connected peer
//!
//! ## `get`
//! Reads a key:
//! - Uses a local copy when one exists
//! - Otherwise asks every connected peer and caches the first answer
//! - Writes the contents to a file or stdout

pub mod get;
pub mod put;
pub mod serve;

use std::error::Error;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use clap::Args;
use indicatif::ProgressBar;
use log::{debug, error, info};

use crate::server::{FileServer, FileServerConfig};
use crate::DEFAULT_LISTEN_ADDR;

/// Node options shared by every command.
#[derive(Args, Debug, Clone)]
pub struct NodeArgs {
    /// Address to listen on
    #[arg(short, long, default_value = DEFAULT_LISTEN_ADDR)]
    pub listen: String,

    /// Peer to connect to at startup (repeatable)
    #[arg(short, long = "peer")]
    pub peers: Vec<String>,

    /// Storage directory (default: <listen address>-storage)
    #[arg(short, long)]
    pub root: Option<PathBuf>,

    /// Shared cluster encryption key, 64 hex characters
    #[arg(short = 'k', long = "key", env = "DISTFS_KEY")]
    pub encryption_key: String,

    /// Node id used as this node's namespace on disk (random when omitted)
    #[arg(long)]
    pub node_id: Option<String>,
}

impl NodeArgs {
    /// `127.0.0.1:3000` becomes `127.0.0.1_3000-storage`.
    pub fn storage_root(&self) -> PathBuf {
        match &self.root {
            Some(root) => root.clone(),
            None => PathBuf::from(format!("{}-storage", self.listen.replace(&[':', '/'][..], "_"))),
        }
    }

    pub fn build_server(&self) -> Result<Arc<FileServer>, Box<dyn Error>> {
        let encryption_key = hex::decode(self.encryption_key.trim())
            .map_err(|e| format!("encryption key is not valid hex: {}", e))?;
        crate::cipher::check_key(&encryption_key)?;

        let mut config = FileServerConfig::new(self.storage_root());
        config.encryption_key = encryption_key;
        config.seeds = self.peers.clone();
        if let Some(node_id) = &self.node_id {
            config.node_id = node_id.clone();
        }

        debug!("node {} storing under {}", config.node_id, config.storage_root.display());
        Ok(FileServer::over_tcp(&self.listen, config))
    }
}

/// Start `server` in the background and give its seeds a moment to connect.
pub async fn start_in_background(
    server: &Arc<FileServer>,
    expected_peers: usize,
) -> tokio::task::JoinHandle<()> {
    let running = Arc::clone(server);
    let handle = tokio::spawn(async move {
        if let Err(e) = running.start().await {
            error!("file server stopped: {}", e);
        }
    });

    if expected_peers > 0 {
        wait_for_peers(server, expected_peers, Duration::from_secs(5)).await;
    }
    handle
}

async fn wait_for_peers(server: &FileServer, expected: usize, limit: Duration) {
    let spinner = ProgressBar::new_spinner();
    spinner.enable_steady_tick(Duration::from_millis(100));
    spinner.set_message("Connecting to peers");

    let deadline = tokio::time::Instant::now() + limit;
    while server.peer_count() < expected && tokio::time::Instant::now() < deadline {
        tokio::time::sleep(Duration::from_millis(50)).await;
    }

    let connected = server.peer_count();
    spinner.finish_with_message(format!("Connected to {} of {} peers", connected, expected));
    info!("connected to {} of {} peers", connected, expected);
}

#[cfg(test)]
mod tests {
    use super::*;

    fn node_args(key: &str) -> NodeArgs {
        NodeArgs {
            listen: "127.0.0.1:3000".to_string(),
            peers: vec!["127.0.0.1:4000".to_string()],
            root: None,
            encryption_key: key.to_string(),
            node_id: Some("node-a".to_string()),
        }
    }

    #[test]
    fn test_default_storage_root() {
        let args = node_args("");
        assert_eq!(args.storage_root(), PathBuf::from("127.0.0.1_3000-storage"));

        let args = NodeArgs { root: Some(PathBuf::from("/tmp/elsewhere")), ..node_args("") };
        assert_eq!(args.storage_root(), PathBuf::from("/tmp/elsewhere"));
    }

    #[test]
    fn test_build_server_checks_key() {
        assert!(node_args("not hex").build_server().is_err());
        assert!(node_args("abcd").build_server().is_err());

        let key = hex::encode(crate::cipher::new_encryption_key());
        let server = node_args(&key).build_server().unwrap();
        assert_eq!(server.node_id(), "node-a");
    }
}
