use std::error::Error;
use std::path::Path;

use log::debug;
use tokio::fs::File;

use super::{start_in_background, NodeArgs};

/// Store `file_path` under `key` and replicate it to the node's peers.
pub async fn run(node: &NodeArgs, key: &str, file_path: &str) -> Result<(), Box<dyn Error>> {
    let path = Path::new(file_path);
    if !path.is_file() {
        return Err(format!("Not a file: {}", file_path).into());
    }

    let server = node.build_server()?;
    let handle = start_in_background(&server, node.peers.len()).await;

    debug!("storing {} as {:?}", file_path, key);
    let file = File::open(path).await?;
    let result = server.store(key, file).await;
    let replicas = server.peer_count();

    server.stop();
    handle.await?;

    let size = result?;
    println!("Stored {:?} ({} bytes), replicated to {} peers", key, size, replicas);
    Ok(())
}
