use std::error::Error;
use std::path::Path;

use log::debug;
use tokio::io::AsyncWriteExt;

use super::{start_in_background, NodeArgs};

/// Fetch `key` and write it to `out`, or to stdout when `out` is `None`.
pub async fn run(node: &NodeArgs, key: &str, out: Option<&Path>) -> Result<(), Box<dyn Error>> {
    let server = node.build_server()?;
    let handle = start_in_background(&server, node.peers.len()).await;

    let result = async {
        let (size, mut file) = server.get(key).await?;
        debug!("reading {} bytes for {:?}", size, key);

        match out {
            Some(out) => {
                let mut dst = tokio::fs::File::create(out).await?;
                tokio::io::copy(&mut file, &mut dst).await?;
                dst.flush().await?;
                println!("File saved: {}", out.display());
            }
            None => {
                let mut stdout = tokio::io::stdout();
                tokio::io::copy(&mut file, &mut stdout).await?;
                stdout.flush().await?;
            }
        }
        Ok::<(), Box<dyn Error>>(())
    }
    .await;

    server.stop();
    handle.await?;
    result
}
