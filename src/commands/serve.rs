use std::error::Error;

use log::info;

use super::NodeArgs;

/// Run a node until Ctrl-C.
pub async fn run(node: &NodeArgs) -> Result<(), Box<dyn Error>> {
    let server = node.build_server()?;
    println!("Node id: \x1b[1m{}\x1b[0m", server.node_id());

    let running = server.clone();
    let mut handle = tokio::spawn(async move { running.start().await });

    // the server only ends on its own if it could not listen
    tokio::select! {
        result = tokio::signal::ctrl_c() => result?,
        finished = &mut handle => return Ok(finished??),
    }

    info!("received Ctrl-C, shutting down");
    server.stop();
    handle.await??;
    Ok(())
}
