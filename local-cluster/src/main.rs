use color_eyre::eyre::Result;
use tokio::io::{self, AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::sync::broadcast::error::RecvError;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use raftsim_local_cluster::command::Reply;
use raftsim_local_cluster::{spawn_cluster, ClusterConfig};

/// JSON-lines front end: one command per stdin line, replies and state
/// pushes written to stdout. Logs go to stderr.
#[tokio::main]
async fn main() -> Result<()> {
    color_eyre::install()?;
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .with_writer(std::io::stderr)
        .init();

    let config = ClusterConfig::from_env()?;
    info!(
        nodes = config.sim.node_count,
        seed = config.sim.seed,
        tick_ms = config.sim.tick_ms,
        "starting raft simulator"
    );
    let (handle, task) = spawn_cluster(config)?;
    let mut updates = handle.subscribe();
    let mut lines = BufReader::new(io::stdin()).lines();
    let mut stdout = io::stdout();

    loop {
        let out = tokio::select! {
            line = lines.next_line() => {
                let Some(line) = line? else {
                    break;
                };
                if line.trim().is_empty() {
                    continue;
                }
                handle.send_json(&line).await
            }
            update = updates.recv() => match update {
                Ok(snapshot) => Reply::State(snapshot),
                Err(RecvError::Lagged(skipped)) => {
                    warn!(skipped, "output fell behind, skipping state pushes");
                    continue;
                }
                Err(RecvError::Closed) => break,
            },
        };
        stdout.write_all(out.to_json().as_bytes()).await?;
        stdout.write_all(b"\n").await?;
        stdout.flush().await?;
    }

    drop(handle);
    let metrics = task.await?;
    info!(summary = ?metrics.summary(), "simulator stopped");
    Ok(())
}
