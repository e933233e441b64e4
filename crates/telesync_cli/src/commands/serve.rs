//! Serve command implementation.

use std::net::SocketAddr;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;
use telesync_protocol::Snapshot;
use telesync_server::{ServerConfig, TelemetryServer};
use tracing::{debug, info};

/// Reads a snapshot fixture.
pub fn load_fixture(path: &Path) -> Result<Snapshot, Box<dyn std::error::Error>> {
    let bytes = std::fs::read(path).map_err(|e| format!("cannot read {}: {e}", path.display()))?;
    Ok(Snapshot::decode(&bytes)?)
}

/// Pushes every facet of the current snapshot to stream clients.
/// Returns the number of frames sent.
pub fn republish(server: &TelemetryServer) -> usize {
    server
        .snapshot()
        .into_facets()
        .into_iter()
        .map(|(topic, data)| server.update(topic, data))
        .sum()
}

/// Runs the serve command until Ctrl-C.
pub async fn run(
    bind: SocketAddr,
    fixture: Option<&Path>,
    tick_ms: Option<u64>,
) -> Result<(), Box<dyn std::error::Error>> {
    let server = Arc::new(TelemetryServer::new(ServerConfig::new(bind)));
    if let Some(path) = fixture {
        server.set_snapshot(load_fixture(path)?);
        info!(fixture = %path.display(), "snapshot loaded");
    }

    let ticker = tick_ms.filter(|ms| *ms > 0).map(|ms| {
        let server = Arc::clone(&server);
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(Duration::from_millis(ms));
            loop {
                interval.tick().await;
                let sent = republish(&server);
                debug!(sent, "snapshot republished");
            }
        })
    });

    let result = Arc::clone(&server)
        .serve(async {
            let _ = tokio::signal::ctrl_c().await;
        })
        .await;

    if let Some(ticker) = ticker {
        ticker.abort();
    }
    result?;
    Ok(())
}
