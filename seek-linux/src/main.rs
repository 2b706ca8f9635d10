// Seek Linux: holds a server session and logs client activity until signalled.

mod config;

use anyhow::Context;
use seek_core::{ClientEvent, SoulseekClient};
use tokio::sync::broadcast::error::RecvError;
use tracing::{debug, info, warn};

const VERSION: &str = env!("CARGO_PKG_VERSION");

fn main() -> anyhow::Result<()> {
    for arg in std::env::args().skip(1) {
        if arg == "--version" || arg == "-V" {
            println!("seek-linux {}", VERSION);
            return Ok(());
        }
    }

    let cfg = config::load()?;
    let level: tracing::Level = cfg
        .log_level
        .parse()
        .with_context(|| format!("invalid log level {:?}", cfg.log_level))?;
    tracing_subscriber::fmt().with_max_level(level).init();

    let rt = tokio::runtime::Runtime::new()?;
    rt.block_on(run(cfg))
}

async fn run(cfg: config::Config) -> anyhow::Result<()> {
    let server = tokio::net::lookup_host(cfg.server.as_str())
        .await
        .with_context(|| format!("resolving {}", cfg.server))?
        .find(|a| a.is_ipv4())
        .with_context(|| format!("{} has no IPv4 address", cfg.server))?;

    let client = SoulseekClient::new(cfg.client.clone());
    let events = client.subscribe();
    let logger = tokio::spawn(log_events(events));

    client
        .connect(server)
        .await
        .with_context(|| format!("connecting to {}", cfg.server))?;
    // Login itself belongs to the session layer; the daemon only records it.
    match &cfg.username {
        Some(username) => client.set_logged_in(username)?,
        None => warn!("no username configured; peer operations are unavailable"),
    }
    info!(server = %server, version = VERSION, "seek-linux running");

    shutdown_signal().await?;
    info!("shutting down");
    client.disconnect("shutdown");
    drop(client);
    let _ = logger.await;
    Ok(())
}

async fn log_events(mut events: tokio::sync::broadcast::Receiver<ClientEvent>) {
    loop {
        match events.recv().await {
            Ok(ClientEvent::StateChanged { previous, current }) => {
                info!(?previous, ?current, "client state changed");
            }
            Ok(ClientEvent::Disconnected { reason }) => warn!(%reason, "disconnected from server"),
            Ok(ClientEvent::TransferStateChanged(change)) => {
                let t = &change.transfer;
                info!(
                    token = t.token,
                    username = %t.username,
                    filename = %t.filename,
                    previous = ?change.previous,
                    current = ?t.state,
                    "transfer"
                );
            }
            Ok(ClientEvent::TransferProgressUpdated(p)) => {
                debug!(token = p.transfer.token, percent = p.transfer.percent_complete(), "progress");
            }
            Ok(ClientEvent::DistributedSearchReceived(search)) => {
                debug!(username = %search.username, query = %search.query, "distributed search");
            }
            Ok(ClientEvent::BranchChanged(position)) => {
                info!(level = ?position.level, root = ?position.root, parent = ?position.parent, "branch");
            }
            Err(RecvError::Lagged(n)) => warn!(skipped = n, "event log fell behind"),
            Err(RecvError::Closed) => break,
        }
    }
}

/// Wait for Ctrl+C or SIGTERM (Unix).
async fn shutdown_signal() -> anyhow::Result<()> {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};
        let mut sigterm = signal(SignalKind::terminate())?;
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {}
            _ = sigterm.recv() => {}
        }
    }
    #[cfg(not(unix))]
    {
        tokio::signal::ctrl_c().await?;
    }
    Ok(())
}
