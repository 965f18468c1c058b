//! tetherd entry point.

use std::sync::Arc;
use tetherd::config::Config;
use tetherd::jobs::JobDispatcher;
use tetherd::network::Listener;
use tetherd::state::Bouncer;
use tokio::io::AsyncReadExt;
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let path = std::env::args()
        .nth(1)
        .unwrap_or_else(|| "tetherd.toml".to_string());
    let config = Config::load(&path)?;
    info!(config = %path, "starting tetherd");

    let (jobs, wake_rx) = JobDispatcher::new()?;
    let bouncer = Bouncer::new(config, jobs);

    spawn_completion_drain(Arc::clone(&bouncer), wake_rx)?;

    let listen_configs = bouncer.config().listeners.clone();
    let mut listeners = Vec::new();
    for listen in &listen_configs {
        match Listener::bind(listen, Arc::clone(&bouncer)).await {
            Ok(handle) => listeners.push(handle),
            Err(err) => error!(
                address = %listen.address,
                code = err.error_code(),
                %err,
                "failed to open listener"
            ),
        }
    }
    if listeners.is_empty() {
        warn!("no listeners open");
    }

    tokio::signal::ctrl_c().await?;
    info!("shutting down");
    for listener in &listeners {
        listener.close();
    }
    Ok(())
}

/// Watch the job dispatcher's wake pipe and run completion callbacks
/// on the reactor whenever worker threads finish jobs.
fn spawn_completion_drain(
    bouncer: Arc<Bouncer>,
    wake_rx: std::os::unix::net::UnixStream,
) -> anyhow::Result<()> {
    let mut wake = tokio::net::UnixStream::from_std(wake_rx)?;
    tokio::spawn(async move {
        let mut buf = [0u8; 64];
        loop {
            match wake.read(&mut buf).await {
                Ok(0) => break,
                Ok(_) => {
                    bouncer.jobs().poll_completions();
                }
                Err(err) => {
                    error!(%err, "job wake pipe failed");
                    break;
                }
            }
        }
    });
    Ok(())
}
