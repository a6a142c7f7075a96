use std::sync::Arc;

use anyhow::Context;
use tracing_subscriber::prelude::*;

use courier::config::{BotConfig, SessionConfig};
use courier::error::{ChannelError, Error};
use courier::fetch::{FetcherSet, HttpFetcher, SwarmClient, TorrentFetcher};
use courier::jobs::JobTracker;
use courier::orchestrator::Orchestrator;
use courier::session::{
    CliConnector, ReconnectPolicy, SessionAdapter, SessionConnector, TelegramConnector,
};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let config = BotConfig::from_env().context("invalid configuration")?;

    init_tracing(&config)?;

    let download_dir = &config.download_dir;
    std::fs::create_dir_all(download_dir)
        .with_context(|| format!("cannot create {}", download_dir.display()))?;

    let http = HttpFetcher::new(config.fetch_timeout)?;
    let swarm = swarm_client(&config).await?;
    let torrent = TorrentFetcher::new(swarm, download_dir.join(".swarm"), config.torrent_timeout);
    let tracker = JobTracker::new(
        FetcherSet::new(Arc::new(http), Arc::new(torrent)),
        config.max_concurrent_fetches,
    );

    let connector: Arc<dyn SessionConnector> = match &config.session {
        SessionConfig::Telegram {
            bot_token,
            api_base,
        } => Arc::new(TelegramConnector::new(bot_token.clone(), api_base.clone())),
        SessionConfig::Cli => Arc::new(CliConnector::new()),
    };
    let policy = ReconnectPolicy {
        max_delay: config.reconnect_max_delay,
        ..ReconnectPolicy::default()
    };
    let session = Arc::new(SessionAdapter::new(connector, policy));

    eprintln!("📬 Courier v{}", env!("CARGO_PKG_VERSION"));
    eprintln!("   Session: {}", config.session.name());
    eprintln!("   Allowed senders: {}", config.allow_list.describe());
    eprintln!(
        "   Relay targets: {}",
        if config.relay_targets.is_empty() {
            "requester".to_string()
        } else {
            config.relay_targets.join(", ")
        }
    );
    eprintln!("   Download dir: {}", download_dir.display());
    eprintln!(
        "   Keywords: {} (http), {} (torrent)",
        config.keywords.http.join(", "),
        config.keywords.torrent.join(", ")
    );
    eprintln!(
        "   Fetch timeout: {}s, max concurrent: {}\n",
        config.fetch_timeout.as_secs(),
        config.max_concurrent_fetches
    );
    if config.allow_list.is_empty() {
        tracing::warn!("COURIER_ALLOWED_SENDERS is empty; every fetch command will be refused");
    }

    let orchestrator = Orchestrator::new(config, tracker, session);
    match orchestrator.run().await {
        Ok(()) => Ok(()),
        Err(Error::Channel(ChannelError::LoggedOut { name })) => {
            eprintln!("Session {name} was logged out. Pair the account again, then restart.");
            anyhow::bail!("session logged out")
        }
        Err(e) => Err(e.into()),
    }
}

fn init_tracing(config: &BotConfig) -> anyhow::Result<()> {
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info"));

    let file_layer = match &config.log_file {
        Some(path) => {
            let file = std::fs::OpenOptions::new()
                .create(true)
                .append(true)
                .open(path)
                .with_context(|| format!("failed to open log file {}", path.display()))?;
            Some(
                tracing_subscriber::fmt::layer()
                    .with_writer(file)
                    .with_ansi(false),
            )
        }
        None => None,
    };

    tracing_subscriber::registry()
        .with(filter)
        .with(
            tracing_subscriber::fmt::layer()
                .with_target(false)
                .with_writer(std::io::stderr),
        )
        .with(file_layer)
        .init();

    Ok(())
}

#[cfg(feature = "rqbit")]
async fn swarm_client(config: &BotConfig) -> anyhow::Result<Arc<dyn SwarmClient>> {
    let swarm = courier::fetch::rqbit::RqbitSwarm::new(config.download_dir.join(".swarm"))
        .await
        .context("failed to start the torrent session")?;
    Ok(Arc::new(swarm))
}

#[cfg(not(feature = "rqbit"))]
async fn swarm_client(_config: &BotConfig) -> anyhow::Result<Arc<dyn SwarmClient>> {
    tracing::info!("Torrent support not compiled in; torrent commands will fail");
    Ok(Arc::new(courier::fetch::UnavailableSwarm))
}
