use std::{path::PathBuf, sync::Arc};

use anyhow::{Context, Result};
use tokio::{net::TcpListener, signal::unix::{SignalKind, signal}};
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

use socks_acl::{config, proxy, state, stats::{MetricsSink, NoopSink, SessionStats, StatsdSink}};

async fn reload_on_sighup(settings: Arc<config::Settings>, state: Arc<state::State>) -> Result<()> {
    let mut hangups = signal(SignalKind::hangup()).context("while installing the SIGHUP handler")?;
    while hangups.recv().await.is_some() {
        info!("SIGHUP received, reloading ACL rules");
        if let Err(err) = state.reload_acl_rules(&settings) {
            error!("Keeping the previous ACL rules: {err:#}");
        }
    }
    Ok(())
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .init();

    let config_path = std::env::args_os()
        .nth(1)
        .map(PathBuf::from)
        .unwrap_or_else(|| PathBuf::from("./config.toml"));
    let settings = Arc::new(config::load(&config_path)?);

    let sink: Arc<dyn MetricsSink> = match settings.stats.statsd_address {
        Some(ref address) => Arc::new(StatsdSink::connect(address, settings.stats.prefix.clone()).await),
        None => Arc::new(NoopSink),
    };
    let stats = Arc::new(SessionStats::new(sink, settings.stats.stats_config()));
    let state = Arc::new(state::init(&settings, stats.clone())?);
    let reporter = stats.spawn_reporter();

    let listener = TcpListener::bind(settings.listen_address)
        .await
        .with_context(|| format!("while binding {}", settings.listen_address))?;
    info!("Listening on {}", settings.listen_address);

    let outcome = tokio::select! {
        res = proxy::start(settings.clone(), state.clone(), listener) => res,
        res = reload_on_sighup(settings.clone(), state.clone()) => res,
        res = tokio::signal::ctrl_c() => res.context("while waiting for Ctrl-C"),
    };

    reporter.shutdown().await;
    info!("exiting");

    outcome
}
