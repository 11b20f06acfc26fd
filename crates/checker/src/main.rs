//! node-checker binary
//!
//! Reads the configuration from the environment, connects to the weight
//! store and keeps the fleet's weights in line with node health until
//! Ctrl-C.

use std::sync::Arc;

use anyhow::{Context, Result};
use tokio::sync::watch;
use tracing::{debug, error, info};
use tracing_subscriber::EnvFilter;

use node_checker::{
    supervise, CheckerConfig, Connect, EtcdWeightStore, HttpNodeRpc, Node, NodeRpc, RpcError, WeightStore,
};

fn init_tracing(config: &CheckerConfig) -> Result<()> {
    let filter = EnvFilter::try_new(&config.log_level)
        .with_context(|| format!("invalid LOG_LEVEL {:?}", config.log_level))?;

    if config.log_pretty {
        tracing_subscriber::fmt().with_env_filter(filter).with_target(false).init();
    } else {
        tracing_subscriber::fmt().with_env_filter(filter).json().init();
    }
    Ok(())
}

// ════════════════════════════════════════════════════════════════════════════
// MAIN
// ════════════════════════════════════════════════════════════════════════════

#[tokio::main]
async fn main() -> Result<()> {
    let config = match CheckerConfig::from_env() {
        Ok(config) => config,
        Err(e) => {
            eprintln!("configuration error: {e}");
            std::process::exit(1);
        }
    };
    init_tracing(&config)?;

    info!(
        etcd = ?config.etcd.hosts,
        prefix = %config.server_prefix,
        platform = %config.test_platform,
        interval_ms = config.check_interval.as_millis() as u64,
        "Started"
    );

    let store: Arc<dyn WeightStore> = Arc::new(
        EtcdWeightStore::new(&config.etcd, config.server_prefix.clone(), config.request_timeout)
            .context("building etcd client")?,
    );

    let client = reqwest::Client::builder()
        .timeout(config.request_timeout)
        .build()
        .context("building node rpc client")?;
    let connect: Arc<Connect> = Arc::new(move |node: &Node| {
        Ok::<_, RpcError>(Arc::new(HttpNodeRpc::with_client(node.url.clone(), client.clone())) as Arc<dyn NodeRpc>)
    });

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    tokio::spawn(async move {
        match tokio::signal::ctrl_c().await {
            Ok(()) => info!("Shutdown signal received"),
            Err(e) => {
                error!(error = %e, "cannot listen for shutdown signal");
                // Dropping the sender would stop the checker.
                std::future::pending::<()>().await;
            }
        }
        if shutdown_tx.send(true).is_err() {
            debug!("checker already stopped before shutdown signal");
        }
    });

    supervise(config, store, connect, shutdown_rx).await;

    info!("node-checker shutdown complete");
    Ok(())
}
