//! Local cluster binary
//!
//! Runs several Keel nodes in one process against an in-memory coordination
//! store, each serving its HTTP API on its own port.

use async_trait::async_trait;
use keel_core::coordinator::Resource;
use keel_core::runtime::ShutdownSignal;
use keel_core::store::MemoryCluster;
use keel_core::worker::{ConsumerRegistry, ResourceConsumer};
use keel_core::{http, telemetry, KeelConfig, KeelError, NodeBuilder};
use std::sync::Arc;
use tracing::{error, info};

/// Consumer that only logs what it is given
struct LoggingConsumer {
    endpoint: String,
}

#[async_trait]
impl ResourceConsumer for LoggingConsumer {
    async fn feed_resources(&self, resources: Vec<Resource>) -> keel_core::Result<()> {
        let names: Vec<&str> = resources.iter().map(|r| r.name.as_str()).collect();
        info!("{} now replicating {:?}", self.endpoint, names);
        Ok(())
    }
}

/// Port of the `index`-th node
fn node_port(base_port: u16, index: u16) -> keel_core::Result<u16> {
    base_port
        .checked_add(index)
        .ok_or_else(|| KeelError::InvalidConfig {
            reason: format!("KEEL_BASE_PORT {} leaves no room for node {}", base_port, index),
        })
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    telemetry::init()?;

    let nodes: u16 = std::env::var("KEEL_NODES")
        .unwrap_or_else(|_| "3".into())
        .parse()?;
    let base_port: u16 = std::env::var("KEEL_BASE_PORT")
        .unwrap_or_else(|_| keel_core::DEFAULT_PORT.to_string())
        .parse()?;
    let input_plugin = std::env::var("KEEL_INPUT_PLUGIN").unwrap_or_else(|_| "mysql".into());
    let resources = std::env::var("KEEL_RESOURCES")
        .unwrap_or_else(|_| "db-a,db-b,db-c,db-d,db-e".into());

    info!("Starting local Keel cluster with {} nodes", nodes);
    let cluster = MemoryCluster::new();
    let shutdown = ShutdownSignal::new();
    let mut running = Vec::new();

    for i in 0..nodes {
        let port = node_port(base_port, i)?;
        let config = KeelConfig {
            endpoint: format!("127.0.0.1:{}", port),
            bind_addr: format!("127.0.0.1:{}", port),
            ..KeelConfig::from_env()?
        };

        let mut consumers = ConsumerRegistry::new();
        consumers.register(
            input_plugin.clone(),
            Arc::new(LoggingConsumer {
                endpoint: config.endpoint.clone(),
            }),
        );

        let listener = tokio::net::TcpListener::bind(&config.bind_addr).await?;
        let node = NodeBuilder::new(config, cluster.connect())
            .consumers(consumers)
            .start()
            .await?;

        let router = node.router();
        let server_shutdown = shutdown.clone();
        tokio::spawn(async move {
            if let Err(e) = http::serve(listener, router, server_shutdown).await {
                error!("HTTP server stopped: {}", e);
            }
        });
        running.push(node);
    }

    if let Some(first) = running.first() {
        for name in resources.split(',').map(str::trim).filter(|n| !n.is_empty()) {
            first
                .admin()
                .register_resource(&Resource::new(input_plugin.clone(), name))
                .await?;
        }
    }

    tokio::signal::ctrl_c().await?;
    info!("Stopping local cluster");

    for node in &running {
        if let Err(e) = node.shutdown().await {
            error!("Node {} did not shut down cleanly: {}", node.endpoint(), e);
        }
    }
    shutdown.shutdown();
    Ok(())
}
