use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use tracing::info;

use eth2_beacon_consensus::bls::AcceptAllSignatures;
use eth2_beacon_consensus::chain_spec::{ChainSpec, ForkName};
use eth2_beacon_consensus::testing;
use eth2_beacon_consensus::transition::ConsensusDriver;
use eth2_beacon_node::config::NodeConfig;
use eth2_beacon_node::logging;
use eth2_beacon_node::metrics::setup_prometheus;
use eth2_beacon_node::server::{self, ServerContext};
use eth2_beacon_node::service::{NetworkStub, NodeEvent, NodeService, StoreBackedProvider};
use eth2_beacon_store::{Store, StoreConfig};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let _ = dotenvy::dotenv();
    let config = NodeConfig::from_env();
    logging::init_logging(&config);
    info!(?config, "starting beacon node");

    let spec = Arc::new(ChainSpec::mainnet());
    let store = Arc::new(
        Store::open(
            &config.data_dir,
            StoreConfig {
                state_storage_frequency: config.state_storage_frequency,
            },
            spec.clone(),
            ForkName::Altair,
        )
        .context("opening the store")?,
    );

    // Development genesis: a deterministic validator set. A production
    // deployment boots from a finalized anchor instead.
    let (genesis_state, anchor) =
        testing::genesis(ForkName::Altair, spec, config.dev_validator_count);
    let driver = ConsensusDriver::from_anchor(
        StoreBackedProvider::new(store),
        AcceptAllSignatures,
        anchor,
        genesis_state,
    )
    .context("building the consensus driver")?;

    let (registry, metrics) = setup_prometheus("beacon");
    let (mut service, events) = NodeService::new(driver, NetworkStub, Arc::new(metrics));
    service.start();

    server::launch(Arc::new(ServerContext { registry }), config.bind_addr);

    // Wall-clock ticks drive timeouts and the slot clock.
    let tick_events = events.clone();
    tokio::spawn(async move {
        let started = std::time::Instant::now();
        let mut interval = tokio::time::interval(Duration::from_secs(1));
        loop {
            interval.tick().await;
            let now_ms = started.elapsed().as_millis() as u64;
            if tick_events.send(NodeEvent::Tick { now_ms }).is_err() {
                return;
            }
        }
    });

    let shutdown_events = events.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            info!("shutdown signal received");
            let _ = shutdown_events.send(NodeEvent::Shutdown);
        }
    });

    service.run().await;
    Ok(())
}
