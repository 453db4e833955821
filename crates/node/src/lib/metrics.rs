use prometheus::{IntCounter, IntGauge, Opts, Registry};

pub struct NodeMetrics {
    pub head_slot: IntGauge,
    pub finalized_epoch: IntGauge,
    pub connected_peers: IntGauge,
    pub blocks_imported: IntCounter,
    pub blocks_rejected: IntCounter,
    pub attestations_processed: IntCounter,
    pub sync_batches_completed: IntCounter,
    pub peers_downgraded: IntCounter,
}

fn register_int_counter(registry: &Registry, namespace: &str, name: &str, help: &str) -> IntCounter {
    let opts = Opts::new(name, help).namespace(namespace.to_string());
    let counter = IntCounter::with_opts(opts).unwrap();
    registry.register(Box::new(counter.clone())).unwrap();
    counter
}

fn register_int_gauge(registry: &Registry, namespace: &str, name: &str, help: &str) -> IntGauge {
    let opts = Opts::new(name, help).namespace(namespace.to_string());
    let gauge = IntGauge::with_opts(opts).unwrap();
    registry.register(Box::new(gauge.clone())).unwrap();
    gauge
}

pub fn setup_prometheus(namespace: &str) -> (Registry, NodeMetrics) {
    let registry = Registry::new();
    let metrics = NodeMetrics {
        head_slot: register_int_gauge(&registry, namespace, "head_slot", "Canonical head slot"),
        finalized_epoch: register_int_gauge(
            &registry,
            namespace,
            "finalized_epoch",
            "Latest finalized epoch",
        ),
        connected_peers: register_int_gauge(
            &registry,
            namespace,
            "connected_peers",
            "Connected peer count",
        ),
        blocks_imported: register_int_counter(
            &registry,
            namespace,
            "blocks_imported_total",
            "Blocks accepted by the state transition",
        ),
        blocks_rejected: register_int_counter(
            &registry,
            namespace,
            "blocks_rejected_total",
            "Blocks rejected by the state transition",
        ),
        attestations_processed: register_int_counter(
            &registry,
            namespace,
            "attestations_processed_total",
            "Attestations folded into fork choice",
        ),
        sync_batches_completed: register_int_counter(
            &registry,
            namespace,
            "sync_batches_completed_total",
            "Sync batches applied to the chain",
        ),
        peers_downgraded: register_int_counter(
            &registry,
            namespace,
            "peers_downgraded_total",
            "Peers penalized for bad responses",
        ),
    };
    (registry, metrics)
}
