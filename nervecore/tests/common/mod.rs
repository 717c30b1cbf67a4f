#![allow(dead_code)]

use std::sync::Arc;

use nervecore::actions::default_registries;
use nervecore::bus::{BusConfig, SignalBus};
use nervecore::engine::FsmEngine;
use nervecore::extremities::{DeliveryHub, MemoryExtremity};
use nervecore::observability::{RetentionConfig, TraceSink, TraceStore};
use nervecore::runtime::{NerveConfig, RuntimeContext};
use nervecore::store::NerveStore;

/// Everything an engine-level test needs, wired against in-memory stores.
pub struct TestKernel {
    pub ctx: RuntimeContext,
    pub store: NerveStore,
    pub bus: Arc<SignalBus>,
    pub hub: Arc<DeliveryHub>,
    pub trace: Arc<TraceSink>,
    pub cli_outbox: MemoryExtremity,
    pub api_outbox: MemoryExtremity,
}

pub async fn test_kernel() -> TestKernel {
    let store = NerveStore::connect_in_memory().await.expect("store");
    store.catalog().seed_defaults().await.expect("seed catalog");

    let trace_store = TraceStore::connect_in_memory(RetentionConfig::default())
        .await
        .expect("trace store");
    let trace = Arc::new(TraceSink::new(trace_store));

    let cli_outbox = MemoryExtremity::new("cli");
    let api_outbox = MemoryExtremity::new("api");
    let hub = Arc::new(
        DeliveryHub::new()
            .with_trace(Arc::clone(&trace))
            .register(Arc::new(cli_outbox.clone()))
            .register(Arc::new(api_outbox.clone())),
    );

    let bus = Arc::new(SignalBus::new(BusConfig::default()));
    let ctx = RuntimeContext::with_defaults(NerveConfig::default(), store.clone());

    TestKernel {
        ctx,
        store,
        bus,
        hub,
        trace,
        cli_outbox,
        api_outbox,
    }
}

impl TestKernel {
    /// Engine over the seeded default catalog and default registries.
    pub async fn engine(&self) -> FsmEngine {
        let (actions, guards) = default_registries();
        let catalog = self.store.catalog().load().await.expect("catalog");
        FsmEngine::new(
            self.ctx.clone(),
            catalog,
            actions,
            guards,
            Arc::clone(&self.bus),
            Arc::clone(&self.hub),
            Arc::clone(&self.trace),
        )
        .await
        .expect("engine")
    }
}
