/*!
Kernel assembly.

The heart connects the store, loads and validates the catalog, builds the
registries, and spawns every worker: the FSM consumer (the heart's own
loop), the queue poller, the timed scheduler, the plan worker, the slice
executor pool, the senses, the gateway, and observability maintenance.

Shutdown: a `shutdown_requested` signal drives the FSM into its terminal
state; the heart then refuses new publishes, drains the bus, stops senses,
flushes the trace store, and returns once every worker has acknowledged.
*/

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use miette::Diagnostic;
use thiserror::Error;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::instrument;

use crate::actions::default_registries;
use crate::bus::{BusConfig, DurableSink, SignalBus};
use crate::catalog::CatalogError;
use crate::engine::{EngineError, EngineExit, FsmEngine};
use crate::extremities::{CliExtremity, DeliveryHub, SseHub};
use crate::gateway::{self, GatewayState};
use crate::observability::{RetentionConfig, TraceLevel, TraceSink, TraceStore};
use crate::plans::{PlanRegistry, PlanWorker};
use crate::runtime::{NerveConfig, RuntimeContext};
use crate::senses::{ApiSense, Sense, SenseManager};
use crate::signal::Signal;
use crate::slices::{SliceExecutor, SliceExecutorConfig, SliceDriver, StepListDriver};
use crate::store::{NerveStore, StoreError};
use crate::timed::TimedScheduler;

#[derive(Debug, Error, Diagnostic)]
pub enum HeartError {
    #[error(transparent)]
    #[diagnostic(transparent)]
    Store(#[from] StoreError),

    #[error(transparent)]
    #[diagnostic(transparent)]
    Catalog(#[from] CatalogError),

    #[error(transparent)]
    #[diagnostic(transparent)]
    Engine(#[from] EngineError),

    #[error("plan registry error: {0}")]
    #[diagnostic(code(nervecore::heart::plans))]
    Plans(String),

    #[error("gateway error: {0}")]
    #[diagnostic(code(nervecore::heart::gateway))]
    Gateway(#[from] std::io::Error),
}

/// Bridges the bus's durable path onto the signal queue.
struct QueueSink {
    store: NerveStore,
}

#[async_trait]
impl DurableSink for QueueSink {
    async fn persist(&self, signal: &Signal) -> Result<(), String> {
        self.store
            .signal_queue()
            .enqueue(signal)
            .await
            .map(|_| ())
            .map_err(|err| err.to_string())
    }
}

pub struct Heart {
    config: Arc<NerveConfig>,
    store: NerveStore,
    bus: Arc<SignalBus>,
    ctx: RuntimeContext,
    hub: Arc<DeliveryHub>,
    sse: Arc<SseHub>,
    trace: Arc<TraceSink>,
    plan_registry: Arc<PlanRegistry>,
    slice_driver: Arc<dyn SliceDriver>,
    senses: Vec<Arc<dyn Sense>>,
    gateway_enabled: bool,
}

impl Heart {
    /// Connect, migrate, seed, and validate. Fatal conditions (store
    /// unreachable, empty catalog, unknown handler keys) surface here, not
    /// mid-run.
    #[instrument(skip(config, senses), err)]
    pub async fn start(
        config: NerveConfig,
        senses: Vec<Arc<dyn Sense>>,
    ) -> Result<Self, HeartError> {
        let config = Arc::new(config);
        let store = NerveStore::connect(&config.db_path).await?;

        let retention = RetentionConfig {
            non_error_ttl_days: config.observability_non_error_ttl_days,
            error_ttl_days: config.observability_error_ttl_days,
            max_rows: config.observability_max_rows,
            maintenance_interval: config.observability_maintenance,
        };
        let trace_store = TraceStore::connect(&config.observability_db_path, retention).await?;
        let trace = Arc::new(TraceSink::new(trace_store));

        store.catalog().seed_defaults().await?;

        let bus = Arc::new(SignalBus::new(BusConfig::new(
            config.bus_capacity,
            Default::default(),
        )));
        bus.set_durable_sink(Arc::new(QueueSink {
            store: store.clone(),
        }));

        let sse = Arc::new(SseHub::new());
        let hub = Arc::new(
            DeliveryHub::new()
                .with_trace(Arc::clone(&trace))
                .register(Arc::new(CliExtremity))
                .register(Arc::clone(&sse) as Arc<dyn crate::extremities::Extremity>),
        );

        let ctx = RuntimeContext::with_defaults((*config).clone(), store.clone());

        let plan_registry = Arc::new(PlanRegistry::with_builtin_kinds());
        plan_registry
            .sync_to_store(&ctx)
            .await
            .map_err(|err| HeartError::Plans(err.to_string()))?;

        Ok(Self {
            config,
            store,
            bus,
            ctx,
            hub,
            sse,
            trace,
            plan_registry,
            slice_driver: Arc::new(StepListDriver),
            senses,
            gateway_enabled: true,
        })
    }

    /// Replace the default slice driver (tests use scripted drivers).
    #[must_use]
    pub fn with_slice_driver(mut self, driver: Arc<dyn SliceDriver>) -> Self {
        self.slice_driver = driver;
        self
    }

    #[must_use]
    pub fn without_gateway(mut self) -> Self {
        self.gateway_enabled = false;
        self
    }

    pub fn bus(&self) -> Arc<SignalBus> {
        Arc::clone(&self.bus)
    }

    pub fn store(&self) -> &NerveStore {
        &self.store
    }

    /// Run until shutdown. The calling task becomes the FSM consumer.
    #[instrument(skip(self), err)]
    pub async fn run(self) -> Result<(), HeartError> {
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let mut handles: Vec<JoinHandle<()>> = Vec::new();

        // Engine first: catalog validation is fatal before any worker spawns.
        let (actions, guards) = default_registries();
        let catalog = self.store.catalog().load().await?;
        let consumer = self.bus.take_consumer();
        let engine = FsmEngine::new(
            self.ctx.clone(),
            catalog,
            actions,
            guards,
            Arc::clone(&self.bus),
            Arc::clone(&self.hub),
            Arc::clone(&self.trace),
        )
        .await?;

        // Queue poller: re-feeds durable rows that nobody consumed, e.g.
        // after a crash.
        {
            let queue = self.store.signal_queue();
            let bus = Arc::clone(&self.bus);
            let mut shutdown = shutdown_rx.clone();
            handles.push(tokio::spawn(async move {
                let mut ticker = tokio::time::interval(Duration::from_secs(5));
                ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
                let worker_id = format!("queue-poller-{}", std::process::id());
                loop {
                    tokio::select! {
                        _ = shutdown.changed() => break,
                        _ = ticker.tick() => {
                            let _ = queue.reclaim_stale(chrono::Duration::minutes(5)).await;
                            match queue
                                .claim_overdue(32, &worker_id, chrono::Duration::seconds(30))
                                .await
                            {
                                Ok(signals) => {
                                    for mut signal in signals {
                                        // Already persisted; skip the durable sink.
                                        signal.durable = false;
                                        if bus.publish(signal).await.is_err() {
                                            return;
                                        }
                                    }
                                }
                                Err(err) => {
                                    tracing::warn!(error = %err, "queue poll failed");
                                }
                            }
                        }
                    }
                }
            }));
        }

        // Timed scheduler.
        {
            let scheduler = TimedScheduler::new(
                &self.store,
                Arc::clone(&self.bus),
                Arc::clone(&self.trace),
                self.config.scheduler_tick,
                self.config.scheduler_lease,
            );
            handles.push(tokio::spawn(scheduler.run(shutdown_rx.clone())));
        }

        // Plan worker, nudged by plan.run signals on a bus tap.
        {
            let worker = PlanWorker::new(
                self.ctx.clone(),
                Arc::clone(&self.plan_registry),
                Arc::clone(&self.bus),
                Arc::clone(&self.hub),
                Arc::clone(&self.trace),
            );
            let tap = self.bus.subscribe_tap();
            handles.push(tokio::spawn(worker.run(shutdown_rx.clone(), tap)));
        }

        // Slice executor pool: one lease per task, cross-task parallelism.
        for index in 0..self.config.slice_workers {
            let executor = SliceExecutor::new(
                self.ctx.clone(),
                Arc::clone(&self.bus),
                Arc::clone(&self.hub),
                Arc::clone(&self.trace),
                Arc::clone(&self.slice_driver),
                SliceExecutorConfig {
                    lease: self.config.slice_lease,
                    default_cycles: self.config.slice_default_cycles,
                    max_runtime: self.config.slice_max_runtime,
                    ..SliceExecutorConfig::default()
                },
                format!("slice-worker-{index}"),
            );
            let tap = self.bus.subscribe_tap();
            handles.push(tokio::spawn(executor.run(shutdown_rx.clone(), tap)));
        }

        // Observability maintenance.
        handles.push(tokio::spawn(
            (*self.trace).clone().run_maintenance_loop(shutdown_rx.clone()),
        ));

        // Store watchdog: if the store stops answering mid-run, refuse new
        // signals but leave in-flight work to the shutdown flush.
        {
            let store = self.store.clone();
            let bus = Arc::clone(&self.bus);
            let trace = Arc::clone(&self.trace);
            let mut shutdown = shutdown_rx.clone();
            handles.push(tokio::spawn(async move {
                let mut ticker = tokio::time::interval(Duration::from_secs(30));
                ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
                loop {
                    tokio::select! {
                        _ = shutdown.changed() => break,
                        _ = ticker.tick() => {
                            if let Err(err) = store.ping().await {
                                tracing::error!(error = %err, "store unreachable, refusing new signals");
                                trace
                                    .event("kernel.store_unavailable", TraceLevel::Error)
                                    .error_code("store_unreachable")
                                    .record()
                                    .await;
                                bus.close();
                                break;
                            }
                        }
                    }
                }
            }));
        }

        // Senses.
        let mut sense_manager = SenseManager::new(self.senses.clone());
        sense_manager.start_all(&self.bus, &shutdown_rx);

        // Gateway.
        if self.gateway_enabled {
            let (ingress, api_sense) = ApiSense::channel();
            handles.push(api_sense.start(Arc::clone(&self.bus), shutdown_rx.clone()));
            let state = GatewayState {
                ingress,
                sse: Arc::clone(&self.sse),
                config: Arc::clone(&self.config),
            };
            let bind = self.config.gateway_bind.clone();
            let shutdown = shutdown_rx.clone();
            handles.push(tokio::spawn(async move {
                if let Err(err) = gateway::serve(state, &bind, shutdown).await {
                    tracing::error!(error = %err, "gateway exited");
                }
            }));
        }

        self.trace
            .event("kernel.started", TraceLevel::Info)
            .detail(serde_json::json!({
                "initial_state": self.config.fsm_initial_state,
            }))
            .record()
            .await;

        // This task is the FSM consumer.
        let exit = engine.run(consumer).await?;
        tracing::info!(exit = ?exit, "fsm consumer finished");

        // Teardown: refuse new publishes, stop workers, flush the trace.
        self.bus.close();
        let _ = shutdown_tx.send(true);
        sense_manager.join_all().await;
        for handle in handles {
            let _ = handle.await;
        }
        if let Err(err) = self.trace.store().run_maintenance().await {
            tracing::warn!(error = %err, "final trace maintenance failed");
        }
        self.trace
            .event("kernel.stopped", TraceLevel::Info)
            .status(match exit {
                EngineExit::TerminalState => "terminal_state",
                EngineExit::BusClosed => "bus_closed",
            })
            .record()
            .await;
        Ok(())
    }
}
