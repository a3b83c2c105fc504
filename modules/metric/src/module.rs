use std::sync::Arc;
use std::time::Duration;

use arc_swap::ArcSwapOption;
use async_trait::async_trait;
use espresso::events::{ModuleCall, ModuleCallPanic, MODULE_CALL, MODULE_CALL_PANIC};
use espresso::{Module, ModuleCtx, SubscriptionId};
use parking_lot::Mutex;
use prometheus::Registry;
use tracing::{debug, error, info, warn};

use crate::config::MetricConfig;
use crate::model::{CallMetrics, MetricError};

pub const MODULE_UID: &str = "metric_v0.1.0_core";

/// Turns call events published by the network layer into prometheus counters.
///
/// Needs a `prometheus::Registry` in the module context extensions.
#[derive(Default)]
pub struct MetricModule {
    metrics: ArcSwapOption<CallMetrics>,
    subscriptions: Mutex<Vec<(&'static str, SubscriptionId)>>,
}

impl MetricModule {
    pub fn new() -> Self {
        Self::default()
    }

    /// Counters registered by `init`, if it ran.
    pub fn metrics(&self) -> Option<Arc<CallMetrics>> {
        self.metrics.load_full()
    }
}

#[async_trait]
impl Module for MetricModule {
    fn uid(&self) -> String {
        MODULE_UID.to_string()
    }

    async fn init(&self, ctx: &ModuleCtx) -> anyhow::Result<()> {
        info!("Initializing metric module");

        let cfg: MetricConfig = ctx.config()?;
        let registry = ctx.extension::<Registry>().ok_or_else(|| {
            error!("empty prometheus registry");
            MetricError::EmptyRegistry
        })?;

        let metrics = Arc::new(CallMetrics::register(registry)?);
        self.metrics.store(Some(metrics.clone()));

        let slow = Duration::from_millis(cfg.slow_call_ms);
        let calls = metrics.clone();
        let call_id = ctx
            .bus()
            .subscribe_typed(MODULE_CALL, move |e: &ModuleCall| on_module_call(&calls, slow, e));
        let panic_id = ctx
            .bus()
            .subscribe_typed(MODULE_CALL_PANIC, move |e: &ModuleCallPanic| {
                on_module_call_panic(&metrics, e)
            });

        let mut subs = self.subscriptions.lock();
        subs.push((MODULE_CALL, call_id));
        subs.push((MODULE_CALL_PANIC, panic_id));
        debug!(slow_call_ms = cfg.slow_call_ms, "metric module subscribed");
        Ok(())
    }

    async fn clean(&self, ctx: &ModuleCtx) -> anyhow::Result<()> {
        for (topic, id) in self.subscriptions.lock().drain(..) {
            ctx.bus().unsubscribe(topic, id);
        }
        info!("metric module cleaned");
        Ok(())
    }
}

fn on_module_call(metrics: &CallMetrics, slow: Duration, e: &ModuleCall) {
    let cost = Duration::from_nanos(e.cost_time_ns);
    if cost >= slow {
        warn!(
            module = %e.module,
            function = %e.function,
            request_id = %e.request_id,
            cost_ms = cost.as_millis() as u64,
            "slow call"
        );
        metrics.slow_call(&e.module, &e.function);
    }
    metrics.call(&e.module, &e.function);
}

fn on_module_call_panic(metrics: &CallMetrics, e: &ModuleCallPanic) {
    error!(
        module = %e.module,
        function = %e.function,
        request_id = %e.request_id,
        error = %e.error,
        "module panic"
    );
    metrics.panic_call(&e.module, &e.function);
}
