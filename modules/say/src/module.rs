use std::time::Duration;

use async_trait::async_trait;
use espresso::{CallContext, JobId, Module, ModuleCtx};
use parking_lot::Mutex;
use tracing::{debug, info};

use crate::config::SayConfig;
use crate::handlers;

pub const MODULE_UID: &str = "say_v0.1.0";
/// Route prefix of every message this module serves.
pub const MODULE_NAME: &str = "say";

/// Demo module serving `say::hello`, `say::tryPanic` and `say::slow`.
#[derive(Default)]
pub struct SayModule {
    heartbeat: Mutex<Option<JobId>>,
}

impl SayModule {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl Module for SayModule {
    fn uid(&self) -> String {
        MODULE_UID.to_string()
    }

    async fn init(&self, ctx: &ModuleCtx) -> anyhow::Result<()> {
        info!("Initializing say module");

        let cfg: SayConfig = ctx.config()?;
        debug!(
            "Loaded say config: slow_delay_ms={}, heartbeat_cron={:?}",
            cfg.slow_delay_ms, cfg.heartbeat_cron
        );

        let dispatcher = ctx.dispatcher();
        dispatcher.register_typed(MODULE_NAME, "hello", handlers::hello);
        dispatcher.register_typed(MODULE_NAME, "tryPanic", handlers::try_panic);
        let delay = Duration::from_millis(cfg.slow_delay_ms);
        dispatcher.register_typed(
            MODULE_NAME,
            "slow",
            move |call: CallContext, req: handlers::EmptyRequest| handlers::slow(call, req, delay),
        );

        if let Some(spec) = cfg.heartbeat_cron.as_deref() {
            let id = ctx.scheduler().schedule(spec, || async {
                info!(module = MODULE_NAME, "heartbeat");
            })?;
            *self.heartbeat.lock() = Some(id);
        }
        Ok(())
    }

    async fn clean(&self, ctx: &ModuleCtx) -> anyhow::Result<()> {
        if let Some(id) = self.heartbeat.lock().take() {
            ctx.scheduler().unschedule(id);
        }
        Ok(())
    }
}
