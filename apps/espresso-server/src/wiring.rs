//! Assembles the [`App`] from the loaded configuration.

use std::sync::Arc;
use std::time::Instant;

use espresso::{App, CallContext, Handler, Plugin};
use espresso_bootstrap::{AppConfig, AppConfigProvider, ConfigProvider};
use futures::FutureExt;
use metric::MetricModule;
use say::SayModule;

/// Adapter to make `AppConfigProvider` implement `espresso::ConfigProvider`.
struct EspressoConfigAdapter(Arc<AppConfigProvider>);

impl espresso::ConfigProvider for EspressoConfigAdapter {
    fn get_module_config(&self, module_uid: &str) -> Option<&serde_json::Value> {
        self.0.get_module_config(module_uid)
    }
}

/// Logs the wall time of every dispatched call at debug level.
pub fn call_timing() -> Plugin {
    Arc::new(|next: Handler| -> Handler {
        Arc::new(move |ctx: CallContext, req: serde_json::Value| {
            let next = next.clone();
            async move {
                let started = Instant::now();
                let module = ctx.module.clone();
                let message = ctx.message.clone();
                let res = next(ctx, req).await;
                tracing::debug!(
                    module = %module,
                    message = %message,
                    ok = res.is_ok(),
                    cost_us = started.elapsed().as_micros() as u64,
                    "module call finished"
                );
                res
            }
            .boxed()
        })
    })
}

pub fn build_app(config: &AppConfig) -> App {
    // Bridge AppConfig into the runtime's per-module config bag.
    let provider = Arc::new(EspressoConfigAdapter(Arc::new(AppConfigProvider::new(
        config.clone(),
    ))));

    let mut builder = App::builder()
        .server_config(&config.server)
        .config_provider(provider)
        .module_plugin(call_timing());

    if config.server.enable_metrics {
        builder = builder
            .metric(prometheus::Registry::new())
            .module(Arc::new(MetricModule::new()));
    }

    builder.module(Arc::new(SayModule::new())).build()
}
