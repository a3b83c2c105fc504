//! The orchestrator.
//!
//! Phase order: **configure → init → scheduler start → serve → wait →
//! scheduler drain → gate → exit → clean → join**.
//!
//! The subsystem that owns the module lifecycle (the network service, or a
//! bare `modules` task when no listener is configured) initializes the
//! modules before serving, and its cleanup hook runs the ordered teardown.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::{Duration, Instant};

use espresso_bootstrap::ServerConfig;
use http::Extensions;
use parking_lot::{Mutex, RwLock};
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;

use crate::bus::EventBus;
use crate::context::{ConfigProvider, ContextInjector, EmptyConfigProvider, ModuleCtx, ModuleCtxBuilder};
use crate::contracts::Module;
use crate::dispatcher::{Dispatcher, Plugin};
use crate::network::{self, NetworkOptions};
use crate::registry::ModuleRegistry;
use crate::runtime::runner::{shutdown_token, ShutdownOptions};
use crate::scheduler::Scheduler;
use crate::stat;
use crate::supervise::{cleanup, supervise, Completion, OnExit};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AppState {
    Configured,
    Running,
    Stopping,
    Stopped,
}

pub struct AppBuilder {
    registry: ModuleRegistry,
    config: Arc<dyn ConfigProvider>,
    injectors: Vec<ContextInjector>,
    plugins: Vec<Plugin>,
    metrics: Option<prometheus::Registry>,
    http_addr: Option<String>,
    route_prefix: String,
    runtime_stat_addr: Option<String>,
    shutdown_timeout: Duration,
}

impl Default for AppBuilder {
    fn default() -> Self {
        Self {
            registry: ModuleRegistry::new(),
            config: Arc::new(EmptyConfigProvider),
            injectors: Vec::new(),
            plugins: Vec::new(),
            metrics: None,
            http_addr: None,
            route_prefix: "daydream".to_string(),
            runtime_stat_addr: None,
            shutdown_timeout: Duration::from_secs(5),
        }
    }
}

impl AppBuilder {
    /// Register a module. Init order is registration order.
    ///
    /// # Panics
    /// On an empty or duplicate uid.
    pub fn module(mut self, module: Arc<dyn Module>) -> Self {
        self.registry.register(module);
        self
    }

    pub fn config_provider(mut self, config: Arc<dyn ConfigProvider>) -> Self {
        self.config = config;
        self
    }

    /// Inject `registry` into module contexts and expose it on `/metric`.
    pub fn metric(mut self, registry: prometheus::Registry) -> Self {
        self.metrics = Some(registry);
        self
    }

    pub fn http(mut self, addr: impl Into<String>) -> Self {
        self.http_addr = Some(addr.into());
        self
    }

    pub fn route_prefix(mut self, prefix: impl Into<String>) -> Self {
        self.route_prefix = prefix.into();
        self
    }

    pub fn runtime_stat(mut self, addr: impl Into<String>) -> Self {
        self.runtime_stat_addr = Some(addr.into());
        self
    }

    pub fn shutdown_timeout(mut self, timeout: Duration) -> Self {
        self.shutdown_timeout = timeout;
        self
    }

    /// Add a module-context injector. Injectors run in registration order on
    /// the base module context and on every incoming call.
    pub fn module_context<F>(mut self, inject: F) -> Self
    where
        F: Fn(&mut Extensions) + Send + Sync + 'static,
    {
        self.injectors.push(Arc::new(inject));
        self
    }

    /// Append a dispatch plugin; the first one added is the outermost.
    pub fn module_plugin(mut self, plugin: Plugin) -> Self {
        self.plugins.push(plugin);
        self
    }

    /// Take listeners, prefix and shutdown deadline from the server section.
    pub fn server_config(mut self, cfg: &ServerConfig) -> Self {
        self.http_addr = cfg.http_addr.clone().filter(|a| !a.is_empty());
        self.route_prefix = cfg.route_prefix.clone();
        self.runtime_stat_addr = cfg.runtime_stat_addr.clone().filter(|a| !a.is_empty());
        self.shutdown_timeout = Duration::from_millis(cfg.shutdown_timeout_ms);
        self
    }

    pub fn build(self) -> App {
        App {
            registry: Arc::new(self.registry),
            dispatcher: Arc::new(Dispatcher::new()),
            bus: Arc::new(EventBus::new()),
            scheduler: Arc::new(Scheduler::new()),
            config: self.config,
            injectors: self.injectors,
            plugins: self.plugins,
            metrics: self.metrics,
            http_addr: self.http_addr,
            route_prefix: self.route_prefix,
            runtime_stat_addr: self.runtime_stat_addr,
            shutdown_timeout: self.shutdown_timeout,
            state: RwLock::new(AppState::Configured),
            http_bound: Arc::new(Mutex::new(None)),
        }
    }
}

pub struct App {
    registry: Arc<ModuleRegistry>,
    dispatcher: Arc<Dispatcher>,
    bus: Arc<EventBus>,
    scheduler: Arc<Scheduler>,
    config: Arc<dyn ConfigProvider>,
    injectors: Vec<ContextInjector>,
    plugins: Vec<Plugin>,
    metrics: Option<prometheus::Registry>,
    http_addr: Option<String>,
    route_prefix: String,
    runtime_stat_addr: Option<String>,
    shutdown_timeout: Duration,
    state: RwLock<AppState>,
    http_bound: Arc<Mutex<Option<SocketAddr>>>,
}

impl std::fmt::Debug for App {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("App")
            .field("state", &self.state())
            .field("modules", &self.registry.uids())
            .field("http_addr", &self.http_addr)
            .field("runtime_stat_addr", &self.runtime_stat_addr)
            .finish()
    }
}

/// Drives the module side of the app: init + timers up, then the ordered teardown.
#[derive(Clone)]
struct Lifecycle {
    registry: Arc<ModuleRegistry>,
    scheduler: Arc<Scheduler>,
    bus: Arc<EventBus>,
    ctx: ModuleCtx,
}

impl Lifecycle {
    async fn start(&self) {
        self.registry.init_all(&self.ctx).await;
        self.scheduler.start();
    }

    async fn stop(&self) {
        tracing::info!("Phase: stop");
        self.scheduler.stop().await;
        self.bus.gate();
        self.registry.exit_all(&self.ctx).await;
        self.registry.clean_all(&self.ctx).await;
    }
}

fn log_exit(service: &'static str) -> OnExit {
    Box::new(move |_, res| match res {
        Ok(()) => tracing::info!(service, "stop {service} success"),
        Err(e) => tracing::error!(service, error = %e, "stop {service} fail"),
    })
}

fn log_option(option: &str, enable: bool) {
    tracing::info!(option, enable, "set app option");
}

impl App {
    pub fn builder() -> AppBuilder {
        AppBuilder::default()
    }

    pub fn state(&self) -> AppState {
        *self.state.read()
    }

    pub fn registry(&self) -> &ModuleRegistry {
        &self.registry
    }

    pub fn dispatcher(&self) -> &Arc<Dispatcher> {
        &self.dispatcher
    }

    pub fn bus(&self) -> &Arc<EventBus> {
        &self.bus
    }

    pub fn scheduler(&self) -> &Arc<Scheduler> {
        &self.scheduler
    }

    /// Address the message listener is bound to, once it is.
    pub fn http_local_addr(&self) -> Option<SocketAddr> {
        *self.http_bound.lock()
    }

    /// Run until `shutdown` fires, then tear everything down in order.
    ///
    /// An app runs once; a second call fails.
    pub async fn run(&self, shutdown: ShutdownOptions) -> anyhow::Result<()> {
        {
            let mut state = self.state.write();
            if *state != AppState::Configured {
                anyhow::bail!("app cannot run from state {:?}", *state);
            }
            *state = AppState::Running;
        }

        let cancel = shutdown_token(shutdown);
        let failure: Arc<Mutex<Option<String>>> = Arc::new(Mutex::new(None));

        self.dispatcher.set_plugins(self.plugins.clone());
        log_option("module plugin", !self.plugins.is_empty());
        log_option("module context", !self.injectors.is_empty());
        log_option("metric", self.metrics.is_some());
        log_option("network", self.http_addr.is_some());
        log_option("runtime stat", self.runtime_stat_addr.is_some());

        let mut base_injectors = self.injectors.clone();
        if let Some(registry) = &self.metrics {
            let registry = registry.clone();
            base_injectors.push(Arc::new(move |ext: &mut Extensions| {
                ext.insert(registry.clone());
            }));
        }
        let ctx = ModuleCtxBuilder::new(cancel.clone())
            .dispatcher(self.dispatcher.clone())
            .bus(self.bus.clone())
            .scheduler(self.scheduler.clone())
            .config(self.config.clone())
            .injectors(base_injectors)
            .build();

        let lifecycle = Lifecycle {
            registry: self.registry.clone(),
            scheduler: self.scheduler.clone(),
            bus: self.bus.clone(),
            ctx,
        };
        let teardown = {
            let lc = lifecycle.clone();
            cleanup(move |_| async move { lc.stop().await })
        };

        let mut completions: Vec<(&'static str, Completion)> = Vec::new();

        match self.http_addr.clone() {
            Some(addr) => {
                let router = network::build_router(NetworkOptions {
                    dispatcher: self.dispatcher.clone(),
                    bus: self.bus.clone(),
                    injectors: self.injectors.clone(),
                    route_prefix: self.route_prefix.clone(),
                    metrics: self.metrics.clone(),
                });
                let timeout = self.shutdown_timeout;
                let bound = self.http_bound.clone();
                let failure = failure.clone();
                let work = move |cancel: CancellationToken| async move {
                    lifecycle.start().await;

                    let listener = match TcpListener::bind(&addr).await {
                        Ok(l) => l,
                        Err(e) => {
                            tracing::error!(service = "network", %addr, error = %e, "run network fail");
                            *failure.lock() = Some(format!("network: bind {addr}: {e}"));
                            cancel.cancel();
                            return;
                        }
                    };
                    *bound.lock() = listener.local_addr().ok();

                    if let Err(e) =
                        network::serve_listener("network", listener, router, cancel.clone(), timeout)
                            .await
                    {
                        tracing::error!(service = "network", error = %e, "run network fail");
                        *failure.lock() = Some(format!("network: {e:#}"));
                        cancel.cancel();
                    }
                };
                completions.push((
                    "network",
                    supervise(cancel.clone(), work, Some(log_exit("network")), vec![teardown]),
                ));
            }
            None => {
                let work = move |cancel: CancellationToken| async move {
                    lifecycle.start().await;
                    cancel.cancelled().await;
                };
                completions.push((
                    "modules",
                    supervise(cancel.clone(), work, Some(log_exit("modules")), vec![teardown]),
                ));
            }
        }

        if let Some(addr) = self.runtime_stat_addr.clone() {
            let timeout = self.shutdown_timeout;
            let work = move |cancel: CancellationToken| async move {
                let router = stat::build_router(Instant::now());
                if let Err(e) = network::serve("runtime_stat", &addr, router, cancel, timeout).await {
                    tracing::error!(service = "runtime_stat", error = %e, "run runtime stat fail");
                }
            };
            completions.push((
                "runtime_stat",
                supervise(cancel.clone(), work, Some(log_exit("runtime stat")), vec![]),
            ));
        }

        cancel.cancelled().await;
        tracing::warn!("receive stop signal....");
        *self.state.write() = AppState::Stopping;

        let mut panicked = Vec::new();
        for (name, completion) in completions {
            if let Err(e) = completion.wait().await {
                panicked.push(format!("{name}: {e}"));
            }
        }

        *self.state.write() = AppState::Stopped;
        tracing::info!("bye~ :)");

        let failure = failure.lock().take();
        if let Some(msg) = failure {
            anyhow::bail!(msg);
        }
        if !panicked.is_empty() {
            anyhow::bail!("subsystems failed: {}", panicked.join("; "));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn runs_once() {
        let app = App::builder().build();
        assert_eq!(app.state(), AppState::Configured);

        let token = CancellationToken::new();
        token.cancel();
        app.run(ShutdownOptions::Token(token.clone())).await.unwrap();
        assert_eq!(app.state(), AppState::Stopped);
        assert!(app.bus().is_gated());

        let err = app.run(ShutdownOptions::Token(token)).await.unwrap_err();
        assert!(err.to_string().contains("Stopped"));
    }

    #[tokio::test]
    async fn server_config_maps_listeners() {
        let cfg = ServerConfig {
            http_addr: Some(String::new()),
            runtime_stat_addr: Some("127.0.0.1:0".into()),
            route_prefix: "api".into(),
            shutdown_timeout_ms: 250,
            ..ServerConfig::default()
        };
        let app = App::builder().server_config(&cfg).build();
        assert!(app.http_addr.is_none());
        assert_eq!(app.runtime_stat_addr.as_deref(), Some("127.0.0.1:0"));
        assert_eq!(app.route_prefix, "api");
        assert_eq!(app.shutdown_timeout, Duration::from_millis(250));
    }

    #[tokio::test]
    async fn bind_failure_stops_the_app() {
        let taken = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        let addr = taken.local_addr().unwrap().to_string();
        let app = App::builder().http(addr).build();

        let res = tokio::time::timeout(
            Duration::from_secs(5),
            app.run(ShutdownOptions::Token(CancellationToken::new())),
        )
        .await
        .unwrap();
        assert!(res.unwrap_err().to_string().contains("bind"));
        assert_eq!(app.state(), AppState::Stopped);
    }
}
