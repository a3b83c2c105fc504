//! Contexts handed to modules and handlers.
//!
//! [`ModuleCtx`] is the long-lived context a module sees in its lifecycle
//! methods: the shared dispatcher, event bus and scheduler, the root
//! cancellation token, its own config bag and the injected extensions.
//! [`CallContext`] is the per-request context a handler sees.

use std::collections::HashMap;
use std::sync::Arc;

use http::Extensions;
use serde::de::DeserializeOwned;
use thiserror::Error;
use tokio_util::sync::CancellationToken;

use crate::bus::EventBus;
use crate::dispatcher::Dispatcher;
use crate::scheduler::Scheduler;

/// Source of per-module configuration bags, keyed by module uid.
pub trait ConfigProvider: Send + Sync {
    fn get_module_config(&self, module_uid: &str) -> Option<&serde_json::Value>;
}

/// Provider with no module configuration at all.
#[derive(Debug, Default, Clone, Copy)]
pub struct EmptyConfigProvider;

impl ConfigProvider for EmptyConfigProvider {
    fn get_module_config(&self, _module_uid: &str) -> Option<&serde_json::Value> {
        None
    }
}

impl ConfigProvider for HashMap<String, serde_json::Value> {
    fn get_module_config(&self, module_uid: &str) -> Option<&serde_json::Value> {
        self.get(module_uid)
    }
}

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("invalid config for module '{module}': {source}")]
    Invalid {
        module: String,
        #[source]
        source: serde_json::Error,
    },
}

/// Mutates a set of extensions; applied in registration order to the base
/// module context and to every incoming call.
pub type ContextInjector = Arc<dyn Fn(&mut Extensions) + Send + Sync>;

/// Apply `injectors` in order on top of `ext`.
pub fn apply_injectors(ext: &mut Extensions, injectors: &[ContextInjector]) {
    for inject in injectors {
        inject(ext);
    }
}

#[derive(Clone)]
pub struct ModuleCtx {
    uid: Arc<str>,
    cancel: CancellationToken,
    dispatcher: Arc<Dispatcher>,
    bus: Arc<EventBus>,
    scheduler: Arc<Scheduler>,
    extensions: Arc<Extensions>,
    config: Arc<dyn ConfigProvider>,
}

impl std::fmt::Debug for ModuleCtx {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ModuleCtx")
            .field("uid", &self.uid)
            .field("cancelled", &self.cancel.is_cancelled())
            .field("routes", &self.dispatcher.len())
            .field("gated", &self.bus.is_gated())
            .finish()
    }
}

impl ModuleCtx {
    /// Context scoped to module `uid`, sharing everything else.
    pub fn for_module(&self, uid: &str) -> Self {
        Self {
            uid: Arc::from(uid),
            ..self.clone()
        }
    }

    /// Uid of the module this context is scoped to; empty for the base context.
    pub fn uid(&self) -> &str {
        &self.uid
    }

    pub fn cancellation_token(&self) -> &CancellationToken {
        &self.cancel
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

    pub fn extensions(&self) -> &Extensions {
        &self.extensions
    }

    /// Typed lookup of an injected value.
    pub fn extension<T: Send + Sync + 'static>(&self) -> Option<&T> {
        self.extensions.get::<T>()
    }

    /// Raw config bag of this module, if any.
    pub fn raw_config(&self) -> Option<&serde_json::Value> {
        self.config.get_module_config(&self.uid)
    }

    /// Deserialize this module's config bag; a missing bag yields `T::default()`.
    pub fn config<T: DeserializeOwned + Default>(&self) -> Result<T, ConfigError> {
        match self.raw_config() {
            None => Ok(T::default()),
            Some(raw) => T::deserialize(raw).map_err(|source| ConfigError::Invalid {
                module: self.uid.to_string(),
                source,
            }),
        }
    }
}

/// Builds the base [`ModuleCtx`]. Anything not provided gets a fresh instance.
pub struct ModuleCtxBuilder {
    cancel: CancellationToken,
    dispatcher: Option<Arc<Dispatcher>>,
    bus: Option<Arc<EventBus>>,
    scheduler: Option<Arc<Scheduler>>,
    config: Arc<dyn ConfigProvider>,
    injectors: Vec<ContextInjector>,
}

impl ModuleCtxBuilder {
    pub fn new(cancel: CancellationToken) -> Self {
        Self {
            cancel,
            dispatcher: None,
            bus: None,
            scheduler: None,
            config: Arc::new(EmptyConfigProvider),
            injectors: Vec::new(),
        }
    }

    pub fn dispatcher(mut self, dispatcher: Arc<Dispatcher>) -> Self {
        self.dispatcher = Some(dispatcher);
        self
    }

    pub fn bus(mut self, bus: Arc<EventBus>) -> Self {
        self.bus = Some(bus);
        self
    }

    pub fn scheduler(mut self, scheduler: Arc<Scheduler>) -> Self {
        self.scheduler = Some(scheduler);
        self
    }

    pub fn config(mut self, config: Arc<dyn ConfigProvider>) -> Self {
        self.config = config;
        self
    }

    pub fn injectors(mut self, injectors: impl IntoIterator<Item = ContextInjector>) -> Self {
        self.injectors.extend(injectors);
        self
    }

    pub fn build(self) -> ModuleCtx {
        let mut extensions = Extensions::new();
        apply_injectors(&mut extensions, &self.injectors);

        ModuleCtx {
            uid: Arc::from(""),
            cancel: self.cancel,
            dispatcher: self.dispatcher.unwrap_or_default(),
            bus: self.bus.unwrap_or_default(),
            scheduler: self.scheduler.unwrap_or_default(),
            extensions: Arc::new(extensions),
            config: self.config,
        }
    }
}

/// Per-call context handed to dispatch handlers.
#[derive(Debug, Clone, Default)]
pub struct CallContext {
    pub module: String,
    pub message: String,
    pub request_id: String,
    pub client_ip: Option<String>,
    /// Request headers plus `FullPath`, `Uri`, `Url`, `Module`, `Message`.
    pub metadata: HashMap<String, Vec<String>>,
    pub extensions: Extensions,
}

impl CallContext {
    pub fn new(module: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            module: module.into(),
            message: message.into(),
            ..Default::default()
        }
    }

    pub fn with_request_id(mut self, request_id: impl Into<String>) -> Self {
        self.request_id = request_id.into();
        self
    }

    /// First metadata value under `key`.
    pub fn metadata_value(&self, key: &str) -> Option<&str> {
        self.metadata
            .get(key)
            .and_then(|v| v.first())
            .map(String::as_str)
    }

    pub fn extension<T: Send + Sync + 'static>(&self) -> Option<&T> {
        self.extensions.get::<T>()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde::Deserialize;

    #[derive(Debug, Default, Deserialize, PartialEq)]
    struct SayConfig {
        #[serde(default)]
        greeting: String,
    }

    #[derive(Clone, Debug, PartialEq)]
    struct Tag(&'static str);

    fn provider() -> Arc<dyn ConfigProvider> {
        let mut bags = HashMap::new();
        bags.insert("say".to_string(), serde_json::json!({ "greeting": "hi" }));
        bags.insert("bad".to_string(), serde_json::json!({ "greeting": 7 }));
        Arc::new(bags)
    }

    #[test]
    fn typed_config_per_module() {
        let base = ModuleCtxBuilder::new(CancellationToken::new())
            .config(provider())
            .build();
        assert_eq!(base.uid(), "");

        let say = base.for_module("say");
        assert_eq!(say.config::<SayConfig>().unwrap().greeting, "hi");

        let none = base.for_module("metric");
        assert_eq!(none.config::<SayConfig>().unwrap(), SayConfig::default());

        let bad = base.for_module("bad");
        let err = bad.config::<SayConfig>().unwrap_err();
        assert!(err.to_string().contains("'bad'"));
    }

    #[test]
    fn injectors_apply_in_order() {
        let first: ContextInjector = Arc::new(|ext| {
            ext.insert(Tag("first"));
        });
        let second: ContextInjector = Arc::new(|ext| {
            ext.insert(Tag("second"));
            ext.insert(42u32);
        });
        let ctx = ModuleCtxBuilder::new(CancellationToken::new())
            .injectors([first, second])
            .build();

        assert_eq!(ctx.extension::<Tag>(), Some(&Tag("second")));
        assert_eq!(ctx.for_module("x").extension::<u32>(), Some(&42));
    }

    #[test]
    fn scoped_contexts_share_runtime_parts() {
        let base = ModuleCtxBuilder::new(CancellationToken::new()).build();
        let a = base.for_module("a");
        assert!(Arc::ptr_eq(a.bus(), base.bus()));
        assert!(Arc::ptr_eq(a.dispatcher(), base.dispatcher()));
        assert!(Arc::ptr_eq(a.scheduler(), base.scheduler()));
    }

    #[test]
    fn call_context_metadata() {
        let mut call = CallContext::new("say", "hello").with_request_id("rid");
        call.metadata
            .insert("Module".into(), vec!["say".into(), "ignored".into()]);
        assert_eq!(call.metadata_value("Module"), Some("say"));
        assert_eq!(call.metadata_value("Missing"), None);
        assert_eq!(call.request_id, "rid");
    }
}
