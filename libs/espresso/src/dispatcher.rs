//! Message dispatcher: `module::message` → handler, wrapped by a plugin chain.

use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;

use arc_swap::ArcSwap;
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use futures::future::BoxFuture;
use futures::FutureExt;
use serde::de::DeserializeOwned;
use serde::Serialize;
use serde_json::Value;
use thiserror::Error;

use crate::context::CallContext;
use crate::supervise::panic_message;

#[derive(Debug, Error)]
pub enum DispatchError {
    #[error("route '{0}' not found")]
    NotFound(String),
    /// Request payload could not be decoded into the handler's request type.
    #[error("invalid json param: {0}")]
    InvalidJson(String),
    /// Request decoded but failed the handler's own validation.
    #[error("invalid request: {0}")]
    InvalidRequest(String),
    #[error("handler panicked: {0}")]
    Panicked(String),
    #[error(transparent)]
    Handler(#[from] anyhow::Error),
}

pub type HandlerFuture = BoxFuture<'static, Result<Value, DispatchError>>;

/// Type-erased message handler.
pub type Handler = Arc<dyn Fn(CallContext, Value) -> HandlerFuture + Send + Sync>;

/// Middleware: wraps the next handler in the chain.
pub type Plugin = Arc<dyn Fn(Handler) -> Handler + Send + Sync>;

pub fn route_key(module: &str, message: &str) -> String {
    format!("{module}::{message}")
}

/// Routes are write-once and read concurrently; the plugin chain is swapped
/// atomically and applies to every dispatch started after the swap.
#[derive(Default)]
pub struct Dispatcher {
    routes: DashMap<String, Handler>,
    plugins: ArcSwap<Vec<Plugin>>,
}

impl std::fmt::Debug for Dispatcher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Dispatcher")
            .field("routes", &self.routes.len())
            .field("plugins", &self.plugins.load().len())
            .finish()
    }
}

impl Dispatcher {
    pub fn new() -> Self {
        Self::default()
    }

    /// # Panics
    /// When `module::message` is already registered.
    pub fn register(&self, module: &str, message: &str, handler: Handler) {
        let key = route_key(module, message);
        let inserted = match self.routes.entry(key.clone()) {
            Entry::Occupied(_) => false,
            Entry::Vacant(slot) => {
                slot.insert(handler);
                true
            }
        };
        if !inserted {
            panic!("module: {module} message: {message} already be registered");
        }
        tracing::debug!(route = %key, "route registered");
    }

    /// Register a handler with typed request/response.
    ///
    /// The request is decoded from JSON (`DispatchError::InvalidJson` on
    /// failure) and the response is encoded back to JSON.
    pub fn register_typed<Req, Resp, F, Fut>(&self, module: &str, message: &str, handler: F)
    where
        Req: DeserializeOwned + Send + 'static,
        Resp: Serialize + Send + 'static,
        F: Fn(CallContext, Req) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<Resp, DispatchError>> + Send + 'static,
    {
        let handler = Arc::new(handler);
        let erased: Handler = Arc::new(move |ctx: CallContext, raw: Value| {
            let handler = handler.clone();
            async move {
                let req: Req = serde_json::from_value(raw)
                    .map_err(|e| DispatchError::InvalidJson(e.to_string()))?;
                let resp = handler(ctx, req).await?;
                serde_json::to_value(resp).map_err(|e| DispatchError::Handler(e.into()))
            }
            .boxed()
        });
        self.register(module, message, erased);
    }

    /// Replace the plugin chain. The first plugin is the outermost.
    pub fn set_plugins(&self, plugins: Vec<Plugin>) {
        self.plugins.store(Arc::new(plugins));
    }

    pub fn contains(&self, module: &str, message: &str) -> bool {
        self.routes.contains_key(&route_key(module, message))
    }

    pub fn len(&self) -> usize {
        self.routes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.routes.is_empty()
    }

    /// Registered route keys, sorted.
    pub fn routes(&self) -> Vec<String> {
        let mut keys: Vec<String> = self.routes.iter().map(|r| r.key().clone()).collect();
        keys.sort();
        keys
    }

    /// Route a call through the plugin chain to its handler.
    ///
    /// A missing route fails before any plugin or handler runs. A panic
    /// anywhere in the chain is returned as [`DispatchError::Panicked`].
    pub async fn dispatch(
        &self,
        module: &str,
        message: &str,
        ctx: CallContext,
        request: Value,
    ) -> Result<Value, DispatchError> {
        let key = route_key(module, message);
        let handler = self
            .routes
            .get(&key)
            .map(|h| h.value().clone())
            .ok_or(DispatchError::NotFound(key))?;

        let plugins = self.plugins.load_full();
        let call = AssertUnwindSafe(async move {
            let chain = plugins
                .iter()
                .rev()
                .fold(handler, |next, plugin| plugin(next));
            chain(ctx, request).await
        });

        match call.catch_unwind().await {
            Ok(res) => res,
            Err(panic) => Err(DispatchError::Panicked(panic_message(&*panic))),
        }
    }
}
