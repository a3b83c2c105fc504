//! # Espresso - in-process module runtime
//!
//! Modules are registered once at startup, initialized in registration order,
//! wired to a message [`Dispatcher`] and an [`EventBus`], and torn down in
//! reverse order when the process is asked to stop.
//!
//! ## Lifecycle
//!
//! - **init**: forward order, fail-soft (a failing module is logged and skipped)
//! - **run**: the network listener dispatches `module::message` calls; cron jobs fire
//! - **stop**: scheduler drain → event bus gate → exit (reverse) → clean (reverse)
//!
//! ## Example
//!
//! ```rust,ignore
//! use espresso::{App, CallContext, DispatchError, Module, ModuleCtx, ShutdownOptions};
//! use std::sync::Arc;
//!
//! struct Ping;
//!
//! #[espresso::async_trait]
//! impl Module for Ping {
//!     fn uid(&self) -> String {
//!         "ping_v0.1.0".into()
//!     }
//!
//!     async fn init(&self, ctx: &ModuleCtx) -> anyhow::Result<()> {
//!         ctx.dispatcher().register_typed("ping", "pong", pong);
//!         Ok(())
//!     }
//! }
//!
//! async fn pong(_ctx: CallContext, req: serde_json::Value) -> Result<serde_json::Value, DispatchError> {
//!     Ok(req)
//! }
//!
//! let app = App::builder().module(Arc::new(Ping)).http("127.0.0.1:8080").build();
//! app.run(ShutdownOptions::Signals).await?;
//! ```

pub use anyhow::Result;
pub use async_trait::async_trait;

pub mod bus;
pub mod context;
pub mod contracts;
pub mod dispatcher;
pub mod events;
pub mod network;
pub mod protocol;
pub mod registry;
pub mod runtime;
pub mod scheduler;
pub mod stat;
pub mod supervise;

pub use bus::{EventBus, SubscriptionId};
pub use context::{
    CallContext, ConfigError, ConfigProvider, ContextInjector, ModuleCtx, ModuleCtxBuilder,
};
pub use contracts::Module;
pub use dispatcher::{DispatchError, Dispatcher, Handler, Plugin};
pub use protocol::BaseResponse;
pub use registry::{InitSummary, LifecycleError, ModuleRegistry, RegistryError};
pub use runtime::{App, AppBuilder, AppState, ShutdownOptions};
pub use scheduler::{JobId, Scheduler, SchedulerError};
pub use supervise::{supervise, Completion, SupervisedError};
