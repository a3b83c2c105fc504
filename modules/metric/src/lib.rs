// === MODULE DEFINITION ===
pub mod module;
pub use module::{MetricModule, MODULE_UID};

pub mod config;
pub mod model;
pub use model::{CallMetrics, MetricError};
