//! Built-in event topics and payloads.

use std::time::Instant;

use serde::Serialize;

use crate::bus::EventBus;

/// Published after every dispatched call.
pub const MODULE_CALL: &str = "event_module_call";
/// Published when a handler panicked.
pub const MODULE_CALL_PANIC: &str = "event_module_call_panic";

#[derive(Debug, Clone, Serialize, PartialEq, Eq)]
pub struct ModuleCall {
    pub module: String,
    pub function: String,
    pub cost_time_ns: u64,
    pub request_id: String,
}

#[derive(Debug, Clone, Serialize, PartialEq, Eq)]
pub struct ModuleCallPanic {
    pub module: String,
    pub function: String,
    pub error: String,
    pub request_id: String,
}

pub fn publish_module_call(
    bus: &EventBus,
    module: &str,
    function: &str,
    started: Instant,
    request_id: &str,
) {
    let cost = u64::try_from(started.elapsed().as_nanos()).unwrap_or(u64::MAX);
    bus.publish(
        MODULE_CALL,
        ModuleCall {
            module: module.to_string(),
            function: function.to_string(),
            cost_time_ns: cost,
            request_id: request_id.to_string(),
        },
    );
}

pub fn publish_module_call_panic(
    bus: &EventBus,
    module: &str,
    function: &str,
    error: impl Into<String>,
    request_id: &str,
) {
    bus.publish(
        MODULE_CALL_PANIC,
        ModuleCallPanic {
            module: module.to_string(),
            function: function.to_string(),
            error: error.into(),
            request_id: request_id.to_string(),
        },
    );
}
