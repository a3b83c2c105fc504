// === MODULE DEFINITION ===
pub mod module;
pub use module::{SayModule, MODULE_NAME, MODULE_UID};

// === INTERNAL MODULES ===
#[doc(hidden)]
pub mod config;
#[doc(hidden)]
pub mod handlers;
