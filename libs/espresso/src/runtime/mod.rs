mod app;
mod runner;

pub use app::{App, AppBuilder, AppState};
pub use runner::ShutdownOptions;
