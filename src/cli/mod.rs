pub mod app;
pub mod commands;

pub use app::{App, Config, RetrySettings};
pub use commands::{Cli, Commands};
