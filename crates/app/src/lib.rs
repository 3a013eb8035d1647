pub mod config;
pub mod demo;
pub mod error;
pub mod telemetry;

pub use config::{Config, LogFormat};
pub use demo::DemoSummary;
pub use error::{AppError, Result};
