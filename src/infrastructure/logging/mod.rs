//! Logging infrastructure
//!
//! Structured logging using tracing and tracing-subscriber:
//! - JSON or pretty console output
//! - Rolling JSON log files
//! - Secret and e-mail scrubbing for untrusted text

pub mod config;
pub mod logger;
pub mod scrubber;

pub use config::{LogConfig, LogFormat, RotationPolicy};
pub use logger::LoggerImpl;
pub use scrubber::LogScrubber;
