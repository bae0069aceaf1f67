//! Infrastructure layer module
//!
//! Cross-cutting runtime concerns:
//! - Configuration management
//! - Logging infrastructure

pub mod config;
pub mod logging;
