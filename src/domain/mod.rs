//! Domain layer for the Portrait pipeline
//!
//! Core models, error classification and the ports the services depend on.

pub mod errors;
pub mod models;
pub mod ports;

pub use errors::{DomainError, DomainResult, ErrorKind};
