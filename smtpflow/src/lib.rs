//! smtpflow: a multi-tenant outbound mail relay with open and click tracking.
//!
//! Tenants submit mail over authenticated SMTP or the HTTP API. Each message
//! is counted against the tenant's monthly quota, rewritten for tracking,
//! handed to the upstream relay and recorded. Opens, clicks, bounces and spam
//! complaints arrive later over HTTP and are attached to the sent record.

pub mod config;
pub mod controller;

pub use config::{Config, ConfigError};
pub use controller::{Bound, SHUTDOWN_BROADCAST, Smtpflow};
