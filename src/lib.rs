//! Redfire ACS - TR-069 Auto Configuration Server
//!
//! A CWMP (TR-069) Auto Configuration Server: customer-premises equipment
//! periodically POSTs SOAP envelopes to the `/cwmp` endpoint to report state
//! and pick up remote management work, while operators drive parameter reads
//! and writes, reboots and factory resets through the management API.

pub mod api;
pub mod config;
pub mod core;
pub mod error;
pub mod protocols;
pub mod services;
pub mod store;
pub mod utils;

pub use error::{Error, Result};

/// Server version information
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
pub const NAME: &str = env!("CARGO_PKG_NAME");
pub const DESCRIPTION: &str = env!("CARGO_PKG_DESCRIPTION");
