//! Utility modules for the Redfire ACS

pub mod logger;

pub use logger::setup_logging;
