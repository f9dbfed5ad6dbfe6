//! Core orchestration for the Redfire ACS

pub mod acs;

pub use acs::AcsServer;
