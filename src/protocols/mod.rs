//! Protocol implementations for the Redfire ACS

pub mod cwmp;

pub use cwmp::{CwmpCodec, CwmpRequest};
