//! Services module for the Redfire ACS

pub mod inform;
pub mod liveness;
pub mod session;
pub mod tasks;

pub use inform::{reconcile_inform, ReconcileOutcome};
pub use liveness::LivenessSweeper;
pub use session::{EngineResponse, SessionEngine};
pub use tasks::TaskRequest;
