//! Keeping one renderer alive and matching its responses to jobs.

mod correlator;
pub mod orphans;
mod supervisor;

pub use correlator::{Correlator, PendingRequest};
pub use orphans::reap_orphans;
pub use supervisor::{StatusBoard, Supervisor, SupervisorState, SupervisorStatus};
