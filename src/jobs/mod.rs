//! Acquisition jobs: lifecycle state and the tracker that runs them.

pub mod state;
pub mod tracker;

pub use state::{Job, JobSpec, JobState, StateTransition};
pub use tracker::{JobHandle, JobTracker};
