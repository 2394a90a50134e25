//! Ingestion path: poll scheduling, batch dedup, state persistence and
//! archive replay.

pub mod dedup;
pub mod replay;
pub mod scheduler;
pub mod state_file;

pub use dedup::{DedupedBatch, dedup_batch};
pub use replay::{ReplayStats, replay};
pub use scheduler::{PollOutcome, PollReport, PollScheduler, PollState};
pub use state_file::StateFile;
