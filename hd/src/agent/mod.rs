//! Agent worker process

pub mod worker;

pub use worker::{WorkerArgs, run_worker};
