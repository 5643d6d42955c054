pub mod cache;
pub mod cli;
pub mod clock;
pub mod consistent_hashing;
pub mod error;
pub mod limiters;
pub mod settings;
pub mod simulation;
pub mod task;

pub use error::{Result, WrenError};
