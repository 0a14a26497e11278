pub mod config;
pub mod errors;
pub mod json_path;
pub mod retry;
pub mod types;

pub use errors::{BlockSignal, Result, ScoutError};
