pub mod core;
pub mod features;
pub mod nlp;
pub mod scraping;
pub mod tools;

// --- Primary core exports ---
pub use crate::core::config::{load_scout_config, load_tasks, ScoutConfig};
pub use crate::core::types;
pub use crate::core::types::*;
pub use crate::core::{BlockSignal, ScoutError};

// --- Convenience module paths ---
pub use crate::features::{history, notify};
pub use crate::nlp::prefilter;
pub use crate::scraping::{correlate, defense, parse};
pub use crate::tools::{analyze, monitor};
