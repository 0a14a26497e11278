use thiserror::Error;

/// Which of the two recognized block signatures fired.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BlockSignal {
    /// Challenge overlay appeared shortly after page load. Page-level:
    /// the task aborts immediately, a fresh run must reload the page.
    OverlayChallenge,
    /// Validation error code embedded in a detail-API payload.
    /// Account-level: cool down for several minutes, then terminate.
    AccountValidate,
}

impl std::fmt::Display for BlockSignal {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            BlockSignal::OverlayChallenge => write!(f, "challenge overlay"),
            BlockSignal::AccountValidate => write!(f, "account validation code"),
        }
    }
}

/// Failure taxonomy for the scrape pipeline.
///
/// Propagation policy: failures local to one item never abort a task,
/// failures local to one task never abort the orchestrator, and only
/// [`ScoutError::BlockDetected`] ends a task early.
#[derive(Debug, Error)]
pub enum ScoutError {
    /// A UI action did not produce the expected network response in time.
    /// The current step is abandoned; processing continues.
    #[error("no response matching '{pattern}' within {timeout_secs}s")]
    CorrelationTimeout { pattern: String, timeout_secs: u64 },

    /// A known anti-automation signature fired. Terminal for the task.
    #[error("block signature detected: {0}")]
    BlockDetected(BlockSignal),

    /// Malformed or unexpectedly shaped payload. The affected item or call
    /// is skipped — except the AI-response parse failure, which propagates
    /// to the retry wrapper and is then recorded on the record.
    #[error("parse failure in {context}: {message}")]
    Parse { context: String, message: String },

    /// Transient network failure. Retried a bounded number of times, then
    /// the specific resource is dropped without failing the whole item.
    #[error("transient I/O failure: {0}")]
    TransientIo(#[from] reqwest::Error),

    #[error(transparent)]
    Browser(#[from] chromiumoxide::error::CdpError),

    #[error(transparent)]
    Io(#[from] std::io::Error),
}

impl ScoutError {
    pub fn parse(context: impl Into<String>, message: impl std::fmt::Display) -> Self {
        ScoutError::Parse {
            context: context.into(),
            message: message.to_string(),
        }
    }
}

pub type Result<T> = std::result::Result<T, ScoutError>;
