//! Error taxonomy shared by every front-end and the estimator interface.

use std::collections::HashMap;
use std::time::{Duration, Instant};

use thiserror::Error;

/// Error kinds named in the back-end's failure model. Per-sample and
/// per-scan errors are local: callers are expected to match on the
/// variant and continue the stream rather than abort it.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum SlamError {
    #[error("timestamp {stamp} is not after last stored stamp {last}")]
    OutOfOrder { stamp: f64, last: f64 },

    #[error("requested state at {requested} precedes buffer front {front}")]
    NotReady { requested: f64, front: f64 },

    #[error("underconstrained: {0}")]
    Underconstrained(String),

    #[error("matcher result rejected as outlier: {0}")]
    Outlier(String),

    #[error("matcher failed to converge: {0}")]
    MatcherFailure(String),

    #[error("invalid configuration: {0}")]
    ConfigInvalid(String),

    #[error("extrinsics missing for frame pair {from} -> {to}")]
    ExtrinsicsMissing { from: String, to: String },

    #[error("duplicate frame stamp {0}")]
    DuplicateStamp(f64),
}

impl SlamError {
    /// Coarse kind used to key the rate-limited logger; distinct from
    /// the `Display` message, which may carry per-call detail.
    pub fn kind(&self) -> &'static str {
        match self {
            SlamError::OutOfOrder { .. } => "OUT_OF_ORDER",
            SlamError::NotReady { .. } => "NOT_READY",
            SlamError::Underconstrained(_) => "UNDERCONSTRAINED",
            SlamError::Outlier(_) => "OUTLIER",
            SlamError::MatcherFailure(_) => "MATCHER_FAILURE",
            SlamError::ConfigInvalid(_) => "CONFIG_INVALID",
            SlamError::ExtrinsicsMissing { .. } => "EXTRINSICS_MISSING",
            SlamError::DuplicateStamp(_) => "DUPLICATE_STAMP",
        }
    }

    /// Only this kind aborts the process; every other kind is a
    /// skip-and-continue for its caller.
    pub fn is_fatal(&self) -> bool {
        matches!(self, SlamError::ConfigInvalid(_))
    }
}

pub type SlamResult<T> = Result<T, SlamError>;

/// Logs at most one warning per distinct error kind per one-second
/// window, matching the user-visible behavior spec'd for the estimator
/// pipeline. Grounded in the cooldown-timer pattern the teacher uses
/// for incident de-duplication (`IncidentDetector::ready_and_touch`).
pub struct RateLimitedLogger {
    window: Duration,
    last_logged: HashMap<&'static str, Instant>,
}

impl Default for RateLimitedLogger {
    fn default() -> Self {
        Self::new(Duration::from_secs(1))
    }
}

impl RateLimitedLogger {
    pub fn new(window: Duration) -> Self {
        Self {
            window,
            last_logged: HashMap::new(),
        }
    }

    /// Report `err`, emitting a `log::warn!` only if this error kind
    /// hasn't been logged within the current window.
    pub fn report(&mut self, err: &SlamError) {
        let kind = err.kind();
        let now = Instant::now();
        let should_log = match self.last_logged.get(kind) {
            Some(last) => now.duration_since(*last) >= self.window,
            None => true,
        };
        if should_log {
            self.last_logged.insert(kind, now);
            log::warn!("{kind}: {err}");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fatal_only_for_config_invalid() {
        assert!(SlamError::ConfigInvalid("bad".into()).is_fatal());
        assert!(!SlamError::OutOfOrder { stamp: 1.0, last: 2.0 }.is_fatal());
        assert!(!SlamError::NotReady { requested: 0.0, front: 1.0 }.is_fatal());
    }

    #[test]
    fn rate_limiter_suppresses_within_window() {
        let mut logger = RateLimitedLogger::new(Duration::from_secs(3600));
        let err = SlamError::Outlier("neighbor 2".into());
        logger.report(&err);
        assert_eq!(logger.last_logged.len(), 1);
        logger.report(&err);
        assert_eq!(logger.last_logged.len(), 1);
    }
}
