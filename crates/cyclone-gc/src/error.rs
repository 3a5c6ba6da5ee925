//! Error types and the fatal-error path.
//!
//! Configuration and reservation problems are reported through [`GcError`].
//! Heap corruption is never recoverable: [`fatal`] logs, prints a diagnostic
//! dump and aborts the process.

use std::fmt;
use std::io;

/// Errors reported while configuring or starting a plan.
#[derive(Debug)]
pub enum GcError {
    /// A configuration field holds an unusable value.
    InvalidConfig {
        /// Name of the offending field.
        field: &'static str,
        /// Why the value was rejected.
        reason: String,
    },
    /// The requested collection policy does not exist.
    UnsupportedPlan(String),
    /// Reserving the virtual range of a space failed.
    Reservation {
        /// Name of the space being reserved.
        space: &'static str,
        /// Underlying OS error.
        source: io::Error,
    },
}

impl GcError {
    pub(crate) fn invalid(field: &'static str, reason: impl Into<String>) -> Self {
        Self::InvalidConfig {
            field,
            reason: reason.into(),
        }
    }
}

impl fmt::Display for GcError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::InvalidConfig { field, reason } => {
                write!(f, "invalid configuration for `{field}`: {reason}")
            }
            Self::UnsupportedPlan(name) => write!(f, "unsupported collection plan `{name}`"),
            Self::Reservation { space, source } => {
                write!(f, "failed to reserve space `{space}`: {source}")
            }
        }
    }
}

impl std::error::Error for GcError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Self::Reservation { source, .. } => Some(source),
            _ => None,
        }
    }
}

/// Result type for plan construction and configuration.
pub type GcResult<T> = Result<T, GcError>;

/// Terminates the process after an internal consistency failure.
///
/// `dump` renders the queue and space state; it is only evaluated on this
/// path.
#[cold]
#[inline(never)]
pub fn fatal(message: impl fmt::Display, dump: impl FnOnce() -> String) -> ! {
    let message = message.to_string();
    crate::tracing::internal::log_fatal(&message);
    eprintln!("[GC] fatal: {message}");
    eprintln!("{}", dump());
    std::process::abort()
}

/// [`fatal`] without a plan-level dump, for failures detected inside a space.
#[cold]
#[inline(never)]
pub fn fatal_in_space(space: &str, message: impl fmt::Display) -> ! {
    fatal(message, || format!("[GC] failing space: {space}"))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::error::Error;

    #[test]
    fn display_formats_readable_messages() {
        let cases = [
            (
                GcError::invalid("collector_threads", "must be at least 1"),
                "invalid configuration for `collector_threads`: must be at least 1",
            ),
            (
                GcError::UnsupportedPlan("semispace".into()),
                "unsupported collection plan `semispace`",
            ),
        ];

        for (error, expected) in cases {
            assert_eq!(error.to_string(), expected);
        }
    }

    #[test]
    fn reservation_error_exposes_source() {
        let error = GcError::Reservation {
            space: "nursery",
            source: io::Error::from(io::ErrorKind::OutOfMemory),
        };
        assert!(error.source().is_some());
        assert!(error.to_string().starts_with("failed to reserve space `nursery`"));
    }
}
