use chrono::{DateTime, Utc};
use std::fmt;

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum Severity {
    Info,
    Warning,
    Error,
    Critical,
}

impl fmt::Display for Severity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Severity::Info => "info",
            Severity::Warning => "warning",
            Severity::Error => "error",
            Severity::Critical => "critical",
        };
        f.write_str(s)
    }
}

/// An error tagged with severity, the component it originated in, and the
/// moment it was captured. Critical errors additionally carry a captured
/// backtrace for postmortem logging.
#[derive(Debug, Clone)]
pub struct ClassifiedError {
    pub severity: Severity,
    pub component: String,
    pub cause: String,
    pub captured_at: DateTime<Utc>,
    pub backtrace: Option<String>,
}

impl ClassifiedError {
    pub fn new(severity: Severity, component: impl Into<String>, cause: impl Into<String>) -> Self {
        let backtrace = if severity == Severity::Critical {
            Some(std::backtrace::Backtrace::force_capture().to_string())
        } else {
            None
        };
        Self {
            severity,
            component: component.into(),
            cause: cause.into(),
            captured_at: Utc::now(),
            backtrace,
        }
    }

    pub fn info(component: impl Into<String>, cause: impl Into<String>) -> Self {
        Self::new(Severity::Info, component, cause)
    }

    pub fn warning(component: impl Into<String>, cause: impl Into<String>) -> Self {
        Self::new(Severity::Warning, component, cause)
    }

    pub fn error(component: impl Into<String>, cause: impl Into<String>) -> Self {
        Self::new(Severity::Error, component, cause)
    }

    pub fn critical(component: impl Into<String>, cause: impl Into<String>) -> Self {
        Self::new(Severity::Critical, component, cause)
    }

    /// Log at the level matching severity, tagged with the component.
    pub fn log(&self) {
        match self.severity {
            Severity::Info => tracing::info!(component = %self.component, "{}", self.cause),
            Severity::Warning => tracing::warn!(component = %self.component, "{}", self.cause),
            Severity::Error => tracing::error!(component = %self.component, "{}", self.cause),
            Severity::Critical => {
                tracing::error!(component = %self.component, backtrace = self.backtrace.as_deref().unwrap_or(""), "{}", self.cause)
            }
        }
    }
}

impl fmt::Display for ClassifiedError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[{}] {}: {}", self.severity, self.component, self.cause)
    }
}

impl std::error::Error for ClassifiedError {}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn critical_errors_capture_a_backtrace() {
        let err = ClassifiedError::critical("reconciler", "render failed");
        assert!(err.backtrace.is_some());
    }

    #[test]
    fn non_critical_errors_skip_backtrace_capture() {
        let err = ClassifiedError::warning("labels", "missing host");
        assert!(err.backtrace.is_none());
    }

    #[test]
    fn severity_ordering_allows_worst_of_comparisons() {
        assert!(Severity::Critical > Severity::Error);
        assert!(Severity::Error > Severity::Warning);
        assert!(Severity::Warning > Severity::Info);
    }
}
