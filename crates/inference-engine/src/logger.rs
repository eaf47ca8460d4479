//! Logging capability handed to the accelerator runtime
//!
//! The engine owner creates the logger and passes it in at construction;
//! the engine shares it with every compile request. The logger must outlive
//! the engine, which `Arc` guarantees.

use std::fmt;

use tracing::{debug, error, info, warn};

/// Runtime message severity, most severe first
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum Severity {
    InternalError,
    Error,
    Warning,
    Info,
    Verbose,
}

impl Severity {
    /// Get string representation
    pub fn as_str(&self) -> &'static str {
        match self {
            Severity::InternalError => "INTERNAL_ERROR",
            Severity::Error => "ERROR",
            Severity::Warning => "WARNING",
            Severity::Info => "INFO",
            Severity::Verbose => "VERBOSE",
        }
    }
}

impl fmt::Display for Severity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Sink for messages emitted by the engine and its runtime
pub trait RuntimeLogger: Send + Sync {
    fn log(&self, severity: Severity, message: &str);
}

/// Forwards runtime messages to `tracing`, dropping anything less severe
/// than the configured threshold
#[derive(Debug, Clone, Copy)]
pub struct TracingLogger {
    threshold: Severity,
}

impl TracingLogger {
    /// Logger passing messages up to and including `threshold`
    pub fn new(threshold: Severity) -> Self {
        Self { threshold }
    }

    /// Check whether a message of `severity` would be emitted
    pub fn enabled(&self, severity: Severity) -> bool {
        severity <= self.threshold
    }
}

impl Default for TracingLogger {
    /// Info and below are suppressed
    fn default() -> Self {
        Self::new(Severity::Warning)
    }
}

impl RuntimeLogger for TracingLogger {
    fn log(&self, severity: Severity, message: &str) {
        if !self.enabled(severity) {
            return;
        }
        match severity {
            Severity::InternalError => error!(target: "accelerator", internal = true, "{}", message),
            Severity::Error => error!(target: "accelerator", "{}", message),
            Severity::Warning => warn!(target: "accelerator", "{}", message),
            Severity::Info => info!(target: "accelerator", "{}", message),
            Severity::Verbose => debug!(target: "accelerator", "{}", message),
        }
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use std::sync::Mutex;

    /// Captures every message for assertions
    #[derive(Default)]
    pub(crate) struct CapturingLogger {
        pub messages: Mutex<Vec<(Severity, String)>>,
    }

    impl RuntimeLogger for CapturingLogger {
        fn log(&self, severity: Severity, message: &str) {
            self.messages
                .lock()
                .unwrap()
                .push((severity, message.to_string()));
        }
    }

    #[test]
    fn test_default_suppresses_info() {
        let logger = TracingLogger::default();
        assert!(logger.enabled(Severity::Error));
        assert!(logger.enabled(Severity::Warning));
        assert!(!logger.enabled(Severity::Info));
        assert!(!logger.enabled(Severity::Verbose));
    }

    #[test]
    fn test_severity_ordering() {
        assert!(Severity::InternalError < Severity::Error);
        assert!(Severity::Warning < Severity::Info);
        assert_eq!(Severity::InternalError.to_string(), "INTERNAL_ERROR");
    }
}
