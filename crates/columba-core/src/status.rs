//! Background process status
//!
//! `ProcessStatus` crosses the call boundary as a flat string tag
//! (`"READY"`, `"ERROR:<message>"`), so parsing and rendering live here.

use core::fmt;
use core::str::FromStr;
use serde::{Deserialize, Serialize};

use crate::errors::ColumbaError;

/// Lifecycle status of the background networking process
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ProcessStatus {
    Shutdown,
    Initializing,
    Ready,
    Restarting,
    Error(String),
}

impl ProcessStatus {
    /// Only a ready process accepts engine calls
    pub fn permits_engine_calls(&self) -> bool {
        matches!(self, ProcessStatus::Ready)
    }

    pub fn is_error(&self) -> bool {
        matches!(self, ProcessStatus::Error(_))
    }

    /// Tag without the error message
    pub fn kind(&self) -> &'static str {
        match self {
            ProcessStatus::Shutdown => "SHUTDOWN",
            ProcessStatus::Initializing => "INITIALIZING",
            ProcessStatus::Ready => "READY",
            ProcessStatus::Restarting => "RESTARTING",
            ProcessStatus::Error(_) => "ERROR",
        }
    }

    /// Whether `self -> next` is a legal move within one generation
    ///
    /// Entering `Initializing` is only legal for a freshly bumped generation;
    /// the store checks that separately.
    pub fn can_transition_to(&self, next: &ProcessStatus) -> bool {
        use ProcessStatus::*;
        match (self, next) {
            (_, Initializing) => true,
            (Initializing, Ready) | (Initializing, Error(_)) | (Initializing, Restarting) => true,
            (Ready, Restarting) | (Ready, Error(_)) => true,
            (Restarting, Shutdown) | (Restarting, Error(_)) => true,
            (Error(_), Restarting) | (Error(_), Shutdown) => true,
            _ => false,
        }
    }
}

impl Default for ProcessStatus {
    fn default() -> Self {
        ProcessStatus::Shutdown
    }
}

impl fmt::Display for ProcessStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ProcessStatus::Error(message) => write!(f, "ERROR:{}", message),
            other => f.write_str(other.kind()),
        }
    }
}

impl FromStr for ProcessStatus {
    type Err = ColumbaError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "SHUTDOWN" => Ok(ProcessStatus::Shutdown),
            "INITIALIZING" => Ok(ProcessStatus::Initializing),
            "READY" => Ok(ProcessStatus::Ready),
            "RESTARTING" => Ok(ProcessStatus::Restarting),
            "ERROR" => Ok(ProcessStatus::Error(String::new())),
            other => other
                .strip_prefix("ERROR:")
                .map(|message| ProcessStatus::Error(message.to_string()))
                .ok_or_else(|| ColumbaError::invalid_input(format!("Unknown status tag: {}", other))),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_status_tags() {
        assert_eq!(ProcessStatus::Ready.to_string(), "READY");
        assert_eq!(
            ProcessStatus::Error("bind failed: port in use".into()).to_string(),
            "ERROR:bind failed: port in use"
        );
        assert_eq!(
            "ERROR:bind failed: port in use".parse::<ProcessStatus>().unwrap(),
            ProcessStatus::Error("bind failed: port in use".into())
        );
        assert!("BOGUS".parse::<ProcessStatus>().is_err());
    }

    #[test]
    fn test_ready_requires_initializing() {
        assert!(!ProcessStatus::Shutdown.can_transition_to(&ProcessStatus::Ready));
        assert!(!ProcessStatus::Restarting.can_transition_to(&ProcessStatus::Ready));
        assert!(ProcessStatus::Initializing.can_transition_to(&ProcessStatus::Ready));
    }

    #[test]
    fn test_shutdown_only_after_teardown() {
        assert!(!ProcessStatus::Ready.can_transition_to(&ProcessStatus::Shutdown));
        assert!(ProcessStatus::Restarting.can_transition_to(&ProcessStatus::Shutdown));
    }

    #[test]
    fn test_only_ready_permits_engine_calls() {
        assert!(ProcessStatus::Ready.permits_engine_calls());
        assert!(!ProcessStatus::Initializing.permits_engine_calls());
        assert!(!ProcessStatus::Error("x".into()).permits_engine_calls());
    }
}
