use std::time::{Duration, SystemTime};
use std::net::SocketAddr;
use std::fmt;
use thiserror::Error;

use super::holepunch::join::BindFailure;
use super::holepunch::state::{PunchEvent, PunchState};

/// Transport-specific error types for hole punching sessions
#[derive(Debug, Error)]
pub enum TransportError {
    #[error("Channel bind {attempt} failed: {reason}")]
    BindFailed { attempt: usize, reason: String },

    #[error("All {attempted} channel binds failed")]
    AllBindsFailed { attempted: usize, failures: Vec<BindFailure> },

    #[error("Protocol violation: {reason}")]
    ProtocolViolation { reason: String },

    #[error("Cannot derive requester address: {reason}")]
    AddressDerivation { reason: String },

    #[error("No relay available for peer {peer_id}")]
    NoRelayAvailable { peer_id: String },

    #[error("No reply from relay after {timeout:?}")]
    RelayReplyTimeout { timeout: Duration },

    #[error("Relay reply channel closed before a reply arrived")]
    RelayClosed,

    #[error("No acknowledgement on punched channels after {timeout:?}")]
    AcknowledgementTimeout { timeout: Duration },

    #[error("All session channels closed")]
    SessionClosed,

    #[error("Channel {local_addr} has no socket to send on")]
    ChannelClosed { local_addr: SocketAddr },

    #[error("Invalid session transition: {event:?} in state {state:?}")]
    InvalidTransition { state: PunchState, event: PunchEvent },

    #[error("Hole punch session cancelled")]
    Cancelled,

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Serialization(String),

    #[error("Configuration error: {field} - {reason}")]
    ConfigurationError { field: String, reason: String },
}

impl TransportError {
    /// Check if this error is recoverable with retry
    pub fn is_recoverable(&self) -> bool {
        match self {
            TransportError::BindFailed { .. } => true,
            TransportError::AllBindsFailed { .. } => true,
            TransportError::RelayReplyTimeout { .. } => true,
            TransportError::AcknowledgementTimeout { .. } => true,
            TransportError::Io(io_err) => matches!(
                io_err.kind(),
                std::io::ErrorKind::TimedOut
                    | std::io::ErrorKind::ConnectionRefused
                    | std::io::ErrorKind::ConnectionReset
                    | std::io::ErrorKind::AddrInUse
                    | std::io::ErrorKind::WouldBlock
                    | std::io::ErrorKind::Interrupted
            ),
            _ => false,
        }
    }

    /// Get error severity level
    pub fn severity(&self) -> ErrorSeverity {
        match self {
            TransportError::BindFailed { .. } => ErrorSeverity::Warning,
            TransportError::RelayReplyTimeout { .. } => ErrorSeverity::Warning,
            TransportError::AcknowledgementTimeout { .. } => ErrorSeverity::Warning,
            TransportError::Cancelled => ErrorSeverity::Info,
            TransportError::ProtocolViolation { .. } => ErrorSeverity::Error,
            TransportError::AddressDerivation { .. } => ErrorSeverity::Error,
            TransportError::NoRelayAvailable { .. } => ErrorSeverity::Error,
            TransportError::ConfigurationError { .. } => ErrorSeverity::Error,
            TransportError::InvalidTransition { .. } => ErrorSeverity::Critical,
            _ => ErrorSeverity::Error,
        }
    }

    /// Get error category for logging
    pub fn category(&self) -> ErrorCategory {
        match self {
            TransportError::BindFailed { .. } |
            TransportError::AllBindsFailed { .. } |
            TransportError::ChannelClosed { .. } => ErrorCategory::Resource,

            TransportError::ProtocolViolation { .. } |
            TransportError::AddressDerivation { .. } |
            TransportError::InvalidTransition { .. } => ErrorCategory::Protocol,

            TransportError::NoRelayAvailable { .. } |
            TransportError::RelayReplyTimeout { .. } |
            TransportError::RelayClosed |
            TransportError::AcknowledgementTimeout { .. } |
            TransportError::SessionClosed |
            TransportError::Io(_) => ErrorCategory::Network,

            TransportError::ConfigurationError { .. } => ErrorCategory::Configuration,

            TransportError::Serialization(_) => ErrorCategory::Data,

            TransportError::Cancelled => ErrorCategory::Other,
        }
    }

    pub(crate) fn violation(reason: impl Into<String>) -> Self {
        TransportError::ProtocolViolation { reason: reason.into() }
    }
}

/// Error severity levels
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum ErrorSeverity {
    Info,
    Warning,
    Error,
    Critical,
}

impl fmt::Display for ErrorSeverity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ErrorSeverity::Info => write!(f, "INFO"),
            ErrorSeverity::Warning => write!(f, "WARN"),
            ErrorSeverity::Error => write!(f, "ERROR"),
            ErrorSeverity::Critical => write!(f, "CRITICAL"),
        }
    }
}

/// Error categories for log analysis
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorCategory {
    Protocol,
    Network,
    Resource,
    Configuration,
    Data,
    Other,
}

impl fmt::Display for ErrorCategory {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ErrorCategory::Protocol => write!(f, "protocol"),
            ErrorCategory::Network => write!(f, "network"),
            ErrorCategory::Resource => write!(f, "resource"),
            ErrorCategory::Configuration => write!(f, "configuration"),
            ErrorCategory::Data => write!(f, "data"),
            ErrorCategory::Other => write!(f, "other"),
        }
    }
}

/// Error context for session diagnostics
#[derive(Debug, Clone)]
pub struct ErrorContext {
    pub timestamp: SystemTime,
    pub session_id: Option<String>,
    pub peer_id: Option<String>,
    pub local_addr: Option<SocketAddr>,
    pub remote_addr: Option<SocketAddr>,
    pub attempt_number: u32,
    pub operation: String,
    pub additional_info: std::collections::BTreeMap<String, String>,
}

impl ErrorContext {
    pub fn new(operation: impl Into<String>) -> Self {
        Self {
            timestamp: SystemTime::now(),
            session_id: None,
            peer_id: None,
            local_addr: None,
            remote_addr: None,
            attempt_number: 0,
            operation: operation.into(),
            additional_info: std::collections::BTreeMap::new(),
        }
    }

    pub fn with_session(mut self, session_id: impl ToString) -> Self {
        self.session_id = Some(session_id.to_string());
        self
    }

    pub fn with_peer_id(mut self, peer_id: String) -> Self {
        self.peer_id = Some(peer_id);
        self
    }

    pub fn with_addresses(mut self, local: SocketAddr, remote: SocketAddr) -> Self {
        self.local_addr = Some(local);
        self.remote_addr = Some(remote);
        self
    }

    pub fn with_attempt(mut self, attempt: u32) -> Self {
        self.attempt_number = attempt;
        self
    }

    pub fn add_info<K: Into<String>, V: Into<String>>(mut self, key: K, value: V) -> Self {
        self.additional_info.insert(key.into(), value.into());
        self
    }
}

/// Error paired with the context it occurred in
#[derive(Debug)]
pub struct ContextualError {
    pub error: TransportError,
    pub context: ErrorContext,
}

impl ContextualError {
    pub fn new(error: TransportError, context: ErrorContext) -> Self {
        Self { error, context }
    }

    /// Create a formatted log message
    pub fn log_message(&self) -> String {
        let mut msg = format!(
            "[{}/{}] {} - {} (attempt {})",
            self.error.severity(),
            self.error.category(),
            self.context.operation,
            self.error,
            self.context.attempt_number + 1
        );

        if let Some(session_id) = &self.context.session_id {
            msg.push_str(&format!(" | session: {}", session_id));
        }

        if let Some(peer_id) = &self.context.peer_id {
            msg.push_str(&format!(" | peer: {}", peer_id));
        }

        if let (Some(local), Some(remote)) = (&self.context.local_addr, &self.context.remote_addr) {
            msg.push_str(&format!(" | {}→{}", local, remote));
        }

        if !self.context.additional_info.is_empty() {
            let info: Vec<String> = self.context.additional_info
                .iter()
                .map(|(k, v)| format!("{}={}", k, v))
                .collect();
            msg.push_str(&format!(" | {}", info.join(", ")));
        }

        msg
    }
}

impl Clone for TransportError {
    fn clone(&self) -> Self {
        match self {
            TransportError::BindFailed { attempt, reason } => TransportError::BindFailed { attempt: *attempt, reason: reason.clone() },
            TransportError::AllBindsFailed { attempted, failures } => TransportError::AllBindsFailed { attempted: *attempted, failures: failures.clone() },
            TransportError::ProtocolViolation { reason } => TransportError::ProtocolViolation { reason: reason.clone() },
            TransportError::AddressDerivation { reason } => TransportError::AddressDerivation { reason: reason.clone() },
            TransportError::NoRelayAvailable { peer_id } => TransportError::NoRelayAvailable { peer_id: peer_id.clone() },
            TransportError::RelayReplyTimeout { timeout } => TransportError::RelayReplyTimeout { timeout: *timeout },
            TransportError::RelayClosed => TransportError::RelayClosed,
            TransportError::AcknowledgementTimeout { timeout } => TransportError::AcknowledgementTimeout { timeout: *timeout },
            TransportError::SessionClosed => TransportError::SessionClosed,
            TransportError::ChannelClosed { local_addr } => TransportError::ChannelClosed { local_addr: *local_addr },
            TransportError::InvalidTransition { state, event } => TransportError::InvalidTransition { state: *state, event: *event },
            TransportError::Cancelled => TransportError::Cancelled,
            TransportError::Io(io_err) => TransportError::Io(std::io::Error::new(io_err.kind(), io_err.to_string())),
            TransportError::Serialization(msg) => TransportError::Serialization(msg.clone()),
            TransportError::ConfigurationError { field, reason } => TransportError::ConfigurationError { field: field.clone(), reason: reason.clone() },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_classification() {
        let err = TransportError::BindFailed { attempt: 0, reason: "address in use".to_string() };
        assert!(err.is_recoverable());
        assert_eq!(err.severity(), ErrorSeverity::Warning);
        assert_eq!(err.category(), ErrorCategory::Resource);

        let err = TransportError::violation("odd number of ports");
        assert!(!err.is_recoverable());
        assert_eq!(err.category(), ErrorCategory::Protocol);
        assert_eq!(err.to_string(), "Protocol violation: odd number of ports");

        let err = TransportError::Io(std::io::Error::new(std::io::ErrorKind::TimedOut, "slow"));
        assert!(err.is_recoverable());
        assert_eq!(err.category(), ErrorCategory::Network);
    }

    #[test]
    fn test_all_binds_failed_keeps_failures() {
        let err = TransportError::AllBindsFailed {
            attempted: 2,
            failures: vec![
                BindFailure { attempt: 0, reason: "denied".to_string() },
                BindFailure { attempt: 1, reason: "denied".to_string() },
            ],
        };
        assert_eq!(err.to_string(), "All 2 channel binds failed");

        match err.clone() {
            TransportError::AllBindsFailed { failures, .. } => assert_eq!(failures.len(), 2),
            other => panic!("unexpected clone: {:?}", other),
        }
    }

    #[test]
    fn test_contextual_log_message() {
        let context = ErrorContext::new("initiate")
            .with_session("s-1")
            .with_peer_id("bob".to_string())
            .with_addresses("127.0.0.1:5000".parse().unwrap(), "127.0.0.1:6000".parse().unwrap())
            .with_attempt(1)
            .add_info("holes", "3");
        let error = ContextualError::new(TransportError::RelayClosed, context);

        let msg = error.log_message();
        assert!(msg.starts_with("[ERROR/network] initiate"));
        assert!(msg.contains("(attempt 2)"));
        assert!(msg.contains("session: s-1"));
        assert!(msg.contains("peer: bob"));
        assert!(msg.contains("127.0.0.1:5000→127.0.0.1:6000"));
        assert!(msg.contains("holes=3"));
    }
}
