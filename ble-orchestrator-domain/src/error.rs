use std::fmt;

/// The closed set of reason strings a client can see in a response's
/// `error` field. Every terminal FAILED/TIMEOUT response carries
/// exactly one of these; internal plumbing errors (I/O, JSON decode,
/// adapter failures) are mapped onto one of these at the component
/// boundary and never forwarded to a client verbatim.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum OrchestratorError {
    DeviceNotFound,
    ConnectionFailed,
    OperationFailed,
    Timeout,
    SkippedDueToAge,
    QueueFull,
    InvalidRequest,
    Unavailable,
}

impl fmt::Display for OrchestratorError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            OrchestratorError::DeviceNotFound => "DeviceNotFound",
            OrchestratorError::ConnectionFailed => "ConnectionFailed",
            OrchestratorError::OperationFailed => "OperationFailed",
            OrchestratorError::Timeout => "Timeout",
            OrchestratorError::SkippedDueToAge => "SkippedDueToAge",
            OrchestratorError::QueueFull => "QueueFull",
            OrchestratorError::InvalidRequest => "InvalidRequest",
            OrchestratorError::Unavailable => "Unavailable",
        };
        write!(f, "{s}")
    }
}

impl std::error::Error for OrchestratorError {}
