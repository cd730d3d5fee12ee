use std::fmt;
use thiserror::Error;

pub type Result<T> = std::result::Result<T, Error>;

/// Which of the two redundant sources an attempt was made against.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Role {
    Primary,
    Secondary,
}

impl Role {
    pub fn as_str(&self) -> &'static str {
        match self {
            Role::Primary => "primary",
            Role::Secondary => "secondary",
        }
    }
}

impl fmt::Display for Role {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// The cause of one failed endpoint attempt, kept so that total failures stay diagnosable.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EndpointFailure {
    pub role: Role,
    pub endpoint: String,
    pub error: Error,
}

impl fmt::Display for EndpointFailure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} ({}): {}", self.role, self.endpoint, self.error)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum Error {
    #[error("transport error talking to {endpoint}: {message}")]
    Transport { endpoint: String, message: String },
    #[error("key store {endpoint} rejected the request with status {status}")]
    RequestRejected { endpoint: String, status: u8 },
    #[error("short {frame}: expected {expected} bytes, got {actual}")]
    ShortFrame {
        frame: &'static str,
        expected: usize,
        actual: usize,
    },
    #[error("unsupported key action: {0}")]
    UnsupportedAction(String),
    #[error("{field} {value} does not fit in one byte")]
    LocationOutOfRange { field: &'static str, value: i64 },
    #[error("key unavailable from every endpoint: {}", join_failures(.failures))]
    KeyUnavailable { failures: Vec<EndpointFailure> },
    #[error("malformed material description: {0}")]
    MalformedDescription(String),
    #[error("material description has no \"ck\" token")]
    MissingToken,
    #[error("random generator failure: {0}")]
    Random(String),
    #[error("configuration error: {0}")]
    Config(String),
}

impl Error {
    pub(crate) fn transport(endpoint: impl Into<String>, message: impl fmt::Display) -> Self {
        Error::Transport {
            endpoint: endpoint.into(),
            message: message.to_string(),
        }
    }

    /// Transport and protocol failures may succeed on a later attempt; everything else will not.
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            Error::Transport { .. }
                | Error::RequestRejected { .. }
                | Error::ShortFrame { .. }
                | Error::KeyUnavailable { .. }
        )
    }
}

fn join_failures(failures: &[EndpointFailure]) -> String {
    if failures.is_empty() {
        return "no attempt reported".into();
    }
    failures
        .iter()
        .map(ToString::to_string)
        .collect::<Vec<_>>()
        .join("; ")
}
