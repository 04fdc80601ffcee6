use reqwest::StatusCode;

use crate::api::Provider;

/// Failures inside the session layer.
///
/// None of these escape `SessionManager`: they are turned into a `bool` or
/// `Option` for the caller and a [`Notice`](crate::notify::Notice) for the user.
#[derive(Debug, thiserror::Error)]
#[non_exhaustive]
pub enum SessionError {
    #[error("invalid token format")]
    InvalidTokenFormat,
    #[error("request failed: {0}")]
    Transport(#[from] reqwest::Error),
    #[error("unexpected status {0}")]
    Status(StatusCode),
    #[error("failed to decode response: {0}")]
    Decode(String),
    #[error("token pair rejected by the identity service")]
    Rejected,
    #[error("request was not authorized")]
    Unauthorized,
    #[error("storage error: {0}")]
    Storage(#[from] StorageError),
    #[error("validation superseded by a newer attempt")]
    Superseded,
}

impl SessionError {
    /// Whether the failure means the server could not be reached at all.
    pub fn is_transport(&self) -> bool {
        matches!(self, SessionError::Transport(_))
    }
}

#[derive(Debug, thiserror::Error)]
#[non_exhaustive]
pub enum StorageError {
    #[error("storage unavailable: {0}")]
    Unavailable(String),
    #[error("storage io: {0}")]
    Io(#[from] std::io::Error),
    #[error("corrupt storage file: {0}")]
    Corrupt(#[from] serde_json::Error),
}

/// Failures of the flows that obtain a token pair (credentials, OAuth).
#[derive(Debug, thiserror::Error)]
#[non_exhaustive]
pub enum FlowError {
    #[error("request failed: {0}")]
    Transport(#[from] reqwest::Error),
    #[error("request refused with {status}: {}", .message.as_deref().unwrap_or("no details"))]
    Rejected {
        status: StatusCode,
        message: Option<String>,
    },
    #[error("failed to decode response: {0}")]
    Decode(String),
    #[error("response is missing `{0}`")]
    MissingField(&'static str),
    #[error("authorization code is missing")]
    MissingCode,
    #[error("no pending authorization for {0}")]
    MissingVerifier(Provider),
    #[error("authorization state does not match")]
    StateMismatch,
    #[error("storage error: {0}")]
    Storage(#[from] StorageError),
    #[error("the session did not accept the issued tokens")]
    SessionRefused,
}

impl FlowError {
    pub fn status(&self) -> Option<StatusCode> {
        match self {
            FlowError::Rejected { status, .. } => Some(*status),
            FlowError::Transport(err) => err.status(),
            _ => None,
        }
    }

    /// The service does not know the account; the user should register first.
    pub fn needs_registration(&self) -> bool {
        self.status() == Some(StatusCode::NOT_FOUND)
    }

    /// Server-supplied explanation of a refusal, if any.
    pub fn message(&self) -> Option<&str> {
        match self {
            FlowError::Rejected { message, .. } => message.as_deref(),
            _ => None,
        }
    }
}
