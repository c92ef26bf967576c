use thiserror::Error;

pub type ApiResult<T> = std::result::Result<T, ApiError>;

/// Failure talking to the feedback server. `message` is what the user sees.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum ApiError {
    #[error("not authorized: {message}")]
    Unauthorized { message: String },
    #[error("server returned {status}: {message}")]
    Status { status: u16, message: String },
    #[error("request failed: {message}")]
    Network { message: String },
    #[error("unexpected response: {message}")]
    Decode { message: String },
    #[error("{message}")]
    Invalid { message: String },
}

impl ApiError {
    pub fn message(&self) -> &str {
        match self {
            Self::Unauthorized { message }
            | Self::Status { message, .. }
            | Self::Network { message }
            | Self::Decode { message }
            | Self::Invalid { message } => message,
        }
    }

    pub fn is_unauthorized(&self) -> bool {
        matches!(self, Self::Unauthorized { .. })
    }

    pub fn is_transient(&self) -> bool {
        match self {
            Self::Network { .. } => true,
            Self::Status { status, .. } => *status >= 500,
            _ => false,
        }
    }
}

impl From<reqwest::Error> for ApiError {
    fn from(err: reqwest::Error) -> Self {
        if err.is_decode() {
            Self::Decode {
                message: err.to_string(),
            }
        } else {
            Self::Network {
                message: err.to_string(),
            }
        }
    }
}
