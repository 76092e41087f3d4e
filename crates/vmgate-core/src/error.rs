use thiserror::Error;

/// Errors produced by the vmgate protocol layer and its collaborators.
#[derive(Debug, Error)]
pub enum GateError {
    #[error("codec error: {0}")]
    Codec(String),

    #[error("authentication failed: {0}")]
    Auth(String),

    #[error("token error: {0}")]
    Token(String),

    #[error("not found: {0}")]
    NotFound(String),

    #[error("store error: {0}")]
    Store(String),

    #[error("hypervisor error: {0}")]
    Hypervisor(String),

    #[error("transport error: {0}")]
    Transport(String),

    #[error("config error: {0}")]
    Config(String),

    #[error("timeout")]
    Timeout,

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("{0}")]
    Other(String),
}

impl From<serde_json::Error> for GateError {
    fn from(e: serde_json::Error) -> Self {
        GateError::Codec(e.to_string())
    }
}

pub type GateResult<T> = Result<T, GateError>;
