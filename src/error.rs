use std::error::Error;
use std::fmt;

use thiserror::Error;

/// Errors surfaced by the synchronization core.
#[derive(Error, Debug)]
pub enum SyncError {
    /// Requested while the wallet is not synced, or while a rescan is already running
    #[error("Invalid state: {0}")]
    InvalidState(String),

    /// Malformed input
    #[error("Validation error: {0}")]
    Validation(String),

    /// No block at the requested height yet
    #[error("No block at height {height}")]
    NotFound { height: u32 },

    /// Backend unreachable
    #[error("Network error: {0}")]
    Network(String),

    /// Connection dropped without the caller asking for it
    #[error("Connection lost: {0}")]
    ConnectionLost(String),

    /// Backend refused the request
    #[error("Backend error: {0}")]
    Backend(String),

    /// Configuration error
    #[error("Configuration error: {0}")]
    Config(String),

    /// I/O error
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl SyncError {
    pub fn invalid_state<T: Into<String>>(message: T) -> Self {
        Self::InvalidState(message.into())
    }

    /// Whether a notification stream yielding this error can still be read.
    pub fn is_stream_fatal(&self) -> bool {
        matches!(self, Self::Network(_) | Self::ConnectionLost(_))
    }
}

impl From<BitcoindError> for SyncError {
    fn from(error: BitcoindError) -> Self {
        match error {
            BitcoindError::HeightOutOfRange(height) => SyncError::NotFound { height },
            BitcoindError::CookieFile(e) => SyncError::Io(e),
            e if e.is_transport() => SyncError::Network(e.to_string()),
            e => SyncError::Backend(e.to_string()),
        }
    }
}

#[derive(Debug)]
pub enum ResponseErrorKind {
    MissingField(&'static str),
    InvalidHash,
    InvalidBlockData,
}

/// An error talking to bitcoind.
#[derive(Debug)]
pub enum BitcoindError {
    CookieFile(std::io::Error),
    Server(jsonrpc::error::Error),
    HeightOutOfRange(u32),
    Response {
        kind: ResponseErrorKind,
        source: Option<Box<dyn Error + Send + Sync>>,
    },
}

impl BitcoindError {
    pub fn response_error(kind: ResponseErrorKind) -> Self {
        Self::Response { kind, source: None }
    }

    pub fn with_source(self, source: impl Error + Send + Sync + 'static) -> Self {
        match self {
            Self::Response { kind, .. } => Self::Response {
                kind,
                source: Some(Box::new(source)),
            },
            _ => self,
        }
    }

    /// Is bitcoind just starting ?
    pub fn is_warming_up(&self) -> bool {
        matches!(
            self,
            Self::Server(jsonrpc::error::Error::Rpc(jsonrpc::error::RpcError { code: -28, .. }))
        )
    }

    /// Did the request fail before reaching bitcoind's RPC handler?
    pub fn is_transport(&self) -> bool {
        matches!(self, Self::Server(jsonrpc::error::Error::Transport(_)))
    }
}

impl fmt::Display for BitcoindError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::CookieFile(e) => write!(f, "Reading bitcoind cookie file: {}", e),
            Self::Server(e) => write!(f, "Bitcoind RPC server error: {}", e),
            Self::HeightOutOfRange(h) => write!(f, "Block height {} out of range", h),
            Self::Response { kind, source } => {
                write!(f, "Unexpected bitcoind response: {:?}", kind)?;
                if let Some(src) = source {
                    write!(f, " (Caused by: {})", src)?;
                }
                Ok(())
            }
        }
    }
}

impl Error for BitcoindError {
    fn source(&self) -> Option<&(dyn Error + 'static)> {
        match self {
            Self::CookieFile(e) => Some(e),
            Self::Server(e) => Some(e),
            Self::HeightOutOfRange(_) => None,
            Self::Response { source, .. } => source.as_ref().map(|e| e.as_ref() as &dyn Error),
        }
    }
}

impl From<jsonrpc::error::Error> for BitcoindError {
    fn from(error: jsonrpc::error::Error) -> Self {
        Self::Server(error)
    }
}

impl From<jsonrpc::simple_http::Error> for BitcoindError {
    fn from(error: jsonrpc::simple_http::Error) -> Self {
        jsonrpc::error::Error::Transport(Box::new(error)).into()
    }
}
