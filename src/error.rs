use std::io::ErrorKind;
use thiserror::Error;

pub type BoxError = Box<dyn std::error::Error + Send + Sync + 'static>;

pub type Result<T> = std::result::Result<T, Error>;

#[derive(Error, Debug)]
pub enum Error {
    /// The probed object or file does not exist
    #[error("{0} not found")]
    NotFound(String),
    /// Network, authentication or remote service failure
    #[error("transport error: {0}")]
    Transport(#[source] BoxError),
    #[error("unsupported operation: {0}")]
    Unsupported(&'static str),
    #[error("already closed")]
    AlreadyClosed,
    /// Completion attempted without a single committed part
    #[error("upload completed without any committed part")]
    EmptyUpload,
    /// Read on a write-only handle or vice versa
    #[error("file not open for {0}")]
    WrongDirection(&'static str),
    /// A previous operation failed and left the upload unusable
    #[error("upload aborted, remote session {upload_id} left open")]
    Aborted { upload_id: String },
    #[error("invalid seek to a negative position")]
    InvalidSeek,
    #[error("`{0}` filesystem not found")]
    UnknownScheme(String),
    #[error("invalid url: {0}")]
    InvalidUrl(String),
    #[error("invalid configuration: {0}")]
    Config(String),
    #[error(transparent)]
    Io(std::io::Error),
}

impl Error {
    pub(crate) fn transport<E: Into<BoxError>>(err: E) -> Self {
        Self::Transport(err.into())
    }

    pub fn is_not_found(&self) -> bool {
        matches!(self, Self::NotFound(_))
    }
}

impl From<std::io::Error> for Error {
    fn from(value: std::io::Error) -> Self {
        match value.kind() {
            ErrorKind::NotFound => Self::NotFound(value.to_string()),
            _ => Self::Io(value),
        }
    }
}

impl From<url::ParseError> for Error {
    fn from(value: url::ParseError) -> Self {
        Self::InvalidUrl(value.to_string())
    }
}
