use thiserror::Error;

pub type Result<T> = std::result::Result<T, Error>;

#[derive(Debug, Error)]
pub enum Error {
    /// The trace source could not be reached or answered with a transport-level failure.
    #[error("trace source unavailable: {0}")]
    SourceUnavailable(String),

    #[error("trace {0} not found")]
    TraceNotFound(String),

    /// The source answered, but the body could not be decoded.
    #[error("malformed response: {0}")]
    MalformedResponse(#[from] serde_json::Error),

    #[error("deadline exceeded before trace {0} could be fetched")]
    DeadlineExceeded(String),
}

impl From<attohttpc::Error> for Error {
    fn from(err: attohttpc::Error) -> Self {
        Error::SourceUnavailable(err.to_string())
    }
}

impl Error {
    /// Only transport failures are worth another attempt.
    pub fn is_retryable(&self) -> bool {
        matches!(self, Error::SourceUnavailable(_))
    }
}
