use thiserror::Error;

#[derive(Debug, Error)]
pub enum CredentialError {
    /// The ICE-server document itself could not be understood.
    #[error("malformed ICE server descriptor: {0}")]
    ConfigFormat(String),

    /// The credential web service answered with an error status.
    #[error("credential service returned {status} {reason}: {body}")]
    FetchStatus {
        status: u16,
        reason: String,
        body: String,
    },

    /// The credential web service answered 2xx with nothing in it.
    #[error("credential service returned an empty body")]
    FetchEmpty,

    #[error("credential request failed: {0}")]
    FetchTransport(#[from] reqwest::Error),

    #[error("invalid credential source configuration: {0}")]
    SourceConfig(String),

    #[error("could not read descriptor file: {0}")]
    Io(#[from] std::io::Error),

    #[error("descriptor file watcher failed: {0}")]
    Watch(#[from] notify::Error),
}

impl CredentialError {
    /// Status code carried by a `FetchStatus` error, if that is what this is.
    pub fn status(&self) -> Option<u16> {
        match self {
            CredentialError::FetchStatus { status, .. } => Some(*status),
            _ => None,
        }
    }
}
