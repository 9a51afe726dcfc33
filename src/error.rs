use std::io;

use thiserror::Error;

/// Errors surfaced by the ingress.
///
/// Only [`Error::Bind`] ever reaches a caller synchronously; everything else is
/// resolved inside the connection task that produced it.
#[derive(Debug, Error)]
pub enum Error {
    #[error("failed to bind to address {addr}")]
    Bind {
        addr: String,
        #[source]
        source: io::Error,
    },

    #[error("malformed request: {0}")]
    MalformedRequest(String),

    #[error("request head not received within {0:?}")]
    RequestTimeout(std::time::Duration),

    #[error(transparent)]
    Io(#[from] io::Error),
}

impl Error {
    pub(crate) fn malformed(msg: impl Into<String>) -> Self {
        Self::MalformedRequest(msg.into())
    }
}

pub type Result<T> = std::result::Result<T, Error>;
