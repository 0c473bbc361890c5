use thiserror::Error;

/// Closed set of failure kinds the CFS transport layer can surface.
///
/// Lets callers distinguish "the resource is gone" from "the call didn't go
/// through" without string-sniffing a status code or an error message.
#[derive(Debug, Error)]
pub enum CfsError {
    #[error("transport error calling CFS: {0}")]
    Transport(#[from] reqwest::Error),

    #[error("CFS resource not found")]
    NotFound,

    #[error("unexpected response from CFS: {0}")]
    Decode(String),
}
