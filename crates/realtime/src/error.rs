use thiserror::Error;

/// Problems reported to error listeners. None of them stop the client.
#[derive(Debug, Clone, Error, PartialEq)]
pub enum ClientError {
    /// The socket failed, or could not be opened.
    #[error("transport error: {0}")]
    Transport(String),
    /// An inbound message did not have the expected shape.
    #[error("protocol error: {0}")]
    Protocol(#[from] ProtocolError),
    /// The backend reported an error in-band.
    #[error("server error: {0}")]
    Server(String),
}

#[derive(Debug, Clone, Error, PartialEq)]
pub enum ProtocolError {
    #[error("message is not valid JSON: {0}")]
    InvalidJson(String),
    #[error("expected a JSON object")]
    NotAnObject,
    #[error("result is missing field `{0}`")]
    MissingField(&'static str),
    #[error("result has an unexpected shape: {0}")]
    BadResult(String),
    #[error("could not encode outbound message: {0}")]
    Encode(String),
}
