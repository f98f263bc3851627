use rb_protocol::FrameEncodeError;

#[derive(Debug, thiserror::Error)]
pub enum ClientError {
    #[error("connection: {0}")]
    Connect(String),
    #[error("websocket: {0}")]
    Ws(String),
    #[error("encode: {0}")]
    Encode(#[from] FrameEncodeError),
    #[error("invalid url: {0}")]
    Url(#[from] url::ParseError),
    #[error("token retrieval failed: {0}")]
    Token(String),
    #[error("socket is closed")]
    Closed,
}

impl From<tokio_tungstenite::tungstenite::Error> for ClientError {
    fn from(e: tokio_tungstenite::tungstenite::Error) -> Self {
        ClientError::Ws(e.to_string())
    }
}
