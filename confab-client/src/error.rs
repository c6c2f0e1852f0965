use std::time::Duration;

use thiserror::Error;

#[derive(Debug, Error)]
pub enum ChannelError {
    #[error("no open connection")]
    NotConnected,
    #[error("a connection for {0:?} is already open; close it first")]
    AlreadyOpen(String),
    #[error("invalid server url: {0}")]
    InvalidUrl(#[from] url::ParseError),
    #[error("unsupported server url scheme {0:?}")]
    UnsupportedScheme(String),
    #[error("connect timed out after {0:?}")]
    ConnectTimeout(Duration),
    #[error("websocket error: {0}")]
    Transport(#[from] tokio_tungstenite::tungstenite::Error),
}

#[derive(Debug, Error)]
pub enum AuthError {
    #[error("invalid server url: {0}")]
    InvalidUrl(#[from] url::ParseError),
    #[error("http request failed: {0}")]
    Http(#[from] reqwest::Error),
    #[error("{detail}")]
    Rejected { detail: String },
    #[error("unexpected response status {0}")]
    UnexpectedStatus(u16),
}

#[derive(Debug, Error)]
pub enum FetchError {
    #[error("invalid server url: {0}")]
    InvalidUrl(#[from] url::ParseError),
    #[error("http request failed: {0}")]
    Http(#[from] reqwest::Error),
    #[error("history endpoint returned status {0}")]
    UnexpectedStatus(u16),
}
