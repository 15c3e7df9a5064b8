use thiserror::Error;

#[derive(Debug, Error)]
pub enum Error {
    #[error("config error: {0}")]
    Config(String),

    #[error("feed parse error: {0}")]
    FeedParse(String),

    #[error("unsupported stream: {0}")]
    UnsupportedStream(String),

    #[error("network error: {0}")]
    Network(#[from] reqwest::Error),

    #[error("authorization failed: {0}")]
    Authorization(String),

    #[error("download failed: {0}")]
    Download(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("xml error: {0}")]
    Xml(String),
}

pub type Result<T> = std::result::Result<T, Error>;
