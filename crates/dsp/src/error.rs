use thiserror::Error;

#[derive(Debug, Clone, PartialEq, Error)]
pub enum Error {
    #[error("invalid parameter: {0}")]
    InvalidParameter(String),
    #[error("unknown processing mode: {0} (use spectrum or fm)")]
    UnknownMode(String),
}

pub type Result<T> = std::result::Result<T, Error>;
