use thiserror::Error;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum XdrError {
    #[error("Insufficient buffer space: need {need} bytes for {what}, have {have}")]
    BufferFull {
        what: &'static str,
        need: usize,
        have: usize,
    },

    #[error("Insufficient bytes: need {need} for {what}, have {have}")]
    Truncated {
        what: &'static str,
        need: usize,
        have: usize,
    },

    #[error("Length {len} exceeds limit {max} for {what}")]
    TooLong {
        what: &'static str,
        len: usize,
        max: usize,
    },

    #[error("Invalid data: {0}")]
    InvalidData(String),
}

impl XdrError {
    pub fn invalid_data(msg: impl Into<String>) -> Self {
        Self::InvalidData(msg.into())
    }
}

pub type Result<T> = std::result::Result<T, XdrError>;
