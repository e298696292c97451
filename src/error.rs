
use thiserror::Error;

#[derive(Error, Debug)]
pub enum TagError {
    #[error("Parse error: {message}")]
    Parse { message: String, offset: Option<usize> },
    #[error("Unsupported value: {0}")]
    UnsupportedValue(String),
    #[error("Persistence error: {0}")]
    Persistence(String),
    #[error("Format error: {0}")]
    Format(String),
    #[error("Internal invariant violated: {0}")]
    Invariant(String),
    #[error("Lock poisoned: {0}")]
    Lock(String),
}

impl TagError {
    pub fn parse(message: impl Into<String>, offset: usize) -> Self {
        Self::Parse {
            message: message.into(),
            offset: Some(offset),
        }
    }
}

pub type Result<T> = std::result::Result<T, TagError>;

// Helper conversions
impl From<rusqlite::Error> for TagError {
    fn from(e: rusqlite::Error) -> Self { Self::Persistence(e.to_string()) }
}
