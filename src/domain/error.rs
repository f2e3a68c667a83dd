use thiserror::Error;

#[derive(Error, Debug, Clone, PartialEq)]
pub enum EventError {
    #[error("Invalid image: {0}")]
    InvalidImage(String),
    #[error("Image source url must not be empty")]
    EmptySource,
    #[error("Event failed serialization check: {0}")]
    Serialization(String),
}

impl From<serde_json::Error> for EventError {
    fn from(err: serde_json::Error) -> Self {
        EventError::Serialization(err.to_string())
    }
}
