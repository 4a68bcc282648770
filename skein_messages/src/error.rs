use thiserror::Error;

pub type Result<T> = std::result::Result<T, Error>;

/// Common error type for `skein_messages`.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum Error {
    #[error("cannot add inference and training tasks to the same control message")]
    MixedTaskCategories,

    #[error("no tasks of type '{0}' found")]
    TaskNotFound(String),

    #[error("no metadata key '{0}' found")]
    MetadataNotFound(String),

    #[error("invalid message config: {0}")]
    InvalidConfig(String),
}

impl Error {
    pub fn invalid_config(reason: impl Into<String>) -> Self {
        Self::InvalidConfig(reason.into())
    }
}
