use thiserror::Error;

/// Errors raised while declaring or feeding an outbound stream
#[derive(Debug, Error)]
pub enum PublishError {
    /// Network I/O error
    #[error("Network error: {0}")]
    Network(#[from] std::io::Error),

    /// Data pushed before `declare`
    #[error("Stream has not been declared")]
    NotDeclared,

    /// `declare` called twice
    #[error("Stream already declared as '{0}'")]
    AlreadyDeclared(String),

    /// Batch layout does not match the declared stream
    #[error("Batch has {got} channels, stream '{stream}' declares {expected}")]
    ChannelMismatch {
        stream: String,
        expected: usize,
        got: usize,
    },
}

/// Result type for outlet operations
pub type PublishResult<T> = Result<T, PublishError>;
