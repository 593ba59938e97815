use thiserror::Error;

/// Error kinds callers may need to tell apart with `downcast_ref`.
///
/// Everything else travels as a plain `anyhow::Error` with context.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum Error {
    #[error("operation cancelled")]
    Cancelled,
    #[error("validation failed: {0}")]
    Validation(String),
    #[error("invalid configuration: {0}")]
    Configuration(String),
    #[error("registry protocol error: {0}")]
    RegistryProtocol(String),
    #[error("container exited with status code {code}")]
    ContainerExit { code: i64 },
}

/// True when any error in the chain is [`Error::Cancelled`].
pub fn is_cancelled(err: &anyhow::Error) -> bool {
    err.chain()
        .any(|e| matches!(e.downcast_ref::<Error>(), Some(Error::Cancelled)))
}
