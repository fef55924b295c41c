//! Error kinds for the transport core (spec §7).

use std::time::Duration;

use thiserror::Error;

pub type CoreResult<T> = Result<T, CoreError>;

/// The five error kinds the core ever surfaces. Concrete transports attach
/// their own I/O errors as the `source` of `Channel`/`ConnectTimeout`.
#[derive(Debug, Error)]
pub enum CoreError {
    /// I/O or handler failure on a channel.
    #[error("channel error: {message}")]
    Channel {
        message: String,
        #[source]
        source: Option<Box<dyn std::error::Error + Send + Sync>>,
    },

    /// Operation attempted on a channel that has already closed.
    #[error("channel closed")]
    ClosedChannel,

    /// Connect did not complete within the configured deadline.
    #[error("connect timed out after {elapsed:?}")]
    ConnectTimeout { elapsed: Duration },

    /// Structural pipeline failure: duplicate name, handler not found,
    /// handler already added, or a non-sharable handler reused.
    #[error("pipeline error: {0}")]
    Pipeline(#[from] PipelineError),

    /// Submission (task or write) rejected because the target event loop
    /// has begun or completed shutdown.
    #[error("rejected: event loop is shutting down or shut down")]
    Rejected,
}

impl CoreError {
    pub fn channel(message: impl Into<String>) -> Self {
        CoreError::Channel {
            message: message.into(),
            source: None,
        }
    }

    pub fn channel_with_cause(
        message: impl Into<String>,
        source: impl std::error::Error + Send + Sync + 'static,
    ) -> Self {
        CoreError::Channel {
            message: message.into(),
            source: Some(Box::new(source)),
        }
    }
}

/// Structural pipeline failures (spec §7, §4.3's sharable/name-uniqueness
/// invariants).
#[derive(Debug, Error)]
pub enum PipelineError {
    #[error("duplicate handler name: {0}")]
    DuplicateName(String),

    #[error("handler not found: {0}")]
    HandlerNotFound(String),

    #[error("handler already added: {0}")]
    HandlerAlreadyAdded(String),

    #[error("handler {0} is not sharable and is already installed in a pipeline")]
    NonSharableReuse(String),
}
