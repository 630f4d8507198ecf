//! Error taxonomy (§7). One enum per component boundary; `JobError` is the umbrella a handler
//! matches on to decide ack/nak/terminal-status disposition.

use thiserror::Error;

#[derive(Debug, Error)]
pub enum BrokerError {
    #[error("consumer bind/create failed: {0}")]
    ConsumerSetup(String),
    #[error("transient broker error: {0}")]
    Transient(String),
    #[error("publish failed: {0}")]
    Publish(String),
    #[error("fetch failed: {0}")]
    Fetch(String),
}

#[derive(Debug, Error)]
pub enum VectorStoreError {
    #[error("vector store request failed: {0}")]
    Request(String),
    #[error("vector store returned malformed data: {0}")]
    MalformedResponse(String),
}

#[derive(Debug, Error)]
pub enum RenderError {
    #[error("rendering failed: {0}")]
    Failed(String),
}

#[derive(Debug, Error)]
pub enum UploadError {
    #[error("object-store upload failed: {0}")]
    Failed(String),
}

#[derive(Debug, Error)]
pub enum NamingError {
    #[error("llm provider {provider} call failed: {message}")]
    ProviderCall { provider: String, message: String },
    #[error("llm response was empty")]
    EmptyResponse,
}

/// Kind label used for metrics and the §7 disposition table. Deliberately separate from the
/// `JobError` variant set so callers can match on disposition without destructuring every error.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    Validation,
    JsonDecode,
    Timeout,
    VectorStore,
    Naming,
    Rendering,
    Upload,
    Publish,
    BrokerTransient,
    Unexpected,
}

impl ErrorKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Validation => "validation_error",
            Self::JsonDecode => "json_decode_error",
            Self::Timeout => "timeout",
            Self::VectorStore => "vector_store_error",
            Self::Naming => "naming_error",
            Self::Rendering => "rendering_error",
            Self::Upload => "upload_error",
            Self::Publish => "publish_error",
            Self::BrokerTransient => "broker_transient",
            Self::Unexpected => "unexpected_error",
        }
    }
}

/// Disposition for a message once a `JobError` is known (§7).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Disposition {
    /// Positive-ack, no status envelope published (poison pill).
    AckSilently,
    /// Positive-ack, terminal `failed` status envelope published first.
    AckWithFailure,
    /// Negative-ack so the broker redelivers.
    Nak,
}

/// Top-level per-job error. Every component error converts into this via `#[from]`; the pipeline
/// orchestrator and worker loop only ever match on `.kind()`.
#[derive(Debug, Error)]
pub enum JobError {
    #[error("invalid job envelope: {0}")]
    Validation(String),
    #[error("could not decode job envelope: {0}")]
    JsonDecode(#[from] serde_json::Error),
    #[error("job exceeded its processing budget")]
    Timeout,
    #[error(transparent)]
    VectorStore(#[from] VectorStoreError),
    #[error(transparent)]
    Rendering(#[from] RenderError),
    #[error(transparent)]
    Upload(#[from] UploadError),
    #[error("unexpected error: {0}")]
    Unexpected(String),
}

impl JobError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::Validation(_) => ErrorKind::Validation,
            Self::JsonDecode(_) => ErrorKind::JsonDecode,
            Self::Timeout => ErrorKind::Timeout,
            Self::VectorStore(_) => ErrorKind::VectorStore,
            Self::Rendering(_) => ErrorKind::Rendering,
            Self::Upload(_) => ErrorKind::Upload,
            Self::Unexpected(_) => ErrorKind::Unexpected,
        }
    }

    /// §7's disposition table, keyed on error kind. `naming_error` never reaches here: it is
    /// swallowed inside the pipeline orchestrator before a `JobError` would be constructed.
    pub fn disposition(&self) -> Disposition {
        match self.kind() {
            ErrorKind::Validation | ErrorKind::JsonDecode => Disposition::AckSilently,
            ErrorKind::Timeout
            | ErrorKind::VectorStore
            | ErrorKind::Rendering
            | ErrorKind::Upload => Disposition::AckWithFailure,
            ErrorKind::Publish | ErrorKind::Unexpected | ErrorKind::BrokerTransient => {
                Disposition::Nak
            }
            ErrorKind::Naming => unreachable!("naming_error is local to the orchestrator"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn validation_is_silent_ack() {
        let err = JobError::Validation("bad".into());
        assert_eq!(err.disposition(), Disposition::AckSilently);
    }

    #[test]
    fn timeout_acks_with_failure() {
        let err = JobError::Timeout;
        assert_eq!(err.disposition(), Disposition::AckWithFailure);
    }

    #[test]
    fn unexpected_naks() {
        let err = JobError::Unexpected("boom".into());
        assert_eq!(err.disposition(), Disposition::Nak);
    }

    /// §7/§8: the terminal failure message is the kind prefixed onto the underlying error, so a
    /// timeout's reported message always contains the word "timeout" even though the `Display`
    /// text alone does not.
    #[test]
    fn timeout_kind_prefix_contains_the_word_timeout() {
        let err = JobError::Timeout;
        let message = format!("{}: {}", err.kind().as_str(), err);
        assert!(message.contains("timeout"));
    }
}
