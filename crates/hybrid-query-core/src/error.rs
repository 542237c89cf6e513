//! Error kinds shared by every component of the query engine.
//!
//! The kinds map one-to-one onto the propagation policy of the engine:
//!
//! | Kind | Raised by | Turn outcome |
//! |------|-----------|--------------|
//! | `InvalidArgument` | any caller-facing operation | reported immediately |
//! | `RetrievalUnavailable` | vector store, SQL executor | branch degrades to empty |
//! | `EmbeddingUnavailable` | embedding provider | vector branch degrades to empty |
//! | `QueryRejected` / `QueryUnparseable` | query builder validation | vector-only retrieval |
//! | `GenerationUnavailable` | generation provider | SQL branch degrades; synthesis retries |
//! | `SynthesisUnavailable` | answer synthesizer | turn fails |
//! | `Cancelled` | turn handler | turn discarded |

use thiserror::Error;

/// Errors produced by the hybrid query engine.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum EngineError {
    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    #[error("retrieval unavailable: {0}")]
    RetrievalUnavailable(String),

    #[error("embedding unavailable: {0}")]
    EmbeddingUnavailable(String),

    #[error("generated query rejected: {0}")]
    QueryRejected(String),

    #[error("generated query unparseable: {0}")]
    QueryUnparseable(String),

    #[error("generation unavailable: {0}")]
    GenerationUnavailable(String),

    #[error("synthesis unavailable: {0}")]
    SynthesisUnavailable(String),

    #[error("turn cancelled")]
    Cancelled,
}

impl EngineError {
    /// Machine-readable code used in HTTP error bodies and logs.
    pub fn code(&self) -> &'static str {
        match self {
            EngineError::InvalidArgument(_) => "invalid_argument",
            EngineError::RetrievalUnavailable(_) => "retrieval_unavailable",
            EngineError::EmbeddingUnavailable(_) => "embedding_unavailable",
            EngineError::QueryRejected(_) => "query_rejected",
            EngineError::QueryUnparseable(_) => "query_unparseable",
            EngineError::GenerationUnavailable(_) => "generation_unavailable",
            EngineError::SynthesisUnavailable(_) => "synthesis_unavailable",
            EngineError::Cancelled => "cancelled",
        }
    }

    /// Whether a caller may reasonably retry the failed operation.
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            EngineError::RetrievalUnavailable(_)
                | EngineError::EmbeddingUnavailable(_)
                | EngineError::GenerationUnavailable(_)
        )
    }
}

pub type Result<T, E = EngineError> = std::result::Result<T, E>;
