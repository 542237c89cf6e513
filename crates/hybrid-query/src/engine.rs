//! Turn orchestration: contextualize, retrieve on both branches, fuse,
//! synthesize, record.
//!
//! # Turn Flow
//!
//! ```text
//! ask(session, question)
//!   ├── lock the session's Conversation (one turn in flight per session)
//!   ├── context_for(question)
//!   ├── tokio::join!
//!   │     ├── vector branch: embed → VectorStore::search(top_k)
//!   │     └── sql branch:    schema snapshot → QueryBuilder → SqlExecutor
//!   │   (each under branch_timeout; failure or timeout degrades to empty)
//!   ├── fuse(vector, sql, context_budget_tokens)
//!   ├── AnswerSynthesizer (raced against the cancellation token)
//!   └── append user + assistant turns
//! ```
//!
//! Cancellation is checked before retrieval and before synthesis; a
//! cancelled turn leaves the conversation untouched.

use async_trait::async_trait;
use serde::Serialize;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use hybrid_query_core::embedding::EmbeddingProvider;
use hybrid_query_core::error::{EngineError, Result};
use hybrid_query_core::executor::{rows_to_candidates, SqlExecutor};
use hybrid_query_core::fusion::{fuse_explained, FusionWeights};
use hybrid_query_core::generation::Generator;
use hybrid_query_core::history::{HistoryConfig, Transcript};
use hybrid_query_core::models::{GeneratedQuery, QueryTurn, RetrievalCandidate};
use hybrid_query_core::query_builder::QueryBuilder;
use hybrid_query_core::schema::SchemaSnapshot;
use hybrid_query_core::store::VectorStore;

use crate::config::Config;
use crate::schema_cache::SchemaCache;
use crate::session::{CancellationToken, SessionRegistry};
use crate::synthesizer::AnswerSynthesizer;

/// Where the SQL branch gets its schema from.
#[async_trait]
pub trait SchemaSource: Send + Sync {
    async fn current(&self) -> Arc<SchemaSnapshot>;
}

#[async_trait]
impl SchemaSource for SchemaCache {
    async fn current(&self) -> Arc<SchemaSnapshot> {
        self.refresh_if_stale().await
    }
}

/// A fixed snapshot, for databases whose schema does not change.
pub struct StaticSchema(pub Arc<SchemaSnapshot>);

#[async_trait]
impl SchemaSource for StaticSchema {
    async fn current(&self) -> Arc<SchemaSnapshot> {
        Arc::clone(&self.0)
    }
}

/// Tunables for a turn.
#[derive(Debug, Clone)]
pub struct EngineSettings {
    pub top_k: i64,
    pub weights: FusionWeights,
    pub context_budget_tokens: usize,
    pub branch_timeout: Duration,
    /// Extra attempts for a branch step failing with a transient error.
    pub max_retries: u32,
    pub history: HistoryConfig,
    pub synthesis_backoff: Duration,
}

impl Default for EngineSettings {
    fn default() -> Self {
        Self {
            top_k: 3,
            weights: FusionWeights::default(),
            context_budget_tokens: 1500,
            branch_timeout: Duration::from_secs(5),
            max_retries: 1,
            history: HistoryConfig::default(),
            synthesis_backoff: Duration::from_millis(500),
        }
    }
}

impl EngineSettings {
    pub fn from_config(config: &Config) -> Self {
        Self {
            top_k: config.retrieval.top_k,
            weights: config.retrieval.weights(),
            context_budget_tokens: config.retrieval.context_budget_tokens,
            branch_timeout: config.retrieval.branch_timeout(),
            max_retries: config.retrieval.max_retries,
            history: config.history.to_core(),
            synthesis_backoff: Duration::from_millis(config.generation.retry_backoff_ms),
        }
    }
}

/// The collaborators an [`Engine`] is assembled from.
pub struct EngineParts {
    pub store: Arc<dyn VectorStore>,
    pub executor: Arc<dyn SqlExecutor>,
    pub embedder: Arc<dyn EmbeddingProvider>,
    pub generator: Arc<dyn Generator>,
    pub schema: Arc<dyn SchemaSource>,
}

/// Result of one completed turn.
#[derive(Debug, Clone, Serialize)]
pub struct TurnOutcome {
    pub session_id: String,
    pub answer: String,
    /// Ids of the context candidates the answer rests on.
    pub provenance: Vec<String>,
    pub grounded: bool,
    /// The SQL produced for this turn, whatever its validation status.
    pub generated_query: Option<GeneratedQuery>,
    /// Fused context handed to the synthesizer, in rank order.
    pub context: Vec<RetrievalCandidate>,
    /// Session history after this turn.
    pub history: Vec<QueryTurn>,
}

#[derive(Debug, Default)]
struct SqlBranch {
    query: Option<GeneratedQuery>,
    candidates: Vec<RetrievalCandidate>,
}

pub struct Engine {
    store: Arc<dyn VectorStore>,
    executor: Arc<dyn SqlExecutor>,
    embedder: Arc<dyn EmbeddingProvider>,
    schema: Arc<dyn SchemaSource>,
    builder: QueryBuilder,
    synthesizer: AnswerSynthesizer,
    sessions: SessionRegistry,
    settings: EngineSettings,
}

impl Engine {
    pub fn new(parts: EngineParts, settings: EngineSettings) -> Self {
        Self {
            store: parts.store,
            executor: parts.executor,
            embedder: parts.embedder,
            schema: parts.schema,
            builder: QueryBuilder::new(Arc::clone(&parts.generator)),
            synthesizer: AnswerSynthesizer::new(parts.generator, settings.synthesis_backoff),
            sessions: SessionRegistry::new(settings.history.clone()),
            settings,
        }
    }

    pub fn settings(&self) -> &EngineSettings {
        &self.settings
    }

    pub fn sessions(&self) -> &SessionRegistry {
        &self.sessions
    }

    /// Start a session under a fresh id.
    pub fn create_session(&self) -> String {
        self.sessions.create()
    }

    /// Discard a session's history. Returns whether the session existed.
    pub fn end_session(&self, session_id: &str) -> bool {
        let existed = self.sessions.end_session(session_id);
        tracing::info!(session = session_id, existed, "session ended");
        existed
    }

    /// Transcript of a session, waiting for any in-flight turn to finish.
    pub async fn history(&self, session_id: &str) -> Option<Transcript> {
        let handle = self.sessions.get(session_id)?;
        let conversation = handle.lock().await;
        Some(conversation.export())
    }

    /// Answer one question within a session.
    pub async fn ask(
        &self,
        session_id: &str,
        question: &str,
        cancel: &CancellationToken,
    ) -> Result<TurnOutcome> {
        let question = question.trim();
        if question.is_empty() {
            return Err(EngineError::InvalidArgument(
                "question must not be empty".to_string(),
            ));
        }

        let handle = self.sessions.get_or_create(session_id)?;
        let mut conversation = handle.lock().await;

        cancel.check()?;
        let contextual = conversation.context_for(question);
        let window = conversation
            .recent(self.settings.history.window_turns)
            .to_vec();

        let (vector, sql) = tokio::join!(
            self.bounded("vector", self.vector_branch(&contextual)),
            self.bounded("sql", self.sql_branch(question, &window)),
        );
        let vector = vector.unwrap_or_default();
        let sql = sql.unwrap_or_default();

        let (context, stats) = fuse_explained(
            vector,
            sql.candidates,
            self.settings.context_budget_tokens,
            &self.settings.weights,
        );
        tracing::info!(
            session = session_id,
            vector_in = stats.vector_in,
            sql_in = stats.sql_in,
            duplicates = stats.duplicates_removed,
            truncated = stats.truncated,
            tokens = stats.tokens_used,
            "context fused"
        );

        cancel.check()?;
        let answer = tokio::select! {
            biased;
            _ = cancel.cancelled() => return Err(EngineError::Cancelled),
            result = self.synthesizer.synthesize(question, &context, &window) => result?,
        };
        cancel.check()?;

        conversation.append(QueryTurn::user(question));
        if let Some(event) = conversation.append(QueryTurn::assistant(answer.answer.clone())) {
            tracing::info!(
                session = session_id,
                dropped = event.dropped.len(),
                summarized = event.summarized,
                "history truncated"
            );
        }

        tracing::info!(
            session = session_id,
            grounded = answer.grounded,
            provenance = answer.provenance.len(),
            "turn complete"
        );

        Ok(TurnOutcome {
            session_id: session_id.to_string(),
            answer: answer.answer,
            provenance: answer.provenance,
            grounded: answer.grounded,
            generated_query: sql.query,
            context,
            history: conversation.turns().to_vec(),
        })
    }

    /// Run a branch under the branch timeout; failure or timeout yields `None`.
    async fn bounded<T>(&self, branch: &'static str, fut: impl Future<Output = Result<T>>) -> Option<T> {
        match tokio::time::timeout(self.settings.branch_timeout, fut).await {
            Ok(Ok(value)) => Some(value),
            Ok(Err(e)) => {
                tracing::warn!(branch, error = %e, "retrieval branch failed, continuing without it");
                None
            }
            Err(_) => {
                tracing::warn!(
                    branch,
                    timeout = ?self.settings.branch_timeout,
                    "retrieval branch timed out, continuing without it"
                );
                None
            }
        }
    }

    /// Retry `op` on transient errors, up to `max_retries` extra attempts.
    async fn retrying<T, F, Fut>(&self, step: &'static str, mut op: F) -> Result<T>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        let mut attempt = 0;
        loop {
            match op().await {
                Ok(value) => return Ok(value),
                Err(e) if e.is_transient() && attempt < self.settings.max_retries => {
                    attempt += 1;
                    tracing::warn!(step, attempt, error = %e, "retrying");
                }
                Err(e) => return Err(e),
            }
        }
    }

    async fn vector_branch(&self, contextual: &str) -> Result<Vec<RetrievalCandidate>> {
        if self.embedder.dims() == 0 {
            tracing::debug!("embeddings disabled, skipping vector search");
            return Ok(Vec::new());
        }
        let embedding = self
            .retrying("embed", move || self.embedder.embed_query(contextual))
            .await?;
        let embedding = embedding.as_slice();
        self.retrying("vector_search", move || {
            self.store.search(embedding, self.settings.top_k, None)
        })
        .await
    }

    async fn sql_branch(&self, question: &str, window: &[QueryTurn]) -> Result<SqlBranch> {
        let snapshot = self.schema.current().await;
        let schema: &SchemaSnapshot = &snapshot;
        let query = self
            .retrying("generate_sql", move || self.builder.build(question, window, schema))
            .await?;

        if !query.is_valid() {
            tracing::info!(
                status = %query.status,
                reason = query.reason.as_deref().unwrap_or(""),
                "generated query not executed"
            );
            return Ok(SqlBranch {
                query: Some(query),
                candidates: Vec::new(),
            });
        }

        tracing::debug!(sql = %query.sql, "executing generated query");
        let executing = &query;
        let candidates = match self
            .retrying("execute_sql", move || self.executor.execute(executing))
            .await
        {
            Ok(rows) => rows_to_candidates(&query, rows),
            Err(e) => {
                tracing::warn!(error = %e, "query execution failed, continuing without rows");
                Vec::new()
            }
        };
        Ok(SqlBranch {
            query: Some(query),
            candidates,
        })
    }
}

/// Assemble an engine over SQLite, with the configured providers.
///
/// Returns the schema cache alongside so callers can start its refresher.
pub async fn build_engine(config: &Config) -> anyhow::Result<(Engine, Arc<SchemaCache>)> {
    use anyhow::Context;

    let store_pool = crate::db::connect(config).await?;
    crate::migrate::apply(&store_pool).await?;
    let store = crate::sqlite_store::SqliteVectorStore::new(store_pool, config.store.similarity);

    let target = crate::db::connect_target(&config.database.path)
        .await
        .with_context(|| format!("Failed to open database: {}", config.database.path.display()))?;
    let schema = Arc::new(
        SchemaCache::load(
            target.clone(),
            config.database.tables.clone(),
            Duration::from_secs(config.database.schema_refresh_secs),
        )
        .await?,
    );
    let executor = crate::executor::SqliteExecutor::new(target, config.database.max_rows);

    let parts = EngineParts {
        store: Arc::new(store),
        executor: Arc::new(executor),
        embedder: crate::embedding::create_provider(&config.embedding.for_turns())?,
        generator: crate::generation::create_generator(&config.generation)?,
        schema: schema.clone(),
    };
    Ok((Engine::new(parts, EngineSettings::from_config(config)), schema))
}
