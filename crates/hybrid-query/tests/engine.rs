use async_trait::async_trait;
use sqlx::SqlitePool;
use std::sync::Arc;
use std::time::Duration;
use tempfile::TempDir;

use hybrid_query::db;
use hybrid_query::engine::{Engine, EngineParts, EngineSettings, StaticSchema};
use hybrid_query::executor::SqliteExecutor;
use hybrid_query::ingest::populate_vector_store;
use hybrid_query::schema_cache::introspect;
use hybrid_query::session::CancellationToken;
use hybrid_query_core::embedding::{EmbeddingProvider, HashingEmbedder};
use hybrid_query_core::error::{EngineError, Result};
use hybrid_query_core::generation::{Generator, ScriptedGenerator};
use hybrid_query_core::history::HistoryConfig;
use hybrid_query_core::models::{CandidateSource, DocumentChunk, Role, ValidationStatus};
use hybrid_query_core::prompt::{GenerationPurpose, GenerationRequest, NO_CONTEXT_DISCLAIMER};
use hybrid_query_core::store::memory::InMemoryVectorStore;
use hybrid_query_core::store::VectorStore;

const TOP_CUSTOMER_SQL: &str = "SELECT c.name, o.item, o.ordered_at \
    FROM customers c JOIN orders o ON o.customer_id = c.id \
    WHERE o.ordered_at >= date('now', 'start of month', '-1 month') \
    AND o.ordered_at < date('now', 'start of month') \
    AND c.id = (SELECT customer_id FROM orders GROUP BY customer_id ORDER BY SUM(amount) DESC LIMIT 1) \
    ORDER BY o.ordered_at";

/// A shop database: customers, orders (two last month, one older) and products.
async fn shop_db(tmp: &TempDir) -> SqlitePool {
    let path = tmp.path().join("shop.sqlite");
    let writer = SqlitePool::connect(&format!("sqlite:{}?mode=rwc", path.display()))
        .await
        .unwrap();
    for stmt in [
        "CREATE TABLE customers (id INTEGER PRIMARY KEY, name TEXT NOT NULL, city TEXT)",
        "CREATE TABLE orders (id INTEGER PRIMARY KEY, customer_id INTEGER, item TEXT, amount REAL, ordered_at TEXT)",
        "CREATE TABLE products (id INTEGER PRIMARY KEY, name TEXT, price REAL)",
        "INSERT INTO customers VALUES (1, 'Ada', 'London'), (2, 'Bob', 'Paris')",
        "INSERT INTO orders VALUES (1, 1, 'lamp', 120.0, date('now', 'start of month', '-15 days'))",
        "INSERT INTO orders VALUES (2, 1, 'desk', 300.0, date('now', 'start of month', '-10 days'))",
        "INSERT INTO orders VALUES (3, 2, 'chair', 80.0, date('now', 'start of month', '-12 days'))",
        "INSERT INTO orders VALUES (4, 1, 'rug', 50.0, date('now', 'start of month', '-90 days'))",
        "INSERT INTO products VALUES (1, 'lamp', 120.0), (2, 'desk', 300.0)",
    ] {
        sqlx::query(stmt).execute(&writer).await.unwrap();
    }
    writer.close().await;
    db::connect_target(&path).await.unwrap()
}

struct Fixture {
    _tmp: TempDir,
    pool: SqlitePool,
    store: Arc<InMemoryVectorStore>,
    embedder: Arc<HashingEmbedder>,
}

impl Fixture {
    async fn new() -> Self {
        let tmp = TempDir::new().unwrap();
        let pool = shop_db(&tmp).await;
        Self {
            _tmp: tmp,
            pool,
            store: Arc::new(InMemoryVectorStore::new()),
            embedder: Arc::new(HashingEmbedder::new(256)),
        }
    }

    async fn populate(&self, tables: &[&str]) {
        let schema = introspect(&self.pool, &[]).await.unwrap();
        let tables: Vec<String> = tables.iter().map(|t| t.to_string()).collect();
        populate_vector_store(
            &self.pool,
            &schema,
            &tables,
            self.store.as_ref(),
            self.embedder.as_ref(),
            16,
        )
        .await
        .unwrap();
    }

    async fn engine_with(
        &self,
        generator: Arc<dyn Generator>,
        embedder: Arc<dyn EmbeddingProvider>,
        settings: EngineSettings,
    ) -> Engine {
        let schema = introspect(&self.pool, &[]).await.unwrap();
        Engine::new(
            EngineParts {
                store: self.store.clone(),
                executor: Arc::new(SqliteExecutor::new(self.pool.clone(), 50)),
                embedder,
                generator,
                schema: Arc::new(StaticSchema(Arc::new(schema))),
            },
            settings,
        )
    }

    async fn engine(&self, generator: Arc<dyn Generator>) -> Engine {
        self.engine_with(generator, self.embedder.clone(), fast_settings())
            .await
    }
}

fn fast_settings() -> EngineSettings {
    EngineSettings {
        synthesis_backoff: Duration::from_millis(1),
        ..Default::default()
    }
}

fn top_customer_generator() -> Arc<ScriptedGenerator> {
    Arc::new(ScriptedGenerator::new().with_sql("top customer", TOP_CUSTOMER_SQL))
}

#[tokio::test]
async fn test_top_customer_last_month_end_to_end() {
    let fx = Fixture::new().await;
    let engine = fx.engine(top_customer_generator()).await;

    let outcome = engine
        .ask("s1", "What did the top customer buy last month?", &CancellationToken::new())
        .await
        .unwrap();

    let query = outcome.generated_query.as_ref().unwrap();
    assert_eq!(query.status, ValidationStatus::Valid);
    assert_eq!(query.target_tables, vec!["customers", "orders"]);

    let sql_items: Vec<String> = outcome
        .context
        .iter()
        .filter(|c| c.source == CandidateSource::Sql)
        .map(|c| c.text())
        .collect();
    assert_eq!(sql_items.len(), 2);
    assert!(sql_items[0].contains("item: lamp"));
    assert!(sql_items[1].contains("item: desk"));
    assert!(sql_items.iter().all(|t| t.contains("name: Ada")));
    assert!(!sql_items.iter().any(|t| t.contains("rug")));

    assert!(outcome.grounded);
    assert!(!outcome.provenance.is_empty());
    assert!(outcome
        .provenance
        .iter()
        .all(|id| outcome.context.iter().any(|c| &c.id == id)));
    assert_eq!(outcome.history.len(), 2);
    assert_eq!(outcome.history[0].role, Role::User);
    assert_eq!(outcome.history[1].text, outcome.answer);
}

#[tokio::test]
async fn test_unknown_table_completes_vector_only() {
    let fx = Fixture::new().await;
    fx.populate(&["customers"]).await;
    let generator = Arc::new(ScriptedGenerator::new().with_sql("supplier", "SELECT name FROM suppliers"));
    let engine = fx.engine(generator).await;

    let outcome = engine
        .ask("s1", "Which supplier ships lamps?", &CancellationToken::new())
        .await
        .unwrap();

    let query = outcome.generated_query.unwrap();
    assert_eq!(query.status, ValidationStatus::Unparseable);
    assert!(query.reason.unwrap().contains("suppliers"));
    assert!(!outcome.context.is_empty());
    assert!(outcome
        .context
        .iter()
        .all(|c| c.source == CandidateSource::Vector));
    assert!(outcome.grounded);
    assert!(!outcome.provenance.is_empty());
}

#[tokio::test]
async fn test_both_branches_empty_gives_disclaimer() {
    let fx = Fixture::new().await;
    let engine = fx.engine(Arc::new(ScriptedGenerator::new())).await;

    let outcome = engine
        .ask("s1", "What is the meaning of life?", &CancellationToken::new())
        .await
        .unwrap();

    assert!(outcome.context.is_empty());
    assert!(!outcome.grounded);
    assert!(outcome.provenance.is_empty());
    assert!(outcome.answer.starts_with(NO_CONTEXT_DISCLAIMER));
    assert_eq!(
        outcome.generated_query.unwrap().status,
        ValidationStatus::Unparseable
    );
}

#[tokio::test]
async fn test_sql_only_when_store_is_empty() {
    let fx = Fixture::new().await;
    let engine = fx.engine(top_customer_generator()).await;

    let outcome = engine
        .ask("s1", "top customer purchases?", &CancellationToken::new())
        .await
        .unwrap();
    assert!(!outcome.context.is_empty());
    assert!(outcome
        .context
        .iter()
        .all(|c| c.source == CandidateSource::Sql));
}

#[tokio::test]
async fn test_same_fact_from_both_branches_appears_once() {
    let fx = Fixture::new().await;
    fx.populate(&["customers"]).await;
    let generator = Arc::new(
        ScriptedGenerator::new().with_sql("ada", "SELECT * FROM customers WHERE id = 1"),
    );
    let engine = fx.engine(generator).await;

    let outcome = engine
        .ask("s1", "Tell me about Ada", &CancellationToken::new())
        .await
        .unwrap();

    let ada = "Table: customers\nid: 1\nname: Ada\ncity: London";
    let matching: Vec<_> = outcome.context.iter().filter(|c| c.text() == ada).collect();
    assert_eq!(matching.len(), 1);
    assert_eq!(matching[0].source, CandidateSource::Sql);
    assert!(outcome
        .context
        .iter()
        .any(|c| c.text().contains("name: Bob")));
    let ranks: Vec<usize> = outcome.context.iter().map(|c| c.rank).collect();
    assert_eq!(ranks, (1..=outcome.context.len()).collect::<Vec<_>>());
}

#[tokio::test]
async fn test_context_respects_token_budget() {
    let fx = Fixture::new().await;
    fx.populate(&["customers", "orders", "products"]).await;
    let settings = EngineSettings {
        context_budget_tokens: 20,
        top_k: 10,
        ..fast_settings()
    };
    let engine = fx
        .engine_with(top_customer_generator(), fx.embedder.clone(), settings)
        .await;

    let outcome = engine
        .ask("s1", "What did the top customer buy last month?", &CancellationToken::new())
        .await
        .unwrap();
    let used: usize = outcome.context.iter().map(|c| c.estimated_tokens()).sum();
    assert!(used <= 20);
    assert!(!outcome.context.is_empty());
}

#[tokio::test]
async fn test_followup_question_sees_history() {
    let fx = Fixture::new().await;
    let engine = fx.engine(top_customer_generator()).await;
    let cancel = CancellationToken::new();

    engine
        .ask("s1", "What did the top customer buy last month?", &cancel)
        .await
        .unwrap();
    let second = engine.ask("s1", "And how much did it cost?", &cancel).await.unwrap();
    assert_eq!(second.history.len(), 4);
    assert_eq!(second.history[2].text, "And how much did it cost?");

    let other = engine.ask("s2", "Hello?", &cancel).await.unwrap();
    assert_eq!(other.history.len(), 2);
}

#[tokio::test]
async fn test_history_is_bounded_by_max_turns() {
    let fx = Fixture::new().await;
    let settings = EngineSettings {
        history: HistoryConfig {
            max_turns: 4,
            ..Default::default()
        },
        ..fast_settings()
    };
    let engine = fx
        .engine_with(Arc::new(ScriptedGenerator::new()), fx.embedder.clone(), settings)
        .await;
    let cancel = CancellationToken::new();

    for q in ["first?", "second?", "third?"] {
        engine.ask("s1", q, &cancel).await.unwrap();
    }
    let transcript = engine.history("s1").await.unwrap();
    assert_eq!(transcript.turns.len(), 4);
    assert_eq!(transcript.turns[0].text, "second?");
    // one truncation per overflowing append: the third user turn and its answer
    assert_eq!(transcript.truncations, 2);
}

#[tokio::test]
async fn test_end_session_clears_history() {
    let fx = Fixture::new().await;
    let engine = fx.engine(Arc::new(ScriptedGenerator::new())).await;
    engine
        .ask("s1", "hello?", &CancellationToken::new())
        .await
        .unwrap();
    assert!(engine.end_session("s1"));
    assert!(engine.history("s1").await.is_none());

    let outcome = engine
        .ask("s1", "again?", &CancellationToken::new())
        .await
        .unwrap();
    assert_eq!(outcome.history.len(), 2);
}

#[tokio::test]
async fn test_empty_question_is_invalid() {
    let fx = Fixture::new().await;
    let engine = fx.engine(Arc::new(ScriptedGenerator::new())).await;
    let err = engine
        .ask("s1", "   ", &CancellationToken::new())
        .await
        .unwrap_err();
    assert!(matches!(err, EngineError::InvalidArgument(_)));
}

#[tokio::test]
async fn test_cancel_before_turn_records_nothing() {
    let fx = Fixture::new().await;
    let generator = top_customer_generator();
    let engine = fx.engine(generator.clone()).await;
    let cancel = CancellationToken::new();
    cancel.cancel();

    let err = engine
        .ask("s1", "What did the top customer buy last month?", &cancel)
        .await
        .unwrap_err();
    assert_eq!(err, EngineError::Cancelled);
    assert_eq!(generator.sql_calls(), 0);
    assert!(engine.history("s1").await.unwrap().turns.is_empty());
}

/// Generates SQL instantly but takes a long time to answer.
struct SlowAnswers {
    delay: Duration,
}

#[async_trait]
impl Generator for SlowAnswers {
    fn model_name(&self) -> &str {
        "slow"
    }

    async fn generate(&self, request: &GenerationRequest) -> Result<String> {
        match request.purpose {
            GenerationPurpose::Sql => Ok("no sql".to_string()),
            GenerationPurpose::Answer => {
                tokio::time::sleep(self.delay).await;
                Ok(format!("answer to {}", request.question))
            }
        }
    }
}

#[tokio::test]
async fn test_cancel_during_synthesis_discards_answer() {
    let fx = Fixture::new().await;
    let engine = Arc::new(
        fx.engine(Arc::new(SlowAnswers {
            delay: Duration::from_secs(5),
        }))
        .await,
    );
    let cancel = CancellationToken::new();

    let turn = {
        let engine = engine.clone();
        let cancel = cancel.clone();
        tokio::spawn(async move { engine.ask("s1", "slow question?", &cancel).await })
    };
    tokio::time::sleep(Duration::from_millis(100)).await;
    cancel.cancel();

    let result = tokio::time::timeout(Duration::from_secs(2), turn)
        .await
        .unwrap()
        .unwrap();
    assert_eq!(result.unwrap_err(), EngineError::Cancelled);
    assert!(engine.history("s1").await.unwrap().turns.is_empty());
}

#[tokio::test]
async fn test_concurrent_turns_in_one_session_are_serialized() {
    let fx = Fixture::new().await;
    let engine = fx
        .engine(Arc::new(SlowAnswers {
            delay: Duration::from_millis(50),
        }))
        .await;
    let cancel = CancellationToken::new();

    let (a, b) = tokio::join!(
        engine.ask("s1", "first?", &cancel),
        engine.ask("s1", "second?", &cancel),
    );
    a.unwrap();
    b.unwrap();

    let turns = engine.history("s1").await.unwrap().turns;
    assert_eq!(turns.len(), 4);
    let roles: Vec<Role> = turns.iter().map(|t| t.role).collect();
    assert_eq!(roles, vec![Role::User, Role::Assistant, Role::User, Role::Assistant]);
    assert!(turns[1].text.ends_with(&format!("answer to {}", turns[0].text)));
    assert!(turns[3].text.ends_with(&format!("answer to {}", turns[2].text)));
}

#[tokio::test]
async fn test_embedder_with_other_dims_is_not_grounded() {
    let fx = Fixture::new().await;
    fx.populate(&["customers"]).await;
    let engine = fx
        .engine_with(
            Arc::new(ScriptedGenerator::new()),
            Arc::new(HashingEmbedder::new(64)),
            fast_settings(),
        )
        .await;

    let outcome = engine
        .ask("s1", "Tell me about Ada", &CancellationToken::new())
        .await
        .unwrap();
    assert!(outcome.context.is_empty());
    assert!(!outcome.grounded);
    assert!(outcome.answer.starts_with(NO_CONTEXT_DISCLAIMER));
}

/// Embeds after a delay longer than the branch timeout.
struct StalledEmbedder;

#[async_trait]
impl EmbeddingProvider for StalledEmbedder {
    fn model_name(&self) -> &str {
        "stalled"
    }
    fn dims(&self) -> usize {
        256
    }
    async fn embed(&self, texts: &[String]) -> Result<Vec<Vec<f32>>> {
        tokio::time::sleep(Duration::from_secs(5)).await;
        Ok(texts.iter().map(|_| vec![0.0; 256]).collect())
    }
}

#[tokio::test]
async fn test_slow_vector_branch_degrades_to_sql_only() {
    let fx = Fixture::new().await;
    fx.populate(&["customers"]).await;
    let settings = EngineSettings {
        branch_timeout: Duration::from_millis(200),
        ..fast_settings()
    };
    let engine = fx
        .engine_with(top_customer_generator(), Arc::new(StalledEmbedder), settings)
        .await;

    let outcome = engine
        .ask("s1", "What did the top customer buy last month?", &CancellationToken::new())
        .await
        .unwrap();
    assert!(!outcome.context.is_empty());
    assert!(outcome
        .context
        .iter()
        .all(|c| c.source == CandidateSource::Sql));
}

#[tokio::test]
async fn test_sql_generation_failure_degrades_to_vector_only() {
    let fx = Fixture::new().await;
    fx.populate(&["customers"]).await;
    let generator = Arc::new(ScriptedGenerator::new().failing_sql());
    let engine = fx.engine(generator.clone()).await;

    let outcome = engine
        .ask("s1", "Who lives in London?", &CancellationToken::new())
        .await
        .unwrap();
    assert!(outcome.generated_query.is_none());
    assert!(!outcome.context.is_empty());
    // one attempt plus one retry
    assert_eq!(generator.sql_calls(), 2);
}

#[tokio::test]
async fn test_synthesis_failure_is_turn_error() {
    let fx = Fixture::new().await;
    let generator = Arc::new(
        ScriptedGenerator::new()
            .with_sql("top customer", TOP_CUSTOMER_SQL)
            .failing_answers(2),
    );
    let engine = fx.engine(generator).await;

    let err = engine
        .ask("s1", "What did the top customer buy last month?", &CancellationToken::new())
        .await
        .unwrap_err();
    assert!(matches!(err, EngineError::SynthesisUnavailable(_)));
    assert!(engine.history("s1").await.unwrap().turns.is_empty());
}

#[tokio::test]
async fn test_rejected_sql_is_never_executed() {
    let fx = Fixture::new().await;
    let generator = Arc::new(ScriptedGenerator::new().with_sql("delete", "DELETE FROM orders"));
    let engine = fx.engine(generator).await;

    let outcome = engine
        .ask("s1", "Please delete all orders", &CancellationToken::new())
        .await
        .unwrap();
    assert_eq!(
        outcome.generated_query.unwrap().status,
        ValidationStatus::Rejected
    );
    let count: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM orders")
        .fetch_one(&fx.pool)
        .await
        .unwrap();
    assert_eq!(count, 4);
}

#[tokio::test]
async fn test_store_chunks_without_table_metadata_are_searchable() {
    let fx = Fixture::new().await;
    let text = "Returns policy: lamps can be returned within 30 days";
    fx.store
        .upsert(&[DocumentChunk::new("doc:returns", text, fx.embedder.embed_text(text))])
        .await
        .unwrap();
    let engine = fx.engine(Arc::new(ScriptedGenerator::new())).await;

    let outcome = engine
        .ask("s1", "Can lamps be returned?", &CancellationToken::new())
        .await
        .unwrap();
    assert_eq!(outcome.context[0].id, "doc:returns");
    assert_eq!(outcome.provenance, vec!["doc:returns"]);
}
