//! # Hybrid Query
//!
//! **Conversational question answering over a relational database and a
//! vector store.**
//!
//! Each question is answered from two retrieval branches run concurrently:
//! a vector search over embedded rows and documents, and a generated,
//! validated, read-only SQL query against the live database. The results are
//! fused into one ranked, token-bounded context and a grounded answer is
//! synthesized from it, citing the candidates it used.
//!
//! ## Architecture
//!
//! ```text
//!                    ┌──────────────┐
//!   question ───────▶│ Conversation │ (recent turns)
//!                    └──────┬───────┘
//!               ┌───────────┴───────────┐
//!               ▼                       ▼
//!        ┌─────────────┐        ┌───────────────┐
//!        │ VectorStore │        │ QueryBuilder  │──▶ SqliteExecutor
//!        │  (sqlite)   │        │ (LLM + guard) │    (read-only)
//!        └──────┬──────┘        └───────┬───────┘
//!               └──────────┬────────────┘
//!                          ▼
//!                    ┌──────────┐     ┌──────────────────┐
//!                    │   fuse   │────▶│ AnswerSynthesizer│──▶ answer + provenance
//!                    └──────────┘     └──────────────────┘
//! ```
//!
//! ## Modules
//!
//! | Module | Purpose |
//! |--------|---------|
//! | [`config`] | TOML configuration parsing and validation |
//! | [`db`] | SQLite connections: vector store (read-write) and target database (read-only) |
//! | [`migrate`] | Vector store tables |
//! | [`sqlite_store`] | SQLite `VectorStore` implementation |
//! | [`schema_cache`] | Schema introspection and snapshot refresh |
//! | [`executor`] | Read-only execution of validated queries |
//! | [`embedding`] | Embedding providers: disabled, hash, OpenAI, Ollama, fastembed |
//! | [`generation`] | Chat generation backends: OpenAI-compatible, Ollama |
//! | [`synthesizer`] | Grounded answer synthesis with provenance |
//! | [`session`] | Session registry and cancellation tokens |
//! | [`engine`] | Turn orchestration |
//! | [`ingest`] | Vector store population from database rows |
//! | [`server`] | HTTP API (Axum) |
//!
//! Engine-independent logic (models, SQL validation, fusion, conversation
//! history, prompts) lives in `hybrid-query-core`.

pub mod config;
pub mod db;
pub mod embedding;
pub mod engine;
pub mod executor;
pub mod generation;
pub mod ingest;
pub mod migrate;
pub mod schema_cache;
pub mod server;
pub mod session;
pub mod sqlite_store;
pub mod synthesizer;
