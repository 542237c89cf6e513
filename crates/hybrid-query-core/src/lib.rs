//! # Hybrid Query Core
//!
//! Shared, WASM-safe logic for Hybrid Query: data models, schema binding,
//! SQL validation, score fusion, conversation state, prompt construction,
//! and the store, embedding, generation and execution traits.
//!
//! This crate contains no tokio, sqlx, filesystem I/O, or other
//! native-only dependencies. Network and database backends live in the
//! `hybrid-query` app crate.

pub mod embedding;
pub mod error;
pub mod executor;
pub mod fusion;
pub mod generation;
pub mod history;
pub mod models;
pub mod prompt;
pub mod query_builder;
pub mod schema;
pub mod sql;
pub mod store;

pub use error::{EngineError, Result};
