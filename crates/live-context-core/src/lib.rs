//! # Live Context Core
//!
//! Runtime-free logic for Live Context: the data model, the token splitter,
//! the embedder trait, the per-path version tracker, the sharded incremental
//! index, the retriever, and the context builder.
//!
//! This crate contains no tokio, HTTP, or filesystem dependencies. The
//! `live-context` app crate wires these pieces to watchers, a Loader, and an
//! HTTP server.
//!
//! ```text
//!  Document ──▶ chunk::split_document ──▶ Embedder ──▶ IncrementalIndex
//!                                                          ▲
//!  query text ──▶ Retriever ──(embed + query)──────────────┘
//!                     │
//!                     ▼
//!               context::build ──▶ ContextPayload
//! ```

pub mod chunk;
pub mod context;
pub mod embedding;
pub mod error;
pub mod index;
pub mod models;
pub mod retrieve;
pub mod version;

pub use error::{EngineError, Result};
