//! # Live Context
//!
//! A live, incrementally updated retrieval index over a codebase.
//!
//! Live Context watches a local directory and receives commit webhooks from a
//! remote repository, re-chunks and re-embeds only what changed, and answers
//! similarity queries that always reflect the newest indexed version of
//! every file.
//!
//! ## Architecture
//!
//! ```text
//! ┌──────────────┐   ┌──────────┐   ┌──────────────────────┐   ┌──────────────────┐
//! │ LocalWatcher │──▶│ debounce │──▶│ Loader → Split →     │──▶│ IncrementalIndex │
//! │ Webhook      │   │ per path │   │ Embed (retrying)     │   │ sharded, per-path│
//! └──────────────┘   └──────────┘   └──────────────────────┘   └────────┬─────────┘
//!                                                                       │
//!                                  ┌────────────────────────────────────┤
//!                                  ▼                                    ▼
//!                            ┌──────────┐                         ┌──────────┐
//!                            │   CLI    │                         │   HTTP   │
//!                            │  (lctx)  │                         │  (axum)  │
//!                            └──────────┘                         └──────────┘
//! ```
//!
//! The runtime-free pieces (chunking, versioning, the index, retrieval and
//! context assembly) live in the `live-context-core` crate.
//!
//! ## Quick Start
//!
//! ```bash
//! lctx index --root ./my-repo               # one-shot index and stats
//! lctx query "where is the config parsed" --root ./my-repo
//! lctx serve                                # watch, accept webhooks, serve HTTP
//! ```
//!
//! ## Modules
//!
//! | Module | Purpose |
//! |--------|---------|
//! | [`config`] | TOML configuration parsing |
//! | [`models`] | Change events and content references |
//! | [`connector_fs`] | Local directory scan and watcher |
//! | [`connector_webhook`] | Remote repository webhook receiver |
//! | [`debounce`] | Per-path event coalescing |
//! | [`loader`] | Content resolution, hashing and versioning |
//! | [`embedding`] | Embedding providers and the retrying wrapper |
//! | [`retry`] | Bounded exponential backoff |
//! | [`ingest`] | Per-source ingestion worker |
//! | [`engine`] | Wiring of index, pipelines and the query path |
//! | [`stats`] | Statistics and source health |
//! | [`search`] | One-shot CLI commands |
//! | [`server`] | HTTP API |

pub mod config;
pub mod connector_fs;
pub mod connector_webhook;
pub mod debounce;
pub mod embedding;
pub mod engine;
pub mod ingest;
pub mod loader;
pub mod models;
pub mod retry;
pub mod search;
pub mod server;
pub mod stats;
