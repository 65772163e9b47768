//! # mycoder
//!
//! A project-aware coding assistant server. Projects are local directory
//! trees; they are chunked into a lexical index (and, when an embedding
//! provider is available, a vector store), and chat requests are grounded
//! in the best-matching snippets plus curated knowledge.
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────┐   ┌──────────────┐   ┌──────────────┐
//! │ FS walker   │──▶│ Chunk+Embed  │──▶│ SQLite       │
//! │             │   │ (jobs)       │   │ FTS5+vectors │
//! └─────────────┘   └──────────────┘   └──────┬───────┘
//!                                             │
//!                ┌────────────────────────────┤
//!                ▼                            ▼
//!          ┌───────────┐              ┌──────────────┐
//!          │ Retrieval │─────────────▶│ Context +    │──▶ chat provider
//!          │ BM25/KNN  │              │ Orchestrator │
//!          └───────────┘              └──────────────┘
//! ```
//!
//! ## Modules
//!
//! | Module | Purpose |
//! |--------|---------|
//! | [`config`] | TOML configuration with `MYCODER_*` overrides |
//! | [`app`] | Runtime wiring shared by the server and CLI |
//! | [`db`], [`migrate`], [`sqlite_store`] | SQLite persistence |
//! | [`connector_fs`] | Project file walker |
//! | [`ingest`], [`jobs`] | Indexing and the job lifecycle |
//! | [`embedding`], [`embed_pipeline`] | Embedding providers, cache, and batching |
//! | [`chat_provider`] | Chat model providers |
//! | [`context`], [`overview`] | Context assembly for chat |
//! | [`chat`] | Chat orchestration |
//! | [`curator`] | Background knowledge and conversation maintenance |
//! | [`fs_ops`], [`patch`] | Project-confined file operations |
//! | [`ratelimit`], [`metrics`], [`sse`] | HTTP cross-cutting pieces |
//! | [`server`] | axum HTTP surface |
//! | [`cli`] | `mycoder` subcommands |

pub mod app;
pub mod chat;
pub mod chat_provider;
pub mod cli;
pub mod config;
pub mod connector_fs;
pub mod context;
pub mod curator;
pub mod db;
pub mod embed_pipeline;
pub mod embedding;
pub mod fs_ops;
pub mod ingest;
pub mod jobs;
pub mod metrics;
pub mod migrate;
pub mod overview;
pub mod patch;
pub mod ratelimit;
pub mod server;
pub mod sqlite_store;
pub mod sse;
