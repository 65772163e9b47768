//! # mycoder core
//!
//! Runtime-agnostic retrieval logic for mycoder: data models, chunking,
//! the in-memory BM25 index, vector math, store abstractions, retrievers,
//! knowledge curation rules, intent classification, and conversation
//! windowing.
//!
//! This crate does no filesystem, network, or database I/O. The server crate
//! supplies persistent [`store::Store`] implementations and embedding
//! providers.

pub mod chunk;
pub mod conversation;
pub mod embedding;
pub mod intent;
pub mod knowledge;
pub mod lexical;
pub mod models;
pub mod search;
pub mod store;
