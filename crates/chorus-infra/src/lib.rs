//! Infrastructure implementations for Chorus.
//!
//! Implements the repository ports from `chorus-core` on SQLite, provides
//! the OpenAI-compatible provider adapter and the provider factory, and
//! loads `chorus.toml`.

pub mod config;
pub mod llm;
pub mod sqlite;
