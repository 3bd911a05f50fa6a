//! Shared domain types for Chorus.
//!
//! This crate contains the domain types used across the orchestration engine:
//! conversations, agent definitions, scene analysis, execution plans,
//! lifecycle events, provider request/response shapes, and configuration.
//!
//! Zero infrastructure dependencies -- only serde, uuid, chrono, thiserror.

pub mod agent;
pub mod analysis;
pub mod config;
pub mod conversation;
pub mod error;
pub mod event;
pub mod llm;
pub mod plan;
