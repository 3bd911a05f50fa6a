//! Orchestration engine and repository trait definitions for Chorus.
//!
//! This crate defines the "ports" (repository and provider traits) that the
//! infrastructure layer implements, plus the engine itself: scene analysis,
//! scheduling, orchestration, aggregation, and event emission. It depends
//! only on `chorus-types` -- never on `chorus-infra` or any database/IO crate.

pub mod agent;
pub mod aggregate;
pub mod analysis;
pub mod event;
pub mod llm;
pub mod orchestrator;
pub mod repository;
pub mod scheduler;
