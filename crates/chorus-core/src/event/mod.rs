//! Ordered event delivery for orchestration runs.

pub mod emitter;

pub use emitter::EventEmitter;
