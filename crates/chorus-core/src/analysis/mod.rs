//! Scene analysis of incoming user messages.

pub mod analyzer;
pub mod cache;
pub mod keywords;

pub use analyzer::SceneAnalyzer;
