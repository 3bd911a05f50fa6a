//! HTTP API layer: JSON endpoints under `/api/v1/` and an SSE stream of
//! orchestration events per posted message.

pub mod error;
pub mod handlers;
pub mod response;
pub mod router;
