//! HTTP surface.
//!
//! Exposes the orchestrator, the sampling engine and the metrics engine as
//! JSON endpoints under `/api/`. Every call is synchronous request/response;
//! classification runs proceed in the background and are observed by
//! polling `GET /api/runs/:id`.

pub mod endpoints;
pub mod error;
pub mod router;
pub mod server;
pub mod types;

pub use error::ApiError;
pub use router::api_router;
pub use server::{start_server, ApiServer};
pub use types::ApiContext;
