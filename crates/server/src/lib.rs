//! Docflow Server - HTTP API for asynchronous document extraction
//!
//! Clients submit documents (by URL or raw text), poll task status, revoke
//! tasks and receive signed webhook callbacks when work completes.
//!
//! # Quick Start
//!
//! ```rust,no_run
//! use server::ServerConfig;
//!
//! #[tokio::main]
//! async fn main() -> anyhow::Result<()> {
//!     let config = ServerConfig::load()?;
//!     server::start_server(config).await?;
//!     Ok(())
//! }
//! ```
//!
//! # API Endpoints
//!
//! All paths below are relative to `api_prefix` (default `/api/v1`).
//!
//! - `POST /extract` - Submit one document
//! - `POST /extract/batch` - Submit a batch with one aggregated callback
//! - `GET /tasks/{id}` - Task state, progress, result or error
//! - `DELETE /tasks/{id}?terminate=bool` - Revoke a task
//! - `GET /health` - Liveness probe
//! - `GET /health/broker` - Worker pool readiness, bounded to 5 seconds
//! - `GET /metrics` - Prometheus text exposition
//!
//! Configuration comes from an optional `docflow.toml` and `DOCFLOW__*`
//! environment variables; see [`ServerConfig`].

pub mod config;
pub mod error;
pub mod middleware;
pub mod routes;
pub mod server;
pub mod state;

pub use config::ServerConfig;
pub use error::{ServerError, ServerResult};
pub use server::{build_router, start_server};
pub use state::{Components, ServerState};
