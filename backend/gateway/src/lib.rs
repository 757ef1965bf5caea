//! pagecast Gateway HTTP API Server
//!
//! Public banner plus keyword-gated start/stop/status control endpoints.

pub mod auth;
pub mod error;
pub mod routes;
pub mod server;

pub use error::ApiError;
pub use server::{GatewayState, SERVICE_NAME, router, start_server};
