//! # Voice relay server
//!
//! Process wiring for the relay: store tiers, provider registry, session
//! orchestrator and the admin HTTP surface. Authentication of the admin
//! surface is left to the deployment.

pub mod bootstrap;
pub mod api_error;
pub mod routes;

pub use api_error::{ApiError, ApiResult};
pub use routes::{AppState, create_router};
