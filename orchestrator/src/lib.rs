//! # Orchestrator
//!
//! Binds telephony legs to provider connections for the lifetime of each
//! call, fails calls over between providers, and exposes the operator
//! control surface.

pub mod admin;
pub mod session;
pub mod telemetry;
pub mod telephony;

pub use admin::{ActiveCall, AdminApi};
pub use session::{
    CallRequest, FAILOVERS_KEY, OrchestratorSettings, PROVIDER_KEY, PROVIDER_SESSION_KEY,
    SessionOrchestrator, SessionStatus, SessionSummary
};
pub use telephony::{LegClosed, LegControl, SessionEvent, TelephonyEndpoint, TelephonyLeg, leg};
