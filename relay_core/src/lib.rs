//! # Voice Relay Core
//!
//! Shared types for the voice relay.
//!
//! This crate provides:
//! - Audio frames and their format metadata
//! - The immutable per-call session configuration
//! - Provider capability descriptors used by selection
//! - The persisted call record and its status lifecycle
//!
//! It has no I/O of its own; every other crate in the workspace builds on it.

pub mod call;
pub mod types;

pub use call::{CallDirection, CallState, CallStatus, InvalidTransition};
pub use types::{
    AudioEncoding, AudioFormat, AudioFrame, ConnectionState, CostTier, ProviderCapabilities,
    ProviderId, ProviderKind, SessionConfig, ToolDefinition
};
