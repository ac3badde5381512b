//! # Providers
//!
//! Everything between the relay and an AI speech provider:
//!
//! - [`CircuitBreaker`]: per-provider failure isolation
//! - [`ProviderConnection`]: a streaming session that reconnects on its own,
//!   replaying buffered audio for segmented providers
//! - [`ReconnectPolicy`]: provider-specific reconnect quirks
//! - [`ProviderRegistry`]: configured providers and selection by requirements
//! - [`WebSocketConnector`]: the production transport, with a pluggable
//!   [`WireCodec`]
//! - [`MockConnector`]: a scriptable in-process provider for tests

pub mod circuit_breaker;
pub mod connection;
pub mod events;
pub mod mock;
pub mod policy;
pub mod registry;
pub mod replay;
pub mod telemetry;
pub mod transport;
pub mod websocket;

pub use circuit_breaker::{
    BreakerError, BreakerPermit, BreakerSnapshot, CircuitBreaker, CircuitBreakerConfig,
    CircuitState, Rejected
};
pub use connection::{ConnectionContext, ConnectionStats, ProviderConnection};
pub use events::ConnectionEvent;
pub use mock::{ConnectOutcome, MockConnector, MockTransportHandle};
pub use policy::{
    ConnectionSettings, RateLimitAwarePolicy, ReconnectPolicy, StandardPolicy, exponential_backoff
};
pub use registry::{ProviderEntry, ProviderRegistry, ProviderRequirements};
pub use replay::ReplayBuffer;
pub use transport::{
    Connected, DisconnectCause, InboundEvent, ProviderTransport, TransportConnector
};
pub use websocket::{JsonCodec, WebSocketConnector, WebSocketTransport, WireCodec};
