#![cfg_attr(
    test,
    allow(
        clippy::unwrap_used,
        clippy::expect_used,
        clippy::float_cmp,
        clippy::significant_drop_tightening,
        clippy::too_many_lines,
        clippy::match_same_arms,
        clippy::needless_pass_by_value,
        clippy::needless_collect,
        clippy::option_if_let_else,
        clippy::default_trait_access,
        clippy::items_after_statements,
        clippy::or_fun_call
    )
)]

//! Quote Stream Engine - Live Chart Data Relay
//!
//! Maintains a single WebSocket connection to a chart quoting service,
//! multiplexes many symbol/exchange/interval chart sessions over it, and
//! fans decoded bars out to in-process consumers. Dropped connections are
//! re-established with backoff and every live subscription is replayed.
//!
//! # Layers (inside to outside)
//!
//! - **Domain**: Core streaming logic and data types
//!   - `streaming`: Intervals, symbol keys, bars, updates
//!   - `subscription`: Session registry with reference-counted subscriptions
//!   - `fanout`: Symbol sets, consumers, delivery policies
//!
//! - **Application**: Use cases and port definitions
//!   - `ports`: Transport and connector interfaces
//!   - `services`: Stream engine facade, reconnector, stream worker
//!
//! - **Infrastructure**: Adapters and external integrations
//!   - `quote`: Wire codec, protocol messages, connection, WebSocket transport
//!   - `config`: Environment configuration
//!   - `health`: Health check HTTP endpoint
//!   - `metrics` / `telemetry`: Prometheus and OpenTelemetry
//!
//! # Data Flow
//!
//! ```text
//!                      +-------------+      +--------------+
//! Quote WS  <--------> |   Stream    | ---> | Symbol Set A | --> consumers
//!  (one socket)        |   Worker    |      +--------------+
//!                      |  (codec +   | ---> | Symbol Set B | --> consumers
//!                      |   router)   |      +--------------+
//!                      +-------------+
//!                            ^
//!        create / remove     |  open / close chart sessions
//!        symbol sets  -------+
//! ```

#![forbid(unsafe_code)]
#![warn(missing_docs)]
#![warn(clippy::pedantic)]

// =============================================================================
// Module Declarations
// =============================================================================

/// Domain layer - Core streaming types with no external I/O.
pub mod domain;

/// Application layer - Use cases and port definitions.
pub mod application;

/// Infrastructure layer - Adapters and external integrations.
pub mod infrastructure;

// =============================================================================
// Re-exports
// =============================================================================

// Domain types
pub use domain::fanout::{
    Consumer, ConsumerError, ConsumerFault, ConsumerHandle, DeliveryPolicy, SymbolSet,
    SymbolSetHandle,
};
pub use domain::streaming::{Bar, Interval, SymbolKey, Update};
pub use domain::subscription::{SessionId, SubscriptionError, SubscriptionStatus};

// Engine facade
pub use application::ports::{Connector, Transport, TransportError};
pub use application::services::{ConnectionState, EngineError, EngineStats, StreamEngine};

// Infrastructure config
pub use infrastructure::config::{
    ConfigError, Credential, EngineConfig, ServerSettings, SessionSettings, WebSocketSettings,
    parse_symbol_list,
};

// Quote stream transport
pub use infrastructure::quote::WebSocketConnector;

// Health server
pub use infrastructure::health::{HealthServer, HealthServerError, HealthServerState};

// Metrics
pub use infrastructure::metrics::init_metrics;

// Telemetry
pub use infrastructure::telemetry::{TelemetryConfig, TelemetryGuard, init as init_telemetry};
