//! Domain Layer - Core streaming types and business logic.
//!
//! This layer contains the core domain types for chart data streaming
//! with no I/O. Symbol sets, the session registry and the update model
//! are pure Rust and synchronized by the engine that owns them.

/// Chart data types (intervals, symbol keys, bars, updates).
pub mod streaming;

/// Session registry: reference-counted subscriptions and routing.
pub mod subscription;

/// Symbol sets and consumer fan-out.
pub mod fanout;
