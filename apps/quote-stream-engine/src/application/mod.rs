//! Application Layer - Use cases and port definitions.
//!
//! This layer contains the application services and port interfaces
//! that define how the streaming engine interacts with the transport.

/// Port interfaces for external systems (socket transport).
pub mod ports;

/// Application services: reconnector and engine facade.
pub mod services;
