//! Application Services
//!
//! Services that orchestrate domain logic and coordinate between ports.
//!
//! - `StreamEngine`: Public facade over subscriptions and the connection
//! - `Reconnector`: Connection ownership, replay, and backoff
//! - `Worker`: The task that reads frames and routes them to symbol sets

mod engine;
mod reconnector;
mod state;
mod worker;

pub use engine::{EngineError, EngineStats, StreamEngine};
pub use state::{ConnectionState, StateListener};
