//! Configuration Module
//!
//! Configuration loading for the quote stream engine.

mod settings;

pub use settings::{
    ConfigError, Credential, DEFAULT_ENDPOINT, DEFAULT_ORIGIN, EngineConfig, ServerSettings,
    SessionSettings, WebSocketSettings, parse_symbol_list,
};
