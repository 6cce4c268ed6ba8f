//! Chart Session Protocol Messages
//!
//! Client-to-server message types for the chart quoting protocol. Every
//! message is a JSON object `{"m": <name>, "p": [<params>...]}` wrapped in a
//! length-prefixed frame by the codec.
//!
//! # Message Types
//!
//! ## Connection
//! - `set_auth_token`: Present the bearer credential (or the anonymous token)
//!
//! ## Chart Sessions (one per subscription)
//! - `chart_create_session`: Open a chart session
//! - `resolve_symbol`: Bind a ticker to the session
//! - `create_series`: Start streaming bars for an interval
//! - `chart_delete_session`: Tear the session down

use serde::{Deserialize, Serialize};
use serde_json::{Value, json};

use crate::domain::streaming::SymbolKey;
use crate::domain::subscription::SessionId;

/// Token presented when no credential is configured.
pub const ANONYMOUS_TOKEN: &str = "unauthorized_user_token";

/// Symbol alias bound by `resolve_symbol` and referenced by `create_series`.
const SYMBOL_ALIAS: &str = "sds_sym_1";

/// Series identifier within a chart session.
const SERIES_ID: &str = "sds_1";

/// Series tag within a chart session.
const SERIES_TAG: &str = "s1";

/// Price adjustment requested for resolved symbols.
const ADJUSTMENT: &str = "splits";

/// Trading session requested for resolved symbols.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TradingSession {
    /// Regular trading hours only.
    #[default]
    Regular,
    /// Including pre- and post-market.
    Extended,
}

impl TradingSession {
    /// Wire name of the session.
    #[must_use]
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::Regular => "regular",
            Self::Extended => "extended",
        }
    }
}

/// A client protocol message.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProtocolMessage {
    /// Message name.
    pub m: String,
    /// Positional parameters.
    pub p: Vec<Value>,
}

impl ProtocolMessage {
    /// Build a message from a name and parameters.
    #[must_use]
    pub fn new(name: impl Into<String>, params: Vec<Value>) -> Self {
        Self {
            m: name.into(),
            p: params,
        }
    }

    /// `set_auth_token`; `None` presents the anonymous token.
    #[must_use]
    pub fn set_auth_token(token: Option<&str>) -> Self {
        Self::new("set_auth_token", vec![json!(token.unwrap_or(ANONYMOUS_TOKEN))])
    }

    /// `chart_create_session`.
    #[must_use]
    pub fn chart_create_session(session: &SessionId) -> Self {
        Self::new("chart_create_session", vec![json!(session.as_str()), json!("")])
    }

    /// `resolve_symbol` for the key's ticker.
    #[must_use]
    pub fn resolve_symbol(session: &SessionId, key: &SymbolKey, trading: TradingSession) -> Self {
        let descriptor = json!({
            "symbol": key.ticker(),
            "adjustment": ADJUSTMENT,
            "session": trading.as_str(),
        });
        Self::new(
            "resolve_symbol",
            vec![
                json!(session.as_str()),
                json!(SYMBOL_ALIAS),
                json!(format!("={descriptor}")),
            ],
        )
    }

    /// `create_series` requesting `bars` initial bars at the key's interval.
    #[must_use]
    pub fn create_series(session: &SessionId, key: &SymbolKey, bars: u32) -> Self {
        Self::new(
            "create_series",
            vec![
                json!(session.as_str()),
                json!(SERIES_ID),
                json!(SERIES_TAG),
                json!(SYMBOL_ALIAS),
                json!(key.interval.as_wire()),
                json!(bars),
            ],
        )
    }

    /// `chart_delete_session`.
    #[must_use]
    pub fn chart_delete_session(session: &SessionId) -> Self {
        Self::new("chart_delete_session", vec![json!(session.as_str())])
    }

    /// The three messages that open a chart session for a key.
    #[must_use]
    pub fn open_session(
        session: &SessionId,
        key: &SymbolKey,
        trading: TradingSession,
        bars: u32,
    ) -> [Self; 3] {
        [
            Self::chart_create_session(session),
            Self::resolve_symbol(session, key, trading),
            Self::create_series(session, key, bars),
        ]
    }

    /// Serialize to the JSON payload carried inside a frame.
    ///
    /// # Errors
    ///
    /// Returns an error if JSON serialization fails.
    pub fn to_payload(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string(self)
    }
}
