//! Engine Configuration Settings
//!
//! Configuration types for the quote stream engine, loaded from environment
//! variables. Every setting has a default; only malformed values are errors.

use std::time::Duration;

use crate::domain::fanout::DeliveryPolicy;
use crate::domain::streaming::{Interval, SymbolKey};
use crate::infrastructure::quote::codec::DEFAULT_MAX_FRAME_BYTES;
use crate::infrastructure::quote::messages::TradingSession;

/// Default quoting service endpoint.
pub const DEFAULT_ENDPOINT: &str = "wss://data.tradingview.com/socket.io/websocket";

/// Default `Origin` header for the WebSocket upgrade.
pub const DEFAULT_ORIGIN: &str = "https://data.tradingview.com";

// =============================================================================
// Credential
// =============================================================================

/// Credential presented during the connection handshake.
///
/// Token acquisition happens elsewhere; the engine treats the token as opaque.
#[derive(Clone, Default, PartialEq, Eq)]
pub enum Credential {
    /// Public-tier access.
    #[default]
    Anonymous,
    /// Bearer token issued by the authentication service.
    Bearer(String),
}

impl Credential {
    /// Build from an optional token; `None` or an empty token is anonymous.
    #[must_use]
    pub fn from_token(token: Option<String>) -> Self {
        match token {
            Some(token) if !token.trim().is_empty() => Self::Bearer(token),
            _ => Self::Anonymous,
        }
    }

    /// The bearer token, if any.
    #[must_use]
    pub fn token(&self) -> Option<&str> {
        match self {
            Self::Anonymous => None,
            Self::Bearer(token) => Some(token),
        }
    }

    /// Whether this is anonymous access.
    #[must_use]
    pub const fn is_anonymous(&self) -> bool {
        matches!(self, Self::Anonymous)
    }
}

impl std::fmt::Debug for Credential {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Anonymous => f.write_str("Anonymous"),
            Self::Bearer(_) => f.debug_tuple("Bearer").field(&"[REDACTED]").finish(),
        }
    }
}

// =============================================================================
// Settings Groups
// =============================================================================

/// WebSocket connection settings.
#[derive(Debug, Clone, PartialEq)]
pub struct WebSocketSettings {
    /// Quoting service endpoint.
    pub endpoint: String,
    /// `Origin` header sent on upgrade.
    pub origin: String,
    /// Timeout for the TCP/TLS/WebSocket upgrade.
    pub connect_timeout: Duration,
    /// Timeout for the server hello after upgrade.
    pub handshake_timeout: Duration,
    /// Silence after which the link is considered dead.
    pub idle_timeout: Duration,
    /// Initial reconnection delay.
    pub reconnect_delay_initial: Duration,
    /// Maximum reconnection delay.
    pub reconnect_delay_max: Duration,
    /// Reconnection delay multiplier for exponential backoff.
    pub reconnect_delay_multiplier: f64,
    /// Upper bound of additive jitter as a fraction of the delay.
    pub reconnect_jitter_ratio: f64,
    /// Maximum consecutive reconnection attempts (0 = unlimited).
    pub max_reconnect_attempts: u32,
    /// Largest accepted frame payload.
    pub max_frame_bytes: usize,
}

impl Default for WebSocketSettings {
    fn default() -> Self {
        Self {
            endpoint: DEFAULT_ENDPOINT.to_string(),
            origin: DEFAULT_ORIGIN.to_string(),
            connect_timeout: Duration::from_secs(10),
            handshake_timeout: Duration::from_secs(5),
            idle_timeout: Duration::from_secs(30),
            reconnect_delay_initial: Duration::from_millis(1000),
            reconnect_delay_max: Duration::from_secs(30),
            reconnect_delay_multiplier: 2.0,
            reconnect_jitter_ratio: 0.5,
            max_reconnect_attempts: 5,
            max_frame_bytes: DEFAULT_MAX_FRAME_BYTES,
        }
    }
}

/// Chart session settings applied to every subscription.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionSettings {
    /// Bars requested when a series is created.
    pub series_bars: u32,
    /// Regular or extended trading hours.
    pub trading_session: TradingSession,
    /// Delivery policy for symbol sets created without an explicit one.
    pub delivery_policy: DeliveryPolicy,
    /// Capacity of the consumer fault broadcast channel.
    pub fault_channel_capacity: usize,
}

impl Default for SessionSettings {
    fn default() -> Self {
        Self {
            series_bars: 300,
            trading_session: TradingSession::Regular,
            delivery_policy: DeliveryPolicy::EveryUpdate,
            fault_channel_capacity: 1_024,
        }
    }
}

/// Server port settings.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ServerSettings {
    /// Health check HTTP port.
    pub health_port: u16,
}

impl Default for ServerSettings {
    fn default() -> Self {
        Self { health_port: 8082 }
    }
}

/// Complete engine configuration.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct EngineConfig {
    /// Credential presented on connect.
    pub credential: Credential,
    /// WebSocket connection settings.
    pub websocket: WebSocketSettings,
    /// Chart session settings.
    pub session: SessionSettings,
    /// Server port settings.
    pub server: ServerSettings,
}

impl EngineConfig {
    /// Create configuration from environment variables.
    ///
    /// # Errors
    ///
    /// Returns an error if a variable holds a value that cannot be used.
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Create configuration from an arbitrary key lookup.
    ///
    /// # Errors
    ///
    /// Returns an error if a variable holds a value that cannot be used.
    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let ws_defaults = WebSocketSettings::default();
        let session_defaults = SessionSettings::default();

        let websocket = WebSocketSettings {
            endpoint: lookup("QUOTE_STREAM_ENDPOINT").unwrap_or(ws_defaults.endpoint),
            origin: lookup("QUOTE_STREAM_ORIGIN").unwrap_or(ws_defaults.origin),
            connect_timeout: parse_duration_secs(
                &lookup,
                "QUOTE_STREAM_CONNECT_TIMEOUT_SECS",
                ws_defaults.connect_timeout,
            ),
            handshake_timeout: parse_duration_secs(
                &lookup,
                "QUOTE_STREAM_HANDSHAKE_TIMEOUT_SECS",
                ws_defaults.handshake_timeout,
            ),
            idle_timeout: parse_duration_secs(
                &lookup,
                "QUOTE_STREAM_IDLE_TIMEOUT_SECS",
                ws_defaults.idle_timeout,
            ),
            reconnect_delay_initial: parse_duration_millis(
                &lookup,
                "QUOTE_STREAM_RECONNECT_DELAY_INITIAL_MS",
                ws_defaults.reconnect_delay_initial,
            ),
            reconnect_delay_max: parse_duration_secs(
                &lookup,
                "QUOTE_STREAM_RECONNECT_DELAY_MAX_SECS",
                ws_defaults.reconnect_delay_max,
            ),
            reconnect_delay_multiplier: parse_or(
                &lookup,
                "QUOTE_STREAM_RECONNECT_DELAY_MULTIPLIER",
                ws_defaults.reconnect_delay_multiplier,
            ),
            reconnect_jitter_ratio: parse_or(
                &lookup,
                "QUOTE_STREAM_RECONNECT_JITTER_RATIO",
                ws_defaults.reconnect_jitter_ratio,
            ),
            max_reconnect_attempts: parse_or(
                &lookup,
                "QUOTE_STREAM_MAX_RECONNECT_ATTEMPTS",
                ws_defaults.max_reconnect_attempts,
            ),
            max_frame_bytes: parse_or(
                &lookup,
                "QUOTE_STREAM_MAX_FRAME_BYTES",
                ws_defaults.max_frame_bytes,
            ),
        };

        if websocket.endpoint.trim().is_empty() {
            return Err(ConfigError::EmptyValue("QUOTE_STREAM_ENDPOINT".to_string()));
        }

        let trading_session = match lookup("QUOTE_STREAM_EXTENDED_SESSION").as_deref() {
            Some("1" | "true" | "TRUE" | "yes") => TradingSession::Extended,
            _ => session_defaults.trading_session,
        };

        let delivery_policy = match lookup("QUOTE_STREAM_DELIVERY_POLICY") {
            None => session_defaults.delivery_policy,
            Some(value) => match value.to_lowercase().as_str() {
                "every_update" => DeliveryPolicy::EveryUpdate,
                "closed_bars_only" => DeliveryPolicy::ClosedBarsOnly,
                _ => {
                    return Err(ConfigError::InvalidValue {
                        key: "QUOTE_STREAM_DELIVERY_POLICY".to_string(),
                        value,
                    });
                }
            },
        };

        let session = SessionSettings {
            series_bars: parse_or(&lookup, "QUOTE_STREAM_SERIES_BARS", session_defaults.series_bars),
            trading_session,
            delivery_policy,
            fault_channel_capacity: parse_or(
                &lookup,
                "QUOTE_STREAM_FAULT_CHANNEL_CAPACITY",
                session_defaults.fault_channel_capacity,
            )
            .max(1),
        };

        let server = ServerSettings {
            health_port: parse_or(
                &lookup,
                "QUOTE_STREAM_HEALTH_PORT",
                ServerSettings::default().health_port,
            ),
        };

        Ok(Self {
            credential: Credential::from_token(lookup("QUOTE_STREAM_AUTH_TOKEN")),
            websocket,
            session,
            server,
        })
    }
}

/// Parse a comma-separated `EXCHANGE:SYMBOL:INTERVAL` list.
///
/// # Errors
///
/// Returns an error for an entry with missing parts or an unknown interval.
pub fn parse_symbol_list(list: &str) -> Result<Vec<SymbolKey>, ConfigError> {
    list.split(',')
        .map(str::trim)
        .filter(|entry| !entry.is_empty())
        .map(|entry| {
            let invalid = || ConfigError::InvalidValue {
                key: "QUOTE_STREAM_SYMBOLS".to_string(),
                value: entry.to_string(),
            };
            let mut parts = entry.rsplitn(2, ':');
            let interval = parts.next().ok_or_else(invalid)?;
            let ticker = parts.next().ok_or_else(invalid)?;
            let (exchange, symbol) = ticker.split_once(':').ok_or_else(invalid)?;
            if exchange.is_empty() || symbol.is_empty() {
                return Err(invalid());
            }
            let interval: Interval = interval.parse().map_err(|_| invalid())?;
            Ok(SymbolKey::new(symbol, exchange, interval))
        })
        .collect()
}

/// Configuration error.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    /// Environment variable has empty value.
    #[error("environment variable {0} cannot be empty")]
    EmptyValue(String),
    /// Environment variable holds an unusable value.
    #[error("environment variable {key} has invalid value: {value}")]
    InvalidValue {
        /// Variable name.
        key: String,
        /// Offending value.
        value: String,
    },
}

fn parse_or<F, T>(lookup: &F, key: &str, default: T) -> T
where
    F: Fn(&str) -> Option<String>,
    T: std::str::FromStr,
{
    lookup(key)
        .and_then(|v| v.trim().parse().ok())
        .unwrap_or(default)
}

fn parse_duration_secs<F>(lookup: &F, key: &str, default: Duration) -> Duration
where
    F: Fn(&str) -> Option<String>,
{
    lookup(key)
        .and_then(|v| v.trim().parse::<u64>().ok())
        .map_or(default, Duration::from_secs)
}

fn parse_duration_millis<F>(lookup: &F, key: &str, default: Duration) -> Duration
where
    F: Fn(&str) -> Option<String>,
{
    lookup(key)
        .and_then(|v| v.trim().parse::<u64>().ok())
        .map_or(default, Duration::from_millis)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;
    use std::io::Write;

    fn lookup_from(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| ((*k).to_string(), (*v).to_string()))
            .collect();
        move |key| map.get(key).cloned()
    }

    #[test]
    fn defaults_when_nothing_set() {
        let config = EngineConfig::from_lookup(|_| None).unwrap();
        assert_eq!(config, EngineConfig::default());
        assert!(config.credential.is_anonymous());
        assert_eq!(config.websocket.endpoint, DEFAULT_ENDPOINT);
        assert_eq!(config.websocket.max_reconnect_attempts, 5);
        assert_eq!(config.session.series_bars, 300);
        assert_eq!(config.server.health_port, 8082);
    }

    #[test]
    fn reads_overrides() {
        let config = EngineConfig::from_lookup(lookup_from(&[
            ("QUOTE_STREAM_AUTH_TOKEN", "tok"),
            ("QUOTE_STREAM_IDLE_TIMEOUT_SECS", "12"),
            ("QUOTE_STREAM_RECONNECT_DELAY_INITIAL_MS", "250"),
            ("QUOTE_STREAM_MAX_RECONNECT_ATTEMPTS", "0"),
            ("QUOTE_STREAM_EXTENDED_SESSION", "true"),
            ("QUOTE_STREAM_DELIVERY_POLICY", "closed_bars_only"),
            ("QUOTE_STREAM_HEALTH_PORT", "9000"),
        ]))
        .unwrap();

        assert_eq!(config.credential.token(), Some("tok"));
        assert_eq!(config.websocket.idle_timeout, Duration::from_secs(12));
        assert_eq!(config.websocket.reconnect_delay_initial, Duration::from_millis(250));
        assert_eq!(config.websocket.max_reconnect_attempts, 0);
        assert_eq!(config.session.trading_session, TradingSession::Extended);
        assert_eq!(config.session.delivery_policy, DeliveryPolicy::ClosedBarsOnly);
        assert_eq!(config.server.health_port, 9000);
    }

    #[test]
    fn unparseable_numbers_fall_back_to_defaults() {
        let config = EngineConfig::from_lookup(lookup_from(&[
            ("QUOTE_STREAM_SERIES_BARS", "lots"),
            ("QUOTE_STREAM_RECONNECT_JITTER_RATIO", "x"),
        ]))
        .unwrap();
        assert_eq!(config.session.series_bars, 300);
        assert!((config.websocket.reconnect_jitter_ratio - 0.5).abs() < f64::EPSILON);
    }

    #[test]
    fn rejects_empty_endpoint_and_unknown_policy() {
        assert!(matches!(
            EngineConfig::from_lookup(lookup_from(&[("QUOTE_STREAM_ENDPOINT", " ")])),
            Err(ConfigError::EmptyValue(_))
        ));
        assert!(matches!(
            EngineConfig::from_lookup(lookup_from(&[("QUOTE_STREAM_DELIVERY_POLICY", "sometimes")])),
            Err(ConfigError::InvalidValue { .. })
        ));
    }

    #[test]
    fn empty_token_is_anonymous() {
        assert!(Credential::from_token(Some(String::new())).is_anonymous());
        assert!(Credential::from_token(None).is_anonymous());
    }

    #[test]
    fn credential_redacted_debug() {
        let debug = format!("{:?}", Credential::Bearer("secret456".to_string()));
        assert!(!debug.contains("secret456"));
        assert!(debug.contains("[REDACTED]"));
    }

    #[test]
    fn parses_symbol_list() {
        let keys = parse_symbol_list("BINANCE:BTCUSD:1m, NSE:NIFTY1!:1D ,").unwrap();
        assert_eq!(
            keys,
            vec![
                SymbolKey::new("BTCUSD", "BINANCE", Interval::Minute1),
                SymbolKey::new("NIFTY1!", "NSE", Interval::Daily),
            ]
        );
    }

    #[test]
    fn rejects_malformed_symbol_entries() {
        assert!(parse_symbol_list("BTCUSD:1m").is_err());
        assert!(parse_symbol_list("BINANCE:BTCUSD:7m").is_err());
        assert!(parse_symbol_list(":BTCUSD:1m").is_err());
    }

    #[test]
    fn loads_from_dotenv_file() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, "QUOTE_STREAM_SERIES_BARS=50").unwrap();
        writeln!(file, "QUOTE_STREAM_ORIGIN=https://example.test").unwrap();

        let values: HashMap<String, String> = dotenvy::from_path_iter(file.path())
            .unwrap()
            .map(Result::unwrap)
            .collect();
        let config = EngineConfig::from_lookup(|key| values.get(key).cloned()).unwrap();

        assert_eq!(config.session.series_bars, 50);
        assert_eq!(config.websocket.origin, "https://example.test");
    }
}
