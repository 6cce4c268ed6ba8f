//! Market Data Streaming Types
//!
//! Core domain types for live chart data: intervals, symbol keys, OHLCV bars
//! and the update record handed to consumers. These types are codec-agnostic
//! and represent the canonical internal representation of a streamed bar.

use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

// =============================================================================
// Interval
// =============================================================================

/// Chart interval of a streamed series.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Interval {
    /// One minute.
    Minute1,
    /// Three minutes.
    Minute3,
    /// Five minutes.
    Minute5,
    /// Fifteen minutes.
    Minute15,
    /// Thirty minutes.
    Minute30,
    /// Forty-five minutes.
    Minute45,
    /// One hour.
    Hour1,
    /// Two hours.
    Hour2,
    /// Three hours.
    Hour3,
    /// Four hours.
    Hour4,
    /// One day.
    Daily,
    /// One week.
    Weekly,
    /// One month.
    Monthly,
}

impl Interval {
    /// Get all supported intervals.
    #[must_use]
    pub const fn all() -> &'static [Self] {
        &[
            Self::Minute1,
            Self::Minute3,
            Self::Minute5,
            Self::Minute15,
            Self::Minute30,
            Self::Minute45,
            Self::Hour1,
            Self::Hour2,
            Self::Hour3,
            Self::Hour4,
            Self::Daily,
            Self::Weekly,
            Self::Monthly,
        ]
    }

    /// Resolution string sent to the quoting service in `create_series`.
    #[must_use]
    pub const fn as_wire(&self) -> &'static str {
        match self {
            Self::Minute1 => "1",
            Self::Minute3 => "3",
            Self::Minute5 => "5",
            Self::Minute15 => "15",
            Self::Minute30 => "30",
            Self::Minute45 => "45",
            Self::Hour1 => "1H",
            Self::Hour2 => "2H",
            Self::Hour3 => "3H",
            Self::Hour4 => "4H",
            Self::Daily => "1D",
            Self::Weekly => "1W",
            Self::Monthly => "1M",
        }
    }
}

impl fmt::Display for Interval {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_wire())
    }
}

/// Error returned when an interval string is not recognised.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("unknown interval: {0}")]
pub struct ParseIntervalError(pub String);

impl FromStr for Interval {
    type Err = ParseIntervalError;

    /// Parse an interval from its wire value or a common alias.
    ///
    /// Matching is case-sensitive where it matters: `1m` is one minute,
    /// `1M` is one month.
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let interval = match s.trim() {
            "1" | "1m" => Self::Minute1,
            "3" | "3m" => Self::Minute3,
            "5" | "5m" => Self::Minute5,
            "15" | "15m" => Self::Minute15,
            "30" | "30m" => Self::Minute30,
            "45" | "45m" => Self::Minute45,
            "1h" | "1H" | "60" => Self::Hour1,
            "2h" | "2H" | "120" => Self::Hour2,
            "3h" | "3H" | "180" => Self::Hour3,
            "4h" | "4H" | "240" => Self::Hour4,
            "1d" | "1D" | "d" | "D" => Self::Daily,
            "1w" | "1W" | "w" | "W" => Self::Weekly,
            "1M" | "M" => Self::Monthly,
            other => return Err(ParseIntervalError(other.to_string())),
        };
        Ok(interval)
    }
}

// =============================================================================
// Symbol Key
// =============================================================================

/// Identity of one live series: symbol, exchange and interval.
///
/// Two subscriptions with equal keys share a single server-side session.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct SymbolKey {
    /// Trading symbol (e.g. `BTCUSD`, `AAPL`, `NIFTY1!`).
    pub symbol: String,
    /// Exchange name (e.g. `BINANCE`, `NASDAQ`).
    pub exchange: String,
    /// Chart interval.
    pub interval: Interval,
}

impl SymbolKey {
    /// Create a new key.
    #[must_use]
    pub fn new(symbol: impl Into<String>, exchange: impl Into<String>, interval: Interval) -> Self {
        Self {
            symbol: symbol.into(),
            exchange: exchange.into(),
            interval,
        }
    }

    /// Fully qualified ticker as the quoting service expects it.
    ///
    /// A symbol that already carries an exchange prefix is used verbatim.
    #[must_use]
    pub fn ticker(&self) -> String {
        if self.symbol.contains(':') {
            self.symbol.clone()
        } else {
            format!("{}:{}", self.exchange, self.symbol)
        }
    }
}

impl fmt::Display for SymbolKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}@{}", self.ticker(), self.interval)
    }
}

// =============================================================================
// Bar and Update
// =============================================================================

/// One OHLCV record.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Bar {
    /// Bar open time.
    pub time: DateTime<Utc>,
    /// Open price.
    pub open: Decimal,
    /// High price.
    pub high: Decimal,
    /// Low price.
    pub low: Decimal,
    /// Close (or last) price.
    pub close: Decimal,
    /// Traded volume; zero when the series carries no volume.
    pub volume: Decimal,
}

/// A parsed update delivered to consumers: one bar tagged with its origin.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Update {
    /// The series this bar belongs to.
    pub key: SymbolKey,
    /// The bar itself.
    pub bar: Bar,
}

impl Update {
    /// Trading symbol of the originating series.
    #[must_use]
    pub fn symbol(&self) -> &str {
        &self.key.symbol
    }

    /// Exchange of the originating series.
    #[must_use]
    pub fn exchange(&self) -> &str {
        &self.key.exchange
    }
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use test_case::test_case;

    #[test_case("1", Interval::Minute1; "bare minute")]
    #[test_case("1m", Interval::Minute1; "minute alias")]
    #[test_case("45m", Interval::Minute45; "forty five minutes")]
    #[test_case("1h", Interval::Hour1; "lower hour")]
    #[test_case("4H", Interval::Hour4; "upper hour")]
    #[test_case("D", Interval::Daily; "daily letter")]
    #[test_case("1w", Interval::Weekly; "weekly")]
    #[test_case("1M", Interval::Monthly; "monthly is upper case")]
    fn interval_parsing(input: &str, expected: Interval) {
        assert_eq!(input.parse::<Interval>().unwrap(), expected);
    }

    #[test]
    fn interval_rejects_unknown() {
        let err = "7m".parse::<Interval>().unwrap_err();
        assert_eq!(err, ParseIntervalError("7m".to_string()));
    }

    #[test]
    fn wire_values_parse_back() {
        for interval in Interval::all() {
            assert_eq!(interval.as_wire().parse::<Interval>().unwrap(), *interval);
        }
    }

    #[test]
    fn ticker_prefixes_exchange() {
        let key = SymbolKey::new("BTCUSD", "BINANCE", Interval::Minute1);
        assert_eq!(key.ticker(), "BINANCE:BTCUSD");
        assert_eq!(key.to_string(), "BINANCE:BTCUSD@1");
    }

    #[test]
    fn ticker_keeps_qualified_symbol() {
        let key = SymbolKey::new("MCX:CRUDEOIL1!", "MCX", Interval::Daily);
        assert_eq!(key.ticker(), "MCX:CRUDEOIL1!");
    }
}
