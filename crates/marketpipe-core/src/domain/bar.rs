use std::fmt::{Display, Formatter};
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use time::Date;

use crate::domain::{Symbol, UtcDateTime};
use crate::error::ValidationError;
use crate::provider::ProviderId;

/// Version stamped onto every canonical bar row.
pub const SCHEMA_VERSION: u32 = 1;

/// Bar timeframe. Ingestion always fetches `1m`; coarser frames are produced
/// downstream by aggregation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Frame {
    #[serde(rename = "1m")]
    OneMinute,
    #[serde(rename = "5m")]
    FiveMinutes,
    #[serde(rename = "15m")]
    FifteenMinutes,
    #[serde(rename = "1h")]
    OneHour,
    #[serde(rename = "1d")]
    OneDay,
}

impl Frame {
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::OneMinute => "1m",
            Self::FiveMinutes => "5m",
            Self::FifteenMinutes => "15m",
            Self::OneHour => "1h",
            Self::OneDay => "1d",
        }
    }
}

impl Display for Frame {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Frame {
    type Err = ValidationError;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value.trim() {
            "1m" => Ok(Self::OneMinute),
            "5m" => Ok(Self::FiveMinutes),
            "15m" => Ok(Self::FifteenMinutes),
            "1h" => Ok(Self::OneHour),
            "1d" => Ok(Self::OneDay),
            other => Err(ValidationError::InvalidFrame {
                value: other.to_owned(),
            }),
        }
    }
}

/// Trading session the bar belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Session {
    Regular,
    Extended,
}

/// Upstream data quality marker.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BarStatus {
    Ok,
    Delayed,
}

/// Canonical OHLCV row emitted by every provider source.
///
/// One record per `(symbol, timestamp)` pair per provider; timestamps are
/// provider-native and not reconciled across providers.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BarRecord {
    pub symbol: Symbol,
    /// Epoch nanoseconds.
    pub timestamp_ns: i64,
    #[serde(with = "iso_date")]
    pub date: Date,
    pub open: f64,
    pub high: f64,
    pub low: f64,
    pub close: f64,
    pub volume: u64,
    pub trade_count: Option<u64>,
    pub vwap: Option<f64>,
    pub session: Session,
    pub currency: String,
    pub status: BarStatus,
    pub source: ProviderId,
    pub frame: Frame,
    pub schema_version: u32,
}

impl BarRecord {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        symbol: Symbol,
        ts: UtcDateTime,
        open: f64,
        high: f64,
        low: f64,
        close: f64,
        volume: u64,
        trade_count: Option<u64>,
        vwap: Option<f64>,
        source: ProviderId,
        frame: Frame,
    ) -> Result<Self, ValidationError> {
        validate_non_negative("open", open)?;
        validate_non_negative("high", high)?;
        validate_non_negative("low", low)?;
        validate_non_negative("close", close)?;
        if let Some(vwap) = vwap {
            validate_non_negative("vwap", vwap)?;
        }

        if high < low {
            return Err(ValidationError::InvalidBarRange);
        }
        if open < low || open > high || close < low || close > high {
            return Err(ValidationError::InvalidBarBounds);
        }

        Ok(Self {
            symbol,
            timestamp_ns: ts.unix_nanos()?,
            date: ts.date(),
            open,
            high,
            low,
            close,
            volume,
            trade_count,
            vwap,
            session: Session::Regular,
            currency: String::from("USD"),
            status: BarStatus::Ok,
            source,
            frame,
            schema_version: SCHEMA_VERSION,
        })
    }
}

fn validate_non_negative(field: &'static str, value: f64) -> Result<(), ValidationError> {
    if !value.is_finite() || value < 0.0 {
        return Err(ValidationError::NegativeValue { field });
    }
    Ok(())
}

mod iso_date {
    use serde::de::Error as DeError;
    use serde::{Deserialize, Deserializer, Serializer};
    use time::macros::format_description;
    use time::Date;

    const FORMAT: &[time::format_description::FormatItem<'_>] =
        format_description!("[year]-[month]-[day]");

    pub fn serialize<S>(date: &Date, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        let formatted = date
            .format(FORMAT)
            .map_err(|_| serde::ser::Error::custom("unformattable date"))?;
        serializer.serialize_str(&formatted)
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Date, D::Error>
    where
        D: Deserializer<'de>,
    {
        let value = String::deserialize(deserializer)?;
        Date::parse(&value, FORMAT).map_err(D::Error::custom)
    }
}
