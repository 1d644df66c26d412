//! Concrete provider sources.
//!
//! Each source customizes exactly the [`BarSource`](crate::client::BarSource)
//! hooks; everything else (throttling, retry, pagination) lives in the driver.

pub mod alpaca;
pub mod finnhub;
pub mod polygon;

pub use alpaca::{AlpacaFeed, AlpacaSource};
pub use finnhub::FinnhubSource;
pub use polygon::PolygonSource;

use serde_json::Value;

use crate::error::FetchError;
use crate::provider::ProviderId;

pub(crate) fn payload_error(provider: ProviderId, detail: impl Into<String>) -> FetchError {
    FetchError::UnexpectedPayload {
        provider,
        detail: detail.into(),
    }
}

pub(crate) fn require_f64(
    provider: ProviderId,
    value: &Value,
    field: &str,
) -> Result<f64, FetchError> {
    value
        .get(field)
        .and_then(Value::as_f64)
        .ok_or_else(|| payload_error(provider, format!("missing numeric field '{field}'")))
}

pub(crate) fn require_u64(
    provider: ProviderId,
    value: &Value,
    field: &str,
) -> Result<u64, FetchError> {
    let raw = value
        .get(field)
        .ok_or_else(|| payload_error(provider, format!("missing field '{field}'")))?;
    raw.as_u64()
        .or_else(|| raw.as_f64().map(|v| v.max(0.0).round() as u64))
        .ok_or_else(|| payload_error(provider, format!("field '{field}' is not a count")))
}

pub(crate) fn optional_u64(value: &Value, field: &str) -> Option<u64> {
    let raw = value.get(field)?;
    raw.as_u64()
        .or_else(|| raw.as_f64().map(|v| v.max(0.0).round() as u64))
}

pub(crate) fn optional_f64(value: &Value, field: &str) -> Option<f64> {
    value.get(field).and_then(Value::as_f64)
}

/// Providers reuse 403 for both auth failures and rate limiting; only the
/// body text disambiguates.
pub(crate) fn body_signals_rate_limit(body: &str) -> bool {
    let lowered = body.to_ascii_lowercase();
    lowered.contains("rate limit")
        || lowered.contains("rate-limit")
        || lowered.contains("too many requests")
}
