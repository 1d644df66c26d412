use thiserror::Error;

use crate::provider::ProviderId;

/// Validation errors for canonical domain values.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ValidationError {
    #[error("symbol cannot be empty")]
    EmptySymbol,
    #[error("symbol length {len} exceeds max {max}")]
    SymbolTooLong { len: usize, max: usize },
    #[error("symbol must start with an ASCII letter: '{ch}'")]
    SymbolInvalidStart { ch: char },
    #[error("symbol contains invalid character '{ch}' at index {index}")]
    SymbolInvalidChar { ch: char, index: usize },

    #[error("invalid frame '{value}', expected one of 1m, 5m, 15m, 1h, 1d")]
    InvalidFrame { value: String },
    #[error("invalid provider '{value}', expected one of alpaca, finnhub, polygon")]
    InvalidProvider { value: String },

    #[error("timestamp must be RFC3339 UTC (suffix Z): '{value}'")]
    TimestampNotUtc { value: String },
    #[error("timestamp {nanos}ns is outside the representable range")]
    TimestampOutOfRange { nanos: i128 },

    #[error("currency must be a 3-letter uppercase ISO code: '{value}'")]
    InvalidCurrency { value: String },

    #[error("fetch request must include at least one symbol")]
    EmptySymbolList,
    #[error("fetch window start must precede end")]
    InvalidWindow,

    #[error("field '{field}' must be non-negative")]
    NegativeValue { field: &'static str },
    #[error("bar high must be >= low")]
    InvalidBarRange,
    #[error("bar open/close must be within high/low range")]
    InvalidBarBounds,
}

/// Programmer errors raised by the token-bucket limiters.
#[derive(Debug, Error, Clone, Copy, PartialEq, Eq)]
pub enum RateLimitError {
    /// The request can never be satisfied: more tokens than the bucket holds.
    #[error("requested {requested} tokens exceeds bucket capacity {capacity}")]
    ExceedsCapacity { requested: u32, capacity: u32 },
}

/// Terminal errors surfaced by the fetch client layer.
///
/// Every terminal failure carries the last raw response text (or transport
/// message) so callers can diagnose without re-running the fetch.
#[derive(Debug, Error)]
pub enum FetchError {
    #[error(transparent)]
    Validation(#[from] ValidationError),

    #[error(transparent)]
    RateLimit(#[from] RateLimitError),

    #[error("{provider}: invalid request: {reason}")]
    InvalidRequest {
        provider: ProviderId,
        reason: String,
    },

    #[error("{provider}: transport error: {message}")]
    Transport {
        provider: ProviderId,
        message: String,
    },

    #[error("{provider}: retry budget exhausted after {attempts} attempts (last status {status:?}): {body}")]
    RetriesExhausted {
        provider: ProviderId,
        attempts: u32,
        status: Option<u16>,
        body: String,
    },

    #[error("{provider}: fatal response (status {status}): {body}")]
    Fatal {
        provider: ProviderId,
        status: u16,
        body: String,
    },

    #[error("{provider}: malformed response body (status {status}): {body}")]
    MalformedResponse {
        provider: ProviderId,
        status: u16,
        body: String,
    },

    #[error("{provider}: unexpected payload shape: {detail}")]
    UnexpectedPayload {
        provider: ProviderId,
        detail: String,
    },

    #[error("checkpoint store error: {message}")]
    Checkpoint { message: String },
}
