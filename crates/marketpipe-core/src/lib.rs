//! Core contracts for marketpipe.
//!
//! This crate contains:
//! - Canonical domain models and validation
//! - Token-bucket rate limiting (single and dual-window)
//! - Retry/backoff policy
//! - The provider-agnostic fetch driver and the per-provider sources

pub mod client;
pub mod domain;
pub mod error;
pub mod http;
pub mod provider;
pub mod providers;
pub mod rate_limit;
pub mod registry;
pub mod retry;

pub use client::{
    retryable_status, BarSource, CheckpointStore, FetchClient, FetchRequest, RequestPlan,
    ResponseClass, DEFAULT_MAX_PAGES, DEFAULT_TIMEOUT_MS,
};
pub use domain::{
    BarRecord, BarStatus, Frame, Session, Symbol, UtcDateTime, MAX_SYMBOL_LEN, SCHEMA_VERSION,
};
pub use error::{FetchError, RateLimitError, ValidationError};
pub use http::{
    HttpAuth, HttpError, HttpMethod, HttpRequest, HttpResponse, HttpTransport, ReqwestTransport,
};
pub use provider::ProviderId;
pub use providers::{AlpacaFeed, AlpacaSource, FinnhubSource, PolygonSource};
pub use rate_limit::{DualRateLimiter, RateLimiter, Throttle, WaitCounts};
pub use registry::ProviderRegistry;
pub use retry::{BackoffPolicy, RetryPolicy};
