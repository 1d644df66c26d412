use std::fmt::{Display, Formatter};

use serde_json::Value;

use crate::client::{retryable_status, BarSource, FetchRequest, RequestPlan, ResponseClass};
use crate::domain::{BarRecord, Frame, Symbol};
use crate::error::FetchError;
use crate::http::{HttpAuth, HttpResponse};
use crate::provider::ProviderId;
use crate::providers::{
    body_signals_rate_limit, optional_f64, optional_u64, payload_error, require_f64, require_u64,
};

const DEFAULT_BASE_URL: &str = "https://data.alpaca.markets/v2/stocks/bars";
const DEFAULT_PAGE_LIMIT: u32 = 10_000;

/// Alpaca market-data feed selector.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AlpacaFeed {
    Iex,
    Sip,
}

impl AlpacaFeed {
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Iex => "iex",
            Self::Sip => "sip",
        }
    }
}

impl Display for AlpacaFeed {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Alpaca `/v2/stocks/bars` source.
///
/// Batch-capable: the symbol list travels as one comma-joined query parameter.
/// Pagination continues via `next_page_token`.
pub struct AlpacaSource {
    base_url: String,
    key_id: String,
    secret_key: String,
    feed: AlpacaFeed,
    page_limit: u32,
}

impl AlpacaSource {
    pub fn new(key_id: impl Into<String>, secret_key: impl Into<String>, feed: AlpacaFeed) -> Self {
        Self {
            base_url: String::from(DEFAULT_BASE_URL),
            key_id: key_id.into(),
            secret_key: secret_key.into(),
            feed,
            page_limit: DEFAULT_PAGE_LIMIT,
        }
    }

    /// Credentials from `APCA_API_KEY_ID` / `APCA_API_SECRET_KEY`, with a
    /// `demo` fallback for offline use.
    pub fn from_env(feed: AlpacaFeed) -> Self {
        Self::new(
            std::env::var("APCA_API_KEY_ID").unwrap_or_else(|_| String::from("demo")),
            std::env::var("APCA_API_SECRET_KEY").unwrap_or_else(|_| String::from("demo")),
            feed,
        )
    }

    pub fn with_base_url(mut self, base_url: impl Into<String>) -> Self {
        self.base_url = base_url.into();
        self
    }

    pub fn with_page_limit(mut self, page_limit: u32) -> Self {
        self.page_limit = page_limit;
        self
    }

    fn timeframe(frame: Frame) -> &'static str {
        match frame {
            Frame::OneMinute => "1Min",
            Frame::FiveMinutes => "5Min",
            Frame::FifteenMinutes => "15Min",
            Frame::OneHour => "1Hour",
            Frame::OneDay => "1Day",
        }
    }
}

impl BarSource for AlpacaSource {
    fn id(&self) -> ProviderId {
        ProviderId::Alpaca
    }

    fn plan(&self, req: &FetchRequest, cursor: Option<&str>) -> Result<RequestPlan, FetchError> {
        let symbols = req
            .symbols
            .iter()
            .map(Symbol::as_str)
            .collect::<Vec<_>>()
            .join(",");

        let mut plan = RequestPlan::new(self.base_url.clone())
            .with_query("symbols", symbols)
            .with_query("timeframe", Self::timeframe(req.frame))
            .with_query("start", req.start.format_rfc3339())
            .with_query("end", req.end.format_rfc3339())
            .with_query("limit", self.page_limit.to_string())
            .with_query("feed", self.feed.as_str())
            .with_auth(&HttpAuth::Header {
                name: String::from("APCA-API-KEY-ID"),
                value: self.key_id.clone(),
            })
            .with_auth(&HttpAuth::Header {
                name: String::from("APCA-API-SECRET-KEY"),
                value: self.secret_key.clone(),
            });

        if let Some(token) = cursor {
            plan = plan.with_query("page_token", token);
        }

        Ok(plan)
    }

    fn classify(&self, response: &HttpResponse) -> ResponseClass {
        if response.is_success() {
            return ResponseClass::Ok;
        }
        if retryable_status(response.status) {
            return ResponseClass::retryable(response.retry_after());
        }
        // Alpaca reuses 403 for quota exhaustion and for bad credentials.
        if response.status == 403 && body_signals_rate_limit(&response.body) {
            return ResponseClass::retryable(None);
        }
        ResponseClass::Fatal
    }

    fn next_cursor(
        &self,
        _req: &FetchRequest,
        _cursor: Option<&str>,
        page: &Value,
    ) -> Option<String> {
        page.get("next_page_token")
            .and_then(Value::as_str)
            .filter(|token| !token.is_empty())
            .map(str::to_owned)
    }

    fn parse_page(&self, req: &FetchRequest, page: &Value) -> Result<Vec<BarRecord>, FetchError> {
        let Some(by_symbol) = page.get("bars") else {
            // Final pages may omit the map entirely.
            return Ok(Vec::new());
        };
        if by_symbol.is_null() {
            return Ok(Vec::new());
        }
        let by_symbol = by_symbol
            .as_object()
            .ok_or_else(|| payload_error(self.id(), "'bars' is not an object"))?;

        let mut rows = Vec::new();
        for (raw_symbol, bars) in by_symbol {
            let symbol = Symbol::parse(raw_symbol)?;
            let bars = bars
                .as_array()
                .ok_or_else(|| payload_error(self.id(), format!("bars for '{raw_symbol}' is not an array")))?;

            for bar in bars {
                let ts_raw = bar
                    .get("t")
                    .and_then(Value::as_str)
                    .ok_or_else(|| payload_error(self.id(), "missing timestamp field 't'"))?;
                let ts = crate::domain::UtcDateTime::parse(ts_raw)?;

                rows.push(BarRecord::new(
                    symbol.clone(),
                    ts,
                    require_f64(self.id(), bar, "o")?,
                    require_f64(self.id(), bar, "h")?,
                    require_f64(self.id(), bar, "l")?,
                    require_f64(self.id(), bar, "c")?,
                    require_u64(self.id(), bar, "v")?,
                    optional_u64(bar, "n"),
                    optional_f64(bar, "vw"),
                    self.id(),
                    req.frame,
                )?);
            }
        }
        Ok(rows)
    }
}
