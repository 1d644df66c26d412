use serde_json::Value;

use crate::client::{retryable_status, BarSource, FetchRequest, RequestPlan, ResponseClass};
use crate::domain::{BarRecord, Frame, UtcDateTime};
use crate::error::FetchError;
use crate::http::HttpResponse;
use crate::http::HttpAuth;
use crate::provider::ProviderId;
use crate::providers::{body_signals_rate_limit, payload_error};

const DEFAULT_BASE_URL: &str = "https://finnhub.io/api/v1/stock/candle";

/// The upstream API rejects candle ranges longer than this, so requests are
/// auto-chunked into successive windows driven through synthetic cursors.
const WINDOW_SECS: i64 = 30 * 86_400;

/// Finnhub `/stock/candle` source.
///
/// One symbol per request, unix-second timestamps, token via the
/// `X-Finnhub-Token` header. The candle payload is column-oriented and omits
/// the symbol, which is why parsing injects the requested one.
pub struct FinnhubSource {
    base_url: String,
    token: String,
}

impl FinnhubSource {
    pub fn new(token: impl Into<String>) -> Self {
        Self {
            base_url: String::from(DEFAULT_BASE_URL),
            token: token.into(),
        }
    }

    /// Token from `FINNHUB_TOKEN`, with a `demo` fallback for offline use.
    pub fn from_env() -> Self {
        Self::new(std::env::var("FINNHUB_TOKEN").unwrap_or_else(|_| String::from("demo")))
    }

    pub fn with_base_url(mut self, base_url: impl Into<String>) -> Self {
        self.base_url = base_url.into();
        self
    }

    fn resolution(frame: Frame) -> &'static str {
        match frame {
            Frame::OneMinute => "1",
            Frame::FiveMinutes => "5",
            Frame::FifteenMinutes => "15",
            Frame::OneHour => "60",
            Frame::OneDay => "D",
        }
    }

    /// Current fetch window `[from, to]` in unix seconds. The cursor, when
    /// present, is the window start produced by `next_cursor`.
    fn window(req: &FetchRequest, cursor: Option<&str>) -> (i64, i64) {
        let start = cursor
            .and_then(|c| c.parse::<i64>().ok())
            .unwrap_or_else(|| req.start.unix_seconds());
        let end = req.end.unix_seconds();
        (start, (start + WINDOW_SECS - 1).min(end))
    }
}

impl BarSource for FinnhubSource {
    fn id(&self) -> ProviderId {
        ProviderId::Finnhub
    }

    fn plan(&self, req: &FetchRequest, cursor: Option<&str>) -> Result<RequestPlan, FetchError> {
        if req.symbols.len() != 1 {
            return Err(FetchError::InvalidRequest {
                provider: self.id(),
                reason: format!(
                    "finnhub accepts exactly one symbol per request, got {}",
                    req.symbols.len()
                ),
            });
        }

        let (from, to) = Self::window(req, cursor);
        Ok(RequestPlan::new(self.base_url.clone())
            .with_query("symbol", req.primary_symbol().as_str())
            .with_query("resolution", Self::resolution(req.frame))
            .with_query("from", from.to_string())
            .with_query("to", to.to_string())
            .with_auth(&HttpAuth::Header {
                name: String::from("X-Finnhub-Token"),
                value: self.token.clone(),
            }))
    }

    fn classify(&self, response: &HttpResponse) -> ResponseClass {
        if response.status == 429 {
            // An explicit Retry-After is honored verbatim instead of backoff.
            return ResponseClass::retryable(response.retry_after());
        }
        if retryable_status(response.status) {
            return ResponseClass::retryable(None);
        }
        if response.status == 403 {
            return if body_signals_rate_limit(&response.body) {
                ResponseClass::retryable(None)
            } else {
                ResponseClass::Fatal
            };
        }
        if !response.is_success() {
            return ResponseClass::Fatal;
        }

        match serde_json::from_str::<Value>(&response.body) {
            Ok(body) => match body.get("s").and_then(Value::as_str) {
                Some("no_data") => ResponseClass::NoData,
                Some("error") => ResponseClass::Fatal,
                _ => ResponseClass::Ok,
            },
            // Let the driver's malformed-body gate decide.
            Err(_) => ResponseClass::Ok,
        }
    }

    fn next_cursor(
        &self,
        req: &FetchRequest,
        cursor: Option<&str>,
        _page: &Value,
    ) -> Option<String> {
        let (_, to) = Self::window(req, cursor);
        if to < req.end.unix_seconds() {
            Some((to + 1).to_string())
        } else {
            None
        }
    }

    fn parse_page(&self, req: &FetchRequest, page: &Value) -> Result<Vec<BarRecord>, FetchError> {
        match page.get("s").and_then(Value::as_str) {
            Some("no_data") => return Ok(Vec::new()),
            Some("error") => {
                return Err(FetchError::Fatal {
                    provider: self.id(),
                    status: 200,
                    body: page.to_string(),
                })
            }
            Some("ok") => {}
            _ => return Err(payload_error(self.id(), "missing candle status field 's'")),
        }

        let column = |name: &str| -> Result<&Vec<Value>, FetchError> {
            page.get(name)
                .and_then(Value::as_array)
                .ok_or_else(|| payload_error(self.id(), format!("missing candle column '{name}'")))
        };

        let timestamps = column("t")?;
        let opens = column("o")?;
        let highs = column("h")?;
        let lows = column("l")?;
        let closes = column("c")?;
        let volumes = column("v")?;

        let len = timestamps.len();
        if [opens, highs, lows, closes, volumes]
            .iter()
            .any(|col| col.len() != len)
        {
            return Err(payload_error(self.id(), "candle columns have uneven lengths"));
        }

        let symbol = req.primary_symbol();
        let mut rows = Vec::with_capacity(len);
        for index in 0..len {
            let seconds = timestamps[index]
                .as_i64()
                .ok_or_else(|| payload_error(self.id(), "candle timestamp is not an integer"))?;
            let ts = UtcDateTime::from_unix_seconds(seconds)?;

            let number = |col: &Vec<Value>, name: &str| -> Result<f64, FetchError> {
                col[index]
                    .as_f64()
                    .ok_or_else(|| payload_error(self.id(), format!("candle column '{name}' is not numeric")))
            };

            rows.push(BarRecord::new(
                symbol.clone(),
                ts,
                number(opens, "o")?,
                number(highs, "h")?,
                number(lows, "l")?,
                number(closes, "c")?,
                number(volumes, "v")?.max(0.0).round() as u64,
                None,
                None,
                self.id(),
                req.frame,
            )?);
        }
        Ok(rows)
    }
}
