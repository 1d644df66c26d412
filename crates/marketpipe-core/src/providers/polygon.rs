use serde_json::Value;

use crate::client::{retryable_status, BarSource, FetchRequest, RequestPlan, ResponseClass};
use crate::domain::{BarRecord, Frame, UtcDateTime};
use crate::error::FetchError;
use crate::http::{HttpAuth, HttpResponse};
use crate::provider::ProviderId;
use crate::providers::{
    body_signals_rate_limit, optional_f64, optional_u64, payload_error, require_f64, require_u64,
};

const DEFAULT_BASE_URL: &str = "https://api.polygon.io";
const DEFAULT_PAGE_LIMIT: u32 = 50_000;

/// Bound on runaway pagination when the API keeps handing back cursors.
const MAX_PAGES: usize = 100;

/// Polygon aggregates source (`/v2/aggs/ticker/{symbol}/range/...`).
///
/// The symbol and window are embedded in the URL path; continuation cursors
/// arrive as a full `next_url` whose query string must be re-parsed to isolate
/// the cursor value.
pub struct PolygonSource {
    base_url: String,
    api_key: String,
    page_limit: u32,
}

impl PolygonSource {
    pub fn new(api_key: impl Into<String>) -> Self {
        Self {
            base_url: String::from(DEFAULT_BASE_URL),
            api_key: api_key.into(),
            page_limit: DEFAULT_PAGE_LIMIT,
        }
    }

    /// Key from `POLYGON_API_KEY`, with a `demo` fallback for offline use.
    pub fn from_env() -> Self {
        Self::new(std::env::var("POLYGON_API_KEY").unwrap_or_else(|_| String::from("demo")))
    }

    pub fn with_base_url(mut self, base_url: impl Into<String>) -> Self {
        self.base_url = base_url.into();
        self
    }

    fn range(frame: Frame) -> (u32, &'static str) {
        match frame {
            Frame::OneMinute => (1, "minute"),
            Frame::FiveMinutes => (5, "minute"),
            Frame::FifteenMinutes => (15, "minute"),
            Frame::OneHour => (1, "hour"),
            Frame::OneDay => (1, "day"),
        }
    }
}

/// Isolate the `cursor` parameter from a full continuation URL. Reusing the
/// whole URL would bypass request planning (and auth) entirely.
fn cursor_from_next_url(next_url: &str) -> Option<String> {
    let (_, query) = next_url.split_once('?')?;
    for pair in query.split('&') {
        let (name, value) = pair.split_once('=')?;
        if name == "cursor" {
            return urlencoding::decode(value).ok().map(|c| c.into_owned());
        }
    }
    None
}

impl BarSource for PolygonSource {
    fn id(&self) -> ProviderId {
        ProviderId::Polygon
    }

    fn plan(&self, req: &FetchRequest, cursor: Option<&str>) -> Result<RequestPlan, FetchError> {
        if req.symbols.len() != 1 {
            return Err(FetchError::InvalidRequest {
                provider: self.id(),
                reason: format!(
                    "polygon accepts exactly one symbol per request, got {}",
                    req.symbols.len()
                ),
            });
        }

        let (multiplier, timespan) = Self::range(req.frame);
        let from_ms = req.start.unix_seconds() * 1_000;
        let to_ms = req.end.unix_seconds() * 1_000;
        let url = format!(
            "{base}/v2/aggs/ticker/{symbol}/range/{multiplier}/{timespan}/{from_ms}/{to_ms}",
            base = self.base_url,
            symbol = req.primary_symbol(),
        );

        let mut plan = RequestPlan::new(url)
            .with_query("adjusted", "true")
            .with_query("sort", "asc")
            .with_query("limit", self.page_limit.to_string())
            .with_auth(&HttpAuth::QueryParam {
                name: String::from("apiKey"),
                value: self.api_key.clone(),
            });

        if let Some(cursor) = cursor {
            plan = plan.with_query("cursor", cursor);
        }

        Ok(plan)
    }

    fn classify(&self, response: &HttpResponse) -> ResponseClass {
        if response.status == 429 {
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

        // A 200 body can still carry a provider-flagged error sentinel; that
        // must never be retried.
        match serde_json::from_str::<Value>(&response.body) {
            Ok(body) if body.get("status").and_then(Value::as_str) == Some("ERROR") => {
                ResponseClass::Fatal
            }
            _ => ResponseClass::Ok,
        }
    }

    fn next_cursor(
        &self,
        _req: &FetchRequest,
        _cursor: Option<&str>,
        page: &Value,
    ) -> Option<String> {
        page.get("next_url")
            .and_then(Value::as_str)
            .and_then(cursor_from_next_url)
    }

    fn parse_page(&self, req: &FetchRequest, page: &Value) -> Result<Vec<BarRecord>, FetchError> {
        let Some(results) = page.get("results") else {
            // Pages outside market hours have no results array.
            return Ok(Vec::new());
        };
        if results.is_null() {
            return Ok(Vec::new());
        }
        let results = results
            .as_array()
            .ok_or_else(|| payload_error(self.id(), "'results' is not an array"))?;

        let symbol = req.primary_symbol();
        let mut rows = Vec::with_capacity(results.len());
        for aggregate in results {
            let millis = aggregate
                .get("t")
                .and_then(Value::as_i64)
                .ok_or_else(|| payload_error(self.id(), "missing epoch-millis field 't'"))?;
            let ts = UtcDateTime::from_unix_millis(millis)?;

            rows.push(BarRecord::new(
                symbol.clone(),
                ts,
                require_f64(self.id(), aggregate, "o")?,
                require_f64(self.id(), aggregate, "h")?,
                require_f64(self.id(), aggregate, "l")?,
                require_f64(self.id(), aggregate, "c")?,
                require_u64(self.id(), aggregate, "v")?,
                optional_u64(aggregate, "n"),
                optional_f64(aggregate, "vw"),
                self.id(),
                req.frame,
            )?);
        }
        Ok(rows)
    }

    fn max_pages(&self) -> usize {
        MAX_PAGES
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::Symbol;
    use serde_json::json;

    fn request() -> FetchRequest {
        FetchRequest::new(
            vec![Symbol::parse("AAPL").expect("valid")],
            UtcDateTime::parse("2024-01-02T00:00:00Z").expect("valid"),
            UtcDateTime::parse("2024-01-03T00:00:00Z").expect("valid"),
            Frame::OneMinute,
        )
        .expect("valid request")
    }

    #[test]
    fn plan_embeds_symbol_and_window_in_path() {
        let source = PolygonSource::new("pk-test");
        let plan = source.plan(&request(), None).expect("plan");

        assert_eq!(
            plan.url,
            "https://api.polygon.io/v2/aggs/ticker/AAPL/range/1/minute/1704153600000/1704240000000"
        );
        assert!(plan.query.iter().any(|(n, v)| n == "apiKey" && v == "pk-test"));
    }

    #[test]
    fn cursor_is_isolated_from_next_url() {
        let next_url =
            "https://api.polygon.io/v2/aggs/ticker/AAPL/range/1/minute/0/1?cursor=bGltaXQ9MTIw&extra=x";
        assert_eq!(
            cursor_from_next_url(next_url),
            Some(String::from("bGltaXQ9MTIw"))
        );
        assert_eq!(cursor_from_next_url("https://api.polygon.io/no-query"), None);
    }

    #[test]
    fn error_sentinel_in_200_is_fatal() {
        let source = PolygonSource::new("pk-test");
        let response =
            HttpResponse::ok_json(r#"{"status": "ERROR", "error": "unknown ticker"}"#);
        assert_eq!(source.classify(&response), ResponseClass::Fatal);

        let healthy = HttpResponse::ok_json(r#"{"status": "OK", "results": []}"#);
        assert_eq!(source.classify(&healthy), ResponseClass::Ok);
    }

    #[test]
    fn parses_aggregates_with_float_volumes() {
        let source = PolygonSource::new("pk-test");
        let page = json!({
            "status": "OK",
            "results": [
                {"t": 1_704_204_600_000_i64, "o": 100.0, "h": 101.0, "l": 99.0, "c": 100.5, "v": 1200.0, "n": 17, "vw": 100.1}
            ]
        });

        let rows = source.parse_page(&request(), &page).expect("parse");
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].volume, 1200);
        assert_eq!(rows[0].symbol.as_str(), "AAPL");
        assert_eq!(rows[0].trade_count, Some(17));
    }

    #[test]
    fn page_cap_is_bounded() {
        let source = PolygonSource::new("pk-test");
        assert_eq!(source.max_pages(), 100);
    }
}
