//! Contract tests driving each provider source through the fetch client with
//! a scripted transport, verifying pagination, retry policy, and parameter
//! construction without touching the network.

use std::collections::{BTreeMap, VecDeque};
use std::future::Future;
use std::pin::Pin;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use marketpipe_core::{
    AlpacaFeed, AlpacaSource, BackoffPolicy, CheckpointStore, FetchClient, FetchError,
    FetchRequest, FinnhubSource, Frame, HttpError, HttpRequest, HttpResponse, HttpTransport,
    PolygonSource, RateLimiter, RetryPolicy, Symbol, Throttle, UtcDateTime,
};
use serde_json::json;

struct ScriptedTransport {
    responses: Mutex<VecDeque<Result<HttpResponse, HttpError>>>,
    requests: Mutex<Vec<HttpRequest>>,
}

impl ScriptedTransport {
    fn new(responses: Vec<Result<HttpResponse, HttpError>>) -> Self {
        Self {
            responses: Mutex::new(responses.into()),
            requests: Mutex::new(Vec::new()),
        }
    }

    fn requests(&self) -> Vec<HttpRequest> {
        self.requests.lock().expect("requests lock").clone()
    }

    fn next(&self, request: HttpRequest) -> Result<HttpResponse, HttpError> {
        self.requests.lock().expect("requests lock").push(request);
        self.responses
            .lock()
            .expect("responses lock")
            .pop_front()
            .unwrap_or_else(|| Err(HttpError::non_retryable("transport script exhausted")))
    }
}

impl HttpTransport for ScriptedTransport {
    fn execute(&self, request: HttpRequest) -> Result<HttpResponse, HttpError> {
        self.next(request)
    }

    fn execute_async<'a>(
        &'a self,
        request: HttpRequest,
    ) -> Pin<Box<dyn Future<Output = Result<HttpResponse, HttpError>> + Send + 'a>> {
        Box::pin(async move { self.next(request) })
    }
}

#[derive(Default)]
struct MemoryCheckpoints {
    cursors: Mutex<BTreeMap<String, String>>,
}

impl MemoryCheckpoints {
    fn saved_cursors(&self) -> Vec<String> {
        self.cursors
            .lock()
            .expect("cursors lock")
            .values()
            .cloned()
            .collect()
    }
}

impl CheckpointStore for MemoryCheckpoints {
    fn save(&self, key: &str, cursor: &str) -> Result<(), FetchError> {
        self.cursors
            .lock()
            .expect("cursors lock")
            .insert(key.to_owned(), cursor.to_owned());
        Ok(())
    }

    fn load(&self, key: &str) -> Result<Option<String>, FetchError> {
        Ok(self.cursors.lock().expect("cursors lock").get(key).cloned())
    }

    fn clear(&self, key: &str) -> Result<(), FetchError> {
        self.cursors.lock().expect("cursors lock").remove(key);
        Ok(())
    }
}

fn fast_throttle() -> Arc<dyn Throttle> {
    Arc::new(RateLimiter::new(10_000, 1_000_000.0))
}

/// Millisecond backoff so retry tests finish instantly.
fn fast_retry() -> RetryPolicy {
    RetryPolicy {
        max_retries: 2,
        backoff: BackoffPolicy {
            factor: 1.5,
            jitter_ratio: 0.0,
            max_delay: Duration::from_millis(1),
        },
    }
}

fn request(symbols: &[&str]) -> FetchRequest {
    FetchRequest::new(
        symbols
            .iter()
            .map(|s| Symbol::parse(s).expect("valid symbol"))
            .collect(),
        UtcDateTime::parse("2024-01-02T09:30:00Z").expect("valid"),
        UtcDateTime::parse("2024-01-02T16:00:00Z").expect("valid"),
        Frame::OneMinute,
    )
    .expect("valid request")
}

fn alpaca_page(symbol: &str, next_token: &str) -> HttpResponse {
    HttpResponse::ok_json(
        json!({
            "bars": {
                symbol: [
                    {"t": "2024-01-02T09:30:00Z", "o": 100.0, "h": 101.0, "l": 99.5, "c": 100.5, "v": 1200}
                ]
            },
            "next_page_token": next_token,
        })
        .to_string(),
    )
}

fn alpaca_client(transport: Arc<ScriptedTransport>) -> FetchClient {
    FetchClient::new(
        Arc::new(AlpacaSource::new("key-id", "key-secret", AlpacaFeed::Iex)),
        transport,
        fast_throttle(),
    )
    .with_retry(fast_retry())
}

// =============================================================================
// Pagination
// =============================================================================

#[test]
fn alpaca_follows_page_tokens_until_exhausted() {
    let transport = Arc::new(ScriptedTransport::new(vec![
        Ok(alpaca_page("AAPL", "p2")),
        Ok(alpaca_page("AAPL", "p3")),
        Ok(alpaca_page("AAPL", "")),
    ]));
    let client = alpaca_client(Arc::clone(&transport));

    let rows = client.fetch_batch(&request(&["AAPL"])).expect("fetch");
    assert_eq!(rows.len(), 3);

    let requests = transport.requests();
    assert_eq!(requests.len(), 3);
    assert_eq!(requests[0].query_value("page_token"), None);
    assert_eq!(requests[1].query_value("page_token"), Some("p2"));
    assert_eq!(requests[2].query_value("page_token"), Some("p3"));
    assert_eq!(requests[0].query_value("symbols"), Some("AAPL"));
    assert_eq!(
        requests[0].headers.get("apca-api-key-id").map(String::as_str),
        Some("key-id")
    );
}

#[tokio::test]
async fn async_pagination_matches_the_blocking_path() {
    let transport = Arc::new(ScriptedTransport::new(vec![
        Ok(alpaca_page("AAPL", "p2")),
        Ok(alpaca_page("AAPL", "")),
    ]));
    let client = alpaca_client(Arc::clone(&transport));

    let rows = client
        .fetch_batch_async(&request(&["AAPL"]))
        .await
        .expect("fetch");
    assert_eq!(rows.len(), 2);
    assert_eq!(transport.requests().len(), 2);
}

#[test]
fn polygon_reuses_only_the_cursor_from_next_url() {
    let page_one = json!({
        "status": "OK",
        "results": [
            {"t": 1_704_204_600_000_i64, "o": 100.0, "h": 101.0, "l": 99.0, "c": 100.5, "v": 1200.0}
        ],
        "next_url": "https://api.polygon.io/v2/aggs/ticker/AAPL/range/1/minute/0/1?cursor=abc%3D%3D&order=asc",
    });
    let page_two = json!({"status": "OK", "results": []});
    let transport = Arc::new(ScriptedTransport::new(vec![
        Ok(HttpResponse::ok_json(page_one.to_string())),
        Ok(HttpResponse::ok_json(page_two.to_string())),
    ]));
    let client = FetchClient::new(
        Arc::new(PolygonSource::new("pk-test")),
        Arc::clone(&transport) as Arc<dyn HttpTransport>,
        fast_throttle(),
    )
    .with_retry(fast_retry());

    let rows = client.fetch_batch(&request(&["AAPL"])).expect("fetch");
    assert_eq!(rows.len(), 1);

    let requests = transport.requests();
    assert_eq!(requests.len(), 2);
    // The decoded cursor parameter, not the full continuation URL.
    assert_eq!(requests[1].query_value("cursor"), Some("abc=="));
    assert!(requests[1].url.contains("/v2/aggs/ticker/AAPL/range/"));
    assert_eq!(requests[1].query_value("apiKey"), Some("pk-test"));
}

#[test]
fn polygon_stops_at_its_page_cap_when_cursors_never_end() {
    let endless = json!({
        "status": "OK",
        "results": [],
        "next_url": "https://api.polygon.io/x?cursor=again",
    });
    let responses = (0..150)
        .map(|_| Ok(HttpResponse::ok_json(endless.to_string())))
        .collect();
    let transport = Arc::new(ScriptedTransport::new(responses));
    let client = FetchClient::new(
        Arc::new(PolygonSource::new("pk-test")),
        Arc::clone(&transport) as Arc<dyn HttpTransport>,
        fast_throttle(),
    );

    let pages = client.paginate(&request(&["AAPL"])).expect("paginate");
    assert_eq!(pages.len(), 100);
    assert_eq!(transport.requests().len(), 100);
}

#[test]
fn finnhub_chunks_long_windows_into_thirty_day_requests() {
    let no_data = HttpResponse::ok_json(r#"{"s": "no_data"}"#);
    let transport = Arc::new(ScriptedTransport::new(vec![
        Ok(no_data.clone()),
        Ok(no_data.clone()),
        Ok(no_data),
    ]));
    let client = FetchClient::new(
        Arc::new(FinnhubSource::new("tok")),
        Arc::clone(&transport) as Arc<dyn HttpTransport>,
        fast_throttle(),
    );

    let start = UtcDateTime::parse("2024-01-01T00:00:00Z").expect("valid");
    let end = UtcDateTime::from_unix_seconds(start.unix_seconds() + 70 * 86_400).expect("valid");
    let req = FetchRequest::new(
        vec![Symbol::parse("AAPL").expect("valid")],
        start,
        end,
        Frame::OneMinute,
    )
    .expect("valid request");

    let rows = client.fetch_batch(&req).expect("fetch");
    assert!(rows.is_empty());

    let requests = transport.requests();
    assert_eq!(requests.len(), 3);

    let window = 30 * 86_400;
    let first_from = start.unix_seconds();
    assert_eq!(
        requests[0].query_value("from"),
        Some(first_from.to_string().as_str())
    );
    assert_eq!(
        requests[0].query_value("to"),
        Some((first_from + window - 1).to_string().as_str())
    );
    assert_eq!(
        requests[1].query_value("from"),
        Some((first_from + window).to_string().as_str())
    );
    assert_eq!(
        requests[2].query_value("to"),
        Some(end.unix_seconds().to_string().as_str())
    );
}

// =============================================================================
// Retry policy
// =============================================================================

#[test]
fn quota_403_is_retried_but_auth_403_is_fatal() {
    let transport = Arc::new(ScriptedTransport::new(vec![
        Ok(HttpResponse::with_status(403, "request rate limit exceeded")),
        Ok(alpaca_page("AAPL", "")),
    ]));
    let client = alpaca_client(Arc::clone(&transport));
    client.request_page(&request(&["AAPL"]), None).expect("retried to success");
    assert_eq!(transport.requests().len(), 2);

    let transport = Arc::new(ScriptedTransport::new(vec![Ok(HttpResponse::with_status(
        403,
        "forbidden: invalid key",
    ))]));
    let client = alpaca_client(Arc::clone(&transport));
    let err = client
        .request_page(&request(&["AAPL"]), None)
        .expect_err("auth failure");
    assert!(matches!(err, FetchError::Fatal { status: 403, .. }));
    assert_eq!(transport.requests().len(), 1);
}

#[test]
fn exhausted_retries_surface_the_last_raw_body() {
    let transport = Arc::new(ScriptedTransport::new(vec![
        Ok(HttpResponse::with_status(500, "boom one")),
        Ok(HttpResponse::with_status(502, "boom two")),
        Ok(HttpResponse::with_status(503, "boom three")),
    ]));
    let client = alpaca_client(Arc::clone(&transport));

    let err = client
        .request_page(&request(&["AAPL"]), None)
        .expect_err("budget exhausted");
    match err {
        FetchError::RetriesExhausted {
            attempts,
            status,
            body,
            ..
        } => {
            assert_eq!(attempts, 3);
            assert_eq!(status, Some(503));
            assert_eq!(body, "boom three");
        }
        other => panic!("expected RetriesExhausted, got {other}"),
    }
}

#[test]
fn explicit_retry_after_is_fed_to_the_shared_limiter() {
    let transport = Arc::new(ScriptedTransport::new(vec![
        Ok(HttpResponse::with_status(429, "slow down").with_header("Retry-After", "0")),
        Ok(HttpResponse::ok_json(r#"{"s": "no_data"}"#)),
    ]));
    let limiter = Arc::new(RateLimiter::new(100, 1_000_000.0));
    let client = FetchClient::new(
        Arc::new(FinnhubSource::new("tok")),
        Arc::clone(&transport) as Arc<dyn HttpTransport>,
        Arc::clone(&limiter) as Arc<dyn Throttle>,
    )
    .with_retry(fast_retry());

    client
        .request_page(&request(&["AAPL"]), None)
        .expect("retried after cooldown");
    assert_eq!(limiter.wait_counts().cooldown_waits, 1);
    assert_eq!(transport.requests().len(), 2);
}

#[test]
fn malformed_200_body_fails_without_retrying() {
    let transport = Arc::new(ScriptedTransport::new(vec![Ok(HttpResponse::ok_json(
        "definitely not json",
    ))]));
    let client = alpaca_client(Arc::clone(&transport));

    let err = client
        .request_page(&request(&["AAPL"]), None)
        .expect_err("malformed");
    assert!(matches!(
        err,
        FetchError::MalformedResponse { status: 200, .. }
    ));
    assert_eq!(transport.requests().len(), 1);
}

#[test]
fn provider_error_sentinel_in_200_is_never_retried() {
    let transport = Arc::new(ScriptedTransport::new(vec![Ok(HttpResponse::ok_json(
        r#"{"status": "ERROR", "error": "unknown ticker"}"#,
    ))]));
    let client = FetchClient::new(
        Arc::new(PolygonSource::new("pk-test")),
        Arc::clone(&transport) as Arc<dyn HttpTransport>,
        fast_throttle(),
    )
    .with_retry(fast_retry());

    let err = client
        .request_page(&request(&["AAPL"]), None)
        .expect_err("sentinel");
    assert!(matches!(err, FetchError::Fatal { status: 200, .. }));
    assert_eq!(transport.requests().len(), 1);
}

// =============================================================================
// Checkpoints
// =============================================================================

#[test]
fn interrupted_pagination_resumes_from_the_saved_cursor() {
    let store = Arc::new(MemoryCheckpoints::default());

    // First run fails after the first page; the continuation cursor survives.
    let transport = Arc::new(ScriptedTransport::new(vec![
        Ok(alpaca_page("AAPL", "p2")),
        Ok(HttpResponse::with_status(403, "forbidden: invalid key")),
    ]));
    let client = alpaca_client(Arc::clone(&transport))
        .with_checkpoints(Arc::clone(&store) as Arc<dyn CheckpointStore>);
    client
        .fetch_batch(&request(&["AAPL"]))
        .expect_err("interrupted run");
    assert_eq!(store.saved_cursors(), vec![String::from("p2")]);

    // A new client sharing the store resumes mid-stream.
    let transport = Arc::new(ScriptedTransport::new(vec![Ok(alpaca_page("AAPL", ""))]));
    let client = alpaca_client(Arc::clone(&transport))
        .with_checkpoints(Arc::clone(&store) as Arc<dyn CheckpointStore>);
    client.fetch_batch(&request(&["AAPL"])).expect("resumed run");

    let requests = transport.requests();
    assert_eq!(requests.len(), 1);
    assert_eq!(requests[0].query_value("page_token"), Some("p2"));
}

#[test]
fn completed_pagination_clears_its_checkpoint() {
    let store = Arc::new(MemoryCheckpoints::default());

    let transport = Arc::new(ScriptedTransport::new(vec![
        Ok(alpaca_page("AAPL", "p2")),
        Ok(alpaca_page("AAPL", "")),
    ]));
    let client = alpaca_client(Arc::clone(&transport))
        .with_checkpoints(Arc::clone(&store) as Arc<dyn CheckpointStore>);
    client.fetch_batch(&request(&["AAPL"])).expect("full run");
    assert!(store.saved_cursors().is_empty());

    // Re-running the identical request starts from the first page again.
    let transport = Arc::new(ScriptedTransport::new(vec![
        Ok(alpaca_page("AAPL", "p2")),
        Ok(alpaca_page("AAPL", "")),
    ]));
    let client = alpaca_client(Arc::clone(&transport))
        .with_checkpoints(Arc::clone(&store) as Arc<dyn CheckpointStore>);
    client.fetch_batch(&request(&["AAPL"])).expect("repeat run");

    let requests = transport.requests();
    assert_eq!(requests.len(), 2);
    assert_eq!(requests[0].query_value("page_token"), None);
    assert!(store.saved_cursors().is_empty());
}
