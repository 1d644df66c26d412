use std::collections::BTreeMap;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::time::Duration;

use serde_json::Value;

use crate::domain::{BarRecord, Frame, Symbol, UtcDateTime};
use crate::error::{FetchError, ValidationError};
use crate::http::{HttpAuth, HttpRequest, HttpResponse, HttpTransport};
use crate::provider::ProviderId;
use crate::rate_limit::Throttle;
use crate::retry::RetryPolicy;

pub const DEFAULT_MAX_PAGES: usize = 10_000;
pub const DEFAULT_TIMEOUT_MS: u64 = 10_000;

/// One bar-fetch window for one or more symbols.
///
/// Batch-capable providers (Alpaca) accept multiple symbols per request;
/// single-symbol providers (Finnhub, Polygon) require exactly one and reject
/// larger lists in `plan`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FetchRequest {
    pub symbols: Vec<Symbol>,
    pub start: UtcDateTime,
    pub end: UtcDateTime,
    pub frame: Frame,
}

impl FetchRequest {
    pub fn new(
        symbols: Vec<Symbol>,
        start: UtcDateTime,
        end: UtcDateTime,
        frame: Frame,
    ) -> Result<Self, ValidationError> {
        if symbols.is_empty() {
            return Err(ValidationError::EmptySymbolList);
        }
        if start >= end {
            return Err(ValidationError::InvalidWindow);
        }
        Ok(Self {
            symbols,
            start,
            end,
            frame,
        })
    }

    pub fn primary_symbol(&self) -> &Symbol {
        &self.symbols[0]
    }

    fn checkpoint_key(&self, provider: ProviderId) -> String {
        let symbols = self
            .symbols
            .iter()
            .map(Symbol::as_str)
            .collect::<Vec<_>>()
            .join(",");
        format!(
            "{provider}:{frame}:{symbols}:{start}:{end}",
            frame = self.frame,
            start = self.start.unix_seconds(),
            end = self.end.unix_seconds(),
        )
    }
}

/// Provider-specific request construction output.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RequestPlan {
    pub url: String,
    pub query: Vec<(String, String)>,
    pub headers: BTreeMap<String, String>,
}

impl RequestPlan {
    pub fn new(url: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            query: Vec::new(),
            headers: BTreeMap::new(),
        }
    }

    pub fn with_query(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.query.push((name.into(), value.into()));
        self
    }

    pub fn with_header(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers
            .insert(name.into().to_ascii_lowercase(), value.into());
        self
    }

    /// Apply a credential strategy to the plan. Providers disagree on where
    /// credentials go, so the strategy decides header vs. query placement.
    pub fn with_auth(mut self, auth: &HttpAuth) -> Self {
        match auth {
            HttpAuth::None => {}
            HttpAuth::Bearer(token) => {
                self.headers
                    .insert(String::from("authorization"), format!("Bearer {token}"));
            }
            HttpAuth::Header { name, value } => {
                self.headers
                    .insert(name.to_ascii_lowercase(), value.clone());
            }
            HttpAuth::QueryParam { name, value } => {
                self.query.push((name.clone(), value.clone()));
            }
        }
        self
    }

    fn into_request(self, timeout_ms: u64) -> HttpRequest {
        let mut request = HttpRequest::get(self.url).with_timeout_ms(timeout_ms);
        for (name, value) in self.query {
            request = request.with_query(name, value);
        }
        for (name, value) in self.headers {
            request = request.with_header(name, value);
        }
        request
    }
}

/// Closed response classification computed once per response.
///
/// `NoData` is a successful fetch with zero rows (Finnhub's `s: "no_data"`),
/// never an error and never retried.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResponseClass {
    Ok,
    NoData,
    Retryable { retry_after_secs: Option<u64> },
    Fatal,
}

impl ResponseClass {
    pub const fn retryable(retry_after: Option<Duration>) -> Self {
        Self::Retryable {
            retry_after_secs: match retry_after {
                Some(d) => Some(d.as_secs()),
                None => None,
            },
        }
    }
}

/// Status codes that independently signal retry-worthiness, used both by
/// provider classifiers and by the malformed-body gate.
pub const fn retryable_status(status: u16) -> bool {
    status == 429 || (status >= 500 && status <= 599)
}

/// Provider contract: every concrete source customizes exactly these hooks.
pub trait BarSource: Send + Sync {
    fn id(&self) -> ProviderId;

    /// Build the request for one page. `cursor` is `None` on the first page.
    fn plan(&self, req: &FetchRequest, cursor: Option<&str>) -> Result<RequestPlan, FetchError>;

    /// Classify a raw response. Providers differ here: a provider-flagged error
    /// sentinel inside a 200 body must classify as `Fatal`, not `Ok`.
    fn classify(&self, response: &HttpResponse) -> ResponseClass;

    /// Extract the continuation cursor; `None` terminates pagination.
    fn next_cursor(&self, req: &FetchRequest, cursor: Option<&str>, page: &Value)
        -> Option<String>;

    /// Translate one raw page into canonical bar records. The requested symbol
    /// is threaded through `req` for providers whose payload omits it.
    fn parse_page(&self, req: &FetchRequest, page: &Value) -> Result<Vec<BarRecord>, FetchError>;

    /// Defensive cap bounding runaway pagination on API misbehavior.
    fn max_pages(&self) -> usize {
        DEFAULT_MAX_PAGES
    }
}

/// Optional pagination-state backend. No-ops when not configured.
pub trait CheckpointStore: Send + Sync {
    fn save(&self, key: &str, cursor: &str) -> Result<(), FetchError>;
    fn load(&self, key: &str) -> Result<Option<String>, FetchError>;
    /// Forget a saved cursor; called once a fetch completes normally.
    fn clear(&self, key: &str) -> Result<(), FetchError>;
}

enum StepAction {
    Done(Value),
    Retry {
        status: Option<u16>,
        body: String,
        cooldown: Option<Duration>,
    },
}

/// Rate-limited, retrying, paginating fetch driver over one [`BarSource`].
///
/// The throttle is acquired before every HTTP call, so concurrent clients
/// sharing one limiter instance are throttled in aggregate. Blocking and async
/// mirrors have identical semantics; the async paths suspend cooperatively.
pub struct FetchClient {
    source: Arc<dyn BarSource>,
    transport: Arc<dyn HttpTransport>,
    throttle: Arc<dyn Throttle>,
    retry: RetryPolicy,
    timeout_ms: u64,
    checkpoints: Option<Arc<dyn CheckpointStore>>,
}

impl FetchClient {
    pub fn new(
        source: Arc<dyn BarSource>,
        transport: Arc<dyn HttpTransport>,
        throttle: Arc<dyn Throttle>,
    ) -> Self {
        Self {
            source,
            transport,
            throttle,
            retry: RetryPolicy::default(),
            timeout_ms: DEFAULT_TIMEOUT_MS,
            checkpoints: None,
        }
    }

    pub fn with_retry(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    pub fn with_timeout_ms(mut self, timeout_ms: u64) -> Self {
        self.timeout_ms = timeout_ms;
        self
    }

    pub fn with_checkpoints(mut self, checkpoints: Arc<dyn CheckpointStore>) -> Self {
        self.checkpoints = Some(checkpoints);
        self
    }

    pub fn provider(&self) -> ProviderId {
        self.source.id()
    }

    /// Fetch one raw page, applying rate limiting, retry with backoff and
    /// jitter, and server-instructed cooldowns.
    pub fn request_page(
        &self,
        req: &FetchRequest,
        cursor: Option<&str>,
    ) -> Result<Value, FetchError> {
        let mut attempt = 0u32;
        loop {
            self.throttle.acquire()?;
            let request = self.source.plan(req, cursor)?.into_request(self.timeout_ms);

            let step = match self.transport.execute(request) {
                Ok(response) => self.evaluate(response)?,
                Err(error) if error.retryable() => StepAction::Retry {
                    status: None,
                    body: error.message().to_owned(),
                    cooldown: None,
                },
                Err(error) => {
                    return Err(FetchError::Transport {
                        provider: self.source.id(),
                        message: error.message().to_owned(),
                    })
                }
            };

            match step {
                StepAction::Done(page) => return Ok(page),
                StepAction::Retry {
                    status,
                    body,
                    cooldown,
                } => {
                    if attempt >= self.retry.max_retries {
                        return Err(FetchError::RetriesExhausted {
                            provider: self.source.id(),
                            attempts: attempt + 1,
                            status,
                            body,
                        });
                    }
                    match cooldown {
                        Some(wait) => self.throttle.notify_retry_after(wait),
                        None => std::thread::sleep(self.retry.backoff.delay(attempt)),
                    }
                    attempt += 1;
                }
            }
        }
    }

    /// Async mirror of [`request_page`](Self::request_page).
    pub async fn request_page_async(
        &self,
        req: &FetchRequest,
        cursor: Option<&str>,
    ) -> Result<Value, FetchError> {
        let mut attempt = 0u32;
        loop {
            self.throttle.acquire_async().await?;
            let request = self.source.plan(req, cursor)?.into_request(self.timeout_ms);

            let step = match self.transport.execute_async(request).await {
                Ok(response) => self.evaluate(response)?,
                Err(error) if error.retryable() => StepAction::Retry {
                    status: None,
                    body: error.message().to_owned(),
                    cooldown: None,
                },
                Err(error) => {
                    return Err(FetchError::Transport {
                        provider: self.source.id(),
                        message: error.message().to_owned(),
                    })
                }
            };

            match step {
                StepAction::Done(page) => return Ok(page),
                StepAction::Retry {
                    status,
                    body,
                    cooldown,
                } => {
                    if attempt >= self.retry.max_retries {
                        return Err(FetchError::RetriesExhausted {
                            provider: self.source.id(),
                            attempts: attempt + 1,
                            status,
                            body,
                        });
                    }
                    match cooldown {
                        Some(wait) => self.throttle.notify_retry_after_async(wait).await,
                        None => tokio::time::sleep(self.retry.backoff.delay(attempt)).await,
                    }
                    attempt += 1;
                }
            }
        }
    }

    /// Drive the cursor loop and collect raw pages in provider order.
    ///
    /// Resumes from a saved checkpoint when a store is configured, saves the
    /// continuation cursor after every page, and clears the key once the fetch
    /// terminates normally so a repeat of the same request starts from the
    /// first page. Stops at the source's page cap even if the provider keeps
    /// returning cursors; the cursor stays saved in that case.
    pub fn paginate(&self, req: &FetchRequest) -> Result<Vec<Value>, FetchError> {
        let key = req.checkpoint_key(self.source.id());
        let mut cursor = self.load_checkpoint(&key)?;
        let mut pages = Vec::new();

        for _ in 0..self.source.max_pages() {
            let page = self.request_page(req, cursor.as_deref())?;
            let next = self.source.next_cursor(req, cursor.as_deref(), &page);
            pages.push(page);

            match next {
                Some(next_cursor) => {
                    self.save_checkpoint(&key, &next_cursor)?;
                    cursor = Some(next_cursor);
                }
                None => {
                    self.clear_checkpoint(&key)?;
                    return Ok(pages);
                }
            }
        }

        Ok(pages)
    }

    /// Async mirror of [`paginate`](Self::paginate).
    pub async fn paginate_async(&self, req: &FetchRequest) -> Result<Vec<Value>, FetchError> {
        let key = req.checkpoint_key(self.source.id());
        let mut cursor = self.load_checkpoint(&key)?;
        let mut pages = Vec::new();

        for _ in 0..self.source.max_pages() {
            let page = self.request_page_async(req, cursor.as_deref()).await?;
            let next = self.source.next_cursor(req, cursor.as_deref(), &page);
            pages.push(page);

            match next {
                Some(next_cursor) => {
                    self.save_checkpoint(&key, &next_cursor)?;
                    cursor = Some(next_cursor);
                }
                None => {
                    self.clear_checkpoint(&key)?;
                    return Ok(pages);
                }
            }
        }

        Ok(pages)
    }

    /// Flatten every page's parsed rows into one list, in provider page order.
    /// Callers needing global time-order must sort afterward.
    pub fn fetch_batch(&self, req: &FetchRequest) -> Result<Vec<BarRecord>, FetchError> {
        let pages = self.paginate(req)?;
        self.parse_pages(req, &pages)
    }

    /// Async mirror of [`fetch_batch`](Self::fetch_batch).
    pub async fn fetch_batch_async(&self, req: &FetchRequest) -> Result<Vec<BarRecord>, FetchError> {
        let pages = self.paginate_async(req).await?;
        self.parse_pages(req, &pages)
    }

    pub fn save_checkpoint(&self, key: &str, cursor: &str) -> Result<(), FetchError> {
        match &self.checkpoints {
            Some(store) => store.save(key, cursor),
            None => Ok(()),
        }
    }

    pub fn load_checkpoint(&self, key: &str) -> Result<Option<String>, FetchError> {
        match &self.checkpoints {
            Some(store) => store.load(key),
            None => Ok(None),
        }
    }

    pub fn clear_checkpoint(&self, key: &str) -> Result<(), FetchError> {
        match &self.checkpoints {
            Some(store) => store.clear(key),
            None => Ok(()),
        }
    }

    fn parse_pages(&self, req: &FetchRequest, pages: &[Value]) -> Result<Vec<BarRecord>, FetchError> {
        let mut rows = Vec::new();
        for page in pages {
            rows.extend(self.source.parse_page(req, page)?);
        }
        Ok(rows)
    }

    fn evaluate(&self, response: HttpResponse) -> Result<StepAction, FetchError> {
        match self.source.classify(&response) {
            ResponseClass::Ok | ResponseClass::NoData => {
                match serde_json::from_str::<Value>(&response.body) {
                    Ok(page) => Ok(StepAction::Done(page)),
                    // Malformed body: retryable only when the status code
                    // independently signals retry-worthiness.
                    Err(_) if retryable_status(response.status) => Ok(StepAction::Retry {
                        status: Some(response.status),
                        body: response.body,
                        cooldown: None,
                    }),
                    Err(_) => Err(FetchError::MalformedResponse {
                        provider: self.source.id(),
                        status: response.status,
                        body: response.body,
                    }),
                }
            }
            ResponseClass::Retryable { retry_after_secs } => Ok(StepAction::Retry {
                status: Some(response.status),
                body: response.body,
                cooldown: retry_after_secs.map(Duration::from_secs),
            }),
            ResponseClass::Fatal => Err(FetchError::Fatal {
                provider: self.source.id(),
                status: response.status,
                body: response.body,
            }),
        }
    }
}
