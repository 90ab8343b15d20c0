use std::{
    collections::{HashSet, VecDeque},
    path::Path,
    sync::{
        Arc, Mutex, MutexGuard, PoisonError,
        atomic::{AtomicU64, Ordering},
    },
};

use futures_util::{StreamExt, stream::BoxStream};
use mergebot_core::models::RateLimit;
use serde_json::Value;
use thiserror::Error;
use url::Url;

use crate::{
    cache::{CacheEntry, ResponseCache},
    http::{Method, Request, Response, Transport, TransportError},
};

const USER_AGENT: &str = concat!("mergebot/", env!("CARGO_PKG_VERSION"));

/// Outcome of an API call that the caller is expected to branch on.
#[derive(Debug, Clone, PartialEq)]
pub enum Fetched<T> {
    Found(T),
    NotFound,
    /// Usually means the rate limit was hit.
    Forbidden,
}

impl<T> Fetched<T> {
    pub fn map<U>(self, f: impl FnOnce(T) -> U) -> Fetched<U> {
        match self {
            Self::Found(v) => Fetched::Found(f(v)),
            Self::NotFound => Fetched::NotFound,
            Self::Forbidden => Fetched::Forbidden,
        }
    }

    pub fn found(self) -> Option<T> {
        match self {
            Self::Found(v) => Some(v),
            _ => None,
        }
    }
}

#[derive(Debug, Error)]
pub enum ApiError {
    #[error(transparent)]
    Transport(#[from] TransportError),
    #[error("{method} {url}: unexpected status {status}")]
    UnexpectedStatus { method: &'static str, url: String, status: u16 },
    #[error("{0}: 304 Not Modified received without a cached response")]
    NotModifiedWithoutEntry(String),
    #[error("{url}: page no longer available (status {status})")]
    PageUnavailable { url: String, status: u16 },
    #[error("{url}: invalid JSON response")]
    Decode {
        url: String,
        #[source]
        source: serde_json::Error,
    },
    #[error("{0}: expected a JSON array")]
    NotAList(String),
    #[error("invalid URL {0}")]
    InvalidUrl(String),
}

/// Lazily paginated list items.
pub type Pages<'a> = BoxStream<'a, Result<Value, ApiError>>;

/// GitHub REST client with a conditional-request response cache.
pub struct CachedClient {
    transport: Arc<dyn Transport>,
    base: Url,
    token: Option<String>,
    cache: Mutex<ResponseCache>,
    rate_limit: Mutex<Option<RateLimit>>,
    calls: AtomicU64,
}

impl CachedClient {
    pub fn new(
        transport: Arc<dyn Transport>,
        base: Url,
        token: Option<String>,
        cache: ResponseCache,
    ) -> Self {
        Self {
            transport,
            base,
            token,
            cache: Mutex::new(cache),
            rate_limit: Mutex::new(None),
            calls: AtomicU64::new(0),
        }
    }

    fn cache(&self) -> MutexGuard<'_, ResponseCache> {
        self.cache.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Number of requests sent since start-up.
    pub fn api_calls(&self) -> u64 { self.calls.load(Ordering::Relaxed) }

    /// Most recent rate-limit counters seen in response headers.
    pub fn rate_limit(&self) -> Option<RateLimit> {
        *self.rate_limit.lock().unwrap_or_else(PoisonError::into_inner)
    }

    #[cfg(test)]
    fn cache_len(&self) -> usize { self.cache().len() }

    pub fn save_cache(&self, path: &Path) -> anyhow::Result<()> { self.cache().save(path) }

    /// Absolute URL for `path` with every query pair (existing and `params`) sorted.
    pub fn request_url(&self, path: &str, params: &[(&str, &str)]) -> Result<String, ApiError> {
        let raw = if path.starts_with("http://") || path.starts_with("https://") {
            path.to_string()
        } else {
            format!(
                "{}/{}",
                self.base.as_str().trim_end_matches('/'),
                path.trim_start_matches('/')
            )
        };
        let mut url = Url::parse(&raw).map_err(|_| ApiError::InvalidUrl(raw.clone()))?;
        let mut pairs = url
            .query_pairs()
            .map(|(k, v)| (k.into_owned(), v.into_owned()))
            .chain(params.iter().map(|(k, v)| (k.to_string(), v.to_string())))
            .collect::<Vec<_>>();
        pairs.sort();
        if pairs.is_empty() {
            url.set_query(None);
        } else {
            url.query_pairs_mut().clear().extend_pairs(pairs);
        }
        Ok(url.into())
    }

    fn headers(&self) -> Vec<(String, String)> {
        let mut headers = vec![
            ("Accept".to_string(), "application/vnd.github+json".to_string()),
            ("User-Agent".to_string(), USER_AGENT.to_string()),
        ];
        if let Some(token) = &self.token {
            headers.push(("Authorization".to_string(), format!("token {token}")));
        }
        headers
    }

    async fn execute(&self, request: Request) -> Result<Response, ApiError> {
        self.calls.fetch_add(1, Ordering::Relaxed);
        let response = self.transport.send(request).await?;
        self.record_rate_limit(&response);
        Ok(response)
    }

    fn record_rate_limit(&self, response: &Response) {
        let value = |name: &str| response.header(name).and_then(|v| v.trim().parse::<u64>().ok());
        if let (Some(remaining), Some(limit), Some(reset)) = (
            value("x-ratelimit-remaining"),
            value("x-ratelimit-limit"),
            value("x-ratelimit-reset"),
        ) {
            *self.rate_limit.lock().unwrap_or_else(PoisonError::into_inner) =
                Some(RateLimit { remaining, limit, reset });
        }
    }

    fn warn_forbidden(&self, url: &str) {
        match self.rate_limit() {
            Some(rl) if rl.remaining == 0 => tracing::warn!(
                "{url}: forbidden, API rate limit exhausted (resets in {}s)",
                rl.reset_in_secs()
            ),
            _ => tracing::warn!("{url}: forbidden, possibly rate limited"),
        }
    }

    /// Conditional GET of an absolute URL through the cache.
    async fn fetch(&self, url: &str) -> Result<Fetched<CacheEntry>, ApiError> {
        let key = format!("GET {url}");
        let cached = self.cache().get(&key).cloned();
        let mut headers = self.headers();
        if let Some(entry) = &cached {
            if let Some(etag) = &entry.etag {
                headers.push(("If-None-Match".to_string(), etag.clone()));
            }
            if let Some(last_modified) = &entry.last_modified {
                headers.push(("If-Modified-Since".to_string(), last_modified.clone()));
            }
        }
        let request = Request { method: Method::Get, url: url.to_string(), headers, body: vec![] };
        let response = self.execute(request).await?;
        match response.status {
            304 => match cached {
                Some(entry) => {
                    tracing::trace!("{key}: not modified");
                    Ok(Fetched::Found(entry))
                }
                None => Err(ApiError::NotModifiedWithoutEntry(url.to_string())),
            },
            200..=299 => {
                let entry = CacheEntry {
                    payload: decode(url, &response.body)?,
                    etag: response.header("etag").map(str::to_string),
                    last_modified: response.header("last-modified").map(str::to_string),
                    next: response.header("link").and_then(parse_next_link),
                };
                self.cache().insert(key, entry.clone());
                Ok(Fetched::Found(entry))
            }
            404 => Ok(Fetched::NotFound),
            403 => {
                self.warn_forbidden(url);
                Ok(Fetched::Forbidden)
            }
            status => Err(ApiError::UnexpectedStatus { method: "GET", url: url.to_string(), status }),
        }
    }

    pub async fn get(&self, path: &str, params: &[(&str, &str)]) -> Result<Fetched<Value>, ApiError> {
        let url = self.request_url(path, params)?;
        Ok(self.fetch(&url).await?.map(|entry| entry.payload))
    }

    /// Fetch the first page of a list eagerly and the following ones only when
    /// the stream reaches them. Pagination ends without a next link, with a
    /// malformed Link header, or when a next link points to a visited page.
    pub async fn get_list<'a>(
        &'a self,
        path: &str,
        params: &[(&str, &str)],
    ) -> Result<Fetched<Pages<'a>>, ApiError> {
        let url = self.request_url(path, params)?;
        let entry = match self.fetch(&url).await? {
            Fetched::Found(entry) => entry,
            Fetched::NotFound => return Ok(Fetched::NotFound),
            Fetched::Forbidden => return Ok(Fetched::Forbidden),
        };
        let state = PageState {
            items: page_items(&url, entry.payload)?,
            next: entry.next,
            visited: HashSet::from([url]),
        };
        let stream = futures_util::stream::try_unfold(state, move |mut state| async move {
            loop {
                if let Some(item) = state.items.pop_front() {
                    return Ok(Some((item, state)));
                }
                let Some(next) = state.next.take() else { return Ok(None) };
                let next = self.request_url(&next, &[])?;
                if !state.visited.insert(next.clone()) {
                    tracing::warn!("{next}: pagination loop detected, stopping");
                    return Ok(None);
                }
                let entry = match self.fetch(&next).await? {
                    Fetched::Found(entry) => entry,
                    Fetched::NotFound => {
                        return Err(ApiError::PageUnavailable { url: next, status: 404 });
                    }
                    Fetched::Forbidden => {
                        return Err(ApiError::PageUnavailable { url: next, status: 403 });
                    }
                };
                state.items = page_items(&next, entry.payload)?;
                state.next = entry.next;
            }
        });
        Ok(Fetched::Found(stream.boxed()))
    }

    /// Send a mutating request. Never cached.
    pub async fn send(
        &self,
        method: Method,
        path: &str,
        body: &Value,
    ) -> Result<Fetched<Value>, ApiError> {
        let url = self.request_url(path, &[])?;
        let mut headers = self.headers();
        headers.push(("Content-Type".to_string(), "application/json".to_string()));
        let body = serde_json::to_vec(body)
            .map_err(|source| ApiError::Decode { url: url.clone(), source })?;
        let request = Request { method, url: url.clone(), headers, body };
        let response = self.execute(request).await?;
        match response.status {
            200..=299 => Ok(Fetched::Found(decode(&url, &response.body)?)),
            404 => Ok(Fetched::NotFound),
            403 => {
                self.warn_forbidden(&url);
                Ok(Fetched::Forbidden)
            }
            status => Err(ApiError::UnexpectedStatus { method: method.as_str(), url, status }),
        }
    }
}

struct PageState {
    items: VecDeque<Value>,
    next: Option<String>,
    visited: HashSet<String>,
}

fn decode(url: &str, body: &[u8]) -> Result<Value, ApiError> {
    if body.iter().all(u8::is_ascii_whitespace) {
        return Ok(Value::Null);
    }
    serde_json::from_slice(body).map_err(|source| ApiError::Decode { url: url.to_string(), source })
}

fn page_items(url: &str, payload: Value) -> Result<VecDeque<Value>, ApiError> {
    match payload {
        Value::Array(items) => Ok(items.into()),
        _ => Err(ApiError::NotAList(url.to_string())),
    }
}

/// Extract the `rel="next"` target of a Link header. Malformed headers yield `None`.
pub fn parse_next_link(header: &str) -> Option<String> {
    // Targets may contain commas, so split on the angle brackets instead.
    let mut rest = header;
    while let Some(start) = rest.find('<') {
        let (target, tail) = rest[start + 1..].split_once('>')?;
        let params_end = tail.find('<').unwrap_or(tail.len());
        if tail[..params_end].split([';', ',']).any(|p| p.trim() == r#"rel="next""#) {
            return Some(target.to_string());
        }
        rest = &tail[params_end..];
    }
    None
}
