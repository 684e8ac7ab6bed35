//! Blocking HTTP access for upstream sources.
//!
//! The caller owns authentication: it hands in a configured `ureq::Agent`
//! and any opaque headers, and this client only adds timeouts, bounded
//! retries and response size limits on top.

use crate::error::{FetchError, FetchErrorKind};
use serde::de::DeserializeOwned;
use std::error::Error as _;
use std::io::{self, Read};
use std::thread;
use std::time::Duration;
use tracing::{debug, warn};

const USER_AGENT: &str = concat!("catalogsync/", env!("CARGO_PKG_VERSION"));

/// Response cap for listing calls, which return many entries at once.
pub const LISTING_MAX_BYTES: usize = 32 * 1024 * 1024;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct RetryPolicy {
    pub max_retries: u32,
    pub base_delay: Duration,
    pub max_delay: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_retries: 3,
            base_delay: Duration::from_secs(1),
            max_delay: Duration::from_secs(30),
        }
    }
}

impl RetryPolicy {
    /// Delay before retry number `attempt` (0-based): doubling, capped.
    pub fn delay_for(&self, attempt: u32) -> Duration {
        let factor = 1u32.checked_shl(attempt.min(16)).unwrap_or(u32::MAX);
        self.base_delay
            .checked_mul(factor)
            .unwrap_or(self.max_delay)
            .min(self.max_delay)
    }
}

#[derive(Clone, Debug)]
pub struct HttpClient {
    agent: ureq::Agent,
    headers: Vec<(String, String)>,
    timeout: Duration,
    retry: RetryPolicy,
    max_bytes: usize,
}

impl HttpClient {
    pub fn new(agent: ureq::Agent, timeout: Duration) -> Self {
        Self {
            agent,
            headers: Vec::new(),
            timeout,
            retry: RetryPolicy::default(),
            max_bytes: 1024 * 1024,
        }
    }

    pub fn with_headers(mut self, headers: Vec<(String, String)>) -> Self {
        self.headers = headers;
        self
    }

    pub fn with_retry(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    pub fn with_max_bytes(mut self, max_bytes: usize) -> Self {
        self.max_bytes = max_bytes;
        self
    }

    /// A copy of this client for listing calls, with a larger body cap.
    pub fn for_listing(&self) -> Self {
        self.clone()
            .with_max_bytes(self.max_bytes.max(LISTING_MAX_BYTES))
    }

    /// GET `url`, retrying transient failures, and return the body.
    pub fn get_bytes(&self, url: &str, query: &[(&str, &str)]) -> Result<Vec<u8>, FetchError> {
        let mut attempt = 0;
        loop {
            match self.get_once(url, query) {
                Ok(body) => return Ok(body),
                Err(err) if err.is_retryable() && attempt < self.retry.max_retries => {
                    let delay = self.retry.delay_for(attempt);
                    warn!(
                        url,
                        attempt = attempt + 1,
                        delay_ms = delay.as_millis() as u64,
                        error = %err.kind,
                        "retrying upstream request"
                    );
                    thread::sleep(delay);
                    attempt += 1;
                }
                Err(err) => return Err(err),
            }
        }
    }

    pub fn get_json<T: DeserializeOwned>(
        &self,
        url: &str,
        query: &[(&str, &str)],
    ) -> Result<T, FetchError> {
        let body = self.get_bytes(url, query)?;
        serde_json::from_slice(&body).map_err(|err| {
            FetchError::new(
                url,
                FetchErrorKind::InvalidDescriptor {
                    message: format!("response is not valid JSON: {err}"),
                },
            )
        })
    }

    fn get_once(&self, url: &str, query: &[(&str, &str)]) -> Result<Vec<u8>, FetchError> {
        let mut request = self
            .agent
            .get(url)
            .timeout(self.timeout)
            .set("User-Agent", USER_AGENT);
        for (name, value) in &self.headers {
            request = request.set(name, value);
        }
        for (key, value) in query {
            request = request.query(key, value);
        }

        debug!(url, "GET");
        let response = request.call().map_err(|err| self.classify(url, err))?;

        let mut body = Vec::new();
        let limit = self.max_bytes as u64;
        response
            .into_reader()
            .take(limit + 1)
            .read_to_end(&mut body)
            .map_err(|err| self.classify_io(url, &err))?;
        if body.len() as u64 > limit {
            return Err(FetchError::new(
                url,
                FetchErrorKind::TooLarge {
                    limit: self.max_bytes,
                },
            ));
        }
        Ok(body)
    }

    fn classify(&self, url: &str, err: ureq::Error) -> FetchError {
        match err {
            ureq::Error::Status(status, _) => FetchError::new(url, FetchErrorKind::Status { status }),
            ureq::Error::Transport(transport) => {
                let timed_out = transport
                    .source()
                    .and_then(|source| source.downcast_ref::<io::Error>())
                    .map(is_timeout)
                    .unwrap_or(false)
                    || transport.to_string().contains("timed out");
                if timed_out {
                    self.timeout_error(url)
                } else {
                    FetchError::new(
                        url,
                        FetchErrorKind::Transport {
                            message: transport.to_string(),
                        },
                    )
                }
            }
        }
    }

    fn classify_io(&self, url: &str, err: &io::Error) -> FetchError {
        if is_timeout(err) {
            self.timeout_error(url)
        } else {
            FetchError::new(
                url,
                FetchErrorKind::Transport {
                    message: err.to_string(),
                },
            )
        }
    }

    fn timeout_error(&self, url: &str) -> FetchError {
        FetchError::new(
            url,
            FetchErrorKind::Timeout {
                timeout_ms: self.timeout.as_millis() as u64,
            },
        )
    }
}

fn is_timeout(err: &io::Error) -> bool {
    matches!(err.kind(), io::ErrorKind::TimedOut | io::ErrorKind::WouldBlock)
}

/// Split a `Name: value` header flag into its parts.
pub fn parse_header(raw: &str) -> Result<(String, String), String> {
    let (name, value) = raw
        .split_once(':')
        .ok_or_else(|| format!("header {raw:?} must look like 'Name: value'"))?;
    let name = name.trim();
    if name.is_empty() || name.chars().any(|c| c.is_whitespace()) {
        return Err(format!("header {raw:?} has an invalid name"));
    }
    Ok((name.to_string(), value.trim().to_string()))
}

/// Local HTTP server for upstream tests: answers each request whose target
/// (path plus query) matches a route with that body, and 404 otherwise.
#[cfg(test)]
pub(crate) fn serve_routes(routes: Vec<(String, String)>) -> String {
    use std::collections::BTreeMap;
    use std::io::{BufRead, BufReader, Write};
    use std::net::TcpListener;
    use std::sync::Arc;

    let listener = TcpListener::bind("127.0.0.1:0").unwrap();
    let addr = listener.local_addr().unwrap();
    let routes: Arc<BTreeMap<String, String>> = Arc::new(routes.into_iter().collect());
    thread::spawn(move || {
        for stream in listener.incoming() {
            let Ok(mut stream) = stream else { continue };
            let routes = Arc::clone(&routes);
            thread::spawn(move || {
                let mut reader = BufReader::new(stream.try_clone().unwrap());
                let mut request_line = String::new();
                reader.read_line(&mut request_line).unwrap();
                let mut line = String::new();
                while reader.read_line(&mut line).unwrap() > 0 {
                    if line == "\r\n" {
                        break;
                    }
                    line.clear();
                }
                let target = request_line.split_whitespace().nth(1).unwrap_or("/");
                let response = match routes.get(target) {
                    Some(body) => format!(
                        "HTTP/1.1 200 OK\r\nContent-Length: {}\r\nConnection: close\r\n\r\n{body}",
                        body.len()
                    ),
                    None => "HTTP/1.1 404 Not Found\r\nContent-Length: 0\r\nConnection: close\r\n\r\n"
                        .to_string(),
                };
                let _ = stream.write_all(response.as_bytes());
            });
        }
    });
    format!("http://{addr}")
}
