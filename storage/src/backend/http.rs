// Copyright 2024 Zran Developers. All rights reserved.
//
// SPDX-License-Identifier: Apache-2.0

//! Blob access over HTTP range requests.
//!
//! Every read is an independent `GET` with a `Range: bytes=o-e` header and
//! the server must answer `206 Partial Content`. One level of 3xx redirect
//! is followed per request, and the resolved location replaces the cached
//! URI so subsequent reads go straight to the target.

use std::fmt;
use std::sync::RwLock;
use std::time::Duration;

use reqwest::blocking::Client;
use reqwest::header::{CONTENT_LENGTH, LOCATION, RANGE};
use reqwest::redirect::Policy;
use reqwest::StatusCode;
use url::Url;

use crate::backend::{BackendError, BackendResult, RangeReader};

/// Error codes related to the HTTP range backend.
#[derive(Debug)]
pub enum HttpError {
    Transport(reqwest::Error),
    Url(String, url::ParseError),
    NoRangeSupport(String, u16),
    Redirect(String),
    Size(String),
}

impl fmt::Display for HttpError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            HttpError::Transport(e) => write!(f, "network error, {}", e),
            HttpError::Url(s, e) => write!(f, "failed to parse URL {}, {}", s, e),
            HttpError::NoRangeSupport(uri, status) => write!(
                f,
                "{:?} does not support range requests, saw status: {}",
                uri, status
            ),
            HttpError::Redirect(s) => write!(f, "invalid redirect, {}", s),
            HttpError::Size(s) => write!(f, "failed to get content length, {}", s),
        }
    }
}

impl From<HttpError> for BackendError {
    fn from(e: HttpError) -> Self {
        BackendError::Http(e)
    }
}

/// Configuration for the HTTP range backend.
#[derive(Clone, Debug, Deserialize)]
#[serde(default)]
pub struct HttpReaderConfig {
    /// HTTP request timeout in seconds.
    pub timeout: u64,
    /// HTTP connection timeout in seconds.
    pub connect_timeout: u64,
    /// Number of times a failed read is retried.
    pub retry_limit: u8,
}

impl Default for HttpReaderConfig {
    fn default() -> Self {
        Self {
            timeout: 5,
            connect_timeout: 5,
            retry_limit: 0,
        }
    }
}

/// A [`RangeReader`] over an HTTP(S) URI.
pub struct HttpReader {
    client: Client,
    /// Current URI, updated when the server redirects.
    uri: RwLock<String>,
    retry_limit: u8,
}

impl HttpReader {
    pub fn new(uri: &str, config: &HttpReaderConfig) -> BackendResult<Self> {
        Url::parse(uri).map_err(|e| HttpError::Url(uri.to_string(), e))?;
        // Redirects are followed by hand, exactly one level per request,
        // because the resolved location must replace the cached URI.
        let client = Client::builder()
            .timeout(Duration::from_secs(config.timeout))
            .connect_timeout(Duration::from_secs(config.connect_timeout))
            .redirect(Policy::none())
            .build()
            .map_err(HttpError::Transport)?;
        Ok(HttpReader {
            client,
            uri: RwLock::new(uri.to_string()),
            retry_limit: config.retry_limit,
        })
    }

    fn current_uri(&self) -> String {
        self.uri.read().unwrap().clone()
    }

    /// Resolve `location` against the current URI and cache the result.
    fn follow_redirect(&self, location: Option<&reqwest::header::HeaderValue>) -> BackendResult<()> {
        let location = location
            .ok_or_else(|| HttpError::Redirect("missing Location header".to_string()))?
            .to_str()
            .map_err(|e| HttpError::Redirect(e.to_string()))?
            .to_string();
        let current = self.current_uri();
        let base = Url::parse(&current).map_err(|e| HttpError::Url(current.clone(), e))?;
        let resolved = base
            .join(&location)
            .map_err(|e| HttpError::Url(location.clone(), e))?;
        info!("http blob moved: {} -> {}", current, resolved);
        *self.uri.write().unwrap() = resolved.into();
        Ok(())
    }

    fn fetch_range(&self, buf: &mut [u8], offset: u64, redirectable: bool) -> BackendResult<usize> {
        if buf.is_empty() {
            return Ok(0);
        }
        let uri = self.current_uri();
        let end = offset + buf.len() as u64 - 1;
        let mut resp = self
            .client
            .get(&uri)
            .header(RANGE, format!("bytes={}-{}", offset, end))
            .send()
            .map_err(HttpError::Transport)?;

        let status = resp.status();
        if status == StatusCode::PARTIAL_CONTENT {
            let mut sink = &mut buf[..];
            let n = resp.copy_to(&mut sink).map_err(HttpError::Transport)?;
            return Ok(n as usize);
        }
        if status.is_redirection() && redirectable {
            self.follow_redirect(resp.headers().get(LOCATION))?;
            return self.fetch_range(buf, offset, false);
        }
        Err(HttpError::NoRangeSupport(uri, status.as_u16()).into())
    }
}

impl RangeReader for HttpReader {
    fn size(&self) -> BackendResult<u64> {
        for attempt in 0..2 {
            let uri = self.current_uri();
            let resp = self
                .client
                .head(&uri)
                .send()
                .map_err(HttpError::Transport)?;
            let status = resp.status();
            if status.is_redirection() && attempt == 0 {
                self.follow_redirect(resp.headers().get(LOCATION))?;
                continue;
            }
            if !status.is_success() {
                return Err(HttpError::NoRangeSupport(uri, status.as_u16()).into());
            }
            let len = resp
                .headers()
                .get(CONTENT_LENGTH)
                .ok_or_else(|| HttpError::Size("missing Content-Length".to_string()))?
                .to_str()
                .map_err(|e| HttpError::Size(e.to_string()))?
                .parse::<u64>()
                .map_err(|e| HttpError::Size(e.to_string()))?;
            return Ok(len);
        }
        unreachable!()
    }

    fn try_read_at(&self, buf: &mut [u8], offset: u64) -> BackendResult<usize> {
        self.fetch_range(buf, offset, true)
    }

    fn retry_limit(&self) -> u8 {
        self.retry_limit
    }
}
