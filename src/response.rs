//! Responses paired with the time it took to get them.

use bytes::Bytes;
use reqwest::header::HeaderMap;
use reqwest::StatusCode;
use serde::de::DeserializeOwned;
use tokio::time::Duration;

use crate::errors::Error;

/// A response together with the elapsed wall-clock time of the logical call
/// that produced it.
///
/// `elapsed` runs from the start of the first attempt until the headers of the
/// final attempt arrived, so it includes every retry and 5xx back-off.
#[derive(Debug, Clone)]
pub struct TimedResponse {
    pub status: StatusCode,
    pub headers: HeaderMap,
    pub body: Bytes,
    pub elapsed: Duration,
    /// Set only for the synthetic 304 built from a locally fresh cache entry.
    pub served_from_cache: bool,
    /// `body` is the stored representation of a cache entry the 304 answered for.
    pub body_from_cache: bool,
}

impl TimedResponse {
    /// Synthetic "not modified" answer for a locally fresh cache entry.
    pub fn not_modified_from_cache(body: Bytes) -> Self {
        Self {
            status: StatusCode::NOT_MODIFIED,
            headers: HeaderMap::new(),
            body,
            elapsed: Duration::ZERO,
            served_from_cache: true,
            body_from_cache: true,
        }
    }

    /// Replaces the empty body of a 304 with the cached representation.
    pub(crate) fn fill_from_cache(&mut self, body: Bytes) {
        if self.is_not_modified() {
            self.body = body;
            self.body_from_cache = true;
        }
    }

    pub fn is_not_modified(&self) -> bool {
        self.status == StatusCode::NOT_MODIFIED
    }

    pub fn text(&self) -> String {
        String::from_utf8_lossy(&self.body).into_owned()
    }

    /// Decodes the body as JSON, labelling failures with `context`.
    pub fn json<T: DeserializeOwned>(&self, context: &str) -> Result<T, Error> {
        serde_json::from_slice(&self.body).map_err(|source| Error::Decode {
            context: context.to_string(),
            source,
        })
    }

    /// Accepts a 200, or a 304 whose body came from the cache.
    pub fn expect_ok_or_cached(&self, context: &str) -> Result<&Self, Error> {
        if self.is_not_modified() && self.body_from_cache {
            Ok(self)
        } else {
            self.expect_status(StatusCode::OK, context)
        }
    }

    /// Returns `Error::Status` unless the status equals `expected`.
    pub fn expect_status(&self, expected: StatusCode, context: &str) -> Result<&Self, Error> {
        if self.status == expected {
            Ok(self)
        } else {
            Err(Error::status(context, self.status, &self.body))
        }
    }
}
