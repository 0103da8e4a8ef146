//! Conditional HTTP response cache.
//!
//! Entries are keyed by the fully resolved request URL and derived from 200
//! responses to GET requests. An entry carries the validators (`ETag`,
//! `Last-Modified`) used to turn the next GET for the same URL into a
//! conditional request, the freshness directives of the response, and the
//! buffered body.
//!
//! The cache only rewrites request headers before transport and inspects
//! responses after the executor has finished timing them. It never changes the
//! method, URL or body of a request and never takes part in retry decisions.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant, SystemTime};

use bytes::Bytes;
use chrono::{DateTime, NaiveDateTime, TimeZone, Utc};
use reqwest::header::{
    HeaderMap, HeaderValue, CACHE_CONTROL, ETAG, EXPIRES, IF_MODIFIED_SINCE, IF_NONE_MATCH,
    LAST_MODIFIED,
};
use reqwest::StatusCode;
use tracing::debug;

/// Validators taken from a stored response.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Validators {
    pub etag: Option<HeaderValue>,
    pub last_modified: Option<HeaderValue>,
}

impl Validators {
    fn from_headers(headers: &HeaderMap) -> Self {
        Self {
            etag: non_empty(headers.get(ETAG)),
            last_modified: non_empty(headers.get(LAST_MODIFIED)),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.etag.is_none() && self.last_modified.is_none()
    }
}

fn non_empty(value: Option<&HeaderValue>) -> Option<HeaderValue> {
    value.filter(|v| !v.as_bytes().is_empty()).cloned()
}

/// Parsed `Cache-Control` directives relevant to a private client cache.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CacheControl {
    pub no_store: bool,
    pub no_cache: bool,
    pub must_revalidate: bool,
    pub max_age: Option<Duration>,
    pub s_maxage: Option<Duration>,
}

impl CacheControl {
    /// Parses every `Cache-Control` header present. Directive names are
    /// case-insensitive; unknown directives are ignored.
    pub fn from_headers(headers: &HeaderMap) -> Self {
        let mut cc = CacheControl::default();

        for value in headers.get_all(CACHE_CONTROL) {
            let Ok(value) = value.to_str() else {
                continue;
            };
            for directive in value.split(',') {
                let (name, arg) = match directive.split_once('=') {
                    Some((name, arg)) => (name, Some(arg.trim().trim_matches('"'))),
                    None => (directive, None),
                };
                match name.trim().to_ascii_lowercase().as_str() {
                    "no-store" => cc.no_store = true,
                    "no-cache" => cc.no_cache = true,
                    "must-revalidate" | "proxy-revalidate" => cc.must_revalidate = true,
                    "max-age" => set_delta_seconds(&mut cc.max_age, arg),
                    "s-maxage" => set_delta_seconds(&mut cc.s_maxage, arg),
                    _ => {}
                }
            }
        }

        cc
    }
}

/// The first occurrence of a delta-seconds directive wins; a malformed value
/// makes the response immediately stale.
fn set_delta_seconds(slot: &mut Option<Duration>, arg: Option<&str>) {
    if slot.is_none() {
        let secs = arg.and_then(|a| a.parse::<u64>().ok()).unwrap_or(0);
        *slot = Some(Duration::from_secs(secs));
    }
}

/// Freshness metadata of a stored entry.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Freshness {
    pub no_cache: bool,
    /// Every stated lifetime must hold, `Expires` included.
    pub must_revalidate: bool,
    /// `max-age`, or `s-maxage` when no `max-age` was sent.
    pub max_age: Option<Duration>,
    /// `Expires` date. An unparseable value is stored as the Unix epoch,
    /// i.e. already expired.
    pub expires: Option<SystemTime>,
    pub stored_at: Instant,
}

impl Freshness {
    fn from_headers(cc: &CacheControl, headers: &HeaderMap) -> Self {
        let expires = headers.get(EXPIRES).map(|v| {
            v.to_str()
                .ok()
                .and_then(parse_http_date)
                .unwrap_or(SystemTime::UNIX_EPOCH)
        });

        Self {
            no_cache: cc.no_cache,
            must_revalidate: cc.must_revalidate,
            max_age: cc.max_age.or(cc.s_maxage),
            expires,
            stored_at: Instant::now(),
        }
    }

    /// True when the response carried `max-age` or `Expires`.
    pub fn has_directive(&self) -> bool {
        self.max_age.is_some() || self.expires.is_some()
    }

    pub fn is_fresh(&self) -> bool {
        self.is_fresh_at(self.stored_at.elapsed(), SystemTime::now())
    }

    /// `max-age` takes precedence over `Expires` unless `must-revalidate`
    /// was sent, in which case the stricter of the two applies.
    pub fn is_fresh_at(&self, age: Duration, now: SystemTime) -> bool {
        if self.no_cache {
            return false;
        }
        match (self.max_age, self.expires) {
            (Some(max_age), Some(expires)) if self.must_revalidate => {
                age < max_age && now < expires
            }
            (Some(max_age), _) => age < max_age,
            (None, Some(expires)) => now < expires,
            (None, None) => false,
        }
    }
}

/// One cached representation of a URL.
#[derive(Debug, Clone)]
pub struct CacheEntry {
    pub validators: Validators,
    pub freshness: Freshness,
    pub body: Bytes,
}

impl CacheEntry {
    /// Builds an entry from a 200 response, or `None` when the response is
    /// not cacheable.
    pub fn from_response(status: StatusCode, headers: &HeaderMap, body: Bytes) -> Option<Self> {
        if status != StatusCode::OK {
            return None;
        }
        let cc = CacheControl::from_headers(headers);
        if cc.no_store {
            return None;
        }

        let validators = Validators::from_headers(headers);
        let freshness = Freshness::from_headers(&cc, headers);
        if validators.is_empty() && !freshness.has_directive() {
            return None;
        }

        Some(Self {
            validators,
            freshness,
            body,
        })
    }

    pub fn is_fresh(&self) -> bool {
        self.freshness.is_fresh()
    }

    /// Adds `If-None-Match` / `If-Modified-Since` to an outgoing request.
    pub fn apply_to_request(&self, request: &mut reqwest::Request) {
        let headers = request.headers_mut();
        if let Some(etag) = &self.validators.etag {
            headers.insert(IF_NONE_MATCH, etag.clone());
        }
        if let Some(last_modified) = &self.validators.last_modified {
            headers.insert(IF_MODIFIED_SINCE, last_modified.clone());
        }
    }
}

/// What `consider_store` did with a response.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StoreOutcome {
    /// A new entry was created or the previous one replaced.
    Stored,
    /// The response was not cacheable and an existing entry was dropped.
    Cleared,
    /// Nothing was stored and nothing existed.
    Skipped,
}

impl StoreOutcome {
    pub fn label(&self) -> &'static str {
        match self {
            StoreOutcome::Stored => "stored",
            StoreOutcome::Cleared => "cleared",
            StoreOutcome::Skipped => "skipped",
        }
    }
}

/// URL-keyed cache shared safely between tasks.
///
/// Entries are swapped whole behind an `Arc`, so a reader holding an entry
/// never sees validators from one response mixed with freshness from another.
#[derive(Debug, Default)]
pub struct ResponseCache {
    entries: Mutex<HashMap<String, Arc<CacheEntry>>>,
}

impl ResponseCache {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn lookup(&self, url: &str) -> Option<Arc<CacheEntry>> {
        self.lock().get(url).cloned()
    }

    /// Decides whether the GET response for `url` replaces the stored entry.
    ///
    /// Only 200 responses are considered. A cacheable one replaces the entry
    /// wholesale; a non-cacheable one removes whatever was stored so stale
    /// validators are not sent again.
    pub fn consider_store(
        &self,
        url: &str,
        status: StatusCode,
        headers: &HeaderMap,
        body: Bytes,
    ) -> StoreOutcome {
        if status != StatusCode::OK {
            return StoreOutcome::Skipped;
        }

        match CacheEntry::from_response(status, headers, body) {
            Some(entry) => {
                debug!(
                    url = %url,
                    etag = ?entry.validators.etag,
                    last_modified = ?entry.validators.last_modified,
                    max_age = ?entry.freshness.max_age,
                    "Storing cache entry"
                );
                self.lock().insert(url.to_string(), Arc::new(entry));
                StoreOutcome::Stored
            }
            None => {
                if self.lock().remove(url).is_some() {
                    debug!(url = %url, "Response not cacheable, dropped previous entry");
                    StoreOutcome::Cleared
                } else {
                    StoreOutcome::Skipped
                }
            }
        }
    }

    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.lock().is_empty()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, HashMap<String, Arc<CacheEntry>>> {
        // Entries are replaced atomically, so a poisoned map is still consistent.
        self.entries.lock().unwrap_or_else(|e| e.into_inner())
    }
}

/// Parses an HTTP-date in IMF-fixdate, RFC 850 or asctime form.
pub fn parse_http_date(s: &str) -> Option<SystemTime> {
    let s = s.trim();

    if let Ok(dt) = DateTime::parse_from_rfc2822(s) {
        return Some(SystemTime::from(dt));
    }

    for format in ["%A, %d-%b-%y %H:%M:%S GMT", "%a %b %e %H:%M:%S %Y"] {
        if let Ok(naive) = NaiveDateTime::parse_from_str(s, format) {
            return Some(SystemTime::from(Utc.from_utc_datetime(&naive)));
        }
    }

    None
}

#[cfg(test)]
mod tests {
    use super::*;

    fn headers(pairs: &[(&'static str, &'static str)]) -> HeaderMap {
        let mut map = HeaderMap::new();
        for (name, value) in pairs {
            map.append(*name, HeaderValue::from_static(value));
        }
        map
    }

    #[test]
    fn test_parse_cache_control_directives() {
        let cc = CacheControl::from_headers(&headers(&[(
            "cache-control",
            "Public, MAX-AGE=\"60\", no-cache",
        )]));
        assert!(cc.no_cache);
        assert!(!cc.no_store);
        assert_eq!(cc.max_age, Some(Duration::from_secs(60)));
    }

    #[test]
    fn test_parse_shared_and_revalidate_directives() {
        let cc = CacheControl::from_headers(&headers(&[
            ("cache-control", "public, s-maxage=120"),
            ("cache-control", "Must-Revalidate"),
        ]));
        assert_eq!(cc.s_maxage, Some(Duration::from_secs(120)));
        assert_eq!(cc.max_age, None);
        assert!(cc.must_revalidate);
    }

    #[test]
    fn test_s_maxage_alone_makes_entry_storable_and_fresh() {
        let entry = CacheEntry::from_response(
            StatusCode::OK,
            &headers(&[("cache-control", "s-maxage=60")]),
            Bytes::from_static(b"{}"),
        )
        .unwrap();
        assert_eq!(entry.freshness.max_age, Some(Duration::from_secs(60)));
        assert!(entry.is_fresh());
    }

    #[test]
    fn test_max_age_wins_over_s_maxage() {
        let entry = CacheEntry::from_response(
            StatusCode::OK,
            &headers(&[("cache-control", "s-maxage=600, max-age=0")]),
            Bytes::new(),
        )
        .unwrap();
        assert_eq!(entry.freshness.max_age, Some(Duration::ZERO));
        assert!(!entry.is_fresh());
    }

    #[test]
    fn test_must_revalidate_applies_stricter_lifetime() {
        let now = SystemTime::now();
        let mut freshness = Freshness {
            no_cache: false,
            must_revalidate: false,
            max_age: Some(Duration::from_secs(60)),
            expires: Some(now - Duration::from_secs(1)),
            stored_at: Instant::now(),
        };
        assert!(freshness.is_fresh_at(Duration::from_secs(5), now));

        freshness.must_revalidate = true;
        assert!(!freshness.is_fresh_at(Duration::from_secs(5), now));

        freshness.expires = Some(now + Duration::from_secs(60));
        assert!(freshness.is_fresh_at(Duration::from_secs(5), now));
        assert!(!freshness.is_fresh_at(Duration::from_secs(60), now));
    }

    #[test]
    fn test_malformed_max_age_is_stale() {
        let cc = CacheControl::from_headers(&headers(&[("cache-control", "max-age=soon")]));
        assert_eq!(cc.max_age, Some(Duration::ZERO));
    }

    #[test]
    fn test_parse_http_date_formats() {
        let expected = SystemTime::UNIX_EPOCH + Duration::from_secs(784111777);
        assert_eq!(parse_http_date("Sun, 06 Nov 1994 08:49:37 GMT"), Some(expected));
        assert_eq!(parse_http_date("Sunday, 06-Nov-94 08:49:37 GMT"), Some(expected));
        assert_eq!(parse_http_date("Sun Nov  6 08:49:37 1994"), Some(expected));
        assert_eq!(parse_http_date("yesterday"), None);
    }

    #[test]
    fn test_entry_requires_validator_or_freshness() {
        let none = CacheEntry::from_response(
            StatusCode::OK,
            &headers(&[("content-type", "text/html")]),
            Bytes::from_static(b"<html>"),
        );
        assert!(none.is_none());

        let with_etag =
            CacheEntry::from_response(StatusCode::OK, &headers(&[("etag", "\"v1\"")]), Bytes::new());
        assert!(with_etag.is_some());

        let with_max_age = CacheEntry::from_response(
            StatusCode::OK,
            &headers(&[("cache-control", "max-age=30")]),
            Bytes::new(),
        );
        assert!(with_max_age.is_some());
    }

    #[test]
    fn test_no_store_is_never_cached() {
        let entry = CacheEntry::from_response(
            StatusCode::OK,
            &headers(&[("etag", "\"v1\""), ("cache-control", "no-store")]),
            Bytes::new(),
        );
        assert!(entry.is_none());
    }

    #[test]
    fn test_only_200_is_cached() {
        let entry = CacheEntry::from_response(
            StatusCode::CREATED,
            &headers(&[("etag", "\"v1\"")]),
            Bytes::new(),
        );
        assert!(entry.is_none());
    }

    #[test]
    fn test_freshness_max_age_beats_expires() {
        let freshness = Freshness {
            no_cache: false,
            must_revalidate: false,
            max_age: Some(Duration::from_secs(10)),
            expires: Some(SystemTime::UNIX_EPOCH),
            stored_at: Instant::now(),
        };
        let now = SystemTime::now();
        assert!(freshness.is_fresh_at(Duration::from_secs(5), now));
        assert!(!freshness.is_fresh_at(Duration::from_secs(10), now));
    }

    #[test]
    fn test_freshness_from_expires_and_no_cache() {
        let now = SystemTime::now();
        let mut freshness = Freshness {
            no_cache: false,
            must_revalidate: false,
            max_age: None,
            expires: Some(now + Duration::from_secs(60)),
            stored_at: Instant::now(),
        };
        assert!(freshness.is_fresh_at(Duration::ZERO, now));

        freshness.no_cache = true;
        assert!(!freshness.is_fresh_at(Duration::ZERO, now));
    }

    #[test]
    fn test_invalid_expires_counts_as_expired() {
        let entry = CacheEntry::from_response(
            StatusCode::OK,
            &headers(&[("expires", "0")]),
            Bytes::new(),
        )
        .unwrap();
        assert_eq!(entry.freshness.expires, Some(SystemTime::UNIX_EPOCH));
        assert!(!entry.is_fresh());
    }

    #[test]
    fn test_apply_to_request_sets_conditional_headers_only() {
        let entry = CacheEntry::from_response(
            StatusCode::OK,
            &headers(&[
                ("etag", "\"v1\""),
                ("last-modified", "Sun, 06 Nov 1994 08:49:37 GMT"),
            ]),
            Bytes::new(),
        )
        .unwrap();

        let url = reqwest::Url::parse("http://localhost/info?cursor=1").unwrap();
        let mut request = reqwest::Request::new(reqwest::Method::GET, url.clone());
        entry.apply_to_request(&mut request);

        assert_eq!(request.method(), &reqwest::Method::GET);
        assert_eq!(request.url(), &url);
        assert!(request.body().is_none());
        assert_eq!(request.headers()[IF_NONE_MATCH], "\"v1\"");
        assert_eq!(
            request.headers()[IF_MODIFIED_SINCE],
            "Sun, 06 Nov 1994 08:49:37 GMT"
        );
    }

    #[test]
    fn test_consider_store_replaces_and_clears() {
        let cache = ResponseCache::new();
        let url = "http://localhost/";

        assert_eq!(
            cache.consider_store(url, StatusCode::OK, &headers(&[("etag", "\"v1\"")]), Bytes::new()),
            StoreOutcome::Stored
        );
        assert_eq!(
            cache.consider_store(url, StatusCode::OK, &headers(&[("etag", "\"v2\"")]), Bytes::new()),
            StoreOutcome::Stored
        );
        assert_eq!(cache.len(), 1);
        assert_eq!(
            cache.lookup(url).unwrap().validators.etag,
            Some(HeaderValue::from_static("\"v2\""))
        );

        assert_eq!(
            cache.consider_store(url, StatusCode::NOT_MODIFIED, &HeaderMap::new(), Bytes::new()),
            StoreOutcome::Skipped
        );
        assert!(cache.lookup(url).is_some());

        assert_eq!(
            cache.consider_store(url, StatusCode::OK, &HeaderMap::new(), Bytes::new()),
            StoreOutcome::Cleared
        );
        assert!(cache.is_empty());
    }

    #[test]
    fn test_reader_keeps_old_entry_after_replacement() {
        let cache = ResponseCache::new();
        let url = "http://localhost/orders";
        cache.consider_store(url, StatusCode::OK, &headers(&[("etag", "\"v1\"")]), Bytes::new());
        let held = cache.lookup(url).unwrap();

        cache.consider_store(
            url,
            StatusCode::OK,
            &headers(&[("etag", "\"v2\""), ("cache-control", "max-age=5")]),
            Bytes::new(),
        );

        assert_eq!(held.validators.etag, Some(HeaderValue::from_static("\"v1\"")));
        assert_eq!(held.freshness.max_age, None);
    }
}
