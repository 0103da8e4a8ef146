//! One simulated user's view of the service under test.
//!
//! A [`Session`] resolves paths against the base URL, builds GET, POST and
//! DELETE requests, and hands them to its [`RequestExecutor`]. GET requests
//! go through the [`ResponseCache`]: a stored entry adds conditional headers
//! before the executor runs, a 304 answer is handed back carrying the stored
//! body, and a 200 answer may refresh the entry after the executor has timed
//! it.

use std::collections::BTreeMap;
use std::sync::Arc;

use reqwest::{StatusCode, Url};
use tracing::debug;

use crate::cache::ResponseCache;
use crate::client::build_client;
use crate::config::SessionConfig;
use crate::errors::Error;
use crate::executor::RequestExecutor;
use crate::metrics::{
    CACHE_CONDITIONAL_REQUESTS_TOTAL, CACHE_LOCAL_HITS_TOTAL, CACHE_STORE_DECISIONS_TOTAL,
};
use crate::response::TimedResponse;

pub struct Session {
    base: Url,
    client: reqwest::Client,
    executor: RequestExecutor,
    cache: Arc<ResponseCache>,
    allow_local_freshness: bool,
}

impl Session {
    /// Creates a session with its own cookie jar and a private cache.
    pub fn new(
        base_url: &str,
        config: &SessionConfig,
    ) -> Result<Self, Box<dyn std::error::Error + Send + Sync>> {
        Self::with_cache(base_url, config, Arc::new(ResponseCache::new()))
    }

    /// Creates a session whose GET cache is shared with other sessions.
    pub fn with_cache(
        base_url: &str,
        config: &SessionConfig,
        cache: Arc<ResponseCache>,
    ) -> Result<Self, Box<dyn std::error::Error + Send + Sync>> {
        let base = Url::parse(base_url).map_err(|source| Error::InvalidUrl {
            path: base_url.to_string(),
            source,
        })?;
        let client = build_client(&config.to_client_config())?;
        Ok(Self::from_parts(base, client, config, cache))
    }

    /// Assembles a session around an already built client.
    pub fn from_parts(
        base: Url,
        client: reqwest::Client,
        config: &SessionConfig,
        cache: Arc<ResponseCache>,
    ) -> Self {
        let executor = RequestExecutor::new(
            client.clone(),
            config.retirement_threshold,
            config.retry_interval,
        );
        Self {
            base,
            client,
            executor,
            cache,
            allow_local_freshness: config.allow_local_freshness,
        }
    }

    pub fn is_retired(&self) -> bool {
        self.executor.is_retired()
    }

    pub fn cache(&self) -> &Arc<ResponseCache> {
        &self.cache
    }

    pub async fn get(&mut self, path: &str, params: &[(&str, &str)]) -> Result<TimedResponse, Error> {
        if self.is_retired() {
            return Err(Error::AlreadyRetired);
        }

        let url = self.resolve(path, params)?;
        let key = url.to_string();
        let mut request = self.client.get(url).build().map_err(Error::Request)?;

        let cached = self.cache.lookup(&key);
        if let Some(entry) = &cached {
            if self.allow_local_freshness && entry.is_fresh() {
                CACHE_LOCAL_HITS_TOTAL.inc();
                debug!(url = %key, "Serving locally fresh cache entry");
                return Ok(TimedResponse::not_modified_from_cache(entry.body.clone()));
            }
            entry.apply_to_request(&mut request);
            CACHE_CONDITIONAL_REQUESTS_TOTAL.inc();
        }

        let mut response = self.executor.execute(request).await?;

        if let Some(entry) = &cached {
            response.fill_from_cache(entry.body.clone());
        }
        if response.status == StatusCode::OK {
            let outcome = self.cache.consider_store(
                &key,
                response.status,
                &response.headers,
                response.body.clone(),
            );
            CACHE_STORE_DECISIONS_TOTAL
                .with_label_values(&[outcome.label()])
                .inc();
        }

        Ok(response)
    }

    /// Sends `params` as an `application/x-www-form-urlencoded` body.
    pub async fn post(&mut self, path: &str, params: &[(&str, &str)]) -> Result<TimedResponse, Error> {
        if self.is_retired() {
            return Err(Error::AlreadyRetired);
        }

        let url = self.join(path)?;
        let request = self
            .client
            .post(url)
            .form(params)
            .build()
            .map_err(Error::Request)?;
        self.executor.execute(request).await
    }

    pub async fn delete(&mut self, path: &str, params: &[(&str, &str)]) -> Result<TimedResponse, Error> {
        if self.is_retired() {
            return Err(Error::AlreadyRetired);
        }

        let url = self.resolve(path, params)?;
        let request = self.client.delete(url).build().map_err(Error::Request)?;
        self.executor.execute(request).await
    }

    fn join(&self, path: &str) -> Result<Url, Error> {
        self.base.join(path).map_err(|source| Error::InvalidUrl {
            path: path.to_string(),
            source,
        })
    }

    /// Joins `path` and merges `params` into its query string.
    ///
    /// Keys already present in `path` replace caller params with the same
    /// key. Keys are emitted in sorted order so equal requests map to the same
    /// cache key.
    pub fn resolve(&self, path: &str, params: &[(&str, &str)]) -> Result<Url, Error> {
        let mut url = self.join(path)?;

        let mut merged: BTreeMap<String, Vec<String>> = BTreeMap::new();
        for (k, v) in params {
            merged.entry((*k).to_string()).or_default().push((*v).to_string());
        }
        let mut from_path: BTreeMap<String, Vec<String>> = BTreeMap::new();
        for (k, v) in url.query_pairs() {
            from_path.entry(k.into_owned()).or_default().push(v.into_owned());
        }
        merged.extend(from_path);

        if merged.is_empty() {
            url.set_query(None);
        } else {
            let mut pairs = url.query_pairs_mut();
            pairs.clear();
            for (k, values) in &merged {
                for v in values {
                    pairs.append_pair(k, v);
                }
            }
        }

        Ok(url)
    }
}
