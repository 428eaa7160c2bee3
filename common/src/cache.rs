use std::future::Future;
use std::time::Duration;

use chrono::{DateTime, Utc};

/// A value paired with the instant after which it must be fetched again.
#[derive(Debug, Clone, PartialEq)]
pub struct TtlCache<T> {
    value: Option<T>,
    expiry: Option<DateTime<Utc>>,
}

impl<T> Default for TtlCache<T> {
    fn default() -> Self {
        Self {
            value: None,
            expiry: None,
        }
    }
}

/// Where a value returned by [`TtlCache::get_or_fetch`] came from.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Lookup<T> {
    Cached(T),
    Fetched(T),
}

impl<T> Lookup<T> {
    pub fn into_value(self) -> T {
        match self {
            Self::Cached(value) | Self::Fetched(value) => value,
        }
    }

    pub fn is_fresh(&self) -> bool {
        matches!(self, Self::Fetched(_))
    }
}

impl<T: Clone> TtlCache<T> {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_parts(value: Option<T>, expiry: Option<DateTime<Utc>>) -> Self {
        Self { value, expiry }
    }

    /// The cached value if `now` is still before its expiry.
    pub fn get(&self, now: DateTime<Utc>) -> Option<T> {
        match (&self.value, self.expiry) {
            (Some(value), Some(expiry)) if now < expiry => Some(value.clone()),
            _ => None,
        }
    }

    pub fn value(&self) -> Option<&T> {
        self.value.as_ref()
    }

    pub fn expiry(&self) -> Option<DateTime<Utc>> {
        self.expiry
    }

    pub fn fill(&mut self, value: T, now: DateTime<Utc>, ttl: Duration) {
        let ttl = chrono::Duration::from_std(ttl).unwrap_or(chrono::Duration::zero());
        self.value = Some(value);
        self.expiry = Some(now + ttl);
    }

    pub fn invalidate(&mut self) {
        self.expiry = None;
    }

    /// Serves the cached value while valid, otherwise awaits `fetch` once and
    /// stores its result. A failed fetch leaves the cache untouched and is
    /// returned to the caller; a stale value is never substituted.
    pub async fn get_or_fetch<F, Fut, E>(
        &mut self,
        now: DateTime<Utc>,
        ttl: Duration,
        fetch: F,
    ) -> Result<Lookup<T>, E>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T, E>>,
    {
        if let Some(value) = self.get(now) {
            return Ok(Lookup::Cached(value));
        }

        let value = fetch().await?;
        self.fill(value.clone(), now, ttl);
        Ok(Lookup::Fetched(value))
    }
}
