use std::time::Duration;

use reqwest::header::{HeaderMap, HeaderName, HeaderValue};

use crate::errors::{Error, Result};

/// Retry/redirect policy for classified requests.
///
/// 5xx responses are replayed up to `max_retries` times, each after a delay
/// drawn uniformly from `0..=max_delay`. Redirect chains are followed up to
/// `max_redirects` hops.
#[derive(Clone, Debug)]
pub struct RetryConfig {
    pub max_retries: u32,
    pub max_redirects: u32,
    pub max_delay: Duration,
}

impl RetryConfig {
    pub fn disabled() -> Self {
        Self {
            max_retries: 0,
            ..Default::default()
        }
    }

    /// Whether another replay is allowed after `retry_count` retries.
    pub fn allows_retry(&self, retry_count: u32) -> bool {
        retry_count < self.max_retries
    }

    /// Uniform random delay in `0..=max_delay`.
    pub fn retry_delay(&self) -> Duration {
        let max_ms = self.max_delay.as_millis() as u64;
        if max_ms == 0 {
            return Duration::ZERO;
        }
        Duration::from_millis(fastrand::u64(0..=max_ms))
    }

    /// Upper bound on executed requests for one logical call.
    pub(crate) fn max_steps(&self) -> u32 {
        self.max_retries
            .saturating_add(self.max_redirects)
            .saturating_add(1)
    }
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_retries: 5,
            max_redirects: 5,
            max_delay: Duration::from_millis(5000),
        }
    }
}

/// Structured header list with validation.
#[derive(Clone, Debug, Default)]
pub struct HeaderList(Vec<HeaderEntry>);

impl HeaderList {
    pub fn new() -> Self {
        Self(Vec::new())
    }

    /// Add a header entry. Panics if key or value is empty/whitespace-only.
    ///
    /// # Panics
    /// Panics if the header key or value is empty or contains only whitespace.
    pub fn push(&mut self, entry: HeaderEntry) {
        assert!(
            entry.is_valid(),
            "Invalid header: key and value must be non-empty (got key={:?}, value={:?})",
            entry.key,
            entry.value
        );
        self.0.push(entry);
    }

    pub fn with(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.push(HeaderEntry::new(key.into(), value.into()));
        self
    }

    pub fn iter(&self) -> impl Iterator<Item = &HeaderEntry> {
        self.0.iter()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// Convert into a reqwest header map, rejecting invalid names/values.
    pub(crate) fn to_header_map(&self) -> Result<HeaderMap> {
        let mut map = HeaderMap::new();
        for entry in self.iter() {
            if !entry.is_valid() {
                continue;
            }
            let name = HeaderName::from_bytes(entry.key.trim().as_bytes())
                .map_err(|err| Error::Config(format!("invalid header name: {err}")))?;
            let val = HeaderValue::from_str(entry.value.trim())
                .map_err(|err| Error::Config(format!("invalid header value: {err}")))?;
            map.insert(name, val);
        }
        Ok(map)
    }
}

#[derive(Clone, Debug)]
pub struct HeaderEntry {
    pub key: String,
    pub value: String,
}

impl HeaderEntry {
    pub fn new(key: String, value: String) -> Self {
        Self { key, value }
    }

    pub fn is_valid(&self) -> bool {
        !(self.key.trim().is_empty() || self.value.trim().is_empty())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn retry_delay_stays_within_bound() {
        let retry = RetryConfig {
            max_delay: Duration::from_millis(40),
            ..Default::default()
        };
        for _ in 0..100 {
            assert!(retry.retry_delay() <= Duration::from_millis(40));
        }
    }

    #[test]
    fn zero_delay_is_zero() {
        let retry = RetryConfig {
            max_delay: Duration::ZERO,
            ..Default::default()
        };
        assert_eq!(retry.retry_delay(), Duration::ZERO);
    }

    #[test]
    fn default_allows_five_retries() {
        let retry = RetryConfig::default();
        assert!(retry.allows_retry(4));
        assert!(!retry.allows_retry(5));
        assert_eq!(retry.max_steps(), 11);
    }

    #[test]
    fn disabled_never_retries() {
        assert!(!RetryConfig::disabled().allows_retry(0));
    }

    #[test]
    fn header_list_converts_to_map() {
        let list = HeaderList::new().with("X-Custom", "value");
        let map = list.to_header_map().expect("valid headers");
        assert_eq!(map.get("x-custom").unwrap(), "value");
    }

    #[test]
    #[should_panic(expected = "Invalid header")]
    fn header_list_panics_on_empty_key() {
        let mut list = HeaderList::new();
        list.push(HeaderEntry::new("".to_string(), "value".to_string()));
    }

    #[test]
    #[should_panic(expected = "Invalid header")]
    fn header_list_panics_on_whitespace_only() {
        let mut list = HeaderList::new();
        list.push(HeaderEntry::new("   ".to_string(), "value".to_string()));
    }
}
