//! Response cache over an [`HttpCarrier`].
//!
//! Successful GET responses carrying a positive `Cache-Control: max-age` are
//! kept, in memory or in a fjall partition, and served until they expire.
//! Error responses are never cached; the origin marks them
//! `no-cache, max-age=0`. The `QUARRY_LOG_CACHE` environment variable turns
//! on per-lookup diagnostics.

use std::collections::HashMap;
use std::path::PathBuf;
use std::str::FromStr;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::{SystemTime, UNIX_EPOCH};

use async_trait::async_trait;
use bytes::Bytes;
use http::header::{HeaderName, HeaderValue, CACHE_CONTROL};
use http::{Method, Response};
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::transport::{CarrierRequest, CarrierResponse, HttpCarrier};

const LOG_CACHE_ENV: &str = "QUARRY_LOG_CACHE";
const CACHE_PARTITION: &str = "http_cache";

/// Where cached responses live: process memory or a fjall keyspace on disk.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum CacheMode {
    Mem,
    Disk(PathBuf),
}

impl FromStr for CacheMode {
    type Err = String;

    fn from_str(raw: &str) -> Result<Self, Self::Err> {
        if raw == "mem" {
            return Ok(CacheMode::Mem);
        }
        if let Some(dir) = raw.strip_prefix("disk:") {
            if dir.is_empty() {
                return Err(String::from("disk cache mode requires a directory"));
            }
            return Ok(CacheMode::Disk(PathBuf::from(dir)));
        }
        Err(format!("unknown cache mode {raw:?}, expected mem or disk:<dir>"))
    }
}

#[derive(Serialize, Deserialize)]
struct CachedResponse {
    status: u16,
    headers: Vec<(String, String)>,
    body: Vec<u8>,
    expires_unix_ms: u64,
}

enum CacheStore {
    Mem(Mutex<HashMap<String, CachedResponse>>),
    Disk {
        // Keeps the keyspace alive for the partition's lifetime.
        _keyspace: fjall::Keyspace,
        partition: fjall::PartitionHandle,
    },
}

pub struct CachingCarrier {
    inner: Arc<dyn HttpCarrier>,
    store: CacheStore,
    verbose: bool,
}

impl CachingCarrier {
    pub fn new(inner: Arc<dyn HttpCarrier>, mode: CacheMode) -> anyhow::Result<Self> {
        let store = match mode {
            CacheMode::Mem => CacheStore::Mem(Mutex::new(HashMap::new())),
            CacheMode::Disk(dir) => {
                let keyspace = fjall::Config::new(&dir).open()?;
                let partition = keyspace
                    .open_partition(CACHE_PARTITION, fjall::PartitionCreateOptions::default())?;
                CacheStore::Disk {
                    _keyspace: keyspace,
                    partition,
                }
            }
        };
        Ok(Self {
            inner,
            store,
            verbose: std::env::var(LOG_CACHE_ENV).is_ok(),
        })
    }

    fn lookup(&self, key: &str) -> Option<CachedResponse> {
        let now = unix_time_ms();
        match &self.store {
            CacheStore::Mem(map) => {
                let mut map = lock(map);
                match map.get(key) {
                    Some(entry) if entry.expires_unix_ms > now => Some(CachedResponse {
                        status: entry.status,
                        headers: entry.headers.clone(),
                        body: entry.body.clone(),
                        expires_unix_ms: entry.expires_unix_ms,
                    }),
                    Some(_) => {
                        map.remove(key);
                        None
                    }
                    None => None,
                }
            }
            CacheStore::Disk { partition, .. } => {
                let raw = partition.get(key).ok().flatten()?;
                let entry: CachedResponse = serde_json::from_slice(&raw).ok()?;
                if entry.expires_unix_ms > now {
                    Some(entry)
                } else {
                    if let Err(err) = partition.remove(key) {
                        warn!(error = ?err, "evicting expired cache entry failed");
                    }
                    None
                }
            }
        }
    }

    fn insert(&self, key: &str, entry: CachedResponse) {
        match &self.store {
            CacheStore::Mem(map) => {
                lock(map).insert(key.to_string(), entry);
            }
            CacheStore::Disk { partition, .. } => {
                match serde_json::to_vec(&entry) {
                    Ok(raw) => {
                        if let Err(err) = partition.insert(key, raw) {
                            warn!(error = ?err, "writing cache entry failed");
                        }
                    }
                    Err(err) => warn!(error = ?err, "encoding cache entry failed"),
                }
            }
        }
    }
}

#[async_trait]
impl HttpCarrier for CachingCarrier {
    async fn round_trip(&self, req: CarrierRequest) -> anyhow::Result<CarrierResponse> {
        if req.method() != Method::GET {
            return self.inner.round_trip(req).await;
        }
        let key = req.uri().to_string();
        if let Some(entry) = self.lookup(&key) {
            if self.verbose {
                debug!(key = %key, "cache hit");
            }
            return rebuild(entry);
        }
        if self.verbose {
            debug!(key = %key, "cache miss");
        }

        let resp = self.inner.round_trip(req).await?;
        if (200..400).contains(&resp.status().as_u16()) {
            if let Some(max_age_secs) = max_age(&resp) {
                let entry = CachedResponse {
                    status: resp.status().as_u16(),
                    headers: resp
                        .headers()
                        .iter()
                        .filter_map(|(name, value)| {
                            value
                                .to_str()
                                .ok()
                                .map(|value| (name.to_string(), value.to_string()))
                        })
                        .collect(),
                    body: resp.body().to_vec(),
                    expires_unix_ms: unix_time_ms() + max_age_secs * 1000,
                };
                if self.verbose {
                    debug!(key = %key, max_age_secs, "caching response");
                }
                self.insert(&key, entry);
            }
        }
        Ok(resp)
    }
}

fn rebuild(entry: CachedResponse) -> anyhow::Result<CarrierResponse> {
    let mut response = Response::builder().status(entry.status);
    if let Some(headers) = response.headers_mut() {
        for (name, value) in &entry.headers {
            if let (Ok(name), Ok(value)) = (
                HeaderName::from_str(name),
                HeaderValue::from_str(value),
            ) {
                headers.insert(name, value);
            }
        }
    }
    Ok(response.body(Bytes::from(entry.body))?)
}

/// Positive `max-age` of a cacheable response; `None` when uncacheable.
fn max_age(resp: &CarrierResponse) -> Option<u64> {
    let value = resp.headers().get(CACHE_CONTROL)?.to_str().ok()?;
    if value.contains("no-cache") || value.contains("no-store") {
        return None;
    }
    for directive in value.split(',') {
        if let Some(secs) = directive.trim().strip_prefix("max-age=") {
            return secs.parse::<u64>().ok().filter(|secs| *secs > 0);
        }
    }
    None
}

fn unix_time_ms() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|elapsed| elapsed.as_millis().min(u128::from(u64::MAX)) as u64)
        .unwrap_or(0)
}

fn lock<'a, T>(mutex: &'a Mutex<T>) -> MutexGuard<'a, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct CountingCarrier {
        hits: AtomicUsize,
        cache_control: &'static str,
        status: u16,
    }

    #[async_trait]
    impl HttpCarrier for CountingCarrier {
        async fn round_trip(&self, _req: CarrierRequest) -> anyhow::Result<CarrierResponse> {
            let serial = self.hits.fetch_add(1, Ordering::SeqCst);
            Ok(Response::builder()
                .status(self.status)
                .header(CACHE_CONTROL, self.cache_control)
                .body(Bytes::from(format!("body-{serial}")))?)
        }
    }

    fn get(uri: &str) -> CarrierRequest {
        http::Request::builder()
            .method(Method::GET)
            .uri(uri)
            .body(Bytes::new())
            .expect("request")
    }

    #[test]
    fn cache_modes_parse() {
        assert_eq!(CacheMode::from_str("mem"), Ok(CacheMode::Mem));
        assert_eq!(
            CacheMode::from_str("disk:/tmp/cache"),
            Ok(CacheMode::Disk(PathBuf::from("/tmp/cache")))
        );
        assert!(CacheMode::from_str("disk:").is_err());
        assert!(CacheMode::from_str("redis").is_err());
    }

    #[tokio::test]
    async fn cacheable_responses_are_served_from_memory() {
        let inner = Arc::new(CountingCarrier {
            hits: AtomicUsize::new(0),
            cache_control: "public, max-age=60",
            status: 200,
        });
        let carrier = CachingCarrier::new(inner.clone(), CacheMode::Mem).expect("carrier");

        let first = carrier
            .round_trip(get("http://n1:7080/k/a"))
            .await
            .expect("first");
        let second = carrier
            .round_trip(get("http://n1:7080/k/a"))
            .await
            .expect("second");
        assert_eq!(first.body(), second.body());
        assert_eq!(inner.hits.load(Ordering::SeqCst), 1);

        // A different URI misses.
        carrier
            .round_trip(get("http://n1:7080/k/b"))
            .await
            .expect("other");
        assert_eq!(inner.hits.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn uncacheable_responses_pass_through() {
        let inner = Arc::new(CountingCarrier {
            hits: AtomicUsize::new(0),
            cache_control: "no-cache, max-age=0",
            status: 200,
        });
        let carrier = CachingCarrier::new(inner.clone(), CacheMode::Mem).expect("carrier");
        carrier.round_trip(get("http://n1:7080/k/a")).await.expect("first");
        carrier.round_trip(get("http://n1:7080/k/a")).await.expect("second");
        assert_eq!(inner.hits.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn disk_cache_survives_reopen() {
        let dir = tempfile::tempdir().expect("tempdir");
        let inner = Arc::new(CountingCarrier {
            hits: AtomicUsize::new(0),
            cache_control: "public, max-age=3600",
            status: 200,
        });
        {
            let carrier =
                CachingCarrier::new(inner.clone(), CacheMode::Disk(dir.path().to_path_buf()))
                    .expect("carrier");
            carrier.round_trip(get("http://n1:7080/k/a")).await.expect("fill");
        }
        let carrier =
            CachingCarrier::new(inner.clone(), CacheMode::Disk(dir.path().to_path_buf()))
                .expect("reopen");
        let resp = carrier
            .round_trip(get("http://n1:7080/k/a"))
            .await
            .expect("cached");
        assert_eq!(resp.body().as_ref(), b"body-0");
        assert_eq!(inner.hits.load(Ordering::SeqCst), 1);
    }
}
