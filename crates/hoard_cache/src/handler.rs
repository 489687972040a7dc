use std::sync::{
    Arc,
    atomic::{AtomicU64, Ordering},
};

use async_trait::async_trait;
use bytes::Bytes;
use dashmap::DashMap;
use hoard_config::CacheConfig;
use http::{Request, StatusCode};
use tracing::{debug, warn};

use crate::{
    capture::{CaptureOutcome, CaptureSink, CapturedResponse},
    entry::CacheEntry,
    key::CacheKey,
    policy::{CacheDecision, CachePolicy},
    sink::{Handler, HandlerError, ResponseSink},
    store::{CacheStore, StoreError},
};

/// Read-through/write-through cache in front of the `next` handler.
///
/// Requests that fail the request-side policy go straight to `next` without
/// touching the store. Eligible requests are replayed from the store when a
/// live entry exists; otherwise `next` runs once through a capture and the
/// result is stored if the response-side policy allows it. Storage faults are
/// logged and never reach the caller.
///
/// Store writes run on a spawned task. Until a write finishes, its entry is
/// served from `pending` so later requests for the key still hit.
pub struct CacheHandler<N> {
    config: Arc<CacheConfig>,
    store: Arc<dyn CacheStore>,
    pending: Arc<DashMap<CacheKey, PendingWrite>>,
    write_seq: AtomicU64,
    next: N,
}

struct PendingWrite {
    seq: u64,
    entry: CacheEntry,
}

impl<N: Handler> CacheHandler<N> {
    pub fn new(config: Arc<CacheConfig>, store: Arc<dyn CacheStore>, next: N) -> Self {
        Self {
            config,
            store,
            pending: Arc::new(DashMap::new()),
            write_seq: AtomicU64::new(0),
            next,
        }
    }

    pub fn config(&self) -> &CacheConfig {
        &self.config
    }

    pub fn store(&self) -> &Arc<dyn CacheStore> {
        &self.store
    }

    /// Drop the stored entry for the key `req` maps to.
    pub async fn purge<B>(&self, req: &Request<B>) -> Result<(), StoreError> {
        let key = CacheKey::from_request(req);
        self.pending.remove(&key);
        self.store.purge(&key).await?;
        debug!(target: "hoard::cache", cache_key = %key, "Purged entry");
        Ok(())
    }

    /// Number of store writes that have not finished yet.
    pub fn pending_writes(&self) -> usize {
        self.pending.len()
    }

    async fn lookup(&self, key: &CacheKey) -> Option<CacheEntry> {
        let in_flight = self
            .pending
            .get(key)
            .map(|p| p.entry.clone())
            .filter(|entry| !entry.is_expired());
        if in_flight.is_some() {
            return in_flight;
        }

        match self.store.get(key).await {
            Ok(Some(entry)) if !entry.is_expired() => Some(entry),
            Ok(Some(_)) => {
                debug!(target: "hoard::cache", cache_key = %key, "Entry expired");
                None
            }
            Ok(None) => None,
            Err(e) => {
                warn!(
                    target: "hoard::cache",
                    cache_key = %key,
                    error = %e,
                    "Cache read failed; treating as miss"
                );
                None
            }
        }
    }

    fn store_response(&self, key: CacheKey, captured: CapturedResponse) {
        let decision =
            CachePolicy::evaluate_response(captured.status, &captured.headers, &self.config);

        let ttl = match decision {
            CacheDecision::Store(ttl) => ttl,
            CacheDecision::Skip(reason) => {
                debug!(target: "hoard::cache", cache_key = %key, ?reason, "Cache skip");
                return;
            }
        };

        let bytes = captured.body.len();
        let entry = CacheEntry::new(captured.status, captured.headers, captured.body, ttl);
        let seq = self.write_seq.fetch_add(1, Ordering::Relaxed);
        self.pending.insert(
            key.clone(),
            PendingWrite {
                seq,
                entry: entry.clone(),
            },
        );

        let store = self.store.clone();
        let pending = self.pending.clone();
        tokio::spawn(async move {
            let key_text = key.to_string();
            match store.put(key.clone(), entry, ttl).await {
                Ok(()) => debug!(
                    target: "hoard::cache",
                    cache_key = %key_text,
                    bytes,
                    ttl_secs = ttl.as_secs(),
                    "Cached response"
                ),
                Err(e) => warn!(
                    target: "hoard::cache",
                    cache_key = %key_text,
                    error = %e,
                    "Cache write failed; response already served"
                ),
            }
            // A newer write for the same key keeps its slot.
            pending.remove_if(&key, |_, p| p.seq == seq);
        });
    }
}

/// Write a stored entry back exactly as it was captured.
async fn replay(
    entry: &CacheEntry,
    sink: &mut dyn ResponseSink,
) -> Result<StatusCode, HandlerError> {
    let headers = sink.headers_mut();
    for (name, value) in entry.headers.iter() {
        headers.append(name.clone(), value.clone());
    }
    sink.write_head(entry.status).await?;
    if !entry.body.is_empty() {
        sink.write_body(entry.body.clone()).await?;
    }
    Ok(entry.status)
}

#[async_trait]
impl<N: Handler> Handler for CacheHandler<N> {
    async fn serve(
        &self,
        req: &Request<Bytes>,
        sink: &mut dyn ResponseSink,
    ) -> Result<StatusCode, HandlerError> {
        if let Err(reason) = CachePolicy::check_request(req.method(), req.uri().path(), &self.config)
        {
            debug!(
                target: "hoard::cache",
                method = %req.method(),
                path = %req.uri().path(),
                ?reason,
                "Cache bypass"
            );
            return self.next.serve(req, sink).await;
        }

        let key = CacheKey::from_request(req);

        if let Some(entry) = self.lookup(&key).await {
            debug!(target: "hoard::cache", cache_key = %key, status = %entry.status, "Cache hit");
            return replay(&entry, sink).await;
        }

        debug!(target: "hoard::cache", cache_key = %key, "Cache miss");

        let limit = self
            .config
            .max_object_bytes()
            .map(|b| usize::try_from(b).unwrap_or(usize::MAX));
        let mut capture = CaptureSink::new(sink, limit);

        let status = match self.next.serve(req, &mut capture).await {
            Ok(status) => status,
            Err(e) => {
                debug!(
                    target: "hoard::cache",
                    cache_key = %key,
                    error = %e,
                    "Request failed; not caching"
                );
                return Err(e);
            }
        };

        capture.ensure_head(status).await?;

        match capture.finish() {
            CaptureOutcome::Complete(captured) => self.store_response(key, captured),
            CaptureOutcome::TooLarge { limit } => debug!(
                target: "hoard::cache",
                cache_key = %key,
                max_bytes = limit,
                "Cache skip: object too large"
            ),
            CaptureOutcome::Aborted => debug!(
                target: "hoard::cache",
                cache_key = %key,
                "Cache skip: response not fully delivered"
            ),
        }

        Ok(status)
    }
}

#[cfg(test)]
mod tests {
    use std::{
        sync::{
            Arc,
            atomic::{AtomicUsize, Ordering},
        },
        time::Duration,
    };

    use anyhow::anyhow;
    use async_trait::async_trait;
    use bytes::Bytes;
    use hoard_config::CacheConfig;
    use http::{HeaderMap, HeaderValue, Method, Request, StatusCode};

    use super::CacheHandler;
    use crate::{
        entry::CacheEntry,
        key::CacheKey,
        sink::{BufferedSink, Handler, HandlerError, ResponseSink},
        store::{CacheStore, MemoryStore, StoreError},
    };

    /// Origin that records how often it runs.
    #[derive(Default)]
    struct TestOrigin {
        times_called: AtomicUsize,
        status: Option<StatusCode>,
        headers: Vec<(&'static str, &'static str)>,
        body: &'static [u8],
        fail: bool,
        fail_after_write: bool,
    }

    impl TestOrigin {
        fn ok() -> Self {
            Self {
                body: b"hello from origin",
                ..Self::default()
            }
        }

        fn with_headers(headers: Vec<(&'static str, &'static str)>) -> Self {
            Self {
                headers,
                ..Self::ok()
            }
        }

        fn calls(&self) -> usize {
            self.times_called.load(Ordering::SeqCst)
        }
    }

    #[async_trait]
    impl Handler for TestOrigin {
        async fn serve(
            &self,
            _req: &Request<Bytes>,
            sink: &mut dyn ResponseSink,
        ) -> Result<StatusCode, HandlerError> {
            self.times_called.fetch_add(1, Ordering::SeqCst);
            if self.fail {
                return Err(HandlerError::origin(
                    StatusCode::BAD_GATEWAY,
                    anyhow!("upstream unreachable"),
                ));
            }
            for &(name, value) in &self.headers {
                sink.headers_mut()
                    .append(name, HeaderValue::from_static(value));
            }
            let status = self.status.unwrap_or(StatusCode::OK);
            sink.write_head(status).await?;
            sink.write_body(Bytes::from_static(self.body)).await?;
            if self.fail_after_write {
                return Err(HandlerError::origin(
                    StatusCode::BAD_GATEWAY,
                    anyhow!("upstream reset mid-body"),
                ));
            }
            Ok(status)
        }
    }

    /// Store whose reads and/or writes always fail.
    struct FlakyStore {
        inner: MemoryStore,
        fail_reads: bool,
        fail_writes: bool,
    }

    #[async_trait]
    impl CacheStore for FlakyStore {
        async fn get(&self, key: &CacheKey) -> Result<Option<CacheEntry>, StoreError> {
            if self.fail_reads {
                return Err(StoreError::Unavailable("read refused".into()));
            }
            self.inner.get(key).await
        }

        async fn put(
            &self,
            key: CacheKey,
            entry: CacheEntry,
            ttl: Duration,
        ) -> Result<(), StoreError> {
            if self.fail_writes {
                return Err(StoreError::Unavailable("write refused".into()));
            }
            self.inner.put(key, entry, ttl).await
        }

        async fn purge(&self, key: &CacheKey) -> Result<(), StoreError> {
            self.inner.purge(key).await
        }
    }

    /// Store whose writes take `delay` to land.
    struct SlowStore {
        inner: MemoryStore,
        delay: Duration,
    }

    #[async_trait]
    impl CacheStore for SlowStore {
        async fn get(&self, key: &CacheKey) -> Result<Option<CacheEntry>, StoreError> {
            self.inner.get(key).await
        }

        async fn put(
            &self,
            key: CacheKey,
            entry: CacheEntry,
            ttl: Duration,
        ) -> Result<(), StoreError> {
            tokio::time::sleep(self.delay).await;
            self.inner.put(key, entry, ttl).await
        }

        async fn purge(&self, key: &CacheKey) -> Result<(), StoreError> {
            self.inner.purge(key).await
        }
    }

    /// Wait for spawned store writes to finish.
    async fn settle<N: Handler>(handler: &CacheHandler<N>) {
        for _ in 0..400 {
            if handler.pending_writes() == 0 {
                return;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        panic!("store writes did not settle");
    }

    fn build_handler(
        cacheable_path: &str,
        origin: TestOrigin,
    ) -> (CacheHandler<Arc<TestOrigin>>, Arc<TestOrigin>, Arc<MemoryStore>) {
        let origin = Arc::new(origin);
        let store = Arc::new(MemoryStore::new());
        let handler = CacheHandler::new(
            Arc::new(CacheConfig::new([cacheable_path], 10)),
            store.clone(),
            origin.clone(),
        );
        (handler, origin, store)
    }

    fn request(method: Method, uri: &str) -> Request<Bytes> {
        Request::builder()
            .method(method)
            .uri(uri)
            .body(Bytes::new())
            .expect("request")
    }

    fn get(uri: &str) -> Request<Bytes> {
        request(Method::GET, uri)
    }

    async fn serve(handler: &impl Handler, req: &Request<Bytes>) -> BufferedSink {
        let mut sink = BufferedSink::new();
        handler.serve(req, &mut sink).await.expect("request served");
        sink
    }

    #[tokio::test]
    async fn basic_cache_replays_identical_response() {
        let (handler, origin, _) = build_handler(
            "/assets",
            TestOrigin::with_headers(vec![("content-type", "text/plain")]),
        );
        let req = get("http://somehost.com/assets/1");

        let first = serve(&handler, &req).await;
        let second = serve(&handler, &req).await;

        assert_eq!(origin.calls(), 1);
        assert_eq!(first.status(), second.status());
        assert_eq!(first.headers(), second.headers());
        assert_eq!(first.body(), second.body());
        assert_eq!(second.body(), b"hello from origin");
    }

    #[tokio::test]
    async fn not_cacheable_path() {
        let (handler, origin, store) = build_handler("/assets", TestOrigin::ok());
        let req = get("http://somehost.com/api/1");

        serve(&handler, &req).await;
        serve(&handler, &req).await;

        assert_eq!(origin.calls(), 2);
        assert!(store.is_empty());
    }

    #[tokio::test]
    async fn not_cacheable_method() {
        let (handler, origin, store) = build_handler("/assets", TestOrigin::ok());

        for method in [Method::POST, Method::PUT, Method::DELETE] {
            let req = request(method, "http://somehost.com/assets/some.jpg");
            serve(&handler, &req).await;
            serve(&handler, &req).await;
        }

        assert_eq!(origin.calls(), 6);
        assert!(store.is_empty());
    }

    #[tokio::test]
    async fn not_cacheable_cache_control() {
        let (handler, origin, _) = build_handler(
            "/assets",
            TestOrigin::with_headers(vec![("cache-control", "private")]),
        );
        let req = get("http://somehost.com/assets/1");

        serve(&handler, &req).await;
        serve(&handler, &req).await;

        assert_eq!(origin.calls(), 2);
    }

    #[tokio::test]
    async fn no_store_is_not_cached() {
        let (handler, origin, _) = build_handler(
            "/assets",
            TestOrigin::with_headers(vec![("cache-control", "public, No-Store")]),
        );
        let req = get("http://somehost.com/assets/1");

        serve(&handler, &req).await;
        serve(&handler, &req).await;

        assert_eq!(origin.calls(), 2);
    }

    #[tokio::test]
    async fn adds_same_headers_as_origin() {
        let origin_headers = vec![
            ("content-type", "text/plain; charset=utf-8"),
            ("x-custom-2", "bar"),
            ("x-custom-2", "baz"),
            ("x-custom", "foo"),
            ("x-custom", "bar"),
            ("x-custom", "baz"),
        ];
        let mut expected = HeaderMap::new();
        for &(name, value) in &origin_headers {
            expected.append(name, HeaderValue::from_static(value));
        }

        let (handler, origin, _) =
            build_handler("/assets", TestOrigin::with_headers(origin_headers));
        let req = get("http://somehost.com/assets/1");

        let live = serve(&handler, &req).await;
        let replayed = serve(&handler, &req).await;

        assert_eq!(origin.calls(), 1);
        assert_eq!(live.headers(), &expected);
        assert_eq!(replayed.headers(), &expected);
        let values: Vec<_> = replayed.headers().get_all("x-custom").iter().collect();
        assert_eq!(values, ["foo", "bar", "baz"]);
    }

    #[tokio::test]
    async fn default_cache_time() {
        let (handler, _, store) = build_handler("/assets", TestOrigin::ok());
        let req = get("http://somehost.com/assets/1");
        serve(&handler, &req).await;
        settle(&handler).await;

        let entry = store
            .get(&CacheKey::from_request(&req))
            .await
            .expect("get")
            .expect("entry stored");
        assert_eq!(entry.ttl(), Duration::from_secs(10));
        assert_eq!(entry.expires_at, entry.stored_at + Duration::from_secs(10));
    }

    #[tokio::test]
    async fn max_age_overrides_default_time() {
        let (handler, _, store) = build_handler(
            "/assets",
            TestOrigin::with_headers(vec![("cache-control", "public, max-age=120")]),
        );
        let req = get("http://somehost.com/assets/1");
        serve(&handler, &req).await;
        settle(&handler).await;

        let entry = store
            .get(&CacheKey::from_request(&req))
            .await
            .expect("get")
            .expect("entry stored");
        assert_eq!(entry.ttl(), Duration::from_secs(120));
    }

    #[tokio::test]
    async fn malformed_max_age_is_not_cached() {
        for value in ["max-age=0", "max-age=later"] {
            let (handler, origin, store) = build_handler(
                "/assets",
                TestOrigin::with_headers(vec![("cache-control", value)]),
            );
            let req = get("http://somehost.com/assets/1");
            serve(&handler, &req).await;
            serve(&handler, &req).await;

            assert_eq!(origin.calls(), 2, "{value}");
            assert!(store.is_empty(), "{value}");
        }
    }

    #[tokio::test]
    async fn expired_entry_invokes_origin_again() {
        let origin = Arc::new(TestOrigin::ok());
        let handler = CacheHandler::new(
            Arc::new(CacheConfig::new(["/assets"], 1)),
            Arc::new(MemoryStore::new()),
            origin.clone(),
        );
        let req = get("http://somehost.com/assets/1");

        serve(&handler, &req).await;
        serve(&handler, &req).await;
        assert_eq!(origin.calls(), 1);

        tokio::time::sleep(Duration::from_millis(1100)).await;
        serve(&handler, &req).await;
        assert_eq!(origin.calls(), 2);
    }

    #[tokio::test]
    async fn origin_failure_is_propagated_and_not_cached() {
        let (handler, origin, store) = build_handler(
            "/assets",
            TestOrigin {
                fail: true,
                ..TestOrigin::ok()
            },
        );
        let req = get("http://somehost.com/assets/1");

        for _ in 0..2 {
            let mut sink = BufferedSink::new();
            let err = handler.serve(&req, &mut sink).await.unwrap_err();
            assert!(matches!(err, HandlerError::Origin { .. }));
            assert_eq!(err.status(), StatusCode::BAD_GATEWAY);
        }

        assert_eq!(origin.calls(), 2);
        assert!(store.is_empty());
    }

    #[tokio::test]
    async fn server_error_status_is_served_but_not_cached() {
        let (handler, origin, store) = build_handler(
            "/assets",
            TestOrigin {
                status: Some(StatusCode::SERVICE_UNAVAILABLE),
                ..TestOrigin::ok()
            },
        );
        let req = get("http://somehost.com/assets/1");

        let sink = serve(&handler, &req).await;
        serve(&handler, &req).await;

        assert_eq!(sink.status(), StatusCode::SERVICE_UNAVAILABLE);
        assert_eq!(origin.calls(), 2);
        assert!(store.is_empty());
    }

    #[tokio::test]
    async fn client_errors_are_cached_like_any_response() {
        let (handler, origin, _) = build_handler(
            "/assets",
            TestOrigin {
                status: Some(StatusCode::NOT_FOUND),
                ..TestOrigin::ok()
            },
        );
        let req = get("http://somehost.com/assets/missing");

        serve(&handler, &req).await;
        let replayed = serve(&handler, &req).await;

        assert_eq!(origin.calls(), 1);
        assert_eq!(replayed.status(), StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn store_read_failure_fails_open() {
        let origin = Arc::new(TestOrigin::ok());
        let store = Arc::new(FlakyStore {
            inner: MemoryStore::new(),
            fail_reads: true,
            fail_writes: false,
        });
        let handler = CacheHandler::new(
            Arc::new(CacheConfig::new(["/assets"], 10)),
            store,
            origin.clone(),
        );
        let req = get("http://somehost.com/assets/1");

        let first = serve(&handler, &req).await;
        settle(&handler).await;
        let second = serve(&handler, &req).await;

        assert_eq!(origin.calls(), 2);
        assert_eq!(first.body(), second.body());
    }

    #[tokio::test]
    async fn store_write_failure_is_not_surfaced() {
        let origin = Arc::new(TestOrigin::ok());
        let store = Arc::new(FlakyStore {
            inner: MemoryStore::new(),
            fail_reads: false,
            fail_writes: true,
        });
        let handler = CacheHandler::new(
            Arc::new(CacheConfig::new(["/assets"], 10)),
            store,
            origin.clone(),
        );
        let req = get("http://somehost.com/assets/1");

        let sink = serve(&handler, &req).await;
        assert_eq!(sink.status(), StatusCode::OK);
        assert_eq!(sink.body(), b"hello from origin");

        settle(&handler).await;
        serve(&handler, &req).await;
        assert_eq!(origin.calls(), 2);
    }

    #[tokio::test]
    async fn oversized_response_is_not_cached() {
        let origin = Arc::new(TestOrigin::ok());
        let store = Arc::new(MemoryStore::new());
        let handler = CacheHandler::new(
            Arc::new(CacheConfig::new(["/assets"], 10).with_max_object_bytes(4)),
            store.clone(),
            origin.clone(),
        );
        let req = get("http://somehost.com/assets/1");

        let sink = serve(&handler, &req).await;
        serve(&handler, &req).await;

        assert_eq!(sink.body(), b"hello from origin");
        assert_eq!(origin.calls(), 2);
        assert!(store.is_empty());
    }

    #[tokio::test]
    async fn aborted_delivery_is_not_cached() {
        struct ClosedSink(HeaderMap);

        #[async_trait]
        impl ResponseSink for ClosedSink {
            fn headers_mut(&mut self) -> &mut HeaderMap {
                &mut self.0
            }

            async fn write_head(&mut self, _status: StatusCode) -> std::io::Result<()> {
                Ok(())
            }

            async fn write_body(&mut self, _chunk: Bytes) -> std::io::Result<()> {
                Err(std::io::Error::from(std::io::ErrorKind::ConnectionReset))
            }
        }

        let (handler, origin, store) = build_handler("/assets", TestOrigin::ok());
        let req = get("http://somehost.com/assets/1");

        let mut closed = ClosedSink(HeaderMap::new());
        let err = handler.serve(&req, &mut closed).await.unwrap_err();
        assert!(matches!(err, HandlerError::Sink(_)));
        assert!(store.is_empty());

        serve(&handler, &req).await;
        assert_eq!(origin.calls(), 2);
    }

    #[tokio::test]
    async fn purge_forces_a_fresh_miss() {
        let (handler, origin, _) = build_handler("/assets", TestOrigin::ok());
        let req = get("http://somehost.com/assets/1");

        serve(&handler, &req).await;
        settle(&handler).await;
        handler.purge(&req).await.expect("purge");
        serve(&handler, &req).await;

        assert_eq!(origin.calls(), 2);
    }

    #[tokio::test]
    async fn purge_drops_a_write_still_in_flight() {
        let origin = Arc::new(TestOrigin::ok());
        let handler = CacheHandler::new(
            Arc::new(CacheConfig::new(["/assets"], 10)),
            Arc::new(SlowStore {
                inner: MemoryStore::new(),
                delay: Duration::from_millis(200),
            }),
            origin.clone(),
        );
        let req = get("http://somehost.com/assets/1");

        serve(&handler, &req).await;
        handler.purge(&req).await.expect("purge");
        serve(&handler, &req).await;

        assert_eq!(origin.calls(), 2);
    }

    #[tokio::test]
    async fn response_does_not_wait_for_store_write() {
        let origin = Arc::new(TestOrigin::ok());
        let store = Arc::new(SlowStore {
            inner: MemoryStore::new(),
            delay: Duration::from_millis(800),
        });
        let handler = CacheHandler::new(
            Arc::new(CacheConfig::new(["/assets"], 10)),
            store.clone(),
            origin.clone(),
        );
        let req = get("http://somehost.com/assets/1");

        let started = std::time::Instant::now();
        let first = serve(&handler, &req).await;
        assert!(started.elapsed() < Duration::from_millis(400));
        assert_eq!(first.body(), b"hello from origin");
        assert_eq!(handler.pending_writes(), 1);

        // The in-flight entry already serves hits.
        let second = serve(&handler, &req).await;
        assert_eq!(origin.calls(), 1);
        assert_eq!(first.headers(), second.headers());
        assert_eq!(first.body(), second.body());

        settle(&handler).await;
        assert_eq!(store.inner.len(), 1);
    }

    #[tokio::test]
    async fn origin_failure_after_writing_is_not_cached() {
        let (handler, origin, store) = build_handler(
            "/assets",
            TestOrigin {
                fail_after_write: true,
                ..TestOrigin::ok()
            },
        );
        let req = get("http://somehost.com/assets/1");

        let mut sink = BufferedSink::new();
        let err = handler.serve(&req, &mut sink).await.unwrap_err();
        assert_eq!(err.status(), StatusCode::BAD_GATEWAY);
        assert_eq!(sink.body(), b"hello from origin");
        assert_eq!(handler.pending_writes(), 0);

        let mut sink = BufferedSink::new();
        handler.serve(&req, &mut sink).await.unwrap_err();

        assert_eq!(origin.calls(), 2);
        assert!(store.is_empty());
    }
}
