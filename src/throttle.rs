//! Token-bucket throttle for outbound API calls.
//!
//! Every provider name gets its own bucket, created full on first use and
//! refilled continuously at the provider's configured rate. All buckets live
//! behind a single mutex that is only held for the refill-and-maybe-consume
//! step; callers that find their bucket empty sleep outside the lock and
//! poll again. Waiters are not queued, so whichever one next observes a
//! whole token wins it.

use std::collections::HashMap;
use std::fmt;
use std::future::Future;
use std::sync::{Mutex, MutexGuard, PoisonError};
use std::time::{Duration, Instant};

use serde::Serialize;

use crate::config::ThrottleConfig;
use crate::error::{ConfigError, ThrottleError};

/// How long a waiting caller sleeps between attempts.
pub const POLL_INTERVAL: Duration = Duration::from_millis(10);

// ---------------------------------------------------------------------------
// TokenBucket
// ---------------------------------------------------------------------------

#[derive(Debug)]
struct TokenBucket {
    /// Tokens added per second. Fixed at creation.
    rate: f64,
    /// Fractional between refills; always within `[0, capacity]`.
    tokens: f64,
    last_refill: Instant,
}

impl TokenBucket {
    fn full(rate: f64, capacity: f64, now: Instant) -> Self {
        Self {
            rate,
            tokens: capacity,
            last_refill: now,
        }
    }

    fn refill(&mut self, capacity: f64, now: Instant) {
        // keep last_refill monotonic
        if now <= self.last_refill {
            return;
        }
        let elapsed = now.duration_since(self.last_refill).as_secs_f64();
        self.tokens = (self.tokens + elapsed * self.rate).min(capacity);
        self.last_refill = now;
    }

    fn try_take(&mut self) -> bool {
        if self.tokens >= 1.0 {
            self.tokens -= 1.0;
            true
        } else {
            false
        }
    }

    fn reset(&mut self, capacity: f64, now: Instant) {
        self.tokens = capacity;
        self.last_refill = now;
    }
}

/// Point-in-time view of one provider's bucket.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct BucketSnapshot {
    pub provider: String,
    pub rate_per_sec: f64,
    pub tokens: f64,
    pub capacity: u32,
}

/// Outcome of a single locked attempt.
enum Attempt {
    Granted { remaining: f64 },
    Wait(Duration),
    TimedOut,
}

// ---------------------------------------------------------------------------
// ApiThrottler
// ---------------------------------------------------------------------------

/// Admission control for rate-limited external services.
///
/// Share it between callers as `Arc<ApiThrottler>`. Tokens are never handed
/// back; they only regenerate with time.
pub struct ApiThrottler {
    config: ThrottleConfig,
    buckets: Mutex<HashMap<String, TokenBucket>>,
}

impl ApiThrottler {
    /// Build a throttler from a configuration, rejecting zero capacity and
    /// non-positive rates.
    pub fn new(config: ThrottleConfig) -> Result<Self, ConfigError> {
        config.validate()?;
        Ok(Self::from_validated(config))
    }

    /// Throttler with the stock rates: yfinance 2/s, openai 10/s, anything
    /// else 1/s, capacity 10.
    pub fn with_defaults() -> Self {
        Self::from_validated(ThrottleConfig::default())
    }

    fn from_validated(config: ThrottleConfig) -> Self {
        tracing::info!(
            capacity = config.capacity,
            default_rate = config.fallback_rate(),
            rate_limits = ?config.rate_limits,
            "initialized api throttler"
        );
        Self {
            config,
            buckets: Mutex::new(HashMap::new()),
        }
    }

    pub fn config(&self) -> &ThrottleConfig {
        &self.config
    }

    pub fn capacity(&self) -> u32 {
        self.config.capacity
    }

    /// Sustained rate for `provider`, falling back to the default rate for
    /// names missing from the table.
    pub fn rate_for(&self, provider: &str) -> f64 {
        self.config
            .rate_limits
            .get(provider)
            .copied()
            .unwrap_or_else(|| self.config.fallback_rate())
    }

    /// Names of every provider that has a bucket, sorted.
    pub fn providers(&self) -> Vec<String> {
        let mut names: Vec<String> = self.lock().keys().cloned().collect();
        names.sort();
        names
    }

    // -- core ---------------------------------------------------------------

    fn lock(&self) -> MutexGuard<'_, HashMap<String, TokenBucket>> {
        // Critical sections never panic half-way through an update, so the
        // map is consistent even if a holder died.
        self.buckets.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn capacity_f64(&self) -> f64 {
        f64::from(self.config.capacity)
    }

    /// Run `f` on the freshly refilled bucket for `provider`, creating the
    /// bucket at full capacity if this is the first reference.
    fn with_bucket<R>(&self, provider: &str, f: impl FnOnce(&mut TokenBucket) -> R) -> R {
        let capacity = self.capacity_f64();
        let mut buckets = self.lock();
        let now = Instant::now();
        if let Some(bucket) = buckets.get_mut(provider) {
            bucket.refill(capacity, now);
            return f(bucket);
        }
        let bucket = buckets
            .entry(provider.to_string())
            .or_insert_with(|| TokenBucket::full(self.rate_for(provider), capacity, now));
        f(bucket)
    }

    fn attempt(&self, provider: &str, started: Instant, timeout: Option<Duration>) -> Attempt {
        let taken = self.with_bucket(provider, |bucket| {
            bucket.try_take().then_some(bucket.tokens)
        });
        if let Some(remaining) = taken {
            return Attempt::Granted { remaining };
        }

        match timeout {
            None => Attempt::Wait(POLL_INTERVAL),
            Some(limit) => {
                let waited = started.elapsed();
                if waited >= limit {
                    Attempt::TimedOut
                } else {
                    Attempt::Wait(POLL_INTERVAL.min(limit - waited))
                }
            }
        }
    }

    fn log_granted(provider: &str, started: Instant, remaining: f64) {
        tracing::info!(
            provider,
            waited_ms = started.elapsed().as_secs_f64() * 1000.0,
            remaining = %format!("{remaining:.1}"),
            "acquired token"
        );
    }

    fn log_timed_out(provider: &str, started: Instant, timeout: Option<Duration>) {
        tracing::warn!(
            provider,
            timeout_ms = timeout.unwrap_or_default().as_secs_f64() * 1000.0,
            waited_ms = started.elapsed().as_secs_f64() * 1000.0,
            "timed out waiting for token"
        );
    }

    // -- acquisition --------------------------------------------------------

    /// Block the current thread until a token for `provider` is granted or
    /// `timeout` elapses. `None` waits indefinitely.
    ///
    /// Returns `false` on timeout; a timed-out call never consumes a token.
    pub fn acquire(&self, provider: &str, timeout: Option<Duration>) -> bool {
        let started = Instant::now();
        tracing::debug!(provider, "attempting to acquire token");
        loop {
            match self.attempt(provider, started, timeout) {
                Attempt::Granted { remaining } => {
                    Self::log_granted(provider, started, remaining);
                    return true;
                }
                Attempt::TimedOut => {
                    Self::log_timed_out(provider, started, timeout);
                    return false;
                }
                Attempt::Wait(pause) => std::thread::sleep(pause),
            }
        }
    }

    /// Async flavour of [`acquire`](Self::acquire): sleeps on the tokio
    /// timer instead of blocking the worker thread.
    pub async fn acquire_async(&self, provider: &str, timeout: Option<Duration>) -> bool {
        let started = Instant::now();
        tracing::debug!(provider, "attempting to acquire token");
        loop {
            match self.attempt(provider, started, timeout) {
                Attempt::Granted { remaining } => {
                    Self::log_granted(provider, started, remaining);
                    return true;
                }
                Attempt::TimedOut => {
                    Self::log_timed_out(provider, started, timeout);
                    return false;
                }
                Attempt::Wait(pause) => tokio::time::sleep(pause).await,
            }
        }
    }

    /// Single non-waiting attempt.
    pub fn try_acquire(&self, provider: &str) -> bool {
        let started = Instant::now();
        match self.attempt(provider, started, Some(Duration::ZERO)) {
            Attempt::Granted { remaining } => {
                Self::log_granted(provider, started, remaining);
                true
            }
            Attempt::Wait(_) | Attempt::TimedOut => false,
        }
    }

    // -- scoped acquisition -------------------------------------------------

    /// Acquire a token and hand back a permit for the guarded block.
    ///
    /// ```no_run
    /// # use api_throttle::throttle::ApiThrottler;
    /// # use std::time::Duration;
    /// let throttler = ApiThrottler::with_defaults();
    /// let _permit = throttler.throttle("yfinance", Some(Duration::from_secs(5)))?;
    /// // call the market-data API here
    /// # Ok::<(), api_throttle::error::ThrottleError>(())
    /// ```
    pub fn throttle(
        &self,
        provider: &str,
        timeout: Option<Duration>,
    ) -> Result<ThrottlePermit, ThrottleError> {
        let started = Instant::now();
        if self.acquire(provider, timeout) {
            Ok(ThrottlePermit::new(provider, started.elapsed()))
        } else {
            Err(timeout_error(provider, timeout))
        }
    }

    pub async fn throttle_async(
        &self,
        provider: &str,
        timeout: Option<Duration>,
    ) -> Result<ThrottlePermit, ThrottleError> {
        let started = Instant::now();
        if self.acquire_async(provider, timeout).await {
            Ok(ThrottlePermit::new(provider, started.elapsed()))
        } else {
            Err(timeout_error(provider, timeout))
        }
    }

    /// Run `work` only if a token was granted.
    pub fn throttled<T>(
        &self,
        provider: &str,
        timeout: Option<Duration>,
        work: impl FnOnce() -> T,
    ) -> Result<T, ThrottleError> {
        let _permit = self.throttle(provider, timeout)?;
        Ok(work())
    }

    /// Await `work` only if a token was granted. The future is not polled
    /// at all on timeout.
    pub async fn throttled_async<F>(
        &self,
        provider: &str,
        timeout: Option<Duration>,
        work: F,
    ) -> Result<F::Output, ThrottleError>
    where
        F: Future,
    {
        let _permit = self.throttle_async(provider, timeout).await?;
        Ok(work.await)
    }

    // -- inspection ---------------------------------------------------------

    /// Refill and report the token count for `provider` without consuming.
    pub fn available_tokens(&self, provider: &str) -> f64 {
        self.with_bucket(provider, |bucket| bucket.tokens)
    }

    /// Report `provider` without creating a bucket for it.
    ///
    /// A provider with a bucket is refilled and reported as is. A provider
    /// named in the rate table but not used yet is reported as the full
    /// bucket it would start with. Any other name yields `None`.
    pub fn peek(&self, provider: &str) -> Option<BucketSnapshot> {
        let capacity = self.capacity_f64();
        let mut buckets = self.lock();
        let tokens = match buckets.get_mut(provider) {
            Some(bucket) => {
                bucket.refill(capacity, Instant::now());
                bucket.tokens
            }
            None if self.config.rate_limits.contains_key(provider) => capacity,
            None => return None,
        };
        Some(BucketSnapshot {
            provider: provider.to_string(),
            rate_per_sec: self.rate_for(provider),
            tokens,
            capacity: self.config.capacity,
        })
    }

    /// Refill every known bucket and report them, sorted by provider.
    pub fn snapshot(&self) -> Vec<BucketSnapshot> {
        let capacity = self.capacity_f64();
        let mut buckets = self.lock();
        let now = Instant::now();
        let mut out: Vec<BucketSnapshot> = buckets
            .iter_mut()
            .map(|(provider, bucket)| {
                bucket.refill(capacity, now);
                BucketSnapshot {
                    provider: provider.clone(),
                    rate_per_sec: bucket.rate,
                    tokens: bucket.tokens,
                    capacity: self.config.capacity,
                }
            })
            .collect();
        out.sort_by(|a, b| a.provider.cmp(&b.provider));
        out
    }

    /// Refill `provider` (or, with `None`, every known bucket and every
    /// configured provider) to full capacity. Meant for tests.
    pub fn reset(&self, provider: Option<&str>) {
        let capacity = self.capacity_f64();
        let mut buckets = self.lock();
        let now = Instant::now();

        let mut names: Vec<String> = match provider {
            Some(name) => vec![name.to_string()],
            None => buckets.keys().cloned().collect(),
        };
        if provider.is_none() {
            names.extend(self.config.rate_limits.keys().cloned());
        }

        for name in names {
            let rate = self.rate_for(&name);
            buckets
                .entry(name)
                .and_modify(|bucket| bucket.reset(capacity, now))
                .or_insert_with(|| TokenBucket::full(rate, capacity, now));
        }

        match provider {
            Some(name) => tracing::info!(provider = name, "reset tokens"),
            None => tracing::info!("reset tokens for all providers"),
        }
    }
}

impl Default for ApiThrottler {
    fn default() -> Self {
        Self::with_defaults()
    }
}

impl fmt::Debug for ApiThrottler {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ApiThrottler")
            .field("capacity", &self.config.capacity)
            .field("providers", &self.providers())
            .finish()
    }
}

fn timeout_error(provider: &str, timeout: Option<Duration>) -> ThrottleError {
    ThrottleError::Timeout {
        provider: provider.to_string(),
        timeout: timeout.unwrap_or_default(),
    }
}

// ---------------------------------------------------------------------------
// ThrottlePermit
// ---------------------------------------------------------------------------

/// Proof that a token was granted. Holding it is the guarded block; there
/// is nothing to give back when it drops.
#[derive(Debug)]
#[must_use = "the permit marks the start of the throttled call"]
pub struct ThrottlePermit {
    provider: String,
    waited: Duration,
}

impl ThrottlePermit {
    fn new(provider: &str, waited: Duration) -> Self {
        Self {
            provider: provider.to_string(),
            waited,
        }
    }

    pub fn provider(&self) -> &str {
        &self.provider
    }

    /// Time spent waiting for the token.
    pub fn waited(&self) -> Duration {
        self.waited
    }
}

impl Drop for ThrottlePermit {
    fn drop(&mut self) {
        tracing::debug!(provider = %self.provider, "leaving throttled block");
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;
    use std::sync::Arc;
    use std::thread;

    fn throttler(provider: &str, rate: f64, capacity: u32) -> ApiThrottler {
        ApiThrottler::new(
            ThrottleConfig::default()
                .with_rate(provider, rate)
                .with_capacity(capacity),
        )
        .unwrap()
    }

    fn drain(t: &ApiThrottler, provider: &str) {
        for _ in 0..t.capacity() {
            assert!(t.try_acquire(provider));
        }
    }

    #[test]
    fn rejects_bad_config() {
        assert!(ApiThrottler::new(ThrottleConfig::default().with_capacity(0)).is_err());
        assert!(ApiThrottler::new(ThrottleConfig::default().with_rate("x", 0.0)).is_err());
    }

    #[test]
    fn new_bucket_starts_full() {
        let t = ApiThrottler::with_defaults();
        assert_eq!(t.available_tokens("yfinance"), 10.0);
    }

    #[test]
    fn burst_up_to_capacity_then_empty() {
        let t = throttler("burst", 0.1, 10);
        for i in 0..10 {
            assert!(t.try_acquire("burst"), "burst request {i} failed");
        }
        assert!(!t.try_acquire("burst"));
    }

    #[test]
    fn zero_timeout_on_empty_bucket_fails_fast_without_consuming() {
        let t = throttler("p", 0.5, 3);
        drain(&t, "p");
        let before = t.available_tokens("p");

        let started = Instant::now();
        assert!(!t.acquire("p", Some(Duration::ZERO)));
        assert!(started.elapsed() < Duration::from_millis(50));

        let after = t.available_tokens("p");
        assert!(after >= before, "timeout consumed a token: {before} -> {after}");
    }

    #[test]
    fn zero_timeout_on_full_bucket_still_grants() {
        let t = ApiThrottler::with_defaults();
        assert!(t.acquire("openai", Some(Duration::ZERO)));
    }

    #[test]
    fn timeout_is_respected() {
        let t = throttler("slow", 0.1, 1);
        drain(&t, "slow");
        let started = Instant::now();
        assert!(!t.acquire("slow", Some(Duration::from_millis(50))));
        let waited = started.elapsed();
        assert!(waited >= Duration::from_millis(50));
        assert!(waited < Duration::from_millis(500));
    }

    #[test]
    fn waits_for_refill() {
        let t = throttler("fast", 50.0, 2);
        drain(&t, "fast");
        let started = Instant::now();
        assert!(t.acquire("fast", None));
        let waited = started.elapsed();
        // one token at 50/s is 20ms
        assert!(waited >= Duration::from_millis(10), "waited {waited:?}");
        assert!(waited < Duration::from_millis(500), "waited {waited:?}");
    }

    #[test]
    fn unknown_provider_uses_default_rate() {
        let t = ApiThrottler::with_defaults();
        assert_eq!(t.rate_for("never-seen-before"), 1.0);
        assert_eq!(t.rate_for("yfinance"), 2.0);
        assert_eq!(t.rate_for("openai"), 10.0);
        assert!(t.acquire("never-seen-before", None));
        assert!(t.available_tokens("never-seen-before") <= 9.01);
    }

    #[test]
    fn providers_are_independent() {
        let t = throttler("a", 0.1, 2);
        drain(&t, "a");
        assert!(!t.try_acquire("a"));
        assert!(t.try_acquire("b"));
    }

    #[test]
    fn refill_is_capped_at_capacity() {
        let t = throttler("cap", 1000.0, 3);
        assert!(t.try_acquire("cap"));
        thread::sleep(Duration::from_millis(20));
        assert_eq!(t.available_tokens("cap"), 3.0);
    }

    #[test]
    fn reset_single_provider() {
        let t = throttler("r", 0.1, 4);
        drain(&t, "r");
        drain(&t, "other");
        t.reset(Some("r"));
        assert_eq!(t.available_tokens("r"), 4.0);
        assert!(t.available_tokens("other") < 1.0);
    }

    #[test]
    fn reset_all_covers_seen_and_configured() {
        let t = throttler("r", 0.1, 4);
        drain(&t, "r");
        drain(&t, "adhoc");
        t.reset(None);
        assert_eq!(t.available_tokens("r"), 4.0);
        assert_eq!(t.available_tokens("adhoc"), 4.0);
        let providers = t.providers();
        assert!(providers.contains(&"yfinance".to_string()));
        assert!(providers.contains(&"openai".to_string()));
    }

    #[test]
    fn throttle_returns_permit_or_timeout_error() {
        let t = throttler("g", 0.1, 1);
        let permit = t.throttle("g", None).unwrap();
        assert_eq!(permit.provider(), "g");
        drop(permit);

        let err = t.throttle("g", Some(Duration::from_millis(5))).unwrap_err();
        assert_eq!(
            err,
            ThrottleError::Timeout {
                provider: "g".to_string(),
                timeout: Duration::from_millis(5),
            }
        );
    }

    #[test]
    fn throttled_skips_work_on_timeout() {
        let t = throttler("g", 0.1, 1);
        assert_eq!(t.throttled("g", None, || 42).unwrap(), 42);

        let mut ran = false;
        let res = t.throttled("g", Some(Duration::ZERO), || ran = true);
        assert!(res.is_err());
        assert!(!ran);
    }

    #[tokio::test]
    async fn throttled_async_does_not_poll_future_on_timeout() {
        let t = throttler("g", 0.1, 1);
        let value = t.throttled_async("g", None, async { "ok" }).await.unwrap();
        assert_eq!(value, "ok");

        let polled = std::sync::atomic::AtomicBool::new(false);
        let res = t
            .throttled_async("g", Some(Duration::from_millis(5)), async {
                polled.store(true, std::sync::atomic::Ordering::SeqCst);
            })
            .await;
        assert!(matches!(res, Err(ThrottleError::Timeout { .. })));
        assert!(!polled.load(std::sync::atomic::Ordering::SeqCst));
    }

    #[tokio::test]
    async fn acquire_async_waits_for_refill() {
        let t = throttler("fast", 50.0, 1);
        drain(&t, "fast");
        assert!(t.acquire_async("fast", Some(Duration::from_secs(1))).await);
    }

    #[test]
    fn concurrent_burst_grants_exactly_capacity() {
        let t = Arc::new(throttler("x", 0.01, 10));
        let granted: usize = thread::scope(|s| {
            let handles: Vec<_> = (0..25)
                .map(|_| {
                    let t = Arc::clone(&t);
                    s.spawn(move || t.try_acquire("x") as usize)
                })
                .collect();
            handles.into_iter().map(|h| h.join().unwrap()).sum()
        });
        assert_eq!(granted, 10);
    }

    #[test]
    fn snapshot_lists_buckets_sorted() {
        let t = ApiThrottler::with_defaults();
        t.try_acquire("openai");
        t.try_acquire("yfinance");
        let snap = t.snapshot();
        let names: Vec<&str> = snap.iter().map(|s| s.provider.as_str()).collect();
        assert_eq!(names, vec!["openai", "yfinance"]);
        assert_eq!(snap[1].rate_per_sec, 2.0);
        assert_eq!(snap[1].capacity, 10);
        assert!(snap[1].tokens < 10.0);
    }

    #[test]
    fn peek_never_creates_buckets() {
        let t = throttler("p", 0.1, 5);
        assert!(t.peek("unknown").is_none());
        assert!(t.providers().is_empty());

        let configured = t.peek("yfinance").unwrap();
        assert_eq!(configured.tokens, 5.0);
        assert_eq!(configured.rate_per_sec, 2.0);
        assert!(t.providers().is_empty());

        assert!(t.try_acquire("p"));
        let seen = t.peek("p").unwrap();
        assert!(seen.tokens < 5.0);
        assert_eq!(seen.rate_per_sec, 0.1);
        assert_eq!(t.providers(), vec!["p".to_string()]);
    }

    struct CaptureWriter(Arc<Mutex<Vec<u8>>>);

    impl std::io::Write for CaptureWriter {
        fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
            self.0.lock().unwrap().extend_from_slice(buf);
            Ok(buf.len())
        }

        fn flush(&mut self) -> std::io::Result<()> {
            Ok(())
        }
    }

    fn captured_logs(f: impl FnOnce()) -> String {
        let buf = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&buf);
        let subscriber = tracing_subscriber::fmt()
            .with_ansi(false)
            .with_writer(move || CaptureWriter(Arc::clone(&sink)))
            .finish();
        tracing::subscriber::with_default(subscriber, f);
        let bytes = buf.lock().unwrap().clone();
        String::from_utf8(bytes).unwrap()
    }

    #[test]
    fn with_defaults_logs_construction() {
        let logs = captured_logs(|| {
            let t = ApiThrottler::with_defaults();
            assert_eq!(t.config(), &ThrottleConfig::default());
        });
        assert!(logs.contains("initialized api throttler"), "logs: {logs}");
        assert!(logs.contains("capacity=10"), "logs: {logs}");
    }

    #[derive(Debug, Clone)]
    enum Op {
        Acquire,
        Available,
        Sleep(u64),
        Reset,
    }

    fn op() -> impl Strategy<Value = Op> {
        prop_oneof![
            4 => Just(Op::Acquire),
            2 => Just(Op::Available),
            1 => (0u64..3).prop_map(Op::Sleep),
            1 => Just(Op::Reset),
        ]
    }

    proptest! {
        #![proptest_config(ProptestConfig::with_cases(32))]

        #[test]
        fn tokens_stay_within_bounds(
            capacity in 1u32..8,
            rate in 1.0f64..500.0,
            ops in prop::collection::vec(op(), 1..60),
        ) {
            let t = throttler("p", rate, capacity);
            for op in ops {
                match op {
                    Op::Acquire => { t.try_acquire("p"); }
                    Op::Available => {}
                    Op::Sleep(ms) => thread::sleep(Duration::from_millis(ms)),
                    Op::Reset => t.reset(Some("p")),
                }
                let tokens = t.available_tokens("p");
                prop_assert!(tokens >= 0.0, "negative tokens {}", tokens);
                prop_assert!(tokens <= f64::from(capacity), "overfull {}", tokens);
            }
        }
    }
}
