//! Bucket registry and idle-bucket eviction.

use std::collections::HashMap;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use tracing::{debug, info, trace};

use crate::config::RateLimitSettings;

use super::bucket::TokenBucket;
use super::clock::{Clock, SystemClock};

/// Idle time before a bucket holding at least half its cap is evicted.
const IDLE_EXPIRATION: Duration = Duration::from_secs(60);
/// Idle time before a depleted bucket (below half its cap) is evicted.
const DEPLETED_IDLE_EXPIRATION: Duration = Duration::from_secs(120);

/// Process-wide registry of per-client token buckets.
///
/// The registry is the sole creation path for buckets: callers resolve a
/// bucket by opaque identifier and get the shared instance back. One coarse
/// lock guards the map structure (insert, remove, iterate); each bucket
/// carries its own lock for state changes. The admission path never holds
/// both at once: the map lock is released before the bucket lock is taken.
///
/// Construct one registry at startup and share it via `Arc`; separate
/// registries are fully isolated, which unit tests rely on.
pub struct BucketRegistry<C: Clock = SystemClock> {
    /// Buckets indexed by client identifier.
    buckets: Mutex<HashMap<String, Arc<TokenBucket>>>,
    /// Parameters for newly created buckets.
    settings: RateLimitSettings,
    /// Time source for refill and idleness arithmetic.
    clock: C,
}

impl BucketRegistry {
    /// Create a registry using the system clock.
    pub fn new(settings: RateLimitSettings) -> Self {
        Self::with_clock(settings, SystemClock)
    }
}

impl<C: Clock> BucketRegistry<C> {
    /// Create a registry with a custom time source.
    pub fn with_clock(settings: RateLimitSettings, clock: C) -> Self {
        Self {
            buckets: Mutex::new(HashMap::new()),
            settings,
            clock,
        }
    }

    /// Resolve the bucket for `identifier`, creating it on first sight.
    ///
    /// Never fails; returns the same shared instance for an identifier until
    /// eviction removes it. Identifiers are opaque and never normalized, so
    /// two spellings of the same logical client are two clients.
    pub fn get_or_create(&self, identifier: &str) -> Arc<TokenBucket> {
        let mut buckets = self.buckets.lock();

        if let Some(bucket) = buckets.get(identifier) {
            return Arc::clone(bucket);
        }

        debug!(
            identifier = %identifier,
            burst = self.settings.burst,
            max_tokens = self.settings.max_tokens,
            refill_rate_secs = self.settings.refill_rate_secs,
            "Creating new token bucket"
        );
        let bucket = Arc::new(TokenBucket::new(
            self.settings.burst,
            self.settings.max_tokens,
            self.settings.refill_rate(),
            self.clock.now(),
        ));
        buckets.insert(identifier.to_string(), Arc::clone(&bucket));
        bucket
    }

    /// Admission check for `identifier`: resolve its bucket and consume one
    /// token if available.
    ///
    /// Returns `true` when the request should be forwarded, `false` when the
    /// client is out of quota.
    pub fn check_rate_limit(&self, identifier: &str) -> bool {
        trace!(identifier = %identifier, "Checking rate limit");

        let bucket = self.get_or_create(identifier);
        let allowed = bucket.is_request_allowed(self.clock.now());

        if !allowed {
            debug!(identifier = %identifier, "Rate limit exceeded");
        }
        allowed
    }

    /// One eviction pass over the registry.
    ///
    /// A bucket that has been idle longer than its expiration threshold is
    /// removed. Depleted buckets (below half their cap) get a 2 minute
    /// threshold instead of 1 minute: a recently hammered client's penalty
    /// state survives short quiet gaps, while a nearly full bucket costs
    /// nothing to recreate. A bucket that never admitted a request is
    /// removed at the first scan.
    ///
    /// The scan reads each bucket through a non-blocking snapshot: a bucket
    /// whose lock is held is mid-admission and is skipped until the next
    /// tick. The snapshot may be one check stale, which at worst evicts or
    /// keeps a borderline bucket one tick later than ideal; an evicted
    /// identifier simply restarts at the initial burst on its next request.
    pub fn scan_and_evict(&self) {
        let now = self.clock.now();
        let mut buckets = self.buckets.lock();
        let before = buckets.len();

        buckets.retain(|identifier, bucket| {
            let Some(snapshot) = bucket.try_snapshot() else {
                return true;
            };

            let threshold = if snapshot.tokens < bucket.max_tokens() / 2 {
                DEPLETED_IDLE_EXPIRATION
            } else {
                IDLE_EXPIRATION
            };
            let expired = match snapshot.last_used {
                Some(last_used) => now.saturating_duration_since(last_used) > threshold,
                None => true,
            };

            if expired {
                debug!(
                    identifier = %identifier,
                    tokens = snapshot.tokens,
                    "Evicting idle bucket"
                );
            }
            !expired
        });

        let evicted = before - buckets.len();
        if evicted > 0 {
            debug!(evicted, remaining = buckets.len(), "Eviction scan complete");
        }
    }

    /// Run eviction scans every `interval` until `shutdown` resolves.
    ///
    /// Intended to be spawned once at startup and live for the process
    /// lifetime; the shutdown future lets the composition root (and tests)
    /// stop it cleanly.
    pub async fn run_eviction_loop<F>(self: Arc<Self>, interval: Duration, shutdown: F)
    where
        F: Future<Output = ()> + Send,
    {
        info!(
            interval_secs = interval.as_secs(),
            "Starting bucket eviction loop"
        );

        let mut ticker = tokio::time::interval(interval);
        tokio::pin!(shutdown);

        loop {
            tokio::select! {
                _ = ticker.tick() => self.scan_and_evict(),
                _ = &mut shutdown => {
                    info!("Eviction loop received shutdown signal, exiting");
                    return;
                }
            }
        }
    }

    /// Number of live buckets.
    pub fn bucket_count(&self) -> usize {
        self.buckets.lock().len()
    }

    /// Whether a bucket currently exists for `identifier`.
    pub fn contains(&self, identifier: &str) -> bool {
        self.buckets.lock().contains_key(identifier)
    }

    /// Current token count for `identifier`, if its bucket exists.
    ///
    /// This is primarily useful for testing.
    pub fn tokens(&self, identifier: &str) -> Option<u64> {
        let bucket = self.buckets.lock().get(identifier).map(Arc::clone);
        bucket.map(|bucket| bucket.tokens())
    }

    /// Remove all buckets.
    ///
    /// This is primarily useful for testing.
    pub fn clear(&self) {
        self.buckets.lock().clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ratelimit::ManualClock;

    const CLIENT_A: &str = "192.0.2.10:41234";
    const CLIENT_B: &str = "198.51.100.23:55678";

    fn test_settings() -> RateLimitSettings {
        RateLimitSettings {
            burst: 10,
            max_tokens: 5,
            refill_rate_secs: 30,
            cleanup_interval_secs: 300,
        }
    }

    fn test_registry() -> (BucketRegistry<ManualClock>, ManualClock) {
        let clock = ManualClock::new();
        let registry = BucketRegistry::with_clock(test_settings(), clock.clone());
        (registry, clock)
    }

    /// Drain every token, ending with a denied request.
    fn exhaust(registry: &BucketRegistry<ManualClock>, identifier: &str) {
        while registry.check_rate_limit(identifier) {}
    }

    #[test]
    fn test_get_or_create_returns_shared_instance() {
        let (registry, _clock) = test_registry();

        let first = registry.get_or_create(CLIENT_A);
        let second = registry.get_or_create(CLIENT_A);

        assert!(Arc::ptr_eq(&first, &second));
        assert_eq!(registry.bucket_count(), 1);
    }

    #[test]
    fn test_check_creates_bucket_on_first_sight() {
        let (registry, _clock) = test_registry();
        assert_eq!(registry.bucket_count(), 0);

        assert!(registry.check_rate_limit(CLIENT_A));
        assert_eq!(registry.bucket_count(), 1);
        assert_eq!(registry.tokens(CLIENT_A), Some(9));
    }

    #[test]
    fn test_burst_then_denial() {
        let (registry, _clock) = test_registry();

        for _ in 0..10 {
            assert!(registry.check_rate_limit(CLIENT_A));
        }
        assert!(!registry.check_rate_limit(CLIENT_A));
    }

    #[test]
    fn test_identifiers_are_metered_independently() {
        let (registry, _clock) = test_registry();

        exhaust(&registry, CLIENT_A);
        assert!(!registry.check_rate_limit(CLIENT_A));
        assert!(registry.check_rate_limit(CLIENT_B));
    }

    #[test]
    fn test_identifiers_are_opaque_strings() {
        let (registry, _clock) = test_registry();

        // Same host, different port spelling: two distinct clients.
        assert!(registry.check_rate_limit("192.0.2.10:41234"));
        assert!(registry.check_rate_limit("192.0.2.10:41235"));
        assert_eq!(registry.bucket_count(), 2);
    }

    #[test]
    fn test_eviction_removes_idle_full_bucket_after_one_minute() {
        let (registry, clock) = test_registry();

        assert!(registry.check_rate_limit(CLIENT_A));
        clock.advance(Duration::from_secs(61));

        registry.scan_and_evict();
        assert!(!registry.contains(CLIENT_A));
    }

    #[test]
    fn test_eviction_keeps_depleted_bucket_for_two_minutes() {
        let (registry, clock) = test_registry();

        exhaust(&registry, CLIENT_A);

        // Depleted (0 < 5/2): retained through the one-minute threshold.
        clock.advance(Duration::from_secs(90));
        registry.scan_and_evict();
        assert!(registry.contains(CLIENT_A));

        // Past two minutes of idleness it goes too.
        clock.advance(Duration::from_secs(31));
        registry.scan_and_evict();
        assert!(!registry.contains(CLIENT_A));
    }

    #[test]
    fn test_eviction_at_exact_threshold_retains() {
        let (registry, clock) = test_registry();

        assert!(registry.check_rate_limit(CLIENT_A));
        clock.advance(Duration::from_secs(60));

        registry.scan_and_evict();
        assert!(registry.contains(CLIENT_A));
    }

    #[test]
    fn test_never_used_bucket_is_evicted_at_first_scan() {
        let (registry, _clock) = test_registry();

        registry.get_or_create(CLIENT_A);
        assert_eq!(registry.bucket_count(), 1);

        registry.scan_and_evict();
        assert_eq!(registry.bucket_count(), 0);
    }

    #[test]
    fn test_evicted_identifier_reseeds_at_full_burst() {
        let (registry, clock) = test_registry();

        exhaust(&registry, CLIENT_A);
        clock.advance(Duration::from_secs(121));
        registry.scan_and_evict();
        assert!(!registry.contains(CLIENT_A));

        // A fresh bucket starts back at the burst; a surviving one would
        // have refilled to the cap at most.
        assert!(registry.check_rate_limit(CLIENT_A));
        assert_eq!(registry.tokens(CLIENT_A), Some(9));
    }

    #[test]
    fn test_concurrent_checks_admit_exactly_the_burst() {
        let (registry, _clock) = test_registry();
        let registry = Arc::new(registry);

        let handles: Vec<_> = (0..25)
            .map(|_| {
                let registry = Arc::clone(&registry);
                std::thread::spawn(move || registry.check_rate_limit(CLIENT_A))
            })
            .collect();

        let allowed = handles
            .into_iter()
            .map(|handle| handle.join().unwrap())
            .filter(|&allowed| allowed)
            .count();

        assert_eq!(allowed, 10);
    }

    #[test]
    fn test_clear_removes_all_buckets() {
        let (registry, _clock) = test_registry();

        registry.check_rate_limit(CLIENT_A);
        registry.check_rate_limit(CLIENT_B);
        assert_eq!(registry.bucket_count(), 2);

        registry.clear();
        assert_eq!(registry.bucket_count(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_eviction_loop_scans_and_stops_on_shutdown() {
        let (registry, clock) = test_registry();
        let registry = Arc::new(registry);

        assert!(registry.check_rate_limit(CLIENT_A));
        clock.advance(Duration::from_secs(600));

        let (stop_tx, stop_rx) = tokio::sync::oneshot::channel::<()>();
        let handle = tokio::spawn(Arc::clone(&registry).run_eviction_loop(
            Duration::from_secs(1),
            async move {
                let _ = stop_rx.await;
            },
        ));

        // The first tick fires immediately; give the task a chance to run.
        tokio::time::sleep(Duration::from_millis(10)).await;
        assert_eq!(registry.bucket_count(), 0);

        stop_tx.send(()).unwrap();
        tokio::time::timeout(Duration::from_secs(5), handle)
            .await
            .expect("eviction loop should exit on shutdown")
            .unwrap();
    }
}
