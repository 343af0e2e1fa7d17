//! Per-strategy resolver metrics.
//!
//! Counters use atomics so concurrent resolves update them without locks;
//! [`ResolverMetrics::snapshot`] reads a consistent-enough view for
//! reporting.

use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

/// The acquisition strategies a request can take.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Strategy {
    /// In-process memoisation.
    Memo,
    /// Native package manager.
    PackageManager,
    /// OCI registry.
    Oci,
    /// Pinned HTTP origin.
    Http,
}

impl Strategy {
    /// Stable label for logs.
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Memo => "memo",
            Self::PackageManager => "package-manager",
            Self::Oci => "oci",
            Self::Http => "http",
        }
    }
}

#[derive(Debug, Default)]
struct Counters {
    hits: AtomicU64,
    misses: AtomicU64,
    elapsed_nanos: AtomicU64,
    samples: AtomicU64,
}

impl Counters {
    fn record(&self, hit: bool, elapsed: Duration) {
        if hit {
            self.hits.fetch_add(1, Ordering::Relaxed);
        } else {
            self.misses.fetch_add(1, Ordering::Relaxed);
        }
        self.elapsed_nanos
            .fetch_add(u64::try_from(elapsed.as_nanos()).unwrap_or(u64::MAX), Ordering::Relaxed);
        self.samples.fetch_add(1, Ordering::Relaxed);
    }

    fn snapshot(&self) -> StrategySnapshot {
        StrategySnapshot {
            hits: self.hits.load(Ordering::Relaxed),
            misses: self.misses.load(Ordering::Relaxed),
            elapsed: Duration::from_nanos(self.elapsed_nanos.load(Ordering::Relaxed)),
            samples: self.samples.load(Ordering::Relaxed),
        }
    }
}

/// Read-only view of one strategy's counters.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StrategySnapshot {
    /// Requests this strategy satisfied.
    pub hits: u64,
    /// Requests this strategy was tried for and failed.
    pub misses: u64,
    /// Total time spent in this strategy.
    pub elapsed: Duration,
    /// Number of attempts timed.
    pub samples: u64,
}

/// Read-only view of all strategies plus the network-call counter.
#[derive(Debug, Clone, Copy)]
pub struct MetricsSnapshot {
    /// Memoisation counters.
    pub memo: StrategySnapshot,
    /// Package-manager counters.
    pub package_manager: StrategySnapshot,
    /// OCI registry counters.
    pub oci: StrategySnapshot,
    /// HTTP origin counters.
    pub http: StrategySnapshot,
    /// Network round-trips initiated by the resolver.
    pub network_calls: u64,
}

/// Shared mutable counters for one resolver.
#[derive(Debug, Default)]
pub struct ResolverMetrics {
    memo: Counters,
    package_manager: Counters,
    oci: Counters,
    http: Counters,
    network_calls: AtomicU64,
}

impl ResolverMetrics {
    /// Record an attempt outcome for a strategy.
    pub fn record(&self, strategy: Strategy, hit: bool, elapsed: Duration) {
        self.counters(strategy).record(hit, elapsed);
    }

    /// Record one network round-trip.
    pub fn record_network_call(&self) {
        self.network_calls.fetch_add(1, Ordering::Relaxed);
    }

    /// A read-only snapshot of all counters.
    #[must_use]
    pub fn snapshot(&self) -> MetricsSnapshot {
        MetricsSnapshot {
            memo: self.memo.snapshot(),
            package_manager: self.package_manager.snapshot(),
            oci: self.oci.snapshot(),
            http: self.http.snapshot(),
            network_calls: self.network_calls.load(Ordering::Relaxed),
        }
    }

    fn counters(&self, strategy: Strategy) -> &Counters {
        match strategy {
            Strategy::Memo => &self.memo,
            Strategy::PackageManager => &self.package_manager,
            Strategy::Oci => &self.oci,
            Strategy::Http => &self.http,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_record_and_snapshot() {
        let metrics = ResolverMetrics::default();
        metrics.record(Strategy::Oci, false, Duration::from_millis(10));
        metrics.record(Strategy::Http, true, Duration::from_millis(20));
        metrics.record(Strategy::Http, true, Duration::from_millis(5));

        let snap = metrics.snapshot();
        assert_eq!(snap.oci.hits, 0);
        assert_eq!(snap.oci.misses, 1);
        assert_eq!(snap.http.hits, 2);
        assert_eq!(snap.http.samples, 2);
        assert!(snap.http.elapsed >= Duration::from_millis(25));
        assert_eq!(snap.package_manager.hits, 0);
        assert_eq!(snap.package_manager.misses, 0);
    }

    #[test]
    fn test_network_calls() {
        let metrics = ResolverMetrics::default();
        assert_eq!(metrics.snapshot().network_calls, 0);
        metrics.record_network_call();
        metrics.record_network_call();
        assert_eq!(metrics.snapshot().network_calls, 2);
    }

    #[test]
    fn test_concurrent_updates() {
        let metrics = std::sync::Arc::new(ResolverMetrics::default());
        let mut handles = Vec::new();
        for _ in 0..8 {
            let metrics = metrics.clone();
            handles.push(std::thread::spawn(move || {
                for _ in 0..100 {
                    metrics.record(Strategy::Memo, true, Duration::from_nanos(1));
                }
            }));
        }
        for handle in handles {
            handle.join().unwrap();
        }
        assert_eq!(metrics.snapshot().memo.hits, 800);
    }

    #[test]
    fn test_strategy_labels() {
        assert_eq!(Strategy::PackageManager.as_str(), "package-manager");
        assert_eq!(Strategy::Oci.as_str(), "oci");
    }
}
