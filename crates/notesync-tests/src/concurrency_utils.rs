//! Concurrency gauges for remote call fakes

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

/// Records the number of calls in flight and the peak reached
#[derive(Debug, Clone, Default)]
pub struct ConcurrencyGauge {
    current: Arc<AtomicUsize>,
    peak: Arc<AtomicUsize>,
    total: Arc<AtomicUsize>,
}

impl ConcurrencyGauge {
    /// Create a gauge with every counter at zero
    pub fn new() -> Self {
        Self::default()
    }

    /// Mark a call as started; the call ends when the guard drops
    pub fn enter(&self) -> GaugeGuard {
        let now = self.current.fetch_add(1, Ordering::SeqCst) + 1;
        self.peak.fetch_max(now, Ordering::SeqCst);
        self.total.fetch_add(1, Ordering::SeqCst);
        GaugeGuard {
            current: Arc::clone(&self.current),
        }
    }

    /// Calls currently in flight
    pub fn current(&self) -> usize {
        self.current.load(Ordering::SeqCst)
    }

    /// Highest number of calls ever in flight at once
    pub fn peak(&self) -> usize {
        self.peak.load(Ordering::SeqCst)
    }

    /// Number of calls started
    pub fn total(&self) -> usize {
        self.total.load(Ordering::SeqCst)
    }
}

/// Ends a tracked call on drop
#[derive(Debug)]
pub struct GaugeGuard {
    current: Arc<AtomicUsize>,
}

impl Drop for GaugeGuard {
    fn drop(&mut self) {
        self.current.fetch_sub(1, Ordering::SeqCst);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[test]
    fn test_gauge_tracks_nested_calls() {
        let gauge = ConcurrencyGauge::new();
        {
            let _first = gauge.enter();
            let _second = gauge.enter();
            assert_eq!(gauge.current(), 2);
        }
        let _third = gauge.enter();

        assert_eq!(gauge.current(), 1);
        assert_eq!(gauge.peak(), 2);
        assert_eq!(gauge.total(), 3);
    }

    #[tokio::test]
    async fn test_gauge_across_tasks() {
        let gauge = ConcurrencyGauge::new();
        let handles: Vec<_> = (0..4)
            .map(|_| {
                let gauge = gauge.clone();
                tokio::spawn(async move {
                    let _guard = gauge.enter();
                    tokio::time::sleep(Duration::from_millis(20)).await;
                })
            })
            .collect();
        for handle in handles {
            handle.await.expect("task panicked");
        }

        assert_eq!(gauge.current(), 0);
        assert!(gauge.peak() >= 1 && gauge.peak() <= 4);
        assert_eq!(gauge.total(), 4);
    }
}
