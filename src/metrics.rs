use std::sync::atomic::{AtomicU64, Ordering};

/// Additive operation counters for one database instance.
#[derive(Debug, Default)]
pub struct Metrics {
    puts: AtomicU64,
    dels: AtomicU64,
    gets: AtomicU64,
    syncs: AtomicU64,
}

impl Metrics {
    pub fn puts(&self) -> u64 {
        self.puts.load(Ordering::Relaxed)
    }

    pub fn dels(&self) -> u64 {
        self.dels.load(Ordering::Relaxed)
    }

    pub fn gets(&self) -> u64 {
        self.gets.load(Ordering::Relaxed)
    }

    pub fn syncs(&self) -> u64 {
        self.syncs.load(Ordering::Relaxed)
    }

    pub(crate) fn add_puts(&self, n: u64) {
        self.puts.fetch_add(n, Ordering::Relaxed);
    }

    pub(crate) fn add_dels(&self, n: u64) {
        self.dels.fetch_add(n, Ordering::Relaxed);
    }

    pub(crate) fn add_gets(&self, n: u64) {
        self.gets.fetch_add(n, Ordering::Relaxed);
    }

    pub(crate) fn add_syncs(&self, n: u64) {
        self.syncs.fetch_add(n, Ordering::Relaxed);
    }

    /// Emit the current counters as a structured log event.
    pub fn log(&self) {
        tracing::info!(
            puts = self.puts(),
            dels = self.dels(),
            gets = self.gets(),
            syncs = self.syncs(),
            "db metrics"
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_counters_accumulate() {
        let metrics = Metrics::default();
        metrics.add_puts(3);
        metrics.add_puts(2);
        metrics.add_dels(1);
        metrics.add_gets(7);
        metrics.add_syncs(1);

        assert_eq!(metrics.puts(), 5);
        assert_eq!(metrics.dels(), 1);
        assert_eq!(metrics.gets(), 7);
        assert_eq!(metrics.syncs(), 1);
    }
}
