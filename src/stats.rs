//! Per-destination traffic accounting and the periodic report.

use dashmap::DashMap;
use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};
use tracing::info;

struct TrafficEntry {
    first_seen: u64,
    bytes_in: AtomicI64,
}

/// Live destinations, keyed by `host:port`. Tunnels insert on dial and
/// remove on exit. Two tunnels to the same destination share one entry
/// and the last one to close removes it; the counts are best-effort.
#[derive(Default)]
pub struct Registry {
    servers: DashMap<String, TrafficEntry>,
}

impl Registry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a destination with zero traffic.
    pub fn open(&self, key: &str) {
        self.servers.insert(
            key.to_string(),
            TrafficEntry {
                first_seen: unix_now(),
                bytes_in: AtomicI64::new(0),
            },
        );
    }

    /// Add received wire bytes. Re-creates the entry if a concurrent
    /// tunnel to the same destination already removed it.
    pub fn record(&self, key: &str, n: i64) {
        if let Some(entry) = self.servers.get(key) {
            entry.bytes_in.fetch_add(n, Ordering::Relaxed);
            return;
        }
        self.servers.insert(
            key.to_string(),
            TrafficEntry {
                first_seen: unix_now(),
                bytes_in: AtomicI64::new(n),
            },
        );
    }

    /// Drop a destination's entry.
    pub fn close(&self, key: &str) {
        self.servers.remove(key);
    }

    pub fn is_empty(&self) -> bool {
        self.servers.is_empty()
    }

    #[cfg(test)]
    fn bytes_in(&self, key: &str) -> Option<i64> {
        self.servers
            .get(key)
            .map(|e| e.bytes_in.load(Ordering::Relaxed))
    }

    /// One report pass. Entries can vanish between the key snapshot and
    /// the lookup; those are skipped.
    pub fn report(&self) {
        let now = unix_now();
        let keys: Vec<String> = self.servers.iter().map(|e| e.key().clone()).collect();
        info!("[REPORT] We have {} servers connected", keys.len());
        for (i, key) in keys.iter().enumerate() {
            if let Some(entry) = self.servers.get(key) {
                let bytes = entry.bytes_in.load(Ordering::Relaxed);
                let span = now.saturating_sub(entry.first_seen);
                info!(
                    "[REPORT] [{}][{}] {}: {}",
                    i,
                    format_span(span),
                    key,
                    format_bytes(bytes)
                );
            }
        }
    }
}

/// Emit a registry report every [`REPORT_INTERVAL`](crate::REPORT_INTERVAL).
pub async fn run_reporter(registry: Arc<Registry>) {
    let mut ticker = tokio::time::interval(crate::REPORT_INTERVAL);
    ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
    // The first tick fires immediately; reports start one interval in.
    ticker.tick().await;
    loop {
        ticker.tick().await;
        registry.report();
    }
}

fn unix_now() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or(0)
}

/// `G` above 1 GiB, `M` above 1 MiB, else `K`; two decimals.
pub fn format_bytes(bytes: i64) -> String {
    const GIB: f64 = 1024.0 * 1024.0 * 1024.0;
    const MIB: f64 = 1024.0 * 1024.0;
    let b = bytes as f64;
    if b > GIB {
        format!("{:.2}G", b / GIB)
    } else if b > MIB {
        format!("{:.2}M", b / MIB)
    } else {
        format!("{:.2}K", b / 1024.0)
    }
}

/// `<H>h<M>m<S>s`, omitting leading components that are still zero.
pub fn format_span(span: u64) -> String {
    let mut out = String::new();
    if span > 3600 {
        out.push_str(&format!("{}h", span / 3600));
    }
    if span > 60 {
        out.push_str(&format!("{}m", (span % 3600) / 60));
    }
    out.push_str(&format!("{}s", span % 60));
    out
}
