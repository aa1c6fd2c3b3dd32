// Counters describing discovery activity
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;
use serde::Serialize;

use crate::util::ExponentiallyWeightedMovingAverage;

const ROUND_TRIP_ALPHA: f64 = 0.3;

#[derive(Debug)]
pub struct PingStats {
    rounds_started: AtomicU64,
    rounds_finished: AtomicU64,
    probes_sent: AtomicU64,
    probes_failed: AtomicU64,
    probes_rejected: AtomicU64,
    inbound_pings: AtomicU64,
    inbound_rejected: AtomicU64,
    round_trip_ms: ExponentiallyWeightedMovingAverage,
}

/// Point-in-time copy of `PingStats`
#[derive(Debug, Clone, Serialize)]
pub struct PingStatsSnapshot {
    pub rounds_started: u64,
    pub rounds_finished: u64,
    pub probes_sent: u64,
    pub probes_failed: u64,
    pub probes_rejected: u64,
    pub inbound_pings: u64,
    pub inbound_rejected: u64,
    pub average_round_trip_ms: f64,
}

impl PingStats {
    pub fn new() -> Self {
        Self {
            rounds_started: AtomicU64::new(0),
            rounds_finished: AtomicU64::new(0),
            probes_sent: AtomicU64::new(0),
            probes_failed: AtomicU64::new(0),
            probes_rejected: AtomicU64::new(0),
            inbound_pings: AtomicU64::new(0),
            inbound_rejected: AtomicU64::new(0),
            round_trip_ms: ExponentiallyWeightedMovingAverage::new(ROUND_TRIP_ALPHA, 0.0),
        }
    }

    pub fn record_round_started(&self) {
        self.rounds_started.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_round_finished(&self) {
        self.rounds_finished.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_probe_reply(&self, round_trip: Duration) {
        self.probes_sent.fetch_add(1, Ordering::Relaxed);
        self.round_trip_ms.add_value(round_trip.as_secs_f64() * 1000.0);
    }

    pub fn record_probe_failed(&self) {
        self.probes_sent.fetch_add(1, Ordering::Relaxed);
        self.probes_failed.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_probe_rejected(&self) {
        self.probes_rejected.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_inbound(&self, accepted: bool) {
        self.inbound_pings.fetch_add(1, Ordering::Relaxed);
        if !accepted {
            self.inbound_rejected.fetch_add(1, Ordering::Relaxed);
        }
    }

    pub fn snapshot(&self) -> PingStatsSnapshot {
        PingStatsSnapshot {
            rounds_started: self.rounds_started.load(Ordering::Relaxed),
            rounds_finished: self.rounds_finished.load(Ordering::Relaxed),
            probes_sent: self.probes_sent.load(Ordering::Relaxed),
            probes_failed: self.probes_failed.load(Ordering::Relaxed),
            probes_rejected: self.probes_rejected.load(Ordering::Relaxed),
            inbound_pings: self.inbound_pings.load(Ordering::Relaxed),
            inbound_rejected: self.inbound_rejected.load(Ordering::Relaxed),
            average_round_trip_ms: self.round_trip_ms.average(),
        }
    }
}

impl Default for PingStats {
    fn default() -> Self {
        Self::new()
    }
}
